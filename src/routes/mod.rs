//! HTTP route handlers for the compile router.
//!
//! - `compile`: the compile/cmake facade, both bare and environment-prefixed
//! - `health`: health check and metrics endpoints

pub mod compile;
pub mod health;

pub use compile::{cmake, cmake_env, compile, compile_env};
pub use health::{healthcheck, metrics};
