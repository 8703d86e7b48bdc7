//! Event-bus subsystem.
//!
//! `client` owns the long-lived websocket connection to the compilation event
//! bus; `correlator` multiplexes that single connection across the many
//! concurrent requests waiting for a correlated result.

pub mod client;
pub mod config;
pub mod correlator;

pub use client::{BusCommand, EventBusClient, EventBusHandle};
pub use config::EventBusConfig;
pub use correlator::ResultCorrelator;
