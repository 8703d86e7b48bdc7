//! Compile Router Binary
//!
//! Standalone binary for the compile router. For library usage, see
//! [`compile_router`].

use compile_router::{run_server, RouterConfig, ServiceDeps};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("compile_router=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load configuration from environment
    let config = match RouterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // The deployment injects real store clients here; until then the router
    // runs against in-memory stand-ins.
    tracing::warn!("External stores are in-memory stand-ins in this build");

    run_server(config, ServiceDeps::in_memory()).await
}
