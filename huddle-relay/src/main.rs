//! Huddle relay server: presence tracking and real-time message fan-out.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin huddle-relay
//!
//! # Run on custom address with a shorter departure grace
//! cargo run --bin huddle-relay -- --bind 127.0.0.1:8080 --departure-grace-ms 1000
//!
//! # Or via environment variable
//! HUDDLE_ADDR=127.0.0.1:8080 cargo run --bin huddle-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use huddle_relay::config::{RelayCliArgs, RelayConfig};
use huddle_relay::relay::RelayState;
use huddle_relay::server;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        grace_ms = config.departure_grace.as_millis(),
        max_payload_size = config.max_payload_size,
        "starting huddle relay"
    );

    let state = Arc::new(RelayState::with_config(&config));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    match server::start_server_with_shutdown(&config.bind_addr, state, shutdown).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
            tracing::info!("relay stopped");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
