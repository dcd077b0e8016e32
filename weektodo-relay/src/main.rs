//! `WeekTodo` relay server.
//!
//! An axum server that routes sync links between peers over WebSocket
//! (`/ws`) and keeps the REST mirror (`/peer/...`) on the same port.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin weektodo-relay
//!
//! # Run on custom address
//! cargo run --bin weektodo-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! WEEKTODO_RELAY_ADDR=127.0.0.1:8080 cargo run --bin weektodo-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use weektodo_relay::config::{RelayCliArgs, RelayConfig};
use weektodo_relay::relay::{self, RelayState};

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

    tracing::info!(addr = %config.bind_addr, "starting weektodo relay server");

    let state = Arc::new(RelayState::with_config(config.max_payload_size));

    match relay::start_server_with_state(&config.bind_addr.to_string(), Arc::clone(&state)).await {
        Ok((bound_addr, mut handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            tokio::select! {
                result = &mut handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    state.close_all_connections().await;
                    handle.abort();
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
