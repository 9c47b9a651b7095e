//! # sonar-server
//!
//! Host daemon for the sonar proximity exchange engine.
//!
//! This binary provides:
//! - The proximity engine over the simulated radio backend
//! - REST API for engine lifecycle, recent detections and peer statistics
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package sonar-server
//!
//! # With a configuration file and debug logs
//! SONAR_CONFIG=./sonar.toml SONAR_LOG_LEVEL=debug ./sonar-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use sonar_server::api::create_router;
use sonar_server::settings::ServerConfig;
use sonar_server::{logging, state::AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load_default()?;
    logging::init(config.production)?;

    info!("Starting sonar-server");

    let state = AppState::new(&config)?;
    if config.auto_start {
        state.engine().start().await?;
    }

    let app = create_router(state.clone());
    let listener = TcpListener::bind(config.bind_address).await?;
    info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    if let Err(err) = state.engine().stop().await {
        warn!(error = %err, "engine did not stop cleanly");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
