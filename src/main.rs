use std::env;
use std::time::Duration;

use bloomgate::{app, build_state_from_env};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let state = build_state_from_env().await?;

    // Periodic nonce sweep so the in-memory ledger cannot grow without bound.
    // Entries older than the timestamp tolerance can never verify again.
    {
        let nonces = state.nonces.clone();
        let tolerance_ms = state.config.timestamp_tolerance_ms;
        let sweep = Duration::from_millis(state.config.nonce_sweep_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now().timestamp_millis() - tolerance_ms;
                nonces.purge_older_than(cutoff).await;
            }
        });
    }

    let app = app(state);

    // Determine port to bind on. Default to 8080 if unspecified.
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
