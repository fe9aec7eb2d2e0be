use envconfig::Envconfig;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use candle_ingest::config::Config;
use candle_ingest::supervisor;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {}", err);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins when set; LOG_LEVEL is the deployable knob.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match supervisor::run(config, shutdown()).await {
        Ok(()) => tracing::info!("shut down cleanly"),
        Err(err) => {
            tracing::error!(error = %err, "service terminated");
            std::process::exit(err.exit_code());
        }
    }
}
