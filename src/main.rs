//! ircserv - Main binary

use clap::Parser;
use ircserv_core::{Config, Server};
use tracing::{error, info};

/// ircserv - An IRC server implementation
#[derive(Parser)]
#[command(name = "ircserv")]
#[command(about = "An IRC server implementation in Rust")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Connection password clients must supply with PASS
    password: String,

    /// Address to bind the listener to
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level)?;

    let mut config = Config::new(cli.port, cli.password);
    config.bind_address = cli.bind;
    config.validate()?;

    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_token();

    // First termination signal requests a graceful stop
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("signal handler failed: {}", e);
            return;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });

    info!("Starting ircserv...");
    server.run().await?;

    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
