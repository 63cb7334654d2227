//! Tool Relay Server - Entry Point

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tool_relay::config::RelayConfig;
use tool_relay::relay::{transport, Relay};

#[derive(Parser, Debug)]
#[command(name = "tool-relay-server")]
#[command(about = "HTTP relay brokering JSON-RPC tool calls between providers and callers")]
#[command(version)]
struct Cli {
    /// Port to bind the HTTP server on
    #[arg(long, env = "TOOL_RELAY_PORT", default_value = "8765")]
    port: u16,

    /// Interface to bind
    #[arg(long, env = "TOOL_RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// SSE keep-alive interval, in milliseconds
    #[arg(long, env = "TOOL_RELAY_KEEP_ALIVE_MS", default_value = "30000")]
    keep_alive_ms: u64,

    /// Forward timeout for a caller request awaiting a provider, in milliseconds
    #[arg(long, env = "TOOL_RELAY_REQUEST_TIMEOUT_MS", default_value = "30000")]
    request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "TOOL_RELAY_JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cli.port,
        host = %cli.host,
        "Starting tool relay"
    );

    let mut config = RelayConfig::new(cli.port, cli.host.clone());
    config.keep_alive = std::time::Duration::from_millis(cli.keep_alive_ms);
    config.request_timeout = std::time::Duration::from_millis(cli.request_timeout_ms);

    let relay = Relay::new(config);
    let router = transport::create_router(relay);

    tracing::info!("HTTP server listening on http://{}:{}", cli.host, cli.port);

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port)).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("tool relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
