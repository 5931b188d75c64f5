use std::path::PathBuf;

use clap::Parser;

use api_key_proxy::config::load_config;
use api_key_proxy::lifecycle::{signals, Shutdown};
use api_key_proxy::net::Listener;
use api_key_proxy::observability::{logging, metrics};
use api_key_proxy::HttpServer;

#[derive(Parser, Debug)]
#[command(name = "api-key-proxy", version, about = "Proxy that keeps the upstream API key on the server")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address` (takes precedence over PORT).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability);
    tracing::info!("api-key-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        prefix = %config.upstream.path_prefix,
        upstream_http = %config.upstream.http_base,
        upstream_ws = %config.upstream.ws_base,
        credential_configured = config.credential.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let server = HttpServer::new(config)?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
