use anyhow::Context;
use clap::Parser;
use mockwire::config::ListenConfig;
use mockwire::proxy::{create_http_client, ProxyServer};
use mockwire::{Config, MockService};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mockwire")]
struct Args {
    /// Listen port for the interception proxy (overrides `listen.port`)
    #[arg(short, long)]
    port: Option<u16>,
    /// Path to the YAML config file
    #[arg(short, long, env = "MOCKWIRE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let listen = match (args.port, config.listen.clone()) {
        (Some(port), Some(listen)) => ListenConfig { port, ..listen },
        (Some(port), None) => ListenConfig {
            host: "127.0.0.1".to_string(),
            port,
        },
        (None, Some(listen)) => listen,
        (None, None) => ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
    };
    let addr: SocketAddr = format!("{}:{}", listen.host, listen.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", listen.host, listen.port))?;

    let service = Arc::new(MockService::new(config).await?);
    let server = ProxyServer::new(Arc::clone(&service), addr, create_http_client()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    service.close();
    Ok(())
}
