//! Portico CLI - run the relay server or the client agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portico_client::{Client, ClientConfig, ServiceConfig};
use portico_server::{Server, ServerConfig};

/// Portico - expose local services through a public relay
#[derive(Parser, Debug)]
#[command(name = "portico")]
#[command(about = "Portico - reverse tunnel relay")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the client agent beside your local services
    Client {
        /// JSON config file; flags below override it
        #[arg(long, env = "PORTICO_CONFIG")]
        config: Option<PathBuf>,

        /// Client id, also the default host prefix
        #[arg(long, env = "PORTICO_ID")]
        id: Option<String>,

        /// Client secret
        #[arg(long, env = "PORTICO_SECRET")]
        secret: Option<String>,

        /// Remote endpoint, tcp://host:port or tls://host:port
        #[arg(long, env = "PORTICO_REMOTE")]
        remote: Option<String>,

        /// Local endpoint to expose, e.g. http://127.0.0.1:3000
        #[arg(long)]
        local: Vec<String>,

        /// Requested public TCP port for tcp:// locals
        #[arg(long)]
        remote_tcp_port: Option<u16>,
    },
    /// Run the relay server
    Server {
        /// JSON config file; flags below override it
        #[arg(long, env = "PORTICO_CONFIG")]
        config: Option<PathBuf>,

        /// Listen address, e.g. 0.0.0.0:8080
        #[arg(long, env = "PORTICO_ADDR")]
        addr: Option<String>,

        /// Accept unknown ids, first secret seen claims the id
        #[arg(long)]
        allow_any_client: bool,
    },
}

fn load_config<T: serde::de::DeserializeOwned + Default>(path: &Option<PathBuf>) -> Result<T> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Client {
            config,
            id,
            secret,
            remote,
            local,
            remote_tcp_port,
        } => {
            let mut conf: ClientConfig = load_config(&config)?;
            if let Some(id) = id {
                conf.id = id;
            }
            if let Some(secret) = secret {
                conf.secret = secret;
            }
            if let Some(remote) = remote {
                conf.remotes = vec![remote];
            }
            for local in local {
                conf.services.push(ServiceConfig {
                    local,
                    remote_tcp_port,
                    ..Default::default()
                });
            }

            let client = Client::new(conf).context("invalid client config")?;
            client.start().context("failed to start client")?;
            client
                .wait_until_ready(Duration::from_secs(30))
                .await
                .context("no tunnel came up")?;
            info!("tunnel established");

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            client.shutdown().await;
        }
        Commands::Server {
            config,
            addr,
            allow_any_client,
        } => {
            let mut conf: ServerConfig = load_config(&config)?;
            if let Some(addr) = addr {
                conf.addr = addr;
            }
            if allow_any_client {
                conf.allow_any_client = true;
            }

            let server = Server::new(conf).context("invalid server config")?;
            server.start().await.context("failed to start server")?;

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            server.shutdown().await;
        }
    }
    Ok(())
}
