//! Sluice -- command-line client for the filtered-resource broker.
//!
//! Usage:
//!   sluice register --user-id alice --resource-id file:/data
//!   sluice stream <token>                 # JSON lines until the stream ends
//!   sluice fetch --user-id alice --resource-id file:/data --out ./data
//!   sluice config                         # print effective config

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use sluice_client::{expand_tilde, Client, ClientConfig, FetchError, FetchPool, Fetched, ResourceStream};
use sluice_flow::{Delivery, ResourceItem, Terminal};
use sluice_protocol::DataRequest;

#[derive(Parser)]
#[command(name = "sluice", about = "Filtered-resource streaming client")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.sluice/config.toml")]
    config: String,

    /// Override download.capacity
    #[arg(long)]
    capacity: Option<usize>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RequestArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    resource_id: String,
    /// Extra context entries, KEY=VALUE (repeatable)
    #[arg(long = "context", value_parser = parse_key_value)]
    context: Vec<(String, String)>,
}

impl RequestArgs {
    fn to_request(&self) -> DataRequest {
        DataRequest {
            user_id: self.user_id.clone(),
            resource_id: self.resource_id.clone(),
            context: self.context.iter().cloned().collect::<BTreeMap<_, _>>(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a data request and print its token
    Register {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Stream resources for a token as JSON lines
    Stream {
        token: String,
    },
    /// Register, stream, and download every resource into a directory
    Fetch {
        #[command(flatten)]
        request: RequestArgs,
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sluice_client=info,sluice_flow=info".into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = expand_tilde(&cli.config);
    let mut cfg = ClientConfig::load_or_default(&config_path)?;
    if let Some(capacity) = cli.capacity {
        cfg.download.capacity = capacity;
        cfg.validate()?;
    }

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Commands::Register { request } => {
            let client = Client::new(cfg)?;
            let token = client.register(&request.to_request()).await?;
            println!("{token}");
        }
        Commands::Stream { token } => {
            let client = Client::new(cfg)?;
            let stream = client.subscribe(token).await?;
            let terminal = print_stream(stream).await?;
            client.shutdown().await;
            exit_for(&terminal);
        }
        Commands::Fetch { request, out } => {
            let client = Client::new(cfg)?;
            tokio::fs::create_dir_all(&out).await?;
            let token = client.register(&request.to_request()).await?;
            tracing::info!(%token, out = %out.display(), "fetching");
            let stream = client.subscribe(token).await?;
            let terminal = fetch_all(&client, stream, &out).await?;
            client.shutdown().await;
            exit_for(&terminal);
        }
    }

    Ok(())
}

/// Print every delivery as one JSON line until the stream ends or Ctrl-C.
async fn print_stream(stream: ResourceStream) -> anyhow::Result<Terminal> {
    loop {
        let delivery = tokio::select! {
            d = stream.recv() => d,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling");
                stream.cancel();
                continue;
            }
        };
        println!("{}", serde_json::to_string(&delivery)?);
        if let Delivery::End(terminal) = delivery {
            return Ok(terminal);
        }
    }
}

/// Fetch each resource as it arrives, up to `download.capacity` at a time.
/// Error items and failed fetches are reported; the stream carries on.
async fn fetch_all(
    client: &Client,
    stream: ResourceStream,
    out: &Path,
) -> anyhow::Result<Terminal> {
    let mut pool = FetchPool::new(client.downloader().clone(), out);
    let terminal = loop {
        tokio::select! {
            delivery = stream.recv() => match delivery {
                Delivery::Item(ResourceItem::Resource(resource)) => pool.spawn(resource),
                Delivery::Item(item @ ResourceItem::Error { .. }) => {
                    eprintln!("{}", serde_json::to_string(&item)?);
                }
                Delivery::End(terminal) => break terminal,
            },
            Some(result) = pool.join_next(), if !pool.is_empty() => report(result)?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling");
                stream.cancel();
            }
        }
    };

    tracing::info!(%terminal, pending = pool.len(), "stream ended");
    for result in pool.finish().await {
        report(result)?;
    }
    Ok(terminal)
}

fn report(result: Result<Fetched, FetchError>) -> anyhow::Result<()> {
    match result {
        Ok(fetched) => println!("{}", serde_json::to_string(&fetched)?),
        Err(e) => tracing::warn!("{e}"),
    }
    Ok(())
}

fn exit_for(terminal: &Terminal) {
    match terminal {
        Terminal::Complete => {}
        Terminal::Cancelled => std::process::exit(130),
        Terminal::Failed(reason) => {
            eprintln!("Error: {reason}");
            std::process::exit(1);
        }
    }
}
