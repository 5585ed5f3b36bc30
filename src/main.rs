//! feedrelay binary: wires the HTTP upstream, webhook delivery and JSON
//! file store into a [`Relay`], then reads operator commands from stdin
//! until `quit` or Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use feedrelay::delivery::WebhookDelivery;
use feedrelay::input::{parse_command, Command, ParseError, HELP};
use feedrelay::store::FileStore;
use feedrelay::upstream::{HttpUpstream, SourceSummary};
use feedrelay::{Config, Relay};

#[derive(Parser)]
#[command(name = "feedrelay", about = "Relay followed accounts' posts to chat webhooks")]
struct Cli {
    /// Path of the TOML config file.
    #[arg(long, env = "FEEDRELAY_CONFIG", default_value = "feedrelay.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).  `RUST_LOG` wins.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so console replies on stdout stay readable.
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn print_search(query: &str, hits: &[SourceSummary]) {
    if hits.is_empty() {
        println!("no account matches {query:?}");
        return;
    }
    for hit in hits {
        println!(
            "@{} ({}): {} posts, {} followers",
            hit.handle, hit.name, hit.items, hit.followers
        );
        println!("    {}", hit.description.as_deref().unwrap_or("no description"));
    }
}

/// Run one console command.  Returns `false` when the console should exit.
async fn execute(relay: &Relay, webhooks: &WebhookDelivery, command: Command) -> bool {
    let outcome = match command {
        Command::Follow {
            handle,
            destination,
        } => relay.follow(&handle, destination).await.map(|receipt| {
            match receipt.last_item_url {
                Some(url) => println!("following {} in {destination} (last: {url})", receipt.handle),
                None => println!("following {} in {destination}", receipt.handle),
            }
            if !webhooks.knows(destination) {
                println!("warning: no webhook configured for {destination}, deliveries will fail");
            }
        }),
        Command::Unfollow {
            handle,
            destination,
        } => relay
            .unfollow(&handle, destination)
            .await
            .map(|()| println!("unfollowed {handle} in {destination}")),
        Command::List { destination } => {
            let handles = relay.list(destination).await;
            if handles.is_empty() {
                println!("{destination} follows nothing");
            } else {
                println!("{destination}: {}", handles.join(", "));
            }
            Ok(())
        }
        Command::Fetch {
            handle,
            destination,
            limit,
        } => relay
            .fetch(&handle, limit, destination)
            .await
            .map(|sent| println!("sent {sent} items from {handle} to {destination}")),
        Command::Search { query, limit } => relay
            .search(&query, limit)
            .await
            .map(|hits| print_search(&query, &hits)),
        Command::Forget { destinations } => relay
            .remove_destinations(&destinations)
            .await
            .map(|r| println!("removed {} feeds, unfollowed {}", r.removed, r.unfollowed)),
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => return false,
    };

    if let Err(e) = outcome {
        if e.is_user_facing() {
            println!("error: {e}");
        } else {
            error!(error = %e, "command failed");
        }
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = load_config(&cli.config)?;
    if config.upstream.bearer_token.is_empty() {
        warn!("no bearer token configured, upstream calls will be rejected");
    }

    let store = Arc::new(FileStore::new(&config.store_path));
    let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
    let delivery = Arc::new(WebhookDelivery::new(config.webhooks()?)?);

    let relay = Relay::new(store, upstream, delivery.clone(), &config)
        .await
        .context("failed to load follow registry")?;
    relay.start().await;
    info!(store = %config.store_path.display(), "feedrelay ready, type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        // EOF on stdin: keep relaying until interrupted.
        let Some(line) = line else {
            tokio::signal::ctrl_c().await?;
            break;
        };

        match parse_command(&line) {
            Ok(command) => {
                if !execute(&relay, &delivery, command).await {
                    break;
                }
            }
            Err(ParseError::Empty) => {}
            Err(e) => println!("{e}"),
        }
    }

    relay.shutdown().await;
    info!("feedrelay stopped");
    Ok(())
}
