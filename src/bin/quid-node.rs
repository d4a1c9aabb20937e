#![forbid(unsafe_code)]
//! quid-node - run a chain backend or work with payment ids

use clap::{Parser, Subcommand};
use colored::*;
use quidnode::config::{load_config, load_config_from, Config, NodeMode};
use quidnode::node::{self, Node, NodeCallback};
use quidnode::payment_id::{self, PaymentId};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the configured backend and reports chain updates until Ctrl-C
    Run,
    /// Payment id helpers
    #[command(subcommand)]
    PaymentId(PaymentIdCommand),
    /// Converts a decimal amount of the configured currency to atomic units
    Amount {
        /// e.g. 12.5
        value: String,
    },
}

#[derive(Subcommand)]
enum PaymentIdCommand {
    /// Prints the extra field bytes carrying a payment id
    Encode {
        /// 64 hex characters
        id: String,
    },
    /// Extracts the payment id from hex-encoded extra field bytes
    Decode {
        extra: String,
    },
    /// Generates a random payment id
    New,
}

struct Reporter;

impl NodeCallback for Reporter {
    fn peer_count_updated(&mut self, count: usize) {
        println!("{} {}", "peers:".bright_blue(), count);
    }

    fn local_blockchain_updated(&mut self, height: u64) {
        println!("{} {}", "local height:".bright_green(), height);
    }

    fn last_known_block_height_updated(&mut self, height: u64) {
        println!("{} {}", "network height:".bright_yellow(), height);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            run(config_from(cli.config.as_deref())?).await?;
        }
        Commands::Amount { value } => {
            let currency = config_from(cli.config.as_deref())?.currency;
            let atomic = currency.parse_amount(&value)?;
            println!(
                "{} {} = {} atomic units",
                currency.format_amount(atomic).bold(),
                currency.ticker,
                atomic
            );
        }
        Commands::PaymentId(PaymentIdCommand::Encode { id }) => {
            let extra = payment_id::to_extra_bytes(&id)?;
            println!("{}", hex::encode(extra));
        }
        Commands::PaymentId(PaymentIdCommand::Decode { extra }) => {
            let bytes = hex::decode(extra.trim())?;
            let id = payment_id::from_extra_bytes(&bytes)?;
            if id.is_empty() {
                println!("{}", "no payment id".yellow());
            } else {
                println!("{}", id);
            }
        }
        Commands::PaymentId(PaymentIdCommand::New) => {
            println!("{}", PaymentId::generate());
        }
    }

    Ok(())
}

fn config_from(path: Option<&Path>) -> quidnode::Result<Config> {
    match path {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let backend = match config.node.mode {
        NodeMode::Remote => format!("daemon {}:{}", config.remote.host, config.remote.port),
        NodeMode::Local => format!("in-process node on {}", config.network.listen),
    };
    println!("{} {}", "Starting".bright_cyan(), backend.bold());

    let (events, mut receiver) = node::event_channel();
    let node = node::create_node(&config, events)?;
    node.init().await?;

    let snapshot = node.snapshot();
    let tip_time = chrono::DateTime::from_timestamp(snapshot.last_local_block_timestamp as i64, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{} height {} of {}, tip at {}, {} peers",
        "Ready:".bright_green().bold(),
        snapshot.last_local_block_height,
        snapshot.last_known_block_height,
        tip_time,
        snapshot.peer_count
    );

    let mut reporter = Reporter;
    // join takes the task handle on first poll, so the same future is awaited after stop
    let join = node.join();
    tokio::pin!(join);
    let mut exited = false;
    tokio::select! {
        _ = node::dispatch_events(&mut receiver, &mut reporter) => {}
        _ = &mut join => {
            exited = true;
            println!("{} {}", "Node exited on its own:".bright_red(), node.state());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    if !exited {
        println!("{}", "Stopping...".bright_cyan());
        node.deinit();
        join.await;
    }
    node::drain_events(&mut receiver, &mut reporter);
    println!("{} {}", "Node".bright_cyan(), node.state());
    Ok(())
}
