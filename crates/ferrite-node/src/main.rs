//! Ferrite node: operator binary for the chainstate engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ferrite_consensus::Hash256;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Chainstate engine with block import and operator controls.
#[derive(Parser, Debug)]
#[command(name = "ferrite-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ferrite-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network (mainnet, regtest)
    #[arg(short, long)]
    network: Option<String>,

    /// Script-check threads (0 = one per CPU)
    #[arg(long)]
    script_threads: Option<usize>,

    /// Check scripts with the main lock held
    #[arg(long)]
    no_parallel_validation: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Open the chainstate and run until Ctrl-C
    Run,
    /// Process length-prefixed blocks from a file
    Import { file: PathBuf },
    /// Print chain state summary
    Info,
    /// Mark a block invalid
    Invalidate { hash: Hash256 },
    /// Clear the failure flags of a block
    Reconsider { hash: Hash256 },
    /// Prefer a block over others of equal work
    Prioritize { hash: Hash256 },
    /// Soft reject a block for the given number of further blocks (-1 clears)
    SoftReject {
        hash: Hash256,
        #[arg(allow_negative_numbers = true)]
        blocks: i32,
    },
    /// Apply a soft consensus freeze to a block
    Freeze { hash: Hash256, blocks: i32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting ferrite node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    info!("Network: {}", config.network);
    info!("Data directory: {:?}", config.data_dir);

    let node = Node::open(config).await?;

    // Handle shutdown signals
    let node_handle = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            node_handle.request_shutdown();
        }
    });

    let command = args.command.clone().unwrap_or(Command::Run);
    let result = execute(&node, command).await;
    if let Err(ref e) = result {
        error!("Command failed: {:#}", e);
    }

    node.shutdown().await?;
    info!("Ferrite node stopped");
    result
}

async fn execute(node: &std::sync::Arc<Node>, command: Command) -> Result<()> {
    match command {
        Command::Run => node.run().await,
        Command::Import { file } => {
            let stats = node.import(&file).await?;
            println!(
                "Imported {} blocks ({} rejected){}",
                stats.processed,
                stats.rejected,
                if stats.cancelled { ", cancelled" } else { "" }
            );
            Ok(())
        }
        Command::Info => {
            print_info(node);
            Ok(())
        }
        Command::Invalidate { hash } => {
            node.blocking(move |chain| chain.invalidate_block(&hash)).await?;
            print_info(node);
            Ok(())
        }
        Command::Reconsider { hash } => {
            node.blocking(move |chain| chain.reconsider_block(&hash)).await?;
            print_info(node);
            Ok(())
        }
        Command::Prioritize { hash } => {
            node.blocking(move |chain| chain.prioritize_block(&hash)).await?;
            print_info(node);
            Ok(())
        }
        Command::SoftReject { hash, blocks } => {
            node.blocking(move |chain| chain.set_soft_rejected_for(&hash, blocks))
                .await?;
            print_info(node);
            Ok(())
        }
        Command::Freeze { hash, blocks } => {
            node.blocking(move |chain| chain.soft_consensus_freeze(&hash, blocks))
                .await?;
            print_info(node);
            Ok(())
        }
    }
}

fn print_info(node: &Node) {
    let info = node.info();
    let mempool = node.mempool().stats();
    match info.tip {
        Some(tip) => println!("Tip:          {} (height {})", tip, info.height),
        None => println!("Tip:          none"),
    }
    println!("Chain work:   {:x}", info.chain_work);
    println!("UTXO best:    {}", info.utxo_best_block);
    println!("Descriptors:  {}", info.descriptors);
    println!("Candidates:   {}", info.candidates);
    println!("Unlinked:     {}", info.unlinked);
    println!(
        "UTXO cache:   {} entries, {} bytes",
        info.utxo_cache_entries, info.utxo_memory
    );
    println!("Mempool:      {} transactions", mempool.tx_count);
    if info.aborted {
        println!("State:        ABORTED");
    }
}
