//! coffer - supervise Bitcoin, Monero and Ethereum wallet engines behind one CLI
//!
//! # WARNING
//! - `pay` moves real funds. Double-check the address and fee.
//! - Interactive engines (monero-wallet-rpc) live only as long as `coffer start`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use coffer::cli::commands;
use coffer::config::AppConfig;

/// Multi-currency wallet engine manager
#[derive(Parser)]
#[command(name = "coffer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "coffer.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all configured engines and keep them running until Ctrl-C
    Start,

    /// Stop all configured engines
    Stop,

    /// Show confirmed balances
    Balances,

    /// Show an address to receive funds on
    Address {
        /// Currency code (BTC, XMR, ETH)
        currency: String,
    },

    /// Show the suggested miner fee for a typical transaction
    Fee {
        /// Currency code (BTC, XMR, ETH)
        currency: String,
    },

    /// List incoming transactions
    History {
        /// Currency code (BTC, XMR, ETH)
        currency: String,

        /// Only transactions at or after this unix time
        #[arg(long, default_value = "0")]
        since: i64,
    },

    /// Send funds
    Pay {
        /// Currency code (BTC, XMR, ETH)
        currency: String,

        /// Net amount the recipient receives, as a plain decimal
        amount: String,

        /// Miner fee, as returned by `coffer fee`
        fee: String,

        /// Recipient address
        address: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Check whether each engine answers its RPC
    Health,

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("coffer=info".parse()?),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match AppConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start => commands::start(&config).await,
        Commands::Stop => commands::stop(&config).await,
        Commands::Balances => commands::balances(&config).await,
        Commands::Address { currency } => commands::address(&config, &currency).await,
        Commands::Fee { currency } => commands::fee(&config, &currency).await,
        Commands::History { currency, since } => commands::history(&config, &currency, since).await,
        Commands::Pay {
            currency,
            amount,
            fee,
            address,
            force,
        } => commands::pay(&config, &currency, &amount, &fee, &address, force).await,
        Commands::Health => commands::health(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
