//! CLI command implementations

use anyhow::Result;
use chrono::DateTime;
use dialoguer::Confirm;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::AppConfig;
use crate::units::parse_amount;

fn aggregator(config: &AppConfig) -> Result<Aggregator> {
    if config.wallets.is_empty() {
        anyhow::bail!("No wallets configured; add a [wallets.<CUR>] section");
    }
    Ok(Aggregator::configure(config.wallets.clone())?)
}

/// Start every configured engine and keep the interactive ones alive until Ctrl-C
pub async fn start(config: &AppConfig) -> Result<()> {
    let mut aggregator = aggregator(config)?;

    info!("Starting wallet engines...");
    aggregator.start_servers().await?;

    println!("\n=== ENGINES RUNNING ===\n");
    for currency in aggregator.currencies() {
        println!("  {}", currency);
    }
    println!("\nPress Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("Shutdown requested");

    aggregator.stop_servers().await?;
    info!("All engines stopped");
    Ok(())
}

/// Stop every configured engine
pub async fn stop(config: &AppConfig) -> Result<()> {
    let mut aggregator = aggregator(config)?;
    aggregator.stop_servers().await?;
    println!("All engines stopped.");
    Ok(())
}

/// Show confirmed balances
pub async fn balances(config: &AppConfig) -> Result<()> {
    let mut aggregator = aggregator(config)?;
    let balances = aggregator.get_balances().await?;

    println!("\n=== BALANCES ===\n");
    for (currency, balance) in balances {
        println!("{:<5} {}", currency, balance);
    }
    println!();
    Ok(())
}

/// Show an address to receive funds on
pub async fn address(config: &AppConfig, currency: &str) -> Result<()> {
    let mut aggregator = aggregator(config)?;
    let address = aggregator.get_receive_address(currency).await?;
    println!("{}", address);
    Ok(())
}

/// Show the suggested miner fee
pub async fn fee(config: &AppConfig, currency: &str) -> Result<()> {
    let mut aggregator = aggregator(config)?;
    let fee = aggregator.suggest_miner_fee(currency).await?;
    println!("{} {}", fee, currency.to_ascii_uppercase());
    Ok(())
}

/// List incoming transactions since a unix time
pub async fn history(config: &AppConfig, currency: &str, since: i64) -> Result<()> {
    let mut aggregator = aggregator(config)?;
    let transactions = aggregator.transactions_since(currency, since).await?;

    println!("\n=== INCOMING {} ===\n", currency.to_ascii_uppercase());

    if transactions.is_empty() {
        println!("No incoming transactions found.");
    } else {
        println!("{:<20} {:<20} {}", "DATE", "AMOUNT", "ID");
        println!("{}", "-".repeat(80));

        for tx in &transactions {
            let date = DateTime::from_timestamp(tx.time, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| tx.time.to_string());
            println!("{:<20} {:<20} {}", date, tx.value.to_string(), tx.id);
        }
    }

    println!();
    Ok(())
}

/// Send funds
pub async fn pay(
    config: &AppConfig,
    currency: &str,
    amount: &str,
    fee: &str,
    address: &str,
    force: bool,
) -> Result<()> {
    let net_amount = parse_amount(amount)?;
    let miner_fee = parse_amount(fee)?;
    let code = currency.to_ascii_uppercase();

    let mut aggregator = aggregator(config)?;

    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Send {} {} to {} paying {} {} in fees? This cannot be undone.",
                net_amount, code, address, miner_fee, code
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Payment cancelled by user");
            return Ok(());
        }
    }

    match aggregator
        .perform_transaction(currency, net_amount, miner_fee, address)
        .await
    {
        Ok(txid) => {
            println!("\n=== PAYMENT SENT ===");
            println!("Amount: {} {}", net_amount, code);
            println!("Fee: {} {}", miner_fee, code);
            println!("To: {}", address);
            println!("Transaction: {}", txid);
        }
        Err(e) => {
            error!("Payment failed: {}", e);
            anyhow::bail!("Payment failed: {}", e);
        }
    }

    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &AppConfig) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Probe every configured engine
pub async fn health(config: &AppConfig) -> Result<()> {
    println!("\n=== ENGINE HEALTH CHECK ===\n");

    let mut aggregator = aggregator(config)?;
    let health = aggregator.health().await;

    for (currency, ready) in &health {
        println!("{}... {}", currency, if *ready { "OK" } else { "NOT RESPONDING" });
    }

    println!();
    if health.values().all(|ready| *ready) {
        println!("All engines healthy!");
    } else {
        println!("Some engines are not responding. Start them with `coffer start`.");
    }

    Ok(())
}
