use anyhow::{bail, Context};
use clap::Parser;
use nftscan_metrics::addresses::{wallets_from_contracts, AddressBook};
use nftscan_metrics::config::Config;
use nftscan_metrics::explorer::types::{parse_address, to_hex};
use nftscan_metrics::explorer::ExplorerClient;
use nftscan_metrics::ledger::{AddressLedger, AddressReconciler, ClassificationRules, TransactionCache};
use nftscan_metrics::report::{wei_to_native, MetricsSummary};
use alloy::primitives::Address;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about = "NFT trading metrics for a set of wallets")]
struct Cli {
    /// Address book with `wallets` and/or `contracts` lists
    #[arg(short = 'f', long = "file", default_value = "addresses.yaml")]
    file: PathBuf,

    /// Network to scan, or `all`
    #[arg(short, long)]
    network: String,

    /// Derive wallets from the counterparties of the book's contracts
    #[arg(short, long)]
    contracts: bool,

    /// Analyse this wallet instead of the address book (repeatable)
    #[arg(short, long = "wallet", conflicts_with = "contracts")]
    wallets: Vec<String>,

    /// Settings file
    #[arg(long, default_value = "nftscan.toml")]
    config: PathBuf,
}

/// Where a network's wallet list comes from.
enum WalletSource {
    Fixed(Vec<Address>),
    Contracts(Vec<Address>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let config = if config_found {
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    if !config_found {
        info!(path = %cli.config.display(), "no settings file found, using env-only config");
    }

    let Some(networks) = config.select_networks(&cli.network) else {
        let known: Vec<&str> = config.networks.keys().map(String::as_str).collect();
        bail!(
            "network not supported: {} (configured: {}, or `all`)",
            cli.network,
            known.join(", ")
        );
    };

    let source = wallet_source(&cli)?;
    let rules = ClassificationRules::from_config(&config.governance)?;

    let mut total_wallets = 0usize;
    let mut ledgers: Vec<AddressLedger> = Vec::new();

    for name in &networks {
        let net = &config.networks[name];
        if net.api_key.is_empty() {
            warn!(
                network = %name,
                env = %nftscan_metrics::config::api_key_var(name),
                "no API key configured, explorer limits will be tight"
            );
        }
        info!(network = %name, endpoint = %net.endpoint, "running on network");

        let client = ExplorerClient::new(name, net, &config.explorer)?;

        let wallets = match &source {
            WalletSource::Fixed(wallets) => wallets.clone(),
            WalletSource::Contracts(contracts) => wallets_from_contracts(&client, contracts)
                .await
                .with_context(|| format!("deriving wallets on {name}"))?,
        };
        info!(network = %name, wallets = wallets.len(), "wallets to analyse");
        total_wallets += wallets.len();

        log_balances(&client, &wallets, &config.report.native_symbol).await;

        let cache = TransactionCache::new();
        for wallet in wallets {
            info!(network = %name, wallet = %to_hex(wallet), "reconciling wallet");
            let reconciler = AddressReconciler::new(&client, cache.clone(), &rules, wallet);
            match reconciler.run().await {
                Ok(Some(ledger)) => ledgers.push(ledger),
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!(network = %name, wallet = %to_hex(wallet), error = %e, "aborting run");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(network = %name, wallet = %to_hex(wallet), error = %e, "wallet aborted");
                }
            }
        }
        info!(network = %name, cached_transactions = cache.len(), "network done");
    }

    let summary = MetricsSummary::aggregate(total_wallets, &ledgers)?;
    println!("{}", summary.render(&config.report.native_symbol));

    Ok(())
}

fn wallet_source(cli: &Cli) -> anyhow::Result<WalletSource> {
    if !cli.wallets.is_empty() {
        let wallets = cli
            .wallets
            .iter()
            .map(|raw| match parse_address("--wallet", raw) {
                Ok(Some(address)) => Ok(address),
                _ => bail!("invalid wallet address: {raw}"),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        return Ok(WalletSource::Fixed(wallets));
    }

    let book = load_book(&cli.file)?;
    if cli.contracts {
        Ok(WalletSource::Contracts(book.contract_addresses()?))
    } else {
        Ok(WalletSource::Fixed(book.wallet_addresses()?))
    }
}

fn load_book(path: &Path) -> anyhow::Result<AddressBook> {
    AddressBook::load(path).with_context(|| format!("loading address book {}", path.display()))
}

async fn log_balances(client: &ExplorerClient, wallets: &[Address], native_symbol: &str) {
    if wallets.is_empty() {
        return;
    }
    match client.balances(wallets).await {
        Ok(balances) => {
            for b in balances {
                let native = wei_to_native(b.balance)
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "n/a".to_string());
                info!(
                    network = %client.network(),
                    account = %to_hex(b.account),
                    wei = %b.balance,
                    native = %native,
                    symbol = %native_symbol,
                    "native balance"
                );
            }
        }
        Err(e) => warn!(network = %client.network(), error = %e, "balance fetch failed"),
    }
}
