mod abi;
mod balance;
mod chain;
mod config;
mod database;
mod explorer;
mod games;
mod notify;
mod signatures;
mod stats;
mod syncer;
mod transactions;

use self::{
    abi::AbiCache,
    chain::{Node, RpcNode},
    config::{Config, Overrides},
    explorer::HttpExplorer,
    games::GameReconciler,
    notify::{NotificationGateway, Telegram},
    stats::{SyncStatsAggregator, SystemClock},
    syncer::Syncer,
    transactions::TransactionIngestor,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Arguments {
    #[clap(short, long, env = "GAMESYNC_CONFIG", default_value = "gamesync.toml")]
    config: PathBuf,

    #[clap(flatten)]
    overrides: Overrides,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, Subcommand)]
enum Command {
    /// Run sync cycles periodically (the default).
    Run,
    /// Run a single sync cycle.
    Once,
    /// Populate the function signature registry from every ABI file.
    Signatures,
    /// Refresh a single game from the contract.
    Game { id: u64 },
    /// Show the house's ether balance and the gacha token supply.
    Balance,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Arguments::parse();
    let mut config = Config::load(&args.config).context("failed to load configuration")?;
    config.apply(args.overrides);

    tracing::info!("{config:#?}");

    let mut database = database::open(&config.database).await?;
    let mut abis = AbiCache::new(&config.chain.abi_directory, config.chain.abi_cache_ttl);

    let command = args.command.unwrap_or(Command::Run);
    if let Command::Signatures = command {
        let signatures = signatures::populate_all(database.as_mut(), &mut abis).await?;
        tracing::info!(count = signatures.len(), "populated signature registry");
        return Ok(());
    }

    let contract_name = &config.chain.contract_abi_name;
    let abi = abis.load(contract_name)?;
    let node = RpcNode::new(&config.chain);
    let contract = node.contract(config.chain.contract_address, abi.clone());

    if let Command::Balance = command {
        let balance =
            balance::house_balance(&node, contract.as_ref(), config.chain.contract_address).await?;
        tracing::info!(
            contract = %balance.contract_address,
            house = %balance.house_address,
            balance_wei = %balance.balance_wei,
            balance_eth = %notify::format_eth(balance.balance_wei),
            gacha_token = %balance.gacha_token_address,
            gacha_total_supply = %notify::format_eth(balance.gacha_total_supply),
            "house balance"
        );
        return Ok(());
    }

    signatures::populate(database.as_mut(), contract_name, &abi).await?;

    let mut syncer = Syncer::new(
        database,
        GameReconciler::new(contract, &config.games),
        TransactionIngestor::new(
            Box::new(HttpExplorer::new(&config.explorer)?),
            config.chain.contract_address,
            contract_name.clone(),
            config.explorer.max_pages,
        ),
        NotificationGateway::new(
            &config.notifications,
            Telegram::from_config(&config.notifications, config.chain.timeout)?,
            SyncStatsAggregator::new(Box::new(SystemClock), config.notifications.interval),
        ),
    );

    match command {
        Command::Run => syncer.run(config.sync.interval).await,
        Command::Once => syncer.sync().await.map(|_| ()),
        Command::Game { id } => syncer.sync_game(id).await,
        Command::Signatures | Command::Balance => Ok(()),
    }
}
