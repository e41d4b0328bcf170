use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use stakewatch::assets::DecimalsCache;
use stakewatch::bot::{run_update_loop, Bot};
use stakewatch::chain::{ChainApi, ChainClient};
use stakewatch::config::Config;
use stakewatch::dispatch::{spawn_stats_logger, Dispatcher};
use stakewatch::quota::QuotaEngine;
use stakewatch::store::{SubscriptionStore, ValkeyStore};
use stakewatch::sync::{
    spawn_schedule, CheckerConfig, PoolChecker, ProposalChecker, RewardChecker,
    TransactionChecker, VoteChecker,
};
use stakewatch::telegram::{MessageSink, TelegramClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = if Path::new("stakewatch.toml").exists() {
        Config::load(Path::new("stakewatch.toml"))?
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
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("stakewatch v{} starting", env!("CARGO_PKG_VERSION"));

    if !config.has_bot_token() {
        anyhow::bail!("no bot token configured (set TELEGRAM_BOT_TOKEN)");
    }

    // --- Valkey store ---
    // The cursor store is load-bearing: without it every restart would
    // replay history, so a connect failure is fatal.
    let valkey = ValkeyStore::connect(&config.valkey.url, &config.valkey.prefix).await?;
    valkey.ping().await?;
    let store: Arc<dyn SubscriptionStore> = Arc::new(valkey);

    // --- Chain API client ---
    if config.chain.api_key.is_empty() {
        warn!("no chain API key configured, running against the public tier");
    }
    let chain: Arc<dyn ChainApi> = Arc::new(ChainClient::new(
        config.chain.base_url.clone(),
        config.chain.api_key.clone(),
        Duration::from_secs(config.chain.request_timeout_secs),
    ));

    // --- Telegram client & dispatch pool ---
    let telegram = Arc::new(TelegramClient::new(&config.telegram));
    let sink: Arc<dyn MessageSink> = telegram.clone();
    let dispatcher = Dispatcher::new(config.dispatch.pool_size, sink.clone());
    spawn_stats_logger(
        dispatcher.stats(),
        Duration::from_secs(config.dispatch.stats_interval_secs),
    );
    info!(pool_size = config.dispatch.pool_size, "dispatch pool ready");

    // --- Sync engines, one schedule per domain ---
    let checker_config = CheckerConfig::from_config(&config);
    let decimals = Arc::new(DecimalsCache::new());

    let tx_checker = Arc::new(TransactionChecker::new(
        chain.clone(),
        store.clone(),
        dispatcher.clone(),
        decimals.clone(),
        checker_config.clone(),
    ));
    spawn_schedule(
        "transactions",
        Duration::from_secs(config.sync.tx_interval_secs),
        move || {
            let checker = tx_checker.clone();
            async move { checker.run_once().await }
        },
    );

    let reward_checker = Arc::new(RewardChecker::new(
        chain.clone(),
        store.clone(),
        dispatcher.clone(),
        checker_config.clone(),
    ));
    spawn_schedule(
        "rewards",
        Duration::from_secs(config.sync.reward_interval_secs),
        move || {
            let checker = reward_checker.clone();
            async move { checker.run_once().await }
        },
    );

    let pool_checker = Arc::new(PoolChecker::new(
        chain.clone(),
        store.clone(),
        dispatcher.clone(),
        checker_config.clone(),
    ));
    spawn_schedule(
        "pools",
        Duration::from_secs(config.sync.pool_interval_secs),
        move || {
            let checker = pool_checker.clone();
            async move { checker.run_once().await }
        },
    );

    let vote_checker = Arc::new(VoteChecker::new(
        chain.clone(),
        store.clone(),
        dispatcher.clone(),
        checker_config.clone(),
    ));
    spawn_schedule(
        "votes",
        Duration::from_secs(config.sync.vote_interval_secs),
        move || {
            let checker = vote_checker.clone();
            async move { checker.run_once().await }
        },
    );

    let proposal_checker = Arc::new(ProposalChecker::new(
        chain.clone(),
        store.clone(),
        dispatcher.clone(),
        checker_config.clone(),
    ));
    spawn_schedule(
        "proposals",
        Duration::from_secs(config.sync.proposal_interval_secs),
        move || {
            let checker = proposal_checker.clone();
            async move { checker.run_once().await }
        },
    );

    info!(
        tx_interval = config.sync.tx_interval_secs,
        reward_interval = config.sync.reward_interval_secs,
        pool_interval = config.sync.pool_interval_secs,
        vote_interval = config.sync.vote_interval_secs,
        proposal_interval = config.sync.proposal_interval_secs,
        "sync schedules running"
    );

    // --- Inbound command loop ---
    let quota = QuotaEngine::new(chain.clone(), store.clone(), config.quota.clone());
    let bot = Arc::new(Bot::new(
        chain,
        store,
        quota,
        dispatcher,
        sink,
        Duration::from_secs(config.dispatch.command_timeout_secs),
    ));

    info!("listening for commands");
    run_update_loop(bot, telegram).await;
    Ok(())
}
