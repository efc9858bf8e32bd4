use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whirlpool_server::chain::{BitcoindClient, ChainBackend};
use whirlpool_server::config::ServerConfig;
use whirlpool_server::notify::{SessionHub, MAILBOX_IDLE_TTL};
use whirlpool_server::provenance::FeeOutputProvenance;
use whirlpool_server::rpc::{self, AppState, RpcServer};
use whirlpool_server::storage::Storage;
use whirlpool_server::Coordinator;

#[derive(Parser)]
#[command(name = "whirlpool-server")]
#[command(about = "Whirlpool CoinJoin coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator
    Serve {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "8080")]
        port: u16,
    },

    /// Load and validate a config file
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Show pools of a running coordinator
    Pools {
        #[arg(long, default_value = "8080")]
        port: u16,
    },

    /// Show counters of a running coordinator
    Metrics {
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whirlpool_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, data_dir, port } => serve(config, data_dir, port).await,
        Command::CheckConfig { config } => check_config(config),
        Command::Pools { port } => show_pools(port).await,
        Command::Metrics { port } => show_metrics(port).await,
    }
}

async fn serve(config_path: PathBuf, data_dir: PathBuf, port: u16) -> Result<()> {
    let config = ServerConfig::load(&config_path)?;
    std::fs::create_dir_all(&data_dir)?;
    let storage = Storage::open(data_dir.join("db"))?;
    tracing::info!(
        "network={} pools={} test_mode={} mix_enabled={}",
        config.network,
        config.pools.len(),
        config.test_mode,
        config.mix_enabled
    );

    // reqwest's blocking client owns a runtime and cannot be built on this one
    let rpc_config = config.rpc_client.clone();
    let chain: Arc<dyn ChainBackend> = tokio::task::spawn_blocking(move || -> Result<Arc<dyn ChainBackend>> {
        let client = BitcoindClient::new(rpc_config)?;
        match client.block_height() {
            Ok(height) => tracing::info!("bitcoind reachable, height {}", height),
            Err(e) => tracing::warn!("bitcoind not reachable yet: {:#}", e),
        }
        Ok(Arc::new(client))
    })
    .await??;

    let provenance = Arc::new(FeeOutputProvenance::new(config.fee_address.as_deref(), storage.clone())?);
    let sessions = Arc::new(SessionHub::default());
    let tick_interval = Duration::from_millis(config.tick_interval_ms.max(100));

    let notifier = sessions.clone();
    let db = storage.clone();
    let coordinator = tokio::task::spawn_blocking(move || {
        Coordinator::new(config, chain, provenance, notifier, db)
    })
    .await??;

    let ticker = coordinator.clone();
    let hub = sessions.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(tick_interval);
        let mut metrics_interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let c = ticker.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || c.tick()).await {
                        tracing::error!("tick failed: {}", e);
                    }
                }
                _ = metrics_interval.tick() => {
                    ticker.metrics().report();
                    hub.evict_idle(MAILBOX_IDLE_TTL);
                }
            }
        }
    });

    let state = AppState { coordinator, sessions };
    tokio::select! {
        result = RpcServer::new(port).run(state) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    storage.flush()?;
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = ServerConfig::load(&path)?;
    println!("Config OK: {}", path.display());
    println!("  Network:   {}", config.network);
    println!("  Test mode: {}", config.test_mode);
    for pool in &config.pools {
        println!(
            "  Pool {:<10} denomination={} fee={} anonymitySet={} mustMixMin={} liquidityMin={}",
            pool.id, pool.denomination, pool.fee_value, pool.anonymity_set, pool.must_mix_min, pool.liquidity_min
        );
    }
    Ok(())
}

async fn show_pools(port: u16) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/pools", port);
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        let error: rpc::ErrorResponse = response.json().await?;
        println!("Error {}: {}", error.error_code, error.message);
        return Ok(());
    }
    let response: rpc::PoolsResponse = response.json().await?;
    println!("Pools: {}", response.pools.len());
    for pool in response.pools {
        println!("  {} ({} sats)", pool.pool_id, pool.denomination);
        println!(
            "    fee {} sats, mustMix balance {}-{} (cap {}), tx0 max outputs {}",
            pool.fee_value,
            pool.must_mix_balance_min,
            pool.must_mix_balance_max,
            pool.must_mix_balance_cap,
            pool.tx0_max_outputs
        );
        println!(
            "    queued: {} mustMix ({} tor), {} liquidity ({} tor)",
            pool.must_mix_queued, pool.must_mix_queued_tor, pool.liquidity_queued, pool.liquidity_queued_tor
        );
        if let Some(mix) = pool.mix {
            println!(
                "    mix {}: {} {}/{} inputs, {} confirming, {}s left",
                mix.mix_id,
                mix.status,
                mix.nb_inputs,
                mix.anonymity_set,
                mix.nb_confirming,
                pool.time_left_secs.unwrap_or(0)
            );
        }
    }
    Ok(())
}

async fn show_metrics(port: u16) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/metrics", port);
    let response: rpc::MetricsResponse = client.get(&url).send().await?.json().await?;
    let m = response.metrics;
    println!("Inputs:  {} registered, {} rejected, {} confirmed", m.inputs_registered, m.inputs_rejected, m.inputs_confirmed);
    println!("Mixes:   {} succeeded, {} failed", m.mixes_succeeded, m.mixes_failed);
    println!("Blames:  {} ({} bans)", m.blames, m.bans);
    Ok(())
}
