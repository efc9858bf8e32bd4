//! The mix coordinator.
//!
//! Owns the pools, the table of current rounds and the watchdog, and drives
//! every round through its phases in response to client calls and ticks.
//!
//! Lock order is round, then pool, then the round table. A pool lock is never
//! held while a round lock is taken, and the table lock is only held for
//! lookups and swaps.

mod input;
mod lifecycle;
mod output;
mod signing;

pub use input::InputRegistration;

use crate::blame::BanService;
use crate::chain::ChainBackend;
use crate::config::ServerConfig;
use crate::core::types::*;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::limits::{MixLimits, PhaseTimeouts};
use crate::metrics::Metrics;
use crate::mix::{Mix, MixStatusSnapshot};
use crate::notify::{Notifier, ServerMessage};
use crate::pool::{Pool, PoolManager};
use crate::provenance::ProvenanceValidator;
use crate::storage::Storage;
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type SharedMix = Arc<Mutex<Mix>>;

/// Queue sizes and current round of one pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_id: String,
    pub denomination: u64,
    pub fee_value: u64,
    pub must_mix_balance_min: u64,
    pub must_mix_balance_cap: u64,
    pub must_mix_balance_max: u64,
    pub min_must_mix: usize,
    pub min_liquidity: usize,
    pub anonymity_set: usize,
    pub tx0_max_outputs: usize,
    pub must_mix_queued: usize,
    pub must_mix_queued_tor: usize,
    pub liquidity_queued: usize,
    pub liquidity_queued_tor: usize,
    pub mix: Option<MixStatusSnapshot>,
    /// Seconds before the current phase times out.
    pub time_left_secs: Option<u64>,
}

struct Inner {
    config: ServerConfig,
    pools: PoolManager,
    mixes: RwLock<HashMap<MixId, SharedMix>>,
    limits: MixLimits,
    chain: Arc<dyn ChainBackend>,
    provenance: Arc<dyn ProvenanceValidator>,
    notifier: Arc<dyn Notifier>,
    storage: Storage,
    bans: BanService,
    metrics: Metrics,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Build the coordinator and open a first round in every pool.
    pub fn new(
        config: ServerConfig,
        chain: Arc<dyn ChainBackend>,
        provenance: Arc<dyn ProvenanceValidator>,
        notifier: Arc<dyn Notifier>,
        storage: Storage,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new();
        let inner = Inner {
            pools: PoolManager::from_config(&config),
            mixes: RwLock::new(HashMap::new()),
            limits: MixLimits::new(PhaseTimeouts::from_config(&config)),
            bans: BanService::new(storage.clone(), config.ban.clone(), metrics.clone()),
            config,
            chain,
            provenance,
            notifier,
            storage,
            metrics,
        };
        let coordinator = Self { inner: Arc::new(inner) };
        for pool in coordinator.inner.pools.pools() {
            coordinator.start_mix(&pool, Vec::new())?;
        }
        Ok(coordinator)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn pools(&self) -> &PoolManager {
        &self.inner.pools
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn bans(&self) -> &BanService {
        &self.inner.bans
    }

    pub fn limits(&self) -> &MixLimits {
        &self.inner.limits
    }

    // ─── Round table ───

    fn get_mix(&self, mix_id: &str) -> CoordinatorResult<SharedMix> {
        self.inner.mixes.read().get(mix_id).cloned().ok_or_else(|| {
            tracing::debug!("Mix not found: {}", mix_id);
            CoordinatorError::MixFailed
        })
    }

    fn current_mixes(&self) -> Vec<SharedMix> {
        self.inner.mixes.read().values().cloned().collect()
    }

    /// The one current round whose confirmed inputs hash to `inputs_hash`.
    fn get_mix_by_inputs_hash(&self, inputs_hash: &str) -> CoordinatorResult<SharedMix> {
        let found: Vec<SharedMix> = self
            .current_mixes()
            .into_iter()
            .filter(|mix| mix.lock().compute_inputs_hash() == inputs_hash)
            .collect();
        match <[SharedMix; 1]>::try_from(found) {
            Ok([mix]) => Ok(mix),
            Err(_) => {
                tracing::warn!("REGISTER_OUTPUT rejected: no current mix for inputsHash={}", inputs_hash);
                Err(CoordinatorError::MixFailed)
            }
        }
    }

    fn expect_status(mix: &Mix, status: MixStatus) -> CoordinatorResult<()> {
        if mix.status() != status {
            tracing::debug!(
                "[{}] Operation not permitted for current mix status: expected={}, actual={}",
                mix.id(),
                status,
                mix.status()
            );
            return Err(CoordinatorError::MixFailed);
        }
        Ok(())
    }

    pub fn current_mix_id(&self, pool_id: &str) -> CoordinatorResult<MixId> {
        self.inner
            .pools
            .get(pool_id)?
            .current_mix_id()
            .ok_or(CoordinatorError::MixFailed)
    }

    pub fn mix_snapshot(&self, mix_id: &str) -> CoordinatorResult<MixStatusSnapshot> {
        Ok(self.get_mix(mix_id)?.lock().snapshot())
    }

    /// Open a new round for `pool`, requeueing `leftovers` from the round it
    /// replaces in the same pool lock scope.
    fn start_mix(&self, pool: &Arc<Pool>, leftovers: Vec<RegisteredInput>) -> Result<()> {
        let mix_id = hex::encode(rand::random::<[u8; 16]>());
        let mix = Mix::new(mix_id.clone(), Arc::clone(pool.params()))?;

        let previous = {
            let mut state = pool.lock();
            state.reset_last_user_hash();
            for input in leftovers {
                let username = input.username.clone();
                if let Err(e) = state.queue_mut(input.liquidity).register(input) {
                    tracing::warn!("[{}] {} not requeued: {}", pool.id(), username, e);
                }
            }
            state.current_mix.replace(mix_id.clone())
        };
        {
            let mut mixes = self.inner.mixes.write();
            if let Some(previous) = previous {
                mixes.remove(&previous);
            }
            mixes.insert(mix_id.clone(), Arc::new(Mutex::new(mix)));
        }

        tracing::info!("[{}][NEW MIX {}]", pool.id(), mix_id);
        self.inner.limits.manage(&mix_id, MixStatus::ConfirmInput);
        Ok(())
    }

    /// Restart pools left without a round after a failed key generation.
    fn ensure_current_mixes(&self) {
        for pool in self.inner.pools.pools() {
            let missing = match pool.current_mix_id() {
                Some(id) => !self.inner.mixes.read().contains_key(&id),
                None => true,
            };
            if missing {
                if let Err(e) = self.start_mix(&pool, Vec::new()) {
                    tracing::error!("[{}] unable to start mix: {:#}", pool.id(), e);
                }
            }
        }
    }

    // ─── Watchdog ───

    /// Fire the timeout handler of every overdue round.
    pub fn tick(&self) {
        self.ensure_current_mixes();
        for (mix_id, status) in self.inner.limits.expired() {
            self.on_timeout(&mix_id, status);
        }
    }

    /// Pretend time passed in the current phase of `mix_id`.
    pub fn simulate_elapsed_time(&self, mix_id: &str, elapsed: Duration) {
        tracing::info!("[{}] simulating {:?} elapsed", mix_id, elapsed);
        self.inner.limits.simulate_elapsed(mix_id, elapsed);
    }

    pub fn pools_status(&self) -> Vec<PoolStatus> {
        self.inner
            .pools
            .pools()
            .into_iter()
            .map(|pool| {
                let params = pool.params();
                let (status, current) = {
                    let state = pool.lock();
                    let status = PoolStatus {
                        pool_id: params.pool_id.clone(),
                        denomination: params.denomination,
                        fee_value: params.fee_value,
                        must_mix_balance_min: params.must_mix_balance_min(),
                        must_mix_balance_cap: params.must_mix_balance_cap(),
                        must_mix_balance_max: params.must_mix_balance_max(),
                        min_must_mix: params.min_must_mix,
                        min_liquidity: params.min_liquidity,
                        anonymity_set: params.anonymity_set,
                        tx0_max_outputs: params.tx0_max_outputs,
                        must_mix_queued: state.must_mix.len(),
                        must_mix_queued_tor: state.must_mix.len_tor(),
                        liquidity_queued: state.liquidity.len(),
                        liquidity_queued_tor: state.liquidity.len_tor(),
                        mix: None,
                        time_left_secs: None,
                    };
                    (status, state.current_mix.clone())
                };
                let Some(mix_id) = current else { return status };
                let mix = self.get_mix(&mix_id).ok().map(|m| m.lock().snapshot());
                let time_left_secs = self.inner.limits.time_left(&mix_id).map(|d| d.as_secs());
                PoolStatus { mix, time_left_secs, ..status }
            })
            .collect()
    }

    // ─── Helpers ───

    fn notify(&self, username: &str, message: ServerMessage) {
        self.inner.notifier.send_private(username, message);
    }

    fn notify_mixing_users(&self, mix: &Mix, message: ServerMessage) {
        for input in mix.inputs() {
            self.notify(input.username(), message.clone());
        }
    }

    fn log_mix_status(&self, mix: &Mix) {
        let pool = mix.pool();
        let (liquidities, must_mixs) = match self.inner.pools.get(&pool.pool_id) {
            Ok(p) => {
                let state = p.lock();
                (state.liquidity.len(), state.must_mix.len())
            }
            Err(_) => (0, 0),
        };
        tracing::info!(
            "[{}] {}/{} mustMix, {}/{} liquidity, {}/{} anonymitySet, {}/{}sat, {} confirming, mixStatus={} (pool: {} liquidities + {} mustMixs)",
            mix.id(),
            mix.nb_must_mix(),
            pool.min_must_mix,
            mix.nb_liquidities(),
            pool.min_liquidity,
            mix.nb_inputs(),
            pool.anonymity_set,
            mix.miner_fee_accumulated(),
            pool.miner_fee_mix(),
            mix.nb_confirming(),
            mix.status(),
            liquidities,
            must_mixs
        );
    }

    /// Run `task` after `delay`, inline when the delay is zero.
    fn run_later<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            task();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = tokio::task::spawn_blocking(task).await {
                        tracing::error!("delayed task panicked: {}", e);
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    task();
                });
            }
        }
    }
}

/// `txid:index` of each input, joined by `;`.
fn outpoint_keys(inputs: &[ConfirmedInput]) -> String {
    inputs
        .iter()
        .map(|i| i.input.outpoint.key())
        .collect::<Vec<_>>()
        .join(";")
}
