//! Pools: one per denomination, each with two admission queues and a
//! pointer to its current round.

use crate::config::{MinerFeeConfig, RegisterInputConfig, ServerConfig};
use crate::core::types::{MixId, RegisteredInput, TxOutPoint};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::queue::InputQueue;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Miner fee window of a pool, global config merged with pool overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolMinerFee {
    pub min: u64,
    pub cap: u64,
    pub max: u64,
    pub min_relay_fee: u64,
    /// Fee the must-mix inputs of a round must bring together.
    pub mix: u64,
}

impl PoolMinerFee {
    pub fn new(fees: &MinerFeeConfig, min_must_mix: usize) -> Self {
        Self {
            min: fees.min,
            cap: fees.cap,
            max: fees.max,
            min_relay_fee: fees.min_relay_fee,
            mix: fees.min_relay_fee.max(min_must_mix as u64 * fees.min),
        }
    }
}

/// Immutable pool configuration.
#[derive(Clone, Debug, Serialize)]
pub struct PoolParams {
    pub pool_id: String,
    pub denomination: u64,
    pub fee_value: u64,
    pub fee_accept: BTreeMap<u64, u64>,
    pub min_must_mix: usize,
    pub min_liquidity: usize,
    pub anonymity_set: usize,
    pub tx0_max_outputs: usize,
    pub miner_fee: PoolMinerFee,
}

impl PoolParams {
    pub fn must_mix_balance_min(&self) -> u64 {
        self.denomination + self.miner_fee.min
    }

    pub fn must_mix_balance_cap(&self) -> u64 {
        self.denomination + self.miner_fee.cap
    }

    pub fn must_mix_balance_max(&self) -> u64 {
        self.denomination + self.miner_fee.max
    }

    /// Liquidity is exactly one denomination; must-mix carries its miner fee on top.
    pub fn premix_balance_min(&self, liquidity: bool) -> u64 {
        if liquidity { self.denomination } else { self.must_mix_balance_min() }
    }

    pub fn premix_balance_cap(&self, liquidity: bool) -> u64 {
        if liquidity { self.denomination } else { self.must_mix_balance_cap() }
    }

    pub fn premix_balance_max(&self, liquidity: bool) -> u64 {
        if liquidity { self.denomination } else { self.must_mix_balance_max() }
    }

    pub fn check_input_balance(&self, value: u64, liquidity: bool) -> bool {
        value >= self.premix_balance_min(liquidity) && value <= self.premix_balance_max(liquidity)
    }

    pub fn miner_fee_mix(&self) -> u64 {
        self.miner_fee.mix
    }
}

/// Mutable part of a pool, guarded by the pool lock.
#[derive(Debug, Default)]
pub struct PoolState {
    pub must_mix: InputQueue,
    pub liquidity: InputQueue,
    pub current_mix: Option<MixId>,
}

impl PoolState {
    pub fn queue_mut(&mut self, liquidity: bool) -> &mut InputQueue {
        if liquidity { &mut self.liquidity } else { &mut self.must_mix }
    }

    pub fn remove_by_username(&mut self, username: &str) -> Vec<RegisteredInput> {
        let mut removed = Vec::new();
        while let Some(input) = self.must_mix.remove_by_username(username) {
            removed.push(input);
        }
        while let Some(input) = self.liquidity.remove_by_username(username) {
            removed.push(input);
        }
        removed
    }

    pub fn reset_last_user_hash(&mut self) {
        self.must_mix.reset_last_user_hash();
        self.liquidity.reset_last_user_hash();
    }
}

pub struct Pool {
    params: Arc<PoolParams>,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(params: PoolParams) -> Self {
        Self { params: Arc::new(params), state: Mutex::new(PoolState::default()) }
    }

    pub fn id(&self) -> &str {
        &self.params.pool_id
    }

    pub fn params(&self) -> &Arc<PoolParams> {
        &self.params
    }

    /// Never take a round lock while holding this one.
    pub fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock()
    }

    pub fn current_mix_id(&self) -> Option<MixId> {
        self.state.lock().current_mix.clone()
    }
}

/// Owns every configured pool. Built once at startup.
pub struct PoolManager {
    pools: HashMap<String, Arc<Pool>>,
    register_input: RegisterInputConfig,
}

impl PoolManager {
    pub fn from_config(config: &ServerConfig) -> Self {
        let pools = config
            .pools
            .iter()
            .map(|pc| {
                let fees = pc.effective_miner_fees(&config.miner_fees);
                let params = PoolParams {
                    pool_id: pc.id.clone(),
                    denomination: pc.denomination,
                    fee_value: pc.fee_value,
                    fee_accept: pc.fee_accept.clone(),
                    min_must_mix: pc.must_mix_min,
                    min_liquidity: pc.liquidity_min,
                    anonymity_set: pc.anonymity_set,
                    tx0_max_outputs: pc.tx0_max_outputs,
                    miner_fee: PoolMinerFee::new(&fees, pc.must_mix_min),
                };
                (pc.id.clone(), Arc::new(Pool::new(params)))
            })
            .collect();
        Self { pools, register_input: config.register_input.clone() }
    }

    pub fn get(&self, pool_id: &str) -> CoordinatorResult<&Arc<Pool>> {
        self.pools
            .get(pool_id)
            .ok_or_else(|| CoordinatorError::invalid_argument("Pool not found"))
    }

    /// All pools, sorted by id for stable listings.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        let mut pools: Vec<_> = self.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.id().cmp(b.id()));
        pools
    }

    /// Pool whose balance window holds `value`, largest denomination first.
    pub fn find_by_input_value(&self, value: u64, liquidity: bool) -> Option<Arc<Pool>> {
        let mut candidates: Vec<_> = self
            .pools
            .values()
            .filter(|p| p.params().check_input_balance(value, liquidity))
            .collect();
        candidates.sort_by(|a, b| b.params().denomination.cmp(&a.params().denomination));
        candidates.first().map(|p| Arc::clone(p))
    }

    pub fn is_utxo_confirmed(&self, outpoint: &TxOutPoint, liquidity: bool) -> bool {
        let min = if liquidity {
            self.register_input.min_confirmations_liquidity
        } else {
            self.register_input.min_confirmations_must_mix
        };
        outpoint.confirmations >= min
    }

    /// Check balance window and confirmations, then queue.
    pub fn register_input(
        &self,
        pool_id: &str,
        username: &str,
        liquidity: bool,
        outpoint: TxOutPoint,
        ip: &str,
    ) -> CoordinatorResult<RegisteredInput> {
        let pool = self.get(pool_id)?;
        let params = pool.params();

        if !params.check_input_balance(outpoint.value, liquidity) {
            return Err(CoordinatorError::input_rejected(format!(
                "Invalid input balance (expected: {}-{}, actual:{})",
                params.premix_balance_min(liquidity),
                params.premix_balance_max(liquidity),
                outpoint.value
            )));
        }
        if !self.is_utxo_confirmed(&outpoint, liquidity) {
            return Err(CoordinatorError::input_rejected("Input is not confirmed"));
        }

        let input = RegisteredInput::new(pool_id, username, liquidity, outpoint, ip);
        tracing::debug!("[{}] {} queueing {}", pool_id, username, input.kind());
        pool.lock().queue_mut(liquidity).register(input.clone())?;
        Ok(input)
    }

    /// Put an input back in its queue. A duplicate is dropped with a warning.
    pub fn requeue(&self, input: RegisteredInput) {
        let Ok(pool) = self.get(&input.pool_id) else {
            tracing::warn!("requeue: unknown pool {}", input.pool_id);
            return;
        };
        let username = input.username.clone();
        let liquidity = input.liquidity;
        if let Err(e) = pool.lock().queue_mut(liquidity).register(input) {
            tracing::warn!("[{}] {} not requeued: {}", pool.id(), username, e);
        }
    }

    /// Drop every queued input of a session, across all pools.
    pub fn remove_by_username(&self, username: &str) -> Vec<RegisteredInput> {
        self.pools.values().flat_map(|p| p.lock().remove_by_username(username)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use bitcoin::{Script, Txid};
    use std::str::FromStr;

    fn pool_config(id: &str, denomination: u64) -> PoolConfig {
        PoolConfig {
            id: id.into(),
            denomination,
            fee_value: denomination / 20,
            fee_accept: BTreeMap::new(),
            miner_fees: None,
            must_mix_min: 2,
            liquidity_min: 1,
            anonymity_set: 5,
            tx0_max_outputs: 70,
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            pools: vec![pool_config("0.01btc", 1_000_000), pool_config("0.001btc", 100_000)],
            miner_fees: MinerFeeConfig { min: 100, cap: 9_000, max: 10_000, min_relay_fee: 510 },
            ..Default::default()
        }
    }

    fn outpoint(value: u64, confirmations: u32) -> TxOutPoint {
        TxOutPoint {
            hash: Txid::from_str(&"ab".repeat(32)).unwrap(),
            index: 0,
            value,
            confirmations,
            script_pubkey: Script::new(),
            address: "tb1q".into(),
        }
    }

    // ─── Miner fee math ───

    #[test]
    fn miner_fee_mix_is_max_of_relay_and_must_mix_min() {
        let fees = MinerFeeConfig { min: 100, cap: 9_000, max: 10_000, min_relay_fee: 510 };
        assert_eq!(PoolMinerFee::new(&fees, 2).mix, 510);
        assert_eq!(PoolMinerFee::new(&fees, 8).mix, 800);
    }

    #[test]
    fn balance_windows() {
        let mgr = PoolManager::from_config(&config());
        let params = mgr.get("0.01btc").unwrap().params();
        assert_eq!(params.premix_balance_min(true), 1_000_000);
        assert_eq!(params.premix_balance_max(true), 1_000_000);
        assert_eq!(params.premix_balance_min(false), 1_000_100);
        assert_eq!(params.premix_balance_cap(false), 1_009_000);
        assert_eq!(params.premix_balance_max(false), 1_010_000);
        assert!(params.check_input_balance(1_000_000, true));
        assert!(!params.check_input_balance(1_000_001, true));
        assert!(!params.check_input_balance(1_000_099, false));
        assert!(params.check_input_balance(1_010_000, false));
    }

    #[test]
    fn find_by_input_value_picks_matching_pool() {
        let mgr = PoolManager::from_config(&config());
        assert_eq!(mgr.find_by_input_value(1_000_500, false).unwrap().id(), "0.01btc");
        assert_eq!(mgr.find_by_input_value(100_000, true).unwrap().id(), "0.001btc");
        assert!(mgr.find_by_input_value(500_000, false).is_none());
    }

    #[test]
    fn find_by_input_value_prefers_largest_denomination() {
        let mut cfg = config();
        // A wide window on the small pool overlaps the large one.
        cfg.pools[1].miner_fees =
            Some(MinerFeeConfig { min: 0, cap: 2_000_000, max: 2_000_000, min_relay_fee: 0 });
        let mgr = PoolManager::from_config(&cfg);
        assert_eq!(mgr.find_by_input_value(1_000_500, false).unwrap().id(), "0.01btc");
    }

    // ─── Registration ───

    #[test]
    fn register_input_checks_balance_and_confirmations() {
        let mgr = PoolManager::from_config(&config());
        let err = mgr.register_input("0.01btc", "alice", false, outpoint(999_999, 3), "1.1.1.1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid input balance (expected: 1000100-1010000, actual:999999)"
        );

        let err = mgr.register_input("0.01btc", "alice", false, outpoint(1_000_200, 0), "1.1.1.1").unwrap_err();
        assert_eq!(err.to_string(), "Input is not confirmed");

        mgr.register_input("0.01btc", "alice", false, outpoint(1_000_200, 1), "1.1.1.1").unwrap();
        let err = mgr.register_input("0.01btc", "alice", false, outpoint(1_000_200, 1), "1.1.1.1").unwrap_err();
        assert!(err.is_already_registered());

        assert!(mgr.register_input("nope", "alice", false, outpoint(1_000_200, 1), "1.1.1.1").is_err());
    }

    #[test]
    fn remove_by_username_clears_both_queues() {
        let mgr = PoolManager::from_config(&config());
        mgr.register_input("0.01btc", "alice", false, outpoint(1_000_200, 1), "1.1.1.1").unwrap();
        let mut liq = outpoint(1_000_000, 1);
        liq.index = 1;
        mgr.register_input("0.01btc", "alice", true, liq, "1.1.1.1").unwrap();

        assert_eq!(mgr.remove_by_username("alice").len(), 2);
        let pool = mgr.get("0.01btc").unwrap();
        assert!(pool.lock().must_mix.is_empty());
        assert!(pool.lock().liquidity.is_empty());
    }
}
