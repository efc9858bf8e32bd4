//! Server configuration, loaded from a JSON file.

use anyhow::{bail, Context, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: Network,
    /// Skip Tx0 / prior-mix provenance checks.
    pub test_mode: bool,
    /// When false, queued inputs are never invited.
    pub mix_enabled: bool,
    pub register_input: RegisterInputConfig,
    pub register_output: PhaseConfig,
    pub signing: PhaseConfig,
    pub reveal_output: PhaseConfig,
    pub ban: BanConfig,
    pub miner_fees: MinerFeeConfig,
    pub pools: Vec<PoolConfig>,
    /// Address receiving pool fees in Tx0s.
    pub fee_address: Option<String>,
    pub rpc_client: RpcClientConfig,
    pub delays: DelayConfig,
    pub tick_interval_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterInputConfig {
    pub min_confirmations_must_mix: u32,
    pub min_confirmations_liquidity: u32,
    pub max_inputs_same_hash: usize,
    pub max_inputs_same_user_hash: usize,
    /// How often the current round invites queued inputs.
    pub confirm_interval_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BanConfig {
    /// Blames within `period_secs` that trigger a ban.
    pub blames: usize,
    pub period_secs: u64,
    pub expiration_secs: u64,
    pub recidivism_factor: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerFeeConfig {
    pub min: u64,
    pub cap: u64,
    pub max: u64,
    pub min_relay_fee: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    pub denomination: u64,
    pub fee_value: u64,
    /// Older fee values still accepted, each up to a Tx0 block time (unix secs).
    #[serde(default)]
    pub fee_accept: BTreeMap<u64, u64>,
    /// Overrides the global miner fee window for this pool.
    #[serde(default)]
    pub miner_fees: Option<MinerFeeConfig>,
    pub must_mix_min: usize,
    pub liquidity_min: usize,
    pub anonymity_set: usize,
    #[serde(default = "default_tx0_max_outputs")]
    pub tx0_max_outputs: usize,
}

fn default_tx0_max_outputs() -> usize {
    70
}

impl PoolConfig {
    /// Global miner fees, with each positive per-pool field taking precedence.
    pub fn effective_miner_fees(&self, global: &MinerFeeConfig) -> MinerFeeConfig {
        let mut fees = global.clone();
        if let Some(o) = &self.miner_fees {
            if o.min > 0 {
                fees.min = o.min;
            }
            if o.cap > 0 {
                fees.cap = o.cap;
            }
            if o.max > 0 {
                fees.max = o.max;
            }
            if o.min_relay_fee > 0 {
                fees.min_relay_fee = o.min_relay_fee;
            }
        }
        fees
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    /// Log the raw transaction instead of pushing it.
    pub mock_tx_broadcast: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Between inviting an input and notifying its session.
    pub invite_ms: u64,
    /// Between a confirmation and the readiness re-check.
    pub confirm_check_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            test_mode: false,
            mix_enabled: true,
            register_input: RegisterInputConfig::default(),
            register_output: PhaseConfig { timeout_secs: 60 },
            signing: PhaseConfig { timeout_secs: 60 },
            reveal_output: PhaseConfig { timeout_secs: 60 },
            ban: BanConfig::default(),
            miner_fees: MinerFeeConfig { min: 102, cap: 9_500, max: 10_000, min_relay_fee: 510 },
            pools: Vec::new(),
            fee_address: None,
            rpc_client: RpcClientConfig::default(),
            delays: DelayConfig::default(),
            tick_interval_ms: 1_000,
        }
    }
}

impl Default for RegisterInputConfig {
    fn default() -> Self {
        Self {
            min_confirmations_must_mix: 1,
            min_confirmations_liquidity: 1,
            max_inputs_same_hash: 1,
            max_inputs_same_user_hash: 1,
            confirm_interval_secs: 10,
        }
    }
}

impl Default for BanConfig {
    fn default() -> Self {
        Self { blames: 3, period_secs: 86_400, expiration_secs: 86_400, recidivism_factor: 2 }
    }
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18332".into(),
            user: String::new(),
            password: String::new(),
            mock_tx_broadcast: false,
        }
    }
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self { invite_ms: 2_000, confirm_check_ms: 3_000 }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            bail!("no pools configured");
        }
        check_miner_fees("global", &self.miner_fees)?;

        let mut ids = HashSet::new();
        for pool in &self.pools {
            if !ids.insert(pool.id.as_str()) {
                bail!("duplicate pool id {}", pool.id);
            }
            if pool.anonymity_set == 0 {
                bail!("pool {}: anonymity_set must be positive", pool.id);
            }
            if pool.must_mix_min + pool.liquidity_min > pool.anonymity_set {
                bail!(
                    "pool {}: must_mix_min ({}) + liquidity_min ({}) exceeds anonymity_set ({})",
                    pool.id,
                    pool.must_mix_min,
                    pool.liquidity_min,
                    pool.anonymity_set
                );
            }
            check_miner_fees(&pool.id, &pool.effective_miner_fees(&self.miner_fees))?;
        }
        if self.ban.blames == 0 {
            bail!("ban.blames must be positive");
        }
        Ok(())
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_secs(self.register_input.confirm_interval_secs)
    }
}

fn check_miner_fees(scope: &str, fees: &MinerFeeConfig) -> Result<()> {
    if !(fees.min <= fees.cap && fees.cap <= fees.max) {
        bail!(
            "{}: miner fees must satisfy min <= cap <= max (got {} / {} / {})",
            scope,
            fees.min,
            fees.cap,
            fees.max
        );
    }
    Ok(())
}
