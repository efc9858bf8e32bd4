//! Round ("mix") aggregate.
//!
//! A [`Mix`] holds everything one round knows: its RSA keypair, the inputs
//! invited and confirmed, the blinded outputs registered, reveals and
//! signatures collected, and the joint transaction once built. It does no
//! I/O and takes no locks; the coordinator owns it behind a mutex and drives
//! the phase transitions.

use crate::config::RegisterInputConfig;
use crate::core::crypto::MixKeyPair;
use crate::core::transaction::compute_inputs_hash;
use crate::core::types::*;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::pool::PoolParams;
use crate::queue::InputQueue;
use anyhow::Result;
use bitcoin::{OutPoint, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub struct Mix {
    mix_id: MixId,
    pool: Arc<PoolParams>,
    keys: MixKeyPair,
    time_started: u64,
    time_status: HashMap<MixStatus, u64>,
    /// Set when the first input is invited.
    created: Option<u64>,
    status: MixStatus,

    confirming: InputQueue,
    /// Confirmed inputs keyed by `txid:index`.
    inputs: HashMap<String, ConfirmedInput>,

    bordereaux: HashSet<Vec<u8>>,
    receive_addresses: BTreeSet<String>,
    last_receive_address_rejected: Option<String>,
    /// username -> revealed receive address
    revealed: HashMap<String, String>,
    signed: HashSet<String>,

    tx: Option<Transaction>,
    fail_reason: Option<FailReason>,
    fail_info: Option<String>,
}

/// Snapshot of a round exposed to the RPC layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixStatusSnapshot {
    pub mix_id: MixId,
    pub pool_id: String,
    pub status: MixStatus,
    pub nb_inputs: usize,
    pub nb_must_mix: usize,
    pub nb_liquidities: usize,
    pub nb_confirming: usize,
    pub nb_outputs: usize,
    pub anonymity_set: usize,
    pub miner_fee_accumulated: u64,
    pub elapsed_secs: u64,
}

impl Mix {
    pub fn new(mix_id: MixId, pool: Arc<PoolParams>) -> Result<Self> {
        let keys = MixKeyPair::generate()?;
        let now = now_millis();
        let mut time_status = HashMap::new();
        time_status.insert(MixStatus::ConfirmInput, now);
        Ok(Self {
            mix_id,
            pool,
            keys,
            time_started: now,
            time_status,
            created: None,
            status: MixStatus::ConfirmInput,
            confirming: InputQueue::new(),
            inputs: HashMap::new(),
            bordereaux: HashSet::new(),
            receive_addresses: BTreeSet::new(),
            last_receive_address_rejected: None,
            revealed: HashMap::new(),
            signed: HashSet::new(),
            tx: None,
            fail_reason: None,
            fail_info: None,
        })
    }

    /// Opaque round id, also the key of the round table.
    pub fn id(&self) -> &str {
        &self.mix_id
    }

    pub fn pool(&self) -> &Arc<PoolParams> {
        &self.pool
    }

    /// RSA keypair that blind-signs this round's bordereaux.
    pub fn keys(&self) -> &MixKeyPair {
        &self.keys
    }

    pub fn status(&self) -> MixStatus {
        self.status
    }

    /// Enter `status` and stamp the transition time.
    pub fn set_status(&mut self, status: MixStatus) {
        self.status = status;
        self.time_status.insert(status, now_millis());
    }

    pub fn time_started(&self) -> u64 {
        self.time_started
    }

    /// Unix millis at which the round entered `status`, if it ever did.
    pub fn time_status(&self, status: MixStatus) -> Option<u64> {
        self.time_status.get(&status).copied()
    }

    /// Started and not concluded: past CONFIRM_INPUT, not yet SUCCESS/FAIL.
    pub fn is_already_started(&self) -> bool {
        !matches!(self.status, MixStatus::ConfirmInput | MixStatus::Success | MixStatus::Fail)
    }

    // ─── Confirming inputs ───

    pub fn has_confirming_input(&self, outpoint: &OutPoint) -> bool {
        self.confirming.has_input(outpoint)
    }

    /// Record an invited input. The first invite starts the round's duration.
    pub fn register_confirming_input(&mut self, input: RegisteredInput) -> CoordinatorResult<()> {
        self.confirming.register(input)?;
        if self.created.is_none() {
            let now = now_millis();
            self.time_status.insert(MixStatus::ConfirmInput, now);
            self.created = Some(now);
        }
        Ok(())
    }

    /// Take back the pending invite of `username`, if any.
    pub fn remove_confirming_by_username(&mut self, username: &str) -> Option<RegisteredInput> {
        let removed = self.confirming.remove_by_username(username);
        if removed.is_some() {
            tracing::info!("[{}] {} unregistered from confirming inputs", self.mix_id, username);
        }
        removed
    }

    /// Drop every pending invite, handing the inputs back for requeueing.
    pub fn clear_confirming(&mut self) -> Vec<RegisteredInput> {
        self.confirming.clear()
    }

    pub fn nb_confirming(&self) -> usize {
        self.confirming.len()
    }

    // ─── Confirmed inputs ───

    /// Confirmed inputs, in no particular order.
    pub fn inputs(&self) -> impl Iterator<Item = &ConfirmedInput> {
        self.inputs.values()
    }

    pub fn input_by_username(&self, username: &str) -> Option<&ConfirmedInput> {
        self.inputs.values().find(|i| i.username() == username)
    }

    /// Confirmed input spending from `address` (case-insensitive).
    pub fn input_by_address(&self, address: &str) -> Option<&ConfirmedInput> {
        self.inputs
            .values()
            .find(|i| i.input.outpoint.address.eq_ignore_ascii_case(address))
    }

    pub fn find_input(&self, outpoint: &OutPoint) -> Option<&ConfirmedInput> {
        self.inputs.get(&outpoint_key(outpoint))
    }

    pub fn nb_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn nb_must_mix(&self) -> usize {
        self.inputs.values().filter(|i| !i.input.liquidity).count()
    }

    pub fn nb_liquidities(&self) -> usize {
        self.inputs.values().filter(|i| i.input.liquidity).count()
    }

    /// Sum of the miner fees brought by must-mix inputs.
    pub fn miner_fee_accumulated(&self) -> u64 {
        self.inputs
            .values()
            .filter(|i| !i.input.liquidity)
            .map(|i| i.input.miner_fee(self.pool.denomination))
            .sum()
    }

    /// Admit a confirmed input. A second confirmation of the same outpoint is
    /// rejected as already registered.
    pub fn register_input(&mut self, confirmed: ConfirmedInput) -> CoordinatorResult<()> {
        let key = confirmed.input.outpoint.key();
        if self.inputs.contains_key(&key) {
            return Err(CoordinatorError::already_registered("input already registered"));
        }
        self.inputs.insert(key, confirmed);
        Ok(())
    }

    /// Evict a confirmed input, e.g. spent elsewhere or its session gone.
    pub fn unregister_input(&mut self, outpoint: &OutPoint) -> Option<ConfirmedInput> {
        let removed = self.inputs.remove(&outpoint_key(outpoint));
        if let Some(input) = &removed {
            tracing::info!("[{}] {} unregistering a CONFIRMED input", self.mix_id, input.username());
        }
        removed
    }

    /// Enough must-mix inputs, and together they pay the round's miner fee.
    pub fn has_min_must_mix_and_fee_reached(&self) -> bool {
        self.nb_must_mix() >= self.pool.min_must_mix
            && self.miner_fee_accumulated() >= self.pool.miner_fee_mix()
    }

    /// Liquidity inputs still missing to reach the pool's minimum.
    pub fn min_liquidity_remaining(&self) -> usize {
        self.pool.min_liquidity.saturating_sub(self.nb_liquidities())
    }

    pub fn has_min_liquidity_reached(&self) -> bool {
        self.min_liquidity_remaining() == 0
    }

    /// Confirmed inputs reached the anonymity set.
    pub fn is_full(&self) -> bool {
        self.nb_inputs() >= self.pool.anonymity_set
    }

    /// Hash over the confirmed outpoints; output-phase calls address the round by it.
    pub fn compute_inputs_hash(&self) -> String {
        let outpoints: Vec<OutPoint> = self.inputs.values().map(|i| i.input.outpoint.outpoint()).collect();
        compute_inputs_hash(&outpoints)
    }

    /// Admission guards re-run each time an input is invited or confirmed.
    ///
    /// `QueueInstead` when the round moved under the input, `Rejected` for an
    /// outpoint that is already confirmed.
    pub fn check_admission(
        &self,
        input: &RegisteredInput,
        user_hash: Option<&str>,
        limits: &RegisterInputConfig,
    ) -> CoordinatorResult<()> {
        let pool = &self.pool;

        if self.status != MixStatus::ConfirmInput {
            return Err(CoordinatorError::queue_instead("Mix already started"));
        }
        if self.is_full() {
            return Err(CoordinatorError::queue_instead("Current mix is full"));
        }

        if input.liquidity {
            // keep room for minMustMix
            let must_mix_slots = pool.anonymity_set as i64 - (self.nb_liquidities() as i64 + 1);
            if must_mix_slots < pool.min_must_mix as i64 {
                return Err(CoordinatorError::queue_instead("Current mix is full for liquidity"));
            }
        } else {
            // keep room for minLiquidity
            let liquidity_slots = pool.anonymity_set as i64 - (self.nb_must_mix() as i64 + 1);
            if liquidity_slots < pool.min_liquidity as i64 {
                return Err(CoordinatorError::queue_instead("Current mix is full for mustMix"));
            }
            // last mustMix slot must complete the miner fee
            if liquidity_slots == pool.min_liquidity as i64 {
                let total = self.miner_fee_accumulated() + input.miner_fee(pool.denomination);
                if total < pool.miner_fee_mix() {
                    tracing::warn!(
                        "[{}] Queueing last mustMix: insufficient minerFees, {} sats missing. {}",
                        pool.pool_id,
                        pool.miner_fee_mix() - total,
                        input
                    );
                    return Err(CoordinatorError::queue_instead(
                        "Not enough minerFee for last mustMix slot",
                    ));
                }
            }
        }

        if let Some(user_hash) = user_hash {
            let same_user = self.inputs.values().filter(|i| i.user_hash == user_hash).count();
            if same_user + 1 > limits.max_inputs_same_user_hash {
                return Err(CoordinatorError::queue_instead(
                    "Your wallet already registered for this mix",
                ));
            }
        }

        let txid = input.outpoint.hash;
        let same_hash = self.inputs.values().filter(|i| i.input.outpoint.hash == txid).count();
        if same_hash + 1 > limits.max_inputs_same_hash {
            return Err(CoordinatorError::queue_instead(
                "Current mix is full for inputs with same hash",
            ));
        }

        if self.input_by_address(&input.outpoint.address).is_some() {
            return Err(CoordinatorError::queue_instead(
                "Current mix is full for inputs with same address",
            ));
        }

        if self.find_input(&input.outpoint.outpoint()).is_some() {
            return Err(CoordinatorError::already_registered("Input already confirmed"));
        }
        Ok(())
    }

    // ─── Outputs ───

    /// Claim a receive address with the bordereau that authorized it.
    pub fn register_output(&mut self, receive_address: String, bordereau: Vec<u8>) {
        self.receive_addresses.insert(receive_address);
        self.bordereaux.insert(bordereau);
    }

    pub fn receive_addresses(&self) -> &BTreeSet<String> {
        &self.receive_addresses
    }

    pub fn has_receive_address(&self, address: &str) -> bool {
        self.receive_addresses.contains(address)
    }

    pub fn has_bordereau(&self, bordereau: &[u8]) -> bool {
        self.bordereaux.contains(bordereau)
    }

    /// Remember the last address refused at REGISTER_OUTPUT; a disconnect
    /// reports it next to the blamed inputs.
    pub fn set_last_receive_address_rejected(&mut self, address: Option<String>) {
        self.last_receive_address_rejected = address;
    }

    pub fn last_receive_address_rejected(&self) -> Option<&str> {
        self.last_receive_address_rejected.as_deref()
    }

    pub fn has_revealed_username(&self, username: &str) -> bool {
        self.revealed.contains_key(username)
    }

    pub fn has_revealed_address(&self, address: &str) -> bool {
        self.revealed.values().any(|a| a == address)
    }

    /// Record that `username` proved ownership of `address` during REVEAL_OUTPUT.
    pub fn add_revealed_output(&mut self, username: &str, address: &str) {
        self.revealed.insert(username.to_string(), address.to_string());
    }

    pub fn nb_revealed(&self) -> usize {
        self.revealed.len()
    }

    // ─── Signatures ───

    pub fn is_signed_by(&self, username: &str) -> bool {
        self.signed.contains(username)
    }

    /// Mark `username`'s input as carrying a verified witness.
    pub fn set_signed_by(&mut self, username: &str) {
        self.signed.insert(username.to_string());
    }

    pub fn nb_signatures(&self) -> usize {
        self.signed.len()
    }

    /// Joint transaction, built on entering SIGNING. Witnesses fill in as
    /// signatures arrive.
    pub fn tx(&self) -> Option<&Transaction> {
        self.tx.as_ref()
    }

    pub fn tx_mut(&mut self) -> Option<&mut Transaction> {
        self.tx.as_mut()
    }

    pub fn set_tx(&mut self, tx: Transaction) {
        self.tx = Some(tx);
    }

    // ─── Failure ───

    /// Reason and details reported in the round summary. `info` lists the
    /// blamed outpoints, or the node's rejection reason for a broadcast.
    pub fn set_fail(&mut self, reason: FailReason, info: Option<String>) {
        self.fail_reason = Some(reason);
        self.fail_info = info;
    }

    pub fn fail_reason(&self) -> Option<FailReason> {
        self.fail_reason
    }

    pub fn fail_info(&self) -> Option<&str> {
        self.fail_info.as_deref()
    }

    /// Remove a session from the round. Returns the confirmed inputs to blame
    /// if the round was already past CONFIRM_INPUT, else nothing.
    pub fn on_disconnect(&mut self, username: &str) -> Vec<ConfirmedInput> {
        self.remove_confirming_by_username(username);

        let outpoints: Vec<OutPoint> = self
            .inputs
            .values()
            .filter(|i| i.username() == username)
            .map(|i| i.input.outpoint.outpoint())
            .collect();
        if outpoints.is_empty() {
            return Vec::new();
        }
        let already_started = self.is_already_started();
        let removed: Vec<ConfirmedInput> =
            outpoints.iter().filter_map(|o| self.unregister_input(o)).collect();
        if already_started { removed } else { Vec::new() }
    }

    // ─── Reporting ───

    /// Total value of the confirmed inputs, in sats.
    pub fn amount_in(&self) -> u64 {
        self.inputs.values().map(|i| i.input.outpoint.value).sum()
    }

    /// One denomination per registered output.
    pub fn amount_out(&self) -> u64 {
        self.receive_addresses.len() as u64 * self.pool.denomination
    }

    /// Seconds since the first invite, 0 if nobody was invited yet.
    pub fn duration_secs(&self) -> u64 {
        self.created
            .map(|c| now_millis().saturating_sub(c) / 1000)
            .unwrap_or(0)
    }

    /// Record persisted when the round concludes.
    pub fn summary(&self) -> MixSummary {
        MixSummary {
            mix_id: self.mix_id.clone(),
            pool_id: self.pool.pool_id.clone(),
            status: self.status,
            fail_reason: self.fail_reason,
            fail_info: self.fail_info.clone(),
            nb_must_mix: self.nb_must_mix(),
            nb_liquidities: self.nb_liquidities(),
            anonymity_set: self.pool.anonymity_set,
            amount_in: self.amount_in(),
            amount_out: self.amount_out(),
            txid: self.tx.as_ref().map(|tx| tx.txid().to_string()),
            duration_secs: self.duration_secs(),
            finished_at: now_millis(),
        }
    }

    /// Live view for status queries.
    pub fn snapshot(&self) -> MixStatusSnapshot {
        MixStatusSnapshot {
            mix_id: self.mix_id.clone(),
            pool_id: self.pool.pool_id.clone(),
            status: self.status,
            nb_inputs: self.nb_inputs(),
            nb_must_mix: self.nb_must_mix(),
            nb_liquidities: self.nb_liquidities(),
            nb_confirming: self.nb_confirming(),
            nb_outputs: self.receive_addresses.len(),
            anonymity_set: self.pool.anonymity_set,
            miner_fee_accumulated: self.miner_fee_accumulated(),
            elapsed_secs: now_millis().saturating_sub(self.time_started) / 1000,
        }
    }
}

impl std::fmt::Debug for Mix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mix")
            .field("mix_id", &self.mix_id)
            .field("pool", &self.pool.pool_id)
            .field("status", &self.status)
            .field("inputs", &self.inputs.len())
            .field("confirming", &self.confirming.len())
            .finish()
    }
}
