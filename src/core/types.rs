use bitcoin::{OutPoint, Script, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque round identifier (hex of 16 random bytes).
pub type MixId = String;

/// Source IP reported by the transport for sessions arriving over Tor.
pub const IP_TOR: &str = "127.0.0.1";

/// Reserved utxo hash used by monitoring clients; never a real input.
pub const HEALTH_CHECK_UTXO: &str = "HEALTH_CHECK";

/// An outpoint resolved against the chain: value, depth, and the script it
/// pays to. Everything the coordinator needs to judge an input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutPoint {
    pub hash: Txid,
    pub index: u32,
    pub value: u64,
    pub confirmations: u32,
    pub script_pubkey: Script,
    pub address: String,
}

impl TxOutPoint {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.hash, self.index)
    }

    /// `txid:index`, the key used by queues, rounds and ban lookups.
    pub fn key(&self) -> String {
        outpoint_key(&self.outpoint())
    }
}

impl fmt::Display for TxOutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({} sats, {} confs)", self.hash, self.index, self.value, self.confirmations)
    }
}

pub fn outpoint_key(outpoint: &OutPoint) -> String {
    format!("{}:{}", outpoint.txid, outpoint.vout)
}

/// An admitted, signature-verified input waiting in a pool queue or in a
/// round's confirming set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredInput {
    pub pool_id: String,
    pub username: String,
    pub liquidity: bool,
    pub outpoint: TxOutPoint,
    pub ip: String,
    /// Anti-Sybil hash from the last confirmation attempt, if any.
    pub last_user_hash: Option<String>,
}

impl RegisteredInput {
    pub fn new(
        pool_id: &str,
        username: &str,
        liquidity: bool,
        outpoint: TxOutPoint,
        ip: &str,
    ) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            username: username.to_string(),
            liquidity,
            outpoint,
            ip: ip.to_string(),
            last_user_hash: None,
        }
    }

    pub fn is_tor(&self) -> bool {
        self.ip == IP_TOR
    }

    /// Miner fee this input brings to the round: whatever exceeds the denomination.
    pub fn miner_fee(&self, denomination: u64) -> u64 {
        self.outpoint.value.saturating_sub(denomination)
    }

    pub fn kind(&self) -> &'static str {
        if self.liquidity { "liquidity" } else { "mustMix" }
    }
}

impl fmt::Display for RegisteredInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "poolId={}, outPoint={}, liquidity={}, username={}, ip={}",
            self.pool_id, self.outpoint, self.liquidity, self.username, self.ip
        )
    }
}

/// A [`RegisteredInput`] that completed the blind-signature exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedInput {
    pub input: RegisteredInput,
    pub user_hash: String,
}

impl ConfirmedInput {
    pub fn username(&self) -> &str {
        &self.input.username
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MixStatus {
    ConfirmInput,
    RegisterOutput,
    Signing,
    RevealOutput,
    Success,
    Fail,
}

impl MixStatus {
    pub fn is_over(self) -> bool {
        matches!(self, MixStatus::Success | MixStatus::Fail)
    }
}

impl fmt::Display for MixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MixStatus::ConfirmInput => "CONFIRM_INPUT",
            MixStatus::RegisterOutput => "REGISTER_OUTPUT",
            MixStatus::Signing => "SIGNING",
            MixStatus::RevealOutput => "REVEAL_OUTPUT",
            MixStatus::Success => "SUCCESS",
            MixStatus::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    FailRegisterOutputs,
    FailSigning,
    FailBroadcast,
    RejectedOutput,
    Disconnect,
    Spent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlameReason {
    Disconnect,
    RegisterOutput,
    Signing,
    Spent,
}

/// Summary persisted when a round concludes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixSummary {
    pub mix_id: MixId,
    pub pool_id: String,
    pub status: MixStatus,
    pub fail_reason: Option<FailReason>,
    pub fail_info: Option<String>,
    pub nb_must_mix: usize,
    pub nb_liquidities: usize,
    pub anonymity_set: usize,
    pub amount_in: u64,
    pub amount_out: u64,
    pub txid: Option<String>,
    pub duration_secs: u64,
    pub finished_at: u64,
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
