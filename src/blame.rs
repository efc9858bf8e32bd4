//! Blames and temporary bans.
//!
//! Misbehaving inputs are blamed under an identifier: the whole Tx0 txid for
//! a must-mix input, `txid:index` for a liquidity. Once an identifier
//! collects `ban.blames` blames within `ban.period_secs` it is banned; each
//! repeat ban lasts `recidivism_factor` times longer than the previous one.

use crate::config::BanConfig;
use crate::core::types::{now_millis, BlameReason, RegisteredInput};
use crate::metrics::Metrics;
use crate::storage::{BanRecord, BlameRecord, Storage};
use anyhow::Result;
use bitcoin::Txid;

/// Identifier a blame or ban is recorded under.
pub fn blame_identifier(txid: &Txid, index: u32, liquidity: bool) -> String {
    if liquidity {
        format!("{}:{}", txid, index)
    } else {
        txid.to_string()
    }
}

#[derive(Clone)]
pub struct BanService {
    storage: Storage,
    config: BanConfig,
    metrics: Metrics,
}

impl BanService {
    pub fn new(storage: Storage, config: BanConfig, metrics: Metrics) -> Self {
        Self { storage, config, metrics }
    }

    /// Record a blame and ban the identifier if it crossed the threshold.
    pub fn blame(&self, input: &RegisteredInput, reason: BlameReason, mix_id: &str) -> Result<()> {
        self.blame_at(input, reason, mix_id, now_millis())
    }

    pub fn blame_at(&self, input: &RegisteredInput, reason: BlameReason, mix_id: &str, now: u64) -> Result<()> {
        let identifier = blame_identifier(&input.outpoint.hash, input.outpoint.index, input.liquidity);
        tracing::warn!("[{}] blame {} for {:?}: {}", mix_id, identifier, reason, input);
        self.storage.save_blame(&BlameRecord {
            identifier: identifier.clone(),
            reason,
            mix_id: mix_id.to_string(),
            ip: input.ip.clone(),
            created: now,
        })?;
        self.metrics.inc_blames();

        let since = now.saturating_sub(self.config.period_secs * 1000);
        let active: Vec<BlameRecord> = self
            .storage
            .find_blames(&identifier)?
            .into_iter()
            .filter(|b| b.created > since)
            .collect();

        let remaining = self.config.blames.saturating_sub(active.len());
        if remaining > 0 {
            tracing::info!(
                "{} active blames found for {} -> {} blames remaining before ban",
                active.len(),
                identifier,
                remaining
            );
            return Ok(());
        }

        let reasons: Vec<String> = active.iter().map(|b| format!("{:?}", b.reason)).collect();
        let notes = format!(
            "{} blames in {}min: {}",
            active.len(),
            self.config.period_secs / 60,
            reasons.join(", ")
        );
        tracing::warn!("{} active blames found for {} -> ban", active.len(), identifier);
        self.ban_temporary_at(&identifier, None, Some(notes), now)?;
        Ok(())
    }

    /// Ban for `expiration_secs`, or the last ban's length times the
    /// recidivism factor if the identifier was banned before.
    pub fn ban_temporary_at(
        &self,
        identifier: &str,
        response: Option<String>,
        notes: Option<String>,
        now: u64,
    ) -> Result<BanRecord> {
        let last = self.storage.find_bans(identifier)?.into_iter().last();
        let duration = match last.as_ref().and_then(BanRecord::duration) {
            Some(previous) => {
                let next = previous.saturating_mul(self.config.recidivism_factor);
                tracing::debug!(
                    "ban recidivism {}: lastBanDuration={}min -> {}min",
                    identifier,
                    previous / 60_000,
                    next / 60_000
                );
                next
            }
            None => self.config.expiration_secs * 1000,
        };
        let ban = BanRecord {
            identifier: identifier.to_string(),
            created: now,
            expiration: Some(now.saturating_add(duration)),
            response: response.unwrap_or_else(|| "Banned from service".to_string()),
            notes,
        };
        self.storage.save_ban(&ban)?;
        self.metrics.inc_bans();
        Ok(ban)
    }

    /// Active ban on the Tx0 `txid` or on `txid:index` itself.
    pub fn find_active_ban(&self, txid: &Txid, index: u32) -> Result<Option<BanRecord>> {
        self.find_active_ban_at(txid, index, now_millis())
    }

    pub fn find_active_ban_at(&self, txid: &Txid, index: u32, now: u64) -> Result<Option<BanRecord>> {
        for liquidity in [false, true] {
            let identifier = blame_identifier(txid, index, liquidity);
            let active = self
                .storage
                .find_bans(&identifier)?
                .into_iter()
                .find(|ban| ban.is_active(now));
            if active.is_some() {
                return Ok(active);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TxOutPoint;
    use bitcoin::Script;
    use std::str::FromStr;

    const HOUR: u64 = 3_600_000;

    fn service() -> BanService {
        let config = BanConfig { blames: 2, period_secs: 3_600, expiration_secs: 7_200, recidivism_factor: 3 };
        BanService::new(Storage::temporary().unwrap(), config, Metrics::new())
    }

    fn txid() -> Txid {
        Txid::from_str(&"cd".repeat(32)).unwrap()
    }

    fn input(index: u32, liquidity: bool) -> RegisteredInput {
        let value = if liquidity { 1_000_000 } else { 1_000_300 };
        let outpoint = TxOutPoint {
            hash: txid(),
            index,
            value,
            confirmations: 1,
            script_pubkey: Script::new(),
            address: "tb1q".into(),
        };
        RegisteredInput::new("0.01btc", "alice", liquidity, outpoint, "1.1.1.1")
    }

    #[test]
    fn identifiers() {
        assert_eq!(blame_identifier(&txid(), 3, false), "cd".repeat(32));
        assert_eq!(blame_identifier(&txid(), 3, true), format!("{}:3", "cd".repeat(32)));
    }

    #[test]
    fn must_mix_ban_covers_whole_tx0() {
        let s = service();
        let now = 100 * HOUR;
        s.blame_at(&input(2, false), BlameReason::Disconnect, "m1", now).unwrap();
        assert!(s.find_active_ban_at(&txid(), 2, now).unwrap().is_none());

        s.blame_at(&input(2, false), BlameReason::Signing, "m2", now + 1).unwrap();
        let ban = s.find_active_ban_at(&txid(), 2, now + 2).unwrap().unwrap();
        assert!(ban.notes.unwrap().contains("2 blames in 60min"));
        for index in [0, 1, 100] {
            assert!(s.find_active_ban_at(&txid(), index, now + 2).unwrap().is_some());
        }
        assert!(s.find_active_ban_at(&txid(), 0, now + 1 + 2 * HOUR).unwrap().is_none());
    }

    #[test]
    fn liquidity_ban_covers_single_utxo() {
        let s = service();
        let now = 100 * HOUR;
        s.blame_at(&input(4, true), BlameReason::Disconnect, "m1", now).unwrap();
        s.blame_at(&input(4, true), BlameReason::Disconnect, "m2", now).unwrap();
        assert!(s.find_active_ban_at(&txid(), 4, now).unwrap().is_some());
        assert!(s.find_active_ban_at(&txid(), 5, now).unwrap().is_none());
    }

    #[test]
    fn blames_outside_period_are_ignored() {
        let s = service();
        let now = 100 * HOUR;
        s.blame_at(&input(0, false), BlameReason::Disconnect, "m1", now).unwrap();
        s.blame_at(&input(0, false), BlameReason::Disconnect, "m2", now + 2 * HOUR).unwrap();
        assert!(s.find_active_ban_at(&txid(), 0, now + 2 * HOUR).unwrap().is_none());
    }

    #[test]
    fn recidivism_multiplies_ban_duration() {
        let s = service();
        let first = s.ban_temporary_at("x", None, None, 0).unwrap();
        assert_eq!(first.duration(), Some(2 * HOUR));
        let second = s.ban_temporary_at("x", None, None, 10 * HOUR).unwrap();
        assert_eq!(second.duration(), Some(6 * HOUR));
        let third = s.ban_temporary_at("x", None, None, 20 * HOUR).unwrap();
        assert_eq!(third.duration(), Some(18 * HOUR));
        assert_eq!(s.metrics.snapshot().bans, 3);
    }
}
