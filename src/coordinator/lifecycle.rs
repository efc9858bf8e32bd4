//! Phase transitions, round conclusion, timeouts and disconnects.

use super::Coordinator;
use crate::core::transaction::build_mix_transaction;
use crate::core::types::*;
use crate::mix::Mix;
use crate::notify::ServerMessage;
use anyhow::{Context, Result};
use bitcoin::{Address, OutPoint, Script};
use std::str::FromStr;

impl Coordinator {
    /// Move `mix` to `status` and run the transition's side effects.
    /// Re-entering the current status is refused.
    pub(super) fn change_mix_status(&self, mix: &mut Mix, status: MixStatus) {
        if mix.status() == status {
            tracing::error!("[{}] mix status already set: {}", mix.id(), status);
            return;
        }
        tracing::info!("[{}] {} -> {}", mix.id(), mix.status(), status);

        if status == MixStatus::Signing {
            match build_transaction(mix) {
                Ok(tx) => mix.set_tx(tx),
                Err(e) => {
                    tracing::error!("[{}] unable to build mix transaction: {:#}", mix.id(), e);
                    self.on_mix_over(mix);
                    return;
                }
            }
        }

        mix.set_status(status);

        if status == MixStatus::RegisterOutput {
            // invites still pending are useless now
            for input in mix.clear_confirming() {
                self.inner.pools.requeue(input);
            }
        }

        if status.is_over() {
            self.save_mix_result(mix);
        }

        self.inner.limits.manage(mix.id(), status);

        if status != MixStatus::ConfirmInput {
            let mix_id = mix.id().to_string();
            let message = match status {
                MixStatus::RegisterOutput => {
                    Some(ServerMessage::RegisterOutput { mix_id, inputs_hash: mix.compute_inputs_hash() })
                }
                MixStatus::RevealOutput => Some(ServerMessage::RevealOutput { mix_id }),
                MixStatus::Signing => mix
                    .tx()
                    .map(|tx| ServerMessage::Signing { mix_id, tx: bitcoin::consensus::encode::serialize_hex(tx) }),
                MixStatus::Success => Some(ServerMessage::Success { mix_id }),
                MixStatus::Fail => Some(ServerMessage::Fail { mix_id }),
                MixStatus::ConfirmInput => None,
            };
            if let Some(message) = message {
                self.notify_mixing_users(mix, message);
            }
        }

        if status.is_over() {
            self.on_mix_over(mix);
        }
    }

    fn save_mix_result(&self, mix: &Mix) {
        let summary = mix.summary();
        if let Err(e) = self.inner.storage.save_mix(&summary) {
            tracing::error!("[{}] unable to save mix: {:#}", mix.id(), e);
        }
        match mix.status() {
            MixStatus::Success => {
                self.inner.metrics.inc_mixes_succeeded();
                if let Some(txid) = &summary.txid {
                    if let Err(e) = self.inner.storage.save_mix_txid(txid, mix.pool().denomination) {
                        tracing::error!("[{}] unable to save mix txid: {:#}", mix.id(), e);
                    }
                }
            }
            _ => self.inner.metrics.inc_mixes_failed(),
        }
    }

    pub(super) fn go_success(&self, mix: &mut Mix) {
        self.change_mix_status(mix, MixStatus::Success);
    }

    /// Fail the round and release the receive addresses it claimed.
    pub(super) fn go_fail(&self, mix: &mut Mix, reason: FailReason, info: Option<String>) {
        if mix.status() == MixStatus::Fail {
            tracing::warn!("[{}] already failed, ignoring {:?}", mix.id(), reason);
            return;
        }
        for address in mix.receive_addresses() {
            if let Err(e) = self.inner.storage.delete_mix_output(address) {
                tracing::error!("[{}] unable to release output {}: {:#}", mix.id(), address, e);
            }
        }
        tracing::warn!("[{}] mix failed: {:?} {}", mix.id(), reason, info.as_deref().unwrap_or(""));
        mix.set_fail(reason, info);
        self.change_mix_status(mix, MixStatus::Fail);
    }

    /// Replace a concluded round with a fresh one in the same pool.
    fn on_mix_over(&self, mix: &mut Mix) {
        self.inner.limits.unmanage(mix.id());
        let leftovers = mix.clear_confirming();
        let pool = match self.inner.pools.get(&mix.pool().pool_id) {
            Ok(pool) => pool.clone(),
            Err(e) => {
                tracing::error!("[{}] {}", mix.id(), e);
                return;
            }
        };
        if let Err(e) = self.start_mix(&pool, leftovers) {
            tracing::error!("[{}] unable to start next mix: {:#}", pool.id(), e);
        }
    }

    pub(super) fn blame(&self, mix: &Mix, input: &ConfirmedInput, reason: BlameReason) {
        if let Err(e) = self.inner.bans.blame(&input.input, reason, mix.id()) {
            tracing::error!("[{}] unable to blame {}: {:#}", mix.id(), input.input.outpoint, e);
        }
    }

    // ─── Timeouts ───

    pub(super) fn on_timeout(&self, mix_id: &str, status: MixStatus) {
        let Ok(mix) = self.get_mix(mix_id) else {
            self.inner.limits.unmanage(mix_id);
            return;
        };
        let mut mix = mix.lock();
        if mix.status() != status {
            // moved on since the deadline was read
            return;
        }
        tracing::debug!("[{}] {} timeout", mix_id, status);
        match status {
            MixStatus::ConfirmInput => {
                if self.inner.config.mix_enabled {
                    self.invite_inputs(&mut mix);
                    // a full round whose last readiness check hit a chain error
                    if self.is_confirm_input_ready(&mut mix) {
                        self.change_mix_status(&mut mix, MixStatus::RegisterOutput);
                        return;
                    }
                }
                self.inner.limits.reset(mix_id);
            }
            MixStatus::RegisterOutput => self.on_register_output_timeout(&mut mix),
            MixStatus::RevealOutput => self.blame_for_reveal_output(&mut mix),
            MixStatus::Signing => self.blame_for_signing(&mut mix),
            MixStatus::Success | MixStatus::Fail => self.inner.limits.unmanage(mix_id),
        }
    }

    // ─── Disconnect ───

    /// Forget a session everywhere. Inputs it held in a started round are
    /// blamed and that round fails.
    pub fn on_disconnect(&self, username: &str) {
        let dequeued = self.inner.pools.remove_by_username(username);
        if !dequeued.is_empty() {
            tracing::info!("{} disconnected, {} queued inputs removed", username, dequeued.len());
        }

        for mix in self.current_mixes() {
            let mut mix = mix.lock();
            if mix.status() == MixStatus::Fail {
                continue;
            }
            let last_rejected = mix.last_receive_address_rejected().map(str::to_string);
            let blamed = mix.on_disconnect(username);
            if blamed.is_empty() {
                continue;
            }
            for input in &blamed {
                self.blame(&mix, input, BlameReason::Disconnect);
            }
            let mut info = super::outpoint_keys(&blamed);
            if let Some(address) = last_rejected {
                info.push(' ');
                info.push_str(&address);
            }
            self.go_fail(&mut mix, FailReason::Disconnect, Some(info));
        }
    }
}

/// Unsigned mix transaction from the confirmed inputs and registered outputs.
fn build_transaction(mix: &Mix) -> Result<bitcoin::Transaction> {
    let outpoints: Vec<OutPoint> = mix.inputs().map(|i| i.input.outpoint.outpoint()).collect();
    let scripts = mix
        .receive_addresses()
        .iter()
        .map(|a| Address::from_str(a).map(|a| a.script_pubkey()).with_context(|| format!("receive address {}", a)))
        .collect::<Result<Vec<Script>>>()?;
    Ok(build_mix_transaction(&outpoints, &scripts, mix.pool().denomination))
}
