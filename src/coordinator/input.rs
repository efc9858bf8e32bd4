//! REGISTER_INPUT and CONFIRM_INPUT: admission into a pool queue, invitation
//! into the current round, and blind-signed confirmation.

use super::Coordinator;
use crate::core::message::verify_signed_message;
use crate::core::types::*;
use crate::error::{CoordinatorError, CoordinatorResult, ErrorCode};
use crate::mix::Mix;
use crate::notify::ServerMessage;
use crate::provenance::validate_provenance;
use crate::queue::InputQueue;
use bitcoin::Txid;
use std::str::FromStr;
use std::time::Duration;

/// A session's request to queue one UTXO for mixing.
#[derive(Clone, Debug)]
pub struct InputRegistration {
    pub pool_id: String,
    pub username: String,
    /// Base64 signed message over the pool id by the UTXO's key.
    pub signature: String,
    pub utxo_hash: String,
    pub utxo_index: i64,
    pub liquidity: bool,
    pub ip: String,
}

impl Coordinator {
    // ─── Registration ───

    /// Validate a UTXO against the chain, bans and provenance, then queue it.
    pub fn register_input(&self, request: &InputRegistration) -> CoordinatorResult<RegisteredInput> {
        let result = self.try_register_input(request);
        match &result {
            Ok(input) => {
                self.inner.metrics.inc_inputs_registered();
                tracing::info!("[{}] {} queued {} {}", input.pool_id, input.username, input.kind(), input.outpoint);
            }
            Err(e) => {
                self.inner.metrics.inc_inputs_rejected();
                tracing::warn!(
                    "[{}] {} input rejected {}:{}: {}",
                    request.pool_id,
                    request.username,
                    request.utxo_hash,
                    request.utxo_index,
                    e
                );
            }
        }
        result
    }

    fn try_register_input(&self, request: &InputRegistration) -> CoordinatorResult<RegisteredInput> {
        if request.utxo_hash == HEALTH_CHECK_UTXO {
            return Err(CoordinatorError::input_rejected("HEALTH_CHECK_SUCCESS"));
        }
        let txid = Txid::from_str(&request.utxo_hash)
            .map_err(|_| CoordinatorError::input_rejected("Invalid utxoHash"))?;
        let index = u32::try_from(request.utxo_index)
            .map_err(|_| CoordinatorError::input_rejected("Invalid utxoIndex"))?;

        if let Some(ban) = self.inner.bans.find_active_ban(&txid, index)? {
            tracing::warn!("[{}] banned input {}:{}: {:?}", request.pool_id, txid, index, ban.notes);
            return Err(CoordinatorError::rejected(ErrorCode::InputBanned, ban.response));
        }

        let not_found = || CoordinatorError::input_rejected(format!("UTXO not found: {}-{}", txid, index));
        let tx = self.inner.chain.get_transaction(&txid)?.ok_or_else(not_found)?;
        let outpoint = tx.outpoint(index, self.inner.config.network).ok_or_else(not_found)?;

        match verify_signed_message(&outpoint.address, &request.pool_id, &request.signature) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(CoordinatorError::invalid_argument("Invalid signature")),
        }

        if !self.inner.chain.is_unspent(&outpoint.outpoint())? {
            return Err(CoordinatorError::input_rejected("Waiting for first mix confirmation"));
        }

        if self.inner.config.test_mode {
            tracing::warn!("[TEST_MODE] skipping provenance check for {}", outpoint);
        } else {
            let pool = self.inner.pools.get(&request.pool_id)?;
            validate_provenance(&*self.inner.provenance, &tx, request.liquidity, pool.params())?;
        }

        self.inner.pools.register_input(
            &request.pool_id,
            &request.username,
            request.liquidity,
            outpoint,
            &request.ip,
        )
    }

    // ─── Invitation ───

    /// Pull queued inputs into `mix`, liquidity first, up to what the round
    /// still needs.
    pub(super) fn invite_inputs(&self, mix: &mut Mix) {
        let Ok(pool) = self.inner.pools.get(&mix.pool().pool_id) else { return };
        let anonymity_set = mix.pool().anonymity_set;
        let nb_inputs = mix.nb_inputs();
        let min_liquidity_remaining = mix.min_liquidity_remaining();

        let liquidities_to_add = if mix.has_min_must_mix_and_fee_reached() {
            anonymity_set.saturating_sub(nb_inputs)
        } else {
            min_liquidity_remaining
        };

        let mut guard = pool.lock();
        let state = &mut *guard;

        let mut liquidities_invited = 0;
        if liquidities_to_add > 0 && state.liquidity.has_inputs() {
            liquidities_invited = self.invite_from_queue(mix, &mut state.liquidity, liquidities_to_add);
        }

        let must_mix_to_add =
            anonymity_set.saturating_sub(min_liquidity_remaining.max(nb_inputs + liquidities_invited));
        if must_mix_to_add > 0 && state.must_mix.has_inputs() {
            self.invite_from_queue(mix, &mut state.must_mix, must_mix_to_add);
        }
    }

    fn invite_from_queue(&self, mix: &mut Mix, queue: &mut InputQueue, max: usize) -> usize {
        let limits = &self.inner.config.register_input;
        let mut invited = 0;
        let mut refused = Vec::new();
        while invited < max {
            let candidate = queue.remove_random(|input| {
                mix.check_admission(input, input.last_user_hash.as_deref(), limits).is_ok()
            });
            let Some(input) = candidate else { break };
            match self.invite(mix, input) {
                Ok(()) => invited += 1,
                Err(input) => refused.push(input),
            }
        }
        // the pool lock is already held by the caller
        for input in refused {
            let username = input.username.clone();
            if let Err(e) = queue.register(input) {
                tracing::warn!("[{}] {} not requeued: {}", mix.id(), username, e);
            }
        }
        invited
    }

    /// Hands the input back when the round refuses it.
    fn invite(&self, mix: &mut Mix, input: RegisteredInput) -> Result<(), RegisteredInput> {
        let username = input.username.clone();
        tracing::info!("[{}] {} inviting {} to mix: {}", mix.id(), username, input.kind(), input.outpoint);
        if let Err(e) = mix.register_confirming_input(input.clone()) {
            tracing::error!("[{}] {} invite failed: {}", mix.id(), username, e);
            return Err(input);
        }
        let message = ServerMessage::ConfirmInput {
            mix_id: mix.id().to_string(),
            public_key: hex::encode(mix.keys().public_key_der()),
        };
        let notifier = self.inner.notifier.clone();
        self.run_later(Duration::from_millis(self.inner.config.delays.invite_ms), move || {
            notifier.send_private(&username, message)
        });
        Ok(())
    }

    // ─── Confirmation ───

    /// Blind-sign the bordereau of an invited input and admit it.
    ///
    /// `QueueInstead` means the round moved under the input; it has already
    /// been put back in its pool queue and the caller should stay silent.
    pub fn confirm_input(
        &self,
        mix_id: &str,
        username: &str,
        blinded_bordereau: &[u8],
        user_hash: &str,
    ) -> CoordinatorResult<Vec<u8>> {
        let mix = self.get_mix(mix_id)?;
        let signed = {
            let mut mix = mix.lock();
            let mut input = mix.remove_confirming_by_username(username).ok_or_else(|| {
                CoordinatorError::rejected(
                    ErrorCode::ServerError,
                    format!("Confirming input not found: username={}", username),
                )
            })?;
            input.last_user_hash = Some(user_hash.to_string());

            if let Err(e) = mix.check_admission(&input, Some(user_hash), &self.inner.config.register_input) {
                if let CoordinatorError::QueueInstead { reason } = &e {
                    tracing::info!("[{}] {} queued back: {}", mix_id, username, reason);
                    self.inner.pools.requeue(input);
                }
                return Err(e);
            }

            let signed = mix
                .keys()
                .blind_sign(blinded_bordereau)
                .map_err(|_| CoordinatorError::invalid_argument("Invalid blindedBordereau"))?;
            mix.register_input(ConfirmedInput { input, user_hash: user_hash.to_string() })?;
            self.inner.metrics.inc_inputs_confirmed();

            tracing::info!("[{}] {} confirmed input", mix_id, username);
            self.log_mix_status(&mix);
            self.notify(
                username,
                ServerMessage::ConfirmedInput { mix_id: mix_id.to_string(), signed_bordereau: hex::encode(&signed) },
            );
            signed
        };

        let this = self.clone();
        let mix_id = mix_id.to_string();
        self.run_later(Duration::from_millis(self.inner.config.delays.confirm_check_ms), move || {
            this.check_confirm_input_ready(&mix_id)
        });
        Ok(signed)
    }

    /// Advance to REGISTER_OUTPUT once the round is full and balanced.
    pub(super) fn check_confirm_input_ready(&self, mix_id: &str) {
        if !self.inner.config.mix_enabled {
            return;
        }
        let Ok(mix) = self.get_mix(mix_id) else { return };
        let mut mix = mix.lock();
        if mix.status() == MixStatus::ConfirmInput && self.is_confirm_input_ready(&mut mix) {
            self.change_mix_status(&mut mix, MixStatus::RegisterOutput);
        }
    }

    pub(super) fn is_confirm_input_ready(&self, mix: &mut Mix) -> bool {
        if !mix.is_full() {
            return false;
        }
        if !mix.has_min_must_mix_and_fee_reached() {
            return false;
        }
        if !mix.has_min_liquidity_reached() {
            return false;
        }
        // last chance to catch an input spent elsewhere
        self.revalidate_inputs_for_spent(mix)
    }

    /// Evict confirmed inputs spent since they joined. Once the round has
    /// started, their owners are blamed and the round fails.
    fn revalidate_inputs_for_spent(&self, mix: &mut Mix) -> bool {
        let mut spent = Vec::new();
        for input in mix.inputs() {
            let outpoint = input.input.outpoint.outpoint();
            match self.inner.chain.is_unspent(&outpoint) {
                Ok(true) => {}
                Ok(false) => spent.push(outpoint),
                Err(e) => {
                    tracing::error!("[{}] unable to check {}: {:#}", mix.id(), outpoint, e);
                    return false;
                }
            }
        }
        if spent.is_empty() {
            return true;
        }

        let already_started = mix.is_already_started();
        let removed: Vec<ConfirmedInput> = spent.iter().filter_map(|o| mix.unregister_input(o)).collect();
        for input in &removed {
            tracing::warn!("[{}] {} input spent in the meantime: {}", mix.id(), input.username(), input.input.outpoint);
        }
        if already_started {
            for input in &removed {
                self.blame(mix, input, BlameReason::Spent);
            }
            self.go_fail(mix, FailReason::Spent, Some(super::outpoint_keys(&removed)));
        }
        false
    }
}
