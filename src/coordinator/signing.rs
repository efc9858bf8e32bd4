//! SIGNING: collect one witness per confirmed input, then broadcast.

use super::Coordinator;
use crate::core::transaction::{find_input_index, verify_input_witness, verify_signed_transaction};
use crate::core::types::*;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::mix::Mix;
use anyhow::anyhow;
use bitcoin::{OutPoint, Witness};
use std::collections::HashMap;

impl Coordinator {
    /// Attach and verify the witness of `username`'s input. The last valid
    /// signature triggers full verification and broadcast.
    ///
    /// Only P2WPKH inputs are signable: `witness` is `[signature, pubkey]`.
    /// An invalid witness is refused and the input stays unsigned, so the
    /// session may retry until the SIGNING deadline. A refused broadcast is
    /// returned to this last signer as `PUSHTX_ERROR`.
    pub fn register_signature(&self, mix_id: &str, username: &str, witness: &[Vec<u8>]) -> CoordinatorResult<()> {
        let mix = self.get_mix(mix_id)?;
        let mut mix = mix.lock();
        Self::expect_status(&mix, MixStatus::Signing)?;

        let input = mix.input_by_username(username).cloned().ok_or_else(|| {
            CoordinatorError::input_rejected(format!("Input not found for signing username={}", username))
        })?;
        if mix.is_signed_by(username) {
            return Err(CoordinatorError::already_registered(format!(
                "User already signed, username={}",
                username
            )));
        }

        let outpoint = input.input.outpoint.outpoint();
        let tx = mix.tx_mut().ok_or_else(|| anyhow!("mix {} has no transaction", mix_id))?;
        let index = find_input_index(tx, &outpoint)
            .ok_or_else(|| anyhow!("input {} not in mix transaction", outpoint))?;

        tx.input[index].witness = Witness::from_vec(witness.to_vec());
        let outpoint_details = &input.input.outpoint;
        if let Err(e) = verify_input_witness(tx, index, &outpoint_details.script_pubkey, outpoint_details.value) {
            tx.input[index].witness = Witness::new();
            tracing::warn!("[{}] {} invalid signature: {}", mix_id, username, e);
            return Err(CoordinatorError::invalid_argument("Invalid signature"));
        }

        mix.set_signed_by(username);
        tracing::info!("[{}] {} signed ({}/{})", mix_id, username, mix.nb_signatures(), mix.nb_inputs());

        if self.is_register_signatures_ready(&mut mix) {
            self.broadcast(&mut mix)?;
        }
        Ok(())
    }

    /// Every confirmed input signed, and the round still passes the
    /// REGISTER_OUTPUT readiness checks (nothing spent in the meantime).
    fn is_register_signatures_ready(&self, mix: &mut Mix) -> bool {
        if !self.is_register_output_ready(mix) {
            return false;
        }
        mix.nb_signatures() == mix.nb_inputs()
    }

    /// Verify the fully signed transaction and push it. Either outcome ends
    /// the round.
    fn broadcast(&self, mix: &mut Mix) -> CoordinatorResult<()> {
        let Some(tx) = mix.tx().cloned() else {
            return Err(anyhow!("mix {} has no transaction", mix.id()).into());
        };
        let spent: HashMap<OutPoint, TxOutPoint> = mix
            .inputs()
            .map(|i| (i.input.outpoint.outpoint(), i.input.outpoint.clone()))
            .collect();

        if let Err(e) = verify_signed_transaction(&tx, &spent) {
            tracing::error!("[{}] signed transaction invalid: {:#}", mix.id(), e);
            self.go_fail(mix, FailReason::FailSigning, Some(e.to_string()));
            return Err(e.into());
        }

        match self.inner.chain.broadcast(&tx) {
            Ok(txid) => {
                tracing::info!("[{}] broadcast {}", mix.id(), txid);
                self.go_success(mix);
                Ok(())
            }
            Err(e) => {
                tracing::error!("[{}] unable to broadcast {}: {}", mix.id(), tx.txid(), e);
                self.go_fail(mix, FailReason::FailBroadcast, Some(e.reason.clone()));
                Err(e.into())
            }
        }
    }

    /// SIGNING deadline: blame whoever did not sign and fail the round.
    pub(super) fn blame_for_signing(&self, mix: &mut Mix) {
        let missing: Vec<ConfirmedInput> = mix
            .inputs()
            .filter(|i| !mix.is_signed_by(i.username()))
            .cloned()
            .collect();
        for input in &missing {
            self.blame(mix, input, BlameReason::Signing);
        }
        self.go_fail(mix, FailReason::FailSigning, Some(super::outpoint_keys(&missing)));
    }
}
