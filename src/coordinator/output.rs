//! REGISTER_OUTPUT and REVEAL_OUTPUT.

use super::Coordinator;
use crate::core::message::verify_signed_message;
use crate::core::types::*;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::mix::Mix;
use bitcoin::util::address::AddressType;
use bitcoin::Address;
use std::str::FromStr;

impl Coordinator {
    /// Reject a receive address that is malformed, not P2WPKH on our network,
    /// or already used by an earlier round.
    fn validate_output_address(&self, receive_address: &str) -> CoordinatorResult<()> {
        let address = Address::from_str(receive_address)
            .map_err(|_| CoordinatorError::invalid_argument("Invalid receiveAddress"))?;
        if !address.is_valid_for_network(self.inner.config.network)
            || address.address_type() != Some(AddressType::P2wpkh)
        {
            return Err(CoordinatorError::invalid_argument("Invalid receiveAddress"));
        }
        if self.inner.storage.has_mix_output(receive_address)? {
            return Err(CoordinatorError::already_registered("Output already registered"));
        }
        Ok(())
    }

    /// Pre-check an output before blind registration: the signature proves
    /// the caller holds the receive address key.
    pub fn check_output(&self, receive_address: &str, signature: &str) -> CoordinatorResult<()> {
        match verify_signed_message(receive_address, receive_address, signature) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(CoordinatorError::invalid_argument("Invalid signature")),
        }
        self.validate_output_address(receive_address)
    }

    // ─── REGISTER_OUTPUT ───

    /// Anonymously register a receive address, proven by an unblinded
    /// signature over `bordereau`.
    pub fn register_output(
        &self,
        inputs_hash: &str,
        unblinded_signed_bordereau: &[u8],
        receive_address: &str,
        bordereau: &[u8],
    ) -> CoordinatorResult<()> {
        self.validate_output_address(receive_address)?;

        let mix = self.get_mix_by_inputs_hash(inputs_hash)?;
        let mut mix = mix.lock();
        Self::expect_status(&mix, MixStatus::RegisterOutput)?;

        let result = self.register_output_locked(&mut mix, unblinded_signed_bordereau, receive_address, bordereau);
        if let Err(e) = &result {
            tracing::info!("[{}] registerOutput rejected for {}: {}", mix.id(), receive_address, e);
            mix.set_last_receive_address_rejected(Some(receive_address.to_string()));
        }
        result
    }

    fn register_output_locked(
        &self,
        mix: &mut Mix,
        unblinded_signed_bordereau: &[u8],
        receive_address: &str,
        bordereau: &[u8],
    ) -> CoordinatorResult<()> {
        if bordereau.is_empty() {
            return Err(CoordinatorError::invalid_argument("Invalid bordereau"));
        }
        if mix.has_bordereau(bordereau) {
            return Err(CoordinatorError::already_registered("Bordereau already registered"));
        }
        if mix.has_receive_address(receive_address) {
            return Err(CoordinatorError::already_registered("receiveAddress already registered"));
        }
        if !mix.keys().verify_unblinded(unblinded_signed_bordereau, bordereau) {
            return Err(CoordinatorError::invalid_argument("Invalid unblindedSignedBordereau"));
        }
        if mix.input_by_address(receive_address).is_some() {
            return Err(CoordinatorError::already_registered("output already registered as input"));
        }

        self.inner.storage.save_mix_output(receive_address, mix.id())?;
        mix.register_output(receive_address.to_string(), bordereau.to_vec());
        tracing::info!(
            "[{}] registered output {}/{}",
            mix.id(),
            mix.receive_addresses().len(),
            mix.nb_inputs()
        );

        if self.is_register_output_ready(mix) {
            self.change_mix_status(mix, MixStatus::Signing);
        }
        Ok(())
    }

    pub(super) fn is_register_output_ready(&self, mix: &mut Mix) -> bool {
        if !self.is_confirm_input_ready(mix) {
            return false;
        }
        mix.receive_addresses().len() == mix.nb_inputs()
    }

    /// REGISTER_OUTPUT deadline: fail an empty round, otherwise ask every
    /// session to reveal its output.
    pub(super) fn on_register_output_timeout(&self, mix: &mut Mix) {
        if mix.receive_addresses().is_empty() {
            self.go_fail(mix, FailReason::FailRegisterOutputs, None);
        } else {
            tracing::info!(
                "[{}] REGISTER_OUTPUT timeout: {}/{} outputs, asking for reveals",
                mix.id(),
                mix.receive_addresses().len(),
                mix.nb_inputs()
            );
            self.change_mix_status(mix, MixStatus::RevealOutput);
        }
    }

    // ─── REVEAL_OUTPUT ───

    /// A session proves which output it registered. Once all but one have
    /// revealed, the silent one is blamed.
    pub fn reveal_output(&self, mix_id: &str, username: &str, receive_address: &str) -> CoordinatorResult<()> {
        let mix = self.get_mix(mix_id)?;
        let mut mix = mix.lock();
        Self::expect_status(&mix, MixStatus::RevealOutput)?;

        if mix.has_revealed_username(username) {
            return Err(CoordinatorError::already_registered("Output already revealed"));
        }
        if mix.has_revealed_address(receive_address) {
            return Err(CoordinatorError::already_registered("ReceiveAddress already revealed"));
        }
        if !mix.has_receive_address(receive_address) {
            return Err(CoordinatorError::invalid_argument("Invalid receiveAddress"));
        }

        mix.add_revealed_output(username, receive_address);
        tracing::info!("[{}] {} revealed output ({}/{})", mix_id, username, mix.nb_revealed(), mix.nb_inputs());

        if mix.nb_revealed() + 1 == mix.nb_inputs() {
            self.blame_for_reveal_output(&mut mix);
        }
        Ok(())
    }

    /// Blame every session that did not reveal, then fail the round.
    pub(super) fn blame_for_reveal_output(&self, mix: &mut Mix) {
        let silent: Vec<ConfirmedInput> = mix
            .inputs()
            .filter(|i| !mix.has_revealed_username(i.username()))
            .cloned()
            .collect();
        for input in &silent {
            self.blame(mix, input, BlameReason::RegisterOutput);
        }
        self.go_fail(mix, FailReason::FailRegisterOutputs, Some(super::outpoint_keys(&silent)));
    }
}
