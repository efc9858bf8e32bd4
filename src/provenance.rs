//! Input provenance: a must-mix input must come from a Tx0 that paid the
//! pool fee, a liquidity input from an earlier successful mix.

use crate::chain::ChainTransaction;
use crate::core::types::now_millis;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::pool::PoolParams;
use crate::storage::Storage;
use bitcoin::{Address, Script};
use std::str::FromStr;

pub trait ProvenanceValidator: Send + Sync {
    /// `Ok(true)` for a prior-mix output, `Ok(false)` for a fee-paying Tx0,
    /// rejected when the transaction is neither.
    fn is_liquidity(&self, tx: &ChainTransaction, pool: &PoolParams) -> CoordinatorResult<bool>;
}

/// Check the declared kind of an input against where it actually comes from.
pub fn validate_provenance(
    validator: &dyn ProvenanceValidator,
    tx: &ChainTransaction,
    liquidity: bool,
    pool: &PoolParams,
) -> CoordinatorResult<()> {
    let is_liquidity = validator.is_liquidity(tx, pool)?;
    if liquidity && !is_liquidity {
        return Err(CoordinatorError::input_rejected(
            "Input rejected: joined as liquidity but is a mustMix",
        ));
    }
    if !liquidity && is_liquidity {
        return Err(CoordinatorError::input_rejected(
            "Input rejected: joined as mustMix but is as a liquidity",
        ));
    }
    Ok(())
}

/// Recognizes Tx0s by an output paying the pool fee to the coordinator's fee
/// address, and prior mixes by their txid in storage.
pub struct FeeOutputProvenance {
    fee_script: Option<Script>,
    storage: Storage,
}

impl FeeOutputProvenance {
    pub fn new(fee_address: Option<&str>, storage: Storage) -> anyhow::Result<Self> {
        let fee_script = match fee_address {
            Some(address) => Some(Address::from_str(address)?.script_pubkey()),
            None => None,
        };
        Ok(Self { fee_script, storage })
    }

    /// Largest output paying the fee address.
    fn fee_paid(&self, tx: &ChainTransaction) -> Option<u64> {
        let fee_script = self.fee_script.as_ref()?;
        tx.tx
            .output
            .iter()
            .filter(|o| &o.script_pubkey == fee_script)
            .map(|o| o.value)
            .max()
    }
}

/// Paid the current fee, or an older accepted fee before its cutoff time.
pub fn is_fee_accepted(pool: &PoolParams, paid: u64, tx_time: Option<u64>) -> bool {
    if paid >= pool.fee_value {
        return true;
    }
    let tx_time = tx_time.unwrap_or_else(|| now_millis() / 1000);
    pool.fee_accept
        .iter()
        .any(|(&value, &max_time)| paid >= value && tx_time <= max_time)
}

impl ProvenanceValidator for FeeOutputProvenance {
    fn is_liquidity(&self, tx: &ChainTransaction, pool: &PoolParams) -> CoordinatorResult<bool> {
        let txid = tx.tx.txid();
        match self.fee_paid(tx) {
            Some(paid) if is_fee_accepted(pool, paid, tx.time) => Ok(false),
            Some(paid) => {
                tracing::warn!("[{}] invalid fee for tx0={}: paid {}", pool.pool_id, txid, paid);
                Err(CoordinatorError::input_rejected(format!("Input rejected (invalid fee for tx0={})", txid)))
            }
            None => {
                if self.storage.has_mix_txid(&txid.to_string(), pool.denomination)? {
                    return Ok(true);
                }
                Err(CoordinatorError::input_rejected(
                    "Input rejected (not a premix or whirlpool input)",
                ))
            }
        }
    }
}
