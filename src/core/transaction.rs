//! Joint transaction assembly and verification.
//!
//! Inputs and outputs are ordered with the BIP69 comparators so the final
//! layout says nothing about who joined when. Only P2WPKH inputs are
//! accepted; their witnesses are checked with a BIP143 sighash.

use anyhow::{anyhow, bail, Result};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    EcdsaSig, OutPoint, PackedLockTime, PublicKey, Script, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use sha2::{Digest, Sha512};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::types::TxOutPoint;

pub const MIX_TX_VERSION: i32 = 1;

/// BIP69 input order: previous txid in display (reversed) byte order, then vout.
pub fn bip69_input_cmp(a: &TxIn, b: &TxIn) -> Ordering {
    let mut a_hash = a.previous_output.txid.into_inner();
    let mut b_hash = b.previous_output.txid.into_inner();
    a_hash.reverse();
    b_hash.reverse();
    a_hash
        .cmp(&b_hash)
        .then_with(|| a.previous_output.vout.cmp(&b.previous_output.vout))
}

/// BIP69 output order: amount, then scriptPubKey bytes.
pub fn bip69_output_cmp(a: &TxOut, b: &TxOut) -> Ordering {
    a.value
        .cmp(&b.value)
        .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
}

/// Build the unsigned mix transaction: one input per confirmed outpoint, one
/// output of exactly `denomination` per payout script.
pub fn build_mix_transaction(
    outpoints: &[OutPoint],
    payout_scripts: &[Script],
    denomination: u64,
) -> Transaction {
    let mut input: Vec<TxIn> = outpoints
        .iter()
        .map(|outpoint| TxIn {
            previous_output: *outpoint,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        })
        .collect();
    let mut output: Vec<TxOut> = payout_scripts
        .iter()
        .map(|script| TxOut { value: denomination, script_pubkey: script.clone() })
        .collect();

    input.sort_by(bip69_input_cmp);
    output.sort_by(bip69_output_cmp);

    Transaction { version: MIX_TX_VERSION, lock_time: PackedLockTime::ZERO, input, output }
}

/// Hash binding a client to the round's membership: SHA-512 over the sorted
/// `txid || vout` strings joined by `;`, lowercase hex.
pub fn compute_inputs_hash<'a>(outpoints: impl IntoIterator<Item = &'a OutPoint>) -> String {
    let mut values: Vec<String> = outpoints
        .into_iter()
        .map(|out| format!("{}{}", out.txid, out.vout))
        .collect();
    values.sort();
    let preimage = values.join(";");
    hex::encode(Sha512::digest(preimage.as_bytes()))
}

pub fn find_input_index(tx: &Transaction, outpoint: &OutPoint) -> Option<usize> {
    tx.input.iter().position(|i| i.previous_output == *outpoint)
}

/// Verify the witness at `index` spends a P2WPKH output of `value` sats
/// locked to `script_pubkey`.
pub fn verify_input_witness(
    tx: &Transaction,
    index: usize,
    script_pubkey: &Script,
    value: u64,
) -> Result<()> {
    let input = tx
        .input
        .get(index)
        .ok_or_else(|| anyhow!("input {} out of range ({})", index, tx.input.len()))?;

    if !script_pubkey.is_v0_p2wpkh() {
        bail!("unsupported script type for input {}", index);
    }

    let stack = input.witness.to_vec();
    if stack.len() != 2 {
        bail!("P2WPKH witness needs 2 items, got {}", stack.len());
    }

    let sig = EcdsaSig::from_slice(&stack[0])?;
    let pubkey = PublicKey::from_slice(&stack[1])?;
    let wpkh = pubkey
        .wpubkey_hash()
        .ok_or_else(|| anyhow!("uncompressed public key in witness"))?;
    if Script::new_v0_p2wpkh(&wpkh) != *script_pubkey {
        bail!("witness public key does not match spent output");
    }

    let script_code = Script::new_p2pkh(&pubkey.pubkey_hash());
    let sighash = SighashCache::new(tx).segwit_signature_hash(index, &script_code, value, sig.hash_ty)?;
    let msg = Message::from_slice(&sighash[..])?;
    Secp256k1::verification_only().verify_ecdsa(&msg, &sig.sig, &pubkey.inner)?;
    Ok(())
}

/// Full check before broadcast: every input carries a valid witness for the
/// outpoint it spends, and outputs do not exceed inputs.
pub fn verify_signed_transaction(
    tx: &Transaction,
    spent: &HashMap<OutPoint, TxOutPoint>,
) -> Result<()> {
    let mut amount_in = 0u64;
    for (index, input) in tx.input.iter().enumerate() {
        let prevout = spent
            .get(&input.previous_output)
            .ok_or_else(|| anyhow!("unknown outpoint {}", input.previous_output))?;
        verify_input_witness(tx, index, &prevout.script_pubkey, prevout.value)
            .map_err(|e| anyhow!("input {} ({}): {}", index, input.previous_output, e))?;
        amount_in += prevout.value;
    }
    let amount_out: u64 = tx.output.iter().map(|o| o.value).sum();
    if amount_out > amount_in {
        bail!("outputs ({}) exceed inputs ({})", amount_out, amount_in);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::{EcdsaSighashType, Txid};
    use std::str::FromStr;

    fn txid(n: u8) -> Txid {
        Txid::from_str(&format!("{:02x}", n).repeat(32)).unwrap()
    }

    fn p2wpkh_key(seed: u8) -> (SecretKey, PublicKey, Script) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        let pk = PublicKey::new(sk.public_key(&secp));
        let script = Script::new_v0_p2wpkh(&pk.wpubkey_hash().unwrap());
        (sk, pk, script)
    }

    fn sign_input(tx: &mut Transaction, index: usize, sk: &SecretKey, pk: &PublicKey, value: u64) {
        let secp = Secp256k1::new();
        let script_code = Script::new_p2pkh(&pk.pubkey_hash());
        let sighash = SighashCache::new(&*tx)
            .segwit_signature_hash(index, &script_code, value, EcdsaSighashType::All)
            .unwrap();
        let sig = secp.sign_ecdsa(&Message::from_slice(&sighash[..]).unwrap(), sk);
        let sig = EcdsaSig { sig, hash_ty: EcdsaSighashType::All };
        tx.input[index].witness = Witness::from_vec(vec![sig.to_vec(), pk.to_bytes()]);
    }

    // ─── BIP69 ───

    #[test]
    fn layout_is_independent_of_join_order() {
        let outpoints = vec![
            OutPoint::new(txid(0xaa), 1),
            OutPoint::new(txid(0x01), 7),
            OutPoint::new(txid(0xaa), 0),
        ];
        let scripts: Vec<Script> = (1..=3).map(|i| p2wpkh_key(i).2).collect();

        let a = build_mix_transaction(&outpoints, &scripts, 1_000_000);
        let mut rev_outpoints = outpoints.clone();
        rev_outpoints.reverse();
        let mut rev_scripts = scripts.clone();
        rev_scripts.reverse();
        let b = build_mix_transaction(&rev_outpoints, &rev_scripts, 1_000_000);

        assert_eq!(a, b);
        assert_eq!(a.txid(), b.txid());
        assert_eq!(a.input[0].previous_output, OutPoint::new(txid(0x01), 7));
        assert_eq!(a.input[1].previous_output, OutPoint::new(txid(0xaa), 0));
        assert_eq!(a.input[2].previous_output, OutPoint::new(txid(0xaa), 1));
        assert!(a.output.iter().all(|o| o.value == 1_000_000));
        assert!(a.output.windows(2).all(|w| bip69_output_cmp(&w[0], &w[1]) != Ordering::Greater));
    }

    #[test]
    fn input_order_uses_display_byte_order() {
        // Internal bytes [0x01, 0x00..] display as "00..01" and sort first.
        let mut low = [0u8; 32];
        low[0] = 0x01;
        let mut high = [0u8; 32];
        high[31] = 0x01;
        let a = TxIn { previous_output: OutPoint::new(Txid::from_inner(low), 0), ..Default::default() };
        let b = TxIn { previous_output: OutPoint::new(Txid::from_inner(high), 0), ..Default::default() };
        assert_eq!(bip69_input_cmp(&a, &b), Ordering::Less);
    }

    // ─── Inputs hash ───

    #[test]
    fn inputs_hash_ignores_order() {
        let a = [OutPoint::new(txid(1), 0), OutPoint::new(txid(2), 5)];
        let b = [a[1], a[0]];
        let h = compute_inputs_hash(&a);
        assert_eq!(h, compute_inputs_hash(&b));
        assert_eq!(h.len(), 128);
        assert_ne!(h, compute_inputs_hash(&a[..1]));
    }

    // ─── Witness verification ───

    #[test]
    fn valid_p2wpkh_witness_verifies() {
        let (sk, pk, script) = p2wpkh_key(7);
        let outpoint = OutPoint::new(txid(3), 0);
        let mut tx = build_mix_transaction(&[outpoint], &[p2wpkh_key(8).2], 1_000_000);
        sign_input(&mut tx, 0, &sk, &pk, 1_000_300);
        verify_input_witness(&tx, 0, &script, 1_000_300).unwrap();
    }

    #[test]
    fn witness_with_wrong_value_fails() {
        let (sk, pk, script) = p2wpkh_key(7);
        let mut tx = build_mix_transaction(&[OutPoint::new(txid(3), 0)], &[p2wpkh_key(8).2], 1_000_000);
        sign_input(&mut tx, 0, &sk, &pk, 1_000_300);
        assert!(verify_input_witness(&tx, 0, &script, 1_000_301).is_err());
    }

    #[test]
    fn witness_from_other_key_fails() {
        let (_, _, script) = p2wpkh_key(7);
        let (other_sk, other_pk, _) = p2wpkh_key(9);
        let mut tx = build_mix_transaction(&[OutPoint::new(txid(3), 0)], &[p2wpkh_key(8).2], 1_000_000);
        sign_input(&mut tx, 0, &other_sk, &other_pk, 1_000_300);
        assert!(verify_input_witness(&tx, 0, &script, 1_000_300).is_err());
    }

    #[test]
    fn empty_witness_fails() {
        let (_, _, script) = p2wpkh_key(7);
        let tx = build_mix_transaction(&[OutPoint::new(txid(3), 0)], &[p2wpkh_key(8).2], 1_000_000);
        assert!(verify_input_witness(&tx, 0, &script, 1_000_300).is_err());
    }

    #[test]
    fn full_transaction_verification() {
        let keys: Vec<_> = (1..=2).map(p2wpkh_key).collect();
        let outpoints = [OutPoint::new(txid(4), 0), OutPoint::new(txid(5), 1)];
        let payouts: Vec<Script> = (10..=11).map(|i| p2wpkh_key(i).2).collect();
        let mut tx = build_mix_transaction(&outpoints, &payouts, 1_000_000);

        let mut spent = HashMap::new();
        for (outpoint, (_, _, script)) in outpoints.iter().zip(&keys) {
            spent.insert(
                *outpoint,
                TxOutPoint {
                    hash: outpoint.txid,
                    index: outpoint.vout,
                    value: 1_000_200,
                    confirmations: 1,
                    script_pubkey: script.clone(),
                    address: String::new(),
                },
            );
        }
        assert!(verify_signed_transaction(&tx, &spent).is_err());

        for (outpoint, (sk, pk, _)) in outpoints.iter().zip(&keys) {
            let index = find_input_index(&tx, outpoint).unwrap();
            sign_input(&mut tx, index, sk, pk, 1_000_200);
        }
        verify_signed_transaction(&tx, &spent).unwrap();
    }
}
