//! Bitcoin signed-message checks (the "prove you own this UTXO" step).

use anyhow::{anyhow, Result};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::util::misc::{signed_msg_hash, MessageSignature};
use bitcoin::{Address, PublicKey};
use std::str::FromStr;

/// True if `signature_base64` is a valid signed message over `message` by the
/// key behind `address`. Supports p2pkh, p2wpkh and p2sh-p2wpkh addresses.
pub fn verify_signed_message(address: &str, message: &str, signature_base64: &str) -> Result<bool> {
    let address = Address::from_str(address).map_err(|e| anyhow!("invalid address {}: {}", address, e))?;
    let signature = MessageSignature::from_base64(signature_base64)
        .map_err(|e| anyhow!("invalid message signature: {}", e))?;

    let secp = Secp256k1::verification_only();
    let pubkey = match signature.recover_pubkey(&secp, signed_msg_hash(message)) {
        Ok(pk) => pk,
        Err(_) => return Ok(false),
    };
    Ok(matches_address(&pubkey, &address))
}

fn matches_address(pubkey: &PublicKey, address: &Address) -> bool {
    let network = address.network;
    if Address::p2pkh(pubkey, network) == *address {
        return true;
    }
    if let Ok(wpkh) = Address::p2wpkh(pubkey, network) {
        if wpkh == *address {
            return true;
        }
    }
    matches!(Address::p2shwpkh(pubkey, network), Ok(sh) if sh == *address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Message, SecretKey};
    use bitcoin::Network;

    fn sign(sk: &SecretKey, message: &str) -> String {
        let secp = Secp256k1::new();
        let hash = signed_msg_hash(message);
        let msg = Message::from_slice(&hash[..]).unwrap();
        let sig = secp.sign_ecdsa_recoverable(&msg, sk);
        MessageSignature::new(sig, true).to_base64()
    }

    fn address(sk: &SecretKey) -> String {
        let secp = Secp256k1::new();
        let pk = PublicKey::new(sk.public_key(&secp));
        Address::p2wpkh(&pk, Network::Testnet).unwrap().to_string()
    }

    #[test]
    fn accepts_signature_from_owner() {
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let sig = sign(&sk, "0.01btc");
        assert!(verify_signed_message(&address(&sk), "0.01btc", &sig).unwrap());
    }

    #[test]
    fn rejects_wrong_message_or_signer() {
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let other = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let sig = sign(&sk, "0.01btc");
        assert!(!verify_signed_message(&address(&sk), "0.05btc", &sig).unwrap());
        assert!(!verify_signed_message(&address(&other), "0.01btc", &sig).unwrap());
    }

    #[test]
    fn malformed_signature_is_an_error() {
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        assert!(verify_signed_message(&address(&sk), "0.01btc", "not base64!").is_err());
    }
}
