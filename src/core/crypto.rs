//! Per-round RSA blind signatures.
//!
//! The server only ever sees the blinded bordereau at confirmation time, and
//! only the unblinded signature at output registration. Verifying the latter
//! proves the caller owns one of the round's confirmed inputs without telling
//! which one.

use anyhow::{anyhow, Result};
use blind_rsa_signatures::{Hash, KeyPair, Options, PublicKey, SecretKey, Signature};

pub const MODULUS_BITS: usize = 2048;

/// Raw RSA output is always one modulus wide.
pub const SIGNATURE_LEN: usize = MODULUS_BITS / 8;

/// PSS over SHA-256 with a 32-byte salt, as clients unblind with.
pub fn blinding_options() -> Options {
    Options::new(Hash::Sha256, false, 32)
}

pub struct MixKeyPair {
    pk: PublicKey,
    sk: SecretKey,
    public_key_der: Vec<u8>,
}

impl MixKeyPair {
    pub fn generate() -> Result<Self> {
        let kp = KeyPair::generate(MODULUS_BITS)
            .map_err(|e| anyhow!("rsa key generation failed: {:?}", e))?;
        let public_key_der = kp
            .pk
            .to_der()
            .map_err(|e| anyhow!("rsa public key encoding failed: {:?}", e))?;
        Ok(Self { pk: kp.pk, sk: kp.sk, public_key_der })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.pk
    }

    /// DER (SubjectPublicKeyInfo) encoding sent to invited sessions.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Sign a blinded bordereau. Stateless: signing the same blob twice is fine.
    pub fn blind_sign(&self, blinded_bordereau: &[u8]) -> Result<Vec<u8>> {
        if blinded_bordereau.len() != SIGNATURE_LEN {
            return Err(anyhow!(
                "blinded bordereau must be {} bytes, got {}",
                SIGNATURE_LEN,
                blinded_bordereau.len()
            ));
        }
        let blind_sig = self
            .sk
            .blind_sign(blinded_bordereau, &blinding_options())
            .map_err(|e| anyhow!("blind signing failed: {:?}", e))?;
        Ok(blind_sig.0)
    }

    /// Check an unblinded signature against the bordereau it claims to cover.
    pub fn verify_unblinded(&self, unblinded_signature: &[u8], bordereau: &[u8]) -> bool {
        let sig = Signature::new(unblinded_signature.to_vec());
        sig.verify(&self.pk, bordereau, &blinding_options()).is_ok()
    }
}

impl std::fmt::Debug for MixKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixKeyPair")
            .field("public_key", &hex::encode(&self.public_key_der))
            .finish()
    }
}
