use alloy_primitives::{keccak256, Address, B256};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Clone, Debug, Error)]
pub enum CryptoError {
    #[error("Invalid secret key material")]
    InvalidSecretKey,
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("The signature is malformed")]
    MalformedSignature,
    #[error("Could not recover a public key from the signature")]
    RecoveryFailed,
}

/// A secp256k1 secret key used to sign channel states.
///
/// The raw scalar is held by the underlying signing key; intermediate byte
/// buffers are zeroized on drop.
#[derive(Clone)]
pub struct SecretKey {
    key: SigningKey,
    address: Address,
}

impl SecretKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_bytes(bytes.into()).map_err(|_| CryptoError::InvalidSecretKey)?;
        let address = address_from_verifying_key(key.verifying_key());
        Ok(SecretKey { key, address })
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(s.trim_start_matches("0x"), bytes.as_mut())
            .map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        SecretKey::from_bytes(&bytes)
    }

    /// The Ethereum address corresponding to this key's public half. This is
    /// the participant identity used throughout the protocol.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Produces a recoverable signature over a 32-byte prehash.
    pub fn sign_hash(&self, hash: B256) -> Result<Signature, CryptoError> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        let bytes = sig.to_bytes();
        Ok(Signature {
            r: B256::from_slice(&bytes[..32]),
            s: B256::from_slice(&bytes[32..]),
            v: recovery_id.to_byte(),
        })
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "SecretKey(for {})", self.address)
    }
}

/// An Ethereum-style recoverable ECDSA signature. `v` is the parity byte of
/// the recovery id (0 or 1).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: B256,
    pub s: B256,
    pub v: u8,
}

impl Signature {
    /// Recovers the signer's address for the given prehash. A signature that
    /// was made over a different hash recovers to a different (effectively
    /// random) address, so callers must check the result against an expected
    /// participant set.
    pub fn recover_signer(&self, hash: B256) -> Result<Address, CryptoError> {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.r.as_slice());
        bytes[32..].copy_from_slice(self.s.as_slice());
        let sig = EcdsaSignature::from_slice(&bytes).map_err(|_| CryptoError::MalformedSignature)?;
        let recovery_id = RecoveryId::from_byte(self.v).ok_or(CryptoError::MalformedSignature)?;
        let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &sig, recovery_id)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(address_from_verifying_key(&key))
    }

    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(self.r.as_slice());
        out[32..64].copy_from_slice(self.s.as_slice());
        out[64] = self.v;
        out
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({self})")
    }
}

/// keccak256 of the uncompressed public key, last 20 bytes.
fn address_from_verifying_key(key: &VerifyingKey) -> Address {
    let encoded = key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

#[cfg(test)]
mod test {
    use super::*;

    pub const ALICE_SK: &str = "2d999770f7b5d49b694080f987b82bbc9fc9ac2b4dcc10b0f8aba7d700f69c6d";
    pub const BOB_SK: &str = "0279651921cd800ac560c21ceea27aab0107b67daf436cdd25ce84cad30159b4";

    #[test]
    fn sign_and_recover() {
        let key = SecretKey::from_hex(ALICE_SK).unwrap();
        let hash = keccak256(b"a message to sign");
        let sig = key.sign_hash(hash).unwrap();
        assert_eq!(sig.recover_signer(hash).unwrap(), key.address());
    }

    #[test]
    fn recovery_with_wrong_hash_gives_wrong_signer() {
        let key = SecretKey::from_hex(ALICE_SK).unwrap();
        let sig = key.sign_hash(keccak256(b"original")).unwrap();
        match sig.recover_signer(keccak256(b"tampered")) {
            Ok(address) => assert_ne!(address, key.address()),
            Err(CryptoError::RecoveryFailed) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn distinct_keys_distinct_addresses() {
        let alice = SecretKey::from_hex(ALICE_SK).unwrap();
        let bob = SecretKey::from_hex(BOB_SK).unwrap();
        assert_ne!(alice.address(), bob.address());
    }

    #[test]
    fn signature_roundtrips_through_serde() {
        let key = SecretKey::from_hex(BOB_SK).unwrap();
        let hash = keccak256(b"roundtrip");
        let sig = key.sign_hash(hash).unwrap();
        let encoded = serde_json::to_string(&sig).unwrap();
        let decoded: Signature = serde_json::from_str(&encoded).unwrap();
        assert_eq!(sig, decoded);
        assert_eq!(decoded.recover_signer(hash).unwrap(), key.address());
    }

    #[test]
    fn rejects_bad_key_material() {
        assert!(SecretKey::from_hex("not hex").is_err());
        // The zero scalar is not a valid secp256k1 secret key.
        assert!(SecretKey::from_bytes(&[0u8; 32]).is_err());
    }
}
