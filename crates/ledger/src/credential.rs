//! Delegate credential material.
//!
//! A delegate credential is an Ed25519 keypair minted at grant issuance.
//! The 32-byte seed lives in the subscription record; everything else
//! derives from it on demand.

use std::fmt;

// URL-safe alphabet: delegate public keys appear in gateway URL paths.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};

/// Base64-encoded Ed25519 verifying key: the shareable half of a
/// delegate credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatePublic(pub String);

impl fmt::Display for DelegatePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An Ed25519 delegate keypair.
///
/// `Debug` shows only the public half; the signing seed is never
/// rendered.
pub struct DelegateKeypair {
    signing_key: SigningKey,
}

impl DelegateKeypair {
    /// Mint a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Reconstruct a keypair from a stored 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed, for persistence in the subscription record.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The base64-encoded verifying key.
    pub fn public(&self) -> DelegatePublic {
        DelegatePublic(BASE64.encode(self.signing_key.verifying_key().to_bytes()))
    }

    /// Sign `message` and return the base64-encoded signature.
    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for DelegateKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateKeypair")
            .field("public", &self.public().0)
            .finish_non_exhaustive()
    }
}

/// Decode a base64 verifying key back into key bytes, e.g. to validate
/// a stored `delegate_public` string.
pub fn decode_public(encoded: &str) -> Option<VerifyingKey> {
    let bytes = BASE64.decode(encoded).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}
