//! Signing identities
//!
//! The connection core never produces signatures itself. Everything it needs
//! signed goes through a [`Signer`]: a browser wallet bridge, a hardware
//! device, or the local [`SessionKey`].
//!
//! | Signer       | Signs                                        |
//! |--------------|----------------------------------------------|
//! | wallet       | the auth challenge (once per session)        |
//! | session key  | every request envelope, heartbeats included  |

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// An opaque signing capability.
///
/// `sign` may suspend for as long as it likes (for example while a human
/// looks at a wallet prompt); the client never times it out. Return
/// [`RpcError::UserRejected`] when the user declines.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Public identity announced to the node
    fn address(&self) -> String;

    /// Sign an opaque payload, returning a hex signature
    async fn sign(&self, payload: &[u8]) -> Result<String, RpcError>;
}

/// A local ed25519 keypair used to sign protocol traffic so the wallet is
/// only needed for the handshake.
#[derive(Clone)]
pub struct SessionKey {
    signing_key: SigningKey,
    address: String,
}

/// On-disk form of a session key
#[derive(Serialize, Deserialize)]
pub(crate) struct StoredSessionKey {
    pub address: String,
    pub secret: String,
}

impl SessionKey {
    /// Create a fresh keypair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore from the 32 secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, RpcError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RpcError::Storage(format!("Session key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    /// `0x`-prefixed hex of the public key
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Synchronous signature, used by the connection actor for envelopes.
    pub fn sign_bytes(&self, payload: &[u8]) -> String {
        let signature = self.signing_key.sign(payload);
        format!("0x{}", hex::encode(signature.to_bytes()))
    }

    pub(crate) fn to_stored(&self) -> StoredSessionKey {
        StoredSessionKey {
            address: self.address.clone(),
            secret: hex::encode(self.signing_key.to_bytes()),
        }
    }

    pub(crate) fn from_stored(stored: &StoredSessionKey) -> Result<Self, RpcError> {
        let bytes = hex::decode(&stored.secret)
            .map_err(|e| RpcError::Storage(format!("Failed to decode session key: {}", e)))?;
        let key = Self::from_secret_bytes(&bytes)?;
        if key.address != stored.address {
            return Err(RpcError::Storage(
                "Stored session key address does not match its secret".into(),
            ));
        }
        Ok(key)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for SessionKey {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign(&self, payload: &[u8]) -> Result<String, RpcError> {
        Ok(self.sign_bytes(payload))
    }
}

fn address_of(key: &VerifyingKey) -> String {
    format!("0x{}", hex::encode(key.to_bytes()))
}

/// Check a signature produced by [`SessionKey::sign_bytes`].
pub fn verify_signature(address: &str, payload: &[u8], signature: &str) -> bool {
    let decode = |s: &str| hex::decode(s.trim_start_matches("0x")).ok();

    let Some(key_bytes) = decode(address).and_then(|b| <[u8; 32]>::try_from(b).ok()) else {
        return false;
    };
    let Some(sig_bytes) = decode(signature).and_then(|b| <[u8; 64]>::try_from(b).ok()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    key.verify_strict(payload, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
        .is_ok()
}
