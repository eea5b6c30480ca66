//! Credential Cache
//!
//! Holds exactly two things across restarts: the renewable token handed out
//! by the node after a successful handshake, and the local session key.
//!
//! ```text
//! ~/.local/share/channel-rpc/
//! ├── session_key.json   # { address, secret }
//! └── token              # { token, wallet, session_key }
//! ```
//!
//! A token is only ever presented by the identity it was issued to: the
//! wallet and session key addresses are stored next to it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::signer::{SessionKey, StoredSessionKey};

/// A renewable bearer token, and who it was issued to.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    owner: Option<TokenOwner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenOwner {
    wallet: String,
    session_key: String,
}

/// On-disk form of a credential
#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: String,
    wallet: String,
    session_key: String,
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

impl Credential {
    /// Wrap a token, reading the `exp` claim when the token is a JWT.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = read_expiry(&token);
        Self {
            token,
            expires_at,
            owner: None,
        }
    }

    /// Record the identity the node issued this token to.
    pub fn issued_to(mut self, wallet: impl Into<String>, session_key: impl Into<String>) -> Self {
        self.owner = Some(TokenOwner {
            wallet: wallet.into(),
            session_key: session_key.into(),
        });
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether this token was issued to exactly this wallet and session key.
    /// A token with no recorded owner belongs to nobody.
    pub fn belongs_to(&self, wallet: &str, session_key: &str) -> bool {
        self.owner.as_ref().is_some_and(|owner| {
            owner.wallet.eq_ignore_ascii_case(wallet) && owner.session_key.eq_ignore_ascii_case(session_key)
        })
    }

    /// Wallet address the token was issued to, if recorded
    pub fn wallet(&self) -> Option<&str> {
        self.owner.as_ref().map(|owner| owner.wallet.as_str())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Tokens without an expiry claim are left for the node to judge.
    pub fn is_expired(&self, skew: Duration) -> bool {
        self.is_expired_at(Utc::now(), skew)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
        match self.expires_at {
            Some(exp) => now + skew >= exp,
            None => false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Read `exp` from the payload segment of a JWT-shaped token.
fn read_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claim.exp?, 0)
}

/// Persistence for the single token and the single session key.
pub trait CredentialStore: Send + Sync {
    fn load_token(&self) -> Result<Option<Credential>, RpcError>;
    fn save_token(&self, credential: &Credential) -> Result<(), RpcError>;
    fn clear_token(&self) -> Result<(), RpcError>;

    fn load_session_key(&self) -> Result<Option<SessionKey>, RpcError>;
    fn save_session_key(&self, key: &SessionKey) -> Result<(), RpcError>;

    /// Load the stored session key, creating and persisting one if absent.
    fn load_or_create_session_key(&self) -> Result<SessionKey, RpcError> {
        if let Some(key) = self.load_session_key()? {
            return Ok(key);
        }
        let key = SessionKey::generate();
        self.save_session_key(&key)?;
        debug!(address = %key.address(), "Created new session key");
        Ok(key)
    }
}

/// File-backed store under a fixed directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn token_path(&self) -> PathBuf {
        self.dir.join("token")
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join("session_key.json")
    }

    fn ensure_dir(&self) -> Result<(), RpcError> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_token(&self) -> Result<Option<Credential>, RpcError> {
        let content = match std::fs::read_to_string(self.token_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<StoredToken>(&content) {
            Ok(stored) => Ok(Some(
                Credential::new(stored.token).issued_to(stored.wallet, stored.session_key),
            )),
            Err(e) => {
                // Nobody can be shown to own it, so nobody may use it
                warn!(error = %e, path = %self.token_path().display(), "Cached token is unreadable, ignoring");
                Ok(None)
            }
        }
    }

    fn save_token(&self, credential: &Credential) -> Result<(), RpcError> {
        let owner = credential.owner.as_ref().ok_or_else(|| {
            RpcError::Storage("Refusing to cache a token without its owner".into())
        })?;
        let stored = StoredToken {
            token: credential.token().to_string(),
            wallet: owner.wallet.clone(),
            session_key: owner.session_key.clone(),
        };

        self.ensure_dir()?;
        std::fs::write(self.token_path(), serde_json::to_string_pretty(&stored)?)?;
        Ok(())
    }

    fn clear_token(&self) -> Result<(), RpcError> {
        match std::fs::remove_file(self.token_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_session_key(&self) -> Result<Option<SessionKey>, RpcError> {
        let content = match std::fs::read_to_string(self.key_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredSessionKey = serde_json::from_str(&content)?;
        match SessionKey::from_stored(&stored) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                warn!(error = %e, path = %self.key_path().display(), "Stored session key is unreadable");
                Err(e)
            }
        }
    }

    fn save_session_key(&self, key: &SessionKey) -> Result<(), RpcError> {
        self.ensure_dir()?;
        let content = serde_json::to_string_pretty(&key.to_stored())?;
        std::fs::write(self.key_path(), content)?;
        Ok(())
    }
}

/// Process-local store, for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: Mutex<Option<Credential>>,
    session_key: Mutex<Option<SessionKey>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a credential
    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::default();
        *store.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(credential);
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_token(&self) -> Result<Option<Credential>, RpcError> {
        Ok(self.token.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save_token(&self, credential: &Credential) -> Result<(), RpcError> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(credential.clone());
        Ok(())
    }

    fn clear_token(&self) -> Result<(), RpcError> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn load_session_key(&self) -> Result<Option<SessionKey>, RpcError> {
        Ok(self.session_key.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save_session_key(&self, key: &SessionKey) -> Result<(), RpcError> {
        *self.session_key.lock().unwrap_or_else(|e| e.into_inner()) = Some(key.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"0xabc","exp":{}}}"#, exp));
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn test_jwt_expiry_is_read() {
        let exp = Utc::now().timestamp() + 600;
        let credential = Credential::new(jwt_with_exp(exp));
        assert_eq!(credential.expires_at().map(|t| t.timestamp()), Some(exp));
        assert!(!credential.is_expired(Duration::from_secs(30)));
    }

    #[test]
    fn test_expired_and_skewed_tokens() {
        let now = Utc::now();
        let expired = Credential::new(jwt_with_exp(now.timestamp() - 1));
        assert!(expired.is_expired_at(now, Duration::ZERO));

        let almost = Credential::new(jwt_with_exp(now.timestamp() + 10));
        assert!(!almost.is_expired_at(now, Duration::ZERO));
        assert!(almost.is_expired_at(now, Duration::from_secs(30)));
    }

    #[test]
    fn test_opaque_token_never_expires_locally() {
        let credential = Credential::new("jwt-abc");
        assert!(credential.expires_at().is_none());
        assert!(!credential.is_expired(Duration::from_secs(3600)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential::new("secret-token");
        assert!(!format!("{:?}", credential).contains("secret-token"));
    }

    #[test]
    fn test_token_belongs_only_to_its_owner() {
        let credential = Credential::new("jwt-abc").issued_to("0xWallet", "0xsession");
        assert!(credential.belongs_to("0xwallet", "0xsession"));
        assert!(!credential.belongs_to("0xother", "0xsession"));
        assert!(!credential.belongs_to("0xwallet", "0xother"));
        assert_eq!(credential.wallet(), Some("0xWallet"));

        assert!(!Credential::new("jwt-abc").belongs_to("0xwallet", "0xsession"));
    }

    #[test]
    fn test_file_store_token_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested"));

        assert!(store.load_token().unwrap().is_none());
        store
            .save_token(&Credential::new("jwt-abc").issued_to("0xwallet", "0xsession"))
            .unwrap();
        let loaded = store.load_token().unwrap().unwrap();
        assert_eq!(loaded.token(), "jwt-abc");
        assert!(loaded.belongs_to("0xwallet", "0xsession"));

        store.clear_token().unwrap();
        assert!(store.load_token().unwrap().is_none());
        // Clearing twice is fine
        store.clear_token().unwrap();
    }

    #[test]
    fn test_file_store_refuses_ownerless_and_ignores_legacy_tokens() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path());

        assert!(matches!(
            store.save_token(&Credential::new("jwt-abc")),
            Err(RpcError::Storage(_))
        ));

        std::fs::write(dir.path().join("token"), "jwt-raw").unwrap();
        assert!(store.load_token().unwrap().is_none());
    }

    #[test]
    fn test_file_store_session_key_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path());

        let created = store.load_or_create_session_key().unwrap();
        let again = store.load_or_create_session_key().unwrap();
        assert_eq!(created.address(), again.address());

        let reopened = FileCredentialStore::new(dir.path());
        assert_eq!(
            reopened.load_session_key().unwrap().unwrap().address(),
            created.address()
        );
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::with_credential(Credential::new("jwt-abc"));
        assert_eq!(store.load_token().unwrap().unwrap().token(), "jwt-abc");
        store.clear_token().unwrap();
        assert!(store.load_token().unwrap().is_none());
        assert!(store.load_session_key().unwrap().is_none());
    }
}
