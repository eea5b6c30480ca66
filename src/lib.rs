//! channel-rpc - Client for state channel nodes over a single WebSocket
//!
//! Opens one connection to a node, authenticates it with a challenge signed
//! by an external wallet (or a cached token), keeps it alive, and multiplexes
//! correlated requests over it.
//!
//! ## Architecture
//!
//! - **Signer**: the wallet, behind a trait; signs the auth challenge
//! - **Session key**: local ed25519 key; signs every envelope
//! - **Credential cache**: the node-issued token and the session key
//! - **rpc**: codec, correlator, auth state machine, connection actor
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/channel-rpc/
//! ├── session_key.json   # Session keypair
//! ├── token              # Last token issued by the node
//! └── config.toml        # Configuration (optional)
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod rpc;
pub mod signer;

// Re-exports
pub use config::{Allowance, AuthParams, ClientConfig};
pub use credentials::{Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::RpcError;
pub use rpc::{ClientEvent, ConnectionStatus, PendingChallenge, RpcClient, RpcRequest, RpcResponse};
pub use signer::{SessionKey, Signer};
