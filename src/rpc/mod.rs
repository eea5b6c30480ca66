//! State Channel RPC Connection Module
//!
//! One WebSocket, many concurrent requests, one authenticated session.
//!
//! # Architecture
//!
//! The module is organized by concern, with each submodule having a single responsibility:
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `transport`  | WebSocket connect/send/receive                        |
//! | `protocol`   | JSON envelopes, frame classification, auth params     |
//! | `correlator` | Matching responses to waiting requests                |
//! | `auth`       | Handshake states and transitions (no I/O)             |
//! | `client`     | Connection actor, reconnection, the public handle     |
//!
//! # Key Design Principles
//!
//! ## 1. One Owner
//!
//! - The connection actor is the only thing that touches the socket
//! - Status, timers and the auth machine live on the actor
//! - `RpcClient` handles talk to it over a channel
//!
//! ## 2. Explicit Handshake States
//!
//! - Every frame is decoded once, then offered to the auth machine
//! - Handshake frames count only when they answer the awaited request
//! - Frames the auth machine does not claim go to the correlator
//! - No temporary handlers layered over the socket during the handshake
//!
//! ## 3. The Actor Never Waits on the Network
//!
//! - Writes go through a bounded queue to a per-link writer task
//! - A peer that stops reading costs one reconnect, not a stalled client
//!
//! ## 4. Every Request Settles
//!
//! - Response, timeout, caller drop, or `ConnectionLost` on disconnect
//! - Removal from the correlator is the single point of settlement
//!
//! # Usage
//!
//! ```ignore
//! use channel_rpc::rpc::{RpcClient, RpcRequest};
//!
//! let client = RpcClient::with_defaults(config)?;
//! client.connect(session_key, wallet).await?;
//!
//! let response = client
//!     .send_with_response(RpcRequest::new("get_config", vec![]), None)
//!     .await?;
//! ```

pub mod auth;
pub mod client;
pub mod correlator;
pub mod protocol;
pub mod transport;

pub use auth::{AuthPhase, PendingChallenge};
pub use client::{ClientEvent, ConnectionStatus, RpcClient};
pub use correlator::{Correlator, PendingResponse};
pub use protocol::{DecodeError, FrameKind, RpcRequest, RpcResponse};
pub use transport::{Connector, MemoryConnector, MemoryPeer, TransportEvent, WsConnector};
