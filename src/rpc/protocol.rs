//! Wire Protocol
//!
//! Single responsibility: Encode and decode envelopes as JSON text frames.
//!
//! # Wire Format
//!
//! ## Request
//! ```text
//! {
//!     "req": [<id u64>, <method>, [<params>...], <timestamp ms>],
//!     "sig": ["0x<hex signature>", ...]
//! }
//! ```
//!
//! ## Response
//! ```text
//! {
//!     "res": [<id u64>, <method>, [<params>...], <timestamp ms>],
//!     "sig": [...]
//! }
//! ```
//!
//! A response whose method is `"error"` is a failure; its detail is the first
//! params element, either a bare string or `{"error": "..."}`.
//!
//! ## Handshake
//! ```text
//! client: auth_request  [{address, session_key, application, allowances, scope, expires_at}]
//! server: auth_challenge [{challenge_message}]
//! client: auth_verify   [{challenge}]  signed by the wallet
//!    or   auth_verify   [{jwt}]        cached credential
//! server: auth_verify   [{success, address, session_key, jwt_token}]
//! ```

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Allowance, AuthParams};
use crate::error::RpcError;

pub const METHOD_AUTH_REQUEST: &str = "auth_request";
pub const METHOD_AUTH_CHALLENGE: &str = "auth_challenge";
pub const METHOD_AUTH_VERIFY: &str = "auth_verify";
pub const METHOD_ERROR: &str = "error";
pub const METHOD_PING: &str = "ping";
pub const METHOD_PONG: &str = "pong";

/// Why a frame could not be decoded. Never fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame is not valid JSON: {0}")]
    Json(String),

    #[error("Frame is not a response envelope: {0}")]
    Shape(String),
}

impl From<DecodeError> for RpcError {
    fn from(e: DecodeError) -> Self {
        RpcError::Protocol(e.to_string())
    }
}

/// A request as handed to the client by callers.
///
/// `id` is normally left empty and assigned by the client; a caller that
/// needs a stable id (e.g. to retransmit) may set it.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: Option<u64>,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

/// Monotonic request id source shared by every sender on one client.
#[derive(Debug, Clone)]
pub struct Sequence(Arc<AtomicU64>);

impl Default for Sequence {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Keep future ids above one a caller chose itself.
    pub fn observe(&self, id: u64) {
        self.0.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }
}

/// A request with its id and timestamp fixed, ready to be signed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            timestamp: now_ms(),
        }
    }

    /// The `req` tuple
    fn payload(&self) -> Value {
        json!([self.id, self.method, self.params, self.timestamp])
    }

    /// Bytes covered by the envelope signatures: the compact JSON `req` tuple.
    pub fn signing_bytes(&self) -> Vec<u8> {
        self.payload().to_string().into_bytes()
    }
}

/// Encode a signed request into a text frame.
pub fn encode_request(envelope: &Envelope, signatures: &[String]) -> String {
    json!({
        "req": envelope.payload(),
        "sig": signatures,
    })
    .to_string()
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
    pub timestamp: u64,
    pub signatures: Vec<String>,
}

impl RpcResponse {
    pub fn is_error(&self) -> bool {
        self.method == METHOD_ERROR
    }

    /// Error detail for `error` responses.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        let detail = match self.params.first() {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(map)) => map
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(other) => other.to_string(),
            None => "Unknown error".to_string(),
        };
        Some(detail)
    }

    /// Turn an `error` response into an `Err`.
    pub fn into_result(self) -> Result<Self, RpcError> {
        match self.error_message() {
            Some(message) => Err(RpcError::Server(message)),
            None => Ok(self),
        }
    }

    /// First params element as an object field
    fn field(&self, name: &str) -> Option<&Value> {
        self.params.first().and_then(|p| p.get(name))
    }
}

/// Encode a response frame. Used by test peers and tooling.
pub fn encode_response(response: &RpcResponse) -> String {
    json!({
        "res": [response.id, response.method, response.params, response.timestamp],
        "sig": response.signatures,
    })
    .to_string()
}

#[derive(Deserialize)]
struct WireResponse {
    res: (u64, String, Value, Value),
    #[serde(default)]
    sig: Vec<String>,
}

/// Millisecond timestamp; some nodes send it as a float.
fn timestamp_of(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|t| t.is_finite() && *t >= 0.0).map(|t| t as u64))
}

/// Decode a text frame into a response.
///
/// Malformed and unrelated frames come back as `DecodeError`; the caller
/// decides whether to log or escalate.
pub fn decode_response(frame: &str) -> Result<RpcResponse, DecodeError> {
    let value: Value = serde_json::from_str(frame).map_err(|e| DecodeError::Json(e.to_string()))?;
    if value.get("res").is_none() {
        return Err(DecodeError::Shape("missing 'res' field".into()));
    }

    let wire: WireResponse =
        serde_json::from_value(value).map_err(|e| DecodeError::Shape(e.to_string()))?;
    let (id, method, params, timestamp) = wire.res;
    let timestamp = timestamp_of(&timestamp)
        .ok_or_else(|| DecodeError::Shape(format!("invalid timestamp {}", timestamp)))?;

    let params = match params {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    Ok(RpcResponse {
        id,
        method,
        params,
        timestamp,
        signatures: wire.sig,
    })
}

/// Routing class of a frame, decided from the envelope head only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    AuthChallenge { id: u64 },
    AuthVerify { id: u64 },
    Error { id: u64 },
    Application { id: u64, method: String },
    Unparseable,
}

impl FrameKind {
    fn from_head(id: u64, method: String) -> Self {
        match method.as_str() {
            METHOD_AUTH_CHALLENGE => FrameKind::AuthChallenge { id },
            METHOD_AUTH_VERIFY => FrameKind::AuthVerify { id },
            METHOD_ERROR => FrameKind::Error { id },
            _ => FrameKind::Application { id, method },
        }
    }

    /// Kind of an already decoded response.
    pub fn of(response: &RpcResponse) -> Self {
        Self::from_head(response.id, response.method.clone())
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            FrameKind::AuthChallenge { id }
            | FrameKind::AuthVerify { id }
            | FrameKind::Error { id }
            | FrameKind::Application { id, .. } => Some(*id),
            FrameKind::Unparseable => None,
        }
    }

    /// Handshake control frames
    pub fn is_auth_control(&self) -> bool {
        matches!(
            self,
            FrameKind::AuthChallenge { .. } | FrameKind::AuthVerify { .. } | FrameKind::Error { .. }
        )
    }
}

#[derive(Deserialize)]
struct PeekHead(u64, String, IgnoredAny, IgnoredAny);

#[derive(Deserialize)]
struct Peek {
    res: PeekHead,
}

/// Classify a frame without materializing its params.
///
/// Useful where only the head matters, e.g. to say which request a frame
/// that failed to decode was answering.
pub fn classify(frame: &str) -> FrameKind {
    match serde_json::from_str::<Peek>(frame) {
        Ok(Peek { res: PeekHead(id, method, _, _) }) => FrameKind::from_head(id, method),
        Err(_) => FrameKind::Unparseable,
    }
}

/// Params of an `auth_request`.
pub fn auth_request_params(
    wallet: &str,
    session_key: &str,
    auth: &AuthParams,
    expires_at: u64,
) -> Vec<Value> {
    vec![json!({
        "address": wallet,
        "session_key": session_key,
        "application": auth.application,
        "allowances": auth.allowances,
        "scope": auth.scope,
        "expires_at": expires_at,
    })]
}

/// Params of an `auth_verify` answering a challenge.
pub fn verify_challenge_params(challenge: &str) -> Vec<Value> {
    vec![json!({ "challenge": challenge })]
}

/// Params of an `auth_verify` presenting a cached token.
pub fn verify_token_params(token: &str) -> Vec<Value> {
    vec![json!({ "jwt": token })]
}

/// Challenge text carried by an `auth_challenge` response.
pub fn challenge_of(response: &RpcResponse) -> Option<String> {
    if let Some(Value::String(s)) = response.params.first() {
        return Some(s.clone());
    }
    response
        .field("challenge_message")
        .or_else(|| response.field("challenge"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Outcome carried by an `auth_verify` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub success: bool,
    pub token: Option<String>,
    pub address: Option<String>,
    pub session_key: Option<String>,
}

pub fn verify_result_of(response: &RpcResponse) -> VerifyResult {
    let string = |name: &str| response.field(name).and_then(Value::as_str).map(str::to_string);
    VerifyResult {
        success: response
            .field("success")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        token: string("jwt_token").or_else(|| string("jwt")),
        address: string("address"),
        session_key: string("session_key"),
    }
}

/// Structure the wallet signs to approve a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengePayload {
    pub challenge: String,
    pub scope: String,
    pub application: String,
    pub wallet: String,
    pub session_key: String,
    pub expires_at: u64,
    pub allowances: Vec<Allowance>,
}

impl ChallengePayload {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, RpcError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Current wall clock in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
