//! Authentication State Machine
//!
//! Single responsibility: Decide what the handshake does next.
//!
//! The machine performs no I/O. The connection actor feeds it inputs (socket
//! open, decoded handshake frames, approval, signatures, timeouts) and carries
//! out the [`AuthAction`]s it returns. Keeping it pure makes every path of the
//! handshake testable without a socket.
//!
//! # Handshake
//!
//! ```text
//!                 cached token?
//!          yes ┌───────┴────────┐ no
//!              ▼                ▼
//!       AwaitingToken ──► AwaitingChallenge ──► PendingApproval
//!        (credential      (once per attempt)        │ approve()
//!         rejected)                                 ▼
//!              │                                 Signing
//!              │                                    │ signature
//!              ▼                                    ▼
//!        Authenticated ◄──────────────────── AwaitingVerify
//! ```
//!
//! `reject()` and a signer answering `UserRejected` both end the attempt as
//! a decline. Only one attempt exists at a time: `start()` while an attempt is in
//! flight does nothing, and the caller joins the running attempt.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::protocol::{
    auth_request_params, challenge_of, verify_challenge_params, verify_result_of,
    verify_token_params, ChallengePayload, Envelope, FrameKind, RpcResponse, Sequence,
    VerifyResult, METHOD_AUTH_REQUEST, METHOD_AUTH_VERIFY,
};
use crate::config::AuthParams;
use crate::credentials::Credential;
use crate::error::{is_credential_message, RpcError};

/// A challenge waiting for the caller's approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub challenge: String,
    pub received_at: DateTime<Utc>,
}

/// Who is authenticating, and for what.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Address of the wallet signer
    pub wallet: String,
    /// Address of the session key
    pub session_key: String,
    pub params: AuthParams,
}

/// Observable handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    AwaitingToken,
    AwaitingChallenge,
    PendingApproval,
    Signing,
    AwaitingVerify,
    Authenticated,
}

enum State {
    Idle,
    AwaitingToken { request_id: u64 },
    AwaitingChallenge { request_id: u64 },
    PendingApproval { challenge: PendingChallenge },
    Signing { challenge: PendingChallenge },
    AwaitingVerify { request_id: u64 },
    Authenticated,
}

/// Work the connection actor must carry out.
#[derive(Debug)]
pub enum AuthAction {
    /// Sign with the session key and transmit
    Send(Envelope),
    /// Transmit carrying a signature the wallet already produced
    SendSigned { envelope: Envelope, signature: String },
    /// Delete the cached token
    DiscardToken,
    /// Pause and ask the caller to approve
    SurfaceChallenge(PendingChallenge),
    /// Handshake complete; cache the token if the node issued one
    Authenticated { token: Option<String> },
    /// The attempt is over and failed
    Failed(RpcError),
    /// Signing failed but the challenge is still pending
    ApprovalFailed(RpcError),
    /// The user declined the challenge
    Declined,
}

pub struct AuthMachine {
    sequence: Sequence,
    state: State,
    context: Option<AuthContext>,
    /// Session expiry announced in the current auth request
    expires_at: u64,
    token_fallback_used: bool,
}

impl AuthMachine {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            sequence,
            state: State::Idle,
            context: None,
            expires_at: 0,
            token_fallback_used: false,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        match self.state {
            State::Idle => AuthPhase::Idle,
            State::AwaitingToken { .. } => AuthPhase::AwaitingToken,
            State::AwaitingChallenge { .. } => AuthPhase::AwaitingChallenge,
            State::PendingApproval { .. } => AuthPhase::PendingApproval,
            State::Signing { .. } => AuthPhase::Signing,
            State::AwaitingVerify { .. } => AuthPhase::AwaitingVerify,
            State::Authenticated => AuthPhase::Authenticated,
        }
    }

    /// An attempt is running (including paused for approval).
    pub fn in_flight(&self) -> bool {
        !matches!(self.state, State::Idle | State::Authenticated)
    }

    /// Waiting on the node, so the handshake timeout applies.
    pub fn awaiting_node(&self) -> bool {
        matches!(
            self.state,
            State::AwaitingToken { .. } | State::AwaitingChallenge { .. } | State::AwaitingVerify { .. }
        )
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Authenticated)
    }

    pub fn pending_challenge(&self) -> Option<&PendingChallenge> {
        match &self.state {
            State::PendingApproval { challenge } | State::Signing { challenge } => Some(challenge),
            _ => None,
        }
    }

    /// Begin an attempt.
    ///
    /// Uses `cached` when present; the caller is expected to have dropped
    /// expired tokens already. Returns no actions when an attempt is already
    /// in flight.
    pub fn start(&mut self, context: AuthContext, cached: Option<Credential>) -> Vec<AuthAction> {
        if self.in_flight() {
            debug!(phase = ?self.phase(), "Authentication already in flight, joining it");
            return Vec::new();
        }

        self.context = Some(context);
        self.token_fallback_used = false;

        match cached {
            Some(credential) => {
                let envelope = Envelope::new(
                    self.sequence.next(),
                    METHOD_AUTH_VERIFY,
                    verify_token_params(credential.token()),
                );
                debug!(id = envelope.id, "Authenticating with cached token");
                self.state = State::AwaitingToken {
                    request_id: envelope.id,
                };
                vec![AuthAction::Send(envelope)]
            }
            None => vec![self.request_challenge()],
        }
    }

    fn request_challenge(&mut self) -> AuthAction {
        let Some(context) = self.context.as_ref() else {
            self.state = State::Idle;
            return AuthAction::Failed(RpcError::Authentication("No identity to authenticate".into()));
        };

        self.expires_at = (Utc::now().timestamp().max(0) as u64) + context.params.session_expiry_secs;
        let envelope = Envelope::new(
            self.sequence.next(),
            METHOD_AUTH_REQUEST,
            auth_request_params(&context.wallet, &context.session_key, &context.params, self.expires_at),
        );
        debug!(id = envelope.id, wallet = %context.wallet, "Requesting auth challenge");
        self.state = State::AwaitingChallenge {
            request_id: envelope.id,
        };
        AuthAction::Send(envelope)
    }

    /// Offer a decoded frame to the handshake.
    ///
    /// Returns `None` when the frame belongs to the application, otherwise
    /// the actions it triggers (possibly none, for stale frames). Handshake
    /// frames only count when they answer the request the machine is waiting
    /// on; anything else is left for the correlator.
    pub fn on_frame(&mut self, kind: &FrameKind, response: &RpcResponse) -> Option<Vec<AuthAction>> {
        if !kind.is_auth_control() {
            return None;
        }

        match kind {
            FrameKind::AuthChallenge { id } if self.is_authenticated() => {
                debug!(id = *id, "Ignoring auth challenge on an authenticated session");
                Some(Vec::new())
            }
            FrameKind::AuthChallenge { id } if self.awaits_id(*id) => Some(self.on_challenge(*id, response)),
            FrameKind::AuthVerify { id } if self.awaits_id(*id) => Some(self.on_verify(*id, response)),
            FrameKind::Error { id } if self.awaits_id(*id) => {
                let message = response
                    .error_message()
                    .unwrap_or_else(|| "Unknown error".to_string());
                Some(self.on_rejected(message))
            }
            _ => None,
        }
    }

    fn awaits_id(&self, id: u64) -> bool {
        match self.state {
            State::AwaitingToken { request_id }
            | State::AwaitingChallenge { request_id }
            | State::AwaitingVerify { request_id } => request_id == id,
            _ => false,
        }
    }

    fn on_challenge(&mut self, id: u64, response: &RpcResponse) -> Vec<AuthAction> {
        if !matches!(self.state, State::AwaitingChallenge { .. }) {
            debug!(id = id, phase = ?self.phase(), "Ignoring unexpected auth challenge");
            return Vec::new();
        }

        let Some(challenge) = challenge_of(response) else {
            self.state = State::Idle;
            return vec![AuthAction::Failed(RpcError::Protocol(
                "Auth challenge frame carries no challenge".into(),
            ))];
        };

        let pending = PendingChallenge {
            challenge,
            received_at: Utc::now(),
        };
        info!(id = id, "Auth challenge received, waiting for approval");
        self.state = State::PendingApproval {
            challenge: pending.clone(),
        };
        vec![AuthAction::SurfaceChallenge(pending)]
    }

    /// Why a verify result names someone other than us, if it does.
    fn identity_mismatch(&self, result: &VerifyResult) -> Option<String> {
        let context = self.context.as_ref()?;
        if let Some(address) = result.address.as_deref() {
            if !address.eq_ignore_ascii_case(&context.wallet) {
                return Some(format!("node verified wallet {} instead of {}", address, context.wallet));
            }
        }
        if let Some(session_key) = result.session_key.as_deref() {
            if !session_key.eq_ignore_ascii_case(&context.session_key) {
                return Some(format!(
                    "node verified session key {} instead of {}",
                    session_key, context.session_key
                ));
            }
        }
        None
    }

    fn on_verify(&mut self, id: u64, response: &RpcResponse) -> Vec<AuthAction> {
        let result = verify_result_of(response);
        let mismatch = self.identity_mismatch(&result);
        match self.state {
            State::AwaitingToken { .. } | State::AwaitingVerify { .. } if result.success && mismatch.is_none() => {
                info!(id = id, "Authenticated");
                self.state = State::Authenticated;
                vec![AuthAction::Authenticated {
                    token: result.token,
                }]
            }
            State::AwaitingToken { .. } => {
                // A rejected or misattributed token is a credential problem by definition
                let detail = mismatch.unwrap_or_else(|| "rejected by node".to_string());
                self.on_rejected(format!("Token verification failed: {}", detail))
            }
            State::AwaitingVerify { .. } => {
                let detail = mismatch.unwrap_or_else(|| "rejected by node".to_string());
                self.on_rejected(format!("Challenge verification failed: {}", detail))
            }
            _ => {
                debug!(id = id, phase = ?self.phase(), "Ignoring unexpected verify result");
                Vec::new()
            }
        }
    }

    fn on_rejected(&mut self, message: String) -> Vec<AuthAction> {
        match self.state {
            State::AwaitingToken { .. } if is_credential_message(&message) => {
                if self.token_fallback_used {
                    self.state = State::Idle;
                    return vec![
                        AuthAction::DiscardToken,
                        AuthAction::Failed(RpcError::Authentication(message)),
                    ];
                }
                warn!(error = %message, "Cached token rejected, falling back to challenge");
                self.token_fallback_used = true;
                vec![AuthAction::DiscardToken, self.request_challenge()]
            }
            _ => {
                warn!(error = %message, phase = ?self.phase(), "Authentication rejected");
                self.state = State::Idle;
                vec![AuthAction::Failed(RpcError::Authentication(message))]
            }
        }
    }

    /// Approve the pending challenge, producing what the wallet must sign.
    pub fn approve(&mut self) -> Result<ChallengePayload, RpcError> {
        let State::PendingApproval { challenge } = &self.state else {
            return Err(RpcError::Authentication(format!(
                "No challenge awaiting approval (phase: {:?})",
                self.phase()
            )));
        };
        let challenge = challenge.clone();
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| RpcError::Authentication("No identity to authenticate".into()))?;

        let payload = ChallengePayload {
            challenge: challenge.challenge.clone(),
            scope: context.params.scope.clone(),
            application: context.params.application.clone(),
            wallet: context.wallet.clone(),
            session_key: context.session_key.clone(),
            expires_at: self.expires_at,
            allowances: context.params.allowances.clone(),
        };
        self.state = State::Signing { challenge };
        Ok(payload)
    }

    /// Feed back the wallet's answer to the payload returned by `approve`.
    pub fn on_signature(&mut self, result: Result<String, RpcError>) -> Vec<AuthAction> {
        let challenge = match &self.state {
            State::Signing { challenge } => challenge.clone(),
            _ => {
                debug!(phase = ?self.phase(), "Ignoring signature outside of signing phase");
                return Vec::new();
            }
        };

        match result {
            Ok(signature) => {
                let envelope = Envelope::new(
                    self.sequence.next(),
                    METHOD_AUTH_VERIFY,
                    verify_challenge_params(&challenge.challenge),
                );
                debug!(id = envelope.id, "Sending signed challenge");
                self.state = State::AwaitingVerify {
                    request_id: envelope.id,
                };
                vec![AuthAction::SendSigned {
                    envelope,
                    signature,
                }]
            }
            Err(RpcError::UserRejected(reason)) => {
                info!(reason = %reason, "Signer declined the challenge");
                self.state = State::Idle;
                vec![AuthAction::Declined]
            }
            Err(e) => {
                warn!(error = %e, "Signer failed, challenge still pending");
                self.state = State::PendingApproval { challenge };
                vec![AuthAction::ApprovalFailed(e)]
            }
        }
    }

    /// Decline the pending challenge.
    pub fn reject(&mut self) -> Result<PendingChallenge, RpcError> {
        let State::PendingApproval { challenge } = &self.state else {
            return Err(RpcError::Authentication(format!(
                "No challenge awaiting approval (phase: {:?})",
                self.phase()
            )));
        };
        let challenge = challenge.clone();
        self.state = State::Idle;
        Ok(challenge)
    }

    /// Drop a challenge nobody approved in time. Returns whether one was pending.
    pub fn expire_challenge(&mut self) -> bool {
        if matches!(self.state, State::PendingApproval { .. }) {
            self.state = State::Idle;
            true
        } else {
            false
        }
    }

    /// Abandon the attempt after the node stopped answering.
    pub fn abort(&mut self) {
        if self.in_flight() {
            debug!(phase = ?self.phase(), "Aborting authentication attempt");
        }
        self.state = State::Idle;
    }

    /// Forget everything about the previous connection.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.token_fallback_used = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::decode_response;
    use serde_json::{json, Value};

    fn context() -> AuthContext {
        AuthContext {
            wallet: "0xwallet".into(),
            session_key: "0xsession".into(),
            params: AuthParams::default(),
        }
    }

    fn feed(machine: &mut AuthMachine, id: u64, method: &str, params: Value) -> Option<Vec<AuthAction>> {
        let text = json!({ "res": [id, method, params, 0], "sig": [] }).to_string();
        let response = decode_response(&text).unwrap();
        machine.on_frame(&FrameKind::of(&response), &response)
    }

    fn sent(actions: &[AuthAction]) -> &Envelope {
        actions
            .iter()
            .find_map(|a| match a {
                AuthAction::Send(envelope) => Some(envelope),
                _ => None,
            })
            .expect("no Send action")
    }

    #[test]
    fn test_challenge_handshake() {
        let mut machine = AuthMachine::new(Sequence::new());
        let actions = machine.start(context(), None);
        let request = sent(&actions).clone();
        assert_eq!(request.method, METHOD_AUTH_REQUEST);
        assert_eq!(request.params[0]["address"], "0xwallet");
        assert_eq!(machine.phase(), AuthPhase::AwaitingChallenge);

        let actions = feed(&mut machine, request.id, "auth_challenge", json!([{"challenge_message": "chal-123"}])).unwrap();
        assert!(matches!(&actions[..], [AuthAction::SurfaceChallenge(c)] if c.challenge == "chal-123"));
        assert_eq!(machine.pending_challenge().unwrap().challenge, "chal-123");

        let payload = machine.approve().unwrap();
        assert_eq!(payload.challenge, "chal-123");
        assert_eq!(payload.session_key, "0xsession");
        assert_eq!(payload.expires_at, request.params[0]["expires_at"].as_u64().unwrap());
        assert_eq!(machine.phase(), AuthPhase::Signing);

        let actions = machine.on_signature(Ok("0xwalletsig".into()));
        let verify_id = match &actions[..] {
            [AuthAction::SendSigned { envelope, signature }] => {
                assert_eq!(envelope.method, METHOD_AUTH_VERIFY);
                assert_eq!(envelope.params[0]["challenge"], "chal-123");
                assert_eq!(signature, "0xwalletsig");
                envelope.id
            }
            other => panic!("unexpected actions: {:?}", other),
        };

        let actions = feed(&mut machine, verify_id, "auth_verify", json!([{"success": true, "jwt_token": "jwt-abc"}])).unwrap();
        assert!(matches!(&actions[..], [AuthAction::Authenticated { token: Some(t) }] if t == "jwt-abc"));
        assert!(machine.is_authenticated());
        assert!(!machine.in_flight());
    }

    #[test]
    fn test_cached_token_single_round_trip() {
        let mut machine = AuthMachine::new(Sequence::new());
        let actions = machine.start(context(), Some(Credential::new("jwt-abc")));
        let verify = sent(&actions).clone();
        assert_eq!(verify.method, METHOD_AUTH_VERIFY);
        assert_eq!(verify.params[0]["jwt"], "jwt-abc");
        assert_eq!(machine.phase(), AuthPhase::AwaitingToken);

        let actions = feed(&mut machine, verify.id, "auth_verify", json!([{"success": true}])).unwrap();
        assert!(matches!(&actions[..], [AuthAction::Authenticated { token: None }]));
    }

    #[test]
    fn test_rejected_token_falls_back_to_challenge_once() {
        let mut machine = AuthMachine::new(Sequence::new());
        let actions = machine.start(context(), Some(Credential::new("jwt-old")));
        let verify_id = sent(&actions).id;

        let actions = feed(&mut machine, verify_id, "error", json!(["token expired"])).unwrap();
        assert!(matches!(actions[0], AuthAction::DiscardToken));
        let request = sent(&actions).clone();
        assert_eq!(request.method, METHOD_AUTH_REQUEST);
        assert_eq!(machine.phase(), AuthPhase::AwaitingChallenge);

        // A failure on the challenge path ends the attempt
        let actions = feed(&mut machine, request.id, "error", json!(["invalid token"])).unwrap();
        assert!(matches!(&actions[..], [AuthAction::Failed(RpcError::Authentication(_))]));
        assert_eq!(machine.phase(), AuthPhase::Idle);
    }

    #[test]
    fn test_unsuccessful_token_verify_falls_back() {
        let mut machine = AuthMachine::new(Sequence::new());
        let actions = machine.start(context(), Some(Credential::new("jwt-old")));
        let verify_id = sent(&actions).id;

        let actions = feed(&mut machine, verify_id, "auth_verify", json!([{"success": false}])).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(sent(&actions).method, METHOD_AUTH_REQUEST);
    }

    #[test]
    fn test_non_credential_token_error_fails() {
        let mut machine = AuthMachine::new(Sequence::new());
        let actions = machine.start(context(), Some(Credential::new("jwt-abc")));
        let verify_id = sent(&actions).id;

        let actions = feed(&mut machine, verify_id, "error", json!(["rate limited"])).unwrap();
        assert!(matches!(&actions[..], [AuthAction::Failed(_)]));
    }

    #[test]
    fn test_start_while_in_flight_joins() {
        let mut machine = AuthMachine::new(Sequence::new());
        assert_eq!(machine.start(context(), None).len(), 1);
        assert!(machine.start(context(), None).is_empty());
        assert_eq!(machine.phase(), AuthPhase::AwaitingChallenge);
    }

    #[test]
    fn test_unrelated_frames_are_not_consumed() {
        let mut machine = AuthMachine::new(Sequence::new());
        let request_id = sent(&machine.start(context(), None)).id;

        assert!(feed(&mut machine, 99, "get_config", json!([])).is_none());
        assert!(feed(&mut machine, request_id + 50, "error", json!(["boom"])).is_none());
        assert_eq!(machine.phase(), AuthPhase::AwaitingChallenge);
    }

    #[test]
    fn test_handshake_frames_while_idle_go_to_the_application() {
        let mut machine = AuthMachine::new(Sequence::new());
        assert!(feed(&mut machine, 1, "auth_challenge", json!([{"challenge_message": "late"}])).is_none());
        assert!(feed(&mut machine, 1, "auth_verify", json!([{"success": true}])).is_none());
        assert_eq!(machine.phase(), AuthPhase::Idle);
    }

    #[test]
    fn test_handshake_frames_must_answer_the_awaited_request() {
        let mut machine = AuthMachine::new(Sequence::new());
        let verify_id = sent(&machine.start(context(), Some(Credential::new("jwt-abc")))).id;

        assert!(feed(&mut machine, verify_id + 7, "auth_verify", json!([{"success": true}])).is_none());
        assert_eq!(machine.phase(), AuthPhase::AwaitingToken);

        let actions = feed(&mut machine, verify_id, "auth_verify", json!([{"success": true}])).unwrap();
        assert!(matches!(&actions[..], [AuthAction::Authenticated { .. }]));

        // Challenges on an authenticated session are swallowed
        let actions = feed(&mut machine, 99, "auth_challenge", json!(["chal"])).unwrap();
        assert!(actions.is_empty());
        assert!(machine.is_authenticated());
    }

    #[test]
    fn test_verify_for_another_wallet_is_rejected() {
        let mut machine = AuthMachine::new(Sequence::new());
        let verify_id = sent(&machine.start(context(), Some(Credential::new("jwt-other")))).id;

        // On the token path that means the token is not ours: fall back
        let actions = feed(
            &mut machine,
            verify_id,
            "auth_verify",
            json!([{"success": true, "address": "0xsomeoneelse"}]),
        )
        .unwrap();
        assert!(matches!(actions[0], AuthAction::DiscardToken));
        let request = sent(&actions).clone();
        assert_eq!(request.method, METHOD_AUTH_REQUEST);

        feed(&mut machine, request.id, "auth_challenge", json!(["chal-1"])).unwrap();
        machine.approve().unwrap();
        let verify_id = match &machine.on_signature(Ok("0xsig".into()))[..] {
            [AuthAction::SendSigned { envelope, .. }] => envelope.id,
            other => panic!("unexpected actions: {:?}", other),
        };

        let actions = feed(
            &mut machine,
            verify_id,
            "auth_verify",
            json!([{"success": true, "address": "0xWALLET", "session_key": "0xother"}]),
        )
        .unwrap();
        assert!(matches!(&actions[..], [AuthAction::Failed(RpcError::Authentication(m))] if m.contains("session key")));
        assert!(!machine.is_authenticated());
    }

    #[test]
    fn test_verify_address_compares_case_insensitively() {
        let mut machine = AuthMachine::new(Sequence::new());
        let verify_id = sent(&machine.start(context(), Some(Credential::new("jwt-abc")))).id;
        let actions = feed(
            &mut machine,
            verify_id,
            "auth_verify",
            json!([{"success": true, "address": "0xWALLET", "session_key": "0xSession"}]),
        )
        .unwrap();
        assert!(matches!(&actions[..], [AuthAction::Authenticated { .. }]));
    }

    #[test]
    fn test_reject_and_signer_outcomes() {
        let mut machine = AuthMachine::new(Sequence::new());
        assert!(machine.approve().is_err());
        assert!(machine.reject().is_err());

        let request_id = sent(&machine.start(context(), None)).id;
        feed(&mut machine, request_id, "auth_challenge", json!(["chal-1"])).unwrap();

        // Signer failure keeps the challenge pending
        machine.approve().unwrap();
        let actions = machine.on_signature(Err(RpcError::Signer("device unplugged".into())));
        assert!(matches!(&actions[..], [AuthAction::ApprovalFailed(_)]));
        assert_eq!(machine.phase(), AuthPhase::PendingApproval);

        // Declining inside the wallet ends the attempt
        machine.approve().unwrap();
        let actions = machine.on_signature(Err(RpcError::UserRejected("no".into())));
        assert!(matches!(&actions[..], [AuthAction::Declined]));
        assert_eq!(machine.phase(), AuthPhase::Idle);

        let request_id = sent(&machine.start(context(), None)).id;
        feed(&mut machine, request_id, "auth_challenge", json!(["chal-2"])).unwrap();
        assert_eq!(machine.reject().unwrap().challenge, "chal-2");
        assert!(machine.pending_challenge().is_none());
    }

    #[test]
    fn test_expire_challenge() {
        let mut machine = AuthMachine::new(Sequence::new());
        assert!(!machine.expire_challenge());

        let request_id = sent(&machine.start(context(), None)).id;
        feed(&mut machine, request_id, "auth_challenge", json!(["chal-1"])).unwrap();
        assert!(!machine.awaiting_node());
        assert!(machine.expire_challenge());
        assert_eq!(machine.phase(), AuthPhase::Idle);
    }

    #[test]
    fn test_missing_challenge_is_protocol_failure() {
        let mut machine = AuthMachine::new(Sequence::new());
        let request_id = sent(&machine.start(context(), None)).id;
        let actions = feed(&mut machine, request_id, "auth_challenge", json!([{}])).unwrap();
        assert!(matches!(&actions[..], [AuthAction::Failed(RpcError::Protocol(_))]));
    }
}
