//! Shared helpers for client integration tests.
//!
//! The node is played by the test through [`MemoryPeer`]s handed out by a
//! [`MemoryConnector`]; every (re)connect yields a fresh peer.

#![allow(dead_code)]

use channel_rpc::rpc::{MemoryConnector, MemoryPeer};
use channel_rpc::{
    ClientConfig, ClientEvent, ConnectionStatus, Credential, MemoryCredentialStore,
    PendingChallenge, RpcClient, RpcError, SessionKey, Signer,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Config with timers far enough out that they only fire when a test asks.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 5_000,
        auth_timeout_ms: 10_000,
        challenge_timeout_ms: 0,
        heartbeat_interval_ms: 3_600_000,
        challenge_keepalive_ms: 3_600_000,
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 1_000,
        max_retries: 5,
        ..ClientConfig::for_url("ws://node.test/ws")
    }
}

/// A request as the node sees it.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
    pub signatures: Vec<String>,
    /// The raw `req` tuple
    pub req: Value,
}

impl WireRequest {
    /// Bytes the envelope signature covers
    pub fn signing_bytes(&self) -> Vec<u8> {
        self.req.to_string().into_bytes()
    }
}

pub async fn next_request(peer: &mut MemoryPeer) -> WireRequest {
    let text = peer.recv().await.expect("client closed the connection");
    let value: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
    let req = value["req"].clone();
    WireRequest {
        id: req[0].as_u64().expect("request id"),
        method: req[1].as_str().expect("request method").to_string(),
        params: req[2].as_array().cloned().unwrap_or_default(),
        signatures: serde_json::from_value(value["sig"].clone()).unwrap_or_default(),
        req,
    }
}

pub fn respond(peer: &MemoryPeer, id: u64, method: &str, params: Value) {
    let frame = json!({ "res": [id, method, params, 0], "sig": [] }).to_string();
    assert!(peer.send(frame), "client went away");
}

pub async fn wait_for_status(client: &RpcClient, status: ConnectionStatus) {
    let mut watch = client.status_watch();
    tokio::time::timeout(Duration::from_secs(600), watch.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("status never became {}", status))
        .expect("client shut down");
}

pub async fn next_challenge(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> PendingChallenge {
    loop {
        match events.recv().await.expect("event stream closed") {
            ClientEvent::ChallengeReceived(challenge) => return challenge,
            _ => continue,
        }
    }
}

/// Approve every challenge the client surfaces.
pub fn auto_approve(client: &RpcClient) -> JoinHandle<()> {
    let mut events = client.subscribe();
    let client = client.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ClientEvent::ChallengeReceived(_) = event {
                let client = client.clone();
                tokio::spawn(async move {
                    let _ = client.approve_challenge().await;
                });
            }
        }
    })
}

pub struct Harness {
    pub client: RpcClient,
    pub connector: MemoryConnector,
    pub accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    pub store: Arc<MemoryCredentialStore>,
    pub session_key: SessionKey,
    pub wallet: SessionKey,
}

impl Harness {
    pub fn new(config: ClientConfig, store: MemoryCredentialStore) -> Self {
        Self::build(config, store, SessionKey::generate(), SessionKey::generate())
    }

    /// Harness whose store already holds `token`, issued to the harness identity.
    pub fn with_cached_token(config: ClientConfig, token: &str) -> Self {
        let session_key = SessionKey::generate();
        let wallet = SessionKey::generate();
        let credential = Credential::new(token).issued_to(wallet.address(), session_key.address());
        Self::build(config, MemoryCredentialStore::with_credential(credential), session_key, wallet)
    }

    fn build(
        config: ClientConfig,
        store: MemoryCredentialStore,
        session_key: SessionKey,
        wallet: SessionKey,
    ) -> Self {
        let (connector, accepted) = MemoryConnector::new();
        let store = Arc::new(store);
        let client = RpcClient::new(config, Arc::new(connector.clone()), store.clone())
            .expect("test config is valid");
        Self {
            client,
            connector,
            accepted,
            store,
            session_key,
            wallet,
        }
    }

    pub fn wallet_signer(&self) -> Arc<dyn Signer> {
        Arc::new(self.wallet.clone())
    }

    pub fn wallet_address(&self) -> String {
        self.wallet.address().to_string()
    }

    pub fn spawn_connect(&self) -> JoinHandle<Result<(), RpcError>> {
        let client = self.client.clone();
        let session_key = self.session_key.clone();
        let wallet = self.wallet_signer();
        tokio::spawn(async move { client.connect(session_key, wallet).await })
    }

    pub async fn accept(&mut self) -> MemoryPeer {
        self.accepted.recv().await.expect("connector dropped")
    }

    /// Connect through the cached-token path and return the node's end.
    pub async fn connect_with_token(&mut self) -> MemoryPeer {
        let connecting = self.spawn_connect();
        let mut peer = self.accept().await;

        let verify = next_request(&mut peer).await;
        assert_eq!(verify.method, "auth_verify");
        assert!(verify.params[0]["jwt"].is_string());
        respond(&peer, verify.id, "auth_verify", json!([{ "success": true }]));

        connecting.await.unwrap().unwrap();
        peer
    }
}
