//! Shared helpers for driving a `ConnectionManager` over the in-memory transport

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::auth::{AuthNegotiator, CredentialStore, GuestIdentity, TokenRefresher};
use tether::transport::{ChannelAcceptor, ChannelConnector, ChannelPeer};
use tether::{ClientConfig, ConnectionManager, ConnectionState, Envelope};
use tether_shared::{AuthErrorCode, AuthErrorInfo, SessionCreated};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};

pub const GUEST_PREFIX: &str = "guest_";

/// Credential store and guest identity that journal every call
#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<String>>,
    access: Mutex<Option<String>>,
    refresh: Mutex<Option<String>>,
    minted: Mutex<u32>,
}

impl RecordingStore {
    pub fn with_tokens(access: Option<&str>, refresh: Option<&str>) -> Arc<Self> {
        let store = Self::default();
        *store.access.lock().unwrap() = access.map(str::to_string);
        *store.refresh.lock().unwrap() = refresh.map(str::to_string);
        Arc::new(store)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls().iter().any(|c| c == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == name)
    }

    pub fn stored_access(&self) -> Option<String> {
        self.access.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl CredentialStore for RecordingStore {
    fn access_token(&self) -> Option<String> {
        self.record("access_token");
        self.access.lock().unwrap().clone()
    }

    fn set_access_token(&self, token: &str) {
        self.record("set_access_token");
        *self.access.lock().unwrap() = Some(token.to_string());
    }

    fn refresh_token(&self) -> Option<String> {
        self.record("refresh_token");
        self.refresh.lock().unwrap().clone()
    }
}

impl GuestIdentity for RecordingStore {
    fn generate_guest_token(&self) -> String {
        self.record("generate_guest_token");
        let mut minted = self.minted.lock().unwrap();
        *minted += 1;
        format!("{}{}", GUEST_PREFIX, minted)
    }

    fn is_guest_token(&self, token: &str) -> bool {
        token.starts_with(GUEST_PREFIX)
    }
}

/// Refresher that hands out a fixed token, or fails
pub struct FixedRefresher(pub Option<String>);

#[async_trait]
impl TokenRefresher for FixedRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<String> {
        self.0.clone().ok_or_else(|| anyhow!("refresh rejected"))
    }
}

/// Refresher that succeeds only after a delay
pub struct SlowRefresher {
    pub delay: Duration,
    pub token: String,
}

#[async_trait]
impl TokenRefresher for SlowRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<String> {
        sleep(self.delay).await;
        Ok(self.token.clone())
    }
}

/// Every state broadcast, with the (virtual) time it was observed
#[derive(Clone, Default)]
pub struct StateLog {
    entries: Arc<Mutex<Vec<(ConnectionState, Instant)>>>,
    changed: Arc<Notify>,
}

impl StateLog {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let log = Self::default();
        let handle = log.clone();
        manager.on_connection_state_change(move |state| {
            handle.entries.lock().unwrap().push((state, Instant::now()));
            handle.changed.notify_one();
        });
        log
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.entries.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn entries(&self) -> Vec<(ConnectionState, Instant)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn count(&self, state: ConnectionState) -> usize {
        self.states().iter().filter(|s| **s == state).count()
    }

    /// Time of the `nth` (1-based) broadcast of `state`
    pub fn nth_time(&self, state: ConnectionState, nth: usize) -> Option<Instant> {
        self.entries()
            .into_iter()
            .filter(|(s, _)| *s == state)
            .nth(nth.saturating_sub(1))
            .map(|(_, at)| at)
    }

    /// Wait until `state` has been broadcast at least `nth` times
    pub async fn wait_for_nth(&self, state: ConnectionState, nth: usize) {
        let reached = timeout(Duration::from_secs(600), async {
            while self.count(state) < nth {
                self.changed.notified().await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "timed out waiting for {} #{}; saw {:?}",
            state,
            nth,
            self.states()
        );
    }

    pub async fn wait_for(&self, state: ConnectionState) {
        self.wait_for_nth(state, 1).await;
    }
}

pub struct Harness {
    pub manager: ConnectionManager,
    pub connector: ChannelConnector,
    pub acceptor: ChannelAcceptor,
    pub store: Arc<RecordingStore>,
    pub states: StateLog,
}

pub fn harness(store: Arc<RecordingStore>) -> Harness {
    build(store, None)
}

pub fn harness_with_refresher<R>(store: Arc<RecordingStore>, refresher: R) -> Harness
where
    R: TokenRefresher + 'static,
{
    build(store, Some(Arc::new(refresher)))
}

fn build(store: Arc<RecordingStore>, refresher: Option<Arc<dyn TokenRefresher>>) -> Harness {
    let (connector, acceptor) = ChannelConnector::new();
    let mut auth = AuthNegotiator::new(store.clone(), store.clone());
    if let Some(refresher) = refresher {
        auth = auth.with_refresher(refresher);
    }

    let manager = ConnectionManager::new(ClientConfig::default(), connector.clone(), auth);
    let states = StateLog::attach(&manager);
    Harness {
        manager,
        connector,
        acceptor,
        store,
        states,
    }
}

/// Let every runnable task finish its work
pub async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

pub fn session_created(session_id: &str, is_guest: bool) -> Envelope {
    Envelope::session_created(&SessionCreated {
        session_id: session_id.to_string(),
        user_id: "user-1".to_string(),
        is_guest,
        timestamp: Some(1_700_000_000_000),
    })
}

pub fn auth_error(code: AuthErrorCode) -> Envelope {
    Envelope::auth_error(&AuthErrorInfo {
        code,
        message: "rejected".to_string(),
        timestamp: None,
    })
}

/// Accept the next open and confirm its session
pub async fn accept_and_confirm(acceptor: &mut ChannelAcceptor, session_id: &str) -> ChannelPeer {
    let peer = acceptor.accept().await.expect("connector alive");
    let is_guest = peer.credential.kind.is_guest();
    assert!(peer.send(session_created(session_id, is_guest)));
    peer
}
