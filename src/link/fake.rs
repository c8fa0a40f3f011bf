//! In-process fake link client
//!
//! [`FakeLink`] implements [`LinkClient`] without any network I/O. Tests
//! script the outcome of each `connect` call, seed the hierarchy and tokens
//! it returns, and read call counters afterwards to assert on behaviour such
//! as "the transient link was torn down" or "the hierarchy was fetched once".
//!
//! [`FakeLinkFactory`] hands out queued fakes (or fresh defaults) and keeps
//! every instance it created for later inspection.
//!
//! # Example
//!
//! ```
//! use lightwave_smart::link::fake::{ConnectOutcome, FakeLink};
//! use lightwave_smart::link::LinkClient;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let link = FakeLink::new();
//! link.script_connect([ConnectOutcome::Refused]);
//!
//! assert!(!link.connect().await.unwrap());
//! // Once the script runs out every attempt succeeds.
//! assert!(link.connect().await.unwrap());
//! assert_eq!(link.connect_calls(), 2);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::auth::token_store::{CredentialSet, TokenSet};
use crate::error::{LightwaveError, Result};
use crate::link::hierarchy::{HierarchyBuilder, HierarchySnapshot};
use crate::link::{LinkClient, LinkFactory, TokenRefresh};

/// What the next `connect` call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// `Ok(false)`: refused without a reason.
    Refused,
    /// Transport failure ([`LightwaveError::CannotConnect`]).
    Fail(String),
    /// Credential rejection ([`LightwaveError::InvalidAuth`]).
    AuthError(String),
    /// Untyped error carrying only a message.
    Message(String),
    /// Panics inside `connect`.
    Panic,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted [`LinkClient`].
#[derive(Debug)]
pub struct FakeLink {
    script: Mutex<VecDeque<ConnectOutcome>>,
    hierarchy: Mutex<HierarchySnapshot>,
    fetch_error: Mutex<Option<String>>,
    tokens: Mutex<Option<TokenSet>>,
    credentials: Mutex<Option<CredentialSet>>,
    refresh_tx: broadcast::Sender<TokenRefresh>,
    open: AtomicBool,
    fail_disconnect: AtomicBool,
    stall: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl Default for FakeLink {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLink {
    /// A link that always connects, returns an empty complete hierarchy and
    /// holds no tokens.
    pub fn new() -> Self {
        let (refresh_tx, _) = broadcast::channel(16);
        Self {
            script: Mutex::new(VecDeque::new()),
            hierarchy: Mutex::new(HierarchyBuilder::new().finish()),
            fetch_error: Mutex::new(None),
            tokens: Mutex::new(None),
            credentials: Mutex::new(None),
            refresh_tx,
            open: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_hierarchy(self, snapshot: HierarchySnapshot) -> Self {
        *lock(&self.hierarchy) = snapshot;
        self
    }

    pub fn with_tokens(self, tokens: TokenSet) -> Self {
        *lock(&self.tokens) = Some(tokens);
        self
    }

    /// Queues outcomes for the next `connect` calls.
    pub fn script_connect(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        lock(&self.script).extend(outcomes);
    }

    pub fn set_hierarchy(&self, snapshot: HierarchySnapshot) {
        *lock(&self.hierarchy) = snapshot;
    }

    /// Makes `fetch_hierarchy` fail with `message` (or succeed again with
    /// `None`).
    pub fn fail_fetch(&self, message: Option<&str>) {
        *lock(&self.fetch_error) = message.map(str::to_string);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Makes `fetch_hierarchy` and `update_states` never complete.
    pub fn stall_requests(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    async fn maybe_stall(&self) {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    /// Broadcasts a silent renewal to every subscriber and updates the held
    /// tokens. Returns the number of subscribers reached.
    pub fn emit_refresh(&self, refresh: TokenRefresh) -> usize {
        *lock(&self.tokens) = Some(TokenSet {
            access_token: refresh.access_token.clone(),
            refresh_token: refresh.refresh_token.clone(),
            expires_at: refresh.expires_at,
        });
        self.refresh_tx.send(refresh).unwrap_or(0)
    }

    /// Credentials passed to the most recent `set_auth`.
    pub fn credentials(&self) -> Option<CredentialSet> {
        lock(&self.credentials).clone()
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LinkClient for FakeLink {
    async fn set_auth(&self, credentials: &CredentialSet) -> Result<()> {
        *lock(&self.credentials) = Some(credentials.clone());
        Ok(())
    }

    async fn connect(&self) -> Result<bool> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = lock(&self.script)
            .pop_front()
            .unwrap_or(ConnectOutcome::Connected);

        match outcome {
            ConnectOutcome::Connected => {
                self.open.store(true, Ordering::SeqCst);
                Ok(true)
            }
            ConnectOutcome::Refused => Ok(false),
            ConnectOutcome::Fail(msg) => Err(LightwaveError::CannotConnect(msg).into()),
            ConnectOutcome::AuthError(msg) => Err(LightwaveError::InvalidAuth(msg).into()),
            ConnectOutcome::Message(msg) => Err(anyhow::anyhow!(msg)),
            ConnectOutcome::Panic => {
                // Opened before failing so tests can check teardown.
                self.open.store(true, Ordering::SeqCst);
                panic!("fake link panicked during connect")
            }
        }
    }

    async fn disconnect(&self, reason: &str) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(LightwaveError::CannotConnect(format!("close failed: {}", reason)).into());
        }
        Ok(())
    }

    async fn fetch_hierarchy(&self) -> Result<HierarchySnapshot> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_stall().await;
        if let Some(msg) = lock(&self.fetch_error).clone() {
            return Err(LightwaveError::CannotConnect(msg).into());
        }
        Ok(lock(&self.hierarchy).clone())
    }

    async fn update_states(&self) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_stall().await;
        Ok(())
    }

    fn tokens(&self) -> Option<TokenSet> {
        lock(&self.tokens).clone()
    }

    fn token_refreshes(&self) -> broadcast::Receiver<TokenRefresh> {
        self.refresh_tx.subscribe()
    }
}

/// [`LinkFactory`] handing out [`FakeLink`]s.
#[derive(Debug, Default)]
pub struct FakeLinkFactory {
    queued: Mutex<VecDeque<Arc<FakeLink>>>,
    created: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `link` to be returned by the next `create`.
    pub fn push(&self, link: Arc<FakeLink>) {
        lock(&self.queued).push_back(link);
    }

    /// Every link handed out so far, in order.
    pub fn created(&self) -> Vec<Arc<FakeLink>> {
        lock(&self.created).clone()
    }
}

impl LinkFactory for FakeLinkFactory {
    fn create(&self) -> Arc<dyn LinkClient> {
        let link = lock(&self.queued)
            .pop_front()
            .unwrap_or_else(|| Arc::new(FakeLink::new()));
        lock(&self.created).push(Arc::clone(&link));
        link
    }
}
