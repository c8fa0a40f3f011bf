//! Token lifecycle management
//!
//! [`TokenLifecycleManager`] wraps the [`TokenStore`] with the behaviour the
//! rest of the integration relies on:
//!
//! - [`get`](TokenLifecycleManager::get) / [`put`](TokenLifecycleManager::put)
//!   -- one active method per identity; writing under a new method deletes
//!   the records of every other method. Writes for the same identity are
//!   serialized.
//! - [`attach`](TokenLifecycleManager::attach) -- subscribes to the remote
//!   client's token renewal channel and persists each renewal from a
//!   background task, so the client never waits on storage.
//! - [`invalidate_access_token`](TokenLifecycleManager::invalidate_access_token)
//!   -- forces the next validity check to fail, schedules an immediate
//!   refresh and tells the caller not to retry locally.
//! - [`subscribe`](TokenLifecycleManager::subscribe) -- reports the outcome
//!   of every refresh as a [`TokenEvent`]. A refresh is followed by a reload
//!   of the owning installation; a failed refresh leaves the session
//!   invalid and asks for reauthentication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::method::AuthMethod;
use crate::auth::token_store::{CredentialSet, Secret, TokenSet, TokenStore};
use crate::error::{LightwaveError, Result};
use crate::link::TokenRefresh;

// ---------------------------------------------------------------------------
// TokenRefresher
// ---------------------------------------------------------------------------

/// Exchanges a refresh token for a new token pair.
///
/// Implemented by the host's authorization-code integration; the core only
/// calls it.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet>;
}

/// Outcome of a refresh performed by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// New tokens were obtained and persisted.
    Refreshed { identity: String },
    /// The refresh failed; the stored tokens are unchanged and the session
    /// stays invalid.
    RefreshFailed { identity: String, reason: String },
}

// ---------------------------------------------------------------------------
// TokenSession
// ---------------------------------------------------------------------------

/// Live token state for one authorization-code identity.
///
/// Shared between the manager and whoever presents the access token to the
/// backend.
#[derive(Debug)]
pub struct TokenSession {
    identity: String,
    tokens: Mutex<TokenSet>,
    forced_invalid: AtomicBool,
}

impl TokenSession {
    pub fn new(identity: impl Into<String>, tokens: TokenSet) -> Self {
        Self {
            identity: identity.into(),
            tokens: Mutex::new(tokens),
            forced_invalid: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Marks the current access token invalid regardless of its expiry.
    pub fn invalidate(&self) {
        self.forced_invalid.store(true, Ordering::SeqCst);
    }

    /// Whether the held access token may be used.
    ///
    /// After [`invalidate`](Self::invalidate) this returns `false` exactly
    /// once and then falls back to expiry-based evaluation.
    pub async fn valid_token(&self) -> bool {
        if self.forced_invalid.swap(false, Ordering::SeqCst) {
            return false;
        }
        !self.tokens.lock().await.is_expired()
    }

    pub async fn tokens(&self) -> TokenSet {
        self.tokens.lock().await.clone()
    }

    async fn replace(&self, tokens: TokenSet) {
        *self.tokens.lock().await = tokens;
    }
}

// ---------------------------------------------------------------------------
// TokenLifecycleManager
// ---------------------------------------------------------------------------

/// Coordinates credential persistence, renewal and invalidation.
#[derive(Clone)]
pub struct TokenLifecycleManager {
    store: TokenStore,
    refresher: Option<Arc<dyn TokenRefresher>>,
    write_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    sessions: Arc<Mutex<HashMap<String, Arc<TokenSession>>>>,
    events: broadcast::Sender<TokenEvent>,
}

impl TokenLifecycleManager {
    pub fn new(store: TokenStore) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            refresher: None,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribes to refresh outcomes for every identity.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    /// Installs the refresher used by [`ensure_valid`](Self::ensure_valid).
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    async fn write_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        Arc::clone(
            locks
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Returns the credential set stored for `identity`, whichever method it
    /// was stored under.
    ///
    /// # Errors
    ///
    /// Propagates storage and deserialization failures.
    pub async fn get(&self, identity: &str) -> Result<Option<CredentialSet>> {
        for method in AuthMethod::ALL {
            if let Some(creds) = self.store.load(method, identity).await? {
                return Ok(Some(creds));
            }
        }
        Ok(None)
    }

    /// Persists `credentials` and removes records of any other method for the
    /// same identity.
    ///
    /// # Errors
    ///
    /// Propagates storage failures. On failure the previously stored record
    /// is left in place.
    pub async fn put(&self, credentials: &CredentialSet) -> Result<()> {
        let lock = self.write_lock(&credentials.identity).await;
        let _guard = lock.lock().await;
        self.put_locked(credentials).await
    }

    async fn put_locked(&self, credentials: &CredentialSet) -> Result<()> {
        self.store.save(credentials).await?;

        let active = credentials.method();
        for method in AuthMethod::ALL.into_iter().filter(|m| *m != active) {
            self.store.delete(method, &credentials.identity).await?;
        }

        if let Secret::AuthorizationCode(tokens) = &credentials.secret {
            if let Some(session) = self.sessions.lock().await.get(&credentials.identity) {
                session.replace(tokens.clone()).await;
            }
        }

        tracing::debug!(
            "Stored credentials for {} using {}",
            credentials.identity,
            active
        );
        Ok(())
    }

    /// Removes every stored record for `identity`, along with its session
    /// and write lock.
    pub async fn delete(&self, identity: &str) -> Result<()> {
        let lock = self.write_lock(identity).await;
        {
            let _guard = lock.lock().await;
            for method in AuthMethod::ALL {
                self.store.delete(method, identity).await?;
            }
            self.sessions.lock().await.remove(identity);
        }

        // A writer still holding a clone keeps its own lock alive.
        self.write_locks.lock().await.remove(identity);
        Ok(())
    }

    /// Number of identities with a write lock.
    pub async fn tracked_identities(&self) -> usize {
        self.write_locks.lock().await.len()
    }

    /// Applies a renewal reported by the remote client.
    ///
    /// Token-bearing methods get their pair replaced; an API key keeps its key
    /// and takes the new refresh token; anything else (or nothing stored)
    /// becomes a refresh-token credential.
    pub async fn apply_refresh(&self, identity: &str, refresh: TokenRefresh) -> Result<()> {
        let lock = self.write_lock(identity).await;
        let _guard = lock.lock().await;

        let tokens = TokenSet {
            access_token: refresh.access_token,
            refresh_token: refresh.refresh_token,
            expires_at: refresh.expires_at,
        };

        let mut current = None;
        for method in AuthMethod::ALL {
            if let Some(creds) = self.store.load(method, identity).await? {
                current = Some(creds);
                break;
            }
        }

        let secret = match current.map(|c| c.secret) {
            Some(Secret::AuthorizationCode(_)) => Secret::AuthorizationCode(tokens),
            Some(Secret::ApiKey { api_key, .. }) => Secret::ApiKey {
                api_key,
                refresh_token: tokens.refresh_token,
            },
            _ => Secret::RefreshToken(tokens),
        };

        self.put_locked(&CredentialSet::new(identity, secret)).await
    }

    /// Spawns a task that persists every renewal received on `refreshes`.
    ///
    /// The task ends when `cancel` fires or the sender side is dropped.
    /// Persistence failures are logged, never propagated to the sender.
    pub fn attach(
        &self,
        identity: impl Into<String>,
        mut refreshes: broadcast::Receiver<TokenRefresh>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let identity = identity.into();

        tokio::spawn(async move {
            loop {
                let refresh = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = refreshes.recv() => received,
                };

                match refresh {
                    Ok(refresh) => {
                        tracing::debug!("Token renewal received for {}", identity);
                        if let Err(e) = manager.apply_refresh(&identity, refresh).await {
                            tracing::error!(
                                "Failed to persist renewed tokens for {}: {}",
                                identity,
                                e
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Token renewal listener for {} lagged, skipped {} updates",
                            identity,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Token renewal listener for {} stopped", identity);
        })
    }

    /// Returns the shared session for an authorization-code identity,
    /// creating it from the stored tokens on first use.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::InvalidAuth`] when no authorization-code
    /// credentials are stored for `identity`.
    pub async fn session(&self, identity: &str) -> Result<Arc<TokenSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(identity) {
            return Ok(Arc::clone(session));
        }

        let tokens = match self
            .store
            .load(AuthMethod::AuthorizationCode, identity)
            .await?
        {
            Some(CredentialSet {
                secret: Secret::AuthorizationCode(tokens),
                ..
            }) => tokens,
            _ => {
                return Err(LightwaveError::InvalidAuth(format!(
                    "no authorization-code credentials stored for {}",
                    identity
                ))
                .into())
            }
        };

        let session = Arc::new(TokenSession::new(identity, tokens));
        sessions.insert(identity.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Refreshes the session's tokens if they are not valid and persists the
    /// result.
    ///
    /// Publishes [`TokenEvent::Refreshed`] after a refresh. On failure the
    /// session is left invalid and [`TokenEvent::RefreshFailed`] is
    /// published.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::InvalidAuth`] if a refresh is needed but no
    /// refresher is installed, or the refresher's error.
    pub async fn ensure_valid(&self, identity: &str) -> Result<TokenSet> {
        let session = self.session(identity).await?;
        if session.valid_token().await {
            return Ok(session.tokens().await);
        }

        match self.refresh_session(&session).await {
            Ok(renewed) => {
                tracing::info!("Refreshed access token for {}", identity);
                let _ = self.events.send(TokenEvent::Refreshed {
                    identity: identity.to_string(),
                });
                Ok(renewed)
            }
            Err(e) => {
                tracing::error!("Token refresh failed for {}: {}", identity, e);
                session.invalidate();
                let _ = self.events.send(TokenEvent::RefreshFailed {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn refresh_session(&self, session: &TokenSession) -> Result<TokenSet> {
        let refresher = self.refresher.as_ref().ok_or_else(|| {
            LightwaveError::InvalidAuth("token refresh is not available".to_string())
        })?;

        let current = session.tokens().await;
        let renewed = refresher.refresh(&current.refresh_token).await?;
        self.put(&CredentialSet::new(
            session.identity(),
            Secret::AuthorizationCode(renewed.clone()),
        ))
        .await?;
        session.replace(renewed.clone()).await;
        Ok(renewed)
    }

    /// Returns a usable access token, refreshing first when needed.
    pub async fn access_token(&self, identity: &str) -> Result<String> {
        Ok(self.ensure_valid(identity).await?.access_token)
    }

    /// Forces the held access token invalid and schedules an immediate
    /// refresh.
    ///
    /// Always returns `false`: the caller must not retry locally. The outcome
    /// is published as a [`TokenEvent`]; a loaded installation reloads after
    /// a refresh and asks for reauthentication after a failure.
    pub async fn invalidate_access_token(&self, identity: &str) -> bool {
        tracing::debug!("Invalidating access token for {}", identity);

        match self.session(identity).await {
            Ok(session) => session.invalidate(),
            Err(e) => {
                tracing::warn!("No token session to invalidate for {}: {}", identity, e);
                return false;
            }
        }

        let manager = self.clone();
        let identity = identity.to_string();
        tokio::spawn(async move {
            // Failures are logged and published by ensure_valid.
            let _ = manager.ensure_valid(&identity).await;
        });

        false
    }
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("store", &self.store)
            .field("has_refresher", &self.refresher.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
