//! Installation runtime
//!
//! An [`Installation`] is the live side of one configuration entry: the
//! long-lived link, the token renewal listener and the registry maintenance
//! that follows every activation.
//!
//! Lifecycle operations ([`setup`](Installation::setup),
//! [`unload`](Installation::unload), [`reload`](Installation::reload),
//! [`remove`](Installation::remove)) and the administrative operations
//! ([`reconnect`](Installation::reconnect),
//! [`refresh_state`](Installation::refresh_state),
//! [`reset_entity_enablement`](Installation::reset_entity_enablement)) are
//! serialized on one cycle lock, so a reconnect can never interleave with a
//! reload.
//!
//! While loaded, an installation follows the token manager's refresh
//! outcomes for its identity: a refresh schedules a reload of the entry and
//! a failed refresh publishes [`InstallationEvent::ReauthRequired`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::manager::{TokenEvent, TokenLifecycleManager};
use crate::auth::token_store::{CredentialSet, Secret};
use crate::error::{LightwaveError, Result};
use crate::flow::state::{fields, PendingFlowStore};
use crate::host::{ConfigEntry, EntryOptions, EntryStore, RecordRegistry, RecordSpec};
use crate::link::activation::{Activation, ActivationController, RetryPolicy};
use crate::link::hierarchy::HierarchySnapshot;
use crate::link::LinkFactory;
use crate::reconcile::{ReconcileReport, ReconciliationEngine};

const MANUFACTURER: &str = "Lightwave";

/// Notifications published by an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstallationEvent {
    Connected { entry_id: String, generation: u64 },
    StatesUpdated { entry_id: String },
    /// A token refresh failed; the host should start reauthentication.
    ReauthRequired { entry_id: String },
    Unloaded { entry_id: String },
}

/// Host and backend collaborators shared by installations.
#[derive(Clone)]
pub struct InstallationContext {
    pub entries: Arc<dyn EntryStore>,
    pub devices: Arc<dyn RecordRegistry>,
    pub entities: Arc<dyn RecordRegistry>,
    pub tokens: TokenLifecycleManager,
    pub pending: PendingFlowStore,
    pub links: Arc<dyn LinkFactory>,
    pub policy: RetryPolicy,
}

/// What a setup (or reconnect) did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    pub generation: u64,
    pub hubs_registered: usize,
    pub reconcile: ReconcileReport,
}

struct Runtime {
    identity: String,
    options: EntryOptions,
    controller: ActivationController,
    cancel: CancellationToken,
    refresh_listener: JoinHandle<()>,
    token_watcher: JoinHandle<()>,
    last_setup: SetupReport,
}

/// Live runtime of one configuration entry.
pub struct Installation {
    entry_id: String,
    ctx: InstallationContext,
    reconciler: ReconciliationEngine,
    generation: AtomicU64,
    cancel: CancellationToken,
    runtime: Mutex<Option<Runtime>>,
    events: broadcast::Sender<InstallationEvent>,
}

impl Installation {
    pub fn new(entry_id: impl Into<String>, ctx: InstallationContext) -> Self {
        let reconciler = ReconciliationEngine::new(ctx.devices.clone(), ctx.entities.clone());
        let (events, _) = broadcast::channel(32);
        Self {
            entry_id: entry_id.into(),
            ctx,
            reconciler,
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            runtime: Mutex::new(None),
            events,
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstallationEvent> {
        self.events.subscribe()
    }

    /// Number of successful activations so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn is_loaded(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Options the running installation was set up with.
    pub async fn options(&self) -> Option<EntryOptions> {
        self.runtime.lock().await.as_ref().map(|r| r.options.clone())
    }

    /// Connects the entry's link, registers its hubs and prunes stale records.
    ///
    /// Calling `setup` on a loaded installation returns the report of the
    /// running setup without reconnecting.
    ///
    /// # Errors
    ///
    /// - [`LightwaveError::EntryNotFound`] if the entry no longer exists
    /// - [`LightwaveError::AuthFailed`] if no credentials are available or the
    ///   link could not be activated; the host should start reauthentication
    /// - [`LightwaveError::Cancelled`] if the installation is being removed
    pub async fn setup(&self) -> Result<SetupReport> {
        let mut runtime = self.runtime.lock().await;
        self.setup_locked(&mut runtime).await
    }

    /// Stops the link and background work. Unloading an installation that was
    /// never set up does nothing.
    pub async fn unload(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        self.unload_locked(&mut runtime).await;
        Ok(())
    }

    /// Unload followed by setup, without letting another cycle in between.
    pub async fn reload(&self) -> Result<SetupReport> {
        let mut runtime = self.runtime.lock().await;
        tracing::info!("Reloading {}", self.entry_id);
        self.unload_locked(&mut runtime).await;
        self.setup_locked(&mut runtime).await
    }

    /// Tears everything down for good and deletes stored credentials and any
    /// pending flow continuation.
    pub async fn remove(&self) -> Result<()> {
        self.cancel.cancel();

        let mut runtime = self.runtime.lock().await;
        let identity = match runtime.as_ref() {
            Some(r) => Some(r.identity.clone()),
            None => self
                .ctx
                .entries
                .get(&self.entry_id)
                .await?
                .map(|entry| entry.unique_id),
        };
        self.unload_locked(&mut runtime).await;

        if let Some(identity) = identity {
            self.ctx.tokens.delete(&identity).await?;
        }
        self.ctx.pending.clear().await?;
        self.reconciler.forget(&self.entry_id).await;

        tracing::info!("Removed {}", self.entry_id);
        Ok(())
    }

    /// Drops and re-establishes the live connection, then reconciles against
    /// the fresh hierarchy.
    ///
    /// Returns `Ok(None)` when the installation is not loaded or the link
    /// could not be re-activated.
    pub async fn reconnect(&self) -> Result<Option<SetupReport>> {
        let mut guard = self.runtime.lock().await;
        let Some(runtime) = guard.as_mut() else {
            tracing::debug!("{} is not loaded, nothing to reconnect", self.entry_id);
            return Ok(None);
        };

        tracing::info!("Reconnecting {}", self.entry_id);
        runtime.controller.deactivate("reconnect").await;

        let activation = runtime
            .controller
            .activate(&self.ctx.policy, |link| async move {
                link.fetch_hierarchy().await
            })
            .await?;

        match activation {
            Activation::Connected(hierarchy) => {
                let report = self.after_activation(&hierarchy).await?;
                runtime.last_setup = report.clone();
                Ok(Some(report))
            }
            Activation::Exhausted {
                attempts,
                last_error,
            } => {
                tracing::warn!(
                    "Reconnect of {} failed after {} attempts: {}",
                    self.entry_id,
                    attempts,
                    describe(last_error.as_ref())
                );
                Ok(None)
            }
        }
    }

    /// Asks the backend to push fresh state and notifies subscribers.
    ///
    /// The request is bounded by the policy's attempt timeout and abandoned
    /// with [`LightwaveError::Cancelled`] once removal starts.
    pub async fn refresh_state(&self) -> Result<()> {
        let guard = self.runtime.lock().await;
        let Some(runtime) = guard.as_ref() else {
            return Err(LightwaveError::EntryNotFound(self.entry_id.clone()).into());
        };

        let link = Arc::clone(runtime.controller.link());
        runtime
            .controller
            .bounded("state update", self.ctx.policy.attempt_timeout, async move {
                link.update_states().await
            })
            .await?;
        let _ = self.events.send(InstallationEvent::StatesUpdated {
            entry_id: self.entry_id.clone(),
        });
        Ok(())
    }

    /// Forces the entry's access token invalid and schedules a refresh.
    ///
    /// Always returns `false`, also when the installation is not loaded. A
    /// successful refresh schedules a reload of the entry; a failed one
    /// publishes [`InstallationEvent::ReauthRequired`].
    pub async fn invalidate_access_token(&self) -> bool {
        let identity = match self.runtime.lock().await.as_ref() {
            Some(running) => running.identity.clone(),
            None => return false,
        };
        self.ctx.tokens.invalidate_access_token(&identity).await
    }

    /// Restores every entity of the entry to its default enablement.
    ///
    /// Returns the number of records changed.
    pub async fn reset_entity_enablement(&self) -> Result<usize> {
        let _guard = self.runtime.lock().await;

        let mut changed = 0;
        for record in self.ctx.entities.records_for_entry(&self.entry_id).await? {
            if record.enabled != record.enabled_by_default {
                self.ctx
                    .entities
                    .set_enabled(&record.record_id, record.enabled_by_default)
                    .await?;
                changed += 1;
            }
        }

        tracing::info!(
            "Reset enablement of {} entities for {}",
            changed,
            self.entry_id
        );
        Ok(changed)
    }

    async fn setup_locked(&self, runtime: &mut Option<Runtime>) -> Result<SetupReport> {
        if let Some(running) = runtime.as_ref() {
            tracing::debug!("{} is already set up", self.entry_id);
            return Ok(running.last_setup.clone());
        }
        if self.cancel.is_cancelled() {
            return Err(LightwaveError::Cancelled.into());
        }

        let entry = self
            .ctx
            .entries
            .get(&self.entry_id)
            .await?
            .ok_or_else(|| LightwaveError::EntryNotFound(self.entry_id.clone()))?;
        let credentials = self.credentials_for(&entry).await?;

        let link = self.ctx.links.create();
        link.set_auth(&credentials).await?;

        let cancel = self.cancel.child_token();
        let refresh_listener =
            self.ctx
                .tokens
                .attach(entry.unique_id.clone(), link.token_refreshes(), cancel.clone());
        let token_watcher = self.watch_tokens(entry.unique_id.clone(), cancel.clone());
        let controller = ActivationController::new(link, cancel.clone());

        let activation = controller
            .activate(&self.ctx.policy, |link| async move {
                link.fetch_hierarchy().await
            })
            .await;

        let failure = match activation {
            Ok(Activation::Connected(hierarchy)) => match self.after_activation(&hierarchy).await
            {
                Ok(report) => {
                    tracing::info!(
                        "Set up {} (generation {}, {} hubs)",
                        self.entry_id,
                        report.generation,
                        report.hubs_registered
                    );
                    *runtime = Some(Runtime {
                        identity: entry.unique_id,
                        options: entry.options,
                        controller,
                        cancel,
                        refresh_listener,
                        token_watcher,
                        last_setup: report.clone(),
                    });
                    return Ok(report);
                }
                Err(e) => e,
            },
            Ok(Activation::Exhausted {
                attempts,
                last_error,
            }) => LightwaveError::AuthFailed(format!(
                "could not connect after {} attempts: {}",
                attempts,
                describe(last_error.as_ref())
            ))
            .into(),
            Err(e) if is_cancelled(&e) => e,
            Err(e) => LightwaveError::AuthFailed(e.to_string()).into(),
        };

        tracing::error!("Setup of {} failed: {}", self.entry_id, failure);
        cancel.cancel();
        controller.close("setup failed").await;
        refresh_listener.abort();
        token_watcher.abort();
        Err(failure)
    }

    async fn unload_locked(&self, runtime: &mut Option<Runtime>) {
        let Some(running) = runtime.take() else {
            tracing::debug!("{} was never loaded, skipping unload", self.entry_id);
            return;
        };

        running.cancel.cancel();
        running.controller.deactivate("unload").await;
        if let Err(e) = running.refresh_listener.await {
            tracing::warn!("Token renewal listener for {} ended badly: {}", self.entry_id, e);
        }
        if let Err(e) = running.token_watcher.await {
            tracing::warn!("Token watcher for {} ended badly: {}", self.entry_id, e);
        }

        let _ = self.events.send(InstallationEvent::Unloaded {
            entry_id: self.entry_id.clone(),
        });
        tracing::debug!("Unloaded {}", self.entry_id);
    }

    /// Follows refresh outcomes for `identity` until `cancel` fires: a
    /// refresh schedules a reload, a failure asks for reauthentication.
    fn watch_tokens(&self, identity: String, cancel: CancellationToken) -> JoinHandle<()> {
        let mut token_events = self.ctx.tokens.subscribe();
        let entries = Arc::clone(&self.ctx.entries);
        let events = self.events.clone();
        let entry_id = self.entry_id.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = token_events.recv() => received,
                };

                match event {
                    Ok(TokenEvent::Refreshed { identity: refreshed }) if refreshed == identity => {
                        tracing::info!("Tokens for {} refreshed, reloading {}", identity, entry_id);
                        if let Err(e) = entries.schedule_reload(&entry_id).await {
                            tracing::error!("Failed to schedule reload of {}: {}", entry_id, e);
                        }
                    }
                    Ok(TokenEvent::RefreshFailed {
                        identity: failed,
                        reason,
                    }) if failed == identity => {
                        tracing::warn!(
                            "Token refresh for {} failed, reauthentication required: {}",
                            identity,
                            reason
                        );
                        let _ = events.send(InstallationEvent::ReauthRequired {
                            entry_id: entry_id.clone(),
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Token watcher for {} skipped {} events", entry_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Registers hub devices and reconciles against `hierarchy` under a new
    /// generation.
    async fn after_activation(&self, hierarchy: &HierarchySnapshot) -> Result<SetupReport> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut hubs_registered = 0;
        for hub in hierarchy.hubs() {
            let mut spec = RecordSpec::new(hub.id.clone(), hub.display_name());
            spec.model = hub.product_code.clone();
            spec.manufacturer = Some(MANUFACTURER.to_string());
            self.ctx.devices.get_or_create(&self.entry_id, spec).await?;
            hubs_registered += 1;
        }

        let reconcile = self
            .reconciler
            .reconcile(&self.entry_id, hierarchy, generation)
            .await?;

        let _ = self.events.send(InstallationEvent::Connected {
            entry_id: self.entry_id.clone(),
            generation,
        });

        Ok(SetupReport {
            generation,
            hubs_registered,
            reconcile,
        })
    }

    /// Stored credentials for the entry, falling back to a password kept in
    /// entry data by older releases.
    async fn credentials_for(&self, entry: &ConfigEntry) -> Result<CredentialSet> {
        if let Some(credentials) = self.ctx.tokens.get(&entry.unique_id).await? {
            return Ok(credentials);
        }

        if let Some(password) = entry.data.get_str(fields::PASSWORD) {
            tracing::warn!(
                "{} has no stored tokens, using the password from entry data",
                self.entry_id
            );
            return Ok(CredentialSet::new(
                entry.unique_id.clone(),
                Secret::Password {
                    password: password.to_string(),
                },
            ));
        }

        Err(LightwaveError::AuthFailed(format!(
            "no stored credentials for {}",
            entry.unique_id
        ))
        .into())
    }
}

fn is_cancelled(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<LightwaveError>(),
        Some(LightwaveError::Cancelled)
    )
}

fn describe(error: Option<&anyhow::Error>) -> String {
    error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "refused".to_string())
}
