//! Flow state value objects and the pending continuation store
//!
//! A [`FlowState`] is passed into every step of the
//! [`FlowController`](super::controller::FlowController) and returned from it;
//! nothing about an in-progress flow lives in shared mutable state. The only
//! exception is the authorization-code continuation, which must survive an
//! out-of-band redirect and is therefore written to the durable key/value
//! store through [`PendingFlowStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::method::AuthMethod;
use crate::error::Result;
use crate::host::{store_key, KeyValueStore};

/// Field names shared between the flow, entry data and method schemas.
pub mod fields {
    pub const AUTH_METHOD: &str = "auth_method";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const INSTANCE_NAME: &str = "instance_name";
    pub const API_KEY: &str = "api_key";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const TOKEN: &str = "token";
    pub const ERROR: &str = "error";
    pub const HOMEKIT: &str = "homekit";
}

/// Accumulated step inputs, ordered by field name.
///
/// # Examples
///
/// ```
/// use lightwave_smart::flow::state::FlowData;
/// use serde_json::json;
///
/// let mut data = FlowData::from_pairs([("a", json!(1))]);
/// data.merge(FlowData::from_pairs([("a", json!(3)), ("b", json!(2))]));
///
/// assert_eq!(data.get("a"), Some(&json!(3)));
/// assert_eq!(data.get("b"), Some(&json!(2)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowData(BTreeMap<String, serde_json::Value>);

impl FlowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, serde_json::Value)>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Adds every field of `other`, overwriting fields with the same name.
    /// Fields absent from `other` are kept.
    pub fn merge(&mut self, other: FlowData) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Returns the field as a string when it is a non-empty JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Which entry point started the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowSource {
    /// First-time setup.
    User,
    /// Credential re-validation for an existing entry.
    Reauth { entry_id: String },
    /// User-driven reconfiguration of an existing entry.
    Reconfigure { entry_id: String },
}

impl FlowSource {
    /// Entry bound to this flow, if any.
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            FlowSource::User => None,
            FlowSource::Reauth { entry_id } | FlowSource::Reconfigure { entry_id } => {
                Some(entry_id)
            }
        }
    }
}

/// Steps of the authentication state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStep {
    MethodSelection,
    CredentialCollection,
    Validating,
    AwaitingClientRegistration,
    Completing,
}

impl FlowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStep::MethodSelection => "method_selection",
            FlowStep::CredentialCollection => "credential_collection",
            FlowStep::Validating => "validating",
            FlowStep::AwaitingClientRegistration => "awaiting_client_registration",
            FlowStep::Completing => "completing",
        }
    }
}

/// Everything an in-progress flow knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub flow_id: String,
    pub source: FlowSource,
    pub step: FlowStep,
    pub method: Option<AuthMethod>,
    pub data: FlowData,
    /// Identity of the entry being replaced (reauth/reconfigure only).
    pub bound_identity: Option<String>,
    /// Set once this state has been restored from a pending continuation.
    #[serde(default)]
    pub resumed: bool,
}

impl FlowState {
    pub fn new(source: FlowSource) -> Self {
        Self {
            flow_id: Uuid::new_v4().to_string(),
            source,
            step: FlowStep::MethodSelection,
            method: None,
            data: FlowData::new(),
            bound_identity: None,
            resumed: false,
        }
    }

    /// Merges one round-trip's input into the accumulated data.
    pub fn absorb(&mut self, input: Option<FlowData>) {
        if let Some(input) = input {
            self.data.merge(input);
        }
    }
}

const PENDING_STORE: &str = "lightwave_smart.pending_flow";
const PENDING_STORE_VERSION: u32 = 1;
const PENDING_KEY: &str = "authorization_code";

/// Durable slot for the authorization-code continuation.
///
/// The slot holds at most one suspended [`FlowState`]. [`take`](Self::take)
/// is serialized so that two concurrently started flows cannot both resume
/// the same continuation.
#[derive(Clone)]
pub struct PendingFlowStore {
    kv: Arc<dyn KeyValueStore>,
    lock: Arc<Mutex<()>>,
}

impl PendingFlowStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn key() -> String {
        store_key(PENDING_STORE, PENDING_STORE_VERSION, PENDING_KEY)
    }

    /// Persists `state` as the pending continuation, replacing any older one.
    ///
    /// # Errors
    ///
    /// Propagates serialization and storage failures.
    pub async fn save(&self, state: &FlowState) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.kv.save(&Self::key(), serde_json::to_value(state)?).await
    }

    /// Removes and returns the pending continuation.
    ///
    /// A stored value that no longer deserializes is discarded and reported
    /// as absent.
    pub async fn take(&self) -> Result<Option<FlowState>> {
        let _guard = self.lock.lock().await;
        let key = Self::key();
        let Some(value) = self.kv.load(&key).await? else {
            return Ok(None);
        };
        self.kv.remove(&key).await?;

        match serde_json::from_value::<FlowState>(value) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!("Discarding unreadable pending flow state: {}", e);
                Ok(None)
            }
        }
    }

    /// Whether a continuation is waiting.
    pub async fn is_pending(&self) -> Result<bool> {
        Ok(self.kv.load(&Self::key()).await?.is_some())
    }

    /// Drops any pending continuation.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.kv.remove(&Self::key()).await
    }
}

impl std::fmt::Debug for PendingFlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFlowStore").finish_non_exhaustive()
    }
}
