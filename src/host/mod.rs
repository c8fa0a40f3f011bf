//! Host platform collaborator interfaces
//!
//! The integration runs inside a host automation platform that owns
//! configuration entries, device/entity registries and a durable key/value
//! store. This module defines the narrow async traits the core talks to, plus
//! the plain data carried across them. [`memory`] provides in-process
//! implementations used by tests and by the `memory` storage backend.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flow::state::FlowData;

pub mod memory;

/// Per-entry options edited through the options flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOptions {
    /// Hide integration entities that are exposed through HomeKit instead.
    #[serde(default)]
    pub homekit: bool,
}

/// A configured installation as persisted by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Host-assigned identifier.
    pub entry_id: String,
    /// Identity the entry is bound to (username or synthetic instance id).
    pub unique_id: String,
    /// Display title.
    pub title: String,
    /// Non-secret data accumulated by the flow.
    pub data: FlowData,
    /// User-editable options.
    #[serde(default)]
    pub options: EntryOptions,
}

/// Data required to create a new entry; the host assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub unique_id: String,
    pub title: String,
    pub data: FlowData,
}

/// Configuration-entry storage. Survives restarts.
#[async_trait::async_trait]
pub trait EntryStore: Send + Sync {
    /// All entries owned by this integration.
    async fn entries(&self) -> Result<Vec<ConfigEntry>>;

    /// Looks up one entry.
    async fn get(&self, entry_id: &str) -> Result<Option<ConfigEntry>>;

    /// Persists a new entry and returns it with its assigned id.
    async fn create(&self, entry: NewEntry) -> Result<ConfigEntry>;

    /// Replaces the entry's data in place.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::LightwaveError::EntryNotFound`] for unknown ids.
    async fn update_data(&self, entry_id: &str, data: FlowData) -> Result<()>;

    /// Replaces the entry's options in place.
    async fn update_options(&self, entry_id: &str, options: EntryOptions) -> Result<()>;

    /// Asks the host to unload and set up the entry again.
    async fn schedule_reload(&self, entry_id: &str) -> Result<()>;

    /// Deletes the entry.
    async fn remove(&self, entry_id: &str) -> Result<()>;
}

/// What a caller asks a registry to create-or-get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpec {
    pub identifiers: BTreeSet<String>,
    pub name: String,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub enabled_by_default: bool,
}

impl RecordSpec {
    /// Spec with a single identifier and default enablement.
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identifiers: BTreeSet::from([identifier.into()]),
            name: name.into(),
            model: None,
            manufacturer: None,
            enabled_by_default: true,
        }
    }
}

/// A device or entity registration owned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredRecord {
    pub record_id: String,
    pub entry_id: String,
    pub identifiers: BTreeSet<String>,
    pub name: String,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub enabled: bool,
    pub enabled_by_default: bool,
}

/// Device or entity registry.
#[async_trait::async_trait]
pub trait RecordRegistry: Send + Sync {
    /// Returns the record whose identifiers overlap `spec.identifiers`,
    /// creating it if none exists.
    async fn get_or_create(&self, entry_id: &str, spec: RecordSpec) -> Result<RegisteredRecord>;

    /// Every record owned by `entry_id`.
    async fn records_for_entry(&self, entry_id: &str) -> Result<Vec<RegisteredRecord>>;

    /// Removes a record. Removing an unknown id is not an error.
    async fn remove(&self, record_id: &str) -> Result<()>;

    /// Enables or disables a record.
    async fn set_enabled(&self, record_id: &str, enabled: bool) -> Result<()>;
}

/// Durable JSON key/value store keyed by versioned store names.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()>;
    /// Removing a missing key is a no-op.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Builds a storage key from a store name, schema version and item key.
///
/// # Examples
///
/// ```
/// use lightwave_smart::host::store_key;
///
/// assert_eq!(
///     store_key("lightwave_smart.tokens", 1, "refresh-token:me@example.com"),
///     "lightwave_smart.tokens.v1/refresh-token:me@example.com",
/// );
/// ```
pub fn store_key(store: &str, version: u32, item: &str) -> String {
    format!("{}.v{}/{}", store, version, item)
}
