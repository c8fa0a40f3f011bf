//! In-process host collaborators
//!
//! Used by the test suite and by the `memory` storage backend. Entry ids and
//! record ids are random UUIDs, matching what a real host hands out.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{LightwaveError, Result};
use crate::flow::state::FlowData;
use crate::host::{
    ConfigEntry, EntryOptions, EntryStore, KeyValueStore, NewEntry, RecordRegistry, RecordSpec,
    RegisteredRecord,
};

/// Entry store backed by a map; records reload requests for inspection.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: Mutex<BTreeMap<String, ConfigEntry>>,
    reloads: Mutex<Vec<String>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry ids passed to [`EntryStore::schedule_reload`], in call order.
    pub async fn reload_requests(&self) -> Vec<String> {
        self.reloads.lock().await.clone()
    }

    /// Inserts a fully formed entry, bypassing id assignment.
    pub async fn insert(&self, entry: ConfigEntry) {
        self.entries
            .lock()
            .await
            .insert(entry.entry_id.clone(), entry);
    }
}

#[async_trait::async_trait]
impl EntryStore for MemoryEntryStore {
    async fn entries(&self) -> Result<Vec<ConfigEntry>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }

    async fn get(&self, entry_id: &str) -> Result<Option<ConfigEntry>> {
        Ok(self.entries.lock().await.get(entry_id).cloned())
    }

    async fn create(&self, entry: NewEntry) -> Result<ConfigEntry> {
        let created = ConfigEntry {
            entry_id: Uuid::new_v4().to_string(),
            unique_id: entry.unique_id,
            title: entry.title,
            data: entry.data,
            options: EntryOptions::default(),
        };
        self.entries
            .lock()
            .await
            .insert(created.entry_id.clone(), created.clone());
        Ok(created)
    }

    async fn update_data(&self, entry_id: &str, data: FlowData) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(entry_id)
            .ok_or_else(|| LightwaveError::EntryNotFound(entry_id.to_string()))?;
        entry.data = data;
        Ok(())
    }

    async fn update_options(&self, entry_id: &str, options: EntryOptions) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(entry_id)
            .ok_or_else(|| LightwaveError::EntryNotFound(entry_id.to_string()))?;
        entry.options = options;
        Ok(())
    }

    async fn schedule_reload(&self, entry_id: &str) -> Result<()> {
        self.reloads.lock().await.push(entry_id.to_string());
        Ok(())
    }

    async fn remove(&self, entry_id: &str) -> Result<()> {
        self.entries.lock().await.remove(entry_id);
        Ok(())
    }
}

/// Device or entity registry backed by a map.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<BTreeMap<String, RegisteredRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all entries.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait::async_trait]
impl RecordRegistry for MemoryRegistry {
    async fn get_or_create(&self, entry_id: &str, spec: RecordSpec) -> Result<RegisteredRecord> {
        let mut records = self.records.lock().await;

        if let Some(existing) = records.values_mut().find(|r| {
            r.entry_id == entry_id && !r.identifiers.is_disjoint(&spec.identifiers)
        }) {
            existing.identifiers.extend(spec.identifiers);
            existing.name = spec.name;
            if spec.model.is_some() {
                existing.model = spec.model;
            }
            if spec.manufacturer.is_some() {
                existing.manufacturer = spec.manufacturer;
            }
            return Ok(existing.clone());
        }

        let record = RegisteredRecord {
            record_id: Uuid::new_v4().to_string(),
            entry_id: entry_id.to_string(),
            identifiers: spec.identifiers,
            name: spec.name,
            model: spec.model,
            manufacturer: spec.manufacturer,
            enabled: spec.enabled_by_default,
            enabled_by_default: spec.enabled_by_default,
        };
        records.insert(record.record_id.clone(), record.clone());
        Ok(record)
    }

    async fn records_for_entry(&self, entry_id: &str) -> Result<Vec<RegisteredRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.entry_id == entry_id)
            .cloned()
            .collect())
    }

    async fn remove(&self, record_id: &str) -> Result<()> {
        self.records.lock().await.remove(record_id);
        Ok(())
    }

    async fn set_enabled(&self, record_id: &str, enabled: bool) -> Result<()> {
        if let Some(record) = self.records.lock().await.get_mut(record_id) {
            record.enabled = enabled;
        }
        Ok(())
    }
}

/// Key/value store backed by a map. Nothing survives the process.
///
/// # Examples
///
/// ```
/// use lightwave_smart::host::memory::MemoryStore;
/// use lightwave_smart::host::KeyValueStore;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// store.save("pending.v1/flow", serde_json::json!({"step": "user"})).await.unwrap();
/// assert_eq!(store.keys().await, vec!["pending.v1/flow".to_string()]);
///
/// store.remove("pending.v1/flow").await.unwrap();
/// assert!(store.load("pending.v1/flow").await.unwrap().is_none());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_reuses_overlapping_record() {
        let registry = MemoryRegistry::new();
        let first = registry
            .get_or_create("entry", RecordSpec::new("hub-1", "Hub"))
            .await
            .unwrap();
        let second = registry
            .get_or_create("entry", RecordSpec::new("hub-1", "Hub renamed"))
            .await
            .unwrap();

        assert_eq!(first.record_id, second.record_id);
        assert_eq!(second.name, "Hub renamed");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_records_are_scoped_per_entry() {
        let registry = MemoryRegistry::new();
        registry
            .get_or_create("a", RecordSpec::new("x", "X"))
            .await
            .unwrap();
        registry
            .get_or_create("b", RecordSpec::new("x", "X"))
            .await
            .unwrap();

        assert_eq!(registry.records_for_entry("a").await.unwrap().len(), 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_update_unknown_entry_fails() {
        let store = MemoryEntryStore::new();
        let err = store
            .update_data("missing", FlowData::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightwaveError>(),
            Some(LightwaveError::EntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_remove_missing_is_noop() {
        let store = MemoryStore::new();
        store.remove("nothing").await.unwrap();
        assert!(store.load("nothing").await.unwrap().is_none());
    }
}
