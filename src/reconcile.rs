//! Registry reconciliation against a fetched hierarchy
//!
//! After each successful activation the installation hands the fresh
//! [`HierarchySnapshot`] to [`ReconciliationEngine::reconcile`], which removes
//! every device and entity record of the entry whose identifiers no longer
//! appear in the snapshot. Records that still match are never touched.
//!
//! Guards:
//!
//! - an incomplete snapshot is refused with
//!   [`LightwaveError::IncompleteHierarchy`]
//! - an empty snapshot prunes nothing unless it was explicitly confirmed
//!   with [`HierarchySnapshot::confirm_empty`]
//! - each activation generation is reconciled at most once per entry

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{LightwaveError, Result};
use crate::host::{RecordRegistry, RegisteredRecord};
use crate::link::hierarchy::HierarchySnapshot;

/// Why a reconciliation did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// This generation was already reconciled for the entry.
    AlreadyReconciled,
    /// The snapshot was empty and not confirmed as such.
    UnconfirmedEmpty,
}

/// What one reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub generation: u64,
    pub kept_devices: usize,
    pub kept_entities: usize,
    /// Record ids of removed devices.
    pub removed_devices: Vec<String>,
    /// Record ids of removed entities.
    pub removed_entities: Vec<String>,
    pub skipped: Option<SkipReason>,
}

impl ReconcileReport {
    fn skipped(generation: u64, reason: SkipReason) -> Self {
        Self {
            generation,
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn removed(&self) -> usize {
        self.removed_devices.len() + self.removed_entities.len()
    }
}

/// Prunes stale device and entity records.
pub struct ReconciliationEngine {
    devices: Arc<dyn RecordRegistry>,
    entities: Arc<dyn RecordRegistry>,
    reconciled: Mutex<HashMap<String, u64>>,
}

impl ReconciliationEngine {
    pub fn new(devices: Arc<dyn RecordRegistry>, entities: Arc<dyn RecordRegistry>) -> Self {
        Self {
            devices,
            entities,
            reconciled: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles the records of `entry_id` against `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::IncompleteHierarchy`] for a snapshot that was
    /// not finished, or the registry's error. A failed run does not count as
    /// the generation's reconciliation.
    pub async fn reconcile(
        &self,
        entry_id: &str,
        snapshot: &HierarchySnapshot,
        generation: u64,
    ) -> Result<ReconcileReport> {
        if !snapshot.is_complete() {
            return Err(LightwaveError::IncompleteHierarchy.into());
        }

        // Held for the whole run so the same generation cannot be pruned twice.
        let mut reconciled = self.reconciled.lock().await;

        if reconciled.get(entry_id).is_some_and(|g| *g >= generation) {
            tracing::debug!(
                "Generation {} already reconciled for {}",
                generation,
                entry_id
            );
            return Ok(ReconcileReport::skipped(
                generation,
                SkipReason::AlreadyReconciled,
            ));
        }

        if snapshot.is_empty() && !snapshot.is_empty_confirmed() {
            tracing::warn!(
                "Hierarchy for {} is empty; keeping registered records",
                entry_id
            );
            return Ok(ReconcileReport::skipped(
                generation,
                SkipReason::UnconfirmedEmpty,
            ));
        }

        let (kept_entities, removed_entities) =
            prune(self.entities.as_ref(), entry_id, snapshot).await?;
        let (kept_devices, removed_devices) =
            prune(self.devices.as_ref(), entry_id, snapshot).await?;

        reconciled.insert(entry_id.to_string(), generation);

        let report = ReconcileReport {
            generation,
            kept_devices,
            kept_entities,
            removed_devices,
            removed_entities,
            skipped: None,
        };
        tracing::info!(
            "Reconciled {} (generation {}): removed {} records",
            entry_id,
            generation,
            report.removed()
        );
        Ok(report)
    }

    /// Forgets which generations ran for `entry_id`.
    pub async fn forget(&self, entry_id: &str) {
        self.reconciled.lock().await.remove(entry_id);
    }
}

fn is_present(record: &RegisteredRecord, snapshot: &HierarchySnapshot) -> bool {
    record.identifiers.iter().any(|id| snapshot.contains(id))
}

async fn prune(
    registry: &dyn RecordRegistry,
    entry_id: &str,
    snapshot: &HierarchySnapshot,
) -> Result<(usize, Vec<String>)> {
    let mut kept = 0;
    let mut removed = Vec::new();

    for record in registry.records_for_entry(entry_id).await? {
        if is_present(&record, snapshot) {
            kept += 1;
            continue;
        }
        tracing::debug!("Removing stale record {} ({})", record.record_id, record.name);
        registry.remove(&record.record_id).await?;
        removed.push(record.record_id);
    }

    Ok((kept, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryRegistry;
    use crate::host::RecordSpec;
    use crate::link::hierarchy::{Device, HierarchyBuilder};

    fn snapshot_with(ids: &[&str]) -> HierarchySnapshot {
        ids.iter()
            .fold(HierarchyBuilder::new(), |b, id| {
                b.device(Device {
                    id: id.to_string(),
                    name: id.to_string(),
                    product_code: "L21".to_string(),
                    gen2: true,
                    link: None,
                })
            })
            .finish()
    }

    async fn engine_with_devices(ids: &[&str]) -> (ReconciliationEngine, Arc<MemoryRegistry>) {
        let devices = Arc::new(MemoryRegistry::new());
        for id in ids {
            devices
                .get_or_create("entry", RecordSpec::new(*id, *id))
                .await
                .unwrap();
        }
        let engine = ReconciliationEngine::new(devices.clone(), Arc::new(MemoryRegistry::new()));
        (engine, devices)
    }

    #[tokio::test]
    async fn test_removes_only_absent_records() {
        let (engine, devices) = engine_with_devices(&["a", "b", "c"]).await;

        let report = engine
            .reconcile("entry", &snapshot_with(&["a", "c"]), 1)
            .await
            .unwrap();

        assert_eq!(report.removed_devices.len(), 1);
        assert_eq!(report.kept_devices, 2);
        assert_eq!(devices.len().await, 2);
    }

    #[tokio::test]
    async fn test_incomplete_snapshot_is_refused() {
        let (engine, devices) = engine_with_devices(&["a"]).await;
        let partial = HierarchyBuilder::new().partial();

        let err = engine.reconcile("entry", &partial, 1).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightwaveError>(),
            Some(LightwaveError::IncompleteHierarchy)
        ));
        assert_eq!(devices.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_generation_runs_once() {
        let (engine, devices) = engine_with_devices(&["a"]).await;
        engine
            .reconcile("entry", &snapshot_with(&["a"]), 1)
            .await
            .unwrap();

        // A record registered later is not pruned by a repeat of generation 1.
        devices
            .get_or_create("entry", RecordSpec::new("late", "late"))
            .await
            .unwrap();
        let report = engine
            .reconcile("entry", &snapshot_with(&["a"]), 1)
            .await
            .unwrap();

        assert_eq!(report.skipped, Some(SkipReason::AlreadyReconciled));
        assert_eq!(devices.len().await, 2);
    }

    #[tokio::test]
    async fn test_other_entries_untouched() {
        let (engine, devices) = engine_with_devices(&["a"]).await;
        devices
            .get_or_create("other", RecordSpec::new("z", "z"))
            .await
            .unwrap();

        engine
            .reconcile("entry", &snapshot_with(&["b"]), 1)
            .await
            .unwrap();

        assert_eq!(devices.records_for_entry("other").await.unwrap().len(), 1);
    }
}
