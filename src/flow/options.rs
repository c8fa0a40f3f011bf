//! Per-entry options flow
//!
//! A single form with the HomeKit exposure flag. Submitting it stores the
//! options on the entry and schedules a reload so the installation picks them
//! up.

use std::sync::Arc;

use crate::auth::method::{FieldKind, FieldSpec};
use crate::error::{LightwaveError, Result};
use crate::flow::state::{fields, FlowData};
use crate::host::{EntryOptions, EntryStore};

/// Fields of the options form.
pub const OPTIONS_FIELDS: &[FieldSpec] = &[FieldSpec {
    name: fields::HOMEKIT,
    kind: FieldKind::Boolean,
    required: false,
}];

/// Options form as presented to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsForm {
    pub fields: &'static [FieldSpec],
    /// Current values, or defaults for an entry that never saved options.
    pub current: EntryOptions,
    /// Method the entry authenticates with, shown read-only.
    pub auth_method: String,
}

pub struct OptionsFlow {
    entries: Arc<dyn EntryStore>,
}

impl OptionsFlow {
    pub fn new(entries: Arc<dyn EntryStore>) -> Self {
        Self { entries }
    }

    /// Builds the form for `entry_id`.
    pub async fn show(&self, entry_id: &str) -> Result<OptionsForm> {
        let entry = self
            .entries
            .get(entry_id)
            .await?
            .ok_or_else(|| LightwaveError::EntryNotFound(entry_id.to_string()))?;

        Ok(OptionsForm {
            fields: OPTIONS_FIELDS,
            current: entry.options,
            auth_method: entry
                .data
                .get_str(fields::AUTH_METHOD)
                .unwrap_or("unknown")
                .to_string(),
        })
    }

    /// Stores the submitted options and schedules a reload.
    ///
    /// A missing or non-boolean `homekit` value means `false`.
    pub async fn submit(&self, entry_id: &str, input: FlowData) -> Result<EntryOptions> {
        let options = EntryOptions {
            homekit: input
                .get(fields::HOMEKIT)
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        };
        tracing::debug!("Options for {}: {:?}", entry_id, options);

        self.entries
            .update_options(entry_id, options.clone())
            .await?;
        self.entries.schedule_reload(entry_id).await?;
        Ok(options)
    }
}
