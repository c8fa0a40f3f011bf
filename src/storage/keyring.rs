//! OS keyring backend
//!
//! Each key becomes one keyring entry under the `lightwave_smart` service,
//! holding the JSON text of the value. Suited to small secret records such as
//! credential sets; the pending flow continuation also fits comfortably.

use crate::error::{LightwaveError, Result};
use crate::host::KeyValueStore;

const SERVICE: &str = "lightwave_smart";

/// Stateless accessor for the OS native keyring.
#[derive(Debug, Clone, Default)]
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> Result<keyring::Entry> {
        Ok(keyring::Entry::new(SERVICE, key).map_err(LightwaveError::Keyring)?)
    }
}

#[async_trait::async_trait]
impl KeyValueStore for KeyringStore {
    /// A missing entry is reported as `Ok(None)`.
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        match Self::entry(key)?.get_password() {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(LightwaveError::Keyring(e).into()),
        }
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(&value)?;
        Self::entry(key)?
            .set_password(&json)
            .map_err(LightwaveError::Keyring)?;
        Ok(())
    }

    /// Deleting an entry that does not exist succeeds.
    async fn remove(&self, key: &str) -> Result<()> {
        match Self::entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(LightwaveError::Keyring(e).into()),
        }
    }
}
