//! Credential persistence
//!
//! This module defines the [`CredentialSet`] held for each identity and the
//! [`TokenStore`] that loads and saves it through the host's durable
//! key/value store. Records are keyed by method-namespaced identity
//! (`"{method}:{identity}"`) under a versioned store name, so a record written
//! under one method can never be mistaken for another method's shape.
//!
//! The store has no logic beyond load/save/delete; method switching and write
//! serialization live in [`TokenLifecycleManager`](super::manager::TokenLifecycleManager).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::method::AuthMethod;
use crate::error::Result;
use crate::host::{store_key, KeyValueStore};

// ---------------------------------------------------------------------------
// TokenSet
// ---------------------------------------------------------------------------

/// Seconds before `expires_at` at which a token is already treated as expired.
const EXPIRY_BUFFER_SECS: i64 = 60;

/// An access/refresh token pair as issued by the backend.
///
/// # Examples
///
/// ```
/// use lightwave_smart::auth::token_store::TokenSet;
///
/// let tokens = TokenSet {
///     access_token: "abc".to_string(),
///     refresh_token: "def".to_string(),
///     expires_at: None,
/// };
///
/// // A token with no expiry is never considered expired.
/// assert!(!tokens.is_expired());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Bearer token presented to the backend.
    pub access_token: String,

    /// Long-lived token used to obtain a new access token.
    pub refresh_token: String,

    /// UTC expiry of the access token; `None` means non-expiring.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// Returns `true` when the access token is expired or expires within the
    /// next 60 seconds.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => {
                Utc::now() >= expires_at - chrono::Duration::seconds(EXPIRY_BUFFER_SECS)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CredentialSet
// ---------------------------------------------------------------------------

/// Method-specific secret material. The variant determines the method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum Secret {
    Password { password: String },
    RefreshToken(TokenSet),
    ApiKey { api_key: String, refresh_token: String },
    AuthorizationCode(TokenSet),
}

impl Secret {
    pub fn method(&self) -> AuthMethod {
        match self {
            Secret::Password { .. } => AuthMethod::Password,
            Secret::RefreshToken(_) => AuthMethod::RefreshToken,
            Secret::ApiKey { .. } => AuthMethod::ApiKey,
            Secret::AuthorizationCode(_) => AuthMethod::AuthorizationCode,
        }
    }

    /// Token pair, for the methods that carry one.
    pub fn tokens(&self) -> Option<&TokenSet> {
        match self {
            Secret::RefreshToken(tokens) | Secret::AuthorizationCode(tokens) => Some(tokens),
            _ => None,
        }
    }
}

/// Persisted secret material for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    /// Username or synthetic instance identifier.
    pub identity: String,
    #[serde(flatten)]
    pub secret: Secret,
}

impl CredentialSet {
    pub fn new(identity: impl Into<String>, secret: Secret) -> Self {
        Self {
            identity: identity.into(),
            secret,
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.secret.method()
    }
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

const TOKEN_STORE: &str = "lightwave_smart.tokens";
const TOKEN_STORE_VERSION: u32 = 1;

/// Accessor for credential records in the durable key/value store.
#[derive(Clone)]
pub struct TokenStore {
    kv: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Builds the storage key for `identity` under `method`.
    fn key(method: AuthMethod, identity: &str) -> String {
        store_key(
            TOKEN_STORE,
            TOKEN_STORE_VERSION,
            &format!("{}:{}", method.as_str(), identity),
        )
    }

    /// Persists `credentials` under their own method namespace.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::Serialization`](crate::error::LightwaveError::Serialization)
    /// if encoding fails, or the backend's error if the write is rejected.
    pub async fn save(&self, credentials: &CredentialSet) -> Result<()> {
        let value = serde_json::to_value(credentials)?;
        self.kv
            .save(&Self::key(credentials.method(), &credentials.identity), value)
            .await
    }

    /// Loads the record stored for `identity` under `method`.
    ///
    /// Returns `Ok(None)` when nothing has been saved, so callers can tell
    /// "not authenticated yet" from a storage failure.
    pub async fn load(&self, method: AuthMethod, identity: &str) -> Result<Option<CredentialSet>> {
        match self.kv.load(&Self::key(method, identity)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Deletes the record for `identity` under `method`. Missing records are
    /// not an error.
    pub async fn delete(&self, method: AuthMethod, identity: &str) -> Result<()> {
        self.kv.remove(&Self::key(method, identity)).await
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryStore;
    use chrono::Duration;

    fn tokens_expiring_at(expires_at: Option<DateTime<Utc>>) -> TokenSet {
        TokenSet {
            access_token: "tok".to_string(),
            refresh_token: "ref".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_token_is_expired_when_past_expiry() {
        assert!(tokens_expiring_at(Some(Utc::now() - Duration::seconds(1))).is_expired());
    }

    #[test]
    fn test_token_is_expired_within_buffer_window() {
        // 30 seconds in the future is still within the 60-second buffer.
        assert!(tokens_expiring_at(Some(Utc::now() + Duration::seconds(30))).is_expired());
    }

    #[test]
    fn test_token_not_expired_when_future_expiry() {
        assert!(!tokens_expiring_at(Some(Utc::now() + Duration::hours(1))).is_expired());
    }

    #[test]
    fn test_credential_json_is_method_tagged() {
        let creds = CredentialSet::new(
            "me@example.com",
            Secret::RefreshToken(TokenSet {
                access_token: "abc".to_string(),
                refresh_token: "def".to_string(),
                expires_at: Some(DateTime::from_timestamp(1_800_000_000, 0).expect("valid")),
            }),
        );

        let json = serde_json::to_value(&creds).expect("serialize");
        assert_eq!(json["method"], "refresh-token");
        assert_eq!(json["identity"], "me@example.com");
        assert_eq!(json["expires_at"], 1_800_000_000);

        let restored: CredentialSet = serde_json::from_value(json).expect("deserialize");
        assert_eq!(restored, creds);
    }

    #[test]
    fn test_key_is_method_namespaced() {
        let a = TokenStore::key(AuthMethod::RefreshToken, "me");
        let b = TokenStore::key(AuthMethod::AuthorizationCode, "me");
        assert_ne!(a, b);
        assert_eq!(a, "lightwave_smart.tokens.v1/refresh-token:me");
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = TokenStore::new(Arc::new(MemoryStore::new()));
        let creds = CredentialSet::new(
            "me",
            Secret::Password {
                password: "pw".to_string(),
            },
        );

        store.save(&creds).await.unwrap();
        assert_eq!(
            store.load(AuthMethod::Password, "me").await.unwrap(),
            Some(creds)
        );
        assert!(store
            .load(AuthMethod::RefreshToken, "me")
            .await
            .unwrap()
            .is_none());

        store.delete(AuthMethod::Password, "me").await.unwrap();
        assert!(store
            .load(AuthMethod::Password, "me")
            .await
            .unwrap()
            .is_none());
    }
}
