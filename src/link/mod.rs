//! Remote link client abstraction
//!
//! The cloud protocol itself lives outside this crate. The core talks to it
//! through the [`LinkClient`] trait and obtains fresh instances from a
//! [`LinkFactory`]; the transient client used to validate credentials and the
//! long-lived client owned by an installation are always distinct instances.
//!
//! - [`hierarchy`] -- the hub/device/feature-set snapshot returned by a fetch
//! - [`activation`] -- bounded connect retries and idempotent teardown
//! - [`fake`] -- scripted in-process client for tests
//!
//! Errors returned by a client are classified by downcasting to
//! [`LightwaveError`](crate::error::LightwaveError): `CannotConnect` for
//! transport failures, `InvalidAuth` for rejected credentials. Any other error
//! is classified by message.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::auth::token_store::{CredentialSet, TokenSet};
use crate::error::Result;

pub mod activation;
pub mod fake;
pub mod hierarchy;

pub use activation::{Activation, ActivationController, RetryPolicy};
pub use hierarchy::{Device, FeatureSet, HierarchyBuilder, HierarchySnapshot, Hub};

/// A silent token renewal reported by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRefresh {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Connection to the remote backend.
///
/// `connect` performs a single attempt; retrying is the job of
/// [`ActivationController`].
#[async_trait::async_trait]
pub trait LinkClient: Send + Sync + std::fmt::Debug {
    /// Applies the credentials used by the next `connect`.
    async fn set_auth(&self, credentials: &CredentialSet) -> Result<()>;

    /// One connection attempt.
    ///
    /// `Ok(false)` means the backend refused without giving a reason.
    async fn connect(&self) -> Result<bool>;

    /// Closes the transport.
    async fn disconnect(&self, reason: &str) -> Result<()>;

    /// Fetches the full hub/device/feature-set hierarchy.
    async fn fetch_hierarchy(&self) -> Result<HierarchySnapshot>;

    /// Asks the backend to push fresh state for every feature.
    async fn update_states(&self) -> Result<()>;

    /// Tokens currently held by the client, if authenticated.
    fn tokens(&self) -> Option<TokenSet>;

    /// Subscribes to silent token renewals.
    fn token_refreshes(&self) -> broadcast::Receiver<TokenRefresh>;
}

/// Builds new [`LinkClient`] instances.
pub trait LinkFactory: Send + Sync {
    fn create(&self) -> Arc<dyn LinkClient>;
}

impl From<TokenSet> for TokenRefresh {
    fn from(tokens: TokenSet) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
        }
    }
}
