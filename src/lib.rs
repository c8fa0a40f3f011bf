//! lightwave-smart - Lightwave Smart hub integration core
//!
//! This library holds everything an automation host needs to add a Lightwave
//! Smart installation: the interactive authentication flow, credential
//! persistence and renewal, bounded connection activation and pruning of
//! stale device/entity records.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `flow`: Interactive configuration flow (user, reauth, reconfigure) and
//!   the options flow
//! - `auth`: Authentication methods, credential storage and the token
//!   lifecycle manager
//! - `link`: Remote client abstraction, hierarchy snapshot and activation
//!   with retries
//! - `reconcile`: Registry reconciliation against a hierarchy snapshot
//! - `installation`: Setup, unload, reload and removal of one entry
//! - `host`: Traits for the host's entry store, registries and key/value
//!   store, with in-memory implementations
//! - `storage`: Durable key/value backends (sled, OS keyring)
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`, `commands`: Administration command-line interface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lightwave_smart::auth::{TokenLifecycleManager, TokenStore};
//! use lightwave_smart::flow::{CredentialValidator, FlowController, FlowSource, PendingFlowStore};
//! use lightwave_smart::host::memory::{MemoryEntryStore, MemoryStore};
//! use lightwave_smart::link::fake::FakeLinkFactory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let kv = Arc::new(MemoryStore::new());
//!     let controller = FlowController::new(
//!         Arc::new(MemoryEntryStore::new()),
//!         TokenLifecycleManager::new(TokenStore::new(kv.clone())),
//!         PendingFlowStore::new(kv),
//!         CredentialValidator::new(Arc::new(FakeLinkFactory::new())),
//!     );
//!
//!     let (_state, result) = controller.begin(FlowSource::User).await?;
//!     println!("{:?}", result);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod flow;
pub mod host;
pub mod installation;
pub mod link;
pub mod reconcile;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{LightwaveError, Result};
pub use installation::{Installation, InstallationContext, InstallationEvent, SetupReport};
pub use reconcile::{ReconcileReport, ReconciliationEngine};
