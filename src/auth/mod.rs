//! Authentication: methods, credential storage and token lifecycle
//!
//! - [`method`] -- supported methods and the fields each one collects
//! - [`token_store`] -- credential records in the durable key/value store
//! - [`manager`] -- method switching, renewal persistence and invalidation

pub mod manager;
pub mod method;
pub mod token_store;

pub use manager::{TokenEvent, TokenLifecycleManager, TokenRefresher, TokenSession};
pub use method::{AuthMethod, AuthMethodRegistry, MethodSpec};
pub use token_store::{CredentialSet, Secret, TokenSet, TokenStore};
