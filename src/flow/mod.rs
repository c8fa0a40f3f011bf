//! Interactive authentication flow
//!
//! Setup, reauthentication and reconfiguration all run through the same
//! state machine in [`controller::FlowController`]. Each caller round-trip
//! submits the current [`FlowState`] plus optional input and receives the
//! next state together with a [`FlowResult`] telling the host what to show.
//!
//! - [`state`] -- flow state value objects and the pending continuation store
//! - [`validate`] -- remote credential validation on a transient link
//! - [`controller`] -- the state machine
//! - [`options`] -- per-entry options (HomeKit exposure)

use std::fmt;

use serde::Serialize;
use url::Url;

use crate::auth::method::FieldSpec;
use crate::error::Result;
use crate::host::ConfigEntry;

pub mod controller;
pub mod options;
pub mod state;
pub mod validate;

pub use controller::FlowController;
pub use state::{FlowData, FlowSource, FlowState, FlowStep, PendingFlowStore};
pub use validate::{CredentialValidator, ValidationOutcome};

/// Error attached to a re-presented step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowErrorCode {
    CannotConnect,
    InvalidAuth,
    InvalidAuthMethod,
    /// Anything unexpected; carries the original message for diagnostics.
    Unknown(String),
}

impl FlowErrorCode {
    /// Wire code shown by the host.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowErrorCode::CannotConnect => "cannot_connect",
            FlowErrorCode::InvalidAuth => "invalid_auth",
            FlowErrorCode::InvalidAuthMethod => "invalid_auth_method",
            FlowErrorCode::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for FlowErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowErrorCode::Unknown(msg) => write!(f, "unknown: {}", msg),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Reason attached to a terminal flow outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    SingleInstanceAllowed,
    ReauthSuccessful,
    ReconfigureSuccessful,
    UniqueIdMismatch,
    OauthFailed,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::SingleInstanceAllowed => "single_instance_allowed",
            AbortReason::ReauthSuccessful => "reauth_successful",
            AbortReason::ReconfigureSuccessful => "reconfigure_successful",
            AbortReason::UniqueIdMismatch => "unique_id_mismatch",
            AbortReason::OauthFailed => "oauth_failed",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band action the host must perform before the flow can continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalAction {
    /// Register the one-time authorization-code client. The flow is
    /// suspended and resumes on the next user-initiated flow.
    RegisterClient,
    /// Send the user to the authorization page; the exchange result comes
    /// back as the next step's input.
    Authorize { url: Url },
}

/// What the host should do after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowResult {
    /// Show (or re-show) a form.
    Form {
        step: state::FlowStep,
        fields: &'static [FieldSpec],
        error: Option<FlowErrorCode>,
    },
    External(ExternalAction),
    /// A new entry was created.
    Created(ConfigEntry),
    /// An existing entry was replaced in place and a reload was scheduled.
    Updated {
        entry_id: String,
        reason: AbortReason,
    },
    Abort(AbortReason),
}

impl FlowResult {
    /// Error attached to a form, if any.
    pub fn error(&self) -> Option<&FlowErrorCode> {
        match self {
            FlowResult::Form { error, .. } => error.as_ref(),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowResult::Created(_) | FlowResult::Updated { .. } | FlowResult::Abort(_)
        )
    }
}

/// Host side of the authorization-code grant.
#[async_trait::async_trait]
pub trait AuthorizationCodeProvider: Send + Sync {
    /// Whether the one-time client registration exists.
    async fn has_client_registration(&self) -> Result<bool>;

    /// Authorization URL for the flow identified by `flow_id`.
    fn authorize_url(&self, flow_id: &str) -> Result<Url>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_code_carries_message() {
        let code = FlowErrorCode::Unknown("boom".to_string());
        assert_eq!(code.as_str(), "unknown");
        assert_eq!(code.to_string(), "unknown: boom");
    }

    #[test]
    fn test_abort_reason_codes() {
        assert_eq!(
            AbortReason::SingleInstanceAllowed.to_string(),
            "single_instance_allowed"
        );
        assert_eq!(AbortReason::UniqueIdMismatch.as_str(), "unique_id_mismatch");
    }

    #[test]
    fn test_form_is_not_terminal() {
        let form = FlowResult::Form {
            step: state::FlowStep::MethodSelection,
            fields: &[],
            error: Some(FlowErrorCode::InvalidAuthMethod),
        };
        assert!(!form.is_terminal());
        assert_eq!(form.error(), Some(&FlowErrorCode::InvalidAuthMethod));
        assert!(FlowResult::Abort(AbortReason::OauthFailed).is_terminal());
    }
}
