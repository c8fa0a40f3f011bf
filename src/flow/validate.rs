//! Remote credential validation
//!
//! [`CredentialValidator`] proves candidate credentials by opening a transient
//! link, connecting with the interactive retry policy and fetching the
//! hierarchy. The transient link is always closed before `validate` returns,
//! including when the probe panics. If the `validate` future is dropped
//! half-way, a guard closes the link from a spawned task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::auth::token_store::{CredentialSet, TokenSet};
use crate::error::{LightwaveError, Result};
use crate::flow::FlowErrorCode;
use crate::link::activation::{Activation, ActivationController, RetryPolicy};
use crate::link::hierarchy::HierarchySnapshot;
use crate::link::{LinkClient, LinkFactory};

/// Result of validating one set of candidate credentials.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The backend accepted the credentials and issued tokens.
    Valid {
        tokens: TokenSet,
        hierarchy: HierarchySnapshot,
    },
    Invalid(FlowErrorCode),
}

enum Probe {
    Connected(HierarchySnapshot),
    Exhausted(Option<anyhow::Error>),
}

/// Validates credentials against the backend on a throwaway link.
pub struct CredentialValidator {
    factory: Arc<dyn LinkFactory>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl CredentialValidator {
    pub fn new(factory: Arc<dyn LinkFactory>) -> Self {
        Self {
            factory,
            policy: RetryPolicy::interactive(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ties in-flight validations to `cancel`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validates `candidate`.
    ///
    /// Never fails: every problem is folded into
    /// [`ValidationOutcome::Invalid`] with the error code the flow shows.
    pub async fn validate(&self, candidate: &CredentialSet) -> ValidationOutcome {
        let link = self.factory.create();
        let mut guard = CloseOnDrop::new(Arc::clone(&link));
        let controller = ActivationController::new(link, self.cancel.child_token());

        tracing::debug!("Validating credentials for {}", candidate.identity);
        let probe = AssertUnwindSafe(self.probe(&controller, candidate))
            .catch_unwind()
            .await;

        let outcome = match probe {
            Ok(Ok(Probe::Connected(hierarchy))) => match controller.link().tokens() {
                Some(tokens) => ValidationOutcome::Valid { tokens, hierarchy },
                None => ValidationOutcome::Invalid(FlowErrorCode::Unknown(
                    "backend returned no tokens".to_string(),
                )),
            },
            Ok(Ok(Probe::Exhausted(None))) => ValidationOutcome::Invalid(FlowErrorCode::InvalidAuth),
            Ok(Ok(Probe::Exhausted(Some(e)))) | Ok(Err(e)) => {
                ValidationOutcome::Invalid(classify(&e))
            }
            Err(panic) => ValidationOutcome::Invalid(FlowErrorCode::Unknown(panic_message(&*panic))),
        };

        controller.close("validation finished").await;
        guard.disarm();

        if let ValidationOutcome::Invalid(code) = &outcome {
            tracing::error!(
                "Credential validation for {} failed: {}",
                candidate.identity,
                code
            );
        }
        outcome
    }

    async fn probe(
        &self,
        controller: &ActivationController,
        candidate: &CredentialSet,
    ) -> Result<Probe> {
        controller.link().set_auth(candidate).await?;

        let activation = controller
            .activate(&self.policy, |link| async move { link.fetch_hierarchy().await })
            .await?;

        Ok(match activation {
            Activation::Connected(hierarchy) => Probe::Connected(hierarchy),
            Activation::Exhausted { last_error, .. } => Probe::Exhausted(last_error),
        })
    }
}

/// Closes the transient link when validation is abandoned before its own
/// teardown ran.
struct CloseOnDrop {
    link: Option<Arc<dyn LinkClient>>,
}

impl CloseOnDrop {
    fn new(link: Arc<dyn LinkClient>) -> Self {
        Self { link: Some(link) }
    }

    fn disarm(&mut self) {
        self.link = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Validation abandoned, closing transient link");
                handle.spawn(async move {
                    if let Err(e) = link.disconnect("validation abandoned").await {
                        tracing::warn!("Error while closing abandoned link: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!("Validation abandoned outside a runtime, link left open"),
        }
    }
}

/// Maps a probe error to the code shown to the user.
///
/// Typed errors win; otherwise a message mentioning auth, invalid or
/// unauthorized is treated as a credential rejection and anything else as a
/// connectivity problem.
pub fn classify(error: &anyhow::Error) -> FlowErrorCode {
    match error.downcast_ref::<LightwaveError>() {
        Some(LightwaveError::CannotConnect(_)) => return FlowErrorCode::CannotConnect,
        Some(LightwaveError::InvalidAuth(_)) => return FlowErrorCode::InvalidAuth,
        _ => {}
    }

    let message = error.to_string().to_lowercase();
    if ["auth", "invalid", "unauthorized"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        FlowErrorCode::InvalidAuth
    } else {
        FlowErrorCode::CannotConnect
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during validation".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_store::Secret;
    use crate::link::fake::{ConnectOutcome, FakeLink, FakeLinkFactory};

    fn candidate() -> CredentialSet {
        CredentialSet::new(
            "user@example.com",
            Secret::Password {
                password: "secret".to_string(),
            },
        )
    }

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "abc".to_string(),
            refresh_token: "def".to_string(),
            expires_at: None,
        }
    }

    fn validator_with(link: Arc<FakeLink>) -> CredentialValidator {
        let factory = Arc::new(FakeLinkFactory::new());
        factory.push(link);
        CredentialValidator::new(factory)
    }

    #[test]
    fn test_classify_typed_errors() {
        let e: anyhow::Error = LightwaveError::CannotConnect("invalid host".to_string()).into();
        assert_eq!(classify(&e), FlowErrorCode::CannotConnect);
        let e: anyhow::Error = LightwaveError::InvalidAuth("x".to_string()).into();
        assert_eq!(classify(&e), FlowErrorCode::InvalidAuth);
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(
            classify(&anyhow::anyhow!("401 Unauthorized")),
            FlowErrorCode::InvalidAuth
        );
        assert_eq!(
            classify(&anyhow::anyhow!("Invalid grant")),
            FlowErrorCode::InvalidAuth
        );
        assert_eq!(
            classify(&anyhow::anyhow!("connection reset")),
            FlowErrorCode::CannotConnect
        );
    }

    #[tokio::test]
    async fn test_valid_credentials_return_tokens() {
        let link = Arc::new(FakeLink::new().with_tokens(tokens()));
        let outcome = validator_with(link.clone()).validate(&candidate()).await;

        assert!(matches!(outcome, ValidationOutcome::Valid { ref tokens, .. } if tokens.access_token == "abc"));
        assert_eq!(link.credentials(), Some(candidate()));
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn test_refusals_are_invalid_auth() {
        let link = Arc::new(FakeLink::new());
        link.script_connect([
            ConnectOutcome::Refused,
            ConnectOutcome::Refused,
            ConnectOutcome::Refused,
        ]);
        let outcome = validator_with(link.clone()).validate(&candidate()).await;

        assert_eq!(outcome, ValidationOutcome::Invalid(FlowErrorCode::InvalidAuth));
        assert_eq!(link.connect_calls(), 3);
        assert_eq!(link.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_tokens_is_unknown() {
        let link = Arc::new(FakeLink::new());
        let outcome = validator_with(link).validate(&candidate()).await;
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalid(FlowErrorCode::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_panic_is_unknown_and_link_closed() {
        let link = Arc::new(FakeLink::new().with_tokens(tokens()));
        link.script_connect([ConnectOutcome::Panic]);
        let outcome = validator_with(link.clone()).validate(&candidate()).await;

        match outcome {
            ValidationOutcome::Invalid(FlowErrorCode::Unknown(msg)) => {
                assert!(msg.contains("panicked"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!link.is_open());
        assert_eq!(link.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_validation_closes_link() {
        let link = Arc::new(FakeLink::new().with_tokens(tokens()));
        link.stall_requests(true);
        let validator = validator_with(link.clone());

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            validator.validate(&candidate()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(link.fetch_calls(), 1);

        for _ in 0..100 {
            if link.disconnect_calls() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!link.is_open());
        assert_eq!(link.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_completed_validation_closes_once() {
        let link = Arc::new(FakeLink::new().with_tokens(tokens()));
        validator_with(link.clone()).validate(&candidate()).await;

        tokio::task::yield_now().await;
        assert_eq!(link.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_cannot_connect() {
        let link = Arc::new(FakeLink::new().with_tokens(tokens()));
        link.fail_fetch(Some("socket closed"));
        let outcome = validator_with(link.clone()).validate(&candidate()).await;

        assert_eq!(
            outcome,
            ValidationOutcome::Invalid(FlowErrorCode::CannotConnect)
        );
        assert!(!link.is_open());
    }
}
