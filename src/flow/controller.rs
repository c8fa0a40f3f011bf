//! Authentication flow state machine
//!
//! ```text
//! MethodSelection ──> CredentialCollection ──> Validating ──> Completing
//!        │                    ^                     │
//!        │                    └──── (error) ────────┘
//!        │
//!        └─ authorization-code ──> AwaitingClientRegistration ──> Completing
//! ```
//!
//! [`FlowController::begin`] starts a flow for one of the three sources and
//! [`FlowController::step`] advances it by one caller round-trip. The state is
//! a value passed in and returned; the controller itself holds only
//! collaborators.
//!
//! Ordering guarantees on completion:
//!
//! 1. the resulting identity is checked against the bound entry (reauth and
//!    reconfigure) before anything is written
//! 2. a user-initiated flow re-checks the single-instance rule
//! 3. credentials are persisted
//! 4. the entry is created, or updated and reloaded

use std::sync::Arc;

use uuid::Uuid;

use crate::auth::manager::TokenLifecycleManager;
use crate::auth::method::{
    AuthMethod, AuthMethodRegistry, FieldSpec, SchemaViolation, Validation,
    METHOD_SELECTION_FIELDS,
};
use crate::auth::token_store::{CredentialSet, Secret, TokenSet};
use crate::error::{LightwaveError, Result};
use crate::flow::state::{fields, FlowData, FlowSource, FlowState, FlowStep, PendingFlowStore};
use crate::flow::validate::{CredentialValidator, ValidationOutcome};
use crate::flow::{
    AbortReason, AuthorizationCodeProvider, ExternalAction, FlowErrorCode, FlowResult,
};
use crate::host::{EntryStore, NewEntry};

/// Fields that never end up in entry data.
const TRANSIENT_FIELDS: &[&str] = &[
    fields::PASSWORD,
    fields::API_KEY,
    fields::REFRESH_TOKEN,
    fields::TOKEN,
    fields::ERROR,
];

/// Drives authentication flows.
pub struct FlowController {
    entries: Arc<dyn EntryStore>,
    tokens: TokenLifecycleManager,
    pending: PendingFlowStore,
    validator: CredentialValidator,
    authorization: Option<Arc<dyn AuthorizationCodeProvider>>,
}

type Step = Result<(FlowState, FlowResult)>;

impl FlowController {
    pub fn new(
        entries: Arc<dyn EntryStore>,
        tokens: TokenLifecycleManager,
        pending: PendingFlowStore,
        validator: CredentialValidator,
    ) -> Self {
        Self {
            entries,
            tokens,
            pending,
            validator,
            authorization: None,
        }
    }

    /// Enables the authorization-code method.
    pub fn with_authorization_code(mut self, provider: Arc<dyn AuthorizationCodeProvider>) -> Self {
        self.authorization = Some(provider);
        self
    }

    /// Starts a flow.
    ///
    /// A user-initiated flow first resumes a pending authorization-code
    /// continuation, if one exists; otherwise it aborts with
    /// `single_instance_allowed` when an entry already exists. Reauth and
    /// reconfigure preselect the bound entry's method.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::EntryNotFound`] when a reauth/reconfigure
    /// source names an unknown entry, or propagates storage failures.
    pub async fn begin(&self, source: FlowSource) -> Step {
        match source {
            FlowSource::User => self.begin_user().await,
            FlowSource::Reauth { ref entry_id } | FlowSource::Reconfigure { ref entry_id } => {
                let entry = self
                    .entries
                    .get(entry_id)
                    .await?
                    .ok_or_else(|| LightwaveError::EntryNotFound(entry_id.clone()))?;

                let mut state = FlowState::new(source.clone());
                state.bound_identity = Some(entry.unique_id.clone());
                state.data = entry.data;
                for field in TRANSIENT_FIELDS {
                    state.data.remove(field);
                }

                tracing::debug!(
                    "Flow {} started for entry {} ({:?})",
                    state.flow_id,
                    entry.entry_id,
                    source
                );

                match AuthMethodRegistry::from_data(&state.data) {
                    Ok(method) => self.enter_method(state, method).await,
                    Err(e) => {
                        tracing::warn!("Entry {} has no usable auth method: {}", entry_id, e);
                        Ok(method_selection(state, None))
                    }
                }
            }
        }
    }

    async fn begin_user(&self) -> Step {
        if let Some(mut state) = self.pending.take().await? {
            if state.resumed {
                tracing::warn!(
                    "Pending flow {} was already resumed once, starting fresh",
                    state.flow_id
                );
            } else {
                tracing::info!("Resuming pending flow {}", state.flow_id);
                state.resumed = true;
                return self.start_authorization(state).await;
            }
        }

        if !self.entries.entries().await?.is_empty() {
            tracing::debug!("An entry already exists, refusing a second installation");
            return Ok((
                FlowState::new(FlowSource::User),
                FlowResult::Abort(AbortReason::SingleInstanceAllowed),
            ));
        }

        let state = FlowState::new(FlowSource::User);
        tracing::debug!("Flow {} started", state.flow_id);
        Ok(method_selection(state, None))
    }

    /// Advances `state` by one step with the caller's `input`.
    ///
    /// Credential and connectivity failures are returned as a re-presented
    /// form carrying an error code, never as `Err`.
    ///
    /// # Errors
    ///
    /// Propagates storage and host collaborator failures.
    pub async fn step(&self, mut state: FlowState, input: Option<FlowData>) -> Step {
        state.absorb(input);
        tracing::debug!("Flow {} at step {}", state.flow_id, state.step.as_str());

        match state.step {
            FlowStep::MethodSelection => match AuthMethodRegistry::from_data(&state.data) {
                Ok(method) => self.enter_method(state, method).await,
                Err(e) => {
                    tracing::error!("Flow {}: {}", state.flow_id, e);
                    Ok(method_selection(state, Some(FlowErrorCode::InvalidAuthMethod)))
                }
            },
            FlowStep::CredentialCollection | FlowStep::Validating => {
                self.collect_credentials(state).await
            }
            FlowStep::AwaitingClientRegistration => {
                if self.claim_continuation(&state).await? {
                    self.start_authorization(state).await
                } else {
                    tracing::warn!(
                        "Flow {}: continuation was already consumed, starting over",
                        state.flow_id
                    );
                    Ok(restart(state))
                }
            }
            FlowStep::Completing => self.complete_authorization(state).await,
        }
    }

    async fn enter_method(&self, mut state: FlowState, method: AuthMethod) -> Step {
        state.method = Some(method);
        state.data.insert(fields::AUTH_METHOD, method.as_str().into());

        let spec = AuthMethodRegistry::spec(method);
        if spec.validation == Validation::External {
            return self.start_authorization(state).await;
        }

        state.step = FlowStep::CredentialCollection;
        Ok((
            state,
            FlowResult::Form {
                step: FlowStep::CredentialCollection,
                fields: spec.fields,
                error: None,
            },
        ))
    }

    async fn collect_credentials(&self, mut state: FlowState) -> Step {
        let Some(method) = state.method else {
            state.step = FlowStep::MethodSelection;
            return Ok(method_selection(state, Some(FlowErrorCode::InvalidAuthMethod)));
        };
        let spec = AuthMethodRegistry::spec(method);

        let error = match spec.check(&state.data) {
            Ok(()) => None,
            Err(SchemaViolation::Missing(field)) => {
                tracing::error!("Flow {}: missing {}", state.flow_id, field);
                Some(FlowErrorCode::InvalidAuth)
            }
            Err(SchemaViolation::Unsupported(method)) => {
                tracing::error!("Flow {}: {} cannot be validated", state.flow_id, method);
                Some(FlowErrorCode::InvalidAuthMethod)
            }
        };
        if error.is_some() {
            return Ok(credential_form(state, spec.fields, error));
        }

        // Present after a successful check.
        let identity = state.data.get_str(fields::USERNAME).unwrap_or_default().to_string();
        let password = state.data.get_str(fields::PASSWORD).unwrap_or_default().to_string();

        state.step = FlowStep::Validating;
        let candidate = CredentialSet::new(identity.clone(), Secret::Password { password });

        match self.validator.validate(&candidate).await {
            ValidationOutcome::Valid { tokens, .. } => {
                state.step = FlowStep::Completing;
                let credentials = CredentialSet::new(
                    identity.clone(),
                    persisted_secret(method.persisted_as(), tokens),
                );
                self.finish(state, identity, credentials).await
            }
            ValidationOutcome::Invalid(code) => Ok(credential_form(state, spec.fields, Some(code))),
        }
    }

    async fn start_authorization(&self, mut state: FlowState) -> Step {
        state.method = Some(AuthMethod::AuthorizationCode);
        state
            .data
            .insert(fields::AUTH_METHOD, AuthMethod::AuthorizationCode.as_str().into());

        let Some(provider) = self.authorization.as_ref() else {
            tracing::error!("Flow {}: authorization-code is not available", state.flow_id);
            state.step = FlowStep::MethodSelection;
            return Ok(method_selection(state, Some(FlowErrorCode::InvalidAuthMethod)));
        };

        if !provider.has_client_registration().await? {
            state.step = FlowStep::AwaitingClientRegistration;
            self.pending.save(&state).await?;
            tracing::info!(
                "Flow {} suspended until the client registration exists",
                state.flow_id
            );
            return Ok((state, FlowResult::External(ExternalAction::RegisterClient)));
        }

        state.step = FlowStep::Completing;
        let url = provider.authorize_url(&state.flow_id)?;
        tracing::debug!("Flow {} awaiting authorization", state.flow_id);
        Ok((state, FlowResult::External(ExternalAction::Authorize { url })))
    }

    async fn complete_authorization(&self, mut state: FlowState) -> Step {
        if let Some(error) = state.data.get(fields::ERROR) {
            tracing::error!("Flow {}: authorization failed: {}", state.flow_id, error);
            return Ok((state, FlowResult::Abort(AbortReason::OauthFailed)));
        }

        let tokens = match state.data.get(fields::TOKEN).cloned() {
            Some(value) => match serde_json::from_value::<TokenSet>(value) {
                Ok(tokens) => tokens,
                Err(e) => {
                    tracing::error!("Flow {}: unreadable token: {}", state.flow_id, e);
                    return Ok((state, FlowResult::Abort(AbortReason::OauthFailed)));
                }
            },
            None => {
                tracing::error!("Flow {}: authorization returned no token", state.flow_id);
                return Ok((state, FlowResult::Abort(AbortReason::OauthFailed)));
            }
        };

        let identity = state
            .data
            .get_str(fields::INSTANCE_NAME)
            .map(str::to_string)
            .or_else(|| state.bound_identity.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        state.step = FlowStep::Completing;
        let credentials =
            CredentialSet::new(identity.clone(), Secret::AuthorizationCode(tokens));
        self.finish(state, identity, credentials).await
    }

    async fn finish(
        &self,
        state: FlowState,
        identity: String,
        credentials: CredentialSet,
    ) -> Step {
        if let Some(bound) = state.bound_identity.as_deref() {
            if bound != identity {
                let mismatch = LightwaveError::IdentityMismatch {
                    expected: bound.to_string(),
                    actual: identity,
                };
                tracing::warn!("Flow {}: {}", state.flow_id, mismatch);
                return Ok((state, FlowResult::Abort(AbortReason::UniqueIdMismatch)));
            }
        }

        if state.source == FlowSource::User && !self.entries.entries().await?.is_empty() {
            tracing::warn!("Flow {}: {}", state.flow_id, LightwaveError::SingleInstanceConflict);
            return Ok((state, FlowResult::Abort(AbortReason::SingleInstanceAllowed)));
        }

        self.tokens.put(&credentials).await?;

        let mut data = state.data.clone();
        for field in TRANSIENT_FIELDS {
            data.remove(field);
        }
        data.insert(fields::AUTH_METHOD, credentials.method().as_str().into());

        let title = state
            .data
            .get_str(fields::INSTANCE_NAME)
            .unwrap_or(identity.as_str())
            .to_string();

        let result = match &state.source {
            FlowSource::User => {
                let entry = self
                    .entries
                    .create(NewEntry {
                        unique_id: identity,
                        title,
                        data,
                    })
                    .await?;
                tracing::info!("Created entry {} ({})", entry.entry_id, entry.title);
                FlowResult::Created(entry)
            }
            FlowSource::Reauth { entry_id } | FlowSource::Reconfigure { entry_id } => {
                self.entries.update_data(entry_id, data).await?;
                self.entries.schedule_reload(entry_id).await?;
                let reason = if matches!(state.source, FlowSource::Reauth { .. }) {
                    AbortReason::ReauthSuccessful
                } else {
                    AbortReason::ReconfigureSuccessful
                };
                tracing::info!("Updated entry {} ({})", entry_id, reason);
                FlowResult::Updated {
                    entry_id: entry_id.clone(),
                    reason,
                }
            }
        };

        Ok((state, result))
    }

    /// Takes the stored continuation if it belongs to `state`.
    ///
    /// Returns false when the slot is empty or holds another flow; in that
    /// case `state` is stale and must not continue. Another flow's
    /// continuation is put back untouched.
    async fn claim_continuation(&self, state: &FlowState) -> Result<bool> {
        match self.pending.take().await? {
            Some(stored) if stored.flow_id == state.flow_id => Ok(true),
            Some(stored) => {
                self.pending.save(&stored).await?;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

fn persisted_secret(method: AuthMethod, tokens: TokenSet) -> Secret {
    match method {
        AuthMethod::AuthorizationCode => Secret::AuthorizationCode(tokens),
        _ => Secret::RefreshToken(tokens),
    }
}

/// Replaces a stale state with a fresh one for the same source.
fn restart(stale: FlowState) -> (FlowState, FlowResult) {
    let mut state = FlowState::new(stale.source);
    state.bound_identity = stale.bound_identity;
    method_selection(state, None)
}

fn method_selection(mut state: FlowState, error: Option<FlowErrorCode>) -> (FlowState, FlowResult) {
    state.step = FlowStep::MethodSelection;
    (
        state,
        FlowResult::Form {
            step: FlowStep::MethodSelection,
            fields: METHOD_SELECTION_FIELDS,
            error,
        },
    )
}

fn credential_form(
    mut state: FlowState,
    fields: &'static [FieldSpec],
    error: Option<FlowErrorCode>,
) -> (FlowState, FlowResult) {
    state.step = FlowStep::CredentialCollection;
    (
        state,
        FlowResult::Form {
            step: FlowStep::CredentialCollection,
            fields,
            error,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_store::TokenStore;
    use crate::host::memory::{MemoryEntryStore, MemoryStore};
    use crate::link::fake::FakeLinkFactory;
    use serde_json::json;

    fn controller() -> (FlowController, Arc<MemoryEntryStore>) {
        let kv = Arc::new(MemoryStore::new());
        let entries = Arc::new(MemoryEntryStore::new());
        let controller = FlowController::new(
            entries.clone(),
            TokenLifecycleManager::new(TokenStore::new(kv.clone())),
            PendingFlowStore::new(kv),
            CredentialValidator::new(Arc::new(FakeLinkFactory::new())),
        );
        (controller, entries)
    }

    #[tokio::test]
    async fn test_begin_user_shows_method_selection() {
        let (controller, _) = controller();
        let (state, result) = controller.begin(FlowSource::User).await.unwrap();

        assert_eq!(state.step, FlowStep::MethodSelection);
        assert!(matches!(
            result,
            FlowResult::Form { step: FlowStep::MethodSelection, error: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_method_is_re_presented() {
        let (controller, _) = controller();
        let (state, _) = controller.begin(FlowSource::User).await.unwrap();
        let (state, result) = controller
            .step(state, Some(FlowData::from_pairs([("auth_method", json!("magic"))])))
            .await
            .unwrap();

        assert_eq!(state.step, FlowStep::MethodSelection);
        assert_eq!(result.error(), Some(&FlowErrorCode::InvalidAuthMethod));
    }

    #[tokio::test]
    async fn test_authorization_code_unavailable_without_provider() {
        let (controller, _) = controller();
        let (state, _) = controller.begin(FlowSource::User).await.unwrap();
        let (_, result) = controller
            .step(
                state,
                Some(FlowData::from_pairs([("auth_method", json!("authorization-code"))])),
            )
            .await
            .unwrap();

        assert_eq!(result.error(), Some(&FlowErrorCode::InvalidAuthMethod));
    }

    #[tokio::test]
    async fn test_begin_reauth_unknown_entry_fails() {
        let (controller, _) = controller();
        let err = controller
            .begin(FlowSource::Reauth {
                entry_id: "missing".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LightwaveError>(),
            Some(LightwaveError::EntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_is_refused_with_invalid_method() {
        let (controller, entries) = controller();
        let (state, _) = controller.begin(FlowSource::User).await.unwrap();
        let (state, result) = controller
            .step(state, Some(FlowData::from_pairs([("auth_method", json!("api-key"))])))
            .await
            .unwrap();
        assert!(matches!(
            result,
            FlowResult::Form { step: FlowStep::CredentialCollection, error: None, .. }
        ));

        let (_, result) = controller
            .step(
                state,
                Some(FlowData::from_pairs([
                    ("api_key", json!("k")),
                    ("refresh_token", json!("r")),
                ])),
            )
            .await
            .unwrap();

        assert_eq!(result.error(), Some(&FlowErrorCode::InvalidAuthMethod));
        assert!(entries.entries().await.unwrap().is_empty());
    }

    #[test]
    fn test_persisted_secret_shape() {
        let tokens = TokenSet {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: None,
        };
        assert_eq!(
            persisted_secret(AuthMethod::RefreshToken, tokens.clone()).method(),
            AuthMethod::RefreshToken
        );
        assert_eq!(
            persisted_secret(AuthMethod::AuthorizationCode, tokens).method(),
            AuthMethod::AuthorizationCode
        );
    }
}
