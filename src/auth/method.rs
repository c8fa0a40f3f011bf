//! Supported authentication methods and their input schemas
//!
//! Each [`AuthMethod`] maps to a static [`MethodSpec`] describing the fields
//! the interactive flow must collect and how the candidate credentials are
//! validated. The flow never branches on method name strings; it asks the
//! registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LightwaveError, Result};
use crate::flow::state::{fields, FlowData};

/// Authentication variants understood by the backend.
///
/// The canonical names are kebab-case. The names written by earlier releases
/// of the integration (`refresh`, `api_key`, `oauth`) are accepted when
/// parsing so existing entries keep loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "refresh-token", alias = "refresh")]
    RefreshToken,
    #[serde(rename = "api-key", alias = "api_key")]
    ApiKey,
    #[serde(rename = "authorization-code", alias = "oauth")]
    AuthorizationCode,
}

impl AuthMethod {
    pub const ALL: [AuthMethod; 4] = [
        AuthMethod::Password,
        AuthMethod::RefreshToken,
        AuthMethod::ApiKey,
        AuthMethod::AuthorizationCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Password => "password",
            AuthMethod::RefreshToken => "refresh-token",
            AuthMethod::ApiKey => "api-key",
            AuthMethod::AuthorizationCode => "authorization-code",
        }
    }

    /// Method under which credentials are stored after a successful
    /// validation. A validated password is exchanged for tokens and is never
    /// kept.
    pub fn persisted_as(&self) -> AuthMethod {
        match self {
            AuthMethod::Password | AuthMethod::RefreshToken => AuthMethod::RefreshToken,
            other => *other,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = LightwaveError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "password" => Ok(AuthMethod::Password),
            "refresh-token" | "refresh" => Ok(AuthMethod::RefreshToken),
            "api-key" | "api_key" => Ok(AuthMethod::ApiKey),
            "authorization-code" | "oauth" => Ok(AuthMethod::AuthorizationCode),
            other => Err(LightwaveError::InvalidMethod(other.to_string())),
        }
    }
}

/// Type of a schema field, as presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Secret,
    Boolean,
    Choice,
}

/// One input field of a step schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// How candidate credentials for a method are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Open a transient connection and fetch the hierarchy.
    Remote,
    /// Not supported yet; submissions are refused without contacting the
    /// backend.
    Deferred,
    /// Delegated to an external authorization-code exchange.
    External,
}

/// Schema and validation strategy for one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub method: AuthMethod,
    pub fields: &'static [FieldSpec],
    pub validation: Validation,
}

/// Why a submission failed the local schema check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    /// A required field was absent or empty.
    Missing(&'static str),
    /// The method cannot be validated yet.
    Unsupported(AuthMethod),
}

impl MethodSpec {
    /// Checks that every required field is present and non-empty, and that
    /// the method can be validated at all.
    pub fn check(&self, data: &FlowData) -> std::result::Result<(), SchemaViolation> {
        if let Some(missing) = self
            .fields
            .iter()
            .filter(|f| f.required)
            .find(|f| data.get_str(f.name).is_none())
        {
            return Err(SchemaViolation::Missing(missing.name));
        }

        if self.validation == Validation::Deferred {
            return Err(SchemaViolation::Unsupported(self.method));
        }

        Ok(())
    }

    /// Whether the user has to fill in a form for this method.
    pub fn collects_credentials(&self) -> bool {
        !self.fields.is_empty()
    }
}

const CREDENTIAL_FIELDS: &[FieldSpec] = &[
    FieldSpec::required(fields::USERNAME, FieldKind::Text),
    FieldSpec::required(fields::PASSWORD, FieldKind::Secret),
    FieldSpec::optional(fields::INSTANCE_NAME, FieldKind::Text),
];

const API_KEY_FIELDS: &[FieldSpec] = &[
    FieldSpec::required(fields::API_KEY, FieldKind::Secret),
    FieldSpec::required(fields::REFRESH_TOKEN, FieldKind::Secret),
    FieldSpec::optional(fields::INSTANCE_NAME, FieldKind::Text),
];

/// Schema presented at method selection.
pub const METHOD_SELECTION_FIELDS: &[FieldSpec] =
    &[FieldSpec::required(fields::AUTH_METHOD, FieldKind::Choice)];

static METHOD_TABLE: [MethodSpec; 4] = [
    MethodSpec {
        method: AuthMethod::Password,
        fields: CREDENTIAL_FIELDS,
        validation: Validation::Remote,
    },
    MethodSpec {
        method: AuthMethod::RefreshToken,
        fields: CREDENTIAL_FIELDS,
        validation: Validation::Remote,
    },
    MethodSpec {
        method: AuthMethod::ApiKey,
        fields: API_KEY_FIELDS,
        validation: Validation::Deferred,
    },
    MethodSpec {
        method: AuthMethod::AuthorizationCode,
        fields: &[],
        validation: Validation::External,
    },
];

/// Lookup table from method to schema.
pub struct AuthMethodRegistry;

impl AuthMethodRegistry {
    /// Parses a method name.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::InvalidMethod`] for unrecognized names.
    ///
    /// # Examples
    ///
    /// ```
    /// use lightwave_smart::auth::method::{AuthMethod, AuthMethodRegistry};
    ///
    /// assert_eq!(AuthMethodRegistry::lookup("oauth").unwrap(), AuthMethod::AuthorizationCode);
    /// assert!(AuthMethodRegistry::lookup("kerberos").is_err());
    /// ```
    pub fn lookup(name: &str) -> Result<AuthMethod> {
        Ok(name.parse::<AuthMethod>()?)
    }

    pub fn spec(method: AuthMethod) -> &'static MethodSpec {
        match method {
            AuthMethod::Password => &METHOD_TABLE[0],
            AuthMethod::RefreshToken => &METHOD_TABLE[1],
            AuthMethod::ApiKey => &METHOD_TABLE[2],
            AuthMethod::AuthorizationCode => &METHOD_TABLE[3],
        }
    }

    /// Reads and parses the `auth_method` field of `data`.
    pub fn from_data(data: &FlowData) -> Result<AuthMethod> {
        let name = data
            .get_str(fields::AUTH_METHOD)
            .ok_or_else(|| LightwaveError::InvalidMethod("<missing>".to_string()))?;
        Self::lookup(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_canonical_names() {
        for method in AuthMethod::ALL {
            assert_eq!(AuthMethodRegistry::lookup(method.as_str()).unwrap(), method);
        }
    }

    #[test]
    fn test_lookup_legacy_aliases() {
        assert_eq!(
            AuthMethodRegistry::lookup("refresh").unwrap(),
            AuthMethod::RefreshToken
        );
        assert_eq!(
            AuthMethodRegistry::lookup("api_key").unwrap(),
            AuthMethod::ApiKey
        );
    }

    #[test]
    fn test_lookup_unknown_is_invalid_method() {
        let err = AuthMethodRegistry::lookup("magic").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightwaveError>(),
            Some(LightwaveError::InvalidMethod(name)) if name == "magic"
        ));
    }

    #[test]
    fn test_spec_table_matches_method() {
        for method in AuthMethod::ALL {
            assert_eq!(AuthMethodRegistry::spec(method).method, method);
        }
    }

    #[test]
    fn test_password_and_refresh_share_schema() {
        assert_eq!(
            AuthMethodRegistry::spec(AuthMethod::Password).fields,
            AuthMethodRegistry::spec(AuthMethod::RefreshToken).fields
        );
    }

    #[test]
    fn test_check_rejects_empty_password() {
        let spec = AuthMethodRegistry::spec(AuthMethod::Password);
        let data = FlowData::from_pairs([("username", json!("me")), ("password", json!(""))]);
        assert_eq!(spec.check(&data), Err(SchemaViolation::Missing("password")));
    }

    #[test]
    fn test_check_accepts_without_optional_instance_name() {
        let spec = AuthMethodRegistry::spec(AuthMethod::Password);
        let data = FlowData::from_pairs([("username", json!("me")), ("password", json!("pw"))]);
        assert!(spec.check(&data).is_ok());
    }

    #[test]
    fn test_api_key_is_refused_gracefully() {
        let spec = AuthMethodRegistry::spec(AuthMethod::ApiKey);
        let data = FlowData::from_pairs([
            ("api_key", json!("k")),
            ("refresh_token", json!("r")),
        ]);
        assert_eq!(
            spec.check(&data),
            Err(SchemaViolation::Unsupported(AuthMethod::ApiKey))
        );
    }

    #[test]
    fn test_authorization_code_collects_nothing() {
        let spec = AuthMethodRegistry::spec(AuthMethod::AuthorizationCode);
        assert!(!spec.collects_credentials());
        assert!(spec.check(&FlowData::new()).is_ok());
    }

    #[test]
    fn test_persisted_as() {
        assert_eq!(AuthMethod::Password.persisted_as(), AuthMethod::RefreshToken);
        assert_eq!(
            AuthMethod::AuthorizationCode.persisted_as(),
            AuthMethod::AuthorizationCode
        );
    }

    #[test]
    fn test_serde_accepts_legacy_name() {
        let method: AuthMethod = serde_json::from_value(json!("oauth")).unwrap();
        assert_eq!(method, AuthMethod::AuthorizationCode);
        assert_eq!(
            serde_json::to_value(AuthMethod::RefreshToken).unwrap(),
            json!("refresh-token")
        );
    }
}
