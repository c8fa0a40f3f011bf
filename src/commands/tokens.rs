use colored::Colorize;
use prettytable::{format, row, Table};
use serde::Serialize;

use crate::auth::manager::TokenLifecycleManager;
use crate::auth::token_store::{CredentialSet, Secret, TokenStore};
use crate::config::Config;
use crate::error::Result;
use crate::storage;

fn manager(config: &Config) -> Result<TokenLifecycleManager> {
    Ok(TokenLifecycleManager::new(TokenStore::new(storage::open(
        &config.storage,
    )?)))
}

/// Keeps the first four characters of a secret.
fn redact(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        return "********".to_string();
    }
    let head: String = secret.chars().take(4).collect();
    format!("{}...", head)
}

/// Printable view of a credential set with secrets redacted.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct CredentialView {
    identity: String,
    method: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    api_key: Option<String>,
    password: Option<String>,
    expires_at: Option<String>,
}

impl From<&CredentialSet> for CredentialView {
    fn from(credentials: &CredentialSet) -> Self {
        let mut view = CredentialView {
            identity: credentials.identity.clone(),
            method: credentials.method().to_string(),
            access_token: None,
            refresh_token: None,
            api_key: None,
            password: None,
            expires_at: None,
        };

        match &credentials.secret {
            Secret::Password { password } => view.password = Some(redact(password)),
            Secret::ApiKey {
                api_key,
                refresh_token,
            } => {
                view.api_key = Some(redact(api_key));
                view.refresh_token = Some(redact(refresh_token));
            }
            Secret::RefreshToken(tokens) | Secret::AuthorizationCode(tokens) => {
                view.access_token = Some(redact(&tokens.access_token));
                view.refresh_token = Some(redact(&tokens.refresh_token));
                view.expires_at = tokens.expires_at.map(|t| t.to_rfc3339());
            }
        }
        view
    }
}

/// Shows the credential set stored for `identity`.
pub async fn show(config: &Config, identity: &str, json: bool) -> Result<()> {
    let Some(credentials) = manager(config)?.get(identity).await? else {
        println!(
            "{}",
            format!("No credentials stored for {}", identity).yellow()
        );
        return Ok(());
    };

    let view = CredentialView::from(&credentials);
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let dash = || "-".to_string();
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.add_row(row!["Field".bold(), "Value".bold()]);
    table.add_row(row!["identity", view.identity.cyan()]);
    table.add_row(row!["method", view.method]);
    table.add_row(row!["access_token", view.access_token.unwrap_or_else(dash)]);
    table.add_row(row!["refresh_token", view.refresh_token.unwrap_or_else(dash)]);
    table.add_row(row!["api_key", view.api_key.unwrap_or_else(dash)]);
    table.add_row(row!["password", view.password.unwrap_or_else(dash)]);
    table.add_row(row!["expires_at", view.expires_at.unwrap_or_else(dash)]);
    table.printstd();
    Ok(())
}

/// Deletes every record stored for `identity`.
pub async fn delete(config: &Config, identity: &str) -> Result<()> {
    manager(config)?.delete(identity).await?;
    tracing::info!("Deleted stored credentials for {}", identity);
    println!(
        "{}",
        format!("Deleted credentials for {}", identity).green()
    );
    Ok(())
}
