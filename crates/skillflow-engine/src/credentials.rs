//! Credential resolution for data-query executors.
//!
//! Skills name a credential; the vault resolves it to a connection string at
//! execution time. The vault implementation itself is an external
//! collaborator; this module defines the interface consumed from it plus an
//! environment-backed implementation used in local deployments and tests.

use std::path::Path;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::{EngineError, Result};

/// Resolves credential references to connection strings.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn resolve(&self, user_id: Option<&str>, credential_ref: &str) -> Result<SecretString>;
}

/// Vault backed by process environment variables:
/// `SKILLFLOW_CREDENTIAL_{REF}` with the reference uppercased and
/// non-alphanumerics mapped to underscores.
pub struct EnvCredentialVault;

#[async_trait]
impl CredentialVault for EnvCredentialVault {
    async fn resolve(&self, _user_id: Option<&str>, credential_ref: &str) -> Result<SecretString> {
        let var = format!(
            "SKILLFLOW_CREDENTIAL_{}",
            credential_ref
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect::<String>()
        );
        match std::env::var(&var) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
            _ => Err(EngineError::Credential(format!(
                "failed to resolve credential '{credential_ref}' (set {var} or configure a vault)"
            ))),
        }
    }
}

/// Credential source for one query, in resolution order.
#[derive(Debug, Clone, Default)]
pub struct CredentialSource<'a> {
    pub credential_ref: Option<&'a str>,
    /// Deprecated skill-local config file holding a `credential_ref`.
    pub db_config_file: Option<&'a str>,
}

/// Resolve the connection string for a query.
///
/// Order: `credential_ref` via the vault, then the deprecated
/// `db_config_file`, then the global connection string from configuration.
pub async fn resolve_database_url(
    source: CredentialSource<'_>,
    vault: &dyn CredentialVault,
    user_id: Option<&str>,
    global_url: Option<&str>,
    db_type: &str,
) -> Result<SecretString> {
    if let Some(credential_ref) = source.credential_ref {
        return vault.resolve(user_id, credential_ref).await;
    }

    if let Some(config_file) = source.db_config_file {
        tracing::warn!(
            file = %config_file,
            "db_config_file is deprecated; set credential_ref directly in the action config"
        );
        let raw = std::fs::read_to_string(Path::new(config_file)).map_err(|e| {
            EngineError::Credential(format!("database config file not found: {config_file}: {e}"))
        })?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Credential(format!("invalid JSON in {config_file}: {e}")))?;
        let credential_ref = parsed
            .get("credential_ref")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                EngineError::Credential(format!("{config_file} must contain a 'credential_ref' field"))
            })?;
        return vault.resolve(user_id, credential_ref).await;
    }

    match global_url {
        Some(url) if !url.trim().is_empty() => {
            tracing::debug!(db_type = %db_type, "using global database URL");
            Ok(SecretString::from(url.to_string()))
        }
        _ => Err(EngineError::Credential(format!(
            "database configuration not found for {db_type}: set 'credential_ref' in the skill \
             action config or configure a global database URL"
        ))),
    }
}

/// Expose a resolved secret for driver consumption.
pub fn expose(secret: &SecretString) -> &str {
    secret.expose_secret()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVault(&'static str);

    #[async_trait]
    impl CredentialVault for FixedVault {
        async fn resolve(&self, _user: Option<&str>, _r: &str) -> Result<SecretString> {
            Ok(SecretString::from(self.0.to_string()))
        }
    }

    #[tokio::test]
    async fn test_credential_ref_wins() {
        let source = CredentialSource { credential_ref: Some("analytics"), db_config_file: None };
        let url = resolve_database_url(source, &FixedVault("postgres://vault"), None, Some("postgres://global"), "postgres")
            .await
            .unwrap();
        assert_eq!(expose(&url), "postgres://vault");
    }

    #[tokio::test]
    async fn test_global_fallback() {
        let url = resolve_database_url(
            CredentialSource::default(),
            &FixedVault("unused"),
            None,
            Some("postgres://global"),
            "postgres",
        )
        .await
        .unwrap();
        assert_eq!(expose(&url), "postgres://global");
    }

    #[tokio::test]
    async fn test_no_source_fails_with_guidance() {
        let err = resolve_database_url(
            CredentialSource::default(),
            &FixedVault("unused"),
            None,
            None,
            "postgres",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("credential_ref"));
    }

    #[tokio::test]
    async fn test_db_config_file_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db_config.json");
        std::fs::write(&path, r#"{"credential_ref": "legacy_db"}"#).unwrap();
        let source = CredentialSource {
            credential_ref: None,
            db_config_file: Some(path.to_str().unwrap()),
        };
        let url = resolve_database_url(source, &FixedVault("postgres://legacy"), None, None, "postgres")
            .await
            .unwrap();
        assert_eq!(expose(&url), "postgres://legacy");
    }

    #[tokio::test]
    async fn test_env_vault() {
        std::env::set_var("SKILLFLOW_CREDENTIAL_MY_PG", "postgres://env");
        let url = EnvCredentialVault.resolve(None, "my-pg").await.unwrap();
        assert_eq!(expose(&url), "postgres://env");
        assert!(EnvCredentialVault.resolve(None, "absent-ref").await.is_err());
        std::env::remove_var("SKILLFLOW_CREDENTIAL_MY_PG");
    }
}
