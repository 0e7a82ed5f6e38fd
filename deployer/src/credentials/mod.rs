//! Credential lookup
//!
//! The deployer treats credentials as an opaque, possibly slow lookup. Storage
//! and encryption belong to whatever backs the provider.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::errors::DeployError;
use crate::filesys::file::File;

/// Resolved login for a server
#[derive(Debug, Clone)]
pub struct Credentials {
    pub alias: Option<String>,
    pub user: String,
    pub host: String,
    pub password: Option<SecretString>,
}

/// What to look up: an alias, or a `(user, host)` pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialQuery {
    pub alias: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl CredentialQuery {
    pub fn alias(alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..Default::default()
        }
    }

    pub fn server(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            alias: None,
            user: Some(user.into()),
            host: Some(host.into()),
        }
    }
}

/// Source of credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` when nothing matches. Several matches are an error listing them.
    async fn resolve(&self, query: &CredentialQuery) -> Result<Option<Credentials>, DeployError>;
}

#[derive(Debug, Deserialize)]
struct StoredCredential {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Credentials kept in a JSON file keyed by `alias:user`
#[derive(Debug, Clone)]
pub struct FileCredentialProvider {
    file: File,
}

impl FileCredentialProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: File::new(path),
        }
    }

    /// `~/.koram_credentials.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".koram_credentials.json")
    }
}

impl Default for FileCredentialProvider {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn resolve(&self, query: &CredentialQuery) -> Result<Option<Credentials>, DeployError> {
        if !self.file.exists().await {
            debug!("No credential file at {}", self.file.path().display());
            return Ok(None);
        }

        let stored: BTreeMap<String, StoredCredential> = self
            .file
            .read_json()
            .await
            .map_err(|e| DeployError::CredentialError(format!("Unreadable credential file: {}", e)))?;

        let matches: Vec<(&String, &StoredCredential)> = stored
            .iter()
            .filter(|(key, entry)| matches_query(key, entry, query))
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [(key, entry)] => {
                let (alias, user) = split_key(key);
                let host = entry.host.clone().filter(|h| !h.is_empty()).ok_or_else(|| {
                    DeployError::CredentialError(format!("No host defined for {}", key))
                })?;
                Ok(Some(Credentials {
                    alias: Some(alias.to_string()),
                    user: user.to_string(),
                    host,
                    password: entry.password.clone().map(SecretString::from),
                }))
            }
            many => {
                let keys: Vec<&str> = many.iter().map(|(k, _)| k.as_str()).collect();
                Err(DeployError::CredentialError(format!(
                    "Several credentials match, pick one explicitly: {}",
                    keys.join(", ")
                )))
            }
        }
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once(':').unwrap_or((key, ""))
}

fn matches_query(key: &str, entry: &StoredCredential, query: &CredentialQuery) -> bool {
    let (alias, user) = split_key(key);
    if let Some(wanted) = &query.alias {
        return alias == wanted;
    }
    let user_ok = query.user.as_deref().is_none_or(|u| u == user);
    let host_ok = query
        .host
        .as_deref()
        .is_none_or(|h| entry.host.as_deref() == Some(h));
    user_ok && host_ok
}
