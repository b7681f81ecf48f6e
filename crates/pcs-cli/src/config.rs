//! Credential cache stored at `~/.pcs/cache.json`.
//!
//! Written by `pcs login`, read by every deployment and removed by
//! `pcs logout`. It holds the bearer token, the cloud it was issued for and
//! the subscriptions the token can reach.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pcs_common::credentials::CachedToken;
use pcs_deploy::CloudEnvironment;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".pcs";
const CACHE_FILE_NAME: &str = "cache.json";

/// A subscription the cached token can deploy to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Subscription id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Whether the login tool marked it as the default
    #[serde(default)]
    pub is_default: bool,
}

/// Persistent login state.
#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialCache {
    /// Cloud the token was issued for
    pub environment: String,
    /// Bearer token for the resource manager
    pub access_token: String,
    /// Token expiry, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<DateTime<Utc>>,
    /// Subscriptions available to the token
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("environment", &self.environment)
            .field("access_token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl CredentialCache {
    /// Cloud the cache was created for.
    pub fn cloud(&self) -> Result<CloudEnvironment> {
        self.environment.parse().map_err(Error::validation)
    }

    /// The subscription marked default, else the first one.
    pub fn default_subscription(&self) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.is_default)
            .or_else(|| self.subscriptions.first())
    }

    /// Credential provider for the cached token.
    pub fn token(&self) -> CachedToken {
        CachedToken::new(self.access_token.clone(), self.expires_on)
    }
}

/// Returns `~/.pcs/`, creating it if it doesn't exist.
pub fn pcs_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    let dir = home.join(CONFIG_DIR_NAME);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::command_failed(format!("failed to create {}: {}", dir.display(), e))
        })?;
    }
    Ok(dir)
}

/// Path to `~/.pcs/cache.json`.
pub fn cache_path() -> Result<PathBuf> {
    Ok(pcs_dir()?.join(CACHE_FILE_NAME))
}

/// Load the cache at `path`; `None` when nobody has logged in.
pub fn load_cache_from(path: &Path) -> Result<Option<CredentialCache>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::command_failed(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| Error::command_failed(format!("failed to parse {}: {}", path.display(), e)))
}

/// Save the cache to `path`.
pub fn save_cache_to(path: &Path, cache: &CredentialCache) -> Result<()> {
    let data = serde_json::to_string_pretty(cache)
        .map_err(|e| Error::command_failed(format!("failed to serialize cache: {}", e)))?;
    std::fs::write(path, data)
        .map_err(|e| Error::command_failed(format!("failed to write {}: {}", path.display(), e)))
}

/// Remove the cache at `path`; `false` if there was none.
pub fn remove_cache_at(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::command_failed(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Load `~/.pcs/cache.json`.
pub fn load_cache() -> Result<Option<CredentialCache>> {
    load_cache_from(&cache_path()?)
}

/// Save `~/.pcs/cache.json`.
pub fn save_cache(cache: &CredentialCache) -> Result<PathBuf> {
    let path = cache_path()?;
    save_cache_to(&path, cache)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> CredentialCache {
        CredentialCache {
            environment: "AzureCloud".to_string(),
            access_token: "secret-token".to_string(),
            expires_on: Some("2030-01-01T00:00:00Z".parse().unwrap()),
            subscriptions: vec![
                Subscription {
                    id: "sub-1".to_string(),
                    name: "Dev".to_string(),
                    is_default: false,
                },
                Subscription {
                    id: "sub-2".to_string(),
                    name: "Prod".to_string(),
                    is_default: true,
                },
            ],
        }
    }

    #[test]
    fn cache_uses_camel_case_on_disk() {
        let json = serde_json::to_value(cache()).unwrap();
        assert_eq!(json["accessToken"], "secret-token");
        assert_eq!(json["subscriptions"][1]["isDefault"], true);
        assert!(json.get("expiresOn").is_some());
    }

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        assert!(load_cache_from(&path).unwrap().is_none());
        save_cache_to(&path, &cache()).unwrap();
        assert_eq!(load_cache_from(&path).unwrap(), Some(cache()));

        assert!(remove_cache_at(&path).unwrap());
        assert!(!remove_cache_at(&path).unwrap());
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_cache_from(&path).is_err());
    }

    #[test]
    fn default_subscription_prefers_flagged() {
        assert_eq!(cache().default_subscription().unwrap().id, "sub-2");

        let mut unflagged = cache();
        unflagged.subscriptions.iter_mut().for_each(|s| s.is_default = false);
        assert_eq!(unflagged.default_subscription().unwrap().id, "sub-1");

        assert!(CredentialCache::default().default_subscription().is_none());
    }

    #[test]
    fn cloud_parses_environment_name() {
        assert_eq!(cache().cloud().unwrap(), CloudEnvironment::AzureCloud);
        let bad = CredentialCache {
            environment: "Mars".to_string(),
            ..cache()
        };
        assert!(bad.cloud().is_err());
    }

    #[test]
    fn debug_redacts_token() {
        assert!(!format!("{:?}", cache()).contains("secret-token"));
    }
}
