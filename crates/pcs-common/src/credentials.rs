//! Bearer credentials for the platform API
//!
//! The login protocol lives outside pcs; the deployment pipeline only asks a
//! [`CredentialProvider`] for a token right before each call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Source of bearer tokens for the infrastructure platform API
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a token valid for the next request, or [`Error::AuthExpired`]
    async fn access_token(&self) -> Result<String>;
}

/// A token captured at login time, valid until `expires_on`
#[derive(Clone)]
pub struct CachedToken {
    token: String,
    expires_on: Option<DateTime<Utc>>,
}

impl CachedToken {
    /// Wrap a token; `None` expiry means the token is trusted until rejected
    pub fn new(token: impl Into<String>, expires_on: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// Whether the token is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_some_and(|exp| exp <= now)
    }
}

impl std::fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for CachedToken {
    async fn access_token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(Error::auth_expired("cached token is empty"));
        }
        if self.is_expired_at(Utc::now()) {
            return Err(Error::auth_expired(format!(
                "cached token expired at {}",
                self.expires_on.map(|t| t.to_rfc3339()).unwrap_or_default()
            )));
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn valid_token_is_returned() {
        let token = CachedToken::new("abc", Some(Utc::now() + Duration::hours(1)));
        assert_eq!(token.access_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let token = CachedToken::new("abc", Some(Utc::now() - Duration::minutes(1)));
        assert!(matches!(
            token.access_token().await,
            Err(Error::AuthExpired { .. })
        ));
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let token = CachedToken::new("", None);
        assert!(matches!(
            token.access_token().await,
            Err(Error::AuthExpired { .. })
        ));
    }

    #[test]
    fn debug_redacts_token() {
        let token = CachedToken::new("super-secret", None);
        assert!(!format!("{:?}", token).contains("super-secret"));
    }
}
