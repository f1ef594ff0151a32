// rejourney — session replay for mobile apps
// https://rejourney.co

//! Token seam towards the device-auth collaborator. The core never sees
//! credentials, only short-lived bearer tokens with an expiry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rejourney_core::UploadError;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Supplier of bearer tokens. `refresh` is called once after a 401 before
/// the failure surfaces; a 403/404 from the underlying exchange must map
/// to [`UploadError::AuthPermanent`].
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<AuthToken, UploadError>;

    async fn refresh(&self) -> Result<AuthToken, UploadError>;
}

/// Fixed-token provider for tests and embedders that manage refresh
/// themselves. `refresh` re-issues the same value with a pushed-out expiry.
pub struct StaticTokenProvider {
    token: Mutex<AuthToken>,
}

impl StaticTokenProvider {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(AuthToken::new(value, Utc::now() + Duration::hours(1))),
        }
    }

    /// Swap the token value (used by tests to model a refresh fixing 401s).
    pub fn set(&self, value: impl Into<String>) {
        if let Ok(mut token) = self.token.lock() {
            token.value = value.into();
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<AuthToken, UploadError> {
        self.token
            .lock()
            .map(|t| t.clone())
            .map_err(|_| UploadError::Transient("token lock poisoned".into()))
    }

    async fn refresh(&self) -> Result<AuthToken, UploadError> {
        let mut token = self
            .token
            .lock()
            .map_err(|_| UploadError::Transient("token lock poisoned".into()))?;
        token.expires_at = Utc::now() + Duration::hours(1);
        Ok(token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let live = AuthToken::new("t", Utc::now() + Duration::minutes(5));
        assert!(!live.is_expired());
        let dead = AuthToken::new("t", Utc::now() - Duration::seconds(1));
        assert!(dead.is_expired());
    }

    #[tokio::test]
    async fn test_static_provider_refresh_extends_expiry() {
        let provider = StaticTokenProvider::new("abc");
        let before = provider.token().await.unwrap();
        let after = provider.refresh().await.unwrap();
        assert_eq!(before.value, after.value);
        assert!(after.expires_at >= before.expires_at);
    }
}
