use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::error::ProviderError;
use super::types::Credentials;

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Caches the provider's bearer token and refreshes it on expiry or 401.
/// Credentials are held behind a lock so a rotated credentials Secret can be
/// applied to an already-running client without rebuilding it.
pub struct TokenCache {
    credentials: RwLock<Credentials>,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials: RwLock::new(credentials), cached: RwLock::new(None) }
    }

    pub async fn base_url(&self) -> String {
        self.credentials.read().await.base_url.clone()
    }

    /// Swaps in new credentials and drops the cached token so the next call
    /// authenticates with them.
    pub async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().await = credentials;
        *self.cached.write().await = None;
    }

    pub async fn get(&self, http: &reqwest::Client) -> Result<String, ProviderError> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }
        self.refresh(http).await
    }

    /// Forces a refresh, used after a 401 from a call that used a cached token.
    pub async fn refresh(&self, http: &reqwest::Client) -> Result<String, ProviderError> {
        let credentials = self.credentials.read().await.clone();
        let resp = http
            .post(format!("{}/oauth/token", credentials.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &credentials.client_id),
                ("client_secret", &credentials.client_secret),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ProviderError::Auth(format!("token refresh failed: {}", resp.status())));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Auth(e.to_string()))?;

        let expires_at = Instant::now() + Duration::from_secs(body.expires_in.saturating_sub(30));
        let mut guard = self.cached.write().await;
        *guard = Some(CachedToken { value: body.access_token.clone(), expires_at });
        Ok(body.access_token)
    }
}
