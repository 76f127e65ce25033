use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::error::{classify, ProviderError};
use super::rate_limit::RateLimiter;
use super::token::TokenCache;
use super::types::{CreateVmRequest, CreateVmResponse, Credentials, K8sNodeGroup, K8sOffer, Vm};

const MAX_RETRIES: u32 = 4;
const BASE_BACKOFF: Duration = Duration::from_millis(250);

/// Typed operations over the provider VM API. Implemented by [`ProviderClient`]
/// and mockable via this trait for reconciler unit tests.
#[async_trait]
pub trait VmApi: Send + Sync {
    async fn list_vms(&self, datacenter_id: &str) -> Result<Vec<Vm>, ProviderError>;
    async fn get_vm(&self, id: u64) -> Result<Vm, ProviderError>;
    async fn create_vm(&self, req: CreateVmRequest) -> Result<CreateVmResponse, ProviderError>;
    async fn delete_vm(&self, id: u64) -> Result<(), ProviderError>;
    async fn list_k8s_offers(&self, datacenter_id: &str) -> Result<Vec<K8sOffer>, ProviderError>;
    async fn list_k8s_node_groups(&self, cluster_id: &str) -> Result<Vec<K8sNodeGroup>, ProviderError>;
}

/// Production implementation backed by `reqwest`. Retries, rate limiting,
/// and token refresh are handled internally so every caller sees only the
/// §7 error taxonomy.
pub struct ProviderClient {
    http: reqwest::Client,
    tokens: TokenCache,
    limiter: RateLimiter,
}

impl ProviderClient {
    pub fn new(credentials: Credentials, rate_limit_per_sec: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            http,
            tokens: TokenCache::new(credentials),
            limiter: RateLimiter::new(rate_limit_per_sec, rate_limit_per_sec),
        }
    }

    /// Applies rotated credentials (e.g. from a changed credentials Secret)
    /// to this already-running client; the next request re-authenticates.
    pub async fn set_credentials(&self, credentials: Credentials) {
        self.tokens.set_credentials(credentials).await;
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&(impl serde::Serialize + Sync)>,
    ) -> Result<T, ProviderError> {
        let mut attempt = 0;
        let mut refreshed_on_auth_failure = false;

        loop {
            self.limiter.acquire().await;

            let token = self.tokens.get(&self.http).await?;
            let base_url = self.tokens.base_url().await;
            let mut builder = self
                .http
                .request(method.clone(), format!("{base_url}{path}"))
                .bearer_auth(token);
            if let Some(b) = body {
                builder = builder.json(b);
            }

            let resp = builder.send().await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt);
                    warn!(error = %e, attempt, "provider_request_transport_error_retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(e) => return Err(ProviderError::Transient(e.to_string())),
            };

            let status = resp.status();

            if status.is_success() {
                return resp.json().await.map_err(|e| ProviderError::Invalid(e.to_string()));
            }

            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);

            let body_text = resp.text().await.unwrap_or_default();
            let err = classify(status, retry_after, &body_text);

            match &err {
                ProviderError::Auth(_) if !refreshed_on_auth_failure => {
                    refreshed_on_auth_failure = true;
                    debug!("provider_auth_error_refreshing_token");
                    self.tokens.refresh(&self.http).await?;
                    continue;
                }
                _ if err.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let backoff = retry_after.unwrap_or(BASE_BACKOFF * 2u32.pow(attempt));
                    warn!(error = %err, attempt, "provider_request_retryable_error");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                _ => return Err(err),
            }
        }
    }
}

#[async_trait]
impl VmApi for ProviderClient {
    async fn list_vms(&self, datacenter_id: &str) -> Result<Vec<Vm>, ProviderError> {
        self.request(reqwest::Method::GET, &format!("/v1/vms?datacenter_id={datacenter_id}"), None::<&()>)
            .await
    }

    async fn get_vm(&self, id: u64) -> Result<Vm, ProviderError> {
        self.request(reqwest::Method::GET, &format!("/v1/vms/{id}"), None::<&()>).await
    }

    async fn create_vm(&self, req: CreateVmRequest) -> Result<CreateVmResponse, ProviderError> {
        self.request(reqwest::Method::POST, "/v1/vms", Some(&req)).await
    }

    async fn delete_vm(&self, id: u64) -> Result<(), ProviderError> {
        match self
            .request::<serde_json::Value>(reqwest::Method::DELETE, &format!("/v1/vms/{id}"), None::<&()>)
            .await
        {
            Ok(_) => Ok(()),
            Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_k8s_offers(&self, datacenter_id: &str) -> Result<Vec<K8sOffer>, ProviderError> {
        self.request(reqwest::Method::GET, &format!("/v1/k8s/offers?datacenter_id={datacenter_id}"), None::<&()>)
            .await
    }

    async fn list_k8s_node_groups(&self, cluster_id: &str) -> Result<Vec<K8sNodeGroup>, ProviderError> {
        self.request(reqwest::Method::GET, &format!("/v1/k8s/clusters/{cluster_id}/node-groups"), None::<&()>)
            .await
    }
}
