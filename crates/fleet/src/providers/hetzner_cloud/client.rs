//! Hetzner Cloud API client implementation.
//!
//! API Documentation: <https://docs.hetzner.cloud/>

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{ActionResponse, CloudServer, EnableRescueRequest, ServerListResponse};
use crate::model::{ProviderKind, ProviderServer};
use crate::providers::traits::{Provider, ProviderError};

/// Base URL for Hetzner Cloud API.
const API_BASE_URL: &str = "https://api.hetzner.cloud";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Page size used when listing servers.
const PER_PAGE: u32 = 50;

/// Hetzner Cloud provider.
#[derive(Clone)]
pub struct HetznerCloud {
    /// HTTP client.
    client: Client,
    /// API base URL.
    base_url: String,
    /// Project API token.
    token: String,
    /// SSH key ids injected into the rescue system.
    rescue_ssh_keys: Vec<i64>,
}

impl std::fmt::Debug for HetznerCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HetznerCloud")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HetznerCloud {
    /// Create a new Hetzner Cloud provider.
    ///
    /// # Errors
    /// Returns error if the token is empty or the HTTP client cannot be
    /// created.
    pub fn new(token: impl Into<String>) -> Result<Self, ProviderError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ProviderError::Config(
                "Cloud API token must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            token,
            rescue_ssh_keys: Vec::new(),
        })
    }

    /// Inject these project SSH keys into every rescue system.
    #[must_use]
    pub fn with_rescue_ssh_keys(mut self, key_ids: Vec<i64>) -> Self {
        self.rescue_ssh_keys = key_ids;
        self
    }

    /// Point the client at a different API endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with a JSON body.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Convert a Cloud server into a mirrored inventory entry.
    fn to_provider_server(server: &CloudServer) -> ProviderServer {
        ProviderServer {
            provider_id: server.id.to_string(),
            name: server.name.clone(),
            product: server.server_type.name.clone(),
            data_center: server.datacenter.name.clone(),
            ipv4: server.public_net.ipv4.as_ref().map(|a| a.ip.clone()),
            ipv6: server.public_net.ipv6.as_ref().map(|a| a.ip.clone()),
            network_segment: server.private_net.first().map(|n| n.network.to_string()),
        }
    }
}

#[async_trait]
impl Provider for HetznerCloud {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HetznerCloud
    }

    async fn list_servers(&self) -> Result<Vec<ProviderServer>, ProviderError> {
        let mut servers = Vec::new();
        let mut page = 1;

        loop {
            let response: ServerListResponse = self
                .get(&format!("/v1/servers?page={page}&per_page={PER_PAGE}"))
                .await?;
            servers.extend(response.servers.iter().map(Self::to_provider_server));

            match response.meta.and_then(|m| m.pagination.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        info!(count = servers.len(), "Listed Hetzner Cloud servers");
        Ok(servers)
    }

    async fn rescue(&self, provider_id: &str) -> Result<(), ProviderError> {
        info!(server_id = %provider_id, "Enabling rescue mode via Hetzner Cloud API");

        let req = EnableRescueRequest {
            rescue_type: "linux64".to_string(),
            ssh_keys: self.rescue_ssh_keys.clone(),
        };
        let enabled: ActionResponse = self
            .post(&format!("/v1/servers/{provider_id}/actions/enable_rescue"), &req)
            .await?;
        debug!(action_id = enabled.action.id, status = %enabled.action.status, "Rescue enabled");

        let reset: ActionResponse = self
            .post(
                &format!("/v1/servers/{provider_id}/actions/reset"),
                &serde_json::json!({}),
            )
            .await?;
        info!(
            server_id = %provider_id,
            action_id = reset.action.id,
            command = %reset.action.command,
            "Server reset triggered"
        );

        Ok(())
    }
}
