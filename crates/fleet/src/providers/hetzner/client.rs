//! Hetzner Robot API client implementation.
//!
//! Uses the Hetzner Robot API for dedicated server management.
//! API Documentation: <https://robot.hetzner.com/doc/webservice/en.html>

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    HetznerServer, RescueRequest, RescueResponse, ResetRequest, VSwitch, VSwitchDetails,
};
use crate::model::{ProviderKind, ProviderServer};
use crate::providers::traits::{Provider, ProviderError};

/// Base URL for Hetzner Robot API.
const API_BASE_URL: &str = "https://robot-ws.your-server.de";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hetzner Robot dedicated server provider.
#[derive(Clone)]
pub struct Hetzner {
    /// HTTP client.
    client: Client,
    /// API base URL.
    base_url: String,
    /// Robot API username.
    username: String,
    /// Robot API password.
    password: String,
    /// Key fingerprints installed into the rescue system.
    authorized_keys: Vec<String>,
}

impl std::fmt::Debug for Hetzner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hetzner")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Hetzner {
    /// Create a new Hetzner Robot provider.
    ///
    /// # Arguments
    /// * `username` - Hetzner Robot API username
    /// * `password` - Hetzner Robot API password
    ///
    /// # Errors
    /// Returns error if a credential is empty or the HTTP client cannot be
    /// created.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let (username, password) = (username.into(), password.into());
        if username.is_empty() || password.is_empty() {
            return Err(ProviderError::Config(
                "Robot user and password must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            username,
            password,
            authorized_keys: Vec::new(),
        })
    }

    /// Install these key fingerprints into every rescue system, so the
    /// prober can log in without a password.
    #[must_use]
    pub fn with_authorized_keys(mut self, fingerprints: Vec<String>) -> Self {
        self.authorized_keys = fingerprints;
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
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with form data.
    async fn post_form<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (form)");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request, ignoring the response body.
    async fn post_form_empty<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (empty response)");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
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

    /// Convert a Robot server into a mirrored inventory entry.
    fn to_provider_server(server: &HetznerServer, vswitch: Option<i64>) -> ProviderServer {
        ProviderServer {
            provider_id: server.server.server_number.to_string(),
            name: server.server.server_name.clone(),
            product: server.server.product.clone(),
            data_center: server.server.dc.clone(),
            ipv4: server.server.server_ip.clone(),
            ipv6: server.server.server_ipv6_net.clone(),
            network_segment: vswitch.map(|id| id.to_string()),
        }
    }

    /// Map server numbers to the vSwitch they are attached to.
    ///
    /// Robot answers 404 when the account has no vSwitches.
    async fn vswitch_membership(&self) -> Result<HashMap<i64, i64>, ProviderError> {
        let vswitches: Vec<VSwitch> = match self.get("/vswitch").await {
            Ok(list) => list,
            Err(ProviderError::NotFound(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };

        let mut membership = HashMap::new();
        for vswitch in vswitches.iter().filter(|v| !v.cancelled) {
            let details: VSwitchDetails = self.get(&format!("/vswitch/{}", vswitch.id)).await?;
            debug!(
                vswitch_id = details.id,
                vlan = vswitch.vlan,
                name = %vswitch.name,
                servers = details.server.len(),
                "Fetched vSwitch"
            );
            for attached in details.server {
                membership.insert(attached.server_number, details.id);
            }
        }
        Ok(membership)
    }

    /// Activate the Linux rescue system for the next boot.
    async fn activate_rescue(&self, server_number: &str) -> Result<RescueResponse, ProviderError> {
        let req = RescueRequest {
            os: "linux".to_string(),
            authorized_key: self.authorized_keys.clone(),
        };
        self.post_form(&format!("/boot/{server_number}/rescue"), &req.form_pairs())
            .await
    }

    /// Trigger hardware reset.
    async fn reset_server(&self, server_number: &str) -> Result<(), ProviderError> {
        let req = ResetRequest {
            reset_type: "hw".to_string(),
        };
        self.post_form_empty(&format!("/reset/{server_number}"), &req)
            .await
    }
}

#[async_trait]
impl Provider for Hetzner {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HetznerDedicated
    }

    async fn list_servers(&self) -> Result<Vec<ProviderServer>, ProviderError> {
        // Robot answers 404 instead of an empty list.
        let servers: Vec<HetznerServer> = match self.get("/server").await {
            Ok(servers) => servers,
            Err(ProviderError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let membership = self.vswitch_membership().await?;

        info!(count = servers.len(), "Listed Hetzner Robot servers");

        Ok(servers
            .iter()
            .filter(|s| !s.server.cancelled)
            .map(|s| {
                let vswitch = membership.get(&s.server.server_number).copied();
                Self::to_provider_server(s, vswitch)
            })
            .collect())
    }

    async fn rescue(&self, provider_id: &str) -> Result<(), ProviderError> {
        info!(server_number = %provider_id, "Activating rescue mode via Hetzner Robot API");

        let rescue = self.activate_rescue(provider_id).await?;
        info!(
            server_number = rescue.rescue.server_number,
            active = rescue.rescue.active,
            "Rescue mode activated"
        );

        self.reset_server(provider_id).await?;
        info!(server_number = %provider_id, "Server reset triggered");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::hetzner::ServerDetails;

    #[test]
    fn test_provider_server_mapping() {
        let server = HetznerServer {
            server: ServerDetails {
                server_number: 12345,
                server_name: "test-server".to_string(),
                server_ip: Some("1.2.3.4".to_string()),
                server_ipv6_net: Some("2001:db8::/64".to_string()),
                product: "AX52".to_string(),
                dc: "FSN1-DC14".to_string(),
                status: "ready".to_string(),
                cancelled: false,
            },
        };

        let converted = Hetzner::to_provider_server(&server, Some(4321));
        assert_eq!(converted.provider_id, "12345");
        assert_eq!(converted.product, "AX52");
        assert_eq!(converted.ipv4.as_deref(), Some("1.2.3.4"));
        assert_eq!(converted.network_segment.as_deref(), Some("4321"));
    }

    #[test]
    fn test_server_list_deserialization() {
        let json = r#"[
            {"server": {
                "server_ip": "123.123.123.123",
                "server_ipv6_net": "2a01:f48:111:4221::",
                "server_number": 321,
                "server_name": "server1",
                "product": "DS 3000",
                "dc": "NBG1-DC1",
                "traffic": "5 TB",
                "status": "ready",
                "cancelled": false,
                "paid_until": "2010-09-02"
            }}
        ]"#;

        let servers: Vec<HetznerServer> = serde_json::from_str(json).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].server.server_number, 321);
        assert_eq!(servers[0].server.dc, "NBG1-DC1");
    }

    #[test]
    fn test_vswitch_details_deserialization() {
        let json = r#"{
            "id": 4321,
            "name": "vswitch-private",
            "vlan": 4000,
            "cancelled": false,
            "server": [
                {"server_ip": "123.123.123.123", "server_number": 321, "status": "ready"}
            ],
            "subnet": [],
            "cloud_network": []
        }"#;

        let details: VSwitchDetails = serde_json::from_str(json).unwrap();
        assert_eq!(details.id, 4321);
        assert_eq!(details.server[0].server_number, 321);
    }

    #[test]
    fn test_rescue_request_form_pairs() {
        let bare = RescueRequest {
            os: "linux".to_string(),
            authorized_key: vec![],
        };
        assert_eq!(bare.form_pairs(), vec![("os", "linux")]);

        let keyed = RescueRequest {
            os: "linux".to_string(),
            authorized_key: vec!["aa:bb".to_string(), "cc:dd".to_string()],
        };
        assert_eq!(
            keyed.form_pairs(),
            vec![
                ("os", "linux"),
                ("authorized_key[]", "aa:bb"),
                ("authorized_key[]", "cc:dd")
            ]
        );
    }

    #[test]
    fn test_empty_credentials_are_rejected() {
        assert!(matches!(
            Hetzner::new("", "secret"),
            Err(ProviderError::Config(_))
        ));
    }
}
