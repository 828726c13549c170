//! HTTP client for the Pterodactyl panel.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::PanelConfig;

use super::types::{
    CreatePanelServer, CreatePanelUser, DataList, PanelLocation, PanelNest, PanelNode,
    PanelServer, PanelUser, Wrapped,
};

const ACCEPT_HEADER: &str = "Application/vnd.pterodactyl.v1+json";

/// Power signals the client API accepts.
pub const ALLOWED_POWER_SIGNALS: [&str; 4] = ["start", "stop", "restart", "kill"];

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Panel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Panel API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Unexpected panel payload: {0}")]
    UnexpectedShape(String),

    #[error("Invalid power signal '{0}'")]
    InvalidPowerSignal(String),

    #[error("Panel is not configured: {0}")]
    MissingConfig(&'static str),
}

/// Typed wrapper over the panel's Application and Client REST APIs.
#[derive(Clone)]
pub struct PanelClient {
    http: reqwest::Client,
    base_url: String,
    application_api_key: String,
    client_api_key: Option<String>,
}

impl PanelClient {
    pub fn new(config: &PanelConfig) -> Result<Self, PanelError> {
        if config.base_url.is_empty() {
            return Err(PanelError::MissingConfig("panel.base_url"));
        }
        if config.application_api_key.is_empty() {
            return Err(PanelError::MissingConfig("panel.application_api_key"));
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            application_api_key: config.application_api_key.clone(),
            client_api_key: config.client_api_key.clone(),
        })
    }

    // Locations

    pub async fn list_locations(&self, include_nodes: bool) -> Result<Vec<PanelLocation>, PanelError> {
        let query: &[(&str, &str)] = if include_nodes {
            &[("include", "nodes")]
        } else {
            &[]
        };

        let list: DataList<PanelLocation> = self.app_get("/locations", query).await?;
        Ok(list.into_attributes())
    }

    pub async fn get_location_with_nodes(&self, id: i64) -> Result<PanelLocation, PanelError> {
        let wrapped: Wrapped<PanelLocation> = self
            .app_get(&format!("/locations/{id}"), &[("include", "nodes")])
            .await?;
        Ok(wrapped.attributes)
    }

    /// Resolve a location by its `short` code and fetch it with nodes.
    pub async fn location_by_short(&self, short: &str) -> Result<Option<PanelLocation>, PanelError> {
        let locations = self.list_locations(false).await?;

        match locations.iter().find(|l| l.short == short) {
            Some(location) => Ok(Some(self.get_location_with_nodes(location.id).await?)),
            None => Ok(None),
        }
    }

    // Nodes

    pub async fn list_nodes(&self) -> Result<Vec<PanelNode>, PanelError> {
        let list: DataList<PanelNode> = self.app_get("/nodes", &[]).await?;
        Ok(list.into_attributes())
    }

    pub async fn get_node_with_allocations(&self, id: i64) -> Result<PanelNode, PanelError> {
        let wrapped: Wrapped<PanelNode> = self
            .app_get(&format!("/nodes/{id}"), &[("include", "allocations")])
            .await?;
        Ok(wrapped.attributes)
    }

    // Nests and eggs

    pub async fn list_nests_with_eggs(&self) -> Result<Vec<PanelNest>, PanelError> {
        let list: DataList<PanelNest> = self.app_get("/nests", &[("include", "eggs")]).await?;
        Ok(list.into_attributes())
    }

    /// The "Minecraft" nest, which carries every egg we provision from.
    pub async fn minecraft_nest(&self) -> Result<Option<PanelNest>, PanelError> {
        let nests = self.list_nests_with_eggs().await?;
        Ok(nests.into_iter().find(|n| n.name == "Minecraft"))
    }

    // Users

    pub async fn find_user_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PanelUser>, PanelError> {
        let list: DataList<PanelUser> = self
            .app_get("/users", &[("filter[external_id]", external_id)])
            .await?;

        Ok(list
            .into_attributes()
            .into_iter()
            .find(|u| u.external_id.as_deref() == Some(external_id)))
    }

    pub async fn get_user(&self, id: i64) -> Result<PanelUser, PanelError> {
        let wrapped: Wrapped<PanelUser> = self.app_get(&format!("/users/{id}"), &[]).await?;
        Ok(wrapped.attributes)
    }

    pub async fn create_user(&self, payload: &CreatePanelUser) -> Result<PanelUser, PanelError> {
        let wrapped: Wrapped<PanelUser> = self.app_post("/users", payload).await?;
        Ok(wrapped.attributes)
    }

    // Servers

    pub async fn create_server(&self, payload: &CreatePanelServer) -> Result<PanelServer, PanelError> {
        let wrapped: Wrapped<PanelServer> = self.app_post("/servers", payload).await?;
        Ok(wrapped.attributes)
    }

    pub async fn get_server(&self, id: i64) -> Result<PanelServer, PanelError> {
        let wrapped: Wrapped<PanelServer> = self.app_get(&format!("/servers/{id}"), &[]).await?;
        Ok(wrapped.attributes)
    }

    pub async fn find_server_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PanelServer>, PanelError> {
        let list: DataList<PanelServer> = self
            .app_get("/servers", &[("filter[external_id]", external_id)])
            .await?;

        Ok(list
            .into_attributes()
            .into_iter()
            .find(|s| s.external_id.as_deref() == Some(external_id)))
    }

    pub async fn suspend_server(&self, id: i64) -> Result<(), PanelError> {
        self.app_post_empty(&format!("/servers/{id}/suspend")).await
    }

    pub async fn unsuspend_server(&self, id: i64) -> Result<(), PanelError> {
        self.app_post_empty(&format!("/servers/{id}/unsuspend")).await
    }

    pub async fn delete_server(&self, id: i64) -> Result<(), PanelError> {
        let url = format!("{}/api/application/servers/{id}", self.base_url);
        let response = self
            .http
            .delete(&url)
            .headers(self.headers(&self.application_api_key))
            .send()
            .await?;

        Self::check_status(response).await.map(|_| ())
    }

    // Client API

    /// Send a power signal to a server via the client API.
    pub async fn send_power_signal(&self, identifier: &str, signal: &str) -> Result<(), PanelError> {
        let normalized = signal.trim().to_lowercase();
        if !ALLOWED_POWER_SIGNALS.contains(&normalized.as_str()) {
            return Err(PanelError::InvalidPowerSignal(signal.to_string()));
        }

        let key = self
            .client_api_key
            .as_deref()
            .ok_or(PanelError::MissingConfig("panel.client_api_key"))?;

        let url = format!("{}/api/client/servers/{identifier}/power", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers(key))
            .json(&serde_json::json!({ "signal": normalized }))
            .send()
            .await?;

        Self::check_status(response).await.map(|_| ())
    }

    /// Current resource usage of a server via the client API.
    pub async fn get_server_resources(
        &self,
        identifier: &str,
    ) -> Result<serde_json::Value, PanelError> {
        let key = self
            .client_api_key
            .as_deref()
            .ok_or(PanelError::MissingConfig("panel.client_api_key"))?;

        let url = format!("{}/api/client/servers/{identifier}/resources", self.base_url);
        let response = self.http.get(&url).headers(self.headers(key)).send().await?;
        let body = Self::check_status(response).await?;

        serde_json::from_str(&body).map_err(|e| PanelError::UnexpectedShape(e.to_string()))
    }

    // Plumbing

    async fn app_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PanelError> {
        let url = format!("{}/api/application{path}", self.base_url);
        debug!(url = %url, "Panel GET");

        let response = self
            .http
            .get(&url)
            .query(query)
            .headers(self.headers(&self.application_api_key))
            .send()
            .await?;

        let body = Self::check_status(response).await?;
        serde_json::from_str(&body).map_err(|e| PanelError::UnexpectedShape(e.to_string()))
    }

    async fn app_post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        payload: &B,
    ) -> Result<T, PanelError> {
        let url = format!("{}/api/application{path}", self.base_url);
        debug!(url = %url, "Panel POST");

        let response = self
            .http
            .post(&url)
            .headers(self.headers(&self.application_api_key))
            .json(payload)
            .send()
            .await?;

        let body = Self::check_status(response).await?;
        serde_json::from_str(&body).map_err(|e| PanelError::UnexpectedShape(e.to_string()))
    }

    async fn app_post_empty(&self, path: &str) -> Result<(), PanelError> {
        let url = format!("{}/api/application{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers(&self.application_api_key))
            .send()
            .await?;

        Self::check_status(response).await.map(|_| ())
    }

    async fn check_status(response: reqwest::Response) -> Result<String, PanelError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(PanelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }

    fn headers(&self, api_key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HEADER));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PanelConfig;

    fn config() -> PanelConfig {
        PanelConfig {
            base_url: "https://panel.example.com/".to_string(),
            application_api_key: "ptla_key".to_string(),
            client_api_key: Some("ptlc_key".to_string()),
            timeout_secs: 5,
            curse_api_key: None,
        }
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let client = PanelClient::new(&config()).unwrap();
        assert_eq!(client.base_url, "https://panel.example.com");
    }

    #[test]
    fn test_missing_base_url_rejected() {
        let mut cfg = config();
        cfg.base_url = String::new();
        assert!(matches!(
            PanelClient::new(&cfg),
            Err(PanelError::MissingConfig("panel.base_url"))
        ));
    }

    #[tokio::test]
    async fn test_invalid_power_signal_rejected() {
        let client = PanelClient::new(&config()).unwrap();
        let err = client.send_power_signal("abcd1234", "reboot").await.unwrap_err();
        assert!(matches!(err, PanelError::InvalidPowerSignal(_)));
    }
}
