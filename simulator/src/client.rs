use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Per-device result returned by the generate endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub device_id: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeviceResponse {
    device_id: String,
}

/// Thin client for the IoT Center HTTP API.
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn create_device(&self, device_id: &str) -> reqwest::Result<String> {
        let response: CreateDeviceResponse = self
            .client
            .post(format!("{}/api/devices", self.base_url))
            .json(&json!({ "deviceId": device_id }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.device_id)
    }

    /// Returns `true` when the server issued a new authorization.
    pub async fn register(&self, device_id: &str) -> reqwest::Result<bool> {
        let response: Value = self
            .client
            .post(format!("{}/api/authorizations/create", self.base_url))
            .json(&json!({ "deviceId": device_id }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response["status"] == "issued")
    }

    pub async fn generate(&self, device_ids: &[String]) -> reqwest::Result<Vec<WriteOutcome>> {
        self.client
            .post(format!("{}/api/devices/generate", self.base_url))
            .json(&json!({ "deviceIds": device_ids }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}
