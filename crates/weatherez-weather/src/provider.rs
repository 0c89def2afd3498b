//! Remote weather source: OpenWeatherMap current-weather endpoint.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::instrument;
use weatherez_core::{FetchError, NetworkError, ReqwestErrorExt, Units};

use crate::types::WeatherPayload;

const OPENWEATHER_API_BASE: &str = "https://api.openweathermap.org/data/2.5";

/// Performs one network round trip for a weather query.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Fetch current weather for a city name or `"lat,lon"` query.
    ///
    /// No internal retry; any non-success condition is an error.
    async fn fetch(
        &self,
        query: &str,
        units: Units,
        api_key: &str,
    ) -> Result<WeatherPayload, FetchError>;
}

/// OpenWeatherMap HTTP client.
#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    client: Client,
    base_url: String,
}

impl OpenWeatherClient {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Self::with_base_url(OPENWEATHER_API_BASE, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.into_network_error()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn handle_response(response: reqwest::Response) -> Result<WeatherPayload, FetchError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.into_network_error()))?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| FetchError::Parse(e.to_string()));
        }

        let message = api_message(&body).unwrap_or_else(|| status.to_string());
        match status {
            StatusCode::UNAUTHORIZED => Err(FetchError::InvalidApiKey),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(message)),
            _ => Err(FetchError::Network(NetworkError::ServerError {
                status: status.as_u16(),
                message,
            })),
        }
    }
}

/// Pull the `message` field out of an OpenWeatherMap error body.
fn api_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

#[async_trait]
impl WeatherSource for OpenWeatherClient {
    #[instrument(skip(self, api_key), level = "info")]
    async fn fetch(
        &self,
        query: &str,
        units: Units,
        api_key: &str,
    ) -> Result<WeatherPayload, FetchError> {
        let url = format!("{}/weather", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("units", units.as_str()), ("appid", api_key)])
            .send()
            .await
            .map_err(|e| FetchError::Network(e.into_network_error()))?;

        Self::handle_response(response).await
    }
}
