//! HTTP client for the traffic backend.
//!
//! Serves both sides of the pipeline:
//! - [`CatalogSource`]: `GET /v1/traffic/cameras` and `GET /v1/traffic/segments`
//! - [`ReportUploader`]: `POST /v1/traffic/avg-speed-report`
//!
//! The bearer token is looked up on every request so a refreshed login is
//! picked up without rebuilding the client.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::catalog::{CameraDto, CatalogSource, SegmentDto};
use crate::error::{AvgSpeedError, Result};
use crate::queue::ReportUploader;
use crate::report::AvgSpeedReport;

const CAMERAS_PATH: &str = "v1/traffic/cameras";
const SEGMENTS_PATH: &str = "v1/traffic/segments";
const REPORT_PATH: &str = "v1/traffic/avg-speed-report";

/// Supplies the current access token, if the user is signed in.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// Backend connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://traffic.example.org`.
    /// Default: "http://localhost:8080"
    pub base_url: String,

    /// Per-request timeout.
    /// Default: 15000 ms
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_ms: 15_000,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Client for the traffic backend.
pub struct BackendClient {
    client: Client,
    config: BackendConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl BackendClient {
    pub fn new(config: BackendConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AvgSpeedError::http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            tokens,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.tokens.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> AvgSpeedError {
        if e.is_timeout() {
            AvgSpeedError::Timeout {
                seconds: self.config.request_timeout().as_secs_f64(),
            }
        } else {
            AvgSpeedError::Http {
                message: e.to_string(),
                status_code: e.status().map(|s| s.as_u16()),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("[BackendClient] GET {}", url);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = check_status(response)?;
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch all cameras.
    pub async fn cameras(&self) -> Result<Vec<CameraDto>> {
        self.get_json(CAMERAS_PATH).await
    }

    /// Fetch all segments.
    pub async fn segments(&self) -> Result<Vec<SegmentDto>> {
        self.get_json(SEGMENTS_PATH).await
    }

    /// Submit one report. Any 2xx response counts as delivered.
    pub async fn submit_report(&self, report: &AvgSpeedReport) -> Result<()> {
        let url = self.url(REPORT_PATH);
        let response = self
            .authorize(self.client.post(&url))
            .json(report)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match check_status(response) {
            Ok(_) => {
                debug!("[BackendClient] Submitted '{}'", report.segment_name);
                Ok(())
            }
            Err(e) => {
                warn!("[BackendClient] Report '{}' rejected: {}", report.segment_name, e);
                Err(e)
            }
        }
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(AvgSpeedError::Http {
        message: format!("{} {}", status, response.url().path()),
        status_code: Some(status.as_u16()),
    })
}

impl CatalogSource for BackendClient {
    fn fetch_cameras(&self) -> BoxFuture<'_, Result<Vec<CameraDto>>> {
        Box::pin(self.cameras())
    }

    fn fetch_segments(&self) -> BoxFuture<'_, Result<Vec<SegmentDto>>> {
        Box::pin(self.segments())
    }
}

impl ReportUploader for BackendClient {
    fn upload<'a>(&'a self, report: &'a AvgSpeedReport) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.submit_report(report))
    }
}
