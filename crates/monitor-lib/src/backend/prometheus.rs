//! Prometheus HTTP API client

use super::{endpoint, BackendError, Envelope, InstantVector, MetricsBackend, RangeMatrix, Result};
use super::{INSTANT_QUERY_TIMEOUT, RANGE_QUERY_TIMEOUT};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Client for `/api/v1/query` and `/api/v1/query_range`
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    client: Client,
    base_url: Url,
}

impl PrometheusClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
        })
    }

    async fn get(
        &self,
        path: &[&str],
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<super::QueryData> {
        let url = endpoint(&self.base_url, path)?;
        debug!(url = %url, "prometheus query");

        let response = self
            .client
            .get(url)
            .query(params)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, timeout))?;

        decode_response(response, timeout).await
    }
}

/// Decode a `{status, data, error}` response. A JSON error body on a non-2xx
/// status surfaces the backend's message.
pub(crate) async fn decode_response(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<super::QueryData> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BackendError::from_reqwest(e, timeout))?;

    match serde_json::from_str::<Envelope>(&body) {
        Ok(envelope) if status.is_success() || envelope.status != "success" => envelope.into_data(),
        Err(e) if status.is_success() => Err(BackendError::Decode(e.to_string())),
        _ => Err(BackendError::Status {
            status: status.as_u16(),
            body,
        }),
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClient {
    async fn query(&self, expr: &str) -> Result<InstantVector> {
        self.get(
            &["api", "v1", "query"],
            &[("query", expr.to_string())],
            INSTANT_QUERY_TIMEOUT,
        )
        .await?
        .into_vector()
    }

    async fn query_range(
        &self,
        expr: &str,
        start: i64,
        end: i64,
        step: u64,
    ) -> Result<RangeMatrix> {
        self.get(
            &["api", "v1", "query_range"],
            &[
                ("query", expr.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("step", step.to_string()),
            ],
            RANGE_QUERY_TIMEOUT,
        )
        .await?
        .into_matrix()
    }
}
