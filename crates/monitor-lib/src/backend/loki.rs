//! Loki HTTP API client

use super::prometheus::decode_response;
use super::{
    endpoint, BackendError, Direction, LogBackend, LogQueryData, Result, INSTANT_QUERY_TIMEOUT,
    RANGE_QUERY_TIMEOUT,
};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Client for `/loki/api/v1/query` and `/loki/api/v1/query_range`
#[derive(Debug, Clone)]
pub struct LokiClient {
    client: Client,
    base_url: Url,
}

impl LokiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn get(
        &self,
        path: &[&str],
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<LogQueryData> {
        let url = endpoint(&self.base_url, path)?;
        debug!(url = %url, "loki query");

        let response = self
            .client
            .get(url)
            .query(params)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, timeout))?;

        decode_response(response, timeout).await?.into_log_data()
    }
}

#[async_trait]
impl LogBackend for LokiClient {
    async fn query(&self, expr: &str, limit: u32) -> Result<LogQueryData> {
        self.get(
            &["loki", "api", "v1", "query"],
            &[("query", expr.to_string()), ("limit", limit.to_string())],
            INSTANT_QUERY_TIMEOUT,
        )
        .await
    }

    async fn query_range(
        &self,
        expr: &str,
        start_ns: i64,
        end_ns: i64,
        limit: u32,
        direction: Direction,
    ) -> Result<LogQueryData> {
        self.get(
            &["loki", "api", "v1", "query_range"],
            &[
                ("query", expr.to_string()),
                ("start", start_ns.to_string()),
                ("end", end_ns.to_string()),
                ("limit", limit.to_string()),
                ("direction", direction.as_str().to_string()),
            ],
            RANGE_QUERY_TIMEOUT,
        )
        .await
    }
}
