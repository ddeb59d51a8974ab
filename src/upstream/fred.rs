//! FRED-style observations API adapter
//!
//! `GET {base_url}/series/observations?series_id=..&observation_start=..`
//! returning `{"observations": [{"date": "YYYY-MM-DD", "value": "1.23"}, ...]}`
//! where `"."` marks a missing value.

use crate::config::UpstreamConfig;
use crate::error::{Result, SyncError};
use crate::types::{format_date, RawObservation};
use crate::upstream::{ObservationRequest, SeriesSource};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// FRED observations client
pub struct FredClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ObservationsResponse {
    observations: Vec<FredObservation>,
}

#[derive(Deserialize)]
struct FredObservation {
    date: Option<String>,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct FredErrorBody {
    error_message: Option<String>,
}

impl FredClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn observations_url(&self) -> String {
        format!("{}/series/observations", self.base_url)
    }

    fn query_params(&self, request: &ObservationRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("series_id", request.series_id.clone()),
            ("file_type", "json".to_string()),
            ("sort_order", "asc".to_string()),
            ("observation_start", format_date(request.observation_start)),
            ("limit", request.limit.to_string()),
            ("offset", request.offset.to_string()),
        ];
        if let Some(end) = request.observation_end {
            params.push(("observation_end", format_date(end)));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }
}

/// `Retry-After` in delta-seconds form
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn value_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl SeriesSource for FredClient {
    fn id(&self) -> &'static str {
        "fred"
    }

    async fn fetch_page(&self, request: &ObservationRequest) -> Result<Vec<RawObservation>> {
        debug!(
            "FRED request: {} from {} (offset {}, limit {})",
            request.series_id, request.observation_start, request.offset, request.limit
        );

        let response = self
            .client
            .get(self.observations_url())
            .query(&self.query_params(request))
            .send()
            .await
            .map_err(|e| {
                // A request that could not be built fails the same way every time
                if e.is_builder() {
                    SyncError::Transport {
                        status: None,
                        message: format!("invalid request: {}", e),
                        retryable: false,
                    }
                } else {
                    SyncError::transport(None, format!("request failed: {}", e))
                }
            })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            return Err(SyncError::Quota {
                retry_after,
                message: format!("upstream rate limit hit for {}", request.series_id),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::transport(None, format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<FredErrorBody>(&body)
                .ok()
                .and_then(|b| b.error_message)
                .unwrap_or_else(|| body.chars().take(200).collect());
            return Err(SyncError::transport(Some(status.as_u16()), message));
        }

        let parsed: ObservationsResponse = serde_json::from_str(&body)
            .map_err(|e| SyncError::malformed(format!("malformed response: {}", e)))?;

        Ok(parsed
            .observations
            .into_iter()
            .map(|o| RawObservation {
                date: o.date,
                value: value_to_string(o.value),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_date;
    use mockito::Matcher;

    fn client(base_url: &str) -> FredClient {
        FredClient::new(&UpstreamConfig {
            base_url: base_url.to_string(),
            api_key: Some("test-key".into()),
            request_timeout_secs: 5,
            page_size: 1000,
        })
        .unwrap()
    }

    fn request() -> ObservationRequest {
        ObservationRequest {
            series_id: "DGS10".into(),
            observation_start: parse_date("2024-01-01").unwrap(),
            observation_end: None,
            limit: 1000,
            offset: 0,
        }
    }

    #[tokio::test]
    async fn test_fetch_page_parses_observations() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/series/observations")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("series_id".into(), "DGS10".into()),
                Matcher::UrlEncoded("observation_start".into(), "2024-01-01".into()),
                Matcher::UrlEncoded("api_key".into(), "test-key".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"observations": [
                    {"realtime_start": "2024-01-05", "date": "2024-01-01", "value": "."},
                    {"realtime_start": "2024-01-05", "date": "2024-01-02", "value": "3.95"},
                    {"date": "2024-01-03", "value": 4.01}
                ]}"#,
            )
            .create_async()
            .await;

        let rows = client(&server.url()).fetch_page(&request()).await.unwrap();
        mock.assert_async().await;

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value.as_deref(), Some("."));
        assert_eq!(rows[1], RawObservation::new("2024-01-02", "3.95"));
        assert_eq!(rows[2].value.as_deref(), Some("4.01"));
    }

    #[tokio::test]
    async fn test_429_maps_to_quota_with_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/series/observations")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let err = client(&server.url())
            .fetch_page(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Quota { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/series/observations")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error_code": 400, "error_message": "Bad Request. The series does not exist."}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .fetch_page(&request())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("series does not exist"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/series/observations")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let err = client(&server.url())
            .fetch_page(&request())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_body_is_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/series/observations")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let err = client(&server.url())
            .fetch_page(&request())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unbuildable_request_is_not_retryable() {
        let err = client("not a base url")
            .fetch_page(&request())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("invalid request"));
    }
}
