//! Request and response types for the HTTP surface

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Envelope for every JSON response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// "success", "partial" or "error"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            code: None,
            data: Some(data),
        }
    }

    pub fn partial(data: T, message: impl Into<String>) -> Self {
        Self {
            status: "partial".to_string(),
            message: Some(message.into()),
            code: None,
            data: Some(data),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
            code: Some(code.into()),
            data: None,
        }
    }
}

/// Optional date bounds, `YYYY-MM-DD`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthData {
    pub service: String,
    pub version: String,
    pub running: bool,
}
