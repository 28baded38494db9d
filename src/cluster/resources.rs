//! Response envelopes shared by the API and the CLI

use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "arkfleet/v1";

/// Response for listing resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceList<T> {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind (e.g., "ClusterList", "JobList")
    pub kind: String,

    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    pub fn new(kind: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: kind.into(),
            items,
        }
    }
}

/// Status of an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Whether the operation succeeded
    pub success: bool,

    /// Human-readable outcome
    pub message: String,

    /// Operation-specific payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
