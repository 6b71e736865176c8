//! Error taxonomy for the chart query pipeline.
//!
//! Only two variants are allowed to abort a request outright: `Validation`
//! (the chart spec cannot be turned into a valid query object) and `CacheLoad`
//! (a cache miss under `force_cached`). Execution and cache-read failures
//! degrade: the pipeline completes with a FAILED-status payload carrying
//! structured error entries instead of propagating.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VizError {
    /// Spec cannot become a valid QueryObject: missing required field, invalid
    /// combination, unknown column. Never retried, never cached.
    #[error("validation error: {0}")]
    Validation(String),

    /// `force_cached` requested but no cache entry exists. Distinct from a
    /// query failure so callers can tell "not pre-warmed" apart from "broken".
    #[error("cached value not found")]
    CacheLoad,

    /// The datasource raised while executing the query.
    #[error("execution error: {0}")]
    Execution(String),

    /// A cache entry exists but could not be read or decoded. Treated as a
    /// miss by the orchestrator.
    #[error("cache read error: {0}")]
    CacheRead(String),

    /// Access to the datasource was denied for the current security context.
    #[error("access denied: {0}")]
    AccessDenied(String),
}

impl VizError {
    pub fn validation(msg: impl Into<String>) -> Self { VizError::Validation(msg.into()) }
    pub fn execution(msg: impl Into<String>) -> Self { VizError::Execution(msg.into()) }

    pub fn error_type(&self) -> &'static str {
        match self {
            VizError::Validation(_) => "validation_error",
            VizError::CacheLoad => "cache_load_error",
            VizError::Execution(_) => "execution_error",
            VizError::CacheRead(_) => "cache_read_error",
            VizError::AccessDenied(_) => "access_denied",
        }
    }

    /// Whether this error may abort the request instead of degrading to a
    /// FAILED payload.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VizError::Validation(_) | VizError::CacheLoad | VizError::AccessDenied(_))
    }
}

/// Structured error entry embedded in payload envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEntry {
    pub message: String,
    pub error_type: String,
    pub level: String,
}

impl ErrorEntry {
    pub fn from_error(err: &VizError) -> Self {
        ErrorEntry { message: err.to_string(), error_type: err.error_type().to_string(), level: "error".to_string() }
    }
}
