//! Collaborator interfaces: the datasource boundary and the security context.
//!
//! The pipeline never talks to storage or a SQL engine directly; everything
//! goes through `Datasource::query`, which must be idempotent for identical
//! query objects modulo time-of-query metadata. Both collaborators are
//! injected at pipeline construction — there are no process-wide singletons.

use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorEntry, VizError};
use crate::query::QueryObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Failed,
}

/// Result of one datasource execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub df: DataFrame,
    pub query: String,
    pub status: QueryStatus,
    pub errors: Vec<ErrorEntry>,
    pub applied_filter_columns: Vec<String>,
    pub rejected_filter_columns: Vec<String>,
}

impl QueryResult {
    pub fn new(df: DataFrame, query: impl Into<String>) -> Self {
        QueryResult {
            df,
            query: query.into(),
            status: QueryStatus::Success,
            errors: Vec::new(),
            applied_filter_columns: Vec::new(),
            rejected_filter_columns: Vec::new(),
        }
    }
}

/// The only I/O boundary for data retrieval.
pub trait Datasource: Send + Sync {
    /// Stable identity of the dataset, part of every cache key.
    fn uid(&self) -> String;
    /// Last metadata change; bumping it invalidates all derived cache keys.
    fn changed_on(&self) -> DateTime<Utc>;
    /// Known column names, used to fail invalid references before dispatch.
    /// `None` means the set cannot be enumerated and skips that validation;
    /// an empty list rejects every reference.
    fn column_names(&self) -> Option<Vec<String>>;
    /// Dataset-level cache TTL override in seconds.
    fn cache_timeout(&self) -> Option<i64> {
        None
    }
    /// Additional values a datasource wants folded into cache keys.
    fn extra_cache_keys(&self, _query: &QueryObject) -> Vec<Value> {
        Vec::new()
    }
    fn query(&self, query: &QueryObject) -> Result<QueryResult, VizError>;
}

/// Access control and row-level-security identity for the requesting user.
pub trait SecurityContext: Send + Sync {
    /// Deny access to a datasource before any cached or computed value tied
    /// to it is read.
    fn check_access(&self, datasource: &dyn Datasource) -> Result<(), VizError>;
    /// Token summarizing per-user row filtering; keyed into the cache so one
    /// user's rows never surface for another.
    fn rls_fingerprint(&self, datasource: &dyn Datasource) -> String;
}

/// Permissive context for embedding and tests.
pub struct AllowAll;

impl SecurityContext for AllowAll {
    fn check_access(&self, _datasource: &dyn Datasource) -> Result<(), VizError> {
        Ok(())
    }

    fn rls_fingerprint(&self, _datasource: &dyn Datasource) -> String {
        String::new()
    }
}
