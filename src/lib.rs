//! vizquery: a chart query and caching pipeline.
//!
//! A declarative `QuerySpec` is planned into an executable `QueryObject`,
//! fingerprinted into a cache key, run through the get-or-compute-and-store
//! protocol against a pluggable datasource, and shaped into a chart-specific
//! payload.

pub mod cache;
pub mod config;
pub mod datasource;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod query;
pub mod sanitize;
pub mod shape;
pub mod spec;
pub mod time;

pub use cache::{CacheEntry, CacheStore, MemoryCacheStore};
pub use config::{VizConfig, DTTM_ALIAS};
pub use datasource::{AllowAll, Datasource, QueryResult, QueryStatus, SecurityContext};
pub use error::{ErrorEntry, VizError};
pub use pipeline::{ChartPayload, VizPipeline};
pub use query::QueryObject;
pub use spec::{ChartKind, FilterSpec, MetricSpec, QuerySpec, SpatialSpec};
