//! Cache orchestrator: get-or-compute-and-store around query execution.
//!
//! Per request: check the cache (unless forced), fall back to the datasource,
//! write through on success, and shape the frame into the chart payload. All
//! collaborators are injected at construction. Execution failures degrade to
//! a FAILED-status payload; only validation errors, denied access and a
//! `force_cached` miss abort a request outright.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::cache::{cache_key, CacheEntry, CacheStore, KeyContext};
use crate::config::VizConfig;
use crate::datasource::{Datasource, QueryStatus, SecurityContext};
use crate::error::{ErrorEntry, VizError};
use crate::frame::{coerce_metrics_to_num, colnames, coltypes, normalize_infinities};
use crate::query::QueryObject;
use crate::shape::{self, ChartPlan, ExtraFrame};
use crate::spec::{ChartKind, QuerySpec};

/// Cache traffic counters. Observability only; no correctness depends on them.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub loading_from_cache: AtomicU64,
    pub loaded_from_cache: AtomicU64,
    pub loaded_from_source: AtomicU64,
    pub loaded_from_source_without_force: AtomicU64,
}

impl PipelineStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One query result with its cache metadata, before shaping.
pub struct FramePayload {
    pub df: DataFrame,
    pub cache_key: Option<String>,
    pub is_cached: bool,
    pub cached_dttm: Option<DateTime<Utc>>,
    pub query: String,
    pub status: QueryStatus,
    pub errors: Vec<ErrorEntry>,
    pub applied_filter_columns: Vec<String>,
    pub rejected_filter_columns: Vec<String>,
}

/// The full outward payload envelope.
#[derive(Debug, Serialize)]
pub struct ChartPayload {
    pub cache_key: Option<String>,
    pub is_cached: bool,
    pub cached_dttm: Option<DateTime<Utc>>,
    pub cache_timeout: i64,
    pub from_dttm: Option<DateTime<Utc>>,
    pub to_dttm: Option<DateTime<Utc>>,
    pub query: String,
    pub status: QueryStatus,
    pub errors: Vec<ErrorEntry>,
    pub rowcount: usize,
    pub colnames: Vec<String>,
    pub coltypes: Vec<String>,
    pub data: Option<Value>,
}

/// Concatenate the feature lists of two same-kind layer payloads instead of
/// letting the later layer replace the earlier one.
fn merge_layer_data(existing: &mut Value, incoming: Value) {
    let merged = match (existing.get_mut("features"), incoming.get("features")) {
        (Some(Value::Array(dst)), Some(Value::Array(src))) => {
            dst.extend(src.iter().cloned());
            true
        }
        _ => false,
    };
    if !merged {
        if let (Value::Array(dst), Value::Array(src)) = (existing, &incoming) {
            dst.extend(src.iter().cloned());
        }
    }
}

pub struct VizPipeline {
    datasource: Arc<dyn Datasource>,
    cache: Arc<dyn CacheStore>,
    security: Arc<dyn SecurityContext>,
    config: VizConfig,
    pub stats: PipelineStats,
    fixed_now: Option<DateTime<Utc>>,
}

impl VizPipeline {
    pub fn new(
        datasource: Arc<dyn Datasource>,
        cache: Arc<dyn CacheStore>,
        security: Arc<dyn SecurityContext>,
        config: VizConfig,
    ) -> Self {
        VizPipeline {
            datasource,
            cache,
            security,
            config,
            stats: PipelineStats::default(),
            fixed_now: None,
        }
    }

    /// Pin the clock used to resolve relative time expressions.
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    /// Chart override > datasource override > global default.
    fn resolve_cache_timeout(&self, spec: &QuerySpec) -> i64 {
        spec.cache_timeout
            .or_else(|| self.datasource.cache_timeout())
            .unwrap_or(self.config.cache_default_timeout)
    }

    fn key_context(&self, spec: &QuerySpec, query: &QueryObject) -> KeyContext {
        KeyContext {
            datasource_uid: self.datasource.uid(),
            changed_on: Some(self.datasource.changed_on()),
            rls_fingerprint: self.security.rls_fingerprint(self.datasource.as_ref()),
            time_range: spec.time_range.clone(),
            since: spec.since.clone(),
            until: spec.until.clone(),
            time_shift: spec.time_shift.clone(),
            extra_cache_keys: self.datasource.extra_cache_keys(query),
        }
    }

    fn plan(&self, spec: &QuerySpec) -> Result<ChartPlan, VizError> {
        let schema = self.datasource.column_names();
        shape::plan(spec, schema.as_deref(), &self.config, self.now())
    }

    /// Resolved query object for introspection, without executing anything.
    pub fn query_obj(&self, spec: &QuerySpec) -> Result<QueryObject, VizError> {
        Ok(self.plan(spec)?.query)
    }

    /// Cache key for a spec, for external pre-warming tools.
    pub fn get_cache_key(&self, spec: &QuerySpec) -> Result<String, VizError> {
        let plan = self.plan(spec)?;
        let ctx = self.key_context(spec, &plan.query);
        Ok(cache_key(&plan.query, &ctx, &BTreeMap::new()))
    }

    /// Run one query through the cache protocol.
    fn get_df_payload(
        &self,
        plan: &ChartPlan,
        query: &QueryObject,
        key: Option<String>,
        force: bool,
        force_cached: bool,
        ttl: i64,
    ) -> Result<FramePayload, VizError> {
        let mut payload = FramePayload {
            df: DataFrame::empty(),
            cache_key: key.clone(),
            is_cached: false,
            cached_dttm: None,
            query: String::new(),
            status: QueryStatus::Success,
            errors: Vec::new(),
            applied_filter_columns: Vec::new(),
            rejected_filter_columns: Vec::new(),
        };

        let cacheable = key.is_some() && ttl != -1;
        if cacheable && !force {
            PipelineStats::incr(&self.stats.loading_from_cache);
            let key = key.as_deref().unwrap_or_default();
            match self.cache.get(key) {
                Ok(Some(entry)) => {
                    debug!(key, "cache hit");
                    PipelineStats::incr(&self.stats.loaded_from_cache);
                    payload.df = entry.df;
                    payload.query = entry.query;
                    payload.cached_dttm = Some(entry.cached_at);
                    payload.is_cached = true;
                }
                Ok(None) => debug!(key, "cache miss"),
                // A broken cache entry is a miss, never a request failure.
                Err(e) => warn!(key, error = %e, "cache read failed, treating as miss"),
            }
        }

        if !payload.is_cached {
            if force_cached {
                return Err(VizError::CacheLoad);
            }
            PipelineStats::incr(&self.stats.loaded_from_source);
            if !force {
                PipelineStats::incr(&self.stats.loaded_from_source_without_force);
            }
            match self.datasource.query(query) {
                Ok(mut result) => {
                    payload.query = result.query;
                    payload.status = result.status;
                    payload.errors.append(&mut result.errors);
                    payload.applied_filter_columns = result.applied_filter_columns;
                    payload.rejected_filter_columns = result.rejected_filter_columns;
                    if payload.status == QueryStatus::Success {
                        let mut df = result.df;
                        coerce_metrics_to_num(&mut df, &plan.metric_labels)?;
                        normalize_infinities(&mut df)?;
                        payload.df = df;
                    }
                }
                Err(e) => {
                    error!(error = %e, "datasource query failed");
                    payload.status = QueryStatus::Failed;
                    payload.errors.push(ErrorEntry::from_error(&e));
                }
            }
            // Never cache a failed result.
            if cacheable && payload.status == QueryStatus::Success {
                let entry = CacheEntry {
                    df: payload.df.clone(),
                    query: payload.query.clone(),
                    cached_at: self.now(),
                };
                let duration = if ttl > 0 { Some(Duration::from_secs(ttl as u64)) } else { None };
                if let Some(key) = key.as_deref() {
                    self.cache.set(key, entry, duration);
                }
            }
        }
        Ok(payload)
    }

    /// Composite charts: plan, query and shape each child layer, narrowing
    /// scoped filters to the layers they name. Layers of the same chart kind
    /// accumulate into one entry.
    fn get_multi_layer_payload(
        &self,
        spec: &QuerySpec,
        force: bool,
        force_cached: bool,
    ) -> Result<ChartPayload, VizError> {
        let mut features = serde_json::Map::new();
        let mut errors = Vec::new();
        let mut status = QueryStatus::Success;
        for (i, layer) in spec.layers.iter().enumerate() {
            let mut child = layer.clone();
            for f in &spec.filters {
                if f.applies_to_layer(i) {
                    let mut f = f.clone();
                    f.layer_scope = None;
                    child.filters.push(f);
                }
            }
            let payload = self.get_payload(&child, force, force_cached)?;
            if payload.status == QueryStatus::Failed {
                status = QueryStatus::Failed;
            }
            errors.extend(payload.errors);
            let data = payload.data.unwrap_or(Value::Null);
            let kind = child.chart_kind.as_str();
            match features.get_mut(kind) {
                Some(existing) => merge_layer_data(existing, data),
                None => {
                    features.insert(kind.to_string(), data);
                }
            }
        }
        Ok(ChartPayload {
            cache_key: None,
            is_cached: false,
            cached_dttm: None,
            cache_timeout: self.resolve_cache_timeout(spec),
            from_dttm: None,
            to_dttm: None,
            query: String::new(),
            status,
            errors,
            rowcount: 0,
            colnames: Vec::new(),
            coltypes: Vec::new(),
            data: Some(Value::Object(
                std::iter::once(("features".to_string(), Value::Object(features))).collect(),
            )),
        })
    }

    /// Full pipeline: plan, cache-or-execute (including time-comparison
    /// queries), shape, envelope.
    pub fn get_payload(
        &self,
        spec: &QuerySpec,
        force: bool,
        force_cached: bool,
    ) -> Result<ChartPayload, VizError> {
        self.security.check_access(self.datasource.as_ref())?;
        if spec.chart_kind == ChartKind::MultiLayer {
            // Validates layer presence before fanning out.
            self.plan(spec)?;
            return self.get_multi_layer_payload(spec, force, force_cached);
        }

        let plan = self.plan(spec)?;
        let ttl = self.resolve_cache_timeout(spec);
        let ctx = self.key_context(spec, &plan.query);
        let key = cache_key(&plan.query, &ctx, &BTreeMap::new());
        let mut payload =
            self.get_df_payload(&plan, &plan.query, Some(key), force, force_cached, ttl)?;

        // Comparison offsets run as separate queries, each cached under its
        // own disambiguated key.
        let mut extras: Vec<ExtraFrame> = Vec::new();
        if payload.status == QueryStatus::Success {
            for extra in &plan.extra_queries {
                let mut extra_map = BTreeMap::new();
                extra_map.insert("time_compare".to_string(), Value::from(extra.label.clone()));
                let extra_key = cache_key(&extra.query, &ctx, &extra_map);
                let extra_payload = self.get_df_payload(
                    &plan,
                    &extra.query,
                    Some(extra_key),
                    force,
                    force_cached,
                    ttl,
                )?;
                payload.errors.extend(extra_payload.errors);
                if extra_payload.status == QueryStatus::Failed {
                    payload.status = QueryStatus::Failed;
                    break;
                }
                extras.push(ExtraFrame {
                    label: extra.label.clone(),
                    delta_ms: extra.delta_ms,
                    df: extra_payload.df,
                });
            }
        }

        let data = if payload.status == QueryStatus::Success {
            shape::shape(&plan, &payload.df, &extras)?
        } else {
            None
        };

        Ok(ChartPayload {
            cache_key: payload.cache_key,
            is_cached: payload.is_cached,
            cached_dttm: payload.cached_dttm,
            cache_timeout: ttl,
            from_dttm: plan.query.from_dttm,
            to_dttm: plan.query.to_dttm,
            query: payload.query,
            status: payload.status,
            errors: payload.errors,
            rowcount: payload.df.height(),
            colnames: colnames(&payload.df),
            coltypes: coltypes(&payload.df),
            data,
        })
    }
}
