use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use polars::prelude::*;
use serde_json::json;

use vizquery::cache::CacheEntry;
use vizquery::datasource::QueryResult;
use vizquery::error::VizError;
use vizquery::pipeline::VizPipeline;
use vizquery::query::QueryObject;
use vizquery::spec::QuerySpec;
use vizquery::{
    AllowAll, CacheStore, Datasource, MemoryCacheStore, QueryStatus, VizConfig, DTTM_ALIAS,
};

const DAY: i64 = 86_400_000;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Ok,
    Fail,
    Empty,
}

struct MockSource {
    mode: Mode,
    calls: AtomicUsize,
    seen: Mutex<Vec<QueryObject>>,
    changed_on: DateTime<Utc>,
    cache_timeout: Option<i64>,
}

impl MockSource {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(MockSource {
            mode,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            changed_on: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            cache_timeout: None,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new(DTTM_ALIAS.into(), vec![0i64, 0, DAY, DAY]).into(),
            Series::new("country".into(), vec!["US", "DE", "US", "DE"]).into(),
            Series::new("count".into(), vec![10.0, 20.0, 30.0, 40.0]).into(),
            Series::new("lat".into(), vec![40.7, 52.5, 41.9, 48.1]).into(),
            Series::new("lon".into(), vec![-74.0, 13.4, -87.6, 11.6]).into(),
        ])
        .unwrap()
    }
}

impl Datasource for MockSource {
    fn uid(&self) -> String {
        "mock_1".into()
    }

    fn changed_on(&self) -> DateTime<Utc> {
        self.changed_on
    }

    fn column_names(&self) -> Option<Vec<String>> {
        Some(vec!["ts".into(), "country".into(), "count".into(), "lat".into(), "lon".into()])
    }

    fn cache_timeout(&self) -> Option<i64> {
        self.cache_timeout
    }

    fn query(&self, query: &QueryObject) -> Result<QueryResult, VizError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(query.clone());
        match self.mode {
            Mode::Fail => Err(VizError::execution("db down")),
            Mode::Empty => Ok(QueryResult::new(DataFrame::empty(), "SELECT ...")),
            Mode::Ok => Ok(QueryResult::new(Self::frame(), "SELECT ...")),
        }
    }
}

/// A store whose reads always fail; writes are dropped.
struct BrokenCache;

impl CacheStore for BrokenCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, VizError> {
        Err(VizError::CacheRead(format!("unreadable entry for {key}")))
    }

    fn set(&self, _key: &str, _entry: CacheEntry, _ttl: Option<std::time::Duration>) {}
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
}

fn pipeline(source: Arc<MockSource>, store: MemoryCacheStore) -> VizPipeline {
    init_tracing();
    VizPipeline::new(source, Arc::new(store), Arc::new(AllowAll), VizConfig::default())
        .with_clock(fixed_now())
}

fn table_spec() -> QuerySpec {
    serde_json::from_value(json!({
        "chart_kind": "table",
        "metrics": ["count"],
        "groupby": ["country"]
    }))
    .unwrap()
}

fn timeseries_spec() -> QuerySpec {
    serde_json::from_value(json!({
        "chart_kind": "time_series",
        "metrics": ["count"],
        "groupby": ["country"],
        "granularity": "ts",
        "time_grain": "day",
        "time_range": "last 7 days"
    }))
    .unwrap()
}

#[test]
fn second_call_is_served_from_cache() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source.clone(), MemoryCacheStore::new());
    let first = p.get_payload(&table_spec(), false, false).unwrap();
    assert!(!first.is_cached);
    assert_eq!(first.status, QueryStatus::Success);
    assert_eq!(first.rowcount, 4);

    let second = p.get_payload(&table_spec(), false, false).unwrap();
    assert!(second.is_cached);
    assert!(second.cached_dttm.is_some());
    assert_eq!(second.data, first.data);
    assert_eq!(source.calls(), 1);
}

#[test]
fn force_bypasses_the_cache() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source.clone(), MemoryCacheStore::new());
    p.get_payload(&table_spec(), false, false).unwrap();
    let forced = p.get_payload(&table_spec(), true, false).unwrap();
    assert!(!forced.is_cached);
    assert_eq!(source.calls(), 2);
}

#[test]
fn force_cached_miss_fails_without_touching_the_source() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source.clone(), MemoryCacheStore::new());
    let err = p.get_payload(&table_spec(), false, true).unwrap_err();
    assert!(matches!(err, VizError::CacheLoad));
    assert_eq!(source.calls(), 0);
}

#[test]
fn failed_execution_is_never_cached() {
    let source = MockSource::new(Mode::Fail);
    let store = MemoryCacheStore::new();
    let p = pipeline(source.clone(), store.clone());
    let payload = p.get_payload(&table_spec(), false, false).unwrap();
    assert_eq!(payload.status, QueryStatus::Failed);
    assert_eq!(payload.errors.len(), 1);
    assert_eq!(payload.errors[0].error_type, "execution_error");
    assert!(payload.data.is_none());
    assert!(store.is_empty());

    p.get_payload(&table_spec(), false, false).unwrap();
    assert_eq!(source.calls(), 2);
}

#[test]
fn cache_read_errors_degrade_to_misses() {
    let source = MockSource::new(Mode::Ok);
    let p = VizPipeline::new(
        source.clone(),
        Arc::new(BrokenCache),
        Arc::new(AllowAll),
        VizConfig::default(),
    )
    .with_clock(fixed_now());
    let first = p.get_payload(&table_spec(), false, false).unwrap();
    assert_eq!(first.status, QueryStatus::Success);
    assert!(!first.is_cached);
    let second = p.get_payload(&table_spec(), false, false).unwrap();
    assert!(!second.is_cached);
    assert_eq!(source.calls(), 2);
}

#[test]
fn cache_key_survives_wall_clock_drift() {
    let source = MockSource::new(Mode::Ok);
    let p1 = pipeline(source.clone(), MemoryCacheStore::new());
    let p2 = VizPipeline::new(
        source,
        Arc::new(MemoryCacheStore::new()),
        Arc::new(AllowAll),
        VizConfig::default(),
    )
    .with_clock(fixed_now() + Duration::days(1));

    let spec = timeseries_spec();
    let q1 = p1.query_obj(&spec).unwrap();
    let q2 = p2.query_obj(&spec).unwrap();
    assert_ne!(q1.from_dttm, q2.from_dttm);
    assert_eq!(p1.get_cache_key(&spec).unwrap(), p2.get_cache_key(&spec).unwrap());
}

#[test]
fn cache_key_tracks_dataset_changes() {
    let a = MockSource::new(Mode::Ok);
    let b = Arc::new(MockSource {
        mode: Mode::Ok,
        calls: AtomicUsize::new(0),
        seen: Mutex::new(Vec::new()),
        changed_on: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        cache_timeout: None,
    });
    let p1 = pipeline(a, MemoryCacheStore::new());
    let p2 = pipeline(b, MemoryCacheStore::new());
    let spec = timeseries_spec();
    assert_ne!(p1.get_cache_key(&spec).unwrap(), p2.get_cache_key(&spec).unwrap());
}

#[test]
fn negative_timeout_disables_caching() {
    let source = MockSource::new(Mode::Ok);
    let store = MemoryCacheStore::new();
    let p = pipeline(source.clone(), store.clone());
    let mut spec = table_spec();
    spec.cache_timeout = Some(-1);
    p.get_payload(&spec, false, false).unwrap();
    let second = p.get_payload(&spec, false, false).unwrap();
    assert!(!second.is_cached);
    assert!(store.is_empty());
    assert_eq!(source.calls(), 2);
}

#[test]
fn empty_result_shapes_to_none() {
    let source = MockSource::new(Mode::Empty);
    let p = pipeline(source, MemoryCacheStore::new());
    let payload = p.get_payload(&timeseries_spec(), false, false).unwrap();
    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(payload.rowcount, 0);
    assert!(payload.data.is_none());
}

#[test]
fn unknown_column_fails_before_dispatch() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source.clone(), MemoryCacheStore::new());
    let mut spec = table_spec();
    spec.groupby = vec!["nope".into()];
    let err = p.get_payload(&spec, false, false).unwrap_err();
    assert!(matches!(err, VizError::Validation(_)));
    assert_eq!(source.calls(), 0);
}

#[test]
fn time_comparison_runs_shifted_queries() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source.clone(), MemoryCacheStore::new());
    let mut spec = timeseries_spec();
    spec.time_compare = vec!["1 week ago".into()];
    let payload = p.get_payload(&spec, false, false).unwrap();
    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(source.calls(), 2);

    let seen = source.seen.lock();
    let delta = seen[0].from_dttm.unwrap() - seen[1].from_dttm.unwrap();
    assert_eq!(delta, Duration::weeks(1));
    assert_eq!(seen[1].inner_from_dttm, seen[0].from_dttm);
    // Primary series plus the shifted overlay.
    let arr = payload.data.unwrap();
    assert!(arr.as_array().unwrap().len() >= 4);
}

#[test]
fn multi_layer_scopes_filters_per_layer() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source.clone(), MemoryCacheStore::new());
    let spec: QuerySpec = serde_json::from_value(json!({
        "chart_kind": "multi_layer",
        "filters": [
            {"col": "country", "op": "==", "val": "US", "layer_scope": [1]},
            {"col": "count", "op": ">", "val": 0}
        ],
        "layers": [
            {"chart_kind": "table", "metrics": ["count"], "groupby": ["country"]},
            {"chart_kind": "time_series", "metrics": ["count"], "granularity": "ts",
             "time_range": "last 7 days"}
        ]
    }))
    .unwrap();
    let payload = p.get_payload(&spec, false, false).unwrap();
    assert_eq!(payload.status, QueryStatus::Success);
    let data = payload.data.unwrap();
    let features = &data["features"];
    assert!(features.get("table").is_some());
    assert!(features.get("time_series").is_some());

    let seen = source.seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(!seen[0].filters.iter().any(|f| f.col == "country"));
    assert!(seen[0].filters.iter().any(|f| f.col == "count"));
    assert!(seen[1].filters.iter().any(|f| f.col == "country"));
}

#[test]
fn multi_layer_merges_same_kind_layers() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source.clone(), MemoryCacheStore::new());
    let layer = json!({
        "chart_kind": "geo_scatter",
        "spatial": {"type": "lat_long", "lat_col": "lat", "lon_col": "lon"}
    });
    let spec: QuerySpec = serde_json::from_value(json!({
        "chart_kind": "multi_layer",
        "layers": [layer.clone(), layer]
    }))
    .unwrap();
    let payload = p.get_payload(&spec, false, false).unwrap();
    assert_eq!(payload.status, QueryStatus::Success);
    let data = payload.data.unwrap();
    // Both layers survive: their feature lists are concatenated under one key.
    let points = data["features"]["geo_scatter"]["features"].as_array().unwrap();
    assert_eq!(points.len(), 8);
}

#[test]
fn datasource_timeout_applies_when_chart_has_none() {
    let source = Arc::new(MockSource {
        mode: Mode::Ok,
        calls: AtomicUsize::new(0),
        seen: Mutex::new(Vec::new()),
        changed_on: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        cache_timeout: Some(60),
    });
    let p = pipeline(source, MemoryCacheStore::new());
    let payload = p.get_payload(&table_spec(), false, false).unwrap();
    assert_eq!(payload.cache_timeout, 60);
}

#[test]
fn stats_counters_track_cache_traffic() {
    let source = MockSource::new(Mode::Ok);
    let p = pipeline(source, MemoryCacheStore::new());
    p.get_payload(&table_spec(), false, false).unwrap();
    p.get_payload(&table_spec(), false, false).unwrap();
    assert_eq!(p.stats.loading_from_cache.load(Ordering::Relaxed), 2);
    assert_eq!(p.stats.loaded_from_cache.load(Ordering::Relaxed), 1);
    assert_eq!(p.stats.loaded_from_source.load(Ordering::Relaxed), 1);
    assert_eq!(p.stats.loaded_from_source_without_force.load(Ordering::Relaxed), 1);
}
