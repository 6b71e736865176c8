//! Chart planning and result shaping.
//!
//! `plan` resolves a `QuerySpec` into a `ChartPlan`: the executable query
//! object plus everything shaping will need later. The plan is threaded
//! explicitly through both phases, so there is no hidden state between
//! building the query and shaping its result. Dispatch from `ChartKind` to a
//! shaping strategy is a static match, not a runtime registry.

pub mod chord;
pub mod geo;
pub mod partition;
pub mod pivot;
pub mod table;
pub mod timeseries;

use chrono::{DateTime, Duration, Utc};
use polars::prelude::DataFrame;
use serde_json::Value;

use crate::config::VizConfig;
use crate::error::VizError;
use crate::query::{build_query, QueryObject};
use crate::spec::{ChartKind, FilterSpec, FixedOrMetric, QuerySpec};
use crate::time::{parse_past_timedelta, TimeGrain};

/// One additional query for a time-comparison offset. The result frame is
/// shifted forward by `delta_ms` before alignment with the primary series.
#[derive(Debug, Clone)]
pub struct ExtraQuery {
    /// The offset expression as requested, used as series suffix and cache
    /// disambiguator.
    pub label: String,
    pub delta_ms: i64,
    pub query: QueryObject,
}

/// A comparison result frame ready for shaping.
pub struct ExtraFrame {
    pub label: String,
    pub delta_ms: i64,
    pub df: DataFrame,
}

/// Resolved plan for one chart: the query to run plus shaping inputs.
#[derive(Debug, Clone)]
pub struct ChartPlan {
    pub kind: ChartKind,
    pub spec: QuerySpec,
    pub query: QueryObject,
    pub metric_labels: Vec<String>,
    pub extra_queries: Vec<ExtraQuery>,
}

fn is_timeseries_kind(kind: ChartKind) -> bool {
    matches!(
        kind,
        ChartKind::TimeTable
            | ChartKind::CalHeatmap
            | ChartKind::TimeSeries
            | ChartKind::TimePivot
            | ChartKind::Compare
            | ChartKind::Horizon
            | ChartKind::Rose
            | ChartKind::PairedComparison
            | ChartKind::EventFlow
    )
}

pub fn is_geo_kind(kind: ChartKind) -> bool {
    matches!(
        kind,
        ChartKind::GeoScatter
            | ChartKind::GeoScreengrid
            | ChartKind::GeoGrid
            | ChartKind::GeoHex
            | ChartKind::GeoHeatmap
            | ChartKind::GeoContour
            | ChartKind::GeoArc
            | ChartKind::GeoPath
            | ChartKind::GeoPolygon
            | ChartKind::GeoJson
    )
}

fn require<T: Clone>(field: &Option<T>, what: &str) -> Result<T, VizError> {
    field.clone().ok_or_else(|| VizError::validation(format!("{what} is required")))
}

fn require_metrics(labels: &[String]) -> Result<(), VizError> {
    if labels.is_empty() {
        return Err(VizError::validation("pick at least one metric"));
    }
    Ok(())
}

/// Chart-specific validation and query adjustment, applied after the base
/// query is built.
fn adjust_for_kind(plan: &mut ChartPlan) -> Result<(), VizError> {
    let spec = &plan.spec;
    let query = &mut plan.query;
    match plan.kind {
        ChartKind::Table => {
            if !spec.all_columns.is_empty() {
                // Raw records mode: no aggregation at all.
                query.columns = spec.all_columns.clone();
                query.groupby.clear();
                query.metrics.clear();
                plan.metric_labels.clear();
            } else {
                require_metrics(&plan.metric_labels)?;
                if let Some(m) = &spec.order_by_metric {
                    query.orderby = vec![(m.label(), !spec.order_desc)];
                } else if spec.sort_by_metric {
                    if let Some(first) = plan.metric_labels.first() {
                        query.orderby = vec![(first.clone(), !spec.order_desc)];
                    }
                }
            }
        }
        ChartKind::TimeTable => {
            require_metrics(&plan.metric_labels)?;
            if !query.groupby.is_empty() && plan.metric_labels.len() > 1 {
                return Err(VizError::validation(
                    "when using a group-by, a single metric is required",
                ));
            }
        }
        ChartKind::CalHeatmap => {
            require_metrics(&plan.metric_labels)?;
            for g in [&spec.domain_granularity, &spec.subdomain_granularity].into_iter().flatten() {
                TimeGrain::parse(g)
                    .ok_or_else(|| VizError::validation(format!("unknown granularity: {g}")))?;
            }
        }
        ChartKind::Bubble => {
            let entity = require(&spec.entity, "entity")?;
            let series = spec.series.clone().unwrap_or_else(|| entity.clone());
            let x = require(&spec.x, "x axis metric")?;
            let y = require(&spec.y, "y axis metric")?;
            let size = require(&spec.size, "bubble size metric")?;
            // The shaper reads axes positionally, so the query carries
            // exactly these three metrics in x, y, size order; any other
            // metric slots are discarded.
            query.metrics = vec![x, y, size];
            plan.metric_labels = query.metrics.iter().map(|m| m.label()).collect();
            let mut uniq = plan.metric_labels.clone();
            uniq.sort();
            uniq.dedup();
            if uniq.len() != 3 {
                return Err(VizError::validation(
                    "x, y and size metrics must be three distinct metrics",
                ));
            }
            query.groupby = crate::query::dedup_columns(&[&[entity], &[series]]);
        }
        ChartKind::Bullet => {
            require_metrics(&plan.metric_labels)?;
        }
        ChartKind::TimeSeries | ChartKind::Compare | ChartKind::Horizon | ChartKind::Rose => {
            require_metrics(&plan.metric_labels)?;
        }
        ChartKind::TimePivot => {
            require_metrics(&plan.metric_labels)?;
            require(&spec.freq, "period frequency")?;
            query.groupby.clear();
        }
        ChartKind::PairedComparison => {
            require_metrics(&plan.metric_labels)?;
            if query.groupby.is_empty() {
                return Err(VizError::validation("pick at least one group-by column"));
            }
        }
        ChartKind::Chord => {
            require_metrics(&plan.metric_labels)?;
            if query.groupby.len() != 2 {
                return Err(VizError::validation("chord requires exactly two grouping columns"));
            }
        }
        ChartKind::CountryMap => {
            require_metrics(&plan.metric_labels)?;
            let entity = require(&spec.entity, "country column")?;
            query.groupby = vec![entity];
        }
        ChartKind::WorldMap => {
            require_metrics(&plan.metric_labels)?;
            let entity = require(&spec.entity, "country code column")?;
            query.groupby = vec![entity];
        }
        ChartKind::ParallelCoordinates => {
            require_metrics(&plan.metric_labels)?;
            let series = require(&spec.series, "series column")?;
            query.groupby = vec![series];
        }
        ChartKind::EventFlow => {
            let entity = require(&spec.entity, "entity column")?;
            query.columns = crate::query::dedup_columns(&[&[entity], &spec.all_columns]);
            query.groupby.clear();
            query.metrics.clear();
            plan.metric_labels.clear();
        }
        ChartKind::Partition => {
            require_metrics(&plan.metric_labels)?;
            if query.groupby.is_empty() {
                return Err(VizError::validation("pick at least one group-by column"));
            }
            // Point-to-point options need the time axis even though the
            // output is not a time series.
            let opt = spec.time_series_option.as_deref().unwrap_or("not_time");
            query.is_timeseries = opt != "not_time";
        }
        kind if is_geo_kind(kind) => geo::adjust_query(plan.kind, spec, query)?,
        ChartKind::MultiLayer => {
            if spec.layers.is_empty() {
                return Err(VizError::validation("pick at least one chart layer"));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolve a spec into a plan, validating chart-type preconditions and all
/// column references against the datasource schema. A `None` schema means the
/// datasource cannot enumerate its columns and skips reference validation; an
/// empty schema rejects every reference.
pub fn plan(
    spec: &QuerySpec,
    schema: Option<&[String]>,
    config: &VizConfig,
    now: DateTime<Utc>,
) -> Result<ChartPlan, VizError> {
    let query = build_query(spec, config, is_timeseries_kind(spec.chart_kind), now)?;
    let mut plan = ChartPlan {
        kind: spec.chart_kind,
        spec: spec.clone(),
        query,
        metric_labels: spec.metric_labels(),
        extra_queries: Vec::new(),
    };
    adjust_for_kind(&mut plan)?;

    if let Some(schema) = schema {
        for col in plan.query.referenced_columns() {
            if !schema.iter().any(|c| *c == col) {
                return Err(VizError::validation(format!("column not found in datasource: {col}")));
            }
        }
    }

    if plan.query.is_timeseries && !plan.spec.time_compare.is_empty() {
        // Shifting an open bound is a no-op, which would silently run the
        // comparison query over the primary window.
        if plan.query.from_dttm.is_none() || plan.query.to_dttm.is_none() {
            return Err(VizError::validation(
                "an enclosed time range (both start and end) is required for a time comparison",
            ));
        }
        for option in &plan.spec.time_compare {
            let delta = parse_past_timedelta(option)?;
            if delta == Duration::zero() {
                return Err(VizError::validation(format!("unparseable time offset: {option}")));
            }
            let mut q = plan.query.clone();
            q.inner_from_dttm = plan.query.from_dttm;
            q.inner_to_dttm = plan.query.to_dttm;
            q.from_dttm = q.from_dttm.map(|d| d - delta);
            q.to_dttm = q.to_dttm.map(|d| d - delta);
            plan.extra_queries.push(ExtraQuery {
                label: option.clone(),
                delta_ms: delta.num_milliseconds(),
                query: q,
            });
        }
    }
    Ok(plan)
}

/// Shape a result frame into the chart payload. Empty input yields `Ok(None)`.
pub fn shape(plan: &ChartPlan, df: &DataFrame, extras: &[ExtraFrame]) -> Result<Option<Value>, VizError> {
    if df.height() == 0 {
        return Ok(None);
    }
    let data = match plan.kind {
        ChartKind::Table => table::table(plan, df)?,
        ChartKind::TimeTable => table::time_table(plan, df)?,
        ChartKind::CalHeatmap => table::cal_heatmap(plan, df)?,
        ChartKind::Bubble => table::bubble(plan, df)?,
        ChartKind::Bullet => table::bullet(plan, df)?,
        ChartKind::TimeSeries | ChartKind::Compare | ChartKind::Horizon => {
            timeseries::time_series(plan, df, extras)?
        }
        ChartKind::TimePivot => timeseries::time_pivot(plan, df)?,
        ChartKind::Rose => timeseries::rose(plan, df)?,
        ChartKind::PairedComparison => timeseries::paired_comparison(plan, df)?,
        ChartKind::Chord => chord::chord(plan, df)?,
        ChartKind::CountryMap => table::country_map(plan, df)?,
        ChartKind::WorldMap => table::world_map(plan, df)?,
        ChartKind::ParallelCoordinates => table::parallel_coordinates(df)?,
        ChartKind::EventFlow => table::event_flow(plan, df)?,
        ChartKind::Partition => partition::partition(plan, df)?,
        kind if is_geo_kind(kind) => geo::geo(plan, df)?,
        // Composite payloads are assembled by the pipeline from child charts.
        ChartKind::MultiLayer => Value::Null,
        _ => Value::Null,
    };
    Ok(Some(data))
}

/// Resolve a fixed-or-metric control into a per-row value source.
pub(crate) enum ValueSource {
    Fixed(f64),
    Column(String),
}

pub(crate) fn value_source(field: &Option<FixedOrMetric>, default: f64) -> ValueSource {
    match field {
        None => ValueSource::Fixed(default),
        Some(FixedOrMetric::Fix { value }) => ValueSource::Fixed(*value),
        Some(FixedOrMetric::Metric { value }) => ValueSource::Column(value.label()),
    }
}

/// Default null filters for columns a variant cannot tolerate nulls in.
pub(crate) fn push_not_null_filters(query: &mut QueryObject, cols: &[&str]) {
    for col in cols {
        let f = FilterSpec::is_not_null(*col);
        if !query.filters.contains(&f) {
            query.filters.push(f);
        }
    }
}
