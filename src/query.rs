//! Query Object Builder: resolves a declarative `QuerySpec` into an
//! executable, fully-bounded `QueryObject`.
//!
//! This is a pure function over the spec and server configuration; the only
//! external input is the caller-provided `now` used to resolve relative time
//! expressions. Chart-specific adjustments (metric requirements, geo columns)
//! are layered on top by the planners in `shape`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{VizConfig, DTTM_ALIAS};
use crate::error::VizError;
use crate::sanitize::sanitize_clause;
use crate::spec::{FilterSpec, MetricSpec, QuerySpec};
use crate::time::{parse_past_timedelta, since_until, TimeGrain};

pub const TEMPORAL_RANGE_OP: &str = "TEMPORAL_RANGE";

/// Datasource-specific raw clauses attached to a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryExtras {
    pub where_clause: String,
    pub having: String,
    pub time_grain: Option<String>,
}

/// Normalized, execution-ready query description. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct QueryObject {
    pub granularity: Option<String>,
    pub from_dttm: Option<DateTime<Utc>>,
    pub to_dttm: Option<DateTime<Utc>>,
    /// Original bounds of the primary window when this object describes a
    /// time-shifted comparison query.
    pub inner_from_dttm: Option<DateTime<Utc>>,
    pub inner_to_dttm: Option<DateTime<Utc>>,
    pub is_timeseries: bool,
    pub groupby: Vec<String>,
    pub columns: Vec<String>,
    pub metrics: Vec<MetricSpec>,
    pub filters: Vec<FilterSpec>,
    pub row_limit: usize,
    pub series_limit: usize,
    pub order_desc: bool,
    /// (metric label or column, ascending)
    pub orderby: Vec<(String, bool)>,
    pub extras: QueryExtras,
}

impl QueryObject {
    pub fn metric_labels(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.label()).collect()
    }

    /// Column names this query reads, for validation against the datasource
    /// schema. Named metrics resolve datasource-side and are not checked.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in self.columns.iter().chain(self.groupby.iter()) {
            if c != DTTM_ALIAS && !out.contains(c) {
                out.push(c.clone());
            }
        }
        for m in &self.metrics {
            for c in m.column_refs() {
                if !out.iter().any(|x| x == c) {
                    out.push(c.to_string());
                }
            }
        }
        out
    }
}

/// Dedup column lists while preserving first-occurrence order.
pub fn dedup_columns(lists: &[&[String]]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for list in lists {
        for col in *list {
            if !out.contains(col) {
                out.push(col.clone());
            }
        }
    }
    out
}

fn canonical_filters(filters: &[FilterSpec]) -> Vec<FilterSpec> {
    let mut out = filters.to_vec();
    out.sort_by(|a, b| {
        (a.col.as_str(), a.op.as_str(), a.val.to_string())
            .cmp(&(b.col.as_str(), b.op.as_str(), b.val.to_string()))
    });
    out
}

/// Drop the temporal range filter superseded by a resolved granularity: the
/// one naming the granularity column if present, else the first temporal
/// filter found.
fn supersede_temporal_filter(filters: &mut Vec<FilterSpec>, granularity: Option<&str>) {
    let idx = filters
        .iter()
        .position(|f| f.op == TEMPORAL_RANGE_OP && Some(f.col.as_str()) == granularity)
        .or_else(|| filters.iter().position(|f| f.op == TEMPORAL_RANGE_OP));
    if let Some(i) = idx {
        filters.remove(i);
    }
}

/// Build the base query object for a spec.
///
/// `is_timeseries` is the chart archetype's default; a `__timestamp` entry in
/// the group-by list promotes it regardless.
pub fn build_query(
    spec: &QuerySpec,
    config: &VizConfig,
    is_timeseries: bool,
    now: DateTime<Utc>,
) -> Result<QueryObject, VizError> {
    let metrics = spec.ordered_metrics();

    let mut groupby = dedup_columns(&[&spec.groupby, &spec.columns]);
    let mut is_timeseries = is_timeseries;
    if let Some(pos) = groupby.iter().position(|c| c == DTTM_ALIAS) {
        groupby.remove(pos);
        is_timeseries = true;
    }

    let time_grain = match spec.time_grain.as_deref() {
        Some(s) => Some(
            TimeGrain::parse(s).ok_or_else(|| VizError::validation(format!("unknown time grain: {s}")))?,
        ),
        None => None,
    };

    let mut filters = canonical_filters(&spec.filters);
    supersede_temporal_filter(&mut filters, spec.granularity.as_deref());

    let (since, until) = since_until(
        spec.time_range.as_deref(),
        spec.since.as_deref(),
        spec.until.as_deref(),
        now,
    )?;
    let time_shift = parse_past_timedelta(spec.time_shift.as_deref().unwrap_or(""))?;
    let from_dttm = since.map(|s| s - time_shift);
    let to_dttm = until.map(|u| u - time_shift);
    if let (Some(from), Some(to)) = (from_dttm, to_dttm) {
        if from > to {
            return Err(VizError::validation("from date cannot be larger than to date"));
        }
    }

    let row_limit = config.resolve_row_limit(spec.row_limit);

    let where_clause = match spec.where_clause.as_deref() {
        Some(c) if !c.trim().is_empty() => sanitize_clause(c)?,
        _ => String::new(),
    };
    let having = match spec.having.as_deref() {
        Some(c) if !c.trim().is_empty() => sanitize_clause(c)?,
        _ => String::new(),
    };

    Ok(QueryObject {
        granularity: spec.granularity.clone(),
        from_dttm,
        to_dttm,
        inner_from_dttm: None,
        inner_to_dttm: None,
        is_timeseries,
        groupby,
        columns: Vec::new(),
        metrics,
        filters,
        row_limit,
        series_limit: spec.limit.unwrap_or(0),
        order_desc: spec.order_desc,
        orderby: Vec::new(),
        extras: QueryExtras {
            where_clause,
            having,
            time_grain: time_grain.map(|g| g.iso_code().to_string()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use crate::spec::ChartKind;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn base_spec() -> QuerySpec {
        serde_json::from_value(json!({
            "chart_kind": "time_series",
            "metrics": ["count"],
            "groupby": ["country"],
            "granularity": "ts",
            "time_grain": "day",
            "time_range": "Last week",
            "filters": [{"col": "ts", "op": "TEMPORAL_RANGE", "val": null}]
        }))
        .unwrap()
    }

    #[test]
    fn last_week_scenario() {
        let spec = base_spec();
        assert_eq!(spec.chart_kind, ChartKind::TimeSeries);
        let q = build_query(&spec, &VizConfig::default(), true, now()).unwrap();
        assert_eq!(q.to_dttm.unwrap() - q.from_dttm.unwrap(), Duration::days(7));
        // The granularity-based window supersedes the explicit temporal filter.
        assert!(q.filters.iter().all(|f| f.op != TEMPORAL_RANGE_OP));
        assert_eq!(q.row_limit, VizConfig::default().row_limit_default);
        assert!(q.is_timeseries);
    }

    #[test]
    fn row_limit_ceiling() {
        let mut spec = base_spec();
        spec.row_limit = Some(10_000_000);
        let q = build_query(&spec, &VizConfig::default(), false, now()).unwrap();
        assert_eq!(q.row_limit, 50_000);
    }

    #[test]
    fn inverted_bounds_rejected() {
        let mut spec = base_spec();
        spec.time_range = Some("2024-02-01 : 2024-01-01".into());
        let err = build_query(&spec, &VizConfig::default(), false, now()).unwrap_err();
        assert!(matches!(err, VizError::Validation(_)));
    }

    #[test]
    fn groupby_merges_legacy_columns() {
        let mut spec = base_spec();
        spec.groupby = vec!["a".into(), "b".into()];
        spec.columns = vec!["b".into(), "c".into()];
        let q = build_query(&spec, &VizConfig::default(), false, now()).unwrap();
        assert_eq!(q.groupby, vec!["a", "b", "c"]);
    }

    #[test]
    fn dttm_alias_promotes_timeseries() {
        let mut spec = base_spec();
        spec.groupby = vec![DTTM_ALIAS.into(), "country".into()];
        let q = build_query(&spec, &VizConfig::default(), false, now()).unwrap();
        assert!(q.is_timeseries);
        assert_eq!(q.groupby, vec!["country"]);
    }

    #[test]
    fn time_shift_slides_both_bounds() {
        let mut spec = base_spec();
        spec.time_shift = Some("1 week ago".into());
        let q = build_query(&spec, &VizConfig::default(), true, now()).unwrap();
        assert_eq!(q.to_dttm.unwrap(), now() - Duration::weeks(1));
        assert_eq!(q.from_dttm.unwrap(), now() - Duration::weeks(2));
    }

    #[test]
    fn where_clause_sanitized() {
        let mut spec = base_spec();
        spec.where_clause = Some("country = 'US';".into());
        let q = build_query(&spec, &VizConfig::default(), false, now()).unwrap();
        assert_eq!(q.extras.where_clause, "country = 'US'");
        spec.where_clause = Some("1=1; drop table t".into());
        assert!(build_query(&spec, &VizConfig::default(), false, now()).is_err());
    }

    #[test]
    fn filters_are_canonically_ordered() {
        let mut spec = base_spec();
        spec.filters = vec![
            FilterSpec::new("z", "==", json!(1)),
            FilterSpec::new("a", "==", json!(2)),
            FilterSpec::new("a", "==", json!(1)),
        ];
        let q = build_query(&spec, &VizConfig::default(), false, now()).unwrap();
        let cols: Vec<&str> = q.filters.iter().map(|f| f.col.as_str()).collect();
        assert_eq!(cols, vec!["a", "a", "z"]);
    }

    #[test]
    fn referenced_columns_include_metric_exprs() {
        let mut spec = base_spec();
        spec.metrics = vec![
            serde_json::from_value(json!({"aggregate": "sum", "column": "revenue"})).unwrap(),
            MetricSpec::Name("count".into()),
        ];
        let q = build_query(&spec, &VizConfig::default(), false, now()).unwrap();
        assert_eq!(q.referenced_columns(), vec!["country", "revenue"]);
    }
}
