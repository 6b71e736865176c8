//! User-facing chart configuration (the `QuerySpec`).
//!
//! A spec arrives as JSON from the boundary layer and is the single input to
//! chart planning. Everything here is declarative; resolution into an
//! executable `QueryObject` happens in `query`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chart archetypes. The mapping from kind to shaping strategy is a static
/// match in `shape`; there is no runtime type discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Table,
    TimeTable,
    CalHeatmap,
    Bubble,
    Bullet,
    TimeSeries,
    TimePivot,
    Compare,
    Horizon,
    Rose,
    PairedComparison,
    Chord,
    CountryMap,
    WorldMap,
    ParallelCoordinates,
    EventFlow,
    Partition,
    GeoScatter,
    GeoScreengrid,
    GeoGrid,
    GeoHex,
    GeoHeatmap,
    GeoContour,
    GeoArc,
    GeoPath,
    GeoPolygon,
    GeoJson,
    MultiLayer,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Table => "table",
            ChartKind::TimeTable => "time_table",
            ChartKind::CalHeatmap => "cal_heatmap",
            ChartKind::Bubble => "bubble",
            ChartKind::Bullet => "bullet",
            ChartKind::TimeSeries => "time_series",
            ChartKind::TimePivot => "time_pivot",
            ChartKind::Compare => "compare",
            ChartKind::Horizon => "horizon",
            ChartKind::Rose => "rose",
            ChartKind::PairedComparison => "paired_comparison",
            ChartKind::Chord => "chord",
            ChartKind::CountryMap => "country_map",
            ChartKind::WorldMap => "world_map",
            ChartKind::ParallelCoordinates => "parallel_coordinates",
            ChartKind::EventFlow => "event_flow",
            ChartKind::Partition => "partition",
            ChartKind::GeoScatter => "geo_scatter",
            ChartKind::GeoScreengrid => "geo_screengrid",
            ChartKind::GeoGrid => "geo_grid",
            ChartKind::GeoHex => "geo_hex",
            ChartKind::GeoHeatmap => "geo_heatmap",
            ChartKind::GeoContour => "geo_contour",
            ChartKind::GeoArc => "geo_arc",
            ChartKind::GeoPath => "geo_path",
            ChartKind::GeoPolygon => "geo_polygon",
            ChartKind::GeoJson => "geo_json",
            ChartKind::MultiLayer => "multi_layer",
        }
    }
}

/// A metric reference: either a named metric known to the datasource, or an
/// inline aggregate over a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricSpec {
    Name(String),
    Aggregate {
        aggregate: String,
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl MetricSpec {
    /// A stable label for the metric: the explicit alias if present, else the
    /// raw name, else `AGG(column)` derived from the expression.
    pub fn label(&self) -> String {
        match self {
            MetricSpec::Name(n) => n.clone(),
            MetricSpec::Aggregate { label: Some(l), .. } => l.clone(),
            MetricSpec::Aggregate { aggregate, column, .. } => {
                format!("{}({})", aggregate.to_ascii_uppercase(), column)
            }
        }
    }

    /// Columns this metric reads from the datasource. Named metrics are
    /// resolved by the datasource itself and carry no column reference.
    pub fn column_refs(&self) -> Vec<&str> {
        match self {
            MetricSpec::Name(_) => Vec::new(),
            MetricSpec::Aggregate { column, .. } => vec![column.as_str()],
        }
    }
}

/// One adhoc filter clause. `layer_scope` restricts the filter to a subset of
/// composite-chart layers; a filter without a scope applies everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub col: String,
    pub op: String,
    #[serde(default)]
    pub val: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_scope: Option<Vec<usize>>,
}

impl FilterSpec {
    pub fn new(col: impl Into<String>, op: impl Into<String>, val: Value) -> Self {
        FilterSpec { col: col.into(), op: op.into(), val, layer_scope: None }
    }

    pub fn is_not_null(col: impl Into<String>) -> Self {
        FilterSpec::new(col, "IS NOT NULL", Value::Null)
    }

    pub fn applies_to_layer(&self, layer_index: usize) -> bool {
        match &self.layer_scope {
            None => true,
            Some(scope) if scope.is_empty() => true,
            Some(scope) => scope.contains(&layer_index),
        }
    }
}

/// Spatial encoding of a point column set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpatialSpec {
    /// Separate latitude / longitude columns.
    LatLong {
        lat_col: String,
        lon_col: String,
        #[serde(default)]
        reverse: bool,
    },
    /// One column holding "lon,lat" delimited strings.
    Delimited {
        lon_lat_col: String,
        #[serde(default)]
        reverse: bool,
    },
    /// One column holding geohash strings.
    Geohash {
        geohash_col: String,
        #[serde(default)]
        reverse: bool,
    },
}

impl SpatialSpec {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            SpatialSpec::LatLong { lat_col, lon_col, .. } => vec![lon_col.as_str(), lat_col.as_str()],
            SpatialSpec::Delimited { lon_lat_col, .. } => vec![lon_lat_col.as_str()],
            SpatialSpec::Geohash { geohash_col, .. } => vec![geohash_col.as_str()],
        }
    }

    pub fn reverse(&self) -> bool {
        match self {
            SpatialSpec::LatLong { reverse, .. }
            | SpatialSpec::Delimited { reverse, .. }
            | SpatialSpec::Geohash { reverse, .. } => *reverse,
        }
    }
}

/// A value that is either fixed or driven by a metric (point radius,
/// polygon elevation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FixedOrMetric {
    Fix { value: f64 },
    Metric { value: MetricSpec },
}

fn default_true() -> bool {
    true
}

/// Declarative chart configuration. Field names mirror the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    pub chart_kind: ChartKind,

    // Ordered metric slots; merged and deduplicated by label at build time.
    pub metric: Option<MetricSpec>,
    pub metrics: Vec<MetricSpec>,
    pub percent_metrics: Vec<MetricSpec>,
    pub metric_2: Option<MetricSpec>,
    pub secondary_metric: Option<MetricSpec>,
    pub x: Option<MetricSpec>,
    pub y: Option<MetricSpec>,
    pub size: Option<MetricSpec>,

    pub groupby: Vec<String>,
    /// Legacy column list, merged into groupby with first-occurrence dedup.
    pub columns: Vec<String>,
    pub all_columns: Vec<String>,
    pub entity: Option<String>,
    pub series: Option<String>,
    pub dimension: Option<String>,

    pub filters: Vec<FilterSpec>,
    pub where_clause: Option<String>,
    pub having: Option<String>,

    pub time_range: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    /// Name of the temporal column driving the time axis.
    pub granularity: Option<String>,
    /// Temporal bucketing unit (name or ISO code, see `TimeGrain::parse`).
    pub time_grain: Option<String>,
    pub time_shift: Option<String>,

    pub row_limit: Option<usize>,
    /// Series limit for timeseries charts.
    pub limit: Option<usize>,
    #[serde(default = "default_true")]
    pub order_desc: bool,
    pub order_by_metric: Option<MetricSpec>,
    pub sort_by_metric: bool,

    // Timeseries post-processing.
    pub time_compare: Vec<String>,
    pub comparison_type: Option<String>,
    pub resample_rule: Option<String>,
    pub resample_method: Option<String>,
    pub rolling_type: Option<String>,
    pub rolling_periods: usize,
    pub min_periods: usize,
    pub contribution: bool,

    // Geo controls.
    pub spatial: Option<SpatialSpec>,
    pub start_spatial: Option<SpatialSpec>,
    pub end_spatial: Option<SpatialSpec>,
    pub point_radius_fixed: Option<FixedOrMetric>,
    #[serde(default = "default_true")]
    pub filter_nulls: bool,
    pub js_columns: Vec<String>,
    pub line_column: Option<String>,
    /// "json" or "geohash" encoding of `line_column`.
    pub line_type: Option<String>,
    pub reverse_long_lat: bool,
    pub geojson: Option<String>,

    // Partition controls.
    pub time_series_option: Option<String>,

    // Calendar heatmap controls.
    pub domain_granularity: Option<String>,
    pub subdomain_granularity: Option<String>,

    // Time pivot controls.
    pub freq: Option<String>,

    // Country map controls.
    pub select_country: Option<String>,

    // Event flow controls.
    pub order_by_entity: bool,

    // Composite chart: child layer specs.
    pub layers: Vec<QuerySpec>,

    /// Chart-level cache TTL override in seconds; `-1` disables caching.
    pub cache_timeout: Option<i64>,
}

impl Default for QuerySpec {
    fn default() -> Self {
        QuerySpec {
            chart_kind: ChartKind::Table,
            metric: None,
            metrics: Vec::new(),
            percent_metrics: Vec::new(),
            metric_2: None,
            secondary_metric: None,
            x: None,
            y: None,
            size: None,
            groupby: Vec::new(),
            columns: Vec::new(),
            all_columns: Vec::new(),
            entity: None,
            series: None,
            dimension: None,
            filters: Vec::new(),
            where_clause: None,
            having: None,
            time_range: None,
            since: None,
            until: None,
            granularity: None,
            time_grain: None,
            time_shift: None,
            row_limit: None,
            limit: None,
            order_desc: true,
            order_by_metric: None,
            sort_by_metric: false,
            time_compare: Vec::new(),
            comparison_type: None,
            resample_rule: None,
            resample_method: None,
            rolling_type: None,
            rolling_periods: 0,
            min_periods: 0,
            contribution: false,
            spatial: None,
            start_spatial: None,
            end_spatial: None,
            point_radius_fixed: None,
            filter_nulls: true,
            js_columns: Vec::new(),
            line_column: None,
            line_type: None,
            reverse_long_lat: false,
            geojson: None,
            time_series_option: None,
            domain_granularity: None,
            subdomain_granularity: None,
            freq: None,
            select_country: None,
            order_by_entity: false,
            layers: Vec::new(),
            cache_timeout: None,
        }
    }
}

impl QuerySpec {
    /// Merge the ordered metric slots into a deduplicated, order-preserving
    /// list. Metric order is significant for several chart kinds, so the slot
    /// order here is part of the contract.
    pub fn ordered_metrics(&self) -> Vec<MetricSpec> {
        let mut labels: Vec<String> = Vec::new();
        let mut out: Vec<MetricSpec> = Vec::new();
        let slots: Vec<&MetricSpec> = self
            .metric
            .iter()
            .chain(self.metrics.iter())
            .chain(self.percent_metrics.iter())
            .chain(self.metric_2.iter())
            .chain(self.secondary_metric.iter())
            .chain(self.x.iter())
            .chain(self.y.iter())
            .chain(self.size.iter())
            .collect();
        for m in slots {
            let label = m.label();
            if !labels.contains(&label) {
                labels.push(label);
                out.push(m.clone());
            }
        }
        out
    }

    pub fn metric_labels(&self) -> Vec<String> {
        self.ordered_metrics().iter().map(|m| m.label()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metric_label_derivation() {
        let named = MetricSpec::Name("count".into());
        assert_eq!(named.label(), "count");
        let agg: MetricSpec =
            serde_json::from_value(json!({"aggregate": "sum", "column": "revenue"})).unwrap();
        assert_eq!(agg.label(), "SUM(revenue)");
        let aliased: MetricSpec =
            serde_json::from_value(json!({"aggregate": "sum", "column": "revenue", "label": "rev"}))
                .unwrap();
        assert_eq!(aliased.label(), "rev");
    }

    #[test]
    fn ordered_metrics_dedup_preserves_order() {
        let spec = QuerySpec {
            metric: Some(MetricSpec::Name("count".into())),
            metrics: vec![MetricSpec::Name("count".into()), MetricSpec::Name("sum_x".into())],
            secondary_metric: Some(MetricSpec::Name("count".into())),
            ..Default::default()
        };
        assert_eq!(spec.metric_labels(), vec!["count", "sum_x"]);
    }

    #[test]
    fn filter_layer_scope() {
        let mut f = FilterSpec::new("country", "==", json!("US"));
        assert!(f.applies_to_layer(0) && f.applies_to_layer(7));
        f.layer_scope = Some(vec![1, 2]);
        assert!(!f.applies_to_layer(0));
        assert!(f.applies_to_layer(2));
        f.layer_scope = Some(Vec::new());
        assert!(f.applies_to_layer(0));
    }

    #[test]
    fn spec_deserializes_from_sparse_json() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "chart_kind": "time_series",
            "metrics": ["count"],
            "groupby": ["country"],
            "time_range": "Last week",
            "filters": [{"col": "ts", "op": "TEMPORAL_RANGE", "val": null}]
        }))
        .unwrap();
        assert_eq!(spec.chart_kind, ChartKind::TimeSeries);
        assert!(spec.order_desc);
        assert_eq!(spec.filters.len(), 1);
    }
}
