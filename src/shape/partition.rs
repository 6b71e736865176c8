//! Hierarchical partition shaping.
//!
//! Aggregation runs over an explicit arena of levels: level `k` maps the
//! first `k` group values to per-metric aggregates. The nested payload is
//! built by a plain recursive walk over that arena, so nesting semantics do
//! not depend on any dataframe indexing behavior.

use std::collections::BTreeMap;

use polars::prelude::DataFrame;
use serde_json::{json, Value};

use crate::config::DTTM_ALIAS;
use crate::error::VizError;
use crate::frame::{column_f64, column_i64, column_str};
use crate::shape::ChartPlan;

type Level = BTreeMap<Vec<String>, BTreeMap<String, f64>>;

struct Cell {
    sum: f64,
    count: usize,
}

fn row_groups(df: &DataFrame, groupby: &[String]) -> Result<Vec<Vec<String>>, VizError> {
    let mut cols: Vec<Vec<Option<String>>> = Vec::with_capacity(groupby.len());
    for g in groupby {
        cols.push(column_str(df, g)?);
    }
    let mut out = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        out.push(
            cols.iter()
                .map(|c| c[row].clone().unwrap_or_else(|| "NULL".to_string()))
                .collect(),
        );
    }
    Ok(out)
}

/// Aggregate every group-by prefix length, from the grand total (level 0)
/// down to the full grouping.
fn levels_for(
    df: &DataFrame,
    groupby: &[String],
    metric_labels: &[String],
    mean: bool,
) -> Result<Vec<Level>, VizError> {
    let groups = row_groups(df, groupby)?;
    let mut metric_cols: Vec<Vec<Option<f64>>> = Vec::with_capacity(metric_labels.len());
    for m in metric_labels {
        metric_cols.push(column_f64(df, m)?);
    }
    let mut levels: Vec<Level> = Vec::with_capacity(groupby.len() + 1);
    for depth in 0..=groupby.len() {
        let mut cells: BTreeMap<Vec<String>, BTreeMap<String, Cell>> = BTreeMap::new();
        for row in 0..df.height() {
            let prefix: Vec<String> = groups[row][..depth].to_vec();
            let per_metric = cells.entry(prefix).or_default();
            for (mi, label) in metric_labels.iter().enumerate() {
                if let Some(v) = metric_cols[mi][row] {
                    let cell = per_metric.entry(label.clone()).or_insert(Cell { sum: 0.0, count: 0 });
                    cell.sum += v;
                    cell.count += 1;
                }
            }
        }
        let level: Level = cells
            .into_iter()
            .map(|(prefix, per_metric)| {
                let vals = per_metric
                    .into_iter()
                    .map(|(m, c)| (m, if mean { c.sum / c.count as f64 } else { c.sum }))
                    .collect();
                (prefix, vals)
            })
            .collect();
        levels.push(level);
    }
    Ok(levels)
}

/// Point-to-point deltas between the first and last time bucket per prefix.
fn levels_for_diff(
    df: &DataFrame,
    groupby: &[String],
    metric_labels: &[String],
    option: &str,
) -> Result<Vec<Level>, VizError> {
    let ts = column_i64(df, DTTM_ALIAS)?;
    let buckets: Vec<i64> = ts.iter().flatten().copied().collect();
    let (first, last) = match (buckets.iter().min(), buckets.iter().max()) {
        (Some(a), Some(b)) => (*a, *b),
        _ => return Err(VizError::validation("a time axis is required for point comparisons")),
    };
    let groups = row_groups(df, groupby)?;
    let mut metric_cols: Vec<Vec<Option<f64>>> = Vec::with_capacity(metric_labels.len());
    for m in metric_labels {
        metric_cols.push(column_f64(df, m)?);
    }

    let mut levels: Vec<Level> = Vec::with_capacity(groupby.len() + 1);
    for depth in 0..=groupby.len() {
        // Sum per prefix at each endpoint bucket, then compare.
        let mut endpoints: BTreeMap<Vec<String>, BTreeMap<String, (f64, f64)>> = BTreeMap::new();
        for row in 0..df.height() {
            let t = match ts[row] {
                Some(t) => t,
                None => continue,
            };
            if t != first && t != last {
                continue;
            }
            let prefix: Vec<String> = groups[row][..depth].to_vec();
            let per_metric = endpoints.entry(prefix).or_default();
            for (mi, label) in metric_labels.iter().enumerate() {
                if let Some(v) = metric_cols[mi][row] {
                    let cell = per_metric.entry(label.clone()).or_insert((0.0, 0.0));
                    if t == first {
                        cell.0 += v;
                    }
                    if t == last {
                        cell.1 += v;
                    }
                }
            }
        }
        let level: Level = endpoints
            .into_iter()
            .map(|(prefix, per_metric)| {
                let vals = per_metric
                    .into_iter()
                    .filter_map(|(m, (a, b))| {
                        let v = match option {
                            "point_diff" => Some(b - a),
                            "point_factor" => if a != 0.0 { Some(b / a) } else { None },
                            "point_percent" => if a != 0.0 { Some(b / a - 1.0) } else { None },
                            _ => None,
                        };
                        v.map(|v| (m, v))
                    })
                    .collect();
                (prefix, vals)
            })
            .collect();
        levels.push(level);
    }
    Ok(levels)
}

fn nest(levels: &[Level], prefix: &[String], depth: usize, metric: &str) -> Vec<Value> {
    let level = match levels.get(depth) {
        Some(l) => l,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    for (key, vals) in level {
        if key.len() != depth || !key.starts_with(prefix) {
            continue;
        }
        let val = match vals.get(metric) {
            Some(v) => *v,
            None => continue,
        };
        let children = nest(levels, key, depth + 1, metric);
        let name = key.last().cloned().unwrap_or_default();
        if children.is_empty() {
            out.push(json!({"name": name, "val": val}));
        } else {
            out.push(json!({"name": name, "val": val, "children": children}));
        }
    }
    out
}

/// Nested tree payload, one root per metric.
pub fn partition(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let groupby = &plan.query.groupby;
    let option = plan.spec.time_series_option.as_deref().unwrap_or("not_time");
    let levels = match option {
        "not_time" | "agg_sum" => levels_for(df, groupby, &plan.metric_labels, false)?,
        "agg_mean" => levels_for(df, groupby, &plan.metric_labels, true)?,
        "point_diff" | "point_factor" | "point_percent" => {
            levels_for_diff(df, groupby, &plan.metric_labels, option)?
        }
        other => {
            return Err(VizError::validation(format!("unknown partition option: {other}")));
        }
    };
    let roots: Vec<Value> = plan
        .metric_labels
        .iter()
        .filter_map(|metric| {
            let total = levels.first().and_then(|l| l.get(&Vec::new())).and_then(|v| v.get(metric))?;
            Some(json!({
                "name": metric,
                "val": total,
                "children": nest(&levels, &[], 1, metric),
            }))
        })
        .collect();
    Ok(Value::Array(roots))
}
