//! Chord diagram shaping: a symmetric node list plus an NxN flow matrix.

use polars::prelude::DataFrame;
use serde_json::{json, Value};

use crate::error::VizError;
use crate::frame::{column_f64, column_str};
use crate::shape::ChartPlan;

/// Nodes are the sorted union of source and target values; the matrix sums
/// the metric per (source, target) cell, zero where no flow exists.
pub fn chord(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let source_col = &plan.query.groupby[0];
    let target_col = &plan.query.groupby[1];
    let sources = column_str(df, source_col)?;
    let targets = column_str(df, target_col)?;
    let values = column_f64(df, &plan.metric_labels[0])?;

    let mut nodes: Vec<String> = sources
        .iter()
        .chain(targets.iter())
        .map(|v| v.clone().unwrap_or_else(|| "NULL".to_string()))
        .collect();
    nodes.sort();
    nodes.dedup();

    let n = nodes.len();
    let mut matrix = vec![vec![0.0f64; n]; n];
    for row in 0..df.height() {
        let s = sources[row].clone().unwrap_or_else(|| "NULL".to_string());
        let t = targets[row].clone().unwrap_or_else(|| "NULL".to_string());
        let (si, ti) = match (nodes.iter().position(|x| *x == s), nodes.iter().position(|x| *x == t)) {
            (Some(si), Some(ti)) => (si, ti),
            _ => continue,
        };
        if let Some(v) = values[row] {
            matrix[si][ti] += v;
        }
    }
    Ok(json!({"nodes": nodes, "matrix": matrix}))
}
