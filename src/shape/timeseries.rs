//! Time-series shapers: pivoted line series, comparison overlays and the
//! derivative variants (period pivot, rose, paired comparison).

use polars::prelude::DataFrame;
use serde_json::{json, Map, Value};

use crate::config::DTTM_ALIAS;
use crate::error::VizError;
use crate::frame::{column_f64, column_i64};
use crate::shape::pivot::{pivot_frame, PivotTable};
use crate::shape::{ChartPlan, ExtraFrame};

/// Pivot and run the post-pivot transforms a plan asks for: resample,
/// contribution normalization, rolling window. Series come out in
/// lexicographic key order.
fn process(plan: &ChartPlan, df: &DataFrame) -> Result<PivotTable, VizError> {
    let mut table = pivot_frame(df, &plan.metric_labels, &plan.query.groupby, None, false)?;
    table.drop_all_null_series();
    if let (Some(rule), Some(method)) =
        (plan.spec.resample_rule.as_deref(), plan.spec.resample_method.as_deref())
    {
        table.resample(rule, method)?;
    }
    table.sort_series_lexicographic();
    if plan.spec.contribution {
        table.contribution();
    }
    if let Some(rolling_type) = plan.spec.rolling_type.as_deref() {
        table.rolling(rolling_type, plan.spec.rolling_periods, plan.spec.min_periods)?;
    }
    Ok(table)
}

/// NVD3-style line series with optional time-comparison overlays.
///
/// With `comparison_type` "values" the shifted series are charted alongside
/// the primary ones; for "absolute", "percentage" and "ratio" only the deltas
/// are charted, after aligning each shifted frame onto the primary index by
/// time interpolation.
pub fn time_series(plan: &ChartPlan, df: &DataFrame, extras: &[ExtraFrame]) -> Result<Value, VizError> {
    let single = plan.metric_labels.len() == 1;
    let primary = process(plan, df)?;
    let comparison = plan.spec.comparison_type.as_deref().unwrap_or("values");

    let mut chart_data: Vec<Value> = Vec::new();
    if comparison == "values" {
        chart_data.extend(primary.to_series_json(single, "", ""));
        for (i, extra) in extras.iter().enumerate() {
            if extra.df.height() == 0 {
                continue;
            }
            let mut shifted = process(plan, &extra.df)?;
            shifted.shift_index(extra.delta_ms);
            chart_data.extend(shifted.to_series_json(
                single,
                &format!("time-shift-{i}"),
                &format!("{} offset", extra.label),
            ));
        }
    } else {
        for (i, extra) in extras.iter().enumerate() {
            if extra.df.height() == 0 {
                continue;
            }
            let mut shifted = process(plan, &extra.df)?;
            shifted.shift_index(extra.delta_ms);
            let aligned = shifted.interpolate_onto(&primary.index);
            let mut diff = match comparison {
                "absolute" => primary.combine(&aligned, |a, b| Some(a - b)),
                "percentage" => {
                    primary.combine(&aligned, |a, b| if b != 0.0 { Some((a - b) / b) } else { None })
                }
                "ratio" => primary.combine(&aligned, |a, b| if b != 0.0 { Some(a / b) } else { None }),
                other => {
                    return Err(VizError::validation(format!("invalid comparison type: {other}")));
                }
            };
            diff.trim_null_edges();
            chart_data.extend(diff.to_series_json(
                single,
                &format!("time-shift-{i}"),
                &format!("{} offset", extra.label),
            ));
        }
    }
    chart_data.sort_by_key(|entry| entry["key"].to_string());
    Ok(Value::Array(chart_data))
}

fn freq_step_ms(freq: &str) -> Result<i64, VizError> {
    let re = regex::Regex::new(r"^(\d*)\s*([STHDW])$").unwrap();
    let caps = re
        .captures(freq.trim())
        .ok_or_else(|| VizError::validation(format!("unknown period frequency: {freq}")))?;
    let n: i64 = if caps[1].is_empty() { 1 } else { caps[1].parse().unwrap_or(1) };
    let unit = match &caps[2] {
        "S" => 1_000,
        "T" => 60_000,
        "H" => 3_600_000,
        "D" => 86_400_000,
        "W" => 7 * 86_400_000,
        _ => unreachable!(),
    };
    if n == 0 {
        return Err(VizError::validation(format!("unknown period frequency: {freq}")));
    }
    Ok(n * unit)
}

/// One series per period, overlaid onto the most recent period: each point's
/// x is shifted forward by its period rank so all periods share an axis.
pub fn time_pivot(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let freq = plan.spec.freq.as_deref().unwrap_or("W");
    let step = freq_step_ms(freq)?;
    let metric = &plan.metric_labels[0];
    let ts = column_i64(df, DTTM_ALIAS)?;
    let values = column_f64(df, metric)?;

    let max_ts = match ts.iter().flatten().max() {
        Some(t) => *t,
        None => return Ok(Value::Array(Vec::new())),
    };
    let anchor = (max_ts / step) * step;

    let mut groups: std::collections::BTreeMap<i64, Vec<Value>> = std::collections::BTreeMap::new();
    for (t, v) in ts.iter().zip(values.iter()) {
        let t = match t {
            Some(t) => *t,
            None => continue,
        };
        let rank = (anchor - (t / step) * step) / step;
        groups.entry(rank).or_default().push(json!({"x": t + rank * step, "y": v}));
    }
    // Oldest period first, "current" last.
    let mut out: Vec<Value> = groups
        .iter()
        .rev()
        .map(|(rank, values)| {
            let key = if *rank == 0 {
                "current".to_string()
            } else if *rank == 1 {
                "1 period ago".to_string()
            } else {
                format!("{rank} periods ago")
            };
            json!({"key": key, "rank": rank, "values": values})
        })
        .collect();
    out.sort_by_key(|e| std::cmp::Reverse(e["rank"].as_i64().unwrap_or(0)));
    Ok(Value::Array(out))
}

/// Per-timestamp groups of series values for the rose chart.
pub fn rose(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let mut table = process(plan, df)?;
    table.drop_all_null_series();
    let single = plan.metric_labels.len() == 1;
    let mut out: Map<String, Value> = Map::new();
    for (i, t) in table.index.iter().enumerate() {
        let entries: Vec<Value> = table
            .series
            .iter()
            .map(|(key, values)| {
                let mut name = key.clone();
                if single && name.len() > 1 {
                    name.remove(0);
                }
                json!({"time": t, "value": values[i], "key": name, "name": name.join(", ")})
            })
            .collect();
        out.insert(t.to_string(), Value::Array(entries));
    }
    Ok(Value::Object(out))
}

/// Series grouped per metric for significance testing between groups.
pub fn paired_comparison(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let table = process(plan, df)?;
    let mut out: Map<String, Value> = Map::new();
    for (key, values) in &table.series {
        let metric = &key[0];
        let group = if key.len() > 1 { key[1..].join(", ") } else { "All".to_string() };
        let points: Vec<Value> = table
            .index
            .iter()
            .zip(values.iter())
            .map(|(t, v)| json!({"x": t, "y": v}))
            .collect();
        let entry = json!({"group": group, "values": points});
        match out.get_mut(metric) {
            Some(Value::Array(arr)) => arr.push(entry),
            _ => {
                out.insert(metric.clone(), json!([entry]));
            }
        }
    }
    Ok(Value::Object(out))
}
