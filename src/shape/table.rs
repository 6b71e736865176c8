//! Record-oriented shapers: tables, heatmap calendars, bubbles and the other
//! variants that pass rows through with light regrouping.

use chrono::{TimeZone, Utc};
use polars::prelude::DataFrame;
use serde_json::{json, Map, Value};

use crate::config::DTTM_ALIAS;
use crate::error::VizError;
use crate::frame::{column_f64, column_i64, column_str, records};
use crate::shape::pivot::pivot_frame;
use crate::shape::ChartPlan;

/// Plain records plus derived percentage columns for the percent metrics.
pub fn table(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let mut rows = records(df)?;
    let mut columns: Vec<String> =
        df.get_column_names().into_iter().map(|s| s.to_string()).collect();
    for m in &plan.spec.percent_metrics {
        let label = m.label();
        let values = column_f64(df, &label)?;
        let total: f64 = values.iter().flatten().sum();
        let pct_label = format!("%{label}");
        for (row, v) in rows.iter_mut().zip(values.iter()) {
            let pct = v.map(|v| if total != 0.0 { v / total } else { f64::NAN });
            row.insert(pct_label.clone(), match pct {
                Some(p) if p.is_finite() => json!(p),
                _ => Value::Null,
            });
        }
        columns.push(pct_label);
    }
    Ok(json!({"records": rows, "columns": columns}))
}

fn iso_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Pivot rows into a map keyed by timestamp. Column set is either the metric
/// labels (no group-by) or the group values of the single metric.
pub fn time_table(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let groupby = &plan.query.groupby;
    let table = pivot_frame(df, &plan.metric_labels, groupby, None, false)?;
    let single = plan.metric_labels.len() == 1 && !groupby.is_empty();
    let mut rows: Map<String, Value> = Map::new();
    for (i, t) in table.index.iter().enumerate() {
        let mut row = Map::new();
        for (key, values) in &table.series {
            let name = if single { key[1..].join(", ") } else { key[0].clone() };
            row.insert(name, json!(values[i]));
        }
        rows.insert(iso_ms(*t), Value::Object(row));
    }
    let columns: Vec<String> = if single {
        table.series.iter().map(|(k, _)| k[1..].join(", ")).collect()
    } else {
        plan.metric_labels.clone()
    };
    Ok(json!({"records": rows, "columns": columns, "is_group_by": !groupby.is_empty()}))
}

/// Per-metric maps of unix seconds to value, plus the calendar domain.
pub fn cal_heatmap(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let ts = column_i64(df, DTTM_ALIAS)?;
    let mut data: Map<String, Value> = Map::new();
    for label in &plan.metric_labels {
        let values = column_f64(df, label)?;
        let mut by_ts: Map<String, Value> = Map::new();
        for (t, v) in ts.iter().zip(values.iter()) {
            if let (Some(t), Some(v)) = (t, v) {
                by_ts.insert((t / 1000).to_string(), json!(v));
            }
        }
        data.insert(label.clone(), Value::Object(by_ts));
    }
    let bounds: Vec<i64> = ts.iter().flatten().copied().collect();
    let start = bounds.iter().min().map(|t| t / 1000);
    let end = bounds.iter().max().map(|t| t / 1000);
    Ok(json!({
        "data": data,
        "start": start,
        "end": end,
        "domain": plan.spec.domain_granularity,
        "subdomain": plan.spec.subdomain_granularity,
    }))
}

/// Scatter points grouped into one entry per series value.
pub fn bubble(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let entity_col = plan.spec.entity.clone().unwrap_or_default();
    let series_col = plan.spec.series.clone().unwrap_or_else(|| entity_col.clone());
    let entities = column_str(df, &entity_col)?;
    let series_vals = column_str(df, &series_col)?;
    let x = column_f64(df, &plan.metric_labels[0])?;
    let y = column_f64(df, &plan.metric_labels[1])?;
    let size = column_f64(df, &plan.metric_labels[2])?;

    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<Value>> = std::collections::HashMap::new();
    for i in 0..df.height() {
        let key = series_vals[i].clone().unwrap_or_else(|| "NULL".to_string());
        if !order.contains(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(json!({
            "name": entities[i],
            "x": x[i],
            "y": y[i],
            "size": size[i],
        }));
    }
    let out: Vec<Value> = order
        .into_iter()
        .map(|key| {
            let values = groups.remove(&key).unwrap_or_default();
            json!({"key": key, "values": values})
        })
        .collect();
    Ok(Value::Array(out))
}

/// Single-metric measures list.
pub fn bullet(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let values = column_f64(df, &plan.metric_labels[0])?;
    let measures: Vec<Value> = values.iter().map(|v| json!(v)).collect();
    Ok(json!({"measures": measures}))
}

/// `{country_id, metric}` records for a single-country regional map.
pub fn country_map(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let entity_col = plan.spec.entity.clone().unwrap_or_default();
    let ids = column_str(df, &entity_col)?;
    let values = column_f64(df, &plan.metric_labels[0])?;
    let out: Vec<Value> = ids
        .iter()
        .zip(values.iter())
        .map(|(id, v)| json!({"country_id": id, "metric": v}))
        .collect();
    Ok(Value::Array(out))
}

/// `{country, m1, m2}` records; the secondary metric falls back to the first.
pub fn world_map(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let entity_col = plan.spec.entity.clone().unwrap_or_default();
    let codes = column_str(df, &entity_col)?;
    let m1 = column_f64(df, &plan.metric_labels[0])?;
    let m2_label = plan
        .spec
        .secondary_metric
        .as_ref()
        .map(|m| m.label())
        .unwrap_or_else(|| plan.metric_labels[0].clone());
    let m2 = column_f64(df, &m2_label)?;
    let out: Vec<Value> = (0..df.height())
        .map(|i| {
            json!({
                "country": codes[i].as_deref().map(str::to_uppercase),
                "m1": m1[i],
                "m2": m2[i],
            })
        })
        .collect();
    Ok(Value::Array(out))
}

pub fn parallel_coordinates(df: &DataFrame) -> Result<Value, VizError> {
    Ok(json!(records(df)?))
}

/// Event records ordered by entity then time, for session-flow rendering.
pub fn event_flow(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let entity_col = plan.spec.entity.clone().unwrap_or_default();
    let entities = column_str(df, &entity_col)?;
    let ts = column_i64(df, DTTM_ALIAS)?;
    let mut rows = records(df)?;
    let mut keyed: Vec<(Option<String>, Option<i64>, Map<String, Value>)> = entities
        .into_iter()
        .zip(ts)
        .zip(rows.drain(..))
        .map(|((e, t), r)| (e, t, r))
        .collect();
    if plan.spec.order_by_entity {
        keyed.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    } else {
        keyed.sort_by_key(|r| r.1);
    }
    let out: Vec<Value> = keyed.into_iter().map(|(_, _, r)| Value::Object(r)).collect();
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VizConfig;
    use crate::shape::plan;
    use crate::spec::QuerySpec;
    use chrono::TimeZone;
    use polars::prelude::*;

    fn plan_json(v: Value) -> ChartPlan {
        let spec: QuerySpec = serde_json::from_value(v).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        plan(&spec, None, &VizConfig::default(), now).unwrap()
    }

    #[test]
    fn table_appends_percent_columns() {
        let p = plan_json(json!({
            "chart_kind": "table",
            "metrics": ["count"],
            "percent_metrics": ["count"],
            "groupby": ["country"]
        }));
        let country = Series::new("country".into(), vec!["US", "DE"]);
        let count = Series::new("count".into(), vec![30.0, 10.0]);
        let df = DataFrame::new(vec![country.into(), count.into()]).unwrap();
        let out = table(&p, &df).unwrap();
        assert_eq!(out["records"][0]["%count"], json!(0.75));
        assert!(out["columns"].as_array().unwrap().contains(&json!("%count")));
    }

    #[test]
    fn bubble_groups_by_series() {
        let p = plan_json(json!({
            "chart_kind": "bubble",
            "entity": "country", "series": "region",
            "x": "pop", "y": "gdp", "size": "area"
        }));
        let df = DataFrame::new(vec![
            Series::new("country".into(), vec!["US", "DE", "FR"]).into(),
            Series::new("region".into(), vec!["NA", "EU", "EU"]).into(),
            Series::new("pop".into(), vec![1.0, 2.0, 3.0]).into(),
            Series::new("gdp".into(), vec![4.0, 5.0, 6.0]).into(),
            Series::new("area".into(), vec![7.0, 8.0, 9.0]).into(),
        ])
        .unwrap();
        let out = bubble(&p, &df).unwrap();
        let arr = out.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        let eu = arr.iter().find(|e| e["key"] == json!("EU")).unwrap();
        assert_eq!(eu["values"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn bubble_axes_track_their_metrics() {
        let p = plan_json(json!({
            "chart_kind": "bubble",
            "entity": "country",
            "metrics": ["other"],
            "x": "pop", "y": "gdp", "size": "area"
        }));
        let df = DataFrame::new(vec![
            Series::new("country".into(), vec!["US"]).into(),
            Series::new("other".into(), vec![999.0]).into(),
            Series::new("pop".into(), vec![1.0]).into(),
            Series::new("gdp".into(), vec![2.0]).into(),
            Series::new("area".into(), vec![3.0]).into(),
        ])
        .unwrap();
        let out = bubble(&p, &df).unwrap();
        let point = &out[0]["values"][0];
        assert_eq!(point["x"], json!(1.0));
        assert_eq!(point["y"], json!(2.0));
        assert_eq!(point["size"], json!(3.0));
    }

    #[test]
    fn world_map_uppercases_codes() {
        let p = plan_json(json!({
            "chart_kind": "world_map",
            "entity": "iso",
            "metric": "count"
        }));
        let df = DataFrame::new(vec![
            Series::new("iso".into(), vec!["us", "de"]).into(),
            Series::new("count".into(), vec![1.0, 2.0]).into(),
        ])
        .unwrap();
        let out = world_map(&p, &df).unwrap();
        assert_eq!(out[0]["country"], json!("US"));
        assert_eq!(out[0]["m2"], json!(1.0));
    }

    #[test]
    fn time_table_single_metric_uses_group_columns() {
        let p = plan_json(json!({
            "chart_kind": "time_table",
            "metric": "count",
            "groupby": ["country"]
        }));
        let df = DataFrame::new(vec![
            Series::new(DTTM_ALIAS.into(), vec![0i64, 0]).into(),
            Series::new("country".into(), vec!["US", "DE"]).into(),
            Series::new("count".into(), vec![1.0, 2.0]).into(),
        ])
        .unwrap();
        let out = time_table(&p, &df).unwrap();
        assert_eq!(out["columns"], json!(["US", "DE"]));
        assert_eq!(out["records"]["1970-01-01T00:00:00+00:00"]["DE"], json!(2.0));
    }
}
