//! Explicit pivot arena for time-indexed series.
//!
//! Rows are pivoted into one series per (metric, group-value...) composite
//! key, aligned on a shared sorted timestamp index. All post-pivot transforms
//! (resampling, rolling windows, contribution, time-shift alignment) operate
//! on this arena with plain loops, so bucket and window semantics are spelled
//! out here rather than inherited from a dataframe library.

use chrono::{Months, TimeZone, Utc};
use polars::prelude::DataFrame;
use regex::Regex;
use serde_json::{json, Value};

use crate::config::DTTM_ALIAS;
use crate::error::VizError;
use crate::frame::{column_f64, column_i64, column_str};
use crate::time::TimeGrain;

/// Composite series key: metric label first, then group values in group-by
/// order.
pub type SeriesKey = Vec<String>;

#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    /// Sorted unique timestamps (epoch millis).
    pub index: Vec<i64>,
    /// Series aligned to `index`, in insertion order of first occurrence.
    pub series: Vec<(SeriesKey, Vec<Option<f64>>)>,
}

fn group_label(v: Option<String>) -> String {
    match v {
        None => "NULL".to_string(),
        Some(s) if s.is_empty() => "N/A".to_string(),
        Some(s) => s,
    }
}

/// Pivot a frame on `__timestamp`. Duplicate cells aggregate by mean, or by
/// sum when `aggregate` is set (matching pivot-then-sum chart variants).
pub fn pivot_frame(
    df: &DataFrame,
    metric_labels: &[String],
    groupby: &[String],
    fill_value: Option<f64>,
    aggregate: bool,
) -> Result<PivotTable, VizError> {
    let ts = column_i64(df, DTTM_ALIAS)?;
    let mut group_cols: Vec<Vec<Option<String>>> = Vec::with_capacity(groupby.len());
    for g in groupby {
        group_cols.push(column_str(df, g)?);
    }
    let mut metric_cols: Vec<Vec<Option<f64>>> = Vec::with_capacity(metric_labels.len());
    for m in metric_labels {
        metric_cols.push(column_f64(df, m)?);
    }

    // (sum, count) per cell; key order tracks first occurrence.
    let mut order: Vec<SeriesKey> = Vec::new();
    let mut cells: std::collections::HashMap<SeriesKey, std::collections::HashMap<i64, (f64, usize)>> =
        std::collections::HashMap::new();
    let mut index: Vec<i64> = Vec::new();
    for row in 0..df.height() {
        let t = match ts[row] {
            Some(t) => t,
            None => continue,
        };
        if !index.contains(&t) {
            index.push(t);
        }
        for (mi, label) in metric_labels.iter().enumerate() {
            let mut key: SeriesKey = vec![label.clone()];
            for gc in &group_cols {
                key.push(group_label(gc[row].clone()));
            }
            if !cells.contains_key(&key) {
                order.push(key.clone());
            }
            let cell = cells.entry(key).or_default().entry(t).or_insert((0.0, 0));
            if let Some(v) = metric_cols[mi][row] {
                cell.0 += v;
                cell.1 += 1;
            }
        }
    }
    index.sort_unstable();

    let mut series: Vec<(SeriesKey, Vec<Option<f64>>)> = Vec::with_capacity(order.len());
    for key in order {
        let by_ts = &cells[&key];
        let values: Vec<Option<f64>> = index
            .iter()
            .map(|t| match by_ts.get(t) {
                Some((sum, n)) if *n > 0 => Some(if aggregate { *sum } else { *sum / *n as f64 }),
                _ => fill_value,
            })
            .collect();
        series.push((key, values));
    }
    Ok(PivotTable { index, series })
}

impl PivotTable {
    pub fn is_empty(&self) -> bool {
        self.index.is_empty() || self.series.is_empty()
    }

    /// Drop series whose values are entirely null.
    pub fn drop_all_null_series(&mut self) {
        self.series.retain(|(_, values)| values.iter().any(|v| v.is_some()));
    }

    pub fn sort_series_lexicographic(&mut self) {
        self.series.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// Order series by descending total, largest first.
    pub fn sort_series_by_sum_desc(&mut self) {
        self.series.sort_by(|a, b| {
            let sa: f64 = a.1.iter().flatten().sum();
            let sb: f64 = b.1.iter().flatten().sum();
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Shift every index timestamp by a fixed offset.
    pub fn shift_index(&mut self, delta_ms: i64) {
        for t in &mut self.index {
            *t += delta_ms;
        }
    }

    /// Divide each cell by its row total across all series.
    pub fn contribution(&mut self) {
        for row in 0..self.index.len() {
            let total: f64 = self.series.iter().filter_map(|(_, v)| v[row]).sum();
            for (_, values) in &mut self.series {
                values[row] = values[row].map(|v| if total != 0.0 { v / total } else { f64::NAN });
            }
        }
    }

    /// Apply a rolling-window transform in place.
    ///
    /// `min_periods` is both the non-null count a window needs to produce a
    /// value and the number of leading rows dropped afterwards, matching the
    /// source-query contract. A window larger than the series, or a slice
    /// that leaves no rows, is a validation error rather than a silent empty
    /// result.
    pub fn rolling(&mut self, rolling_type: &str, periods: usize, min_periods: usize) -> Result<(), VizError> {
        match rolling_type {
            "cumsum" => {
                // Null cells stay gaps; the running total skips them.
                for (_, values) in &mut self.series {
                    let mut acc = 0.0;
                    for v in values.iter_mut() {
                        if let Some(x) = *v {
                            acc += x;
                            *v = Some(acc);
                        }
                    }
                }
            }
            "mean" | "std" | "sum" => {
                if periods == 0 {
                    return Ok(());
                }
                if periods > self.index.len() {
                    return Err(VizError::validation(
                        "rolling window is larger than the underlying result set",
                    ));
                }
                let required = min_periods.max(1);
                for (_, values) in &mut self.series {
                    let src = values.clone();
                    for i in 0..src.len() {
                        let start = (i + 1).saturating_sub(periods);
                        let window: Vec<f64> = src[start..=i].iter().flatten().copied().collect();
                        values[i] = if window.len() < required {
                            None
                        } else {
                            match rolling_type {
                                "mean" => Some(window.iter().sum::<f64>() / window.len() as f64),
                                "sum" => Some(window.iter().sum::<f64>()),
                                // sample std
                                "std" => {
                                    if window.len() < 2 {
                                        None
                                    } else {
                                        let mean = window.iter().sum::<f64>() / window.len() as f64;
                                        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                                            / (window.len() - 1) as f64;
                                        Some(var.sqrt())
                                    }
                                }
                                _ => unreachable!(),
                            }
                        };
                    }
                }
            }
            other => {
                return Err(VizError::validation(format!("unknown rolling type: {other}")));
            }
        }
        if min_periods > 0 {
            if min_periods >= self.index.len() {
                return Err(VizError::validation(
                    "rolling window did not return any data; the source query must satisfy the minimum periods",
                ));
            }
            self.index.drain(..min_periods);
            for (_, values) in &mut self.series {
                values.drain(..min_periods);
            }
        }
        Ok(())
    }

    /// Resample onto a regular grid described by `rule` (e.g. "1D", "6H",
    /// "15T", "1W", "1M"). Bucket labels are bucket starts.
    pub fn resample(&mut self, rule: &str, method: &str) -> Result<(), VizError> {
        if self.is_empty() {
            return Ok(());
        }
        let rule_re = Regex::new(r"^(\d*)\s*([STHDWM])$").unwrap();
        let caps = rule_re
            .captures(rule.trim())
            .ok_or_else(|| VizError::validation(format!("unknown resample rule: {rule}")))?;
        let n: i64 = if caps[1].is_empty() { 1 } else { caps[1].parse().unwrap_or(1) };
        if n == 0 {
            return Err(VizError::validation(format!("unknown resample rule: {rule}")));
        }
        let first = self.index[0];
        let last = *self.index.last().unwrap_or(&first);

        // Bucket starts for the whole span, inclusive.
        let grid: Vec<i64> = match &caps[2] {
            "M" => {
                let mut grid = Vec::new();
                let mut cur = TimeGrain::Month.truncate_ms(first);
                while cur <= last {
                    grid.push(cur);
                    let dt = Utc
                        .timestamp_millis_opt(cur)
                        .single()
                        .and_then(|d| d.checked_add_months(Months::new(n as u32)));
                    match dt {
                        Some(d) => cur = d.timestamp_millis(),
                        None => break,
                    }
                }
                grid
            }
            unit => {
                let step = n * match unit {
                    "S" => 1_000,
                    "T" => 60_000,
                    "H" => 3_600_000,
                    "D" => 86_400_000,
                    "W" => 7 * 86_400_000,
                    _ => unreachable!(),
                };
                let origin = match unit {
                    "W" => TimeGrain::Week.truncate_ms(first),
                    _ => TimeGrain::Day.truncate_ms(first),
                };
                let start = origin + ((first - origin) / step) * step;
                let mut grid = Vec::new();
                let mut cur = start;
                while cur <= last {
                    grid.push(cur);
                    cur += step;
                }
                grid
            }
        };

        let mut new_series: Vec<(SeriesKey, Vec<Option<f64>>)> = Vec::with_capacity(self.series.len());
        for (key, values) in &self.series {
            let mut out: Vec<Option<f64>> = Vec::with_capacity(grid.len());
            for (bi, bucket) in grid.iter().enumerate() {
                let bucket_end = grid.get(bi + 1).copied().unwrap_or(i64::MAX);
                let in_bucket: Vec<(i64, Option<f64>)> = self
                    .index
                    .iter()
                    .zip(values.iter())
                    .filter(|(t, _)| **t >= *bucket && **t < bucket_end)
                    .map(|(t, v)| (*t, *v))
                    .collect();
                let non_null: Vec<f64> = in_bucket.iter().filter_map(|(_, v)| *v).collect();
                let v = match method {
                    "sum" => {
                        if non_null.is_empty() { None } else { Some(non_null.iter().sum()) }
                    }
                    "mean" => {
                        if non_null.is_empty() {
                            None
                        } else {
                            Some(non_null.iter().sum::<f64>() / non_null.len() as f64)
                        }
                    }
                    "median" => {
                        if non_null.is_empty() {
                            None
                        } else {
                            let mut v = non_null.clone();
                            v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                            let mid = v.len() / 2;
                            Some(if v.len() % 2 == 0 { (v[mid - 1] + v[mid]) / 2.0 } else { v[mid] })
                        }
                    }
                    // value sitting exactly on the bucket label, if any
                    "asfreq" => in_bucket.iter().find(|(t, _)| t == bucket).and_then(|(_, v)| *v),
                    // nearest original sample at/before or at/after the label
                    "ffill" => self
                        .index
                        .iter()
                        .zip(values.iter())
                        .filter(|(t, v)| **t <= *bucket && v.is_some())
                        .next_back()
                        .and_then(|(_, v)| *v),
                    "bfill" => self
                        .index
                        .iter()
                        .zip(values.iter())
                        .find(|(t, v)| **t >= *bucket && v.is_some())
                        .and_then(|(_, v)| *v),
                    other => {
                        return Err(VizError::validation(format!("unknown resample method: {other}")));
                    }
                };
                out.push(v);
            }
            new_series.push((key.clone(), out));
        }
        self.index = grid;
        self.series = new_series;
        Ok(())
    }

    /// Re-align this table onto `target`, interpolating linearly in time
    /// between bracketing samples. Points outside the source span stay null.
    pub fn interpolate_onto(&self, target: &[i64]) -> PivotTable {
        let mut series = Vec::with_capacity(self.series.len());
        for (key, values) in &self.series {
            let points: Vec<(i64, f64)> = self
                .index
                .iter()
                .zip(values.iter())
                .filter_map(|(t, v)| v.map(|v| (*t, v)))
                .collect();
            let out: Vec<Option<f64>> = target.iter().map(|t| interpolate_at(&points, *t)).collect();
            series.push((key.clone(), out));
        }
        PivotTable { index: target.to_vec(), series }
    }

    /// Combine with another table series-by-series (matched on key) over this
    /// table's index. Missing counterparts yield null.
    pub fn combine(&self, other: &PivotTable, f: impl Fn(f64, f64) -> Option<f64>) -> PivotTable {
        let mut series = Vec::with_capacity(self.series.len());
        for (key, values) in &self.series {
            let other_values = other.series.iter().find(|(k, _)| k == key).map(|(_, v)| v);
            let out: Vec<Option<f64>> = values
                .iter()
                .enumerate()
                .map(|(i, v)| match (v, other_values.and_then(|ov| ov.get(i).copied().flatten())) {
                    (Some(a), Some(b)) => f(*a, b),
                    _ => None,
                })
                .collect();
            series.push((key.clone(), out));
        }
        PivotTable { index: self.index.clone(), series }
    }

    /// Drop leading and trailing rows where every series is null.
    pub fn trim_null_edges(&mut self) {
        let row_has_value =
            |row: usize, series: &[(SeriesKey, Vec<Option<f64>>)]| series.iter().any(|(_, v)| v[row].is_some());
        let mut start = 0;
        while start < self.index.len() && !row_has_value(start, &self.series) {
            start += 1;
        }
        let mut end = self.index.len();
        while end > start && !row_has_value(end - 1, &self.series) {
            end -= 1;
        }
        self.index = self.index[start..end].to_vec();
        for (_, values) in &mut self.series {
            *values = values[start..end].to_vec();
        }
    }

    /// Render to chart series entries `{key, values: [{x, y}]}`.
    ///
    /// With a single metric the leading metric component is dropped from
    /// composite keys. Series that never carry a value are skipped.
    pub fn to_series_json(&self, single_metric: bool, classed: &str, title_suffix: &str) -> Vec<Value> {
        let mut out = Vec::new();
        for (key, values) in &self.series {
            if values.iter().all(|v| v.is_none()) {
                continue;
            }
            let mut title: Vec<String> = key.clone();
            if single_metric && title.len() > 1 {
                title.remove(0);
            }
            if !title_suffix.is_empty() {
                title.push(title_suffix.to_string());
            }
            let key_json = if title.len() == 1 { json!(title[0]) } else { json!(title) };
            let points: Vec<Value> = self
                .index
                .iter()
                .zip(values.iter())
                .map(|(t, v)| json!({"x": t, "y": v}))
                .collect();
            let mut entry = json!({"key": key_json, "values": points});
            if !classed.is_empty() {
                entry["classed"] = json!(classed);
            }
            out.push(entry);
        }
        out
    }
}

fn interpolate_at(points: &[(i64, f64)], t: i64) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    if let Some((_, v)) = points.iter().find(|(pt, _)| *pt == t) {
        return Some(*v);
    }
    let before = points.iter().filter(|(pt, _)| *pt < t).next_back()?;
    let after = points.iter().find(|(pt, _)| *pt > t)?;
    let span = (after.0 - before.0) as f64;
    if span == 0.0 {
        return Some(before.1);
    }
    let frac = (t - before.0) as f64 / span;
    Some(before.1 + (after.1 - before.1) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    const DAY: i64 = 86_400_000;

    fn ts_df(rows: &[(i64, &str, f64)]) -> DataFrame {
        let ts = Series::new(DTTM_ALIAS.into(), rows.iter().map(|r| r.0).collect::<Vec<i64>>());
        let country = Series::new("country".into(), rows.iter().map(|r| r.1).collect::<Vec<&str>>());
        let count = Series::new("count".into(), rows.iter().map(|r| r.2).collect::<Vec<f64>>());
        DataFrame::new(vec![ts.into(), country.into(), count.into()]).unwrap()
    }

    fn table() -> PivotTable {
        let df = ts_df(&[
            (0, "US", 1.0),
            (0, "DE", 10.0),
            (DAY, "US", 2.0),
            (DAY, "DE", 20.0),
            (2 * DAY, "US", 3.0),
            (2 * DAY, "DE", 30.0),
        ]);
        pivot_frame(&df, &["count".to_string()], &["country".to_string()], None, false).unwrap()
    }

    #[test]
    fn pivot_builds_one_series_per_group() {
        let t = table();
        assert_eq!(t.index, vec![0, DAY, 2 * DAY]);
        assert_eq!(t.series.len(), 2);
        let us = t.series.iter().find(|(k, _)| k == &vec!["count".to_string(), "US".to_string()]).unwrap();
        assert_eq!(us.1, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn duplicate_cells_average_unless_aggregating() {
        let df = ts_df(&[(0, "US", 1.0), (0, "US", 3.0)]);
        let mean = pivot_frame(&df, &["count".to_string()], &["country".to_string()], None, false).unwrap();
        assert_eq!(mean.series[0].1, vec![Some(2.0)]);
        let sum = pivot_frame(&df, &["count".to_string()], &["country".to_string()], None, true).unwrap();
        assert_eq!(sum.series[0].1, vec![Some(4.0)]);
    }

    #[test]
    fn rolling_mean() {
        let mut t = table();
        t.rolling("mean", 2, 0).unwrap();
        let us = t.series.iter().find(|(k, _)| k[1] == "US").unwrap();
        assert_eq!(us.1, vec![Some(1.0), Some(1.5), Some(2.5)]);
    }

    #[test]
    fn rolling_window_underflow_is_an_error() {
        let mut t = table();
        let err = t.rolling("mean", 10, 0).unwrap_err();
        assert!(matches!(err, VizError::Validation(_)));
    }

    #[test]
    fn rolling_min_periods_slices_and_can_empty() {
        let mut t = table();
        t.rolling("sum", 2, 1).unwrap();
        assert_eq!(t.index.len(), 2);
        let mut t2 = table();
        assert!(t2.rolling("sum", 2, 3).is_err());
    }

    #[test]
    fn cumsum() {
        let mut t = table();
        t.rolling("cumsum", 0, 0).unwrap();
        let de = t.series.iter().find(|(k, _)| k[1] == "DE").unwrap();
        assert_eq!(de.1, vec![Some(10.0), Some(30.0), Some(60.0)]);
    }

    #[test]
    fn cumsum_keeps_null_gaps() {
        let df = ts_df(&[(0, "US", 1.0), (DAY, "DE", 5.0), (2 * DAY, "US", 2.0)]);
        let mut t =
            pivot_frame(&df, &["count".to_string()], &["country".to_string()], None, false).unwrap();
        t.rolling("cumsum", 0, 0).unwrap();
        let us = t.series.iter().find(|(k, _)| k[1] == "US").unwrap();
        assert_eq!(us.1, vec![Some(1.0), None, Some(3.0)]);
        let de = t.series.iter().find(|(k, _)| k[1] == "DE").unwrap();
        assert_eq!(de.1, vec![None, Some(5.0), None]);
    }

    #[test]
    fn contribution_normalizes_rows() {
        let mut t = table();
        t.contribution();
        let us = t.series.iter().find(|(k, _)| k[1] == "US").unwrap();
        assert_eq!(us.1[0], Some(1.0 / 11.0));
    }

    #[test]
    fn resample_daily_sum_fills_gaps() {
        let df = ts_df(&[(0, "US", 1.0), (2 * DAY, "US", 3.0)]);
        let mut t = pivot_frame(&df, &["count".to_string()], &["country".to_string()], None, false).unwrap();
        t.resample("1D", "sum").unwrap();
        assert_eq!(t.index, vec![0, DAY, 2 * DAY]);
        assert_eq!(t.series[0].1, vec![Some(1.0), None, Some(3.0)]);
        let mut f = pivot_frame(&df, &["count".to_string()], &["country".to_string()], None, false).unwrap();
        f.resample("1D", "ffill").unwrap();
        assert_eq!(f.series[0].1, vec![Some(1.0), Some(1.0), Some(3.0)]);
    }

    #[test]
    fn interpolation_is_time_linear() {
        let points = vec![(0i64, 0.0), (2 * DAY, 4.0)];
        assert_eq!(interpolate_at(&points, DAY), Some(2.0));
        assert_eq!(interpolate_at(&points, 3 * DAY), None);
        assert_eq!(interpolate_at(&points, 0), Some(0.0));
    }

    #[test]
    fn trim_null_edges() {
        let mut t = table();
        t.series[0].1[0] = None;
        t.series[1].1[0] = None;
        t.trim_null_edges();
        assert_eq!(t.index, vec![DAY, 2 * DAY]);
    }

    #[test]
    fn series_json_drops_metric_for_single_metric() {
        let t = table();
        let out = t.to_series_json(true, "", "");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["key"], json!("US"));
        assert_eq!(out[0]["values"][1]["x"], json!(DAY));
    }
}
