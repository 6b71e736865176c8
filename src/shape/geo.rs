//! Deck-style geo shapers.
//!
//! All point variants normalize their spatial input into `[lon, lat]` pairs
//! from one of three encodings: an explicit lat/lon column pair, a single
//! delimited "lon,lat" column, or a geohash column. Spatial columns get
//! IS NOT NULL filters by default so the datasource never returns unplottable
//! rows.

use polars::prelude::DataFrame;
use serde_json::{json, Map, Value};

use crate::error::VizError;
use crate::frame::{cell_to_json, column_f64, column_str};
use crate::query::QueryObject;
use crate::shape::{push_not_null_filters, value_source, ChartPlan, ValueSource};
use crate::spec::{ChartKind, FixedOrMetric, QuerySpec, SpatialSpec};

const GEOHASH_ALPHABET: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Decode a geohash into (lat, lon, lat_err, lon_err).
pub fn decode_geohash(code: &str) -> Option<(f64, f64, f64, f64)> {
    let mut lat = (-90.0f64, 90.0f64);
    let mut lon = (-180.0f64, 180.0f64);
    let mut even = true;
    for ch in code.bytes() {
        let idx = GEOHASH_ALPHABET.iter().position(|c| *c == ch.to_ascii_lowercase())?;
        for bit in (0..5).rev() {
            let set = (idx >> bit) & 1 == 1;
            let range = if even { &mut lon } else { &mut lat };
            let mid = (range.0 + range.1) / 2.0;
            if set {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even = !even;
        }
    }
    let lat_err = (lat.1 - lat.0) / 2.0;
    let lon_err = (lon.1 - lon.0) / 2.0;
    Some(((lat.0 + lat.1) / 2.0, (lon.0 + lon.1) / 2.0, lat_err, lon_err))
}

fn required_spatial(kind: ChartKind, spec: &QuerySpec) -> Result<Vec<SpatialSpec>, VizError> {
    match kind {
        ChartKind::GeoArc => {
            let start = spec
                .start_spatial
                .clone()
                .ok_or_else(|| VizError::validation("start spatial is required"))?;
            let end = spec
                .end_spatial
                .clone()
                .ok_or_else(|| VizError::validation("end spatial is required"))?;
            Ok(vec![start, end])
        }
        ChartKind::GeoPath | ChartKind::GeoPolygon | ChartKind::GeoJson => Ok(Vec::new()),
        _ => {
            let spatial = spec
                .spatial
                .clone()
                .ok_or_else(|| VizError::validation("spatial is required"))?;
            Ok(vec![spatial])
        }
    }
}

/// Set the query's column/metric shape for a geo variant and add the default
/// null filters.
pub fn adjust_query(kind: ChartKind, spec: &QuerySpec, query: &mut QueryObject) -> Result<(), VizError> {
    let spatials = required_spatial(kind, spec)?;
    let mut cols: Vec<String> = Vec::new();
    for spatial in &spatials {
        cols.extend(spatial.columns().iter().map(|c| c.to_string()));
    }
    match kind {
        ChartKind::GeoPath | ChartKind::GeoPolygon => {
            let line = spec
                .line_column
                .clone()
                .ok_or_else(|| VizError::validation("line column is required"))?;
            cols.push(line);
        }
        ChartKind::GeoJson => {
            let geojson = spec
                .geojson
                .clone()
                .ok_or_else(|| VizError::validation("geojson column is required"))?;
            cols.push(geojson);
        }
        _ => {}
    }
    if let Some(dim) = &spec.dimension {
        cols.push(dim.clone());
    }
    cols.extend(spec.js_columns.iter().cloned());
    let cols = crate::query::dedup_columns(&[&cols]);

    // A metric-driven radius must come back as a result column.
    if let Some(FixedOrMetric::Metric { value }) = &spec.point_radius_fixed {
        if !query.metrics.iter().any(|m| m.label() == value.label()) {
            query.metrics.push(value.clone());
        }
    }

    if query.metrics.is_empty() {
        query.columns = cols;
        query.groupby.clear();
    } else {
        query.groupby = cols;
        query.columns.clear();
    }
    if spec.filter_nulls {
        let spatial_cols: Vec<&str> =
            spatials.iter().flat_map(|s| s.columns()).collect();
        push_not_null_filters(query, &spatial_cols);
    }
    Ok(())
}

/// Per-row `[lon, lat]` positions for one spatial encoding.
fn resolve_positions(df: &DataFrame, spatial: &SpatialSpec) -> Result<Vec<Option<[f64; 2]>>, VizError> {
    let mut out: Vec<Option<[f64; 2]>> = Vec::with_capacity(df.height());
    match spatial {
        SpatialSpec::LatLong { lat_col, lon_col, .. } => {
            let lat = column_f64(df, lat_col)?;
            let lon = column_f64(df, lon_col)?;
            for i in 0..df.height() {
                out.push(match (lon[i], lat[i]) {
                    (Some(lon), Some(lat)) => Some([lon, lat]),
                    _ => None,
                });
            }
        }
        SpatialSpec::Delimited { lon_lat_col, .. } => {
            let raw = column_str(df, lon_lat_col)?;
            for cell in raw {
                let pair = cell.as_deref().and_then(|s| {
                    let mut it = s.split(',');
                    let a = it.next()?.trim().parse::<f64>().ok()?;
                    let b = it.next()?.trim().parse::<f64>().ok()?;
                    Some([a, b])
                });
                out.push(pair);
            }
        }
        SpatialSpec::Geohash { geohash_col, .. } => {
            let raw = column_str(df, geohash_col)?;
            for cell in raw {
                out.push(
                    cell.as_deref()
                        .and_then(decode_geohash)
                        .map(|(lat, lon, _, _)| [lon, lat]),
                );
            }
        }
    }
    if spatial.reverse() {
        for p in out.iter_mut().flatten() {
            p.swap(0, 1);
        }
    }
    Ok(out)
}

fn per_row_values(df: &DataFrame, source: &ValueSource, default: f64) -> Result<Vec<f64>, VizError> {
    Ok(match source {
        ValueSource::Fixed(v) => vec![*v; df.height()],
        ValueSource::Column(label) => {
            column_f64(df, label)?.into_iter().map(|v| v.unwrap_or(default)).collect()
        }
    })
}

fn attach_extras(
    feature: &mut Map<String, Value>,
    df: &DataFrame,
    row: usize,
    spec: &QuerySpec,
) -> Result<(), VizError> {
    if let Some(dim) = &spec.dimension {
        let col = df.column(dim.as_str()).map_err(|e| VizError::execution(e.to_string()))?;
        let av = col.get(row).map_err(|e| VizError::execution(e.to_string()))?;
        feature.insert("cat_color".into(), cell_to_json(&av));
    }
    for name in &spec.js_columns {
        let col = df.column(name.as_str()).map_err(|e| VizError::execution(e.to_string()))?;
        let av = col.get(row).map_err(|e| VizError::execution(e.to_string()))?;
        feature.insert(name.clone(), cell_to_json(&av));
    }
    Ok(())
}

fn point_features(plan: &ChartPlan, df: &DataFrame) -> Result<Vec<Value>, VizError> {
    let spatial = plan
        .spec
        .spatial
        .as_ref()
        .ok_or_else(|| VizError::validation("spatial is required"))?;
    let positions = resolve_positions(df, spatial)?;

    let features = match plan.kind {
        ChartKind::GeoScatter => {
            let radius = value_source(&plan.spec.point_radius_fixed, 1.0);
            let radii = per_row_values(df, &radius, 1.0)?;
            let metric = plan.metric_labels.first();
            let metric_vals = match metric {
                Some(label) => Some(column_f64(df, label)?),
                None => None,
            };
            let mut out = Vec::new();
            for (row, pos) in positions.iter().enumerate() {
                let pos = match pos {
                    Some(p) => p,
                    None => continue,
                };
                let mut f = Map::new();
                f.insert("position".into(), json!(pos));
                f.insert("radius".into(), json!(radii[row]));
                if let Some(vals) = &metric_vals {
                    f.insert("metric".into(), json!(vals[row]));
                }
                attach_extras(&mut f, df, row, &plan.spec)?;
                out.push(Value::Object(f));
            }
            out
        }
        // Weighted point variants share one shape.
        _ => {
            let weights = match plan.metric_labels.first() {
                Some(label) => column_f64(df, label)?,
                None => vec![Some(1.0); df.height()],
            };
            let mut out = Vec::new();
            for (row, pos) in positions.iter().enumerate() {
                let pos = match pos {
                    Some(p) => p,
                    None => continue,
                };
                let mut f = Map::new();
                f.insert("position".into(), json!(pos));
                f.insert("weight".into(), json!(weights[row].unwrap_or(1.0)));
                attach_extras(&mut f, df, row, &plan.spec)?;
                out.push(Value::Object(f));
            }
            out
        }
    };
    Ok(features)
}

fn arc_features(plan: &ChartPlan, df: &DataFrame) -> Result<Vec<Value>, VizError> {
    let start = plan
        .spec
        .start_spatial
        .as_ref()
        .ok_or_else(|| VizError::validation("start spatial is required"))?;
    let end = plan
        .spec
        .end_spatial
        .as_ref()
        .ok_or_else(|| VizError::validation("end spatial is required"))?;
    let sources = resolve_positions(df, start)?;
    let targets = resolve_positions(df, end)?;
    let mut out = Vec::new();
    for row in 0..df.height() {
        let (s, t) = match (&sources[row], &targets[row]) {
            (Some(s), Some(t)) => (s, t),
            _ => continue,
        };
        let mut f = Map::new();
        f.insert("sourcePosition".into(), json!(s));
        f.insert("targetPosition".into(), json!(t));
        attach_extras(&mut f, df, row, &plan.spec)?;
        out.push(Value::Object(f));
    }
    Ok(out)
}

/// A geohash renders as the closed ring of its cell corners, `[lon, lat]`.
fn geohash_ring(code: &str) -> Option<Vec<[f64; 2]>> {
    let (lat, lon, lat_err, lon_err) = decode_geohash(code)?;
    let (s, n) = (lat - lat_err, lat + lat_err);
    let (w, e) = (lon - lon_err, lon + lon_err);
    Some(vec![[w, n], [e, n], [e, s], [w, s], [w, n]])
}

fn decode_line(cell: &str, line_type: &str, reverse: bool) -> Option<Vec<[f64; 2]>> {
    let mut line: Vec<[f64; 2]> = match line_type {
        "geohash" => geohash_ring(cell)?,
        _ => {
            let parsed: Vec<Vec<f64>> = serde_json::from_str(cell).ok()?;
            parsed.into_iter().filter(|p| p.len() >= 2).map(|p| [p[0], p[1]]).collect()
        }
    };
    if reverse {
        for p in &mut line {
            p.swap(0, 1);
        }
    }
    Some(line)
}

fn line_features(plan: &ChartPlan, df: &DataFrame, key: &str) -> Result<Vec<Value>, VizError> {
    let line_col = plan
        .spec
        .line_column
        .as_ref()
        .ok_or_else(|| VizError::validation("line column is required"))?;
    let line_type = plan.spec.line_type.as_deref().unwrap_or("json");
    let cells = column_str(df, line_col)?;
    let mut out = Vec::new();
    for (row, cell) in cells.iter().enumerate() {
        let line = match cell.as_deref().and_then(|c| decode_line(c, line_type, plan.spec.reverse_long_lat)) {
            Some(l) => l,
            None => continue,
        };
        let mut f = Map::new();
        f.insert(key.into(), json!(line));
        attach_extras(&mut f, df, row, &plan.spec)?;
        out.push(Value::Object(f));
    }
    Ok(out)
}

fn geojson_features(plan: &ChartPlan, df: &DataFrame) -> Result<Vec<Value>, VizError> {
    let col = plan
        .spec
        .geojson
        .as_ref()
        .ok_or_else(|| VizError::validation("geojson column is required"))?;
    let cells = column_str(df, col)?;
    Ok(cells
        .iter()
        .filter_map(|c| c.as_deref())
        .filter_map(|c| serde_json::from_str::<Value>(c).ok())
        .collect())
}

pub fn geo(plan: &ChartPlan, df: &DataFrame) -> Result<Value, VizError> {
    let features = match plan.kind {
        ChartKind::GeoArc => arc_features(plan, df)?,
        ChartKind::GeoPath => line_features(plan, df, "path")?,
        ChartKind::GeoPolygon => line_features(plan, df, "polygon")?,
        ChartKind::GeoJson => geojson_features(plan, df)?,
        _ => point_features(plan, df)?,
    };
    Ok(json!({"features": features}))
}
