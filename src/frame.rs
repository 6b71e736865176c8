//! DataFrame helpers shared by the pipeline and the shapers.
//!
//! Results flow through as Polars frames; the time axis column
//! (`__timestamp`) is epoch milliseconds (Int64) by convention, so row access
//! only ever needs the scalar `AnyValue` variants handled here.

use polars::prelude::*;
use serde_json::{Map, Value};

use crate::config::JS_MAX_INTEGER;
use crate::error::VizError;

/// Convert one cell to JSON. Integers beyond the JS-safe range are emitted as
/// strings to avoid silent precision loss at the consumer boundary.
pub fn cell_to_json(av: &AnyValue) -> Value {
    match av {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(*b),
        AnyValue::Int8(v) => Value::from(*v as i64),
        AnyValue::Int16(v) => Value::from(*v as i64),
        AnyValue::Int32(v) => Value::from(*v as i64),
        AnyValue::Int64(v) => {
            if v.abs() > JS_MAX_INTEGER {
                Value::String(v.to_string())
            } else {
                Value::from(*v)
            }
        }
        AnyValue::UInt8(v) => Value::from(*v as u64),
        AnyValue::UInt16(v) => Value::from(*v as u64),
        AnyValue::UInt32(v) => Value::from(*v as u64),
        AnyValue::UInt64(v) => {
            if *v > JS_MAX_INTEGER as u64 {
                Value::String(v.to_string())
            } else {
                Value::from(*v)
            }
        }
        AnyValue::Float32(v) => {
            if v.is_finite() { Value::from(*v as f64) } else { Value::Null }
        }
        AnyValue::Float64(v) => {
            if v.is_finite() { Value::from(*v) } else { Value::Null }
        }
        AnyValue::String(s) => Value::String((*s).to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        other => Value::String(format!("{other}")),
    }
}

/// Numeric view of one cell; strings are parsed, everything non-coercible is
/// None (never an error).
pub fn cell_to_f64(av: &AnyValue) -> Option<f64> {
    match av {
        AnyValue::Int8(v) => Some(*v as f64),
        AnyValue::Int16(v) => Some(*v as f64),
        AnyValue::Int32(v) => Some(*v as f64),
        AnyValue::Int64(v) => Some(*v as f64),
        AnyValue::UInt8(v) => Some(*v as f64),
        AnyValue::UInt16(v) => Some(*v as f64),
        AnyValue::UInt32(v) => Some(*v as f64),
        AnyValue::UInt64(v) => Some(*v as f64),
        AnyValue::Float32(v) => Some(*v as f64).filter(|x| x.is_finite()),
        AnyValue::Float64(v) => Some(*v).filter(|x| x.is_finite()),
        AnyValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        AnyValue::String(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        AnyValue::StringOwned(s) => s.as_str().trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    }
}

fn missing_column(name: &str) -> VizError {
    VizError::validation(format!("column not found in result: {name}"))
}

pub fn column_f64(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, VizError> {
    let col = df.column(name).map_err(|_| missing_column(name))?;
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let av = col.get(i).map_err(|e| VizError::execution(e.to_string()))?;
        out.push(cell_to_f64(&av));
    }
    Ok(out)
}

pub fn column_str(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, VizError> {
    let col = df.column(name).map_err(|_| missing_column(name))?;
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let av = col.get(i).map_err(|e| VizError::execution(e.to_string()))?;
        let s = match av {
            AnyValue::Null => None,
            AnyValue::String(s) => Some(s.to_string()),
            AnyValue::StringOwned(s) => Some(s.to_string()),
            other => Some(format!("{other}")),
        };
        out.push(s);
    }
    Ok(out)
}

/// Epoch-millisecond view of a column (the `__timestamp` convention).
pub fn column_i64(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>, VizError> {
    let col = df.column(name).map_err(|_| missing_column(name))?;
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let av = col.get(i).map_err(|e| VizError::execution(e.to_string()))?;
        let v = match av {
            AnyValue::Int32(v) => Some(v as i64),
            AnyValue::Int64(v) => Some(v),
            AnyValue::UInt32(v) => Some(v as i64),
            AnyValue::UInt64(v) => Some(v as i64),
            AnyValue::Float64(v) if v.is_finite() => Some(v as i64),
            _ => None,
        };
        out.push(v);
    }
    Ok(out)
}

/// Convert a frame into JSON records, one map per row.
pub fn records(df: &DataFrame) -> Result<Vec<Map<String, Value>>, VizError> {
    let cols: Vec<String> = df.get_column_names().into_iter().map(|s| s.to_string()).collect();
    let mut out: Vec<Map<String, Value>> = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let mut row = Map::new();
        for c in &cols {
            let col = df.column(c.as_str()).map_err(|e| VizError::execution(e.to_string()))?;
            let av = col.get(i).map_err(|e| VizError::execution(e.to_string()))?;
            row.insert(c.clone(), cell_to_json(&av));
        }
        out.push(row);
    }
    Ok(out)
}

pub fn colnames(df: &DataFrame) -> Vec<String> {
    df.get_column_names().into_iter().map(|s| s.to_string()).collect()
}

pub fn coltypes(df: &DataFrame) -> Vec<String> {
    df.dtypes().iter().map(|d| d.to_string()).collect()
}

/// Coerce metric columns to Float64. Columns already numeric are left alone;
/// string columns are parsed per cell with non-coercible values becoming null.
pub fn coerce_metrics_to_num(df: &mut DataFrame, metric_labels: &[String]) -> Result<(), VizError> {
    for label in metric_labels {
        let dtype = match df.column(label.as_str()) {
            Ok(col) => col.dtype().clone(),
            Err(_) => continue,
        };
        if dtype.is_primitive_numeric() {
            continue;
        }
        let values = column_f64(df, label)?;
        let s = Series::new(label.as_str().into(), values);
        df.with_column(s).map_err(|e| VizError::execution(e.to_string()))?;
    }
    Ok(())
}

/// Replace non-finite floats with null across all float columns.
pub fn normalize_infinities(df: &mut DataFrame) -> Result<(), VizError> {
    let names = colnames(df);
    for name in names {
        let col = df.column(name.as_str()).map_err(|e| VizError::execution(e.to_string()))?;
        if !matches!(col.dtype(), DataType::Float32 | DataType::Float64) {
            continue;
        }
        let values = column_f64(df, &name)?;
        let s = Series::new(name.as_str().into(), values);
        df.with_column(s).map_err(|e| VizError::execution(e.to_string()))?;
    }
    Ok(())
}
