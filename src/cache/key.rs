//! Cache key derivation.
//!
//! The key fingerprints the query object plus contextual modifiers. Resolved
//! absolute bounds are volatile (two requests for "last 7 days" issued a day
//! apart differ only there), so they are stripped and the raw requested time
//! expressions are hashed instead. The dataset's modification timestamp and
//! the row-level-security fingerprint ARE included so stale or
//! access-inconsistent results are never served. Keys are shared across users
//! and double as cache-poisoning-resistant identifiers, hence a cryptographic
//! digest rather than a fast hash.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::query::QueryObject;

/// Fields of a query object that change with the wall clock.
const VOLATILE_FIELDS: [&str; 4] = ["from_dttm", "to_dttm", "inner_from_dttm", "inner_to_dttm"];

/// Contextual modifiers folded into every key.
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub datasource_uid: String,
    pub changed_on: Option<DateTime<Utc>>,
    pub rls_fingerprint: String,
    /// Raw requested time expressions, exactly as the user supplied them.
    /// Equivalent windows phrased differently will not share an entry.
    pub time_range: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub time_shift: Option<String>,
    pub extra_cache_keys: Vec<Value>,
}

/// Derive the cache key for a query object. `extra` carries per-request
/// disambiguators (e.g. a time-comparison offset). Serialization sorts map
/// keys, so field order never affects the digest.
pub fn cache_key(query: &QueryObject, ctx: &KeyContext, extra: &BTreeMap<String, Value>) -> String {
    // serde_json maps are BTreeMaps, so round-tripping through Value is
    // already a canonical, key-sorted form.
    let mut cache_map: BTreeMap<String, Value> = match serde_json::to_value(query) {
        Ok(Value::Object(m)) => m.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    for k in VOLATILE_FIELDS {
        cache_map.remove(k);
    }
    for (k, v) in extra {
        cache_map.insert(k.clone(), v.clone());
    }
    cache_map.insert("time_range".into(), Value::from(ctx.time_range.clone()));
    cache_map.insert("since".into(), Value::from(ctx.since.clone()));
    cache_map.insert("until".into(), Value::from(ctx.until.clone()));
    cache_map.insert("time_shift".into(), Value::from(ctx.time_shift.clone()));
    cache_map.insert("datasource".into(), Value::from(ctx.datasource_uid.clone()));
    cache_map.insert(
        "changed_on".into(),
        Value::from(ctx.changed_on.map(|d| d.to_rfc3339())),
    );
    cache_map.insert("rls".into(), Value::from(ctx.rls_fingerprint.clone()));
    cache_map.insert("extra_cache_keys".into(), Value::from(ctx.extra_cache_keys.clone()));

    let json = serde_json::to_string(&cache_map).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}
