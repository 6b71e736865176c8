//! Server-side configuration for query building and caching.

use serde::Deserialize;

/// Integers beyond this magnitude lose precision in IEEE-754 doubles, which is
/// what the JS consumer boundary uses. Larger values are serialized as strings.
pub const JS_MAX_INTEGER: i64 = (1i64 << 53) - 1;

/// Canonical name of the resolved time axis column in query results.
pub const DTTM_ALIAS: &str = "__timestamp";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VizConfig {
    /// Row limit applied when the spec does not request one.
    pub row_limit_default: usize,
    /// Hard ceiling applied regardless of the requested limit.
    pub row_limit_ceiling: usize,
    /// Row limit used for raw sample retrieval.
    pub samples_row_limit: usize,
    /// Global default cache TTL in seconds. `-1` disables caching entirely.
    pub cache_default_timeout: i64,
}

impl Default for VizConfig {
    fn default() -> Self {
        Self {
            row_limit_default: 10_000,
            row_limit_ceiling: 50_000,
            samples_row_limit: 1_000,
            cache_default_timeout: 86_400,
        }
    }
}

impl VizConfig {
    /// Clamp a requested row limit to the server ceiling, falling back to the
    /// default when absent or zero.
    pub fn resolve_row_limit(&self, requested: Option<usize>) -> usize {
        let limit = match requested {
            Some(0) | None => self.row_limit_default,
            Some(n) => n,
        };
        limit.min(self.row_limit_ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_limit_ceiling_applies() {
        let cfg = VizConfig::default();
        assert_eq!(cfg.resolve_row_limit(Some(10_000_000)), 50_000);
        assert_eq!(cfg.resolve_row_limit(Some(100)), 100);
        assert_eq!(cfg.resolve_row_limit(None), 10_000);
        assert_eq!(cfg.resolve_row_limit(Some(0)), 10_000);
    }
}
