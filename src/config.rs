//! Engine configuration.

use std::time::Duration;

/// Tunables for the search core.
///
/// Capacities and widths are construction-time invariants: a zero capacity
/// or zero window is a programmer error and asserts at startup rather than
/// surfacing as a recoverable runtime error.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Number of most-recent commits with data considered "live".
    pub window_size: usize,
    /// Width of a tile in commit ids.
    pub tile_width: i64,
    /// Corpora that get materialized views.
    pub view_corpora: Vec<String>,

    /// Capacity of the commit metadata lookup cache.
    pub commit_cache_capacity: usize,
    /// Capacity of the trace key-set lookup cache.
    pub trace_cache_capacity: usize,
    /// Capacity of the option key-set lookup cache.
    pub option_cache_capacity: usize,
    /// Capacity of the grouping key-set lookup cache.
    pub grouping_cache_capacity: usize,
    /// Time-to-live for whole-paramset cache entries.
    pub paramset_ttl: Duration,

    /// Refresh interval for the digests-on-primary set.
    pub digests_refresh_interval: Duration,
    /// Refresh interval for the publicly-visible trace set.
    pub public_refresh_interval: Duration,
    /// Refresh interval for materialized views.
    pub view_refresh_interval: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            tile_width: 100,
            view_corpora: Vec::new(),
            commit_cache_capacity: 2_000,
            trace_cache_capacity: 10_000,
            option_cache_capacity: 1_000,
            grouping_cache_capacity: 5_000,
            paramset_ttl: Duration::from_secs(5 * 60),
            digests_refresh_interval: Duration::from_secs(60),
            public_refresh_interval: Duration::from_secs(60),
            view_refresh_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl SearchConfig {
    /// Load config from `VTRIAGE_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(val) = dotenvy::var("VTRIAGE_WINDOW_SIZE")
            && let Ok(n) = val.parse()
        {
            cfg.window_size = n;
        }

        if let Ok(val) = dotenvy::var("VTRIAGE_TILE_WIDTH")
            && let Ok(n) = val.parse()
        {
            cfg.tile_width = n;
        }

        if let Ok(val) = dotenvy::var("VTRIAGE_VIEW_CORPORA") {
            cfg.view_corpora = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(val) = dotenvy::var("VTRIAGE_PARAMSET_TTL_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.paramset_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("VTRIAGE_DIGESTS_REFRESH_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.digests_refresh_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("VTRIAGE_PUBLIC_REFRESH_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.public_refresh_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("VTRIAGE_VIEW_REFRESH_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.view_refresh_interval = Duration::from_secs(secs);
        }

        cfg
    }

    /// Panics on misconfiguration that can only come from programmer error.
    pub(crate) fn validate(&self) {
        assert!(self.window_size > 0, "window_size must be positive");
        assert!(self.tile_width > 0, "tile_width must be positive");
        assert!(
            self.commit_cache_capacity > 0
                && self.trace_cache_capacity > 0
                && self.option_cache_capacity > 0
                && self.grouping_cache_capacity > 0,
            "cache capacities must be positive"
        );
    }
}
