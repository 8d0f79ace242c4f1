//! Shared fixture for the end-to-end suites: a temp-dir SQLite database
//! populated through the same writer connection the view refresher uses.
#![allow(dead_code)]

use std::sync::Arc;

use rusqlite::Connection;
use tempfile::TempDir;

use vtriage::config::SearchConfig;
use vtriage::model::types::{
    CORPUS_KEY, Digest, GroupingId, Params, TEST_KEY, TraceId, tile_for_commit,
};
use vtriage::search::engine::SearchEngine;
use vtriage::storage::Store;

pub const TILE_WIDTH: i64 = 100;

/// Readable fixed digests for assertions.
pub fn digest(seed: u8) -> Digest {
    Digest([seed; 16])
}

pub fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A populated triage database on disk.  All inserts go through `writer()`
/// so the WAL pragmas match production.
pub struct Fixture {
    _dir: TempDir,
    pub store: Arc<Store>,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("create temp dir");
        let store = Arc::new(Store::open(dir.path().join("triage.db")).expect("open store"));
        Self { _dir: dir, store }
    }

    pub fn writer(&self) -> Connection {
        self.store.writer().expect("writer connection")
    }

    /// Build an engine over this fixture.  Insert all data first; the
    /// constructor populates the swap caches synchronously.
    pub fn engine(&self, window_size: usize, view_corpora: &[&str]) -> SearchEngine {
        let cfg = SearchConfig {
            window_size,
            tile_width: TILE_WIDTH,
            view_corpora: view_corpora.iter().map(|s| s.to_string()).collect(),
            ..SearchConfig::default()
        };
        SearchEngine::new(self.store.clone(), cfg, None).expect("build engine")
    }

    /// Engine with a public view: only traces the matcher admits are
    /// visible.
    pub fn engine_with_matcher(
        &self,
        window_size: usize,
        matcher: impl Fn(&Params) -> bool + Send + Sync + 'static,
    ) -> SearchEngine {
        let cfg = SearchConfig {
            window_size,
            tile_width: TILE_WIDTH,
            ..SearchConfig::default()
        };
        SearchEngine::new(self.store.clone(), cfg, Some(Arc::new(matcher)))
            .expect("build engine with public view")
    }

    /// Landed commits, all carrying data.
    pub fn add_commits(&self, ids: &[i64]) {
        for &id in ids {
            self.add_commit_without_data(id);
            self.writer()
                .execute(
                    "INSERT OR IGNORE INTO CommitsWithData (commit_id) VALUES (?)",
                    [id],
                )
                .expect("insert commit-with-data");
        }
    }

    /// A landed commit that never received data.
    pub fn add_commit_without_data(&self, id: i64) {
        self.writer()
            .execute(
                "INSERT OR IGNORE INTO Commits
                 (commit_id, git_hash, commit_time, author, subject)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    id,
                    format!("{id:040x}"),
                    1_700_000_000 + id,
                    "author@example.com",
                    format!("commit {id}")
                ],
            )
            .expect("insert commit");
    }

    /// Insert a trace plus its per-commit history.  The newest present
    /// digest becomes the value at head.  Returns (trace, grouping).
    pub fn add_trace(
        &self,
        test_name: &str,
        corpus: &str,
        extra_keys: &[(&str, &str)],
        history: &[(i64, Option<Digest>)],
    ) -> (TraceId, GroupingId) {
        let grouping_params = params(&[(CORPUS_KEY, corpus), (TEST_KEY, test_name)]);
        let grouping = GroupingId::from_params(&grouping_params);
        let mut trace_params = grouping_params.clone();
        for (k, v) in extra_keys {
            trace_params.insert(k.to_string(), v.to_string());
        }
        let trace = TraceId::from_params(&trace_params);

        let conn = self.writer();
        conn.execute(
            "INSERT OR IGNORE INTO Groupings (grouping_id, keys) VALUES (?, ?)",
            rusqlite::params![grouping, serde_json::to_string(&grouping_params).unwrap()],
        )
        .expect("insert grouping");
        let keys_json = serde_json::to_string(&trace_params).unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO Traces
             (trace_id, grouping_id, corpus, keys, matches_any_ignore_rule)
             VALUES (?, ?, ?, ?, 0)",
            rusqlite::params![trace, grouping, corpus, keys_json],
        )
        .expect("insert trace");

        let mut head: Option<(i64, Digest)> = None;
        for &(commit_id, digest) in history {
            let Some(digest) = digest else { continue };
            conn.execute(
                "INSERT OR REPLACE INTO TraceValues (trace_id, commit_id, digest, option_id)
                 VALUES (?, ?, ?, NULL)",
                rusqlite::params![trace, commit_id, digest],
            )
            .expect("insert trace value");
            conn.execute(
                "INSERT OR IGNORE INTO TiledTraceDigests (tile_id, trace_id, grouping_id, digest)
                 VALUES (?, ?, ?, ?)",
                rusqlite::params![tile_for_commit(commit_id, TILE_WIDTH), trace, grouping, digest],
            )
            .expect("insert tiled digest");
            head = Some((commit_id, digest));
        }
        if let Some((commit_id, digest)) = head {
            conn.execute(
                "INSERT OR REPLACE INTO ValuesAtHead
                 (trace_id, grouping_id, corpus, keys, digest, option_id,
                  most_recent_commit_id, matches_any_ignore_rule)
                 VALUES (?, ?, ?, ?, ?, NULL, ?, 0)",
                rusqlite::params![trace, grouping, corpus, keys_json, digest, commit_id],
            )
            .expect("insert value at head");
        }
        (trace, grouping)
    }

    /// Flip a trace to ignored in both the trace table and at head.
    pub fn mark_ignored(&self, trace: TraceId) {
        let conn = self.writer();
        conn.execute(
            "UPDATE Traces SET matches_any_ignore_rule = 1 WHERE trace_id = ?",
            [trace],
        )
        .expect("mark trace ignored");
        conn.execute(
            "UPDATE ValuesAtHead SET matches_any_ignore_rule = 1 WHERE trace_id = ?",
            [trace],
        )
        .expect("mark head ignored");
    }

    pub fn triage(&self, grouping: GroupingId, digest: Digest, label: &str) {
        self.writer()
            .execute(
                "INSERT OR REPLACE INTO Expectations (grouping_id, digest, label)
                 VALUES (?, ?, ?)",
                rusqlite::params![grouping, digest, label],
            )
            .expect("insert expectation");
    }

    /// Symmetric diff-metric rows for one digest pair.
    pub fn add_diff(&self, left: Digest, right: Digest, max_channel_diff: i64, metric: f64) {
        let conn = self.writer();
        for (a, b) in [(left, right), (right, left)] {
            conn.execute(
                "INSERT OR REPLACE INTO DiffMetrics
                 (left_digest, right_digest, num_pixels_diff, percent_pixels_diff,
                  max_channel_diff, combined_metric)
                 VALUES (?, ?, 25, 0.5, ?, ?)",
                rusqlite::params![a, b, max_channel_diff, metric],
            )
            .expect("insert diff metric");
        }
    }

    /// Changelist with its patchsets; returns the qualified changelist id.
    pub fn add_changelist(
        &self,
        system: &str,
        cl_id: &str,
        last_ingested: i64,
        patchset_orders: &[i64],
    ) -> String {
        let qualified = format!("{system}_{cl_id}");
        let conn = self.writer();
        conn.execute(
            "INSERT OR REPLACE INTO Changelists
             (changelist_id, system, status, owner, subject, last_ingested_data)
             VALUES (?, ?, 'open', 'author@example.com', 'try something', ?)",
            rusqlite::params![qualified, system, last_ingested],
        )
        .expect("insert changelist");
        for &order in patchset_orders {
            conn.execute(
                "INSERT OR REPLACE INTO Patchsets
                 (patchset_id, changelist_id, ps_order, git_hash)
                 VALUES (?, ?, ?, ?)",
                rusqlite::params![
                    patchset_id(system, cl_id, order),
                    qualified,
                    order,
                    format!("{order:040x}")
                ],
            )
            .expect("insert patchset");
        }
        qualified
    }

    /// One data point produced by a patchset for an existing trace.
    pub fn add_cl_value(
        &self,
        qualified_cl: &str,
        patchset_id: &str,
        trace: TraceId,
        grouping: GroupingId,
        digest: Digest,
    ) {
        self.writer()
            .execute(
                "INSERT OR REPLACE INTO SecondaryBranchValues
                 (branch_name, version_name, trace_id, grouping_id, digest, option_id)
                 VALUES (?, ?, ?, ?, ?, NULL)",
                rusqlite::params![qualified_cl, patchset_id, trace, grouping, digest],
            )
            .expect("insert CL value");
    }

    /// Changelist-scoped expectation overriding the primary branch.
    pub fn cl_triage(&self, qualified_cl: &str, grouping: GroupingId, digest: Digest, label: &str) {
        self.writer()
            .execute(
                "INSERT OR REPLACE INTO SecondaryBranchExpectations
                 (branch_name, grouping_id, digest, label)
                 VALUES (?, ?, ?, ?)",
                rusqlite::params![qualified_cl, grouping, digest, label],
            )
            .expect("insert CL expectation");
    }
}

/// Qualified patchset id matching what `add_changelist` inserts.
pub fn patchset_id(system: &str, cl_id: &str, order: i64) -> String {
    format!("{system}_{cl_id}_ps{order}")
}
