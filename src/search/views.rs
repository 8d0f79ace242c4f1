//! Per-corpus materialized views.
//!
//! Two tables per configured corpus pre-join the hot filters: unignored
//! traces at head, and the subset of those whose digest is still untriaged.
//! The query builder substitutes the unignored view opportunistically;
//! everything else keeps working if the views are missing or stale.

use std::sync::Arc;

use anyhow::{Context, Result};
use fxhash::FxHashSet;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::search::RequestError;
use crate::storage::Store;

/// Corpus names become table-name fragments, so the allow-list here is
/// stricter than the filter sanitizer: identifier characters only.
static SAFE_TABLE_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

fn table_fragment(corpus: &str) -> Result<&str, RequestError> {
    if SAFE_TABLE_FRAGMENT.is_match(corpus) {
        Ok(corpus)
    } else {
        Err(RequestError::UnsafeCorpus(corpus.to_string()))
    }
}

/// Names of the view tables for one corpus.
fn unignored_table_name(corpus: &str) -> String {
    format!("mv_unignored_{corpus}")
}

fn untriaged_table_name(corpus: &str) -> String {
    format!("mv_untriaged_{corpus}")
}

/// Which corpora currently have materialized views.  Handed to the query
/// builder so it can substitute a view without talking to the manager.
#[derive(Debug, Clone, Default)]
pub struct ViewCatalog {
    corpora: FxHashSet<String>,
}

impl ViewCatalog {
    /// Table to read instead of the corpus/ignore/head scaffold, if a view
    /// covers this corpus.
    pub fn unignored_table(&self, corpus: &str) -> Option<String> {
        if self.corpora.contains(corpus) {
            Some(unignored_table_name(corpus))
        } else {
            None
        }
    }

    pub fn untriaged_table(&self, corpus: &str) -> Option<String> {
        if self.corpora.contains(corpus) {
            Some(untriaged_table_name(corpus))
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.corpora.is_empty()
    }
}

/// Owns the `mv_*` tables: creates them idempotently at construction and
/// refreshes them all on demand (the background refresher calls
/// [`refresh_all`] on a fixed interval).
pub struct MaterializedViews {
    store: Arc<Store>,
    corpora: Vec<String>,
    window_size: usize,
}

impl MaterializedViews {
    /// Validate corpus names and create the view tables if missing.
    pub fn new(store: Arc<Store>, corpora: Vec<String>, window_size: usize) -> Result<Self> {
        for corpus in &corpora {
            table_fragment(corpus)?;
        }
        let conn = store.writer()?;
        for corpus in &corpora {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {unignored} (
                     trace_id    BLOB NOT NULL,
                     grouping_id BLOB NOT NULL,
                     digest      BLOB NOT NULL,
                     PRIMARY KEY (trace_id, digest)
                 );
                 CREATE TABLE IF NOT EXISTS {untriaged} (
                     trace_id    BLOB NOT NULL,
                     grouping_id BLOB NOT NULL,
                     digest      BLOB NOT NULL,
                     PRIMARY KEY (trace_id, digest)
                 );",
                unignored = unignored_table_name(corpus),
                untriaged = untriaged_table_name(corpus),
            ))
            .with_context(|| format!("creating views for corpus {corpus}"))?;
        }
        drop(conn);
        if !corpora.is_empty() {
            info!(corpora = ?corpora, "materialized views ready");
        }
        Ok(Self {
            store,
            corpora,
            window_size,
        })
    }

    pub fn catalog(&self) -> ViewCatalog {
        ViewCatalog {
            corpora: self.corpora.iter().cloned().collect(),
        }
    }

    /// Refresh every configured view concurrently.  All refreshes run to
    /// completion; the first failure (if any) is reported afterwards.
    pub fn refresh_all(&self) -> Result<()> {
        if self.corpora.is_empty() {
            return Ok(());
        }
        let results: Vec<(String, Result<()>)> = self
            .corpora
            .par_iter()
            .map(|corpus| (corpus.clone(), self.refresh_corpus(corpus)))
            .collect();
        let mut first_err = None;
        for (corpus, result) in results {
            match result {
                Ok(()) => debug!(corpus = %corpus, "view refreshed"),
                Err(e) => {
                    warn!(corpus = %corpus, error = %e, "view refresh failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rebuild both views for one corpus inside a single transaction so
    /// readers observe either the old or the new contents.
    fn refresh_corpus(&self, corpus: &str) -> Result<()> {
        let conn = self.store.writer()?;
        let window_start: i64 = conn
            .query_row(
                "SELECT COALESCE(MIN(commit_id), 0) FROM
                 (SELECT commit_id FROM CommitsWithData ORDER BY commit_id DESC LIMIT ?)",
                [self.window_size as i64],
                |r| r.get(0),
            )
            .context("resolving window start for view refresh")?;

        let unignored = unignored_table_name(corpus);
        let untriaged = untriaged_table_name(corpus);
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let refresh = (|| -> Result<()> {
            conn.execute(&format!("DELETE FROM {unignored}"), [])?;
            conn.execute(
                &format!(
                    "INSERT INTO {unignored} (trace_id, grouping_id, digest)
                     SELECT trace_id, grouping_id, digest FROM ValuesAtHead
                     WHERE corpus = ?1 AND COALESCE(matches_any_ignore_rule, 0) = 0
                       AND most_recent_commit_id >= ?2"
                ),
                rusqlite::params![corpus, window_start],
            )?;
            conn.execute(&format!("DELETE FROM {untriaged}"), [])?;
            conn.execute(
                &format!(
                    "INSERT INTO {untriaged} (trace_id, grouping_id, digest)
                     SELECT v.trace_id, v.grouping_id, v.digest FROM ValuesAtHead v
                     LEFT JOIN Expectations e
                       ON e.grouping_id = v.grouping_id AND e.digest = v.digest
                     WHERE v.corpus = ?1 AND COALESCE(v.matches_any_ignore_rule, 0) = 0
                       AND v.most_recent_commit_id >= ?2
                       AND COALESCE(e.label, 'u') = 'u'"
                ),
                rusqlite::params![corpus, window_start],
            )?;
            Ok(())
        })();
        match refresh {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e).with_context(|| format!("refreshing views for corpus {corpus}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn catalog_only_knows_configured_corpora() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).unwrap());
        let views = MaterializedViews::new(store, vec!["gm".into()], 10).unwrap();
        let catalog = views.catalog();
        assert_eq!(catalog.unignored_table("gm").unwrap(), "mv_unignored_gm");
        assert!(catalog.unignored_table("svg").is_none());
    }

    #[test]
    fn rejects_unsafe_corpus_name() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).unwrap());
        let err = MaterializedViews::new(store, vec!["gm; DROP TABLE Traces".into()], 10);
        assert!(err.is_err());
    }

    #[test]
    fn refresh_of_empty_corpus_set_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).unwrap());
        let views = MaterializedViews::new(store, Vec::new(), 10).unwrap();
        views.refresh_all().unwrap();
    }
}
