//! Dynamic, injection-safe construction of trace-set queries.
//!
//! A [`TraceFilter`] describes which traces a request cares about; the
//! builder turns it into one SQL statement yielding
//! `(trace_id, grouping_id, digest)` triples.  Filter keys address JSON
//! paths inside the `keys` column, so they cannot travel through parameter
//! placeholders; every key and value is checked against an allow-listed
//! character set first and rejected with a request error on any miss —
//! never silently dropped from the query.

use std::collections::BTreeMap;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;

use crate::search::RequestError;
use crate::search::context::RequestContext;
use crate::search::views::ViewCatalog;

/// Characters allowed in filter keys and values.  Everything a trace key or
/// value legitimately contains (alphanumerics, spaces, and common
/// separators); notably no quotes, backslashes, or JSON-path syntax.
static SAFE_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9 ._,=|-]+$").expect("valid regex"));

/// Which traces a request is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    /// Top-level category; must be non-empty.
    pub corpus: String,
    /// Ordered key -> allowed-values constraints (non-corpus keys).
    pub key_values: BTreeMap<String, Vec<String>>,
    /// Include traces matching an ignore rule.
    pub include_ignored: bool,
    /// Only digests currently at head, vs. everything in the tile window.
    pub at_head_only: bool,
}

/// A ready-to-run statement plus its bound parameters.
#[derive(Debug)]
pub struct TraceQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Reject any fragment outside the allow-listed character set.
pub fn check_fragment(s: &str) -> bool {
    SAFE_FRAGMENT.is_match(s)
}

fn validate_filter(filter: &TraceFilter) -> Result<(), RequestError> {
    if filter.corpus.is_empty() {
        return Err(RequestError::EmptyCorpus);
    }
    if !check_fragment(&filter.corpus) {
        return Err(RequestError::UnsafeKey(filter.corpus.clone()));
    }
    for (key, values) in &filter.key_values {
        if !check_fragment(key) {
            return Err(RequestError::UnsafeKey(key.clone()));
        }
        for value in values {
            if !check_fragment(value) {
                return Err(RequestError::UnsafeValue {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Union/intersect CTE scaffolding over the `Traces.keys` JSON column.
/// Returns the `WITH ...` prefix and pushes value parameters in text order.
fn key_ctes(key_values: &BTreeMap<String, Vec<String>>, params: &mut Vec<Value>) -> String {
    let mut with = String::from("WITH\n");
    for (i, (key, values)) in key_values.iter().enumerate() {
        if i > 0 {
            with.push_str(",\n");
        }
        with.push_str(&format!("U{i} AS ("));
        for (j, value) in values.iter().enumerate() {
            if j > 0 {
                with.push_str(" UNION ");
            }
            // Key is sanitized above; values still travel as placeholders.
            with.push_str(&format!(
                "SELECT trace_id FROM Traces WHERE json_extract(keys, '$.\"{key}\"') = ?"
            ));
            params.push(Value::Text(value.clone()));
        }
        with.push(')');
    }
    with.push_str(",\nMatching AS (");
    for i in 0..key_values.len() {
        if i > 0 {
            with.push_str(" INTERSECT ");
        }
        with.push_str(&format!("SELECT trace_id FROM U{i}"));
    }
    with.push_str(")\n");
    with
}

/// Build the primary-branch trace query for `filter`.
///
/// When a materialized view covers the corpus and the filter excludes
/// ignored traces at head, the corpus/ignore/head scaffold is substituted
/// with the view.  A filter with zero non-corpus keys bypasses the
/// union/intersect scaffolding entirely.
pub fn build_trace_query(
    filter: &TraceFilter,
    ctx: &RequestContext,
    views: Option<&ViewCatalog>,
) -> Result<TraceQuery, RequestError> {
    validate_filter(filter)?;

    let mut params: Vec<Value> = Vec::new();
    let with = if filter.key_values.is_empty() {
        String::new()
    } else {
        key_ctes(&filter.key_values, &mut params)
    };

    let view_table = match views {
        Some(catalog) if !filter.include_ignored && filter.at_head_only => {
            catalog.unignored_table(&filter.corpus)
        }
        _ => None,
    };

    let mut base_params: Vec<Value> = Vec::new();
    let base = if let Some(table) = view_table {
        format!("SELECT trace_id, grouping_id, digest FROM {table}")
    } else if filter.at_head_only {
        base_params.push(Value::Text(filter.corpus.clone()));
        base_params.push(Value::Integer(ctx.window_start().unwrap_or(0)));
        let mut sql = String::from(
            "SELECT trace_id, grouping_id, digest FROM ValuesAtHead \
             WHERE corpus = ? AND most_recent_commit_id >= ?",
        );
        if !filter.include_ignored {
            sql.push_str(" AND COALESCE(matches_any_ignore_rule, 0) = 0");
        }
        sql
    } else {
        let (start_tile, end_tile) = ctx.tile_range().unwrap_or((0, -1));
        base_params.push(Value::Text(filter.corpus.clone()));
        base_params.push(Value::Integer(start_tile));
        base_params.push(Value::Integer(end_tile));
        let mut sql = String::from(
            "SELECT DISTINCT t.trace_id, t.grouping_id, t.digest \
             FROM TiledTraceDigests t \
             JOIN Traces tr ON tr.trace_id = t.trace_id \
             WHERE tr.corpus = ? AND t.tile_id BETWEEN ? AND ?",
        );
        if !filter.include_ignored {
            sql.push_str(" AND COALESCE(tr.matches_any_ignore_rule, 0) = 0");
        }
        sql
    };

    let sql = if filter.key_values.is_empty() {
        params.extend(base_params);
        base
    } else {
        params.extend(base_params);
        format!(
            "{with}SELECT b.trace_id, b.grouping_id, b.digest FROM ({base}) b \
             JOIN Matching m ON m.trace_id = b.trace_id"
        )
    };

    Ok(TraceQuery { sql, params })
}

/// Build the secondary-branch (changelist overlay) trace query: triples
/// produced by one patchset, filtered by corpus/keys/ignore state of the
/// traces they belong to.
pub fn build_cl_trace_query(
    filter: &TraceFilter,
    changelist_id: &str,
    patchset_id: &str,
) -> Result<TraceQuery, RequestError> {
    validate_filter(filter)?;

    let mut params: Vec<Value> = Vec::new();
    let with = if filter.key_values.is_empty() {
        String::new()
    } else {
        key_ctes(&filter.key_values, &mut params)
    };

    let mut sql = format!(
        "{with}SELECT s.trace_id, s.grouping_id, s.digest \
         FROM SecondaryBranchValues s \
         JOIN Traces tr ON tr.trace_id = s.trace_id \
         WHERE s.branch_name = ? AND s.version_name = ? AND tr.corpus = ?"
    );
    params.push(Value::Text(changelist_id.to_string()));
    params.push(Value::Text(patchset_id.to_string()));
    params.push(Value::Text(filter.corpus.clone()));
    if !filter.include_ignored {
        sql.push_str(" AND COALESCE(tr.matches_any_ignore_rule, 0) = 0");
    }
    if !filter.key_values.is_empty() {
        sql.push_str(" AND s.trace_id IN (SELECT trace_id FROM Matching)");
    }

    Ok(TraceQuery { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::Commit;
    use chrono::Utc;

    fn ctx_with_commits(ids: &[i64]) -> RequestContext {
        let commits = ids
            .iter()
            .map(|&id| Commit {
                id,
                git_hash: format!("{id:040x}"),
                ts: Utc::now(),
                author: "a@b.c".into(),
                subject: "s".into(),
            })
            .collect();
        RequestContext::from_commits(commits, 100)
    }

    fn filter(corpus: &str, pairs: &[(&str, &[&str])]) -> TraceFilter {
        TraceFilter {
            corpus: corpus.to_string(),
            key_values: pairs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            include_ignored: false,
            at_head_only: true,
        }
    }

    #[test]
    fn empty_corpus_is_a_request_error() {
        let err = build_trace_query(&filter("", &[]), &ctx_with_commits(&[1]), None).unwrap_err();
        assert_eq!(err, RequestError::EmptyCorpus);
    }

    #[test]
    fn unsafe_key_is_rejected() {
        let err = build_trace_query(
            &filter("gm", &[("os'; DROP TABLE Traces; --", &["linux"])]),
            &ctx_with_commits(&[1]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::UnsafeKey(_)));
    }

    #[test]
    fn unsafe_value_is_rejected() {
        let err = build_trace_query(
            &filter("gm", &[("os", &["lin\"ux"])]),
            &ctx_with_commits(&[1]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::UnsafeValue { .. }));
    }

    #[test]
    fn zero_keys_skips_cte_scaffolding() {
        let q = build_trace_query(&filter("gm", &[]), &ctx_with_commits(&[5, 6]), None).unwrap();
        assert!(!q.sql.contains("WITH"));
        assert!(q.sql.contains("ValuesAtHead"));
        assert_eq!(q.params.len(), 2);
    }

    #[test]
    fn keys_union_within_and_intersect_across() {
        let q = build_trace_query(
            &filter("gm", &[("gpu", &["nvidia", "amd"]), ("os", &["linux"])]),
            &ctx_with_commits(&[5]),
            None,
        )
        .unwrap();
        assert!(q.sql.contains("UNION"));
        assert!(q.sql.contains("INTERSECT"));
        assert!(q.sql.contains("json_extract(keys, '$.\"gpu\"')"));
        assert!(q.sql.contains("json_extract(keys, '$.\"os\"')"));
        // 3 value params + corpus + window start
        assert_eq!(q.params.len(), 5);
    }

    #[test]
    fn windowed_mode_reads_tiles() {
        let mut f = filter("gm", &[]);
        f.at_head_only = false;
        let q = build_trace_query(&f, &ctx_with_commits(&[99, 100, 250]), None).unwrap();
        assert!(q.sql.contains("TiledTraceDigests"));
        assert!(q.sql.contains("BETWEEN"));
    }

    #[test]
    fn include_ignored_drops_ignore_clause() {
        let mut f = filter("gm", &[]);
        f.include_ignored = true;
        let q = build_trace_query(&f, &ctx_with_commits(&[5]), None).unwrap();
        assert!(!q.sql.contains("matches_any_ignore_rule"));
    }

    #[test]
    fn cl_query_scopes_to_branch_and_version() {
        let q = build_cl_trace_query(&filter("gm", &[("os", &["linux"])]), "gerrit_123", "gerrit_ps4")
            .unwrap();
        assert!(q.sql.contains("SecondaryBranchValues"));
        assert!(q.sql.contains("branch_name = ?"));
        assert_eq!(q.params.len(), 4);
    }
}
