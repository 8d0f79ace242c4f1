//! Blame attribution: which commit range most narrowly explains each
//! untriaged digest currently at head.
//!
//! For every producing trace the in-window history is scanned backward from
//! head.  The most recent previously-triaged digest marks one end; the
//! earliest appearance of the untriaged digest after it marks the other.
//! Ranges from all traces sharing a (grouping, digest) are intersected, and
//! pairs that collapse to the same commit-range string merge into one
//! ranked blame entry.

use anyhow::{Context, Result};
use fxhash::{FxHashMap, FxHashSet};
use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::debug;

use crate::model::types::{Digest, GroupingId, Params, TraceId};
use crate::search::RequestError;
use crate::search::caches::Caches;
use crate::search::context::RequestContext;
use crate::search::query::check_fragment;
use crate::search::views::ViewCatalog;
use crate::storage::sqlite::sql_placeholders;

/// Upper bound on dynamically-built IN lists.
const IN_CHUNK: usize = 500;

/// One ranked blame entry: a commit range and everything it explains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameEntry {
    /// `"<id>"` for a single commit, `"<start>:<end>"` otherwise.
    pub commit_range: String,
    /// Distinct untriaged digests merged into this entry.
    pub total_untriaged_digests: usize,
    pub affected_groupings: Vec<AffectedGrouping>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedGrouping {
    pub grouping: GroupingId,
    pub grouping_keys: Params,
    pub num_untriaged_digests: usize,
    pub sample_digest: Digest,
}

/// Result of scanning one trace's history for one untriaged digest.
struct Transition {
    /// Index of the most recent triaged digest, or `None` for start of
    /// window (new test case).
    last_triaged: Option<usize>,
    /// Earliest index at which the untriaged digest appears after the last
    /// triaged one.
    first_untriaged: usize,
}

/// Scan backward from head.  Occurrences of `digest` keep pushing
/// `first_untriaged` earlier until a triaged digest is hit; other untriaged
/// digests are skipped over.
fn find_transition(
    history: &[Option<Digest>],
    digest: Digest,
    is_triaged: impl Fn(Digest) -> bool,
) -> Option<Transition> {
    let mut last_triaged = None;
    let mut first_untriaged = None;
    for idx in (0..history.len()).rev() {
        match history[idx] {
            Some(d) if d == digest => first_untriaged = Some(idx),
            Some(d) if is_triaged(d) => {
                last_triaged = Some(idx);
                break;
            }
            _ => {}
        }
    }
    first_untriaged.map(|first_untriaged| Transition {
        last_triaged,
        first_untriaged,
    })
}

/// Render the candidate range `[start, end]` as a commit-range string.  It
/// degenerates to a single commit id when the indices are adjacent, equal,
/// or the start is the beginning of the window.
fn range_string(ctx: &RequestContext, start: Option<usize>, end: usize) -> String {
    match start {
        Some(s) if end > s + 1 => format!(
            "{}:{}",
            ctx.commit_at(s + 1).id,
            ctx.commit_at(end).id
        ),
        _ => ctx.commit_at(end).id.to_string(),
    }
}

/// Compute ranked blame entries for all untriaged digests at head in
/// `corpus`, honoring the public view.
pub fn blames_for_untriaged_digests(
    conn: &Connection,
    ctx: &RequestContext,
    caches: &Caches,
    corpus: &str,
    views: Option<&ViewCatalog>,
) -> Result<Vec<BlameEntry>> {
    if corpus.is_empty() {
        return Err(RequestError::EmptyCorpus.into());
    }
    if !check_fragment(corpus) {
        return Err(RequestError::UnsafeKey(corpus.to_string()).into());
    }
    if ctx.is_empty() {
        return Ok(Vec::new());
    }

    // Step 1: all untriaged (grouping, digest) pairs at head with their
    // producing traces, via the untriaged view when one exists.
    let rows = untriaged_at_head(conn, ctx, corpus, views)?;

    // Public-view filtering drops traces first; pairs with no remaining
    // producer drop out entirely.
    let mut producers: FxHashMap<(GroupingId, Digest), Vec<TraceId>> = FxHashMap::default();
    for (trace, grouping, digest) in rows {
        if !caches.is_publicly_visible(trace) {
            continue;
        }
        producers.entry((grouping, digest)).or_default().push(trace);
    }
    if producers.is_empty() {
        return Ok(Vec::new());
    }

    // Step 2: bulk-load trace histories and triaged expectations.
    let trace_ids: FxHashSet<TraceId> = producers.values().flatten().copied().collect();
    let histories = load_histories(conn, ctx, &trace_ids)?;

    let grouping_ids: FxHashSet<GroupingId> = producers.keys().map(|(g, _)| *g).collect();
    let triaged = load_triaged(conn, &grouping_ids)?;

    // Step 3: per (grouping, digest), intersect the per-trace transitions.
    let mut merged: FxHashMap<String, FxHashMap<GroupingId, (usize, Digest)>> =
        FxHashMap::default();
    for ((grouping, digest), traces) in &producers {
        let mut start: Option<usize> = None;
        let mut end: Option<usize> = None;
        for trace in traces {
            let Some(history) = histories.get(trace) else {
                continue;
            };
            let Some(t) = find_transition(history, *digest, |d| {
                triaged.contains(&(*grouping, d))
            }) else {
                continue;
            };
            start = match (start, t.last_triaged) {
                (cur, Some(lt)) if cur.is_none_or(|c| lt > c) => Some(lt),
                (cur, _) => cur,
            };
            end = Some(end.map_or(t.first_untriaged, |e: usize| e.min(t.first_untriaged)));
        }
        // Traces with no qualifying transition are excluded; a pair may end
        // up with none at all.
        let Some(end) = end else { continue };
        let range = range_string(ctx, start, end);
        let entry = merged.entry(range).or_default();
        let (count, sample) = entry.entry(*grouping).or_insert((0, *digest));
        *count += 1;
        if *digest < *sample {
            *sample = *digest;
        }
    }

    // Step 4: assemble and rank.
    let mut entries = Vec::with_capacity(merged.len());
    for (commit_range, groupings) in merged {
        let mut affected = Vec::with_capacity(groupings.len());
        let mut total = 0;
        for (grouping, (count, sample)) in groupings {
            total += count;
            let grouping_keys = caches
                .grouping_keys(conn, grouping)?
                .map(|p| (*p).clone())
                .unwrap_or_default();
            affected.push(AffectedGrouping {
                grouping,
                grouping_keys,
                num_untriaged_digests: count,
                sample_digest: sample,
            });
        }
        affected.sort_by(|a, b| a.grouping.cmp(&b.grouping));
        entries.push(BlameEntry {
            commit_range,
            total_untriaged_digests: total,
            affected_groupings: affected,
        });
    }
    entries.sort_by(|a, b| {
        b.total_untriaged_digests
            .cmp(&a.total_untriaged_digests)
            .then_with(|| a.commit_range.cmp(&b.commit_range))
    });
    debug!(entries = entries.len(), corpus = corpus, "blame computed");
    Ok(entries)
}

fn untriaged_at_head(
    conn: &Connection,
    ctx: &RequestContext,
    corpus: &str,
    views: Option<&ViewCatalog>,
) -> Result<Vec<(TraceId, GroupingId, Digest)>> {
    let view = views.and_then(|v| v.untriaged_table(corpus));
    let mut out = Vec::new();
    if let Some(table) = view {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT trace_id, grouping_id, digest FROM {table}"
            ))
            .context("preparing untriaged view read")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
        for row in rows {
            out.push(row?);
        }
    } else {
        let mut stmt = conn
            .prepare(
                "SELECT v.trace_id, v.grouping_id, v.digest
                 FROM ValuesAtHead v
                 LEFT JOIN Expectations e
                   ON e.grouping_id = v.grouping_id AND e.digest = v.digest
                 WHERE v.corpus = ? AND COALESCE(v.matches_any_ignore_rule, 0) = 0
                   AND v.most_recent_commit_id >= ?
                   AND COALESCE(e.label, 'u') = 'u'",
            )
            .context("preparing untriaged-at-head query")?;
        let rows = stmt.query_map(
            rusqlite::params![corpus, ctx.window_start().unwrap_or(0)],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

/// Per-trace digest-per-commit arrays over the window, loaded in chunks.
/// Shared with the search engine's trace-history expansion.
pub(crate) fn load_histories(
    conn: &Connection,
    ctx: &RequestContext,
    traces: &FxHashSet<TraceId>,
) -> Result<FxHashMap<TraceId, Vec<Option<Digest>>>> {
    let mut histories: FxHashMap<TraceId, Vec<Option<Digest>>> = traces
        .iter()
        .map(|t| (*t, vec![None; ctx.len()]))
        .collect();
    let ids: Vec<TraceId> = traces.iter().copied().collect();
    let window_start = ctx.window_start().unwrap_or(0);
    for chunk in ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT trace_id, commit_id, digest FROM TraceValues
             WHERE commit_id >= ? AND trace_id IN ({})",
            sql_placeholders(chunk.len())
        );
        let mut params: Vec<Value> = Vec::with_capacity(chunk.len() + 1);
        params.push(Value::Integer(window_start));
        params.extend(chunk.iter().map(|t| Value::from(*t)));
        let mut stmt = conn.prepare(&sql).context("preparing history query")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            let trace: TraceId = r.get(0)?;
            let commit_id: i64 = r.get(1)?;
            let digest: Digest = r.get(2)?;
            Ok((trace, commit_id, digest))
        })?;
        for row in rows {
            let (trace, commit_id, digest) = row?;
            if let (Some(pos), Some(history)) = (ctx.position(commit_id), histories.get_mut(&trace))
            {
                history[pos] = Some(digest);
            }
        }
    }
    Ok(histories)
}

/// Triaged (grouping, digest) pairs for all involved groupings.
fn load_triaged(
    conn: &Connection,
    groupings: &FxHashSet<GroupingId>,
) -> Result<FxHashSet<(GroupingId, Digest)>> {
    let mut triaged = FxHashSet::default();
    let ids: Vec<GroupingId> = groupings.iter().copied().collect();
    for chunk in ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT grouping_id, digest FROM Expectations
             WHERE label IN ('p', 'n') AND grouping_id IN ({})",
            sql_placeholders(chunk.len())
        );
        let params: Vec<Value> = chunk.iter().map(|g| Value::from(*g)).collect();
        let mut stmt = conn.prepare(&sql).context("preparing expectations query")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })?;
        for row in rows {
            triaged.insert(row?);
        }
    }
    Ok(triaged)
}
