//! Similarity-graph construction for visual clustering: nodes are digests,
//! edges carry the pairwise diff distance.

use anyhow::{Context, Result};
use fxhash::{FxHashMap, FxHashSet};
use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::{debug, warn};

use crate::model::types::{
    Digest, GroupingId, Label, OptionsId, ParamSet, TraceId, paramset_add,
};
use crate::search::caches::Caches;
use crate::search::context::RequestContext;
use crate::search::query::{TraceFilter, build_trace_query};
use crate::search::views::ViewCatalog;
use crate::storage::sqlite::sql_placeholders;

const IN_CHUNK: usize = 500;

/// Which digests of one grouping to cluster.
#[derive(Debug, Clone)]
pub struct ClusterRequest {
    pub grouping: GroupingId,
    pub filter: TraceFilter,
    pub include_positive: bool,
    pub include_negative: bool,
    pub include_untriaged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterNode {
    pub digest: Digest,
    pub status: Label,
}

/// Edge between `nodes[a]` and `nodes[b]`; each unordered pair appears at
/// most once (canonical byte ordering suppresses the mirrored row).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterEdge {
    pub a: usize,
    pub b: usize,
    pub distance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterResponse {
    pub nodes: Vec<ClusterNode>,
    pub edges: Vec<ClusterEdge>,
    pub paramset: ParamSet,
}

impl ClusterRequest {
    fn includes(&self, label: Label) -> bool {
        match label {
            Label::Positive => self.include_positive,
            Label::Negative => self.include_negative,
            Label::Untriaged => self.include_untriaged,
        }
    }
}

/// Build the similarity graph for one grouping.
pub fn get_cluster(
    conn: &Connection,
    ctx: &RequestContext,
    caches: &Caches,
    req: &ClusterRequest,
    views: Option<&ViewCatalog>,
) -> Result<ClusterResponse> {
    // Digests at head matching the filter, restricted to the grouping.
    // Public-view mode filters contributing traces before digest selection.
    let mut filter = req.filter.clone();
    filter.at_head_only = true;
    let inner = build_trace_query(&filter, ctx, views)?;
    let sql = format!(
        "SELECT trace_id, grouping_id, digest FROM ({}) WHERE grouping_id = ?",
        inner.sql
    );
    let mut params = inner.params;
    params.push(Value::from(req.grouping));

    let mut stmt = conn.prepare(&sql).context("preparing cluster digest query")?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
        let trace: TraceId = r.get(0)?;
        let digest: Digest = r.get(2)?;
        Ok((trace, digest))
    })?;

    let mut traces: FxHashSet<TraceId> = FxHashSet::default();
    let mut digests: FxHashSet<Digest> = FxHashSet::default();
    for row in rows {
        let (trace, digest) = row?;
        if !caches.is_publicly_visible(trace) {
            continue;
        }
        traces.insert(trace);
        digests.insert(digest);
    }

    // Status per digest, then the inclusion filter.
    let labels = grouping_labels(conn, req.grouping)?;
    let mut nodes: Vec<ClusterNode> = digests
        .into_iter()
        .map(|digest| ClusterNode {
            digest,
            status: labels.get(&digest).copied().unwrap_or_default(),
        })
        .filter(|node| req.includes(node.status))
        .collect();
    nodes.sort_by(|a, b| a.digest.cmp(&b.digest));

    let index: FxHashMap<Digest, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.digest, i))
        .collect();
    let edges = load_edges(conn, &nodes, &index)?;

    let paramset = cluster_paramset(conn, caches, &traces)?;
    debug!(
        nodes = nodes.len(),
        edges = edges.len(),
        grouping = %req.grouping,
        "cluster built"
    );
    Ok(ClusterResponse {
        nodes,
        edges,
        paramset,
    })
}

fn grouping_labels(conn: &Connection, grouping: GroupingId) -> Result<FxHashMap<Digest, Label>> {
    let mut stmt = conn
        .prepare("SELECT digest, label FROM Expectations WHERE grouping_id = ?")
        .context("preparing expectations lookup")?;
    let rows = stmt.query_map([grouping], |r| {
        let digest: Digest = r.get(0)?;
        let label: String = r.get(1)?;
        Ok((digest, label))
    })?;
    let mut labels = FxHashMap::default();
    for row in rows {
        let (digest, label) = row?;
        let parsed = Label::from_sql(&label).unwrap_or_else(|| {
            warn!(label = %label, "unrecognized expectation label, treating as untriaged");
            Label::Untriaged
        });
        labels.insert(digest, parsed);
    }
    Ok(labels)
}

/// Pairwise diff rows among exactly the node set; both directions of a pair
/// are suppressed to one edge via `left_digest < right_digest`.
fn load_edges(
    conn: &Connection,
    nodes: &[ClusterNode],
    index: &FxHashMap<Digest, usize>,
) -> Result<Vec<ClusterEdge>> {
    let digests: Vec<Digest> = nodes.iter().map(|n| n.digest).collect();
    let mut edges = Vec::new();
    for left_chunk in digests.chunks(IN_CHUNK) {
        for right_chunk in digests.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT left_digest, right_digest, combined_metric FROM DiffMetrics
                 WHERE left_digest < right_digest
                   AND left_digest IN ({})
                   AND right_digest IN ({})",
                sql_placeholders(left_chunk.len()),
                sql_placeholders(right_chunk.len())
            );
            let params: Vec<Value> = left_chunk
                .iter()
                .chain(right_chunk.iter())
                .map(|d| Value::from(*d))
                .collect();
            let mut stmt = conn.prepare(&sql).context("preparing edge query")?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
                let left: Digest = r.get(0)?;
                let right: Digest = r.get(1)?;
                let distance: f64 = r.get(2)?;
                Ok((left, right, distance))
            })?;
            for row in rows {
                let (left, right, distance) = row?;
                if let (Some(&a), Some(&b)) = (index.get(&left), index.get(&right)) {
                    edges.push(ClusterEdge { a, b, distance });
                }
            }
        }
    }
    edges.sort_by(|x, y| x.a.cmp(&y.a).then(x.b.cmp(&y.b)));
    Ok(edges)
}

/// Combined paramset over the contributing traces and their head options.
fn cluster_paramset(
    conn: &Connection,
    caches: &Caches,
    traces: &FxHashSet<TraceId>,
) -> Result<ParamSet> {
    let mut paramset = ParamSet::new();
    let ids: Vec<TraceId> = traces.iter().copied().collect();
    for trace in &ids {
        if let Some(keys) = caches.trace_keys(conn, *trace)? {
            paramset_add(&mut paramset, &keys);
        }
    }
    for chunk in ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT option_id FROM ValuesAtHead
             WHERE option_id IS NOT NULL AND trace_id IN ({})",
            sql_placeholders(chunk.len())
        );
        let params: Vec<Value> = chunk.iter().map(|t| Value::from(*t)).collect();
        let mut stmt = conn.prepare(&sql).context("preparing options lookup")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            let id: OptionsId = r.get(0)?;
            Ok(id)
        })?;
        for row in rows {
            if let Some(keys) = caches.option_keys(conn, row?)? {
                paramset_add(&mut paramset, &keys);
            }
        }
    }
    Ok(paramset)
}
