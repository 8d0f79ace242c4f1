//! The primary read path: resolve a filter into matching digests, find each
//! digest's closest triaged neighbors, and return a paginated, sorted,
//! fully-expanded result page.
//!
//! The pipeline is state-free per request; the engine only owns the store
//! handle, the cache manager, and the materialized-view catalog it composes
//! with at construction.  Per-grouping diff lookups, per-patchset summaries,
//! and view refreshes fan out over rayon with first-error semantics: any
//! failed sub-task fails the whole request, and no partial page is ever
//! returned.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fxhash::{FxHashMap, FxHashSet};
use rayon::prelude::*;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::model::types::{
    Changelist, Commit, Digest, GroupingId, Label, OptionsId, ParamSet, Params, Patchset,
    TEST_KEY, TraceId, TriageLabel, paramset_add, qualify_cl,
};
use crate::search::RequestError;
use crate::search::blame::{self, BlameEntry};
use crate::search::caches::{Caches, ParamsMatcher, RefreshJob, Refresher};
use crate::search::cluster::{self, ClusterRequest, ClusterResponse};
use crate::search::context::{QualifiedCl, RequestContext};
use crate::search::query::{TraceFilter, build_cl_trace_query, build_trace_query, check_fragment};
use crate::search::views::{MaterializedViews, ViewCatalog};
use crate::storage::Store;
use crate::storage::sqlite::{changelist_from_row, patchset_from_row, sql_placeholders};

/// Distinct digests presented per trace history; the last slot doubles as
/// the shared overflow bucket when a trace saw more than this many.
pub const MAX_DISTINCT_DIGESTS: usize = 9;

/// Dot value for commits where a trace produced no data.
pub const MISSING_DIGEST_INDEX: i8 = -1;

const IN_CHUNK: usize = 500;

// -------------------------------------------------------------------------
// Request / response types
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Unqualified reference to a changelist as the caller knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelistRef {
    pub system: String,
    pub id: String,
    /// 1-based patchset order; `None` means the most recent patchset.
    pub patchset_order: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub filter: TraceFilter,
    pub include_positive: bool,
    pub include_negative: bool,
    pub include_untriaged: bool,
    /// Drop results that have no closest triaged reference.
    pub must_have_reference: bool,
    /// Bounds on the max channel delta to the closest reference.
    pub min_channel_diff: Option<i64>,
    pub max_channel_diff: Option<i64>,
    pub sort: SortDirection,
    pub offset: usize,
    pub limit: usize,
    /// Read the changelist overlay instead of the primary branch.
    pub changelist: Option<ChangelistRef>,
    /// CL overlay only: hide digests already seen on the primary branch.
    pub exclude_digests_on_primary: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            filter: TraceFilter::default(),
            include_positive: false,
            include_negative: false,
            include_untriaged: true,
            must_have_reference: false,
            min_channel_diff: None,
            max_channel_diff: None,
            sort: SortDirection::Ascending,
            offset: 0,
            limit: 50,
            changelist: None,
            exclude_digests_on_primary: false,
        }
    }
}

impl SearchRequest {
    fn includes(&self, label: Label) -> bool {
        match label {
            Label::Positive => self.include_positive,
            Label::Negative => self.include_negative,
            Label::Untriaged => self.include_untriaged,
        }
    }
}

/// Closest triaged neighbor on one side (positive or negative).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceDiff {
    pub digest: Digest,
    pub label: Label,
    pub num_pixels_diff: i64,
    pub percent_pixels_diff: f64,
    pub max_channel_diff: i64,
    pub combined_metric: f64,
    /// Traits of the traces producing the reference at head; filled only
    /// for the returned page.
    pub paramset: ParamSet,
}

/// Condensed per-commit digest history for one trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceDots {
    pub id: TraceId,
    pub params: Params,
    /// One entry per window commit: an index into the group's `digests`,
    /// or [`MISSING_DIGEST_INDEX`].
    pub dots: Vec<i8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceGroup {
    /// Most significant distinct digests, newest-appearance first, capped
    /// at [`MAX_DISTINCT_DIGESTS`]; further digests share the last index.
    pub digests: Vec<Digest>,
    /// Total distinct digests before capping.
    pub total_digests: usize,
    pub traces: Vec<TraceDots>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub digest: Digest,
    pub grouping: GroupingId,
    pub test_name: String,
    pub status: Label,
    /// Which side the closest reference came from, if any.
    pub closest_label: Option<Label>,
    pub pos_ref: Option<ReferenceDiff>,
    pub neg_ref: Option<ReferenceDiff>,
    pub paramset: ParamSet,
    pub trace_group: TraceGroup,
}

impl SearchResult {
    pub fn closest(&self) -> Option<&ReferenceDiff> {
        match self.closest_label? {
            Label::Positive => self.pos_ref.as_ref(),
            Label::Negative => self.neg_ref.as_ref(),
            Label::Untriaged => None,
        }
    }
}

/// Complete (test, digest) -> suggested-label map for bulk re-triage,
/// independent of pagination.  Digests with no reference carry the empty
/// sentinel and round-trip through serde losslessly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkTriage(pub BTreeMap<String, BTreeMap<Digest, TriageLabel>>);

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub offset: usize,
    /// Total matches before pagination.
    pub total: usize,
    pub commits: Vec<Commit>,
    pub bulk_triage: BulkTriage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchsetSummary {
    pub patchset_id: String,
    pub patchset_order: i64,
    /// Digests never seen on the primary branch in the window.
    pub new_images: usize,
    /// New digests that are also untriaged.
    pub new_untriaged_images: usize,
    /// All untriaged digests produced by the patchset.
    pub total_untriaged_images: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelistSummary {
    pub changelist_id: String,
    pub patchsets: Vec<PatchsetSummary>,
    pub last_updated: DateTime<Utc>,
}

// -------------------------------------------------------------------------
// Internal pipeline types
// -------------------------------------------------------------------------

/// Best triaged neighbor per side for one (grouping, digest).
#[derive(Debug, Clone, Default)]
struct ClosestPair {
    pos: Option<ReferenceDiff>,
    neg: Option<ReferenceDiff>,
}

impl ClosestPair {
    /// Strictly the lower combined metric wins when both sides exist;
    /// exact ties fall back to digest byte order.  No configurable
    /// preference.
    fn closest(&self) -> Option<&ReferenceDiff> {
        match (&self.pos, &self.neg) {
            (Some(p), Some(n)) => match p.combined_metric.partial_cmp(&n.combined_metric) {
                Some(Ordering::Less) => Some(p),
                Some(Ordering::Greater) => Some(n),
                _ => {
                    if p.digest <= n.digest {
                        Some(p)
                    } else {
                        Some(n)
                    }
                }
            },
            (Some(p), None) => Some(p),
            (None, Some(n)) => Some(n),
            (None, None) => None,
        }
    }
}

struct WorkItem {
    grouping: GroupingId,
    digest: Digest,
    status: Label,
    pair: ClosestPair,
}

type LabelMap = FxHashMap<GroupingId, FxHashMap<Digest, Label>>;

// -------------------------------------------------------------------------
// Engine
// -------------------------------------------------------------------------

/// The search engine.  Owns its caches and view manager; construct one per
/// process and share it behind an `Arc`.
pub struct SearchEngine {
    store: Arc<Store>,
    caches: Arc<Caches>,
    views: Arc<MaterializedViews>,
    catalog: ViewCatalog,
    matcher: Option<Arc<dyn ParamsMatcher>>,
    cfg: SearchConfig,
}

impl SearchEngine {
    /// Build the engine, create any configured materialized views, and do
    /// an initial synchronous population of the swap caches.
    pub fn new(
        store: Arc<Store>,
        cfg: SearchConfig,
        matcher: Option<Arc<dyn ParamsMatcher>>,
    ) -> Result<Self> {
        cfg.validate();
        let caches = Arc::new(Caches::new(&cfg));
        let views = Arc::new(MaterializedViews::new(
            store.clone(),
            cfg.view_corpora.clone(),
            cfg.window_size,
        )?);
        let catalog = views.catalog();
        let engine = Self {
            store,
            caches,
            views,
            catalog,
            matcher,
            cfg,
        };
        engine.refresh_caches()?;
        engine.views.refresh_all()?;
        info!(window = engine.cfg.window_size, "search engine ready");
        Ok(engine)
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Rebuild the swap caches once.  The background refresher calls this
    /// on its intervals; tests call it to control staleness.
    pub fn refresh_caches(&self) -> Result<()> {
        let conn = self.store.reader()?;
        let ctx = self.window_context(&conn)?;
        self.caches
            .rebuild_digests_on_primary(&conn, ctx.tile_range())?;
        if let Some(matcher) = &self.matcher {
            self.caches.rebuild_public_traces(&conn, matcher.as_ref())?;
        }
        Ok(())
    }

    /// Spawn the independent fixed-interval background refresh tasks.  The
    /// returned [`Refresher`] stops them on drop or explicit shutdown.
    pub fn start_background_refresh(self: &Arc<Self>) -> Refresher {
        let mut jobs = Vec::new();

        let engine = self.clone();
        jobs.push(RefreshJob {
            name: "digests-on-primary",
            interval: self.cfg.digests_refresh_interval,
            run: Box::new(move || {
                let conn = engine.store.reader()?;
                let ctx = engine.window_context(&conn)?;
                engine
                    .caches
                    .rebuild_digests_on_primary(&conn, ctx.tile_range())
            }),
        });

        if self.matcher.is_some() {
            let engine = self.clone();
            jobs.push(RefreshJob {
                name: "public-traces",
                interval: self.cfg.public_refresh_interval,
                run: Box::new(move || {
                    let matcher = engine.matcher.as_ref().expect("checked above");
                    let conn = engine.store.reader()?;
                    engine.caches.rebuild_public_traces(&conn, matcher.as_ref())
                }),
            });
        }

        if !self.catalog.is_empty() {
            let views = self.views.clone();
            jobs.push(RefreshJob {
                name: "materialized-views",
                interval: self.cfg.view_refresh_interval,
                run: Box::new(move || views.refresh_all()),
            });
        }

        Refresher::spawn(jobs)
    }

    fn window_context(&self, conn: &Connection) -> Result<RequestContext> {
        RequestContext::for_window(conn, self.cfg.window_size, self.cfg.tile_width)
    }

    // ---------------------------------------------------------------------
    // Search
    // ---------------------------------------------------------------------

    pub fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let conn = self.store.reader()?;
        let mut ctx = self.window_context(&conn)?;

        debug!(
            corpus = %req.filter.corpus,
            cl = req.changelist.is_some(),
            offset = req.offset,
            limit = req.limit,
            "search_start"
        );

        // Stage one: matching (trace, grouping, digest) triples, public
        // view applied.
        let triples = match &req.changelist {
            None => self.primary_triples(&conn, req, &ctx)?,
            Some(cl_ref) => {
                let (changelist, patchset) = self.resolve_cl(&conn, cl_ref)?;
                // Past every landed commit, not just the newest with data:
                // a data-less commit beyond the window must not collide.
                let synthetic_id: i64 = conn
                    .query_row(
                        "SELECT COALESCE(MAX(commit_id), 0) + 1 FROM Commits",
                        [],
                        |r| r.get(0),
                    )
                    .context("resolving synthetic commit id")?;
                let synthetic = Commit {
                    id: synthetic_id,
                    git_hash: patchset.git_hash.clone(),
                    ts: changelist.last_ingested_data,
                    author: changelist.owner.clone(),
                    subject: changelist.subject.clone(),
                };
                ctx.cl = Some(QualifiedCl {
                    system: changelist.system.clone(),
                    changelist_id: changelist.id.clone(),
                    patchset_id: patchset.id.clone(),
                    patchset_order: patchset.order,
                });
                ctx.push_synthetic_commit(synthetic);
                self.cl_triples(&conn, req, &ctx)?
            }
        };

        // Deduplicated work items keyed by fixed-size binary (g, d) pairs.
        let mut producers: FxHashMap<(GroupingId, Digest), Vec<TraceId>> = FxHashMap::default();
        for (trace, grouping, digest) in &triples {
            producers
                .entry((*grouping, *digest))
                .or_default()
                .push(*trace);
        }

        let groupings: FxHashSet<GroupingId> = producers.keys().map(|(g, _)| *g).collect();
        let cl_branch = ctx.cl.as_ref().map(|cl| cl.changelist_id.clone());
        let labels = load_labels(&conn, &groupings, cl_branch.as_deref())?;

        // Status inclusion filter.
        let mut work: Vec<(GroupingId, Digest, Label)> = Vec::with_capacity(producers.len());
        for (grouping, digest) in producers.keys() {
            let status = labels
                .get(grouping)
                .and_then(|m| m.get(digest))
                .copied()
                .unwrap_or_default();
            if req.includes(status) {
                work.push((*grouping, *digest, status));
            }
        }

        // Stage two: closest triaged neighbors, in parallel per grouping.
        let mut by_grouping: FxHashMap<GroupingId, Vec<Digest>> = FxHashMap::default();
        for (grouping, digest, _) in &work {
            by_grouping.entry(*grouping).or_default().push(*digest);
        }
        let closest = self.closest_diffs(&by_grouping, &labels)?;

        let mut items: Vec<WorkItem> = work
            .into_iter()
            .map(|(grouping, digest, status)| WorkItem {
                grouping,
                digest,
                status,
                pair: closest
                    .get(&(grouping, digest))
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();

        // The bulk-retriage map covers everything that matched, regardless
        // of pagination and of the reference filters below.
        let bulk_triage = self.bulk_triage(&conn, &items)?;

        // Filters that depend on stage-two output.
        items.retain(|item| {
            let closest = item.pair.closest();
            if req.must_have_reference && closest.is_none() {
                return false;
            }
            if req.min_channel_diff.is_some() || req.max_channel_diff.is_some() {
                let Some(r) = closest else { return false };
                if let Some(min) = req.min_channel_diff
                    && r.max_channel_diff < min
                {
                    return false;
                }
                if let Some(max) = req.max_channel_diff
                    && r.max_channel_diff > max
                {
                    return false;
                }
            }
            true
        });

        // Total order: reference metric (per direction), no-reference
        // entries first, ties by digest bytes then grouping bytes.
        items.sort_by(|a, b| compare_items(a, b, req.sort));

        let total = items.len();
        let page: Vec<WorkItem> = items
            .into_iter()
            .skip(req.offset)
            .take(req.limit)
            .collect();

        // Per-trace digests at the synthetic commit (CL overlay only).
        let cl_digests: Option<FxHashMap<TraceId, Digest>> = ctx.cl.as_ref().map(|_| {
            triples
                .iter()
                .map(|(trace, _, digest)| (*trace, *digest))
                .collect()
        });

        let results = self.expand_page(&conn, &ctx, page, &producers, cl_digests.as_ref())?;

        debug!(total = total, page = results.len(), "search_done");
        Ok(SearchResponse {
            results,
            offset: req.offset,
            total,
            commits: ctx.commits().to_vec(),
            bulk_triage,
        })
    }

    fn primary_triples(
        &self,
        conn: &Connection,
        req: &SearchRequest,
        ctx: &RequestContext,
    ) -> Result<Vec<(TraceId, GroupingId, Digest)>> {
        let query = build_trace_query(&req.filter, ctx, Some(&self.catalog))?;
        let mut stmt = conn
            .prepare(&query.sql)
            .context("preparing stage-one query")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(query.params), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?;
        let mut triples = Vec::new();
        for row in rows {
            let (trace, grouping, digest): (TraceId, GroupingId, Digest) = row?;
            if self.caches.is_publicly_visible(trace) {
                triples.push((trace, grouping, digest));
            }
        }
        Ok(triples)
    }

    fn cl_triples(
        &self,
        conn: &Connection,
        req: &SearchRequest,
        ctx: &RequestContext,
    ) -> Result<Vec<(TraceId, GroupingId, Digest)>> {
        let cl = ctx.cl.as_ref().expect("cl context set by search");
        let query = build_cl_trace_query(&req.filter, &cl.changelist_id, &cl.patchset_id)?;
        let mut stmt = conn
            .prepare(&query.sql)
            .context("preparing CL stage-one query")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(query.params), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?;
        let mut triples = Vec::new();
        for row in rows {
            let (trace, grouping, digest): (TraceId, GroupingId, Digest) = row?;
            if !self.caches.is_publicly_visible(trace) {
                continue;
            }
            if req.exclude_digests_on_primary && self.caches.digest_on_primary(grouping, digest) {
                continue;
            }
            triples.push((trace, grouping, digest));
        }
        Ok(triples)
    }

    fn resolve_cl(
        &self,
        conn: &Connection,
        cl_ref: &ChangelistRef,
    ) -> Result<(Changelist, Patchset)> {
        let qualified = qualify_cl(&cl_ref.system, &cl_ref.id);
        let changelist = conn
            .query_row(
                "SELECT changelist_id, system, status, owner, subject, last_ingested_data
                 FROM Changelists WHERE changelist_id = ?",
                [&qualified],
                changelist_from_row,
            )
            .optional()
            .context("looking up changelist")?
            .ok_or_else(|| RequestError::UnknownChangelist(qualified.clone()))?;

        let patchset = match cl_ref.patchset_order {
            Some(order) => conn
                .query_row(
                    "SELECT patchset_id, changelist_id, ps_order, git_hash
                     FROM Patchsets WHERE changelist_id = ? AND ps_order = ?",
                    rusqlite::params![qualified, order],
                    patchset_from_row,
                )
                .optional()
                .context("looking up patchset")?
                .ok_or(RequestError::UnknownPatchset {
                    changelist: qualified.clone(),
                    order,
                })?,
            None => conn
                .query_row(
                    "SELECT patchset_id, changelist_id, ps_order, git_hash
                     FROM Patchsets WHERE changelist_id = ?
                     ORDER BY ps_order DESC LIMIT 1",
                    [&qualified],
                    patchset_from_row,
                )
                .optional()
                .context("looking up latest patchset")?
                .ok_or(RequestError::UnknownPatchset {
                    changelist: qualified.clone(),
                    order: 0,
                })?,
        };
        Ok((changelist, patchset))
    }

    /// Stage two: per grouping in parallel, find the closest positive and
    /// closest negative triaged neighbor for every distinct digest.
    fn closest_diffs(
        &self,
        by_grouping: &FxHashMap<GroupingId, Vec<Digest>>,
        labels: &LabelMap,
    ) -> Result<FxHashMap<(GroupingId, Digest), ClosestPair>> {
        let empty = FxHashMap::default();
        let per_grouping: Vec<Vec<((GroupingId, Digest), ClosestPair)>> = by_grouping
            .par_iter()
            .map(|(grouping, digests)| {
                let conn = self.store.reader()?;
                let triaged = labels.get(grouping).unwrap_or(&empty);
                closest_for_grouping(&conn, *grouping, digests, triaged)
            })
            .collect::<Result<_>>()?;
        Ok(per_grouping.into_iter().flatten().collect())
    }

    /// Suggested label per (test, digest): the closest reference's label,
    /// or the empty sentinel when no reference exists.
    fn bulk_triage(&self, conn: &Connection, items: &[WorkItem]) -> Result<BulkTriage> {
        let mut map: BTreeMap<String, BTreeMap<Digest, TriageLabel>> = BTreeMap::new();
        for item in items {
            let test_name = self
                .caches
                .grouping_keys(conn, item.grouping)?
                .and_then(|keys| keys.get(TEST_KEY).cloned())
                .unwrap_or_else(|| item.grouping.to_hex());
            let suggestion = match item.pair.closest() {
                Some(r) => TriageLabel::from(r.label),
                None => TriageLabel::Empty,
            };
            map.entry(test_name).or_default().insert(item.digest, suggestion);
        }
        Ok(BulkTriage(map))
    }

    /// Stage six: expand the returned page with paramsets, reference
    /// paramsets, and condensed trace histories.
    fn expand_page(
        &self,
        conn: &Connection,
        ctx: &RequestContext,
        page: Vec<WorkItem>,
        producers: &FxHashMap<(GroupingId, Digest), Vec<TraceId>>,
        cl_digests: Option<&FxHashMap<TraceId, Digest>>,
    ) -> Result<Vec<SearchResult>> {
        let mut results = Vec::with_capacity(page.len());
        for item in page {
            let traces = producers
                .get(&(item.grouping, item.digest))
                .cloned()
                .unwrap_or_default();

            let test_name = self
                .caches
                .grouping_keys(conn, item.grouping)?
                .and_then(|keys| keys.get(TEST_KEY).cloned())
                .unwrap_or_else(|| item.grouping.to_hex());

            let paramset = self.traces_paramset(conn, ctx, &traces)?;
            let trace_group = self.build_trace_group(conn, ctx, &traces, &item.digest, cl_digests)?;

            let pos_ref = item
                .pair
                .pos
                .clone()
                .map(|r| self.fill_ref_paramset(conn, item.grouping, r))
                .transpose()?;
            let neg_ref = item
                .pair
                .neg
                .clone()
                .map(|r| self.fill_ref_paramset(conn, item.grouping, r))
                .transpose()?;
            let closest_label = item.pair.closest().map(|r| r.label);

            results.push(SearchResult {
                digest: item.digest,
                grouping: item.grouping,
                test_name,
                status: item.status,
                closest_label,
                pos_ref,
                neg_ref,
                paramset,
                trace_group,
            });
        }
        Ok(results)
    }

    /// Traits drawn from the contributing traces and their options at the
    /// data point (head, or the patchset value in CL mode).
    fn traces_paramset(
        &self,
        conn: &Connection,
        ctx: &RequestContext,
        traces: &[TraceId],
    ) -> Result<ParamSet> {
        let mut paramset = ParamSet::new();
        for trace in traces {
            if let Some(keys) = self.caches.trace_keys(conn, *trace)? {
                paramset_add(&mut paramset, &keys);
            }
            let option_id: Option<OptionsId> = match &ctx.cl {
                None => conn
                    .query_row(
                        "SELECT option_id FROM ValuesAtHead WHERE trace_id = ?",
                        [trace],
                        |r| r.get(0),
                    )
                    .optional()
                    .context("looking up head options")?
                    .flatten(),
                Some(cl) => conn
                    .query_row(
                        "SELECT option_id FROM SecondaryBranchValues
                         WHERE branch_name = ? AND version_name = ? AND trace_id = ?",
                        rusqlite::params![cl.changelist_id, cl.patchset_id, trace],
                        |r| r.get(0),
                    )
                    .optional()
                    .context("looking up CL options")?
                    .flatten(),
            };
            if let Some(option_id) = option_id
                && let Some(keys) = self.caches.option_keys(conn, option_id)?
            {
                paramset_add(&mut paramset, &keys);
            }
        }
        Ok(paramset)
    }

    /// Paramset of the traces producing a reference digest at head.
    fn fill_ref_paramset(
        &self,
        conn: &Connection,
        grouping: GroupingId,
        mut r: ReferenceDiff,
    ) -> Result<ReferenceDiff> {
        let mut stmt = conn
            .prepare(
                "SELECT trace_id, option_id FROM ValuesAtHead
                 WHERE grouping_id = ? AND digest = ?",
            )
            .context("preparing reference trace lookup")?;
        let rows = stmt.query_map(rusqlite::params![grouping, r.digest], |row| {
            let trace: TraceId = row.get(0)?;
            let option_id: Option<OptionsId> = row.get(1)?;
            Ok((trace, option_id))
        })?;
        let mut paramset = ParamSet::new();
        for row in rows {
            let (trace, option_id) = row?;
            if !self.caches.is_publicly_visible(trace) {
                continue;
            }
            if let Some(keys) = self.caches.trace_keys(conn, trace)? {
                paramset_add(&mut paramset, &keys);
            }
            if let Some(option_id) = option_id
                && let Some(keys) = self.caches.option_keys(conn, option_id)?
            {
                paramset_add(&mut paramset, &keys);
            }
        }
        r.paramset = paramset;
        Ok(r)
    }

    /// Condense each contributing trace's per-commit digest sequence into
    /// indices over at most [`MAX_DISTINCT_DIGESTS`] distinct digests, the
    /// rest folded into the shared overflow slot.
    fn build_trace_group(
        &self,
        conn: &Connection,
        ctx: &RequestContext,
        traces: &[TraceId],
        result_digest: &Digest,
        cl_digests: Option<&FxHashMap<TraceId, Digest>>,
    ) -> Result<TraceGroup> {
        let trace_set: FxHashSet<TraceId> = traces.iter().copied().collect();
        let mut histories = blame::load_histories(conn, ctx, &trace_set)?;

        // CL overlay: the synthetic commit occupies the last position and
        // carries the patchset's digest for each trace.
        if let Some(cl_digests) = cl_digests {
            let last = ctx.len() - 1;
            for (trace, history) in histories.iter_mut() {
                if let Some(digest) = cl_digests.get(trace) {
                    history[last] = Some(*digest);
                }
            }
        }

        // Rank distinct digests by most recent appearance; the result's
        // own digest always ranks first.
        let mut latest: FxHashMap<Digest, usize> = FxHashMap::default();
        for history in histories.values() {
            for (pos, digest) in history.iter().enumerate() {
                if let Some(d) = digest {
                    let entry = latest.entry(*d).or_insert(pos);
                    if pos > *entry {
                        *entry = pos;
                    }
                }
            }
        }
        let total_digests = latest.len();
        let mut ranked: Vec<(Digest, usize)> = latest.into_iter().collect();
        ranked.sort_by(|a, b| {
            let a_is_result = a.0 == *result_digest;
            let b_is_result = b.0 == *result_digest;
            b_is_result
                .cmp(&a_is_result)
                .then(b.1.cmp(&a.1))
                .then(a.0.cmp(&b.0))
        });
        let digests: Vec<Digest> = ranked
            .into_iter()
            .take(MAX_DISTINCT_DIGESTS)
            .map(|(d, _)| d)
            .collect();
        let index: FxHashMap<Digest, i8> = digests
            .iter()
            .enumerate()
            .map(|(i, d)| (*d, i as i8))
            .collect();
        let overflow = (MAX_DISTINCT_DIGESTS - 1) as i8;

        let mut group_traces = Vec::with_capacity(traces.len());
        let mut sorted_traces: Vec<TraceId> = traces.to_vec();
        sorted_traces.sort();
        sorted_traces.dedup();
        for trace in sorted_traces {
            let Some(history) = histories.get(&trace) else {
                continue;
            };
            let dots: Vec<i8> = history
                .iter()
                .map(|slot| match slot {
                    None => MISSING_DIGEST_INDEX,
                    Some(d) => index.get(d).copied().unwrap_or(overflow),
                })
                .collect();
            let params = self
                .caches
                .trace_keys(conn, trace)?
                .map(|p| (*p).clone())
                .unwrap_or_default();
            group_traces.push(TraceDots {
                id: trace,
                params,
                dots,
            });
        }

        Ok(TraceGroup {
            digests,
            total_digests,
            traces: group_traces,
        })
    }

    // ---------------------------------------------------------------------
    // Changelist summaries
    // ---------------------------------------------------------------------

    /// Per-patchset counts of new and untriaged images for one changelist.
    /// Patchset summaries are computed in parallel; any failure fails the
    /// whole call.
    pub fn new_and_untriaged_summary_for_cl(
        &self,
        system: &str,
        cl_id: &str,
    ) -> Result<ChangelistSummary> {
        let conn = self.store.reader()?;
        let qualified = qualify_cl(system, cl_id);
        let changelist = conn
            .query_row(
                "SELECT changelist_id, system, status, owner, subject, last_ingested_data
                 FROM Changelists WHERE changelist_id = ?",
                [&qualified],
                changelist_from_row,
            )
            .optional()
            .context("looking up changelist")?
            .ok_or_else(|| RequestError::UnknownChangelist(qualified.clone()))?;

        let mut stmt = conn.prepare(
            "SELECT patchset_id, changelist_id, ps_order, git_hash
             FROM Patchsets WHERE changelist_id = ? ORDER BY ps_order ASC",
        )?;
        let patchsets = stmt
            .query_map([&qualified], patchset_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        let summaries: Vec<PatchsetSummary> = patchsets
            .par_iter()
            .map(|ps| {
                let conn = self.store.reader()?;
                self.patchset_summary(&conn, &qualified, ps)
            })
            .collect::<Result<_>>()?;

        Ok(ChangelistSummary {
            changelist_id: qualified,
            patchsets: summaries,
            last_updated: changelist.last_ingested_data,
        })
    }

    fn patchset_summary(
        &self,
        conn: &Connection,
        qualified_cl: &str,
        ps: &Patchset,
    ) -> Result<PatchsetSummary> {
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT grouping_id, digest FROM SecondaryBranchValues
                 WHERE branch_name = ? AND version_name = ?",
            )
            .context("preparing patchset digest query")?;
        let pairs = stmt
            .query_map(rusqlite::params![qualified_cl, ps.id], |r| {
                Ok((r.get::<_, GroupingId>(0)?, r.get::<_, Digest>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let groupings: FxHashSet<GroupingId> = pairs.iter().map(|(g, _)| *g).collect();
        let labels = load_labels(conn, &groupings, Some(qualified_cl))?;

        let mut summary = PatchsetSummary {
            patchset_id: ps.id.clone(),
            patchset_order: ps.order,
            new_images: 0,
            new_untriaged_images: 0,
            total_untriaged_images: 0,
        };
        for (grouping, digest) in pairs {
            let is_new = !self.caches.digest_on_primary(grouping, digest);
            let label = labels
                .get(&grouping)
                .and_then(|m| m.get(&digest))
                .copied()
                .unwrap_or_default();
            if is_new {
                summary.new_images += 1;
            }
            if label == Label::Untriaged {
                summary.total_untriaged_images += 1;
                if is_new {
                    summary.new_untriaged_images += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Timestamp of the most recently ingested data for a changelist.
    pub fn changelist_last_updated(&self, system: &str, cl_id: &str) -> Result<DateTime<Utc>> {
        let conn = self.store.reader()?;
        let qualified = qualify_cl(system, cl_id);
        let ts: Option<i64> = conn
            .query_row(
                "SELECT last_ingested_data FROM Changelists WHERE changelist_id = ?",
                [&qualified],
                |r| r.get(0),
            )
            .optional()
            .context("looking up changelist timestamp")?;
        match ts {
            Some(secs) => Ok(crate::storage::sqlite::ts_from_epoch(secs)),
            None => Err(RequestError::UnknownChangelist(qualified).into()),
        }
    }

    // ---------------------------------------------------------------------
    // Blame / cluster / paramsets / window
    // ---------------------------------------------------------------------

    pub fn get_blames_for_untriaged_digests(&self, corpus: &str) -> Result<Vec<BlameEntry>> {
        let conn = self.store.reader()?;
        let ctx = self.window_context(&conn)?;
        blame::blames_for_untriaged_digests(&conn, &ctx, &self.caches, corpus, Some(&self.catalog))
    }

    pub fn get_cluster(&self, req: &ClusterRequest) -> Result<ClusterResponse> {
        let conn = self.store.reader()?;
        let ctx = self.window_context(&conn)?;
        cluster::get_cluster(&conn, &ctx, &self.caches, req, Some(&self.catalog))
    }

    /// Deduplicated key -> values map over the primary branch at head,
    /// respecting public-view filtering; served from the short-TTL cache.
    pub fn get_primary_branch_paramset(&self, corpus: &str) -> Result<Arc<ParamSet>> {
        if corpus.is_empty() {
            return Err(RequestError::EmptyCorpus.into());
        }
        if !check_fragment(corpus) {
            return Err(RequestError::UnsafeKey(corpus.to_string()).into());
        }
        let key = format!("primary/{corpus}");
        self.caches.paramset_cached(&key, || {
            let conn = self.store.reader()?;
            let ctx = self.window_context(&conn)?;
            let mut stmt = conn
                .prepare(
                    "SELECT trace_id, keys, option_id FROM ValuesAtHead
                     WHERE corpus = ? AND most_recent_commit_id >= ?",
                )
                .context("preparing primary paramset query")?;
            let rows = stmt.query_map(
                rusqlite::params![corpus, ctx.window_start().unwrap_or(0)],
                |r| {
                    let trace: TraceId = r.get(0)?;
                    let keys: String = r.get(1)?;
                    let option_id: Option<OptionsId> = r.get(2)?;
                    Ok((trace, keys, option_id))
                },
            )?;
            let mut paramset = ParamSet::new();
            for row in rows {
                let (trace, keys, option_id) = row?;
                if !self.caches.is_publicly_visible(trace) {
                    continue;
                }
                let params: Params =
                    serde_json::from_str(&keys).context("parsing trace keys JSON")?;
                paramset_add(&mut paramset, &params);
                if let Some(option_id) = option_id
                    && let Some(opts) = self.caches.option_keys(&conn, option_id)?
                {
                    paramset_add(&mut paramset, &opts);
                }
            }
            Ok(paramset)
        })
    }

    /// Deduplicated paramset over everything a changelist has produced,
    /// across all its patchsets.
    pub fn get_changelist_paramset(&self, system: &str, cl_id: &str) -> Result<Arc<ParamSet>> {
        let conn = self.store.reader()?;
        let qualified = qualify_cl(system, cl_id);
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM Changelists WHERE changelist_id = ?",
                [&qualified],
                |r| r.get(0),
            )
            .optional()
            .context("checking changelist")?;
        if exists.is_none() {
            return Err(RequestError::UnknownChangelist(qualified).into());
        }
        let key = format!("cl/{qualified}");
        self.caches.paramset_cached(&key, || {
            let conn = self.store.reader()?;
            let mut stmt = conn
                .prepare(
                    "SELECT s.trace_id, tr.keys, s.option_id
                     FROM SecondaryBranchValues s
                     JOIN Traces tr ON tr.trace_id = s.trace_id
                     WHERE s.branch_name = ?",
                )
                .context("preparing CL paramset query")?;
            let rows = stmt.query_map([&qualified], |r| {
                let trace: TraceId = r.get(0)?;
                let keys: String = r.get(1)?;
                let option_id: Option<OptionsId> = r.get(2)?;
                Ok((trace, keys, option_id))
            })?;
            let mut paramset = ParamSet::new();
            for row in rows {
                let (trace, keys, option_id) = row?;
                if !self.caches.is_publicly_visible(trace) {
                    continue;
                }
                let params: Params =
                    serde_json::from_str(&keys).context("parsing trace keys JSON")?;
                paramset_add(&mut paramset, &params);
                if let Some(option_id) = option_id
                    && let Some(opts) = self.caches.option_keys(&conn, option_id)?
                {
                    paramset_add(&mut paramset, &opts);
                }
            }
            Ok(paramset)
        })
    }

    /// The active commit window, oldest first.
    pub fn get_commits_in_window(&self) -> Result<Vec<Commit>> {
        let conn = self.store.reader()?;
        let ctx = self.window_context(&conn)?;
        Ok(ctx.commits().to_vec())
    }

    /// All digests observed for a grouping within the window, sorted.
    pub fn get_digests_for_grouping(&self, grouping: GroupingId) -> Result<Vec<Digest>> {
        let conn = self.store.reader()?;
        let ctx = self.window_context(&conn)?;
        let Some((start_tile, end_tile)) = ctx.tile_range() else {
            return Ok(Vec::new());
        };
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT digest FROM TiledTraceDigests
                 WHERE grouping_id = ? AND tile_id BETWEEN ? AND ?",
            )
            .context("preparing digests-for-grouping query")?;
        let mut digests = stmt
            .query_map(rusqlite::params![grouping, start_tile, end_tile], |r| {
                r.get::<_, Digest>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        digests.sort();
        Ok(digests)
    }
}

// -------------------------------------------------------------------------
// Pipeline helpers
// -------------------------------------------------------------------------

/// A malformed label row degrades to untriaged rather than failing the
/// request, but never silently.
fn parse_label(raw: &str) -> Label {
    Label::from_sql(raw).unwrap_or_else(|| {
        warn!(label = raw, "unrecognized expectation label, treating as untriaged");
        Label::Untriaged
    })
}

/// Expectations per grouping, with the changelist overlay coalesced on top
/// when present: CL label wins, else primary label, else untriaged.
fn load_labels(
    conn: &Connection,
    groupings: &FxHashSet<GroupingId>,
    cl_branch: Option<&str>,
) -> Result<LabelMap> {
    let mut labels: LabelMap = FxHashMap::default();
    let ids: Vec<GroupingId> = groupings.iter().copied().collect();
    for chunk in ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT grouping_id, digest, label FROM Expectations
             WHERE grouping_id IN ({})",
            sql_placeholders(chunk.len())
        );
        let params: Vec<Value> = chunk.iter().map(|g| Value::from(*g)).collect();
        let mut stmt = conn.prepare(&sql).context("preparing expectations load")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            let grouping: GroupingId = r.get(0)?;
            let digest: Digest = r.get(1)?;
            let label: String = r.get(2)?;
            Ok((grouping, digest, label))
        })?;
        for row in rows {
            let (grouping, digest, label) = row?;
            labels
                .entry(grouping)
                .or_default()
                .insert(digest, parse_label(&label));
        }
    }
    if let Some(branch) = cl_branch {
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT grouping_id, digest, label FROM SecondaryBranchExpectations
                 WHERE branch_name = ? AND grouping_id IN ({})",
                sql_placeholders(chunk.len())
            );
            let mut params: Vec<Value> = Vec::with_capacity(chunk.len() + 1);
            params.push(Value::Text(branch.to_string()));
            params.extend(chunk.iter().map(|g| Value::from(*g)));
            let mut stmt = conn
                .prepare(&sql)
                .context("preparing CL expectations load")?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
                let grouping: GroupingId = r.get(0)?;
                let digest: Digest = r.get(1)?;
                let label: String = r.get(2)?;
                Ok((grouping, digest, label))
            })?;
            for row in rows {
                let (grouping, digest, label) = row?;
                labels
                    .entry(grouping)
                    .or_default()
                    .insert(digest, parse_label(&label));
            }
        }
    }
    Ok(labels)
}

/// Best positive and negative neighbors for each digest of one grouping.
fn closest_for_grouping(
    conn: &Connection,
    grouping: GroupingId,
    digests: &[Digest],
    triaged: &FxHashMap<Digest, Label>,
) -> Result<Vec<((GroupingId, Digest), ClosestPair)>> {
    let mut pairs: FxHashMap<Digest, ClosestPair> = FxHashMap::default();
    for chunk in digests.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT left_digest, right_digest, num_pixels_diff, percent_pixels_diff,
                    max_channel_diff, combined_metric
             FROM DiffMetrics
             WHERE left_digest IN ({}) AND left_digest <> right_digest",
            sql_placeholders(chunk.len())
        );
        let params: Vec<Value> = chunk.iter().map(|d| Value::from(*d)).collect();
        let mut stmt = conn.prepare(&sql).context("preparing diff lookup")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            let left: Digest = r.get(0)?;
            let right: Digest = r.get(1)?;
            let num_pixels_diff: i64 = r.get(2)?;
            let percent_pixels_diff: f64 = r.get(3)?;
            let max_channel_diff: i64 = r.get(4)?;
            let combined_metric: f64 = r.get(5)?;
            Ok((
                left,
                ReferenceDiff {
                    digest: right,
                    label: Label::Untriaged,
                    num_pixels_diff,
                    percent_pixels_diff,
                    max_channel_diff,
                    combined_metric,
                    paramset: ParamSet::new(),
                },
            ))
        })?;
        for row in rows {
            let (left, mut candidate) = row?;
            let Some(label) = triaged.get(&candidate.digest).copied() else {
                continue;
            };
            if !label.is_triaged() {
                continue;
            }
            candidate.label = label;
            let pair = pairs.entry(left).or_default();
            let slot = match label {
                Label::Positive => &mut pair.pos,
                Label::Negative => &mut pair.neg,
                Label::Untriaged => unreachable!("filtered above"),
            };
            let replace = match slot {
                None => true,
                Some(best) => {
                    candidate.combined_metric < best.combined_metric
                        || (candidate.combined_metric == best.combined_metric
                            && candidate.digest < best.digest)
                }
            };
            if replace {
                *slot = Some(candidate);
            }
        }
    }
    Ok(pairs
        .into_iter()
        .map(|(digest, pair)| ((grouping, digest), pair))
        .collect())
}

/// Sort comparator for stage five: closest-reference metric in the
/// requested direction, entries without any reference first, ties broken
/// by digest bytes then grouping bytes.
fn compare_items(a: &WorkItem, b: &WorkItem, dir: SortDirection) -> Ordering {
    let ka = a.pair.closest().map(|r| r.combined_metric);
    let kb = b.pair.closest().map(|r| r.combined_metric);
    let by_metric = match (ka, kb) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => {
            let ord = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            match dir {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        }
    };
    by_metric
        .then_with(|| a.digest.cmp(&b.digest))
        .then_with(|| a.grouping.cmp(&b.grouping))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(seed: u8, metric: f64, label: Label) -> ReferenceDiff {
        ReferenceDiff {
            digest: Digest([seed; 16]),
            label,
            num_pixels_diff: 10,
            percent_pixels_diff: 1.0,
            max_channel_diff: 4,
            combined_metric: metric,
            paramset: ParamSet::new(),
        }
    }

    fn item(digest_seed: u8, grouping_seed: u8, metric: Option<f64>) -> WorkItem {
        WorkItem {
            grouping: GroupingId([grouping_seed; 16]),
            digest: Digest([digest_seed; 16]),
            status: Label::Untriaged,
            pair: ClosestPair {
                pos: metric.map(|m| reference(200, m, Label::Positive)),
                neg: None,
            },
        }
    }

    #[test]
    fn closest_picks_strictly_lower_combined_metric() {
        let pair = ClosestPair {
            pos: Some(reference(1, 0.5, Label::Positive)),
            neg: Some(reference(2, 0.25, Label::Negative)),
        };
        assert_eq!(pair.closest().unwrap().label, Label::Negative);

        let pair = ClosestPair {
            pos: Some(reference(1, 0.1, Label::Positive)),
            neg: Some(reference(2, 0.25, Label::Negative)),
        };
        assert_eq!(pair.closest().unwrap().label, Label::Positive);
    }

    #[test]
    fn closest_tie_breaks_on_digest_bytes() {
        let pair = ClosestPair {
            pos: Some(reference(9, 0.5, Label::Positive)),
            neg: Some(reference(3, 0.5, Label::Negative)),
        };
        assert_eq!(pair.closest().unwrap().digest, Digest([3; 16]));
    }

    #[test]
    fn closest_single_side() {
        let pair = ClosestPair {
            pos: None,
            neg: Some(reference(2, 0.7, Label::Negative)),
        };
        assert_eq!(pair.closest().unwrap().label, Label::Negative);
        assert!(ClosestPair::default().closest().is_none());
    }

    #[test]
    fn sort_no_reference_first_in_both_directions() {
        let a = item(5, 1, None);
        let b = item(6, 1, Some(0.5));
        for dir in [SortDirection::Ascending, SortDirection::Descending] {
            assert_eq!(compare_items(&a, &b, dir), Ordering::Less);
            assert_eq!(compare_items(&b, &a, dir), Ordering::Greater);
        }
    }

    #[test]
    fn sort_direction_reverses_defined_metrics() {
        let a = item(5, 1, Some(0.1));
        let b = item(6, 1, Some(0.9));
        assert_eq!(compare_items(&a, &b, SortDirection::Ascending), Ordering::Less);
        assert_eq!(
            compare_items(&a, &b, SortDirection::Descending),
            Ordering::Greater
        );
    }

    #[test]
    fn sort_exact_ties_keep_digest_then_grouping_order() {
        let a = item(5, 2, Some(0.5));
        let b = item(5, 1, Some(0.5));
        // Same digest: grouping bytes break the tie regardless of direction.
        assert_eq!(
            compare_items(&a, &b, SortDirection::Ascending),
            Ordering::Greater
        );
        assert_eq!(
            compare_items(&a, &b, SortDirection::Descending),
            Ordering::Greater
        );
    }

    #[test]
    fn bulk_triage_round_trips_including_empty_sentinel() {
        let mut inner = BTreeMap::new();
        inner.insert(Digest([1; 16]), TriageLabel::Positive);
        inner.insert(Digest([2; 16]), TriageLabel::Empty);
        let mut map = BTreeMap::new();
        map.insert("circle-test".to_string(), inner);
        let bulk = BulkTriage(map);

        let json = serde_json::to_string(&bulk).unwrap();
        let back: BulkTriage = serde_json::from_str(&json).unwrap();
        assert_eq!(bulk, back);
    }
}
