//! Independently-refreshed in-memory indexes.
//!
//! Each cache is guarded by its own lock, held only for the duration of a
//! swap or a single lookup — never across a database round trip.  Writers
//! replace the whole structure atomically (swap, not in-place mutation), so
//! readers can never observe a partially-rebuilt cache.  Background refresh
//! runs on fixed intervals; reads may be up to one interval stale, which is
//! an accepted relaxed-consistency tradeoff for this read-heavy workload.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, tick};
use fxhash::{FxHashMap, FxHashSet};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::model::types::{Commit, CommitId, Digest, GroupingId, OptionsId, Params, ParamSet, TraceId};
use crate::storage::sqlite::commit_from_row;

/// Capability used to compute public visibility: given a trace's full key
/// set, decide whether it may be shown.  Constructed by an external
/// rule-matching component.
pub trait ParamsMatcher: Send + Sync {
    fn matches(&self, params: &Params) -> bool;
}

impl<F> ParamsMatcher for F
where
    F: Fn(&Params) -> bool + Send + Sync,
{
    fn matches(&self, params: &Params) -> bool {
        self(params)
    }
}

/// The cache manager.  One instance per engine, composed at construction.
pub struct Caches {
    digests_on_primary: RwLock<Arc<FxHashSet<(GroupingId, Digest)>>>,
    public_traces: RwLock<Option<Arc<FxHashSet<TraceId>>>>,

    commits: Mutex<LruCache<CommitId, Commit>>,
    trace_keys: Mutex<LruCache<TraceId, Arc<Params>>>,
    option_keys: Mutex<LruCache<OptionsId, Arc<Params>>>,
    grouping_keys: Mutex<LruCache<GroupingId, Arc<Params>>>,

    paramsets: RwLock<FxHashMap<String, (Instant, Arc<ParamSet>)>>,
    paramset_ttl: Duration,
}

fn lru_capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).expect("cache capacities are validated at construction")
}

impl Caches {
    pub fn new(cfg: &SearchConfig) -> Self {
        cfg.validate();
        Self {
            digests_on_primary: RwLock::new(Arc::new(FxHashSet::default())),
            public_traces: RwLock::new(None),
            commits: Mutex::new(LruCache::new(lru_capacity(cfg.commit_cache_capacity))),
            trace_keys: Mutex::new(LruCache::new(lru_capacity(cfg.trace_cache_capacity))),
            option_keys: Mutex::new(LruCache::new(lru_capacity(cfg.option_cache_capacity))),
            grouping_keys: Mutex::new(LruCache::new(lru_capacity(cfg.grouping_cache_capacity))),
            paramsets: RwLock::new(FxHashMap::default()),
            paramset_ttl: cfg.paramset_ttl,
        }
    }

    // ---------------------------------------------------------------------
    // Digests seen on the primary branch
    // ---------------------------------------------------------------------

    /// Has this (grouping, digest) pair been observed on the primary branch
    /// within the active tile window?
    pub fn digest_on_primary(&self, grouping: GroupingId, digest: Digest) -> bool {
        self.digests_on_primary.read().contains(&(grouping, digest))
    }

    /// Atomically replace the digests-on-primary set.  Also the hook tests
    /// use to simulate staleness.
    pub fn replace_digests_on_primary(&self, set: FxHashSet<(GroupingId, Digest)>) {
        *self.digests_on_primary.write() = Arc::new(set);
    }

    /// Rebuild the set from the tiled digest table over the given tile
    /// range (the active window).
    pub fn rebuild_digests_on_primary(
        &self,
        conn: &Connection,
        tile_range: Option<(i64, i64)>,
    ) -> Result<()> {
        let mut set = FxHashSet::default();
        if let Some((start, end)) = tile_range {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT grouping_id, digest FROM TiledTraceDigests
                     WHERE tile_id BETWEEN ? AND ?",
                )
                .context("preparing digests-on-primary rebuild")?;
            let rows = stmt
                .query_map([start, end], |r| Ok((r.get(0)?, r.get(1)?)))
                .context("rebuilding digests-on-primary")?;
            for row in rows {
                set.insert(row?);
            }
        }
        debug!(size = set.len(), "digests-on-primary rebuilt");
        self.replace_digests_on_primary(set);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Publicly-visible traces
    // ---------------------------------------------------------------------

    /// Whether a public view is configured at all.
    pub fn public_view_active(&self) -> bool {
        self.public_traces.read().is_some()
    }

    /// Visibility check.  With no public view configured every trace is
    /// visible.
    pub fn is_publicly_visible(&self, trace: TraceId) -> bool {
        match self.public_traces.read().as_ref() {
            None => true,
            Some(set) => set.contains(&trace),
        }
    }

    /// Apply the matcher to every trace's key set and swap in the result.
    pub fn rebuild_public_traces(
        &self,
        conn: &Connection,
        matcher: &dyn ParamsMatcher,
    ) -> Result<()> {
        let mut set = FxHashSet::default();
        let mut stmt = conn
            .prepare("SELECT trace_id, keys FROM Traces")
            .context("preparing public-traces rebuild")?;
        let rows = stmt
            .query_map([], |r| {
                let id: TraceId = r.get(0)?;
                let keys: String = r.get(1)?;
                Ok((id, keys))
            })
            .context("rebuilding public traces")?;
        for row in rows {
            let (id, keys) = row?;
            let params: Params =
                serde_json::from_str(&keys).context("parsing trace keys JSON")?;
            if matcher.matches(&params) {
                set.insert(id);
            }
        }
        debug!(size = set.len(), "public traces rebuilt");
        *self.public_traces.write() = Some(Arc::new(set));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Bounded lookup caches (read-through)
    // ---------------------------------------------------------------------

    pub fn commit(&self, conn: &Connection, id: CommitId) -> Result<Option<Commit>> {
        if let Some(c) = self.commits.lock().get(&id) {
            return Ok(Some(c.clone()));
        }
        let commit = conn
            .query_row(
                "SELECT commit_id, git_hash, commit_time, author, subject
                 FROM Commits WHERE commit_id = ?",
                [id],
                commit_from_row,
            )
            .optional()
            .context("looking up commit")?;
        if let Some(c) = &commit {
            self.commits.lock().put(id, c.clone());
        }
        Ok(commit)
    }

    pub fn trace_keys(&self, conn: &Connection, id: TraceId) -> Result<Option<Arc<Params>>> {
        if let Some(p) = self.trace_keys.lock().get(&id) {
            return Ok(Some(p.clone()));
        }
        self.keys_from(conn, "SELECT keys FROM Traces WHERE trace_id = ?", id)
            .map(|loaded| {
                if let Some(p) = &loaded {
                    self.trace_keys.lock().put(id, p.clone());
                }
                loaded
            })
    }

    pub fn grouping_keys(&self, conn: &Connection, id: GroupingId) -> Result<Option<Arc<Params>>> {
        if let Some(p) = self.grouping_keys.lock().get(&id) {
            return Ok(Some(p.clone()));
        }
        self.keys_from(conn, "SELECT keys FROM Groupings WHERE grouping_id = ?", id)
            .map(|loaded| {
                if let Some(p) = &loaded {
                    self.grouping_keys.lock().put(id, p.clone());
                }
                loaded
            })
    }

    pub fn option_keys(&self, conn: &Connection, id: OptionsId) -> Result<Option<Arc<Params>>> {
        if let Some(p) = self.option_keys.lock().get(&id) {
            return Ok(Some(p.clone()));
        }
        self.keys_from(conn, "SELECT keys FROM Options WHERE option_id = ?", id)
            .map(|loaded| {
                if let Some(p) = &loaded {
                    self.option_keys.lock().put(id, p.clone());
                }
                loaded
            })
    }

    fn keys_from(
        &self,
        conn: &Connection,
        sql: &str,
        id: impl rusqlite::ToSql,
    ) -> Result<Option<Arc<Params>>> {
        let keys: Option<String> = conn
            .query_row(sql, [&id], |r| r.get(0))
            .optional()
            .context("looking up key set")?;
        match keys {
            Some(json) => {
                let params: Params = serde_json::from_str(&json).context("parsing keys JSON")?;
                Ok(Some(Arc::new(params)))
            }
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Short-TTL paramset cache
    // ---------------------------------------------------------------------

    /// Return the cached paramset under `key` if it is fresh, otherwise run
    /// `compute` (outside any lock) and cache the result.
    pub fn paramset_cached(
        &self,
        key: &str,
        compute: impl FnOnce() -> Result<ParamSet>,
    ) -> Result<Arc<ParamSet>> {
        if let Some((at, ps)) = self.paramsets.read().get(key)
            && at.elapsed() < self.paramset_ttl
        {
            return Ok(ps.clone());
        }
        let fresh = Arc::new(compute()?);
        self.paramsets
            .write()
            .insert(key.to_string(), (Instant::now(), fresh.clone()));
        Ok(fresh)
    }
}

// -------------------------------------------------------------------------
// Background refresh
// -------------------------------------------------------------------------

/// One named refresh task with its own interval.
pub struct RefreshJob {
    pub name: &'static str,
    pub interval: Duration,
    pub run: Box<dyn Fn() -> Result<()> + Send>,
}

/// Owns the background refresh threads.  Each job runs once at spawn and
/// then on its interval until `shutdown` is called (or the refresher is
/// dropped).  Jobs are independent of in-flight requests by design.
pub struct Refresher {
    shutdown: Option<crossbeam_channel::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Refresher {
    pub fn spawn(jobs: Vec<RefreshJob>) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let handles = jobs
            .into_iter()
            .map(|job| {
                let rx = shutdown_rx.clone();
                std::thread::Builder::new()
                    .name(format!("refresh-{}", job.name))
                    .spawn(move || {
                        if let Err(e) = (job.run)() {
                            warn!(job = job.name, error = %e, "initial refresh failed");
                        }
                        let ticker = tick(job.interval);
                        loop {
                            select! {
                                recv(ticker) -> _ => {
                                    if let Err(e) = (job.run)() {
                                        warn!(job = job.name, error = %e, "refresh failed");
                                    }
                                }
                                recv(rx) -> _ => break,
                            }
                        }
                        debug!(job = job.name, "refresher stopped");
                    })
                    .expect("spawning refresh thread")
            })
            .collect();
        Self {
            shutdown: Some(shutdown_tx),
            handles,
        }
    }

    /// Stop all refresh threads and wait for them to exit.
    pub fn shutdown(mut self) {
        self.shutdown.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.shutdown.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
