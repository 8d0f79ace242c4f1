//! Per-request context: the active commit window and, for changelist
//! overlays, the qualified CL/patchset under inspection.
//!
//! The context is built once at the start of a request and threaded by
//! reference through every pipeline stage.  Nothing here is ambient or
//! process-global.

use anyhow::{Context as _, Result};
use fxhash::FxHashMap;
use rusqlite::Connection;

use crate::model::types::{Commit, CommitId, tile_for_commit};
use crate::storage::sqlite::commit_from_row;

/// The changelist/patchset a request is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedCl {
    /// Code-review system, e.g. `gerrit`.
    pub system: String,
    /// Qualified changelist id (`<system>_<id>`).
    pub changelist_id: String,
    /// Qualified patchset id.
    pub patchset_id: String,
    /// 1-based patchset order within the changelist.
    pub patchset_order: i64,
}

/// Commit window plus commit-id -> ordinal mapping for one request.
///
/// Commits are ordered oldest to newest; the ordinal of a commit is its
/// index into that vector, which doubles as the index into fixed-length
/// per-trace history arrays.
#[derive(Debug, Clone)]
pub struct RequestContext {
    commits: Vec<Commit>,
    positions: FxHashMap<CommitId, usize>,
    pub tile_width: i64,
    pub cl: Option<QualifiedCl>,
}

impl RequestContext {
    /// Resolve the most recent `window_size` commits that have data.
    pub fn for_window(conn: &Connection, window_size: usize, tile_width: i64) -> Result<Self> {
        let mut stmt = conn
            .prepare(
                "SELECT c.commit_id, c.git_hash, c.commit_time, c.author, c.subject
                 FROM Commits c
                 JOIN (SELECT commit_id FROM CommitsWithData
                       ORDER BY commit_id DESC LIMIT ?) w
                   ON w.commit_id = c.commit_id
                 ORDER BY c.commit_id ASC",
            )
            .context("preparing window query")?;
        let commits = stmt
            .query_map([window_size as i64], commit_from_row)
            .context("resolving commit window")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self::from_commits(commits, tile_width))
    }

    /// Build a context from an already-resolved commit list (tests, CL
    /// overlay construction).
    pub fn from_commits(commits: Vec<Commit>, tile_width: i64) -> Self {
        let positions = commits
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.id, idx))
            .collect();
        Self {
            commits,
            positions,
            tile_width,
            cl: None,
        }
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Ordinal of a commit within the window, if it is in the window.
    pub fn position(&self, id: CommitId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn commit_at(&self, idx: usize) -> &Commit {
        &self.commits[idx]
    }

    /// Oldest commit id in the window.
    pub fn window_start(&self) -> Option<CommitId> {
        self.commits.first().map(|c| c.id)
    }

    /// Newest commit id in the window.
    pub fn window_end(&self) -> Option<CommitId> {
        self.commits.last().map(|c| c.id)
    }

    /// Inclusive tile range covering the window.
    pub fn tile_range(&self) -> Option<(i64, i64)> {
        let start = self.window_start()?;
        let end = self.window_end()?;
        Some((
            tile_for_commit(start, self.tile_width),
            tile_for_commit(end, self.tile_width),
        ))
    }

    /// Append the synthetic "current" commit a changelist overlay shows as
    /// the newest column.  It never collides with a real commit because CL
    /// data is keyed past the end of the primary branch.
    pub fn push_synthetic_commit(&mut self, commit: Commit) {
        self.positions.insert(commit.id, self.commits.len());
        self.commits.push(commit);
    }
}
