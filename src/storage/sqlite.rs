//! `SQLite` backend: schema, pragmas, and connection handling.
//!
//! The schema below is the read boundary the core consumes.  All tables
//! except the `mv_*` materialized-view tables are populated by ingestion and
//! by the diff-computation collaborator; the core treats them as a
//! read-mostly, append-only dataset and approximates point-in-time
//! consistency with bounded-staleness snapshot reads (no transactions span a
//! request pipeline).

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, Row};
use tracing::info;

use crate::model::types::{Changelist, Commit, Patchset};

/// Schema consumed (and, for `mv_*`, owned) by the search core.
///
/// Identifier columns are 16-byte BLOBs; `keys` columns hold canonical JSON
/// objects so filter keys can be addressed with `json_extract`.
/// `matches_any_ignore_rule` is tri-state: 1 matches, 0 does not, NULL means
/// no ignore rules were configured when the trace was last written.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Commits (
    commit_id   INTEGER PRIMARY KEY,
    git_hash    TEXT NOT NULL,
    commit_time INTEGER NOT NULL,
    author      TEXT NOT NULL,
    subject     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS CommitsWithData (
    commit_id INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS Groupings (
    grouping_id BLOB PRIMARY KEY,
    keys        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS Options (
    option_id BLOB PRIMARY KEY,
    keys      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS Traces (
    trace_id                BLOB PRIMARY KEY,
    grouping_id             BLOB NOT NULL,
    corpus                  TEXT NOT NULL,
    keys                    TEXT NOT NULL,
    matches_any_ignore_rule INTEGER
);
CREATE INDEX IF NOT EXISTS idx_traces_grouping ON Traces (grouping_id);

CREATE TABLE IF NOT EXISTS TraceValues (
    trace_id  BLOB NOT NULL,
    commit_id INTEGER NOT NULL,
    digest    BLOB NOT NULL,
    option_id BLOB,
    PRIMARY KEY (trace_id, commit_id)
);
CREATE INDEX IF NOT EXISTS idx_tracevalues_commit ON TraceValues (commit_id);

CREATE TABLE IF NOT EXISTS ValuesAtHead (
    trace_id                BLOB PRIMARY KEY,
    grouping_id             BLOB NOT NULL,
    corpus                  TEXT NOT NULL,
    keys                    TEXT NOT NULL,
    digest                  BLOB NOT NULL,
    option_id               BLOB,
    most_recent_commit_id   INTEGER NOT NULL,
    matches_any_ignore_rule INTEGER
);
CREATE INDEX IF NOT EXISTS idx_vah_corpus ON ValuesAtHead (corpus);
CREATE INDEX IF NOT EXISTS idx_vah_grouping ON ValuesAtHead (grouping_id);

CREATE TABLE IF NOT EXISTS TiledTraceDigests (
    tile_id     INTEGER NOT NULL,
    trace_id    BLOB NOT NULL,
    grouping_id BLOB NOT NULL,
    digest      BLOB NOT NULL,
    PRIMARY KEY (tile_id, trace_id, digest)
);
CREATE INDEX IF NOT EXISTS idx_tiled_grouping ON TiledTraceDigests (grouping_id, tile_id);

CREATE TABLE IF NOT EXISTS Expectations (
    grouping_id BLOB NOT NULL,
    digest      BLOB NOT NULL,
    label       TEXT NOT NULL DEFAULT 'u',
    PRIMARY KEY (grouping_id, digest)
);

CREATE TABLE IF NOT EXISTS DiffMetrics (
    left_digest        BLOB NOT NULL,
    right_digest       BLOB NOT NULL,
    num_pixels_diff    INTEGER NOT NULL,
    percent_pixels_diff REAL NOT NULL,
    max_channel_diff   INTEGER NOT NULL,
    combined_metric    REAL NOT NULL,
    PRIMARY KEY (left_digest, right_digest)
);

CREATE TABLE IF NOT EXISTS Changelists (
    changelist_id      TEXT PRIMARY KEY,
    system             TEXT NOT NULL,
    status             TEXT NOT NULL,
    owner              TEXT NOT NULL,
    subject            TEXT NOT NULL,
    last_ingested_data INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS Patchsets (
    patchset_id   TEXT PRIMARY KEY,
    changelist_id TEXT NOT NULL,
    ps_order      INTEGER NOT NULL,
    git_hash      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patchsets_cl ON Patchsets (changelist_id, ps_order);

CREATE TABLE IF NOT EXISTS SecondaryBranchValues (
    branch_name  TEXT NOT NULL,
    version_name TEXT NOT NULL,
    trace_id     BLOB NOT NULL,
    grouping_id  BLOB NOT NULL,
    digest       BLOB NOT NULL,
    option_id    BLOB,
    PRIMARY KEY (branch_name, version_name, trace_id)
);

CREATE TABLE IF NOT EXISTS SecondaryBranchExpectations (
    branch_name TEXT NOT NULL,
    grouping_id BLOB NOT NULL,
    digest      BLOB NOT NULL,
    label       TEXT NOT NULL,
    PRIMARY KEY (branch_name, grouping_id, digest)
);
";

/// Handle to the triage database.
///
/// A `Store` is cheap to clone around behind an `Arc`; it hands out one
/// `Connection` per caller because parallel sub-queries must never share a
/// connection.  WAL mode keeps concurrent readers off each other's backs.
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let start = Instant::now();
        let conn = Connection::open(&path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        apply_pragmas(&conn)?;
        conn.execute_batch(SCHEMA).context("creating schema")?;
        info!(
            path = %path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "opened triage database"
        );
        Ok(Self { path })
    }

    /// A connection for read-only query work.
    pub fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening reader for {}", self.path.display()))?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(conn)
    }

    /// A connection that may write (materialized-view refresh, test setup).
    pub fn writer(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("opening writer for {}", self.path.display()))?;
        apply_pragmas(&conn)?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

// -------------------------------------------------------------------------
// Row mapping helpers
// -------------------------------------------------------------------------

/// Seconds-since-epoch column to `DateTime<Utc>`.
pub fn ts_from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Map a `Commits` row selected as (commit_id, git_hash, commit_time,
/// author, subject).
pub fn commit_from_row(row: &Row<'_>) -> rusqlite::Result<Commit> {
    Ok(Commit {
        id: row.get(0)?,
        git_hash: row.get(1)?,
        ts: ts_from_epoch(row.get(2)?),
        author: row.get(3)?,
        subject: row.get(4)?,
    })
}

/// Map a `Changelists` row selected as (changelist_id, system, status,
/// owner, subject, last_ingested_data).
pub fn changelist_from_row(row: &Row<'_>) -> rusqlite::Result<Changelist> {
    Ok(Changelist {
        id: row.get(0)?,
        system: row.get(1)?,
        status: row.get(2)?,
        owner: row.get(3)?,
        subject: row.get(4)?,
        last_ingested_data: ts_from_epoch(row.get(5)?),
    })
}

/// Map a `Patchsets` row selected as (patchset_id, changelist_id, ps_order,
/// git_hash).
pub fn patchset_from_row(row: &Row<'_>) -> rusqlite::Result<Patchset> {
    Ok(Patchset {
        id: row.get(0)?,
        changelist_id: row.get(1)?,
        order: row.get(2)?,
        git_hash: row.get(3)?,
    })
}

/// Build `?,?,...` for a dynamic IN list.
pub fn sql_placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}
