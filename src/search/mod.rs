//! Search core facade.
//!
//! - **[`query`]**: injection-safe dynamic SQL construction for trace filters.
//! - **[`context`]**: per-request commit window and changelist scoping.
//! - **[`caches`]**: independently-refreshed in-memory indexes.
//! - **[`views`]**: per-corpus materialized view management.
//! - **[`engine`]**: the primary search read path and changelist overlay.
//! - **[`blame`]**: commit-range attribution for untriaged digests.
//! - **[`cluster`]**: similarity-graph construction over filtered digests.

pub mod blame;
pub mod caches;
pub mod cluster;
pub mod context;
pub mod engine;
pub mod query;
pub mod views;

use thiserror::Error;

/// Request-validation failures.  These are reported to the caller
/// immediately and never retried, unlike storage errors which surface as a
/// single aggregate failure for the whole request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("corpus must not be empty")]
    EmptyCorpus,
    #[error("filter key {0:?} contains characters outside the allowed set")]
    UnsafeKey(String),
    #[error("filter value {value:?} for key {key:?} contains characters outside the allowed set")]
    UnsafeValue { key: String, value: String },
    #[error("corpus {0:?} is not usable as a view name fragment")]
    UnsafeCorpus(String),
    #[error("unknown changelist {0:?}")]
    UnknownChangelist(String),
    #[error("changelist {changelist:?} has no patchset with order {order}")]
    UnknownPatchset { changelist: String, order: i64 },
}
