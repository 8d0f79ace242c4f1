//! Search, caching, and blame core for a visual-test triage service.
//!
//! The crate answers one family of questions over an image-correctness
//! database: which digests match a filter, how far is each from its closest
//! triaged references, which commit range introduced an untriaged digest,
//! and how do a grouping's digests cluster by pixel distance.  Everything
//! reads from a single SQLite store ([`storage::Store`]); hot lookups go
//! through [`search::caches::Caches`] and per-corpus materialized views.
//!
//! Entry point for callers is [`search::engine::SearchEngine`].

pub mod config;
pub mod model;
pub mod search;
pub mod storage;
