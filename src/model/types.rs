//! Core data model: content-hash identifiers, triage labels, commits,
//! params/paramsets, and changelist metadata.
//!
//! Trace, grouping, and option identifiers are pure functions of their
//! canonical parameter serialization: the key/value map is serialized with
//! sorted keys (`BTreeMap` iteration order), hashed with SHA-256, and
//! truncated to 16 bytes.  Digests arrive from the ingestion side already
//! hashed; the core only carries them around.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Length in bytes of every content-hash identifier.
pub const HASH_LEN: usize = 16;

/// Trace key that selects the corpus (top-level category).
pub const CORPUS_KEY: &str = "source_type";

/// Trace key that names the test; bulk-retriage maps are keyed by it.
pub const TEST_KEY: &str = "name";

/// A single trace's full key/value parameter set.
pub type Params = BTreeMap<String, String>;

/// A deduplicated key -> sorted values map aggregated over many traces.
pub type ParamSet = BTreeMap<String, Vec<String>>;

/// Sequential commit identifier assigned by ingestion.
pub type CommitId = i64;

/// Hash a canonical parameter map into a 16-byte identifier.
fn id_for_params(params: &Params) -> [u8; HASH_LEN] {
    let canonical = serde_json::to_vec(params).expect("BTreeMap serializes");
    let hash = Sha256::digest(&canonical);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&hash[..HASH_LEN]);
    out
}

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; HASH_LEN]);

        impl $name {
            /// Derive the identifier from a canonical parameter map.
            pub fn from_params(params: &Params) -> Self {
                Self(id_for_params(params))
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)?;
                let arr: [u8; HASH_LEN] = bytes
                    .try_into()
                    .map_err(|_| anyhow!("expected {} hex bytes", HASH_LEN))?;
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                struct HexVisitor;
                impl Visitor<'_> for HexVisitor {
                    type Value = $name;
                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "a {}-byte lowercase hex string", HASH_LEN)
                    }
                    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<$name, E> {
                        $name::from_hex(v).map_err(de::Error::custom)
                    }
                }
                deserializer.deserialize_str(HexVisitor)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::Borrowed(ValueRef::Blob(&self.0)))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let blob = value.as_blob()?;
                let arr: [u8; HASH_LEN] = blob
                    .try_into()
                    .map_err(|_| FromSqlError::InvalidBlobSize {
                        expected_size: HASH_LEN,
                        blob_size: blob.len(),
                    })?;
                Ok(Self(arr))
            }
        }

        impl From<$name> for Value {
            fn from(id: $name) -> Value {
                Value::Blob(id.0.to_vec())
            }
        }
    };
}

hash_id!(
    /// Content hash of a rendered image.
    Digest
);
hash_id!(
    /// Identity of one test configuration (hash of the full key set).
    TraceId
);
hash_id!(
    /// Identity of "which test this is" (hash of the grouping key subset).
    GroupingId
);
hash_id!(
    /// Identity of a non-identity options key set attached to a data point.
    OptionsId
);

// -------------------------------------------------------------------------
// Triage labels
// -------------------------------------------------------------------------

/// Triage label for a (grouping, digest) pair.  Untriaged is the default
/// for pairs with no expectation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Positive,
    Negative,
    #[default]
    Untriaged,
}

impl Label {
    /// One-character form used in the Expectations tables.
    pub fn as_sql(self) -> &'static str {
        match self {
            Label::Positive => "p",
            Label::Negative => "n",
            Label::Untriaged => "u",
        }
    }

    pub fn from_sql(s: &str) -> Option<Self> {
        match s {
            "p" => Some(Label::Positive),
            "n" => Some(Label::Negative),
            "u" => Some(Label::Untriaged),
            _ => None,
        }
    }

    pub fn is_triaged(self) -> bool {
        !matches!(self, Label::Untriaged)
    }
}

/// Label suggestion carried by bulk-retriage maps.  `Empty` (serialized as
/// `""`) marks digests that have no closest reference at all; it survives a
/// serialize/deserialize round trip losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TriageLabel {
    Positive,
    Negative,
    #[default]
    Untriaged,
    Empty,
}

impl TriageLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            TriageLabel::Positive => "positive",
            TriageLabel::Negative => "negative",
            TriageLabel::Untriaged => "untriaged",
            TriageLabel::Empty => "",
        }
    }
}

impl From<Label> for TriageLabel {
    fn from(label: Label) -> Self {
        match label {
            Label::Positive => TriageLabel::Positive,
            Label::Negative => TriageLabel::Negative,
            Label::Untriaged => TriageLabel::Untriaged,
        }
    }
}

impl Serialize for TriageLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TriageLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "positive" => Ok(TriageLabel::Positive),
            "negative" => Ok(TriageLabel::Negative),
            "untriaged" => Ok(TriageLabel::Untriaged),
            "" => Ok(TriageLabel::Empty),
            other => Err(de::Error::custom(format!("unknown triage label {other:?}"))),
        }
    }
}

// -------------------------------------------------------------------------
// Commits and tiles
// -------------------------------------------------------------------------

/// One landed commit on the primary branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub git_hash: String,
    pub ts: DateTime<Utc>,
    pub author: String,
    pub subject: String,
}

/// Tile containing the given commit.  Tiles shard historical lookups into
/// contiguous fixed-width commit-id ranges.
pub fn tile_for_commit(commit_id: CommitId, tile_width: i64) -> i64 {
    commit_id / tile_width
}

// -------------------------------------------------------------------------
// Changelists
// -------------------------------------------------------------------------

/// An in-review change on the code-review system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changelist {
    /// Qualified id: `<system>_<cl id>`.
    pub id: String,
    pub system: String,
    pub status: String,
    pub owner: String,
    pub subject: String,
    pub last_ingested_data: DateTime<Utc>,
}

/// One revision of a changelist; `order` is 1-based within the CL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patchset {
    /// Qualified id: `<system>_<ps hash>`.
    pub id: String,
    pub changelist_id: String,
    pub order: i64,
    pub git_hash: String,
}

/// Qualify a changelist id with its review-system prefix.
pub fn qualify_cl(system: &str, cl_id: &str) -> String {
    format!("{system}_{cl_id}")
}

// -------------------------------------------------------------------------
// Diff metrics
// -------------------------------------------------------------------------

/// Precomputed pairwise image-distance record.  Produced by the external
/// diff-computation collaborator; the core only reads these rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffRecord {
    pub left: Digest,
    pub right: Digest,
    pub num_pixels_diff: i64,
    pub percent_pixels_diff: f64,
    pub max_channel_diff: i64,
    pub combined_metric: f64,
}

// -------------------------------------------------------------------------
// ParamSet helpers
// -------------------------------------------------------------------------

/// Fold one trace's params into an aggregate paramset.  Values are kept
/// sorted and deduplicated so two paramsets compare structurally.
pub fn paramset_add(paramset: &mut ParamSet, params: &Params) {
    for (k, v) in params {
        let values = paramset.entry(k.clone()).or_default();
        if let Err(pos) = values.binary_search(v) {
            values.insert(pos, v.clone());
        }
    }
}
