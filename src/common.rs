//! Common types and constants used throughout the pipeline.

use std::path::{Path, PathBuf};

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use datafusion::prelude::{SessionConfig, SessionContext};
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Column Names
// ============================================================================

/// Vocabulary table: namespace-prefixed token string.
pub const TOKEN_STR_COL: &str = "token_str";
/// Vocabulary table: dense integer token id.
pub const TOKEN_ID_COL: &str = "token_id";

/// Resolved event stream columns. These are internal to the partitioner's
/// query plan; only `user_id` survives into the shard files unchanged.
pub const USER_COL: &str = "user_id";
pub const TS_COL: &str = "ts";
pub const TOKEN_KEY_COL: &str = "token_key";
pub const DOMAIN_RANK_COL: &str = "domain_rank";
pub const SHARD_COL: &str = "shard";

/// Shard file columns.
pub const SEQUENCE_COL: &str = "sequence";
pub const TIMESTAMPS_COL: &str = "timestamps";

/// File name of the persisted vocabulary table inside the output directory.
pub const VOCAB_FILE: &str = "vocab.parquet";
/// File name of the vocabulary summary sidecar.
pub const VOCAB_SUMMARY_FILE: &str = "vocab_summary.json";
/// Subdirectory of the output directory holding shard files.
pub const SHARDS_DIR: &str = "shards";

// ============================================================================
// Index NewTypes
// ============================================================================

/// Dense integer id of a vocabulary token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u32);

/// Index of an output shard, in `[0, shard_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardIdx(pub u32);

impl ShardIdx {
    /// File name of this shard's output partition.
    pub fn file_name(self) -> String {
        format!("shard_{}.parquet", self.0)
    }
}

// ============================================================================
// Special Tokens
// ============================================================================

/// The reserved block of special tokens at the bottom of the id space.
///
/// Special token `i` in `names` receives id `i`. Content tokens start at
/// `names.len()`. The padding token must sit at id 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub names: Vec<String>,
    pub padding: String,
    pub unknown: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            names: ["[PAD]", "[CLS]", "[SEP]", "[MASK]", "[UNK]"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            padding: "[PAD]".to_string(),
            unknown: "[UNK]".to_string(),
        }
    }
}

impl SpecialTokens {
    /// Number of reserved ids; the first content id.
    pub fn reserved(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn id_of(&self, name: &str) -> Option<TokenId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| TokenId(i as u32))
    }

    /// Id of the padding token. Only meaningful on a validated config.
    pub fn padding_id(&self) -> TokenId {
        self.id_of(&self.padding).unwrap_or_default()
    }

    /// Id assigned to events whose entity has no vocabulary entry.
    /// Only meaningful on a validated config.
    pub fn unknown_id(&self) -> TokenId {
        self.id_of(&self.unknown).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.names.is_empty() {
            return Err(PipelineError::Config(
                "special token block must not be empty".to_string(),
            ));
        }
        for (i, name) in self.names.iter().enumerate() {
            if self.names[..i].contains(name) {
                return Err(PipelineError::Config(format!(
                    "special token '{name}' is listed twice"
                )));
            }
        }
        match self.id_of(&self.padding) {
            Some(TokenId(0)) => {}
            Some(id) => {
                return Err(PipelineError::Config(format!(
                    "padding token '{}' must have id 0, found {}",
                    self.padding, id.0
                )));
            }
            None => {
                return Err(PipelineError::Config(format!(
                    "padding token '{}' is not in the special token block",
                    self.padding
                )));
            }
        }
        if self.id_of(&self.unknown).is_none() {
            return Err(PipelineError::Config(format!(
                "unknown token '{}' is not in the special token block",
                self.unknown
            )));
        }
        if self.padding == self.unknown {
            return Err(PipelineError::Config(
                "padding and unknown tokens must differ".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tokens and Shards
// ============================================================================

/// Build the namespace-prefixed token string for a local entity id.
pub fn token_key(prefix: &str, local_id: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + local_id.len());
    key.push_str(prefix);
    key.push_str(local_id);
    key
}

/// FNV-1a, 64-bit. Pinned so shard assignment is reproducible across runs,
/// platforms and implementations.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Shard of a user: FNV-1a 64 of the UTF-8 user id, modulo `shard_count`.
///
/// # Panics
/// Panics if `shard_count` is zero.
pub fn shard_of(user_id: &str, shard_count: u32) -> ShardIdx {
    assert!(shard_count > 0, "shard_count must be positive");
    ShardIdx((fnv1a_64(user_id.as_bytes()) % shard_count as u64) as u32)
}

// ============================================================================
// Query Engine
// ============================================================================

/// Session used by every stage. Identifier normalization is off so mixed-case
/// column names from the raw files survive SQL unchanged.
pub fn session_context() -> SessionContext {
    let config = SessionConfig::new()
        .set_bool("datafusion.sql_parser.enable_ident_normalization", false);
    SessionContext::new_with_config(config)
}

// ============================================================================
// Error Type
// ============================================================================

/// Coarse failure classes, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Configuration,
    Discovery,
    Integrity,
    Io,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureClass::Configuration => "configuration",
            FailureClass::Discovery => "discovery",
            FailureClass::Integrity => "integrity",
            FailureClass::Io => "io",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown domain '{0}'")]
    UnknownDomain(String),

    #[error("catalog '{catalog}' not found at {}", path.display())]
    MissingCatalog { catalog: String, path: PathBuf },

    #[error("catalog '{catalog}' has no column '{column}' ({})", path.display())]
    MissingColumn {
        catalog: String,
        column: String,
        path: PathBuf,
    },

    #[error("no event files found for any configured domain")]
    NoEvents,

    #[error("token '{token}' produced by both namespace '{first}' and namespace '{second}'")]
    TokenCollision {
        token: String,
        first: String,
        second: String,
    },

    #[error("vocabulary integrity check failed for {}: {reason}", path.display())]
    Vocabulary { path: PathBuf, reason: String },

    #[error("domain '{domain}' changed row count during resolution ({rows_in} in, {rows_out} out)")]
    RowCountMismatch {
        domain: String,
        rows_in: u64,
        rows_out: u64,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error on {}: {source}", path.display())]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("query engine error: {0}")]
    Engine(#[from] DataFusionError),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn class(&self) -> FailureClass {
        match self {
            PipelineError::Config(_)
            | PipelineError::ConfigParse { .. }
            | PipelineError::UnknownDomain(_)
            | PipelineError::MissingCatalog { .. }
            | PipelineError::MissingColumn { .. } => FailureClass::Configuration,
            PipelineError::NoEvents => FailureClass::Discovery,
            PipelineError::TokenCollision { .. }
            | PipelineError::Vocabulary { .. }
            | PipelineError::RowCountMismatch { .. } => FailureClass::Integrity,
            PipelineError::Io { .. }
            | PipelineError::Parquet { .. }
            | PipelineError::Arrow(_)
            | PipelineError::Engine(_)
            | PipelineError::Json(_) => FailureClass::Io,
        }
    }
}

/// Attach a path to an `std::io::Error`.
pub fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Attach a path to a `ParquetError`.
pub fn parquet_at(path: &Path) -> impl FnOnce(ParquetError) -> PipelineError + '_ {
    move |source| PipelineError::Parquet {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        // Published FNV-1a 64 test vectors.
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_shard_of_is_stable_and_in_range() {
        for count in [1u32, 2, 7, 50] {
            for user in ["0", "1", "42", "user-9", ""] {
                let a = shard_of(user, count);
                let b = shard_of(user, count);
                assert_eq!(a, b);
                assert!(a.0 < count);
            }
        }
        assert_eq!(shard_of("anything", 1), ShardIdx(0));
    }

    #[test]
    fn test_shard_of_spreads_users() {
        let count = 8;
        let mut hits = vec![0usize; count as usize];
        for user in 0..8_000 {
            hits[shard_of(&user.to_string(), count).0 as usize] += 1;
        }
        // Every shard should get a reasonable share of 8k sequential ids.
        assert!(hits.iter().all(|&h| h > 700), "skewed shards: {hits:?}");
    }

    #[test]
    fn test_default_special_tokens() {
        let special = SpecialTokens::default();
        special.validate().unwrap();
        assert_eq!(special.reserved(), 5);
        assert_eq!(special.padding_id(), TokenId(0));
        assert_eq!(special.unknown_id(), TokenId(4));
    }

    #[test]
    fn test_special_tokens_rejects_bad_blocks() {
        let mut special = SpecialTokens::default();
        special.names.swap(0, 1);
        assert!(special.validate().is_err(), "padding must be id 0");

        let mut special = SpecialTokens::default();
        special.unknown = "[NOPE]".to_string();
        assert!(special.validate().is_err());

        let mut special = SpecialTokens::default();
        special.names.push("[PAD]".to_string());
        assert!(special.validate().is_err());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            PipelineError::UnknownDomain("x".into()).class(),
            FailureClass::Configuration
        );
        assert_eq!(PipelineError::NoEvents.class(), FailureClass::Discovery);
        let collision = PipelineError::TokenCollision {
            token: "A_1".into(),
            first: "a".into(),
            second: "b".into(),
        };
        assert_eq!(collision.class(), FailureClass::Integrity);
        assert_eq!(token_key("MP_", "10"), "MP_10");
    }
}
