//! Global token vocabulary.
//!
//! ## Id layout
//!
//! ```text
//! 0 .. R              special tokens, in configured order ([PAD] = 0, ..., [UNK])
//! R .. R + n_0        first catalog's tokens, in catalog input order
//! R + n_0 .. ...      next catalog, and so on
//! ```
//!
//! The layout depends only on the config and the catalog contents, so
//! rebuilding on unchanged catalogs reproduces the same table.
//!
//! ## Persisted form
//!
//! - `vocab.parquet`       — `(token_str: Utf8, token_id: UInt32)`, sorted by id
//! - `vocab_summary.json`  — special ids and the id range of every namespace
//!
//! Downstream stages never load the table into a map. They open it as a lazy
//! DataFusion relation ([`open_vocabulary`]) and join against it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef, UInt32Type};
use datafusion::prelude::{DataFrame, ParquetReadOptions, SessionContext, cast, col, lit};
use indexmap::IndexMap;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{CatalogScan, scan_catalog};
use crate::common::*;
use crate::config::PipelineConfig;

const WRITE_BATCH_ROWS: usize = 1 << 20;

/// Registered table name of the lazily opened vocabulary.
pub const VOCAB_TABLE: &str = "vocabulary";

// ============================================================================
// Summary
// ============================================================================

/// Contiguous id range `[start, end)` owned by one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRange {
    pub namespace: String,
    pub prefix: String,
    pub start: TokenId,
    pub end: TokenId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularySummary {
    pub num_tokens: u32,
    pub special_tokens: Vec<String>,
    pub padding_id: TokenId,
    pub unknown_id: TokenId,
    pub namespaces: Vec<NamespaceRange>,
}

impl VocabularySummary {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = fs::read(path).map_err(io_at(path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assigns dense ids to namespace-prefixed tokens.
pub struct VocabularyBuilder {
    /// token string → namespace that produced it. Insertion order is id order.
    tokens: IndexMap<String, u32>,
    namespaces: Vec<NamespaceRange>,
    special: SpecialTokens,
    duplicates: u64,
}

/// Sentinel namespace index for special tokens.
const SPECIAL_NAMESPACE: u32 = u32::MAX;

impl VocabularyBuilder {
    pub fn new(special: &SpecialTokens) -> Self {
        let mut tokens = IndexMap::new();
        for name in &special.names {
            tokens.insert(name.clone(), SPECIAL_NAMESPACE);
        }
        Self {
            tokens,
            namespaces: Vec::new(),
            special: special.clone(),
            duplicates: 0,
        }
    }

    fn namespace_name(&self, idx: u32) -> &str {
        if idx == SPECIAL_NAMESPACE {
            "<special>"
        } else {
            &self.namespaces[idx as usize].namespace
        }
    }

    /// Add every id of one catalog under its namespace prefix.
    ///
    /// Repeated ids within the catalog collapse onto their first occurrence.
    /// A token string already claimed by a different namespace is an integrity
    /// fault: prefixes are meant to make that impossible.
    pub fn add_catalog(&mut self, scan: &CatalogScan) -> Result<(), PipelineError> {
        if self.namespaces.iter().any(|n| n.namespace == scan.namespace) {
            return Err(PipelineError::Config(format!(
                "catalog '{}' added to the vocabulary twice",
                scan.namespace
            )));
        }
        let ns_idx = self.namespaces.len() as u32;
        let start = TokenId(self.tokens.len() as u32);
        self.namespaces.push(NamespaceRange {
            namespace: scan.namespace.clone(),
            prefix: scan.prefix.clone(),
            start,
            end: start,
        });

        let mut duplicates = 0u64;
        for id in &scan.ids {
            let key = token_key(&scan.prefix, id);
            match self.tokens.get(&key) {
                Some(&owner) if owner == ns_idx => duplicates += 1,
                Some(&owner) => {
                    return Err(PipelineError::TokenCollision {
                        token: key,
                        first: self.namespace_name(owner).to_string(),
                        second: scan.namespace.clone(),
                    });
                }
                None => {
                    if self.tokens.len() >= u32::MAX as usize {
                        return Err(PipelineError::Config(
                            "vocabulary exceeds the u32 id space".to_string(),
                        ));
                    }
                    self.tokens.insert(key, ns_idx);
                }
            }
        }

        let end = TokenId(self.tokens.len() as u32);
        if let Some(range) = self.namespaces.last_mut() {
            range.end = end;
        }
        if duplicates > 0 {
            debug!(
                "  {}: {} repeated ids collapsed",
                scan.namespace, duplicates
            );
        }
        self.duplicates += duplicates;
        info!(
            "  {} ({}): ids [{}, {})",
            scan.namespace, scan.prefix, start.0, end.0
        );
        Ok(())
    }

    pub fn finish(self) -> Vocabulary {
        let summary = VocabularySummary {
            num_tokens: self.tokens.len() as u32,
            special_tokens: self.special.names.clone(),
            padding_id: self.special.padding_id(),
            unknown_id: self.special.unknown_id(),
            namespaces: self.namespaces,
        };
        Vocabulary {
            tokens: self.tokens.into_keys().collect(),
            summary,
            duplicates: self.duplicates,
        }
    }
}

/// Build a vocabulary from catalog scans, in the order given.
pub fn build_vocabulary(
    special: &SpecialTokens,
    scans: &[CatalogScan],
) -> Result<Vocabulary, PipelineError> {
    let mut builder = VocabularyBuilder::new(special);
    for scan in scans {
        builder.add_catalog(scan)?;
    }
    Ok(builder.finish())
}

/// Scan the configured catalogs one at a time, in config order, folding each
/// into the builder before the next is read. Only one catalog's raw ids are
/// held at once. Any missing catalog aborts the build.
pub fn build_vocabulary_from_catalogs(config: &PipelineConfig) -> Result<Vocabulary, PipelineError> {
    let mut builder = VocabularyBuilder::new(&config.special_tokens);
    let mut ids_read = 0u64;
    for (name, catalog) in &config.catalogs {
        let scan = scan_catalog(name, catalog, &config.data_dir)?;
        ids_read += scan.ids.len() as u64;
        builder.add_catalog(&scan)?;
    }
    debug!("  {} catalog ids read", ids_read);
    Ok(builder.finish())
}

// ============================================================================
// Vocabulary
// ============================================================================

/// A built vocabulary. `tokens[i]` has id `i`.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    pub summary: VocabularySummary,
    /// Repeated catalog ids collapsed during the build.
    pub duplicates: u64,
}

impl Vocabulary {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id.0 as usize).map(|s| s.as_str())
    }

    /// Iterate `(token, id)` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TokenId)> {
        self.tokens
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), TokenId(i as u32)))
    }

    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new(TOKEN_STR_COL, DataType::Utf8, false),
            Field::new(TOKEN_ID_COL, DataType::UInt32, false),
        ]))
    }

    /// Persist `vocab.parquet` and `vocab_summary.json` into `dir`.
    /// Both are written to a temporary name and renamed into place.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(dir).map_err(io_at(dir))?;
        let path = dir.join(VOCAB_FILE);
        let tmp_path = dir.join(format!(".{VOCAB_FILE}.tmp"));

        let schema = Self::schema();
        let file = File::create(&tmp_path).map_err(io_at(&tmp_path))?;
        let mut writer =
            ArrowWriter::try_new(file, schema.clone(), None).map_err(parquet_at(&tmp_path))?;
        for (chunk_idx, chunk) in self.tokens.chunks(WRITE_BATCH_ROWS).enumerate() {
            let first = (chunk_idx * WRITE_BATCH_ROWS) as u32;
            let strs: ArrayRef = Arc::new(StringArray::from_iter_values(chunk.iter()));
            let ids: ArrayRef = Arc::new(UInt32Array::from_iter_values(
                first..first + chunk.len() as u32,
            ));
            let batch = RecordBatch::try_new(schema.clone(), vec![strs, ids])?;
            writer.write(&batch).map_err(parquet_at(&tmp_path))?;
        }
        writer.close().map_err(parquet_at(&tmp_path))?;
        fs::rename(&tmp_path, &path).map_err(io_at(&path))?;

        let summary_path = dir.join(VOCAB_SUMMARY_FILE);
        let summary_tmp = dir.join(format!(".{VOCAB_SUMMARY_FILE}.tmp"));
        let json = serde_json::to_string_pretty(&self.summary)?;
        fs::write(&summary_tmp, &json).map_err(io_at(&summary_tmp))?;
        fs::rename(&summary_tmp, &summary_path).map_err(io_at(&summary_path))?;

        info!(
            "  Wrote {} ({} tokens) and {}",
            path.display(),
            self.len(),
            summary_path.display()
        );
        Ok(path)
    }
}

// ============================================================================
// Lazy access
// ============================================================================

/// Read options that accept whatever extension the file actually has.
pub(crate) fn read_options_for(path: &Path) -> ParquetReadOptions<'static> {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") | None => ".parquet",
        Some("pq") => ".pq",
        Some(_) => "",
    };
    ParquetReadOptions {
        file_extension: ext,
        ..Default::default()
    }
}

/// Open the persisted vocabulary as a lazy relation with canonical column
/// types. Nothing is read until the plan executes.
pub async fn open_vocabulary(ctx: &SessionContext, path: &Path) -> Result<DataFrame, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::Vocabulary {
            path: path.to_path_buf(),
            reason: "file does not exist".to_string(),
        });
    }
    let df = ctx
        .read_parquet(path.to_string_lossy().into_owned(), read_options_for(path))
        .await?;
    Ok(df.select(vec![
        cast(col(TOKEN_STR_COL), DataType::Utf8).alias(TOKEN_STR_COL),
        cast(col(TOKEN_ID_COL), DataType::UInt32).alias(TOKEN_ID_COL),
    ])?)
}

/// Token strings for a handful of ids, filtered inside the query engine.
pub async fn lookup_tokens(
    ctx: &SessionContext,
    path: &Path,
    ids: &[TokenId],
) -> Result<HashMap<TokenId, String>, PipelineError> {
    let mut out = HashMap::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let wanted = ids.iter().map(|id| lit(id.0)).collect();
    let batches = open_vocabulary(ctx, path)
        .await?
        .filter(col(TOKEN_ID_COL).in_list(wanted, false))?
        .collect()
        .await?;
    for batch in &batches {
        let strs = batch.column(0).as_string::<i32>();
        let ids = batch.column(1).as_primitive::<UInt32Type>();
        for i in 0..batch.num_rows() {
            out.insert(TokenId(ids.value(i)), strs.value(i).to_string());
        }
    }
    Ok(out)
}

/// Integrity check of a persisted vocabulary, run before any shard is written.
///
/// Verifies, with aggregate queries over the lazy table, that token strings and
/// ids are unique, that ids are dense from 0, and that the special block sits
/// at its configured ids. Returns the number of entries. Any failure, including
/// an unreadable file or a wrong schema, is reported as an integrity fault.
pub async fn verify_vocabulary(
    ctx: &SessionContext,
    path: &Path,
    special: &SpecialTokens,
) -> Result<u64, PipelineError> {
    let as_integrity = |err: PipelineError| match err {
        PipelineError::Vocabulary { .. } => err,
        other => PipelineError::Vocabulary {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    };
    let vocab = open_vocabulary(ctx, path).await.map_err(as_integrity)?;
    ctx.register_table(CHECK_TABLE, vocab.into_view())?;
    let result = check_registered(ctx, path, special).await;
    ctx.deregister_table(CHECK_TABLE)?;
    result.map_err(as_integrity)
}

const CHECK_TABLE: &str = "vocabulary_check";

async fn check_registered(
    ctx: &SessionContext,
    path: &Path,
    special: &SpecialTokens,
) -> Result<u64, PipelineError> {
    let fail = |reason: String| PipelineError::Vocabulary {
        path: path.to_path_buf(),
        reason,
    };

    let stats = ctx
        .sql(&format!(
            "SELECT CAST(COUNT(*) AS BIGINT), \
                    CAST(COUNT(DISTINCT {TOKEN_STR_COL}) AS BIGINT), \
                    CAST(COUNT(DISTINCT {TOKEN_ID_COL}) AS BIGINT), \
                    CAST(MIN({TOKEN_ID_COL}) AS BIGINT), \
                    CAST(MAX({TOKEN_ID_COL}) AS BIGINT), \
                    CAST(COUNT({TOKEN_STR_COL}) AS BIGINT) \
             FROM {CHECK_TABLE}"
        ))
        .await?
        .collect()
        .await?;
    let Some(batch) = stats.iter().find(|b| b.num_rows() == 1) else {
        return Err(fail("aggregate returned no rows".to_string()));
    };
    let value = |i: usize| -> Option<i64> {
        let c = batch.column(i).as_primitive::<Int64Type>();
        (!c.is_null(0)).then(|| c.value(0))
    };
    let entries = value(0).unwrap_or(0);
    let distinct_tokens = value(1).unwrap_or(0);
    let distinct_ids = value(2).unwrap_or(0);
    let non_null_tokens = value(5).unwrap_or(0);

    if entries == 0 {
        return Err(fail("table is empty".to_string()));
    }
    if non_null_tokens != entries {
        return Err(fail(format!("{} null token strings", entries - non_null_tokens)));
    }
    if distinct_tokens != entries {
        return Err(fail(format!(
            "{} duplicate token strings",
            entries - distinct_tokens
        )));
    }
    if distinct_ids != entries {
        return Err(fail(format!("{} duplicate token ids", entries - distinct_ids)));
    }
    if value(3) != Some(0) || value(4) != Some(entries - 1) {
        return Err(fail(format!(
            "ids are not dense: range [{:?}, {:?}] for {entries} entries",
            value(3),
            value(4)
        )));
    }

    let specials = ctx
        .sql(&format!(
            "SELECT {TOKEN_STR_COL}, {TOKEN_ID_COL} FROM {CHECK_TABLE} WHERE {TOKEN_ID_COL} < {}",
            special.reserved()
        ))
        .await?
        .collect()
        .await?;
    let mut found: HashMap<String, u32> = HashMap::new();
    for batch in &specials {
        let strs = arrow::compute::cast(batch.column(0), &DataType::Utf8)?;
        let strs = strs.as_string::<i32>();
        let ids = batch.column(1).as_primitive::<UInt32Type>();
        for i in 0..batch.num_rows() {
            found.insert(strs.value(i).to_string(), ids.value(i));
        }
    }
    for (expected, name) in special.names.iter().enumerate() {
        if found.get(name) != Some(&(expected as u32)) {
            return Err(fail(format!(
                "special token '{name}' expected at id {expected}, found {:?}",
                found.get(name)
            )));
        }
    }
    Ok(entries as u64)
}
