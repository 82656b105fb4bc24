//! Shard partitioner: joins every domain's event stream against the vocabulary
//! and writes per-user token sequences, one parquet file per shard.
//!
//! ## Plan
//!
//! ```text
//! per domain (config order = domain_rank):
//!   scan day files ─► project (user_id, ts, token_key = prefix || entity)
//!                  ─► LEFT JOIN vocabulary ON token_key = token_str
//!                  ─► token_id = coalesce(token_id, [UNK]), shard = shard_of(user_id)
//! union all domains ─► resolved_events
//! per shard i:
//!   SELECT user_id, array_agg(token_id ORDER BY ts, domain_rank, token_id) ...
//!   WHERE shard = i GROUP BY user_id
//! ```
//!
//! Everything up to the shard query is a lazy DataFusion plan. The only
//! materialization points are the per-domain audit counts and the shard
//! writes, which stream record batches into a staging file that is renamed
//! into place once complete.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{AsArray, RecordBatch, UInt32Array};
use arrow::datatypes::{DataType, Int64Type, TimeUnit, TimestampMicrosecondType, UInt32Type};
use datafusion::common::{JoinType, ScalarValue};
use datafusion::error::DataFusionError;
use datafusion::functions_aggregate::expr_fn::{count, max};
use datafusion::logical_expr::{
    ColumnarValue, ScalarFunctionImplementation, ScalarUDF, Volatility, create_udf,
};
use datafusion::prelude::{DataFrame, SessionContext, cast, coalesce, col, concat, ident, lit};
use futures::StreamExt;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{debug, info, warn};

use crate::common::*;
use crate::config::{DomainConfig, PipelineConfig};
use crate::discovery::{DayWindow, DomainFiles, discover_day_files};
use crate::sampler::open_event_stream;
use crate::vocab::{open_vocabulary, verify_vocabulary};

/// Registered name of the unioned, resolved event relation.
pub const RESOLVED_TABLE: &str = "resolved_events";
/// Name of the registered shard function.
pub const SHARD_UDF: &str = "shard_of";

const STAGING_DIR: &str = ".staging";

// ============================================================================
// Shard function
// ============================================================================

/// Scalar UDF computing [`shard_of`] over a Utf8 user id column.
/// A null user id hashes like the empty string.
pub fn shard_udf(shard_count: u32) -> ScalarUDF {
    let fun: ScalarFunctionImplementation = Arc::new(move |args: &[ColumnarValue]| {
        let arg = args
            .first()
            .ok_or_else(|| DataFusionError::Internal(format!("{SHARD_UDF} takes one argument")))?;
        match arg {
            ColumnarValue::Scalar(value) => {
                let user = match value {
                    ScalarValue::Utf8(s) | ScalarValue::LargeUtf8(s) | ScalarValue::Utf8View(s) => {
                        s.clone().unwrap_or_default()
                    }
                    other => other.to_string(),
                };
                Ok(ColumnarValue::Scalar(ScalarValue::UInt32(Some(
                    shard_of(&user, shard_count).0,
                ))))
            }
            ColumnarValue::Array(array) => {
                let users = arrow::compute::cast(array, &DataType::Utf8)?;
                let users = users.as_string::<i32>();
                let shards = UInt32Array::from_iter_values(
                    users
                        .iter()
                        .map(|u| shard_of(u.unwrap_or_default(), shard_count).0),
                );
                Ok(ColumnarValue::Array(Arc::new(shards)))
            }
        }
    });
    create_udf(
        SHARD_UDF,
        vec![DataType::Utf8],
        DataType::UInt32,
        Volatility::Immutable,
        fun,
    )
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone)]
pub enum DomainOutcome {
    /// Joined against the vocabulary and included in the union.
    Resolved {
        domain: String,
        files: usize,
        rows: u64,
        /// Rows that fell back to the unknown token.
        unknown: u64,
    },
    /// No day files matched the domain's discovery rule.
    Skipped { domain: String, root: PathBuf },
    /// Scanning the domain failed; none of its events are in the output.
    Failed { domain: String, error: String },
}

impl DomainOutcome {
    pub fn domain(&self) -> &str {
        match self {
            DomainOutcome::Resolved { domain, .. }
            | DomainOutcome::Skipped { domain, .. }
            | DomainOutcome::Failed { domain, .. } => domain,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ShardOutcome {
    Written {
        shard: ShardIdx,
        path: PathBuf,
        users: u64,
        events: u64,
        unknown: u64,
    },
    Failed { shard: ShardIdx, error: String },
}

impl ShardOutcome {
    pub fn shard(&self) -> ShardIdx {
        match self {
            ShardOutcome::Written { shard, .. } | ShardOutcome::Failed { shard, .. } => *shard,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartitionReport {
    pub vocab_entries: u64,
    pub domains: Vec<DomainOutcome>,
    pub shards: Vec<ShardOutcome>,
}

impl PartitionReport {
    /// False if any domain or shard failed. Skipped domains had nothing to
    /// contribute and do not make a run incomplete.
    pub fn is_complete(&self) -> bool {
        !self
            .domains
            .iter()
            .any(|d| matches!(d, DomainOutcome::Failed { .. }))
            && !self
                .shards
                .iter()
                .any(|s| matches!(s, ShardOutcome::Failed { .. }))
    }

    pub fn total_users(&self) -> u64 {
        self.written().map(|(users, _, _)| users).sum()
    }

    pub fn total_events(&self) -> u64 {
        self.written().map(|(_, events, _)| events).sum()
    }

    pub fn total_unknown(&self) -> u64 {
        self.written().map(|(_, _, unknown)| unknown).sum()
    }

    fn written(&self) -> impl Iterator<Item = (u64, u64, u64)> {
        self.shards.iter().filter_map(|s| match s {
            ShardOutcome::Written {
                users,
                events,
                unknown,
                ..
            } => Some((*users, *events, *unknown)),
            ShardOutcome::Failed { .. } => None,
        })
    }
}

// ============================================================================
// Partitioner
// ============================================================================

pub struct ShardPartitioner<'a> {
    ctx: &'a SessionContext,
    config: &'a PipelineConfig,
}

struct ResolvedDomain {
    frame: DataFrame,
    rows: u64,
    unknown: u64,
}

impl<'a> ShardPartitioner<'a> {
    pub fn new(ctx: &'a SessionContext, config: &'a PipelineConfig) -> Self {
        Self { ctx, config }
    }

    /// Run the full partition: verify the vocabulary, resolve every domain,
    /// write `shard_count` files into `output_dir`. `on_shard` is called after
    /// each shard finishes, successfully or not.
    ///
    /// Integrity faults (vocabulary corruption, rows lost in the join) abort
    /// the run before any shard is written. A domain that fails to scan is
    /// reported and left out; a shard that fails to write is reported and the
    /// remaining shards are still written.
    pub async fn run(
        &self,
        vocab_path: &Path,
        output_dir: &Path,
        window: DayWindow,
        mut on_shard: impl FnMut(&ShardOutcome),
    ) -> Result<PartitionReport, PipelineError> {
        let special = &self.config.special_tokens;
        let vocab_entries = verify_vocabulary(self.ctx, vocab_path, special).await?;
        info!("  Vocabulary verified: {} entries", vocab_entries);
        let vocab = open_vocabulary(self.ctx, vocab_path).await?;
        let shard_fn = shard_udf(self.config.shard_count);

        let mut report = PartitionReport {
            vocab_entries,
            ..Default::default()
        };
        let mut union: Option<DataFrame> = None;

        for (rank, (name, domain)) in self.config.domains.iter().enumerate() {
            let files = discover_day_files(
                name,
                domain,
                &self.config.file_naming,
                &self.config.data_dir,
                window,
            )?;
            if files.is_empty() {
                warn!(
                    "  {}: no day files under {}, skipping domain",
                    name,
                    files.root.display()
                );
                report.domains.push(DomainOutcome::Skipped {
                    domain: name.clone(),
                    root: files.root,
                });
                continue;
            }

            let resolved = self
                .resolve_domain(rank as u32, domain, &files, vocab.clone(), &shard_fn)
                .await;
            match resolved {
                Ok(resolved) => {
                    log_resolution(name, &files, resolved.rows, resolved.unknown);
                    report.domains.push(DomainOutcome::Resolved {
                        domain: name.clone(),
                        files: files.files.len(),
                        rows: resolved.rows,
                        unknown: resolved.unknown,
                    });
                    union = Some(match union {
                        None => resolved.frame,
                        Some(acc) => acc.union(resolved.frame)?,
                    });
                }
                Err(err) if err.class() == FailureClass::Integrity => return Err(err),
                Err(err) => {
                    warn!(
                        "  {}: {} failure in {} files under {}: {}",
                        name,
                        err.class(),
                        files.files.len(),
                        files.root.display(),
                        err
                    );
                    report.domains.push(DomainOutcome::Failed {
                        domain: name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let Some(union) = union else {
            return Err(PipelineError::NoEvents);
        };
        self.ctx.deregister_table(RESOLVED_TABLE)?;
        self.ctx.register_table(RESOLVED_TABLE, union.into_view())?;

        fs::create_dir_all(output_dir).map_err(io_at(output_dir))?;
        remove_stale_shards(output_dir)?;
        let staging = output_dir.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(io_at(&staging))?;

        let unknown_id = special.unknown_id();
        for i in 0..self.config.shard_count {
            let shard = ShardIdx(i);
            let outcome = match self.write_shard(shard, output_dir, &staging, unknown_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("  Shard {} failed: {}", i, err);
                    discard_staged(&staging.join(shard.file_name()));
                    ShardOutcome::Failed {
                        shard,
                        error: err.to_string(),
                    }
                }
            };
            on_shard(&outcome);
            report.shards.push(outcome);
        }

        self.ctx.deregister_table(RESOLVED_TABLE)?;
        remove_staging_dir(&staging);
        Ok(report)
    }

    /// Build the lazy resolved relation for one domain and audit it.
    async fn resolve_domain(
        &self,
        rank: u32,
        domain: &DomainConfig,
        files: &DomainFiles,
        vocab: DataFrame,
        shard_fn: &ScalarUDF,
    ) -> Result<ResolvedDomain, PipelineError> {
        let stream = open_event_stream(self.ctx, files, &self.config.file_naming).await?;
        let prefix = self.config.domain_prefix(domain)?;

        let projected = stream.frame.select(vec![
            cast(ident(&domain.user_column), DataType::Utf8).alias(USER_COL),
            cast(
                ident(&domain.timestamp_column),
                DataType::Timestamp(TimeUnit::Microsecond, None),
            )
            .alias(TS_COL),
            concat(vec![
                lit(prefix),
                cast(ident(&domain.entity_column), DataType::Utf8),
            ])
            .alias(TOKEN_KEY_COL),
        ])?;
        let rows_in = projected.clone().count().await? as u64;

        let joined = projected.join(
            vocab,
            JoinType::Left,
            &[TOKEN_KEY_COL],
            &[TOKEN_STR_COL],
            None,
        )?;

        // The audit evaluates every output column, so a value that fails to
        // cast or hash fails the domain here instead of a shard later.
        let audit = joined
            .clone()
            .select(vec![
                col(USER_COL),
                col(TS_COL),
                col(TOKEN_ID_COL),
                shard_fn.call(vec![col(USER_COL)]).alias(SHARD_COL),
            ])?
            .aggregate(
                vec![],
                vec![
                    count(lit(1)).alias("rows_out"),
                    count(col(TOKEN_ID_COL)).alias("matched"),
                    max(col(USER_COL)).alias("max_user"),
                    max(col(TS_COL)).alias("max_ts"),
                    max(col(SHARD_COL)).alias("max_shard"),
                ],
            )?
            .collect()
            .await?;
        let (rows_out, matched) = audit
            .iter()
            .find(|b| b.num_rows() == 1)
            .map(|b| {
                (
                    b.column(0).as_primitive::<Int64Type>().value(0) as u64,
                    b.column(1).as_primitive::<Int64Type>().value(0) as u64,
                )
            })
            .unwrap_or((0, 0));
        if rows_out != rows_in {
            return Err(PipelineError::RowCountMismatch {
                domain: files.domain.clone(),
                rows_in,
                rows_out,
            });
        }

        let frame = joined.select(vec![
            col(USER_COL),
            col(TS_COL),
            coalesce(vec![col(TOKEN_ID_COL), lit(self.config.special_tokens.unknown_id().0)])
                .alias(TOKEN_ID_COL),
            lit(rank).alias(DOMAIN_RANK_COL),
            shard_fn.call(vec![col(USER_COL)]).alias(SHARD_COL),
        ])?;

        Ok(ResolvedDomain {
            frame,
            rows: rows_out,
            unknown: rows_out - matched,
        })
    }

    /// Stream one shard's grouped sequences into its staging file, then
    /// rename it into place.
    async fn write_shard(
        &self,
        shard: ShardIdx,
        output_dir: &Path,
        staging: &Path,
        unknown_id: TokenId,
    ) -> Result<ShardOutcome, PipelineError> {
        let order = format!(r#""{TS_COL}", "{DOMAIN_RANK_COL}", "{TOKEN_ID_COL}""#);
        let sql = format!(
            r#"SELECT "{USER_COL}",
                      array_agg("{TOKEN_ID_COL}" ORDER BY {order}) AS "{SEQUENCE_COL}",
                      array_agg("{TS_COL}" ORDER BY {order}) AS "{TIMESTAMPS_COL}"
               FROM {RESOLVED_TABLE}
               WHERE "{SHARD_COL}" = {}
               GROUP BY "{USER_COL}"
               ORDER BY "{USER_COL}""#,
            shard.0
        );
        let mut stream = self.ctx.sql(&sql).await?.execute_stream().await?;

        let tmp_path = staging.join(shard.file_name());
        let file = File::create(&tmp_path).map_err(io_at(&tmp_path))?;
        let mut writer =
            ArrowWriter::try_new(file, stream.schema(), None).map_err(parquet_at(&tmp_path))?;
        let (mut users, mut events, mut unknown) = (0u64, 0u64, 0u64);
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            let (u, e, k) = tally(&batch, unknown_id)?;
            users += u;
            events += e;
            unknown += k;
            writer.write(&batch).map_err(parquet_at(&tmp_path))?;
        }
        writer.close().map_err(parquet_at(&tmp_path))?;

        let path = output_dir.join(shard.file_name());
        fs::rename(&tmp_path, &path).map_err(io_at(&path))?;
        debug!(
            "  Shard {}: {} users, {} events -> {}",
            shard.0,
            users,
            events,
            path.display()
        );
        Ok(ShardOutcome::Written {
            shard,
            path,
            users,
            events,
            unknown,
        })
    }
}

fn log_resolution(domain: &str, files: &DomainFiles, rows: u64, unknown: u64) {
    let span = files
        .day_span()
        .map(|(a, b)| format!("days {a}..={b}"))
        .unwrap_or_default();
    info!(
        "  {}: {} events from {} files ({})",
        domain,
        rows,
        files.files.len(),
        span
    );
    if unknown > 0 {
        let fraction = unknown as f64 / rows.max(1) as f64;
        warn!(
            "  {}: {} events ({:.2}%) reference entities outside the vocabulary, mapped to the unknown token",
            domain,
            unknown,
            fraction * 100.0
        );
    }
}

/// `(users, events, unknown tokens)` in one shard batch.
fn tally(batch: &RecordBatch, unknown_id: TokenId) -> Result<(u64, u64, u64), PipelineError> {
    let idx = batch.schema().index_of(SEQUENCE_COL)?;
    let lists = batch.column(idx).as_list::<i32>();
    let offsets = lists.value_offsets();
    let (first, last) = match (offsets.first(), offsets.last()) {
        (Some(&first), Some(&last)) => (first as usize, last as usize),
        _ => return Ok((0, 0, 0)),
    };
    let tokens = lists.values().as_primitive::<UInt32Type>();
    let unknown = tokens
        .values()
        .get(first..last)
        .map(|ids| ids.iter().filter(|&&id| id == unknown_id.0).count())
        .unwrap_or(0);
    Ok((
        batch.num_rows() as u64,
        (last - first) as u64,
        unknown as u64,
    ))
}

/// Shards are recomputed in full, so outputs of a previous run (possibly with
/// a larger shard count) must not linger next to the new ones.
fn remove_stale_shards(output_dir: &Path) -> Result<(), PipelineError> {
    for entry in fs::read_dir(output_dir).map_err(io_at(output_dir))? {
        let path = entry.map_err(io_at(output_dir))?.path();
        let is_shard = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("shard_") && n.ends_with(".parquet"));
        if is_shard && path.is_file() {
            debug!("  Removing stale {}", path.display());
            fs::remove_file(&path).map_err(io_at(&path))?;
        }
    }
    Ok(())
}

/// Delete a failed shard's partial staging file, if it got that far.
fn discard_staged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("  Discarded partial {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("  Could not discard partial {}: {}", path.display(), err),
    }
}

/// Remove the staging directory once all shards are done. Returns whether it
/// is gone; it stays when a partial file could not be discarded.
fn remove_staging_dir(staging: &Path) -> bool {
    match fs::remove_dir(staging) {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!("  Leaving staging directory {}: {}", staging.display(), err);
            false
        }
    }
}

// ============================================================================
// Reading shards back
// ============================================================================

/// One row of a shard file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSequence {
    pub user_id: String,
    pub tokens: Vec<TokenId>,
    /// Microseconds since the epoch, aligned with `tokens`.
    pub timestamps_us: Vec<i64>,
}

impl UserSequence {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Read every user sequence of a shard file, in file order.
pub fn read_shard_file(path: &Path) -> Result<Vec<UserSequence>, PipelineError> {
    let file = File::open(path).map_err(io_at(path))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(parquet_at(path))?
        .build()
        .map_err(parquet_at(path))?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let schema = batch.schema();
        let users = arrow::compute::cast(batch.column(schema.index_of(USER_COL)?), &DataType::Utf8)?;
        let users = users.as_string::<i32>();
        let sequences = batch.column(schema.index_of(SEQUENCE_COL)?).as_list::<i32>();
        let timestamps = batch.column(schema.index_of(TIMESTAMPS_COL)?).as_list::<i32>();

        for row in 0..batch.num_rows() {
            let tokens = sequences.value(row);
            let ts = timestamps.value(row);
            out.push(UserSequence {
                user_id: users.value(row).to_string(),
                tokens: tokens
                    .as_primitive::<UInt32Type>()
                    .values()
                    .iter()
                    .map(|&id| TokenId(id))
                    .collect(),
                timestamps_us: ts
                    .as_primitive::<TimestampMicrosecondType>()
                    .values()
                    .to_vec(),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use arrow::array::{ArrayRef, Int64Array, StringArray};

    use crate::catalog::tests::{int_catalog, write_batch};
    use crate::sampler::tests::write_events;
    use crate::vocab::build_vocabulary_from_catalogs;

    fn init_tracing() {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init()
            .ok();
    }

    /// Catalogs `MP_10, MP_11` and `BR_5`, other catalogs empty.
    fn write_catalogs(data: &Path) {
        int_catalog(&data.join("marketplace/items.pq"), "item_id", &[Some(10), Some(11)]);
        int_catalog(&data.join("retail/items.pq"), "item_id", &[]);
        int_catalog(&data.join("offers/items.pq"), "item_id", &[]);
        int_catalog(&data.join("brands.pq"), "brand_id", &[Some(5)]);
    }

    fn build_and_write_vocab(config: &PipelineConfig) -> PathBuf {
        let vocab = build_vocabulary_from_catalogs(config).unwrap();
        vocab.write(&config.output_dir).unwrap()
    }

    #[tokio::test]
    async fn test_shard_udf_matches_shard_of() {
        let ctx = session_context();
        ctx.register_udf(shard_udf(7));
        let batches = ctx
            .sql("SELECT shard_of(u) AS s FROM (VALUES ('alice'), ('42'), (NULL)) AS t(u)")
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let shards: Vec<u32> = batches
            .iter()
            .flat_map(|b| b.column(0).as_primitive::<UInt32Type>().values().to_vec())
            .collect();
        assert_eq!(
            shards,
            vec![
                shard_of("alice", 7).0,
                shard_of("42", 7).0,
                shard_of("", 7).0
            ]
        );
    }

    #[tokio::test]
    async fn test_resolution_sharding_and_ordering() {
        init_tracing();
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        write_catalogs(&data);
        // u1 sees ts 100 before ts 50 in file order; entity 12 is not in the catalog.
        write_events(
            &data.join("marketplace/events/00000.pq"),
            "item_id",
            &[("u1", 100, 10), ("u1", 50, 11), ("u2", 70, 12)],
        );
        write_events(&data.join("reviews/00003.pq"), "brand_id", &[("u1", 60, 5)]);

        let mut config = PipelineConfig::tecd(&data, temp.path().join("out"));
        config.shard_count = 3;
        let vocab_path = build_and_write_vocab(&config);

        let ctx = session_context();
        let mut seen = Vec::new();
        let report = ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &config.shards_dir(), DayWindow::all(), |s| {
                seen.push(s.shard())
            })
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(seen, vec![ShardIdx(0), ShardIdx(1), ShardIdx(2)]);
        assert_eq!(report.total_events(), 4);
        assert_eq!(report.total_users(), 2);
        assert_eq!(report.total_unknown(), 1);

        let outcomes: HashMap<&str, &DomainOutcome> =
            report.domains.iter().map(|d| (d.domain(), d)).collect();
        assert!(matches!(
            outcomes["marketplace"],
            DomainOutcome::Resolved { rows: 3, unknown: 1, .. }
        ));
        assert!(matches!(outcomes["retail"], DomainOutcome::Skipped { .. }));
        assert!(matches!(outcomes["reviews"], DomainOutcome::Resolved { rows: 1, .. }));

        let mut users = HashMap::new();
        for i in 0..3 {
            let path = config.shards_dir().join(ShardIdx(i).file_name());
            for seq in read_shard_file(&path).unwrap() {
                assert_eq!(shard_of(&seq.user_id, 3), ShardIdx(i));
                assert!(users.insert(seq.user_id.clone(), seq).is_none());
            }
        }
        // [PAD]..[UNK] = 0..5, MP_10 = 5, MP_11 = 6, BR_5 = 7.
        let u1 = &users["u1"];
        assert_eq!(u1.tokens, vec![TokenId(6), TokenId(7), TokenId(5)]);
        assert_eq!(u1.timestamps_us, vec![50, 60, 100]);
        let u2 = &users["u2"];
        assert_eq!(u2.tokens, vec![TokenId(4)]);
        assert!(!config.shards_dir().join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn test_equal_timestamps_break_ties_by_domain_rank() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        write_catalogs(&data);
        write_events(&data.join("reviews/00000.pq"), "brand_id", &[("u", 10, 5)]);
        write_events(
            &data.join("marketplace/events/00000.pq"),
            "item_id",
            &[("u", 10, 11), ("u", 10, 10)],
        );
        let mut config = PipelineConfig::tecd(&data, temp.path().join("out"));
        config.shard_count = 1;
        let vocab_path = build_and_write_vocab(&config);

        let ctx = session_context();
        ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &config.shards_dir(), DayWindow::all(), |_| {})
            .await
            .unwrap();
        let seqs = read_shard_file(&config.shards_dir().join("shard_0.parquet")).unwrap();
        assert_eq!(seqs.len(), 1);
        // marketplace (rank 0) before reviews (rank 3), then by token id.
        assert_eq!(seqs[0].tokens, vec![TokenId(5), TokenId(6), TokenId(7)]);
    }

    #[tokio::test]
    async fn test_no_events_anywhere_is_discovery_fault() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        write_catalogs(&data);
        let config = PipelineConfig::tecd(&data, temp.path().join("out"));
        let vocab_path = build_and_write_vocab(&config);

        let ctx = session_context();
        let err = ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &config.shards_dir(), DayWindow::all(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoEvents));
        assert_eq!(err.class(), FailureClass::Discovery);
    }

    #[tokio::test]
    async fn test_unreadable_domain_is_reported_and_excluded() {
        init_tracing();
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        write_catalogs(&data);
        write_events(&data.join("marketplace/events/00000.pq"), "item_id", &[("u", 1, 10)]);
        write_events(&data.join("offers/events/00000.pq"), "item_id", &[("v", 2, 3)]);
        let corrupt = data.join("offers/events/00007.pq");
        fs::write(&corrupt, b"definitely not parquet").unwrap();

        let mut config = PipelineConfig::tecd(&data, temp.path().join("out"));
        config.shard_count = 2;
        let vocab_path = build_and_write_vocab(&config);

        let ctx = session_context();
        let report = ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &config.shards_dir(), DayWindow::all(), |_| {})
            .await
            .unwrap();
        assert!(!report.is_complete());
        let failed: Vec<(&str, &str)> = report
            .domains
            .iter()
            .filter_map(|d| match d {
                DomainOutcome::Failed { domain, error } => Some((domain.as_str(), error.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "offers");
        assert!(failed[0].1.contains("00007.pq"), "{}", failed[0].1);
        assert_eq!(report.total_events(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_timestamps_fail_the_domain_not_the_shards() {
        init_tracing();
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        write_catalogs(&data);
        write_events(
            &data.join("marketplace/events/00000.pq"),
            "item_id",
            &[("u", 1, 10), ("w", 2, 11)],
        );
        let users: ArrayRef = Arc::new(StringArray::from(vec!["v"]));
        let ts: ArrayRef = Arc::new(StringArray::from(vec!["not-a-time"]));
        let items: ArrayRef = Arc::new(Int64Array::from(vec![3]));
        let batch =
            RecordBatch::try_from_iter([("user_id", users), ("timestamp", ts), ("item_id", items)])
                .unwrap();
        write_batch(&data.join("offers/events/00000.pq"), &batch);

        let mut config = PipelineConfig::tecd(&data, temp.path().join("out"));
        config.shard_count = 3;
        let vocab_path = build_and_write_vocab(&config);

        let ctx = session_context();
        let report = ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &config.shards_dir(), DayWindow::all(), |_| {})
            .await
            .unwrap();
        assert!(!report.is_complete());
        let outcomes: HashMap<&str, &DomainOutcome> =
            report.domains.iter().map(|d| (d.domain(), d)).collect();
        assert!(matches!(outcomes["offers"], DomainOutcome::Failed { .. }));
        assert!(matches!(outcomes["marketplace"], DomainOutcome::Resolved { rows: 2, .. }));
        assert_eq!(report.shards.len(), 3);
        assert!(report
            .shards
            .iter()
            .all(|s| matches!(s, ShardOutcome::Written { .. })));
        assert_eq!(report.total_events(), 2);
        assert_eq!(report.total_users(), 2);
    }

    #[test]
    fn test_staging_cleanup_tolerates_leftovers() {
        init_tracing();
        let temp = tempfile::tempdir().unwrap();
        let staging = temp.path().join(STAGING_DIR);
        fs::create_dir_all(&staging).unwrap();

        // Nothing was staged for this shard.
        discard_staged(&staging.join(ShardIdx(0).file_name()));

        let partial = staging.join(ShardIdx(1).file_name());
        fs::write(&partial, b"half a shard").unwrap();
        assert!(!remove_staging_dir(&staging));
        assert!(partial.exists());

        discard_staged(&partial);
        assert!(!partial.exists());
        assert!(remove_staging_dir(&staging));
        assert!(!staging.exists());
        assert!(remove_staging_dir(&staging));
    }

    #[tokio::test]
    async fn test_corrupt_vocabulary_halts_before_output() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        write_catalogs(&data);
        write_events(&data.join("marketplace/events/00000.pq"), "item_id", &[("u", 1, 10)]);
        let config = PipelineConfig::tecd(&data, temp.path().join("out"));
        let vocab_path = config.vocab_path();
        fs::create_dir_all(&config.output_dir).unwrap();
        int_catalog(&vocab_path, "token_id", &[Some(0)]);

        let ctx = session_context();
        let err = ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &config.shards_dir(), DayWindow::all(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Integrity);
        assert!(!config.shards_dir().exists());
    }

    #[tokio::test]
    async fn test_stale_shards_are_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        write_catalogs(&data);
        write_events(&data.join("marketplace/events/00000.pq"), "item_id", &[("u", 1, 10)]);
        let mut config = PipelineConfig::tecd(&data, temp.path().join("out"));
        config.shard_count = 2;
        let vocab_path = build_and_write_vocab(&config);

        let shards = config.shards_dir();
        fs::create_dir_all(&shards).unwrap();
        fs::write(shards.join("shard_7.parquet"), b"old").unwrap();
        fs::write(shards.join("notes.txt"), b"keep").unwrap();

        let ctx = session_context();
        ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &shards, DayWindow::all(), |_| {})
            .await
            .unwrap();
        assert!(!shards.join("shard_7.parquet").exists());
        assert!(shards.join("notes.txt").exists());
        assert!(shards.join("shard_0.parquet").exists());
        assert!(shards.join("shard_1.parquet").exists());
    }
}
