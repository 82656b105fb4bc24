//! Event stream sampler.
//!
//! Opens every day file of a domain as one lazy multi-file scan
//! ([`EventStream`]). The production path (the partitioner) consumes that scan
//! unsampled. For exploration, [`sample_domain`] keeps each row independently
//! with the domain's `sample_rate` and caps the result at `sample_max_rows`.
//! Kept rows are drawn in random order before the cap applies, so the capped
//! sample is spread over all files rather than the first ones scanned.

use std::fs::File;

use arrow::array::RecordBatch;
use datafusion::prelude::{DataFrame, ParquetReadOptions, SessionContext, lit, random};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{info, warn};

use crate::common::{PipelineError, io_at, parquet_at};
use crate::config::{DayFileNaming, PipelineConfig};
use crate::discovery::{DayWindow, DomainFiles, discover_day_files};

/// All day files of one domain, declared as a single lazy relation.
pub struct EventStream {
    pub domain: String,
    pub files: DomainFiles,
    /// Unsampled, unprojected scan. Nothing is read until it executes.
    pub frame: DataFrame,
}

/// Open a domain's day files as one logical stream.
///
/// `files` must be non-empty; a domain without files has no stream. Every
/// file's footer is read up front so an unreadable day is reported by path.
pub async fn open_event_stream(
    ctx: &SessionContext,
    files: &DomainFiles,
    naming: &DayFileNaming,
) -> Result<EventStream, PipelineError> {
    if files.is_empty() {
        return Err(PipelineError::Config(format!(
            "domain '{}' has no day files under {}",
            files.domain,
            files.root.display()
        )));
    }
    for day in &files.files {
        let file = File::open(&day.path).map_err(io_at(&day.path))?;
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_at(&day.path))?;
    }
    let extension = format!(".{}", naming.extension);
    let options = ParquetReadOptions {
        file_extension: &extension,
        ..Default::default()
    };
    let frame = ctx.read_parquet(files.paths(), options).await?;
    Ok(EventStream {
        domain: files.domain.clone(),
        files: files.clone(),
        frame,
    })
}

/// A bounded sample of one domain's raw events.
#[derive(Debug)]
pub struct EventSample {
    pub domain: String,
    pub files_scanned: usize,
    pub day_span: Option<(u32, u32)>,
    pub batches: Vec<RecordBatch>,
    pub rows: usize,
}

#[derive(Debug)]
pub enum SampleOutcome {
    /// The domain's discovery rule matched no files.
    NoFiles {
        domain: String,
        root: std::path::PathBuf,
    },
    Sampled(EventSample),
}

impl SampleOutcome {
    pub fn rows(&self) -> usize {
        match self {
            SampleOutcome::NoFiles { .. } => 0,
            SampleOutcome::Sampled(sample) => sample.rows,
        }
    }
}

/// Draw a Bernoulli sample of a domain's events, at most `sample_max_rows` rows.
pub async fn sample_domain(
    ctx: &SessionContext,
    config: &PipelineConfig,
    domain: &str,
    window: DayWindow,
) -> Result<SampleOutcome, PipelineError> {
    let domain_config = config.domain(domain)?;
    let files = discover_day_files(
        domain,
        domain_config,
        &config.file_naming,
        &config.data_dir,
        window,
    )?;
    if files.is_empty() {
        warn!(
            "  {}: no day files under {}, nothing to sample",
            domain,
            files.root.display()
        );
        return Ok(SampleOutcome::NoFiles {
            domain: domain.to_string(),
            root: files.root,
        });
    }

    let stream = open_event_stream(ctx, &files, &config.file_naming).await?;
    let batches = stream
        .frame
        .filter(random().lt(lit(domain_config.sample_rate)))?
        .sort(vec![random().sort(true, false)])?
        .limit(0, Some(config.sample_max_rows))?
        .collect()
        .await?;
    let rows = batches.iter().map(|b| b.num_rows()).sum();

    info!(
        "  {}: sampled {} rows from {} files (rate {})",
        domain,
        rows,
        files.files.len(),
        domain_config.sample_rate
    );
    Ok(SampleOutcome::Sampled(EventSample {
        domain: domain.to_string(),
        files_scanned: files.files.len(),
        day_span: files.day_span(),
        batches,
        rows,
    }))
}
