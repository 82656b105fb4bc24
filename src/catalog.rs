//! Catalog scanner: reads static entity listings and yields their raw ids.
//!
//! Only the configured id column is decoded (parquet projection), and batches
//! are streamed rather than concatenated. The scanner knows nothing about
//! tokens; it hands `(namespace, prefix, ids)` to the vocabulary builder.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{Array, AsArray};
use arrow::datatypes::DataType;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{info, warn};

use crate::common::{PipelineError, parquet_at};
use crate::config::CatalogConfig;

const CATALOG_BATCH_SIZE: usize = 256 * 1024;

/// The ids of one catalog, in file order.
#[derive(Debug, Clone)]
pub struct CatalogScan {
    /// Catalog (namespace) name from the config.
    pub namespace: String,
    pub prefix: String,
    pub path: PathBuf,
    /// Raw, non-null entity ids rendered as text. May contain repeats.
    pub ids: Vec<String>,
    pub num_nulls: u64,
}

impl CatalogScan {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Append the string form of every non-null value of `array` to `out`.
/// Integer, string and dictionary columns are all cast through Utf8.
/// Returns the number of nulls skipped.
fn extend_with_strings(array: &dyn Array, out: &mut Vec<String>) -> Result<u64, PipelineError> {
    if let Some(sa) = array.as_string_opt::<i32>() {
        out.extend(sa.iter().flatten().map(str::to_string));
        return Ok(sa.null_count() as u64);
    }
    let cast = arrow::compute::cast(array, &DataType::Utf8)?;
    let sa = cast.as_string::<i32>();
    out.extend(sa.iter().flatten().map(str::to_string));
    Ok(sa.null_count() as u64)
}

/// Scan one catalog file.
pub fn scan_catalog(
    namespace: &str,
    catalog: &CatalogConfig,
    data_dir: &Path,
) -> Result<CatalogScan, PipelineError> {
    let path = data_dir.join(&catalog.path);
    if !path.is_file() {
        return Err(PipelineError::MissingCatalog {
            catalog: namespace.to_string(),
            path,
        });
    }

    let file = File::open(&path).map_err(crate::common::io_at(&path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_at(&path))?;
    let col_idx = builder
        .schema()
        .index_of(&catalog.id_column)
        .map_err(|_| PipelineError::MissingColumn {
            catalog: namespace.to_string(),
            column: catalog.id_column.clone(),
            path: path.clone(),
        })?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [col_idx]);
    let reader = builder
        .with_projection(mask)
        .with_batch_size(CATALOG_BATCH_SIZE)
        .build()
        .map_err(parquet_at(&path))?;

    let mut ids = Vec::new();
    let mut num_nulls = 0u64;
    for batch in reader {
        let batch = batch?;
        num_nulls += extend_with_strings(batch.column(0).as_ref(), &mut ids)?;
    }

    if ids.is_empty() {
        warn!(
            "  Catalog '{}' ({}) is empty; namespace '{}' contributes no tokens",
            namespace,
            path.display(),
            catalog.prefix
        );
    }
    if num_nulls > 0 {
        warn!(
            "  Catalog '{}' has {} null ids in column '{}', skipped",
            namespace, num_nulls, catalog.id_column
        );
    }
    info!("  {}: {} ids from {}", namespace, ids.len(), path.display());

    Ok(CatalogScan {
        namespace: namespace.to_string(),
        prefix: catalog.prefix.clone(),
        path,
        ids,
        num_nulls,
    })
}
