//! Preprocessor binary: builds the global token vocabulary from the entity
//! catalogs, then partitions every event domain into per-user token sequences.
//!
//! ## Input
//!
//! A T-ECD style data directory:
//! - `<domain>/items.pq`, `brands.pq`     — entity catalogs
//! - `<domain>/events/NNNNN.pq`           — one event file per day
//! - `reviews/NNNNN.pq`                   — reviews sit directly under the domain root
//!
//! The layout can be overridden with a JSON config (see `confluence::config`).
//!
//! ## Output
//!
//! - `vocab.parquet`, `vocab_summary.json` — token table and per-namespace id ranges
//! - `shards/shard_{i}.parquet`            — `(user_id, sequence, timestamps)` per user
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin preprocess -- --data-dir dataset/full
//! cargo run --release --bin preprocess -- --config tecd.json --shards 100 --day-end 1200
//! ```

use std::path::PathBuf;

use clap::Parser;
use indicatif::{HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use tracing::{info, warn};

use confluence::common::*;
use confluence::config::PipelineConfig;
use confluence::discovery::DayWindow;
use confluence::partitioner::{DomainOutcome, ShardOutcome, ShardPartitioner};
use confluence::vocab::build_vocabulary_from_catalogs;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Build the token vocabulary and sharded user sequences")]
struct Args {
    /// Raw dataset root. Required unless --config is given.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Output directory (default: `<data-dir>/processed`).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// JSON pipeline config. Without it the built-in T-ECD layout is used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of output shards (overrides the config).
    #[arg(long)]
    shards: Option<u32>,

    /// Only process these domains (comma separated).
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,

    /// First day code to include.
    #[arg(long)]
    day_begin: Option<u32>,

    /// Last day code to include.
    #[arg(long)]
    day_end: Option<u32>,

    /// Reuse an existing vocabulary instead of rebuilding it.
    #[arg(long, default_value_t = false)]
    skip_vocab: bool,
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::resolve(
        args.config.as_deref(),
        args.data_dir.clone(),
        args.output_dir.clone(),
    )?;
    if let Some(shards) = args.shards {
        config.shard_count = shards;
    }
    if !args.domains.is_empty() {
        config.restrict_domains(&args.domains)?;
    }
    config.validate()?;
    let window = DayWindow {
        begin: args.day_begin,
        end: args.day_end,
    };

    info!("Data dir: {}", config.data_dir.display());
    info!("Output:   {}", config.output_dir.display());
    info!(
        "Domains:  {}",
        config.domains.keys().cloned().collect::<Vec<_>>().join(", ")
    );
    info!("Shards:   {}", config.shard_count);

    let pipeline_start = std::time::Instant::now();
    let vocab_path = config.vocab_path();

    // ── Step 1: Vocabulary ──────────────────────────────────────────────
    if args.skip_vocab {
        info!("Step 1: Reusing vocabulary at {}", vocab_path.display());
    } else {
        info!(
            "Step 1: Assigning token ids from {} catalogs...",
            config.catalogs.len()
        );
        let vocab = build_vocabulary_from_catalogs(&config)?;
        info!(
            "  {} tokens ({} special, {} repeated ids collapsed)",
            HumanCount(vocab.len() as u64),
            config.special_tokens.reserved(),
            HumanCount(vocab.duplicates)
        );
        vocab.write(&config.output_dir)?;
    }

    // ── Step 2: Partition ───────────────────────────────────────────────
    info!("Step 2: Partitioning events into {} shards...", config.shard_count);
    let pb = ProgressBar::new(config.shard_count as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "  Writing    {bar:40.cyan/blue} {pos}/{len} shards [{elapsed_precise}] {msg}",
        )?
        .progress_chars("##-"),
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let ctx = session_context();
    let report = rt.block_on(async {
        ShardPartitioner::new(&ctx, &config)
            .run(&vocab_path, &config.shards_dir(), window, |outcome| {
                pb.inc(1);
                if let ShardOutcome::Written { users, .. } = outcome {
                    pb.set_message(format!("{} users", HumanCount(*users)));
                }
            })
            .await
    })?;
    pb.finish_and_clear();

    // ── Summary ─────────────────────────────────────────────────────────
    let elapsed = pipeline_start.elapsed();
    info!("Preprocessing finished in {}", HumanDuration(elapsed));
    for outcome in &report.domains {
        match outcome {
            DomainOutcome::Resolved {
                domain,
                files,
                rows,
                unknown,
            } => info!(
                "  {domain:<12} {:>14} events from {files} files, {} unknown",
                HumanCount(*rows),
                HumanCount(*unknown)
            ),
            DomainOutcome::Skipped { domain, root } => {
                warn!("  {domain:<12} skipped: no files under {}", root.display())
            }
            DomainOutcome::Failed { domain, error } => {
                warn!("  {domain:<12} FAILED: {error}")
            }
        }
    }
    let events = report.total_events();
    info!("  Vocabulary: {} entries", HumanCount(report.vocab_entries));
    info!("  Users:      {}", HumanCount(report.total_users()));
    info!("  Events:     {}", HumanCount(events));
    info!(
        "  Unknown:    {} ({:.3}%)",
        HumanCount(report.total_unknown()),
        100.0 * report.total_unknown() as f64 / events.max(1) as f64
    );

    if !report.is_complete() {
        let failed_shards: Vec<String> = report
            .shards
            .iter()
            .filter_map(|s| match s {
                ShardOutcome::Failed { shard, error } => Some(format!("shard {}: {error}", shard.0)),
                ShardOutcome::Written { .. } => None,
            })
            .collect();
        for line in &failed_shards {
            warn!("  {line}");
        }
        return Err("partition is incomplete: some domains or shards failed, see above".into());
    }
    info!("  Output directory: {}", config.output_dir.display());
    Ok(())
}
