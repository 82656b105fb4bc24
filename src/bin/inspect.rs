//! Inspect a preprocessed output directory: vocabulary layout, per-shard
//! counts, sequence length statistics and a few decoded user sequences.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --output-dir dataset/processed
//! cargo run --release --bin inspect -- --output-dir dataset/processed --sample-users 10
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use clap::Parser;

use confluence::common::*;
use confluence::partitioner::{UserSequence, read_shard_file};
use confluence::vocab::{VocabularySummary, lookup_tokens};

#[derive(Parser, Debug)]
#[command(about = "Inspect a preprocessed output directory")]
struct Args {
    /// Directory holding `vocab.parquet`, `vocab_summary.json` and `shards/`.
    #[arg(long)]
    output_dir: PathBuf,

    /// Number of sample users to decode (0 to skip).
    #[arg(long, default_value_t = 5)]
    sample_users: usize,

    /// Tokens shown per sample user.
    #[arg(long, default_value_t = 12)]
    max_tokens: usize,
}

/// Shard files in index order.
fn list_shards(dir: &Path) -> Result<Vec<(ShardIdx, PathBuf)>, PipelineError> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_at(dir))? {
        let path = entry.map_err(io_at(dir))?.path();
        let idx = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("shard_"))
            .and_then(|n| n.strip_suffix(".parquet"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(idx) = idx {
            shards.push((ShardIdx(idx), path));
        }
    }
    shards.sort();
    Ok(shards)
}

fn format_ts(us: i64) -> String {
    DateTime::from_timestamp_micros(us)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{us}µs"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let summary = VocabularySummary::load(&args.output_dir.join(VOCAB_SUMMARY_FILE))?;
    let shards = list_shards(&args.output_dir.join(SHARDS_DIR))?;

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Output: {}", args.output_dir.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Tokens:     {:>10}", summary.num_tokens);
    println!(
        "║  Special:    {:>10}  (pad={}, unk={})",
        summary.special_tokens.len(),
        summary.padding_id.0,
        summary.unknown_id.0
    );
    println!("║  Shards:     {:>10}", shards.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Vocabulary ───────────────────────────────────────────────────────
    println!("┌─ Vocabulary");
    println!("│  {}", summary.special_tokens.join(" "));
    for ns in &summary.namespaces {
        println!(
            "│  {:<14} {:<5} ids [{:>10}, {:>10})  {:>10} tokens",
            ns.namespace,
            ns.prefix,
            ns.start.0,
            ns.end.0,
            ns.end.0 - ns.start.0
        );
    }
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    // ── Shards ───────────────────────────────────────────────────────────
    println!("┌─ Shards");
    let mut lengths: Vec<usize> = Vec::new();
    let mut unknown: u64 = 0;
    let mut min_ts = i64::MAX;
    let mut max_ts = i64::MIN;
    let mut samples: Vec<(ShardIdx, UserSequence)> = Vec::new();
    for (shard, path) in &shards {
        let seqs = read_shard_file(path)?;
        let events: usize = seqs.iter().map(|s| s.len()).sum();
        println!(
            "│  shard {:>4}: {:>10} users {:>12} events",
            shard.0,
            seqs.len(),
            events
        );
        for seq in &seqs {
            lengths.push(seq.len());
            unknown += seq
                .tokens
                .iter()
                .filter(|&&t| t == summary.unknown_id)
                .count() as u64;
            if let (Some(&first), Some(&last)) = (seq.timestamps_us.first(), seq.timestamps_us.last()) {
                min_ts = min_ts.min(first);
                max_ts = max_ts.max(last);
            }
        }
        let want = args.sample_users.saturating_sub(samples.len());
        samples.extend(seqs.into_iter().take(want).map(|seq| (*shard, seq)));
    }

    let users = lengths.len();
    let events: usize = lengths.iter().sum();
    println!("│");
    println!("│  Users:  {users}");
    println!("│  Events: {events}");
    if users > 0 {
        lengths.sort_unstable();
        println!(
            "│  Length: mean={:.2}  median={}  max={}  p99={}",
            events as f64 / users as f64,
            lengths[users / 2],
            lengths[users - 1],
            lengths[((users as f64 * 0.99) as usize).min(users - 1)]
        );
        println!(
            "│  Unknown tokens: {} ({:.3}%)",
            unknown,
            100.0 * unknown as f64 / events.max(1) as f64
        );
        if min_ts <= max_ts {
            println!("│  Time range: {} .. {}", format_ts(min_ts), format_ts(max_ts));
        }
    }
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    // ── Sample users ─────────────────────────────────────────────────────
    if samples.is_empty() {
        return Ok(());
    }
    let mut wanted: Vec<TokenId> = samples
        .iter()
        .flat_map(|(_, s)| s.tokens.iter().take(args.max_tokens).copied())
        .collect();
    wanted.sort_unstable();
    wanted.dedup();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let ctx = session_context();
    let names = rt.block_on(lookup_tokens(
        &ctx,
        &args.output_dir.join(VOCAB_FILE),
        &wanted,
    ))?;

    println!("┌─ Sample users");
    for (shard, seq) in &samples {
        println!(
            "│  user {} ({} events, shard {})",
            seq.user_id,
            seq.len(),
            shard.0
        );
        for (token, ts) in seq
            .tokens
            .iter()
            .zip(&seq.timestamps_us)
            .take(args.max_tokens)
        {
            let name = names.get(token).map(String::as_str).unwrap_or("?");
            println!("│    {}  {:>8}  {}", format_ts(*ts), token.0, name);
        }
        if seq.len() > args.max_tokens {
            println!("│    ... ({} more)", seq.len() - args.max_tokens);
        }
    }
    println!("└──────────────────────────────────────────────────────────────");
    Ok(())
}
