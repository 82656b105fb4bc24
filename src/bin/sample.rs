//! Print a Bernoulli sample of raw events for each domain.
//!
//! Exploration only: the sample rate and row cap come from the config, and the
//! preprocessor never reads these samples.
//!
//! ```sh
//! cargo run --release --bin sample -- --data-dir dataset/full --domains reviews --rows 20
//! ```

use std::path::PathBuf;

use arrow::util::pretty::pretty_format_batches;
use clap::Parser;
use tracing::info;

use confluence::common::session_context;
use confluence::config::PipelineConfig;
use confluence::discovery::DayWindow;
use confluence::sampler::{SampleOutcome, sample_domain};

#[derive(Parser, Debug)]
#[command(about = "Sample raw events from each domain")]
struct Args {
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Only sample these domains (comma separated).
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,

    /// Override every domain's sample rate.
    #[arg(long)]
    rate: Option<f64>,

    /// Maximum rows drawn per domain.
    #[arg(long)]
    max_rows: Option<usize>,

    /// Rows printed per domain.
    #[arg(long, default_value_t = 10)]
    rows: usize,

    #[arg(long)]
    day_begin: Option<u32>,

    #[arg(long)]
    day_end: Option<u32>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = PipelineConfig::resolve(args.config.as_deref(), args.data_dir.clone(), None)?;
    if !args.domains.is_empty() {
        config.restrict_domains(&args.domains)?;
    }
    if let Some(rate) = args.rate {
        for domain in config.domains.values_mut() {
            domain.sample_rate = rate;
        }
    }
    if let Some(max_rows) = args.max_rows {
        config.sample_max_rows = max_rows;
    }
    config.validate()?;
    let window = DayWindow {
        begin: args.day_begin,
        end: args.day_end,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let ctx = session_context();

    for name in config.domains.keys() {
        info!("Sampling {}...", name);
        let outcome = rt.block_on(sample_domain(&ctx, &config, name, window))?;
        match outcome {
            SampleOutcome::NoFiles { domain, root } => {
                println!("── {domain}: no day files under {}", root.display());
            }
            SampleOutcome::Sampled(sample) => {
                let span = sample
                    .day_span
                    .map(|(a, b)| format!("days {a}..={b}"))
                    .unwrap_or_default();
                println!(
                    "── {}: {} rows sampled from {} files ({span})",
                    sample.domain, sample.rows, sample.files_scanned
                );
                let mut shown = Vec::new();
                let mut left = args.rows;
                for batch in &sample.batches {
                    if left == 0 {
                        break;
                    }
                    let take = batch.num_rows().min(left);
                    shown.push(batch.slice(0, take));
                    left -= take;
                }
                if !shown.is_empty() {
                    println!("{}", pretty_format_batches(&shown)?);
                }
            }
        }
        println!();
    }
    Ok(())
}
