//! End-to-end runs over a small synthetic T-ECD directory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use parquet::arrow::ArrowWriter;

use confluence::common::*;
use confluence::config::PipelineConfig;
use confluence::discovery::DayWindow;
use confluence::partitioner::{
    DomainOutcome, PartitionReport, ShardPartitioner, UserSequence, read_shard_file,
};
use confluence::vocab::{Vocabulary, build_vocabulary_from_catalogs};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init()
        .ok();
}

fn write_parquet(path: &Path, columns: Vec<(&str, ArrayRef)>) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let batch = RecordBatch::try_from_iter(columns).unwrap();
    let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), batch.schema(), None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

fn write_catalog(path: &Path, column: &str, ids: &[i64]) {
    write_parquet(path, vec![(column, Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef)]);
}

fn write_day(path: &Path, entity_column: &str, rows: &[(&str, i64, i64)]) {
    let users = StringArray::from_iter_values(rows.iter().map(|r| r.0));
    let ts = Int64Array::from_iter_values(rows.iter().map(|r| r.1));
    let entities = Int64Array::from_iter_values(rows.iter().map(|r| r.2));
    write_parquet(
        path,
        vec![
            ("user_id", Arc::new(users) as ArrayRef),
            ("timestamp", Arc::new(ts) as ArrayRef),
            (entity_column, Arc::new(entities) as ArrayRef),
        ],
    );
}

/// Catalogs `MP_10, MP_11`, `RT_1`, no offers, `BR_5`.
fn dataset(root: &Path) -> PipelineConfig {
    let data = root.join("data");
    write_catalog(&data.join("marketplace/items.pq"), "item_id", &[10, 11]);
    write_catalog(&data.join("retail/items.pq"), "item_id", &[1]);
    write_catalog(&data.join("offers/items.pq"), "item_id", &[]);
    write_catalog(&data.join("brands.pq"), "brand_id", &[5]);
    let mut config = PipelineConfig::tecd(&data, root.join("out"));
    config.shard_count = 4;
    config
}

fn build_vocab(config: &PipelineConfig) -> (Vocabulary, PathBuf) {
    let vocab = build_vocabulary_from_catalogs(config).unwrap();
    let path = vocab.write(&config.output_dir).unwrap();
    (vocab, path)
}

async fn partition(config: &PipelineConfig, window: DayWindow) -> PartitionReport {
    let ctx = session_context();
    ShardPartitioner::new(&ctx, config)
        .run(&config.vocab_path(), &config.shards_dir(), window, |_| {})
        .await
        .unwrap()
}

/// Every user sequence of a run, keyed by user, with the shard it was found in.
fn read_all(config: &PipelineConfig) -> HashMap<String, (ShardIdx, UserSequence)> {
    let mut users = HashMap::new();
    for i in 0..config.shard_count {
        let shard = ShardIdx(i);
        for seq in read_shard_file(&config.shards_dir().join(shard.file_name())).unwrap() {
            let previous = users.insert(seq.user_id.clone(), (shard, seq));
            assert!(previous.is_none(), "user appears in two shards");
        }
    }
    users
}

#[tokio::test]
async fn test_full_pipeline() {
    init_tracing();
    let temp = tempfile::tempdir().unwrap();
    let config = dataset(temp.path());
    let data = &config.data_dir;

    write_day(
        &data.join("marketplace/events/00000.pq"),
        "item_id",
        &[("u1", 100, 10), ("u1", 50, 11), ("u2", 10, 12)],
    );
    write_day(
        &data.join("marketplace/events/00001.pq"),
        "item_id",
        &[("u3", 5, 10)],
    );
    write_day(
        &data.join("retail/events/00001.pq"),
        "item_id",
        &[("u1", 75, 1), ("u3", 1, 2)],
    );
    write_day(&data.join("reviews/00002.pq"), "brand_id", &[("u2", 20, 5)]);

    let (vocab, _) = build_vocab(&config);
    assert_eq!(vocab.len(), 5 + 4);
    let report = partition(&config, DayWindow::all()).await;

    assert!(report.is_complete());
    assert_eq!(report.vocab_entries, 9);
    // Rows in == rows out: every event file row reaches a shard.
    assert_eq!(report.total_events(), 7);
    assert_eq!(report.total_users(), 3);
    // u2's marketplace entity 12 and u3's retail entity 2.
    assert_eq!(report.total_unknown(), 2);
    let skipped: Vec<&str> = report
        .domains
        .iter()
        .filter(|d| matches!(d, DomainOutcome::Skipped { .. }))
        .map(|d| d.domain())
        .collect();
    assert_eq!(skipped, vec!["offers"]);

    let users = read_all(&config);
    let unk = config.special_tokens.unknown_id();
    // MP_10 = 5, MP_11 = 6, RT_1 = 7, BR_5 = 8.
    let ids = |user: &str| -> Vec<u32> { users[user].1.tokens.iter().map(|t| t.0).collect() };
    assert_eq!(ids("u1"), vec![6, 7, 5]);
    assert_eq!(ids("u2"), vec![unk.0, 8]);
    assert_eq!(ids("u3"), vec![unk.0, 5]);

    for (user, (shard, seq)) in &users {
        assert_eq!(*shard, shard_of(user, config.shard_count));
        assert_eq!(seq.tokens.len(), seq.timestamps_us.len());
        assert!(seq.timestamps_us.windows(2).all(|w| w[0] <= w[1]));
        assert!(seq.tokens.iter().all(|t| t.0 < vocab.len() as u32));
    }
}

#[tokio::test]
async fn test_out_of_order_timestamps_are_sorted() {
    let temp = tempfile::tempdir().unwrap();
    let config = dataset(temp.path());
    write_day(
        &config.data_dir.join("marketplace/events/00000.pq"),
        "item_id",
        &[("u", 100, 10), ("u", 50, 11)],
    );
    build_vocab(&config);
    partition(&config, DayWindow::all()).await;

    let users = read_all(&config);
    let (_, seq) = &users["u"];
    assert_eq!(seq.timestamps_us, vec![50, 100]);
    assert_eq!(seq.tokens, vec![TokenId(6), TokenId(5)]);
}

#[tokio::test]
async fn test_zero_file_domains_do_not_block_others() {
    init_tracing();
    let temp = tempfile::tempdir().unwrap();
    let config = dataset(temp.path());
    write_day(&config.data_dir.join("reviews/00000.pq"), "brand_id", &[("r", 1, 5)]);
    build_vocab(&config);
    let report = partition(&config, DayWindow::all()).await;

    assert!(report.is_complete());
    let outcomes: Vec<(&str, bool)> = report
        .domains
        .iter()
        .map(|d| (d.domain(), matches!(d, DomainOutcome::Skipped { .. })))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("marketplace", true),
            ("retail", true),
            ("offers", true),
            ("reviews", false)
        ]
    );
    let users = read_all(&config);
    assert_eq!(users["r"].1.tokens, vec![TokenId(8)]);
}

#[tokio::test]
async fn test_vocabulary_and_shards_are_reproducible() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = dataset(temp.path());
    for day in 0..3 {
        let rows: Vec<(String, i64, i64)> = (0..20)
            .map(|i| (format!("user{}", i % 7), day * 100 + i, 10 + i % 3))
            .collect();
        let rows: Vec<(&str, i64, i64)> = rows.iter().map(|(u, t, e)| (u.as_str(), *t, *e)).collect();
        write_day(
            &config.data_dir.join(format!("marketplace/events/{day:05}.pq")),
            "item_id",
            &rows,
        );
    }

    let (_, first_path) = build_vocab(&config);
    let first_bytes = fs::read(&first_path).unwrap();
    partition(&config, DayWindow::all()).await;
    let first_run = read_all(&config);

    config.output_dir = temp.path().join("out2");
    let (_, second_path) = build_vocab(&config);
    assert_eq!(fs::read(&second_path).unwrap(), first_bytes);
    assert_eq!(
        fs::read(config.output_dir.join(VOCAB_SUMMARY_FILE)).unwrap(),
        fs::read(temp.path().join("out").join(VOCAB_SUMMARY_FILE)).unwrap()
    );
    partition(&config, DayWindow::all()).await;
    let second_run = read_all(&config);

    assert_eq!(first_run.len(), 7);
    assert_eq!(first_run, second_run);
}

#[tokio::test]
async fn test_day_window_limits_partitioned_files() {
    let temp = tempfile::tempdir().unwrap();
    let config = dataset(temp.path());
    for day in 0..5 {
        write_day(
            &config.data_dir.join(format!("retail/events/{day:05}.pq")),
            "item_id",
            &[("u", day, 1)],
        );
    }
    build_vocab(&config);
    let window = DayWindow {
        begin: Some(1),
        end: Some(3),
    };
    let report = partition(&config, window).await;
    assert_eq!(report.total_events(), 3);
    let users = read_all(&config);
    assert_eq!(users["u"].1.timestamps_us, vec![1, 2, 3]);
}
