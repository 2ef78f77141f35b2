//! Criterion comparison of raw `rusqlite` against the coordinator for the two
//! hot paths: single-row lookups and small write transactions. Both variants
//! hit the same seeded WAL file so the numbers isolate coordination overhead
//! (lease, blocking-pool hop, retry wrapper).

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rusqlite::{Connection, params};
use sql_coordinator::prelude::*;
use std::hint::black_box;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Seeded database file plus a shuffled lookup order.
struct Dataset {
    _dir: TempDir,
    path: String,
    ids: Vec<i64>,
}

static DATASET: LazyLock<Dataset> = LazyLock::new(|| {
    let row_count = row_count();
    let dir = TempDir::new().expect("create bench tempdir");
    let path = dir.path().join("coordinator_bench.db").to_string_lossy().into_owned();
    prepare_dataset(&path, row_count).expect("failed to prepare SQLite dataset");

    let mut ids: Vec<i64> = (1..=row_count).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(1_234_567_890);
    ids.shuffle(&mut rng);

    Dataset {
        _dir: dir,
        path,
        ids,
    }
});

static TOKIO_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("create tokio runtime"));

fn row_count() -> i64 {
    std::env::var("BENCH_ROWS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(1000)
}

fn prepare_dataset(path: &str, row_count: i64) -> rusqlite::Result<()> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        CREATE TABLE pr (
            id      INTEGER PRIMARY KEY,
            title   TEXT NOT NULL,
            score   REAL NOT NULL
        );
        CREATE TABLE pr_events (pr INTEGER NOT NULL, action TEXT NOT NULL);
        ",
    )?;
    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare("INSERT INTO pr (id, title, score) VALUES (?1, ?2, ?3)")?;
        for id in 1..=row_count {
            #[allow(clippy::cast_precision_loss)]
            insert.execute(params![id, format!("pr-{id}"), id as f64 * 0.5])?;
        }
    }
    tx.commit()
}

fn benchmark_lookup_rusqlite(group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>) {
    let dataset = &*DATASET;
    let conn = Connection::open(&dataset.path).expect("open sqlite connection");

    group.bench_function(BenchmarkId::new("rusqlite", dataset.ids.len()), |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::default();
            for _ in 0..iters {
                let mut stmt = conn
                    .prepare_cached("SELECT id, title, score FROM pr WHERE id = ?1")
                    .expect("prepare lookup");
                let start = Instant::now();
                for &id in &dataset.ids {
                    let title: String = stmt.query_row([id], |row| row.get(1)).expect("lookup row");
                    black_box(title);
                }
                total += start.elapsed();
            }
            total
        });
    });
}

fn benchmark_lookup_coordinator(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let dataset = &*DATASET;
    let runtime = &*TOKIO_RUNTIME;
    let db = runtime
        .block_on(Coordinator::builder(dataset.path.as_str()).build())
        .expect("build coordinator");

    group.bench_function(BenchmarkId::new("coordinator", dataset.ids.len()), |b| {
        b.to_async(runtime).iter_custom(|iters| {
            let db = db.clone();
            async move {
                let mut total = Duration::default();
                for _ in 0..iters {
                    let start = Instant::now();
                    for &id in &dataset.ids {
                        let rs = db
                            .query("SELECT id, title, score FROM pr WHERE id = ?1", &[RowValues::Int(id)])
                            .await
                            .expect("coordinator lookup");
                        black_box(rs.first().and_then(|row| row.get("title")).cloned());
                    }
                    total += start.elapsed();
                }
                total
            }
        });
    });
}

fn benchmark_write_transactions(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let dataset = &*DATASET;
    let runtime = &*TOKIO_RUNTIME;
    let db = runtime
        .block_on(Coordinator::builder(dataset.path.as_str()).build())
        .expect("build coordinator");

    group.bench_function(BenchmarkId::new("with_savepoint", 1), |b| {
        b.to_async(runtime).iter(|| {
            let db = db.clone();
            async move {
                db.with_transaction(|tx| {
                    Box::pin(async move {
                        tx.run("INSERT INTO pr_events (pr, action) VALUES (1, 'opened')", &[])
                            .await?;
                        tx.with_transaction(|inner| {
                            Box::pin(async move {
                                inner
                                    .run("INSERT INTO pr_events (pr, action) VALUES (1, 'labeled')", &[])
                                    .await?;
                                Ok::<_, CoordinatorError>(())
                            })
                        })
                        .await
                    })
                })
                .await
                .expect("write transaction");
            }
        });
    });
}

fn coordinator_benchmark(c: &mut Criterion) {
    let mut lookups = c.benchmark_group("single_row_lookup");
    lookups.throughput(Throughput::Elements(DATASET.ids.len() as u64));
    benchmark_lookup_rusqlite(&mut lookups);
    benchmark_lookup_coordinator(&mut lookups);
    lookups.finish();

    let mut writes = c.benchmark_group("write_transaction");
    writes.throughput(Throughput::Elements(1));
    benchmark_write_transactions(&mut writes);
    writes.finish();
}

criterion_group!(benches, coordinator_benchmark);
criterion_main!(benches);
