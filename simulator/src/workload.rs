use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sql_coordinator::prelude::*;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::args::SimConfig;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pr (
        id       INTEGER PRIMARY KEY,
        state    TEXT NOT NULL,
        updates  INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pr_events (
        event_id INTEGER PRIMARY KEY,
        pr       INTEGER NOT NULL REFERENCES pr(id),
        action   TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pr_labels (
        event_id INTEGER NOT NULL REFERENCES pr_events(event_id),
        name     TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS rival_noise (
        id       INTEGER PRIMARY KEY,
        payload  TEXT NOT NULL
    );
";

const ACTIONS: &[&str] = &[
    "opened",
    "synchronize",
    "labeled",
    "review_requested",
    "closed",
    "reopened",
];
const LABELS: &[&str] = &["bug", "ui", "backend", "needs-review", "dependencies"];
const PR_COUNT: i64 = 64;

/// One delivery from the forge, planned up front from the seed.
#[derive(Debug, Clone)]
struct WebhookEvent {
    id: i64,
    pr: i64,
    action: &'static str,
    labels: Vec<&'static str>,
    fail_labels: bool,
    fail_outer: bool,
    invalidate_after: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed { labels_kept: usize },
    Aborted,
    Failed,
    Skipped,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct Report {
    pub(crate) events: usize,
    pub(crate) committed: usize,
    pub(crate) aborted: usize,
    pub(crate) failed: usize,
    pub(crate) skipped: usize,
    pub(crate) labels_kept: usize,
    pub(crate) rival_commits: u64,
    pub(crate) handle_opens: u64,
    pub(crate) invalidations: u64,
    pub(crate) elapsed_ms: u64,
    pub(crate) violations: Vec<String>,
}

fn plan_events(config: &SimConfig, rng: &mut ChaCha8Rng) -> Vec<WebhookEvent> {
    let count = i64::try_from(config.events).unwrap_or(i64::MAX);
    (1..=count)
        .map(|id| {
            let label_count = rng.gen_range(0..=3);
            let labels = (0..label_count)
                .map(|_| LABELS[rng.gen_range(0..LABELS.len())])
                .collect();
            WebhookEvent {
                id,
                pr: rng.gen_range(1..=PR_COUNT),
                action: ACTIONS[rng.gen_range(0..ACTIONS.len())],
                labels,
                fail_labels: rng.gen_bool(config.label_failure_rate),
                fail_outer: rng.gen_bool(config.abort_rate),
                invalidate_after: rng.gen_bool(config.invalidate_rate),
            }
        })
        .collect()
}

/// Apply one event: PR upsert and event row in the outer scope, labels in a savepoint.
async fn apply_event(db: &Coordinator, event: &WebhookEvent) -> Result<usize, CoordinatorError> {
    let event = event.clone();
    db.with_transaction(move |tx| {
        let event = event.clone();
        Box::pin(async move {
            tx.run(
                "INSERT INTO pr (id, state, updates) VALUES (?1, ?2, 1)
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state, updates = updates + 1",
                &[RowValues::Int(event.pr), RowValues::from(event.action)],
            )
            .await?;
            tx.run(
                "INSERT INTO pr_events (event_id, pr, action) VALUES (?1, ?2, ?3)",
                &[
                    RowValues::Int(event.id),
                    RowValues::Int(event.pr),
                    RowValues::from(event.action),
                ],
            )
            .await?;

            let (event_id, labels, fail_labels) = (event.id, event.labels.clone(), event.fail_labels);
            let labeled = tx
                .with_transaction(move |labels_tx| {
                    Box::pin(async move {
                        for name in &labels {
                            labels_tx
                                .run(
                                    "INSERT INTO pr_labels (event_id, name) VALUES (?1, ?2)",
                                    &[RowValues::Int(event_id), RowValues::from(*name)],
                                )
                                .await?;
                        }
                        if fail_labels {
                            return Err(CoordinatorError::caller("label sync rejected"));
                        }
                        Ok::<_, CoordinatorError>(labels.len())
                    })
                })
                .await;
            let labels_kept = match labeled {
                Ok(kept) => kept,
                Err(err) => {
                    debug!(event = event_id, error = %err, "label savepoint rolled back");
                    0
                }
            };

            if event.fail_outer {
                return Err(CoordinatorError::caller("webhook handler rejected event"));
            }
            Ok::<_, CoordinatorError>(labels_kept)
        })
    })
    .await
}

async fn worker(
    db: Coordinator,
    events: Arc<Vec<WebhookEvent>>,
    index: usize,
    stride: usize,
    deadline: Option<Instant>,
) -> Vec<(i64, Outcome)> {
    let mut outcomes = Vec::new();
    for event in events.iter().skip(index).step_by(stride) {
        if deadline.is_some_and(|at| Instant::now() >= at) {
            outcomes.push((event.id, Outcome::Skipped));
            continue;
        }
        let outcome = match apply_event(&db, event).await {
            Ok(labels_kept) => Outcome::Committed { labels_kept },
            Err(CoordinatorError::CallerError { .. }) => Outcome::Aborted,
            Err(err) => {
                warn!(event = event.id, error = %err, "event failed");
                Outcome::Failed
            }
        };
        if event.invalidate_after
            && let Err(err) = db.supervisor().invalidate().await
        {
            warn!(error = %err, "invalidate failed");
        }
        outcomes.push((event.id, outcome));
    }
    outcomes
}

/// Independent supervisor that keeps grabbing the write lock to provoke busy errors.
async fn rival(path: String, seed: u64, hold: Duration, stop: Arc<AtomicBool>) -> u64 {
    let db = match Coordinator::builder(path)
        .busy_timeout(Duration::from_millis(50))
        .build()
        .await
    {
        Ok(db) => db,
        Err(err) => {
            warn!(error = %err, "rival could not connect");
            return 0;
        }
    };
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5eed);
    let mut commits = 0;
    while !stop.load(Ordering::Acquire) {
        let payload = format!("noise-{}", rng.r#gen::<u32>());
        let result = db
            .with_transaction(move |tx| {
                let payload = payload.clone();
                Box::pin(async move {
                    tx.run("INSERT INTO rival_noise (payload) VALUES (?1)", &[RowValues::from(payload)])
                        .await?;
                    tokio::time::sleep(hold).await;
                    Ok::<_, CoordinatorError>(())
                })
            })
            .await;
        match result {
            Ok(()) => commits += 1,
            Err(err) => debug!(error = %err, "rival transaction failed"),
        }
        tokio::time::sleep(hold).await;
    }
    if let Err(err) = db.shutdown().await {
        warn!(error = %err, "rival shutdown failed");
    }
    commits
}

async fn scalar_int(db: &Coordinator, sql: &str) -> Result<i64, CoordinatorError> {
    let rs = db.query(sql, &[]).await?;
    Ok(rs.scalar().and_then(RowValues::as_int).copied().unwrap_or(0))
}

/// Compare the store against the outcomes the workers observed.
async fn verify(
    db: &Coordinator,
    outcomes: &BTreeMap<i64, Outcome>,
) -> Result<Vec<String>, CoordinatorError> {
    let mut violations = Vec::new();

    let committed: BTreeMap<i64, usize> = outcomes
        .iter()
        .filter_map(|(id, outcome)| match outcome {
            Outcome::Committed { labels_kept } => Some((*id, *labels_kept)),
            _ => None,
        })
        .collect();

    let rows = db.query("SELECT event_id FROM pr_events ORDER BY event_id", &[]).await?;
    for row in &rows.results {
        let Some(id) = row.get("event_id").and_then(RowValues::as_int) else {
            continue;
        };
        if !committed.contains_key(id) {
            violations.push(format!(
                "event {id} persisted but its transaction reported {:?}",
                outcomes.get(id)
            ));
        }
    }
    if rows.len() != committed.len() {
        violations.push(format!(
            "{} events committed but {} rows persisted",
            committed.len(),
            rows.len()
        ));
    }

    let labels = db
        .query("SELECT event_id, COUNT(*) AS n FROM pr_labels GROUP BY event_id", &[])
        .await?;
    let mut label_counts: BTreeMap<i64, usize> = BTreeMap::new();
    for row in &labels.results {
        if let (Some(id), Some(n)) = (
            row.get("event_id").and_then(RowValues::as_int),
            row.get("n").and_then(RowValues::as_int),
        ) {
            label_counts.insert(*id, usize::try_from(*n).unwrap_or(usize::MAX));
        }
    }
    for (id, expected) in &committed {
        let found = label_counts.get(id).copied().unwrap_or(0);
        if found != *expected {
            violations.push(format!("event {id}: expected {expected} labels, found {found}"));
        }
    }
    for id in label_counts.keys() {
        if !committed.contains_key(id) {
            violations.push(format!("labels persisted for uncommitted event {id}"));
        }
    }

    let updates = scalar_int(db, "SELECT COALESCE(SUM(updates), 0) FROM pr").await?;
    if usize::try_from(updates).ok() != Some(committed.len()) {
        violations.push(format!(
            "pr update counter is {updates}, expected {}",
            committed.len()
        ));
    }

    let integrity = db.query("PRAGMA integrity_check", &[]).await?;
    if integrity.scalar().and_then(RowValues::as_text) != Some("ok") {
        violations.push(format!("integrity_check: {:?}", integrity.scalar()));
    }
    let fk = db.query("PRAGMA foreign_key_check", &[]).await?;
    if !fk.is_empty() {
        violations.push(format!("{} foreign key violations", fk.len()));
    }

    Ok(violations)
}

pub(crate) async fn run(config: SimConfig, rng: &mut ChaCha8Rng) -> Result<Report, CoordinatorError> {
    let path = config.db.to_string_lossy().into_owned();
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }

    let retry = RetryOptions::default()
        .max_attempts(config.max_attempts)
        .base_delay(Duration::from_millis(config.base_delay_ms));
    let db = Coordinator::builder(path.as_str())
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .retry(retry)
        .build()
        .await?;
    db.execute_batch(SCHEMA).await?;

    let events = Arc::new(plan_events(&config, rng));
    info!(events = events.len(), tasks = config.tasks, rival = config.rival, "starting webhook burst");

    let stop = Arc::new(AtomicBool::new(false));
    let rival_task = config.rival.then(|| {
        tokio::spawn(rival(
            path.clone(),
            config.seed,
            Duration::from_millis(config.rival_hold_ms),
            Arc::clone(&stop),
        ))
    });

    let started = Instant::now();
    let deadline = config.duration_ms.map(|ms| started + Duration::from_millis(ms));
    let mut workers = JoinSet::new();
    for index in 0..config.tasks {
        workers.spawn(worker(db.clone(), Arc::clone(&events), index, config.tasks, deadline));
    }

    let mut outcomes = BTreeMap::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(batch) => outcomes.extend(batch),
            Err(err) => warn!(error = %err, "worker task failed"),
        }
    }
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Release);
    let rival_commits = match rival_task {
        Some(task) => task.await.unwrap_or(0),
        None => 0,
    };

    let violations = verify(&db, &outcomes).await?;
    let stats = db.supervisor().stats();
    let mut report = Report {
        events: events.len(),
        rival_commits,
        handle_opens: stats.opens,
        invalidations: stats.invalidations,
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        violations,
        ..Report::default()
    };
    for outcome in outcomes.values() {
        match outcome {
            Outcome::Committed { labels_kept } => {
                report.committed += 1;
                report.labels_kept += labels_kept;
            }
            Outcome::Aborted => report.aborted += 1,
            Outcome::Failed => report.failed += 1,
            Outcome::Skipped => report.skipped += 1,
        }
    }

    db.shutdown().await?;
    Ok(report)
}
