// The panic hook is process-wide, so these tests live in their own binary.

use sql_coordinator::install_panic_hook;
use sql_coordinator::prelude::*;
use tempfile::TempDir;

mod common;

use common::{count_rows, db_path};

#[tokio::test(flavor = "current_thread")]
async fn panicking_task_does_not_end_database_access() -> Result<(), CoordinatorError> {
    let dir = TempDir::new().expect("tempdir");
    let db = Coordinator::builder(db_path(&dir)).build().await?;
    db.execute_batch("CREATE TABLE events (id INTEGER PRIMARY KEY); INSERT INTO events VALUES (1);")
        .await?;
    install_panic_hook(db.supervisor());

    let joined = tokio::spawn(async { panic!("webhook handler failed") }).await;
    assert!(joined.expect_err("task panicked").is_panic());

    let stats = db.supervisor().stats();
    assert!(!stats.shut_down);
    assert_eq!(stats.closes, 1, "idle handle is closed by the hook");

    assert_eq!(count_rows(&db, "events").await?, 1);
    let stats = db.supervisor().stats();
    assert_eq!(stats.opens, 2);
    assert_eq!(stats.generation, 2);
    Ok(())
}
