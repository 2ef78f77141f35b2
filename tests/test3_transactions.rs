use std::sync::Arc;
use std::time::Duration;

use sql_coordinator::prelude::*;
use tempfile::TempDir;
use tokio::sync::Notify;

mod common;

use common::{count_rows, db_path};

async fn orders_db() -> Result<Coordinator, CoordinatorError> {
    let db = Coordinator::builder(":memory:").build().await?;
    db.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT NOT NULL);
         CREATE TABLE audit (order_id INTEGER, note TEXT);",
    )
    .await?;
    Ok(db)
}

#[tokio::test(flavor = "current_thread")]
async fn committed_scope_persists_every_statement() -> Result<(), CoordinatorError> {
    let db = orders_db().await?;
    let order_id = db
        .with_transaction(|tx| {
            Box::pin(async move {
                assert_eq!(tx.depth(), 1);
                assert_eq!(tx.savepoint(), None);
                let inserted = tx
                    .run("INSERT INTO orders (item) VALUES (?1)", &[RowValues::Text("widget".into())])
                    .await?;
                tx.run(
                    "INSERT INTO audit (order_id, note) VALUES (?1, 'created')",
                    &[RowValues::Int(inserted.last_insert_rowid)],
                )
                .await?;
                Ok::<_, CoordinatorError>(inserted.last_insert_rowid)
            })
        })
        .await?;

    assert_eq!(order_id, 1);
    assert_eq!(count_rows(&db, "orders").await?, 1);
    assert_eq!(count_rows(&db, "audit").await?, 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn failing_scope_leaves_no_trace() -> Result<(), CoordinatorError> {
    let db = orders_db().await?;
    let err = db
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.run("INSERT INTO orders (item) VALUES ('widget')", &[]).await?;
                Err::<(), _>(CoordinatorError::caller("payment declined"))
            })
        })
        .await
        .expect_err("callback failed");

    match err {
        CoordinatorError::CallerError { message, .. } => assert_eq!(message, "payment declined"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(count_rows(&db, "orders").await?, 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn two_writes_then_error_roll_back_together() -> Result<(), CoordinatorError> {
    let db = Coordinator::builder(":memory:").build().await?;
    db.execute_batch("CREATE TABLE t (id INTEGER)").await?;

    let err = db
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.run("INSERT INTO t VALUES (1)", &[]).await?;
                tx.run("INSERT INTO t VALUES (2)", &[]).await?;
                Err::<(), _>(CoordinatorError::caller("boom"))
            })
        })
        .await
        .expect_err("callback failed");

    assert!(matches!(err, CoordinatorError::CallerError { .. }), "got {err:?}");
    assert_eq!(count_rows(&db, "t").await?, 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn constraint_failing_at_commit_rolls_back() -> Result<(), CoordinatorError> {
    let db = Coordinator::builder(":memory:").build().await?;
    db.execute_batch(
        "CREATE TABLE repos (id INTEGER PRIMARY KEY);
         CREATE TABLE pulls (
             id INTEGER PRIMARY KEY,
             repo_id INTEGER NOT NULL REFERENCES repos(id) DEFERRABLE INITIALLY DEFERRED
         );",
    )
    .await?;

    let err = db
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.run("INSERT INTO pulls (id, repo_id) VALUES (1, 99)", &[]).await?;
                Ok::<_, CoordinatorError>(())
            })
        })
        .await
        .expect_err("dangling reference is checked at commit");

    match err {
        CoordinatorError::TransactionError { depth, savepoint, source } => {
            assert_eq!(depth, 1);
            assert_eq!(savepoint, None);
            assert!(matches!(*source, CoordinatorError::CallerError { .. }), "got {source:?}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(count_rows(&db, "pulls").await?, 0);

    db.run("INSERT INTO repos (id) VALUES (99)", &[]).await?;
    db.run("INSERT INTO pulls (id, repo_id) VALUES (1, 99)", &[]).await?;
    assert_eq!(count_rows(&db, "pulls").await?, 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn inner_failure_only_discards_the_savepoint() -> Result<(), CoordinatorError> {
    let db = orders_db().await?;
    db.with_transaction(|tx| {
        Box::pin(async move {
            tx.run("INSERT INTO orders (item) VALUES ('outer')", &[]).await?;
            let inner = tx
                .with_transaction(|inner| {
                    Box::pin(async move {
                        assert_eq!(inner.depth(), 2);
                        assert_eq!(inner.savepoint(), Some("sp_coord_2"));
                        inner.run("INSERT INTO orders (item) VALUES ('inner')", &[]).await?;
                        Err::<(), _>(CoordinatorError::caller("inner gave up"))
                    })
                })
                .await;
            assert!(inner.is_err());
            Ok::<_, CoordinatorError>(())
        })
    })
    .await?;

    let rows = db.query("SELECT item FROM orders ORDER BY id", &[]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.results[0].get("item").and_then(RowValues::as_text), Some("outer"));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn outer_failure_discards_released_savepoints() -> Result<(), CoordinatorError> {
    let db = orders_db().await?;
    let result = db
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.with_transaction(|inner| {
                    Box::pin(async move {
                        inner.run("INSERT INTO orders (item) VALUES ('inner')", &[]).await?;
                        Ok::<_, CoordinatorError>(())
                    })
                })
                .await?;
                Err::<(), _>(CoordinatorError::caller("outer gave up"))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(count_rows(&db, "orders").await?, 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn siblings_and_grandchildren_get_distinct_savepoints() -> Result<(), CoordinatorError> {
    let db = orders_db().await?;
    db.with_transaction(|tx| {
        Box::pin(async move {
            for item in ["first", "second"] {
                tx.with_transaction(move |sibling| {
                    Box::pin(async move {
                        sibling
                            .run("INSERT INTO orders (item) VALUES (?1)", &[RowValues::Text(item.into())])
                            .await?;
                        Ok::<_, CoordinatorError>(())
                    })
                })
                .await?;
            }

            tx.with_transaction(|child| {
                Box::pin(async move {
                    child.run("INSERT INTO orders (item) VALUES ('child')", &[]).await?;
                    let grandchild = child
                        .with_transaction(|grandchild| {
                            Box::pin(async move {
                                assert_eq!(grandchild.depth(), 3);
                                assert_eq!(grandchild.savepoint(), Some("sp_coord_3"));
                                grandchild
                                    .run("INSERT INTO orders (item) VALUES ('grandchild')", &[])
                                    .await?;
                                Err::<(), _>(CoordinatorError::caller("discard grandchild"))
                            })
                        })
                        .await;
                    assert!(grandchild.is_err());
                    Ok::<_, CoordinatorError>(())
                })
            })
            .await
        })
    })
    .await?;

    let rows = db.query("SELECT item FROM orders ORDER BY id", &[]).await?;
    let items: Vec<&str> = rows
        .results
        .iter()
        .filter_map(|row| row.get("item").and_then(RowValues::as_text))
        .collect();
    assert_eq!(items, ["first", "second", "child"]);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn broken_savepoint_reports_depth_and_name() -> Result<(), CoordinatorError> {
    let db = orders_db().await?;
    let err = db
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.run("INSERT INTO orders (item) VALUES ('outer')", &[]).await?;
                tx.with_transaction(|inner| {
                    Box::pin(async move {
                        // Releasing our own savepoint early makes the final RELEASE fail.
                        inner.execute_batch("RELEASE sp_coord_2").await?;
                        Ok::<_, CoordinatorError>(())
                    })
                })
                .await
            })
        })
        .await
        .expect_err("release must fail");

    match err {
        CoordinatorError::TransactionError { depth, savepoint, .. } => {
            assert_eq!(depth, 2);
            assert_eq!(savepoint.as_deref(), Some("sp_coord_2"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(count_rows(&db, "orders").await?, 0, "outer scope rolled back too");
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn scope_statements_and_operations_share_the_transaction() -> Result<(), CoordinatorError> {
    let db = orders_db().await?;
    let insert = Operation::new(
        "INSERT INTO orders (item) VALUES (?1)",
        vec![RowValues::Text("gadget".into())],
    );
    let seen = db
        .with_transaction(move |tx| {
            let insert = insert.clone();
            Box::pin(async move {
                tx.run_operation(&insert).await?;
                tx.execute_batch("INSERT INTO audit VALUES (1, 'a'); INSERT INTO audit VALUES (1, 'b');")
                    .await?;
                let count = Operation::new_without_params("SELECT COUNT(*) AS n FROM audit");
                let rs = tx.query_operation(&count).await?;
                Ok::<_, CoordinatorError>(rs.scalar().and_then(RowValues::as_int).copied())
            })
        })
        .await?;

    assert_eq!(seen, Some(2));
    assert_eq!(count_rows(&db, "orders").await?, 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn abandoned_transaction_is_rolled_back() -> Result<(), CoordinatorError> {
    let dir = TempDir::new().expect("tempdir");
    let db = Coordinator::builder(db_path(&dir)).build().await?;
    db.execute_batch("CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT)").await?;

    let inserted = Arc::new(Notify::new());
    let worker = {
        let db = db.clone();
        let inserted = Arc::clone(&inserted);
        tokio::spawn(async move {
            db.with_transaction(move |tx| {
                let inserted = Arc::clone(&inserted);
                Box::pin(async move {
                    tx.run("INSERT INTO orders (item) VALUES ('half-done')", &[]).await?;
                    inserted.notify_one();
                    std::future::pending::<()>().await;
                    Ok::<_, CoordinatorError>(())
                })
            })
            .await
        })
    };

    inserted.notified().await;
    worker.abort();
    assert!(worker.await.is_err_and(|e| e.is_cancelled()));

    // The dropped lease rolls back before the handle is handed out again.
    let count = tokio::time::timeout(Duration::from_secs(5), count_rows(&db, "orders"))
        .await
        .expect("handle released after abort")?;
    assert_eq!(count, 0);
    assert_eq!(db.supervisor().stats().invalidations, 0);
    Ok(())
}
