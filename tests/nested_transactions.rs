//! End-to-end nesting behaviour against the in-memory backend.

use serde_json::Value;
use txnest::backend::{Capabilities, NestedFallback};
use txnest::memory::MemoryConnection;
use txnest::transaction::{ScopedContext, TransactionCoordinator, TransactionError};

type Ctx = ScopedContext<MemoryConnection>;

#[derive(Debug, thiserror::Error)]
enum TestError {
    #[error(transparent)]
    Tx(#[from] TransactionError),
    #[error("body failed")]
    Boom,
}

async fn setup(caps: Capabilities) -> (MemoryConnection, TransactionCoordinator<MemoryConnection>) {
    let conn = MemoryConnection::new(caps);
    let coordinator = TransactionCoordinator::new(conn.clone());
    coordinator
        .execute("CREATE TABLE post (id INTEGER, title TEXT)")
        .await
        .unwrap();
    (conn, coordinator)
}

async fn save(tx: &Ctx, title: &str) -> Result<(), TestError> {
    tx.execute(&format!("INSERT INTO post (title) VALUES ('{}')", title))
        .await?;
    Ok(())
}

fn titles(conn: &MemoryConnection) -> Vec<String> {
    conn.rows("post")
        .iter()
        .filter_map(|row| row.get("title").and_then(Value::as_str).map(String::from))
        .collect()
}

fn savepoint_backends() -> Vec<Capabilities> {
    vec![
        Capabilities::postgres(),
        Capabilities::mysql(),
        Capabilities::sqlite(),
        Capabilities::mssql(),
        Capabilities::oracle(),
    ]
}

async fn deeply_nested(coordinator: &TransactionCoordinator<MemoryConnection>) -> Result<(), TestError> {
    coordinator
        .transaction(|em0| async move {
            save(&em0, "Post #1").await?;

            let _ = em0
                .transaction(|em1| async move {
                    save(&em1, "Post #2").await?;
                    em1.transaction(|em2| async move { save(&em2, "Post #3").await })
                        .await?;
                    Err::<(), _>(TestError::Boom)
                })
                .await;

            em0.transaction(|em1| async move { save(&em1, "Post #4").await })
                .await?;

            em0.transaction(|em1| async move {
                save(&em1, "Post #5").await?;

                let _ = em1
                    .transaction(|em2| async move {
                        save(&em2, "Post #6").await?;
                        em2.transaction(|em3| async move { save(&em3, "Post #7").await })
                            .await?;
                        Err::<(), _>(TestError::Boom)
                    })
                    .await;

                em1.transaction(|em2| async move { save(&em2, "Post #8").await })
                    .await?;

                em1.transaction(|em2| async move {
                    save(&em2, "Post #9").await?;

                    let _ = em2
                        .transaction(|em3| async move {
                            save(&em3, "Post #10").await?;
                            em3.transaction(|em4| async move { save(&em4, "Post #11").await })
                                .await?;
                            Err::<(), _>(TestError::Boom)
                        })
                        .await;

                    em2.transaction(|em3| async move { save(&em3, "Post #12").await })
                        .await
                })
                .await
            })
            .await
        })
        .await
}

#[tokio::test]
async fn test_deeply_nested_conditions() {
    for caps in savepoint_backends() {
        let backend = caps.name.clone();
        let (conn, coordinator) = setup(caps).await;

        deeply_nested(&coordinator).await.unwrap();

        assert_eq!(
            titles(&conn),
            vec!["Post #1", "Post #4", "Post #5", "Post #8", "Post #9", "Post #12"],
            "backend {}",
            backend
        );
        assert!(!conn.in_transaction(), "backend {}", backend);
        assert!(coordinator.frames().is_empty(), "backend {}", backend);
    }
}

#[tokio::test]
async fn test_first_transaction_fails() {
    for caps in savepoint_backends() {
        let (conn, coordinator) = setup(caps).await;

        let result = coordinator
            .transaction(|em0| async move {
                save(&em0, "Post #1").await?;

                let _ = em0
                    .transaction(|em1| async move {
                        save(&em1, "Post #2").await?;
                        Err::<(), _>(TestError::Boom)
                    })
                    .await;

                em0.transaction(|em1| async move {
                    save(&em1, "Post #3").await?;

                    let _ = em1
                        .transaction(|em2| async move {
                            save(&em2, "Post #4").await?;
                            Err::<(), _>(TestError::Boom)
                        })
                        .await;

                    em1.transaction(|em2| async move {
                        save(&em2, "Post #5").await?;
                        let _ = em2
                            .transaction(|em3| async move {
                                save(&em3, "Post #6").await?;
                                Err::<(), _>(TestError::Boom)
                            })
                            .await;
                        Ok::<_, TestError>(())
                    })
                    .await
                })
                .await?;

                Err::<(), _>(TestError::Boom)
            })
            .await;

        assert!(matches!(result, Err(TestError::Boom)));
        assert!(titles(&conn).is_empty());
        assert!(!conn.in_transaction());
    }
}

#[tokio::test]
async fn test_caught_nested_failure_keeps_root_work() {
    let (conn, coordinator) = setup(Capabilities::postgres()).await;

    coordinator
        .transaction(|tx| async move {
            save(&tx, "R1").await?;
            let nested = tx
                .transaction(|tx| async move {
                    save(&tx, "R2").await?;
                    Err::<(), _>(TestError::Boom)
                })
                .await;
            assert!(matches!(nested, Err(TestError::Boom)));
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();

    assert_eq!(titles(&conn), vec!["R1"]);
}

#[tokio::test]
async fn test_uncaught_root_failure_discards_everything() {
    let (conn, coordinator) = setup(Capabilities::postgres()).await;

    let result = coordinator
        .transaction(|tx| async move {
            save(&tx, "R1").await?;
            Err::<(), _>(TestError::Boom)
        })
        .await;

    assert!(matches!(result, Err(TestError::Boom)));
    assert!(titles(&conn).is_empty());
    assert_eq!(conn.executed().last().map(String::as_str), Some("ROLLBACK"));
}

#[tokio::test]
async fn test_failure_removes_only_its_own_depth() {
    let (conn, coordinator) = setup(Capabilities::postgres()).await;

    coordinator
        .transaction(|tx| async move {
            save(&tx, "root before").await?;
            tx.transaction(|tx| async move {
                save(&tx, "depth1 before").await?;
                let _ = tx
                    .transaction(|tx| async move {
                        save(&tx, "depth2").await?;
                        tx.transaction(|tx| async move { save(&tx, "depth3").await })
                            .await?;
                        Err::<(), _>(TestError::Boom)
                    })
                    .await;
                save(&tx, "depth1 after").await
            })
            .await?;
            save(&tx, "root after").await
        })
        .await
        .unwrap();

    assert_eq!(
        titles(&conn),
        vec!["root before", "depth1 before", "depth1 after", "root after"]
    );
}

#[tokio::test]
async fn test_root_failure_discards_committed_descendants() {
    let (conn, coordinator) = setup(Capabilities::mysql()).await;

    let result = coordinator
        .transaction(|tx| async move {
            tx.transaction(|tx| async move {
                save(&tx, "child").await?;
                tx.transaction(|tx| async move { save(&tx, "grandchild").await })
                    .await
            })
            .await?;
            assert!(tx.coordinator().connection().savepoints().is_empty());
            Err::<(), _>(TestError::Boom)
        })
        .await;

    assert!(matches!(result, Err(TestError::Boom)));
    assert!(titles(&conn).is_empty());
}

#[tokio::test]
async fn test_rejecting_backend_surfaces_nesting_error() {
    let (conn, coordinator) = setup(Capabilities::spanner()).await;

    let result = coordinator
        .transaction(|tx| async move {
            save(&tx, "Post #1").await?;
            tx.transaction(|tx| async move { save(&tx, "Post #2").await })
                .await
        })
        .await;

    match result {
        Err(TestError::Tx(TransactionError::NestingUnsupported { backend, depth })) => {
            assert_eq!(backend, "spanner");
            assert_eq!(depth, 1);
        }
        other => panic!("expected NestingUnsupported, got {:?}", other),
    }
    assert!(titles(&conn).is_empty());
}

#[tokio::test]
async fn test_passthrough_backend_runs_nested_bodies_inline() {
    let caps = Capabilities::spanner().with_nested_fallback(NestedFallback::Passthrough);
    let (conn, coordinator) = setup(caps).await;

    deeply_nested(&coordinator).await.unwrap();

    // Without savepoints a caught failure cannot undo anything.
    assert_eq!(titles(&conn).len(), 12);
    assert!(conn
        .executed()
        .iter()
        .all(|sql| !sql.contains("SAVEPOINT")));
}

#[tokio::test]
async fn test_sequential_roots_get_distinct_ids() {
    let (_conn, coordinator) = setup(Capabilities::postgres()).await;

    let first = coordinator
        .transaction(|tx| async move { Ok::<_, TransactionError>(tx.coordinator().root_id()) })
        .await
        .unwrap();
    let second = coordinator
        .transaction(|tx| async move { Ok::<_, TransactionError>(tx.coordinator().root_id()) })
        .await
        .unwrap();

    assert!(first.is_some());
    assert_ne!(first, second);
}
