mod support;

use portl_core::types::{FailureKind, TransactionScope};
use portl_exec::connectors::{SqlCommand, StaticResolver};
use portl_exec::executor::COMMIT_STEP;
use portl_exec::transaction::TransactionManager;
use portl_exec::{ConnectorError, RunStatus};
use serde_json::{json, Map};
use support::{engine, job, seed, FakeDb};

fn upsert(id: i64) -> SqlCommand {
    let mut row = Map::new();
    row.insert("id".to_string(), json!(id));
    SqlCommand::Upsert {
        table: "t".to_string(),
        key: vec!["id".to_string()],
        row,
    }
}

#[tokio::test]
async fn shared_transaction_opens_lazily_and_once() {
    let db = FakeDb::new();
    let mut tx = TransactionManager::new(TransactionScope::Db);
    assert!(!tx.is_open());

    tx.execute("db", &db, &upsert(1)).await.unwrap();
    tx.execute("db", &db, &upsert(2)).await.unwrap();
    assert!(tx.is_open());
    assert_eq!(tx.bound_connection(), Some("db"));
    assert!(db.committed().is_empty());

    assert!(tx.commit().await.unwrap());
    assert_eq!(db.count("begin"), 1);
    assert_eq!(db.committed().len(), 2);
    assert_eq!(tx.stats().savepoints, 2);
}

#[tokio::test]
async fn commit_and_rollback_without_a_transaction_do_nothing() {
    let db = FakeDb::new();
    let mut tx = TransactionManager::new(TransactionScope::Db);

    assert!(!tx.commit().await.unwrap());
    assert!(!tx.rollback().await.unwrap());
    assert!(db.calls().is_empty());
}

#[tokio::test]
async fn failed_statement_rewinds_only_its_savepoint() {
    let db = FakeDb::new();
    let mut tx = TransactionManager::new(TransactionScope::Db);

    tx.execute("db", &db, &upsert(1)).await.unwrap();
    db.fail_next(ConnectorError::new(FailureKind::DbSerialization, "could not serialize access"));
    let err = tx.execute("db", &db, &upsert(2)).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::DbSerialization);

    tx.commit().await.unwrap();
    let committed = db.committed();
    assert_eq!(committed.len(), 1);
    assert!(committed.contains_key("t:1"));
}

#[tokio::test]
async fn shared_transaction_refuses_a_second_connection() {
    let db = FakeDb::new();
    let other = FakeDb::new();
    let mut tx = TransactionManager::new(TransactionScope::Db);

    tx.execute("db", &db, &upsert(1)).await.unwrap();
    let err = tx.execute("other", &other, &upsert(2)).await.unwrap_err();

    assert!(err.message.contains("bound to connection 'db'"));
    assert!(other.calls().is_empty());
}

#[tokio::test]
async fn scope_none_commits_every_statement() {
    let db = FakeDb::new();
    let resolver = StaticResolver::new().with("db", db.handle());
    let (engine, _) = engine(resolver);
    let yaml = r#"
id: autocommit
transaction: { scope: none }
connections:
  db: { type: postgres, config: { host: localhost } }
steps:
  - id: first
    type: db.upsert
    connection: db
    table: t
    key: [id]
    mapping: { id: 1 }
  - id: second
    type: db.upsert
    connection: db
    table: t
    key: [id]
    mapping: { id: 2 }
  - id: broken
    type: db.insert
    connection: db
    table: t
    mapping: { id: 1 }
"#;

    let report = engine.run(&job(yaml), seed(json!({})), false).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    assert_eq!(
        db.calls(),
        vec![
            "begin",
            "execute upsert",
            "commit",
            "begin",
            "execute upsert",
            "commit",
            "begin",
            "execute insert",
            "rollback",
        ]
    );
    // Earlier statements stay committed without a shared transaction.
    assert_eq!(db.committed().len(), 2);
    assert_eq!(report.transaction.commits, 2);
}

#[tokio::test]
async fn commit_failure_rolls_the_run_back() {
    let db = FakeDb::new();
    db.fail_commit(ConnectorError::new(FailureKind::DbConnection, "connection reset"));
    let resolver = StaticResolver::new().with("db", db.handle());
    let (engine, _) = engine(resolver);
    let yaml = r#"
id: commit_fails
connections:
  db: { type: postgres, config: { host: localhost } }
steps:
  - id: save
    type: db.upsert
    connection: db
    table: t
    key: [id]
    mapping: { id: 1 }
"#;

    let report = engine.run(&job(yaml), seed(json!({})), false).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    assert!(!report.committed);
    let error = report.error.unwrap();
    assert_eq!(error.step_id, COMMIT_STEP);
    assert_eq!(error.error, "transaction");
    assert!(db.committed().is_empty());
}
