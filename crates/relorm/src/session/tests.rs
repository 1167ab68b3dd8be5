use super::*;
use crate::connection::ReplicaSet;
use crate::monitor::MonitorConfig;
use crate::testing::{rows, MockDb, MockPool};
use std::sync::Mutex;
use std::time::Duration;

fn single(db: &MockDb) -> (Database<MockPool>, MockPool) {
    let master = db.pool("m0", 4);
    let database = Database::builder(ReplicaSet::new(vec![master.clone()])).build();
    (database, master)
}

fn recorder() -> (Arc<Mutex<Vec<i32>>>, impl Fn(i32) -> Box<dyn FnOnce() + Send>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let make = move |n: i32| -> Box<dyn FnOnce() + Send> {
        let sink = sink.clone();
        Box::new(move || sink.lock().unwrap().push(n))
    };
    (seen, make)
}

#[tokio::test]
async fn inner_rollback_keeps_outer_writes() {
    let db = MockDb::new();
    let (database, master) = single(&db);
    let mut s = database.session();

    s.begin().await.unwrap();
    s.execute_raw("INSERT INTO t (v) VALUES (?)", vec![1.into()])
        .await
        .unwrap();
    s.begin().await.unwrap();
    assert_eq!(s.depth(), 2);
    s.execute_raw("INSERT INTO t (v) VALUES (?)", vec![2.into()])
        .await
        .unwrap();
    s.roll_back().await.unwrap();
    assert_eq!(s.depth(), 1);
    s.commit().await.unwrap();
    assert_eq!(s.depth(), 0);

    assert_eq!(db.journal(), vec!["INSERT INTO t (v) VALUES (?)".to_string()]);
    let control: Vec<String> = db
        .statements()
        .into_iter()
        .filter(|sql| !sql.starts_with("INSERT"))
        .collect();
    assert_eq!(
        control,
        vec![
            "BEGIN",
            "SAVEPOINT relorm_sp_1",
            "ROLLBACK TO SAVEPOINT relorm_sp_1",
            "COMMIT"
        ]
    );
    assert_eq!(master.in_use(), 0);
    assert_eq!(master.released(), 1);
}

#[tokio::test]
async fn released_savepoint_commits_with_outer() {
    let db = MockDb::new();
    let (database, _) = single(&db);
    let mut s = database.session();

    s.begin().await.unwrap();
    s.begin().await.unwrap();
    s.execute_raw("DELETE FROM t", vec![]).await.unwrap();
    s.commit().await.unwrap();
    assert!(db.journal().is_empty());
    s.commit().await.unwrap();
    assert_eq!(db.journal(), vec!["DELETE FROM t".to_string()]);
}

#[tokio::test]
async fn callbacks_run_once_after_outer_commit() {
    let db = MockDb::new();
    let (database, _) = single(&db);
    let mut s = database.session();
    let (seen, make) = recorder();

    s.begin().await.unwrap();
    s.add_event(make(1));
    s.begin().await.unwrap();
    s.add_event(make(2));
    s.commit().await.unwrap();
    assert!(seen.lock().unwrap().is_empty());

    s.commit().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

    s.add_event(make(3));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn outer_rollback_discards_callbacks() {
    let db = MockDb::new();
    let (database, _) = single(&db);
    let mut s = database.session();
    let (seen, make) = recorder();

    s.begin().await.unwrap();
    s.add_event(make(1));
    s.roll_back().await.unwrap();
    assert!(seen.lock().unwrap().is_empty());

    // A new transaction starts with an empty queue.
    s.begin().await.unwrap();
    s.commit().await.unwrap();
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn savepoint_rollback_keeps_queued_callbacks() {
    let db = MockDb::new();
    let (database, _) = single(&db);
    let mut s = database.session();
    let (seen, make) = recorder();

    s.begin().await.unwrap();
    s.add_event(make(1));
    s.begin().await.unwrap();
    s.add_event(make(2));
    s.roll_back().await.unwrap();
    s.commit().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn failed_commit_discards_connection_and_callbacks() {
    let db = MockDb::new();
    let (database, master) = single(&db);
    let mut s = database.session();
    let (seen, make) = recorder();

    s.begin().await.unwrap();
    s.add_event(make(1));
    db.fail_on("COMMIT");
    assert!(s.commit().await.is_err());
    assert!(!s.in_transaction());
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(master.discarded(), 1);
    assert_eq!(master.in_use(), 0);
}

#[tokio::test]
async fn commit_and_rollback_require_a_transaction() {
    let db = MockDb::new();
    let (database, _) = single(&db);
    let mut s = database.session();

    assert!(matches!(s.commit().await, Err(OrmError::Transaction(_))));
    assert!(matches!(s.roll_back().await, Err(OrmError::Transaction(_))));
    assert!(db.statements().is_empty());
}

#[tokio::test]
async fn transaction_pins_one_master_connection() {
    let db = MockDb::new();
    let database = Database::builder(
        ReplicaSet::new(vec![db.pool("m0", 4)]).with_slaves(vec![db.pool("s0", 4)]),
    )
    .build();
    let mut s = database.session();

    s.begin().await.unwrap();
    let pinned = s.transaction_connection_id();
    s.fetch_raw("SELECT * FROM t", vec![]).await.unwrap();
    s.execute_raw("UPDATE t SET v = ?", vec![1.into()])
        .await
        .unwrap();
    s.fetch_raw("SELECT * FROM t WHERE v = ?", vec![1.into()])
        .await
        .unwrap();
    assert_eq!(s.transaction_connection_id(), pinned);
    s.commit().await.unwrap();

    let log = db.log();
    assert_eq!(log.len(), 5);
    assert!(log.iter().all(|l| l.pool == "m0"));
    assert!(log.windows(2).all(|w| w[0].conn == w[1].conn));
}

#[tokio::test]
async fn routing_outside_transaction() {
    let db = MockDb::new();
    let database = Database::builder(
        ReplicaSet::new(vec![db.pool("m0", 4)]).with_slaves(vec![db.pool("s0", 4)]),
    )
    .build();
    let mut s = database.session();

    s.fetch_raw("SELECT 1", vec![]).await.unwrap();
    s.execute_raw("INSERT INTO t (v) VALUES (?)", vec![1.into()])
        .await
        .unwrap();
    let locking = s
        .table("t")
        .where_eq("id", 1)
        .lock_for_update()
        .to_statement(StatementKind::Select)
        .unwrap();
    s.fetch(&locking).await.unwrap();

    let pools: Vec<String> = db.log().into_iter().map(|l| l.pool).collect();
    assert_eq!(pools, vec!["s0", "m0", "m0"]);
}

#[tokio::test]
async fn placeholder_mismatch_fails_before_acquiring() {
    let db = MockDb::new();
    let (database, master) = single(&db);
    let mut s = database.session();

    let err = s
        .fetch_raw("SELECT * FROM t WHERE a = ? AND b = ?", vec![1.into()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrmError::PlaceholderMismatch {
            placeholders: 2,
            params: 1,
            ..
        }
    ));
    assert!(db.statements().is_empty());
    assert_eq!(master.in_use(), 0);
}

#[tokio::test]
async fn statement_timeout_returns_connection() {
    let db = MockDb::new();
    let master = db.pool("m0", 1);
    let database = Database::builder(ReplicaSet::new(vec![master.clone()]))
        .instrumentation(Instrumentation::new().with_config(
            MonitorConfig::new().with_statement_timeout(Duration::from_millis(10)),
        ))
        .build();
    let mut s = database.session();
    db.delay(Duration::from_millis(200));

    let err = s.fetch_raw("SELECT pg_sleep(1)", vec![]).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(master.in_use(), 0);

    // The single connection is usable again.
    db.delay(Duration::ZERO);
    s.fetch_raw("SELECT 1", vec![]).await.unwrap();
}

#[tokio::test]
async fn failure_inside_transaction_leaves_it_open() {
    let db = MockDb::new();
    let (database, _) = single(&db);
    let mut s = database.session();

    s.begin().await.unwrap();
    db.fail_on("broken");
    assert!(s.execute_raw("UPDATE broken SET x = 1", vec![]).await.is_err());
    assert!(s.in_transaction());
    assert!(!db.statements().iter().any(|sql| sql == "ROLLBACK"));
    s.roll_back().await.unwrap();
}

#[tokio::test]
async fn dropped_session_discards_open_transaction() {
    let db = MockDb::new();
    let (database, master) = single(&db);
    let mut s = database.session();
    s.begin().await.unwrap();
    s.execute_raw("DELETE FROM t", vec![]).await.unwrap();
    drop(s);

    assert_eq!(master.discarded(), 1);
    assert_eq!(master.in_use(), 0);
    assert!(db.journal().is_empty());
}

#[tokio::test]
async fn transaction_macro_commits_or_rolls_back() {
    let db = MockDb::new();
    let (database, _) = single(&db);
    let mut s = database.session();

    let ok: OrmResult<u64> = async {
        crate::transaction!(s, {
            let n = s.execute_raw("DELETE FROM a", vec![]).await?;
            Ok(n)
        })
    }
    .await;
    assert_eq!(ok.unwrap(), 1);

    let failed: OrmResult<()> = async {
        crate::transaction!(s, {
            s.execute_raw("DELETE FROM b", vec![]).await?;
            Err::<(), _>(OrmError::validation("stop"))
        })
    }
    .await;
    assert!(matches!(failed, Err(OrmError::Validation(_))));
    assert!(!s.in_transaction());
    assert_eq!(db.journal(), vec!["DELETE FROM a".to_string()]);
}

#[tokio::test]
async fn columns_are_read_once() {
    let db = MockDb::new();
    db.respond(|sql, params| {
        if sql.contains("information_schema") && params[0].as_str() == Some("users") {
            rows(&["column_name"], vec![vec!["id".into()], vec!["name".into()]])
        } else {
            Vec::new()
        }
    });
    let (database, _) = single(&db);
    let mut s = database.session();

    let first = s.columns("users").await.unwrap();
    let second = s.columns("users").await.unwrap();
    assert_eq!(&*first, &["id".to_string(), "name".to_string()]);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(db.queries().len(), 1);

    assert!(s.columns("missing").await.unwrap_err().is_not_found());
}
