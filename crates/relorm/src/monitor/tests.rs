use super::*;
use crate::error::{OrmError, OrmResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn test_query_type_detection() {
    assert_eq!(QueryType::from_sql("SELECT * FROM users"), QueryType::Select);
    assert_eq!(QueryType::from_sql("  select 1"), QueryType::Select);
    assert_eq!(QueryType::from_sql("INSERT INTO users (name) VALUES (?)"), QueryType::Insert);
    assert_eq!(QueryType::from_sql("UPDATE users SET name = ?"), QueryType::Update);
    assert_eq!(QueryType::from_sql("DELETE FROM users WHERE id = ?"), QueryType::Delete);
    assert_eq!(QueryType::from_sql("SAVEPOINT relorm_sp_1"), QueryType::Other);
}

#[test]
fn test_logging_monitor_truncation() {
    let monitor = LoggingMonitor::new().max_sql_length(10);
    assert_eq!(monitor.truncate_sql("SELECT * FROM users"), "SELECT * F...");
    assert_eq!(monitor.truncate_sql("SELECT 1"), "SELECT 1");
}

#[test]
fn test_stats_monitor() {
    let monitor = StatsMonitor::new();
    let select = QueryContext::new("SELECT * FROM users", 0);
    let insert = QueryContext::new("INSERT INTO t (x) VALUES (?)", 1);

    monitor.on_query_complete(&select, Duration::from_millis(10), &QueryResult::Rows(5));
    monitor.on_query_complete(&select, Duration::from_millis(20), &QueryResult::Rows(3));
    monitor.on_query_complete(
        &insert,
        Duration::from_millis(5),
        &QueryResult::error("duplicate key".to_string()),
    );

    let stats = monitor.stats();
    assert_eq!(stats.total_queries, 3);
    assert_eq!(stats.select_count, 2);
    assert_eq!(stats.insert_count, 1);
    assert_eq!(stats.failed_queries, 1);
    assert_eq!(stats.total_duration, Duration::from_millis(35));
    assert_eq!(stats.max_duration, Duration::from_millis(20));
    assert_eq!(stats.slowest_query.as_deref(), Some("SELECT * FROM users"));

    monitor.reset();
    assert_eq!(monitor.stats().total_queries, 0);
    assert!(monitor.stats().slowest_query.is_none());
}

#[test]
fn error_results_are_truncated() {
    let long = "x".repeat(2000);
    match QueryResult::error(long) {
        QueryResult::Error(msg) => assert_eq!(msg.len(), 515),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_composite_hook_modify_then_abort() {
    struct AddComment;
    impl QueryHook for AddComment {
        fn before_query(&self, ctx: &QueryContext) -> HookAction {
            HookAction::ModifySql(format!("/* app */ {}", ctx.exec_sql))
        }
    }
    struct BlockDelete;
    impl QueryHook for BlockDelete {
        fn before_query(&self, ctx: &QueryContext) -> HookAction {
            if ctx.query_type == QueryType::Delete {
                HookAction::Abort("DELETE not allowed".to_string())
            } else {
                HookAction::Continue
            }
        }
    }

    let hook = CompositeHook::new().add(AddComment).add(BlockDelete);
    match hook.before_query(&QueryContext::new("SELECT 1", 0)) {
        HookAction::ModifySql(sql) => assert_eq!(sql, "/* app */ SELECT 1"),
        other => panic!("expected ModifySql, got {other:?}"),
    }
    match hook.before_query(&QueryContext::new("DELETE FROM users", 0)) {
        HookAction::Abort(reason) => assert_eq!(reason, "DELETE not allowed"),
        other => panic!("expected Abort, got {other:?}"),
    }
}

#[test]
fn hook_rewrite_must_keep_placeholders() {
    struct DropParam;
    impl QueryHook for DropParam {
        fn before_query(&self, _ctx: &QueryContext) -> HookAction {
            HookAction::ModifySql("SELECT 1".to_string())
        }
    }

    let inst = Instrumentation::new().add_hook(DropParam);
    let mut ctx = QueryContext::new("SELECT * FROM t WHERE id = ?", 1);
    let err = inst.apply_hook(&mut ctx).unwrap_err();
    assert!(matches!(err, OrmError::PlaceholderMismatch { placeholders: 0, params: 1, .. }));
}

#[derive(Default)]
struct Capture(Mutex<Vec<String>>);

impl QueryMonitor for Capture {
    fn on_query_complete(&self, ctx: &QueryContext, _: Duration, result: &QueryResult) {
        self.0.lock().unwrap().push(format!("{} -> {result}", ctx.sql));
    }

    fn on_slow_query(&self, ctx: &QueryContext, _: Duration) {
        self.0.lock().unwrap().push(format!("slow {}", ctx.sql));
    }
}

#[test]
fn timer_reports_only_when_enabled() {
    let capture = Arc::new(Capture::default());

    let off = Instrumentation::new().with_monitor_arc(capture.clone());
    off.start(QueryContext::new("SELECT 1", 0))
        .finish(&OrmResult::Ok(vec![1]), |rows| QueryResult::Rows(rows.len()));
    assert!(capture.0.lock().unwrap().is_empty());

    let on = Instrumentation::new()
        .with_config(
            MonitorConfig::new()
                .with_slow_query_threshold(Duration::ZERO)
                .enable_monitoring(),
        )
        .with_monitor_arc(capture.clone());
    let timer = on.start(QueryContext::new("SELECT 1", 0));
    std::thread::sleep(Duration::from_millis(1));
    timer.finish(&OrmResult::Ok(vec![1, 2]), |rows| QueryResult::Rows(rows.len()));
    drop(on.start(QueryContext::new("SELECT 2", 0)));

    let seen = capture.0.lock().unwrap().clone();
    assert_eq!(seen[0], "SELECT 1 -> 2 rows");
    assert_eq!(seen[1], "slow SELECT 1");
    assert_eq!(seen[2], "SELECT 2 -> error: cancelled");
}

#[tokio::test]
async fn statement_timeout_returns_timeout_error() {
    let inst = Instrumentation::new()
        .with_config(MonitorConfig::new().with_statement_timeout(Duration::from_millis(10)));

    let err = inst
        .with_timeout(None, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            OrmResult::Ok(())
        })
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_retryable());

    let ok = inst.with_timeout(None, async { OrmResult::Ok(7) }).await.unwrap();
    assert_eq!(ok, 7);
}
