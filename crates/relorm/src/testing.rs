//! In-memory connection/pool doubles for unit tests.
//!
//! Every statement is logged. Writes issued outside a transaction are applied
//! immediately to the shared journal; inside a transaction they go to the
//! innermost frame and only reach the journal on `COMMIT`. Savepoints push a
//! frame; `RELEASE` folds it into its parent, `ROLLBACK TO` drops it.

use crate::connection::{Connection, Pool};
use crate::error::{OrmError, OrmResult};
use crate::record::Row;
use crate::value::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Arc<dyn Fn(&str, &[Value]) -> Vec<Row> + Send + Sync>;

/// A statement seen by a mock connection.
#[derive(Debug, Clone)]
pub(crate) struct Logged {
    pub pool: String,
    pub conn: usize,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct DbState {
    log: Vec<Logged>,
    journal: Vec<String>,
}

/// Shared fake database behind one or more mock pools.
#[derive(Clone, Default)]
pub(crate) struct MockDb {
    state: Arc<Mutex<DbState>>,
    responder: Arc<Mutex<Option<Responder>>>,
    fail_on: Arc<Mutex<Option<String>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned for every query.
    pub fn respond<F>(&self, f: F)
    where
        F: Fn(&str, &[Value]) -> Vec<Row> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Arc::new(f));
    }

    /// Fail any statement whose SQL contains `needle`.
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    /// Delay every query and execute by `d`.
    pub fn delay(&self, d: Duration) {
        *self.delay.lock().unwrap() = Some(d);
    }

    pub fn log(&self) -> Vec<Logged> {
        self.state.lock().unwrap().log.clone()
    }

    /// SQL of every logged statement, control statements included.
    pub fn statements(&self) -> Vec<String> {
        self.log().into_iter().map(|l| l.sql).collect()
    }

    /// Logged statements that were row queries (no BEGIN/COMMIT/...).
    pub fn queries(&self) -> Vec<Logged> {
        self.log()
            .into_iter()
            .filter(|l| !is_control(&l.sql))
            .collect()
    }

    /// Durable writes, in commit order.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn pool(&self, name: &str, capacity: usize) -> MockPool {
        MockPool {
            name: name.to_string(),
            capacity,
            db: self.clone(),
            in_use: Arc::new(AtomicUsize::new(0)),
            next_conn: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
            discarded: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn record(&self, pool: &str, conn: usize, sql: &str, params: &[Value]) -> OrmResult<()> {
        self.state.lock().unwrap().log.push(Logged {
            pool: pool.to_string(),
            conn,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if let Some(needle) = self.fail_on.lock().unwrap().as_deref() {
            if sql.contains(needle) {
                return Err(OrmError::Connection(format!("injected failure on `{sql}`")));
            }
        }
        Ok(())
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

fn is_control(sql: &str) -> bool {
    ["BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE", "SET "]
        .iter()
        .any(|kw| sql.starts_with(kw))
}

/// Column list + value rows helper.
pub(crate) fn rows(columns: &[&str], data: Vec<Vec<Value>>) -> Vec<Row> {
    let cols: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect();
    data.into_iter()
        .map(|values| Row::new(cols.clone(), values))
        .collect()
}

#[derive(Clone)]
pub(crate) struct MockPool {
    name: String,
    capacity: usize,
    db: MockDb,
    in_use: Arc<AtomicUsize>,
    next_conn: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    discarded: Arc<AtomicUsize>,
}

impl MockPool {
    /// Stand-alone pool with its own fake database.
    pub fn named(name: &str, capacity: usize) -> Self {
        MockDb::new().pool(name, capacity)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}

impl Pool for MockPool {
    type Conn = MockConn;

    async fn acquire(&self) -> OrmResult<MockConn> {
        let taken = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if taken.is_err() {
            return Err(OrmError::Timeout(Duration::ZERO));
        }
        Ok(MockConn {
            id: self.next_conn.fetch_add(1, Ordering::SeqCst),
            pool: self.name.clone(),
            db: self.db.clone(),
            in_use: self.in_use.clone(),
            frames: Vec::new(),
        })
    }

    fn release(&self, conn: MockConn) {
        self.released.fetch_add(1, Ordering::SeqCst);
        drop(conn);
    }

    fn discard(&self, conn: MockConn) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        drop(conn);
    }
}

pub(crate) struct MockConn {
    id: usize,
    pool: String,
    db: MockDb,
    in_use: Arc<AtomicUsize>,
    /// Transaction frames: outermost first, each savepoint pushes one.
    frames: Vec<(Option<String>, Vec<String>)>,
}

impl std::fmt::Debug for MockConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConn")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("depth", &self.frames.len())
            .finish()
    }
}

impl Drop for MockConn {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockConn {
    fn apply(&mut self, sql: &str) {
        match self.frames.last_mut() {
            Some((_, writes)) => writes.push(sql.to_string()),
            None => self.db.state.lock().unwrap().journal.push(sql.to_string()),
        }
    }

    fn control(&mut self, sql: &str) -> OrmResult<()> {
        if sql == "BEGIN" {
            if !self.frames.is_empty() {
                return Err(OrmError::transaction("BEGIN inside a transaction"));
            }
            self.frames.push((None, Vec::new()));
        } else if sql == "COMMIT" {
            let writes: Vec<String> = self.frames.drain(..).flat_map(|(_, w)| w).collect();
            self.db.state.lock().unwrap().journal.extend(writes);
        } else if sql == "ROLLBACK" {
            self.frames.clear();
        } else if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            self.frames.push((Some(name.to_string()), Vec::new()));
        } else if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
            let (_, writes) = self.pop_savepoint(name)?;
            if let Some((_, parent)) = self.frames.last_mut() {
                parent.extend(writes);
            }
        } else if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            self.pop_savepoint(name)?;
        }
        Ok(())
    }

    fn pop_savepoint(&mut self, name: &str) -> OrmResult<(Option<String>, Vec<String>)> {
        match self.frames.last() {
            Some((Some(top), _)) if top == name => Ok(self.frames.pop().unwrap_or_default()),
            _ => Err(OrmError::transaction(format!("no savepoint {name}"))),
        }
    }
}

impl Connection for MockConn {
    async fn query(&mut self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        self.db.record(&self.pool, self.id, sql, params)?;
        self.db.pause().await;
        let responder = self.db.responder.lock().unwrap().clone();
        Ok(responder.map(|f| f(sql, params)).unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        self.db.record(&self.pool, self.id, sql, params)?;
        self.db.pause().await;
        self.apply(sql);
        Ok(1)
    }

    async fn batch_execute(&mut self, sql: &str) -> OrmResult<()> {
        self.db.record(&self.pool, self.id, sql, &[])?;
        self.control(sql)
    }
}
