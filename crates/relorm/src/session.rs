//! Per-task transaction context and statement routing.
//!
//! A [`Database`] is the shared, cloneable entry point: replica set, entity
//! registry, dialect, instrumentation and table cache. Each task opens its own
//! [`Session`], which owns the transaction state (bound connection, savepoint
//! stack, post-commit callbacks). Sessions are never shared, so transaction
//! bookkeeping needs no locking.
//!
//! ```ignore
//! let db = Database::builder(ReplicaSet::new(vec![master]).with_slaves(vec![replica]))
//!     .registry(EntityRegistry::from_inventory())
//!     .build();
//! let mut session = db.session();
//!
//! relorm::transaction!(session, {
//!     session.table("accounts").where_eq("id", 1).value("balance", 90).update(&mut session).await?;
//!     session.add_event(|| tracing::info!("balance updated"));
//!     Ok(())
//! })?;
//! ```

use crate::builder::Builder;
use crate::cache::TableCache;
use crate::connection::{Connection, ConnectionHandle, Pool, ReplicaSet, Role};
use crate::dialect::Dialect;
use crate::error::{OrmError, OrmResult};
use crate::grammar::{Statement, StatementKind};
use crate::monitor::{Instrumentation, QueryContext, QueryResult, QueryType};
use crate::record::{RecordList, Row};
use crate::relation::{self, EagerLoad, EntityRegistry};
use crate::value::Value;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Runs the block inside a transaction on `$session`.
///
/// - `begin()` (a savepoint when already inside a transaction)
/// - `commit()` on `Ok(_)`
/// - `roll_back()` on `Err(_)`
///
/// The block must evaluate to `relorm::OrmResult<T>`.
#[macro_export]
macro_rules! transaction {
    ($session:ident, $body:block) => {{
        $session.begin().await?;
        let __relorm_tx_result = async {
            let __relorm_out: $crate::OrmResult<_> = $body;
            __relorm_out
        }
        .await;
        match __relorm_tx_result {
            Ok(value) => {
                $session.commit().await?;
                Ok(value)
            }
            Err(error) => match $session.roll_back().await {
                Ok(()) => Err(error),
                Err(rollback_err) => Err($crate::OrmError::transaction(format!(
                    "{error} (rollback failed: {rollback_err})"
                ))),
            },
        }
    }};
}

struct Shared<P: Pool> {
    pools: ReplicaSet<P>,
    registry: EntityRegistry,
    dialect: Dialect,
    instrumentation: Instrumentation,
    cache: TableCache,
}

/// Shared database handle. Cheap to clone.
pub struct Database<P: Pool> {
    inner: Arc<Shared<P>>,
}

impl<P: Pool> Clone for Database<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Pool> fmt::Debug for Database<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("pools", &self.inner.pools)
            .field("dialect", &self.inner.dialect)
            .field("entities", &self.inner.registry.len())
            .finish()
    }
}

/// Builder for [`Database`].
pub struct DatabaseBuilder<P: Pool> {
    pools: ReplicaSet<P>,
    registry: EntityRegistry,
    dialect: Dialect,
    instrumentation: Instrumentation,
}

impl<P: Pool> DatabaseBuilder<P> {
    pub fn registry(mut self, registry: EntityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    pub fn build(self) -> Database<P> {
        Database {
            inner: Arc::new(Shared {
                pools: self.pools,
                registry: self.registry,
                dialect: self.dialect,
                instrumentation: self.instrumentation,
                cache: TableCache::new(),
            }),
        }
    }
}

impl<P: Pool> Database<P> {
    pub fn builder(pools: ReplicaSet<P>) -> DatabaseBuilder<P> {
        DatabaseBuilder {
            pools,
            registry: EntityRegistry::new(),
            dialect: Dialect::default(),
            instrumentation: Instrumentation::default(),
        }
    }

    /// New session with no active transaction.
    pub fn session(&self) -> Session<P> {
        Session {
            db: self.clone(),
            tx: None,
        }
    }

    pub fn pools(&self) -> &ReplicaSet<P> {
        &self.inner.pools
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.inner.instrumentation
    }

    pub fn cache(&self) -> &TableCache {
        &self.inner.cache
    }
}

type Callback = Box<dyn FnOnce() + Send>;

struct TxState<C> {
    handle: ConnectionHandle<C>,
    savepoints: Vec<String>,
    callbacks: Vec<Callback>,
}

/// A connection borrowed for one statement.
///
/// Inside a transaction it is the transaction-bound handle; otherwise it owns
/// a pooled connection that goes back to its pool when the lease is dropped.
pub enum Lease<'a, C> {
    Bound(&'a mut ConnectionHandle<C>),
    Owned(ConnectionHandle<C>),
}

impl<C> Deref for Lease<'_, C> {
    type Target = ConnectionHandle<C>;

    fn deref(&self) -> &Self::Target {
        match self {
            Lease::Bound(handle) => handle,
            Lease::Owned(handle) => handle,
        }
    }
}

impl<C> DerefMut for Lease<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Lease::Bound(handle) => handle,
            Lease::Owned(handle) => handle,
        }
    }
}

/// One task's view of the database: transaction state plus routing.
pub struct Session<P: Pool> {
    db: Database<P>,
    tx: Option<TxState<P::Conn>>,
}

impl<P: Pool> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("depth", &self.depth())
            .field("connection", &self.tx.as_ref().map(|t| t.handle.id()))
            .finish()
    }
}

impl<P: Pool> Session<P> {
    pub fn database(&self) -> &Database<P> {
        &self.db
    }

    pub fn dialect(&self) -> Dialect {
        self.db.dialect()
    }

    pub fn registry(&self) -> &EntityRegistry {
        self.db.registry()
    }

    /// Builder over a plain table.
    pub fn table(&self, name: &str) -> Builder {
        Builder::new(self.dialect()).from(name)
    }

    /// Builder over a registered entity.
    pub fn model(&self, entity: &str) -> OrmResult<Builder> {
        let meta = self.registry().get(entity)?;
        Ok(Builder::for_entity(meta, self.dialect()))
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// 0 outside a transaction, 1 in the outer transaction, +1 per savepoint.
    pub fn depth(&self) -> usize {
        self.tx.as_ref().map_or(0, |t| 1 + t.savepoints.len())
    }

    /// Id of the transaction-bound connection, if any.
    pub fn transaction_connection_id(&self) -> Option<u64> {
        self.tx.as_ref().map(|t| t.handle.id())
    }

    async fn control(handle: &mut ConnectionHandle<P::Conn>, sql: &str) -> OrmResult<()> {
        tracing::debug!(target: "relorm.tx", connection = handle.id(), sql, "transaction control");
        handle.conn.batch_execute(sql).await
    }

    /// Open a transaction, or a savepoint when one is already active.
    pub async fn begin(&mut self) -> OrmResult<()> {
        if let Some(state) = self.tx.as_mut() {
            let name = format!("relorm_sp_{}", state.savepoints.len() + 1);
            Self::control(&mut state.handle, &format!("SAVEPOINT {name}")).await?;
            state.savepoints.push(name);
            return Ok(());
        }

        let pools = self.db.pools();
        let mut handle = pools.acquire(Role::Write).await?;
        if let Err(err) = Self::control(&mut handle, "BEGIN").await {
            pools.discard(handle);
            return Err(err);
        }
        handle.in_transaction = true;
        self.tx = Some(TxState {
            handle,
            savepoints: Vec::new(),
            callbacks: Vec::new(),
        });
        Ok(())
    }

    /// Commit the innermost level.
    ///
    /// A savepoint is released and callbacks stay queued. The outermost level
    /// commits, returns the connection, then runs callbacks in FIFO order.
    pub async fn commit(&mut self) -> OrmResult<()> {
        let Some(mut state) = self.tx.take() else {
            return Err(OrmError::transaction("commit without an active transaction"));
        };

        if let Some(name) = state.savepoints.pop() {
            let result = Self::control(&mut state.handle, &format!("RELEASE SAVEPOINT {name}")).await;
            if result.is_err() {
                state.savepoints.push(name);
            }
            self.tx = Some(state);
            return result;
        }

        let pools = self.db.pools();
        if let Err(err) = Self::control(&mut state.handle, "COMMIT").await {
            pools.discard(state.handle);
            return Err(err);
        }
        state.handle.in_transaction = false;
        pools.release(state.handle);

        for callback in state.callbacks {
            callback();
        }
        Ok(())
    }

    /// Roll back the innermost level.
    ///
    /// A savepoint is rolled back to and popped; the outer transaction and its
    /// callbacks are kept. The outermost level rolls back, returns the
    /// connection and discards queued callbacks.
    pub async fn roll_back(&mut self) -> OrmResult<()> {
        let Some(mut state) = self.tx.take() else {
            return Err(OrmError::transaction("rollback without an active transaction"));
        };

        if let Some(name) = state.savepoints.pop() {
            let result =
                Self::control(&mut state.handle, &format!("ROLLBACK TO SAVEPOINT {name}")).await;
            if result.is_err() {
                state.savepoints.push(name);
            }
            self.tx = Some(state);
            return result;
        }

        let pools = self.db.pools();
        if !state.callbacks.is_empty() {
            tracing::debug!(
                target: "relorm.tx",
                discarded = state.callbacks.len(),
                "rollback discards post-commit callbacks"
            );
        }
        match Self::control(&mut state.handle, "ROLLBACK").await {
            Ok(()) => {
                state.handle.in_transaction = false;
                pools.release(state.handle);
                Ok(())
            }
            Err(err) => {
                pools.discard(state.handle);
                Err(err)
            }
        }
    }

    /// Run `callback` after the outermost commit, or now when no transaction is active.
    pub fn add_event<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.as_mut() {
            Some(state) => state.callbacks.push(Box::new(callback)),
            None => callback(),
        }
    }

    async fn lease<'a>(
        db: &'a Database<P>,
        tx: &'a mut Option<TxState<P::Conn>>,
        needs_write: bool,
    ) -> OrmResult<Lease<'a, P::Conn>> {
        match tx {
            Some(state) => Ok(Lease::Bound(&mut state.handle)),
            None => {
                let handle = db.pools().acquire(Role::for_write(needs_write)).await?;
                Ok(Lease::Owned(handle))
            }
        }
    }

    /// Connection for the next statement.
    ///
    /// Inside a transaction this is always the transaction-bound handle, so
    /// reads see the transaction's own writes.
    pub async fn connection(&mut self, needs_write: bool) -> OrmResult<Lease<'_, P::Conn>> {
        let Session { db, tx } = self;
        Self::lease(db, tx, needs_write).await
    }

    fn context(stmt: &Statement, lease: &Lease<'_, P::Conn>, needs_write: bool) -> QueryContext {
        let mut ctx = QueryContext::new(&stmt.sql, stmt.params.len())
            .with_query_type(stmt.kind.into())
            .with_role(Role::for_write(needs_write));
        ctx.in_transaction = lease.in_transaction();
        ctx
    }

    /// Run a statement and return its rows.
    ///
    /// Failures inside a transaction leave it open; rolling back is the caller's call.
    pub async fn fetch(&mut self, stmt: &Statement) -> OrmResult<Vec<Row>> {
        stmt.check_parity()?;
        let needs_write = stmt.needs_write();
        let Session { db, tx } = self;
        let instrumentation = db.instrumentation();
        let mut lease = Self::lease(db, tx, needs_write).await?;

        let mut ctx = Self::context(stmt, &lease, needs_write);
        instrumentation.apply_hook(&mut ctx)?;
        let cancel = lease.conn.cancel_token();
        let timer = instrumentation.start(ctx);
        let result = instrumentation
            .with_timeout(cancel, lease.conn.query(&timer.ctx().exec_sql, &stmt.params))
            .await;
        timer.finish(&result, |rows| QueryResult::Rows(rows.len()));
        result
    }

    /// Run a statement and return the affected row count.
    pub async fn execute(&mut self, stmt: &Statement) -> OrmResult<u64> {
        stmt.check_parity()?;
        let needs_write = stmt.needs_write();
        let Session { db, tx } = self;
        let instrumentation = db.instrumentation();
        let mut lease = Self::lease(db, tx, needs_write).await?;

        let mut ctx = Self::context(stmt, &lease, needs_write);
        instrumentation.apply_hook(&mut ctx)?;
        let cancel = lease.conn.cancel_token();
        let timer = instrumentation.start(ctx);
        let result = instrumentation
            .with_timeout(cancel, lease.conn.execute(&timer.ctx().exec_sql, &stmt.params))
            .await;
        timer.finish(&result, |n| QueryResult::Affected(*n));
        result
    }

    /// Raw read with `?` placeholders, routed to a read connection.
    pub async fn fetch_raw(&mut self, sql: &str, params: Vec<Value>) -> OrmResult<Vec<Row>> {
        self.fetch(&Statement::new(StatementKind::Select, sql, params))
            .await
    }

    /// Raw write with `?` placeholders, routed to a write connection.
    pub async fn execute_raw(&mut self, sql: &str, params: Vec<Value>) -> OrmResult<u64> {
        let kind = match QueryType::from_sql(sql) {
            QueryType::Insert => StatementKind::Insert,
            QueryType::Delete => StatementKind::Delete,
            _ => StatementKind::Update,
        };
        self.execute(&Statement::new(kind, sql, params)).await
    }

    /// Column names of `table`, read once from `information_schema` and cached.
    pub async fn columns(&mut self, table: &str) -> OrmResult<Arc<[String]>> {
        if let Some(cols) = self.db.cache().get(table) {
            return Ok(cols);
        }
        let rows = self
            .fetch_raw(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_name = ? ORDER BY ordinal_position",
                vec![Value::from(table)],
            )
            .await?;
        let columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get_index(0).and_then(Value::as_str).map(str::to_string))
            .collect();
        if columns.is_empty() {
            return Err(OrmError::not_found(format!("table `{table}` has no columns")));
        }
        Ok(self.db.cache().insert(table, columns))
    }

    /// Eager-load relation paths onto an already fetched record list.
    pub async fn load(&mut self, list: &mut RecordList, paths: &[&str]) -> OrmResult<()> {
        if list.is_empty() || paths.is_empty() {
            return Ok(());
        }
        let entity = list
            .entity()
            .ok_or_else(|| OrmError::relation(paths[0], "record list is not bound to an entity"))?;
        let meta = self.registry().get(entity)?;
        let loads: Vec<EagerLoad> = paths.iter().map(|p| EagerLoad::new(p, None)).collect();
        relation::eager_load(self, &meta, list, &loads).await
    }
}

impl<P: Pool> Drop for Session<P> {
    fn drop(&mut self) {
        if let Some(state) = self.tx.take() {
            tracing::warn!(
                target: "relorm.tx",
                connection = state.handle.id(),
                depth = 1 + state.savepoints.len(),
                "session dropped inside a transaction; discarding connection"
            );
            self.db.pools().discard(state.handle);
        }
    }
}

#[cfg(test)]
mod tests;
