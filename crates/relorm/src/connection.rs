//! Connection and pool abstractions, plus master/slave routing.
//!
//! [`Connection`] and [`Pool`] are the seams to a physical driver; the
//! Postgres implementation lives in [`crate::postgres`]. A [`ReplicaSet`] holds
//! the master (write) and slave (read) pools and picks one per acquisition
//! through a [`SelectionPolicy`].

use crate::error::{OrmError, OrmResult};
use crate::record::Row;
use crate::value::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which side of the replica set a connection is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Read,
    Write,
}

impl Role {
    pub fn for_write(needs_write: bool) -> Self {
        if needs_write { Role::Write } else { Role::Read }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Read => "read",
            Role::Write => "write",
        })
    }
}

/// A physical database connection.
///
/// SQL uses `?` placeholders; implementations rewrite them for their driver.
pub trait Connection: Send {
    /// Run a statement and return all rows.
    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = OrmResult<Vec<Row>>> + Send;

    /// Run a statement and return the affected row count.
    fn execute(&mut self, sql: &str, params: &[Value]) -> impl Future<Output = OrmResult<u64>> + Send;

    /// Run parameterless control SQL (`BEGIN`, `SAVEPOINT x`, ...).
    fn batch_execute(&mut self, sql: &str) -> impl Future<Output = OrmResult<()>> + Send;

    /// Token for best-effort server-side cancellation of an in-flight statement.
    fn cancel_token(&self) -> Option<tokio_postgres::CancelToken> {
        None
    }
}

/// A pool of physical connections for one database node.
///
/// Dropping a connection must hand it back to its pool (as deadpool objects
/// do), so a cancelled or timed-out statement never leaks one.
pub trait Pool: Send + Sync + 'static {
    type Conn: Connection;

    /// Take a connection from the pool.
    fn acquire(&self) -> impl Future<Output = OrmResult<Self::Conn>> + Send;

    /// Return a healthy connection to the pool.
    fn release(&self, conn: Self::Conn) {
        drop(conn);
    }

    /// Drop a connection that must not be reused (e.g. abandoned mid-transaction).
    fn discard(&self, conn: Self::Conn) {
        drop(conn);
    }
}

/// Pool tier a connection was drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Master,
    Slave,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An acquired connection plus routing bookkeeping. Identity is `id`.
#[derive(Debug)]
pub struct ConnectionHandle<C> {
    id: u64,
    role: Role,
    tier: Tier,
    pool_index: usize,
    pub(crate) in_transaction: bool,
    pub(crate) conn: C,
}

impl<C> ConnectionHandle<C> {
    pub(crate) fn new(role: Role, tier: Tier, pool_index: usize, conn: C) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            role,
            tier,
            pool_index,
            in_transaction: false,
            conn,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Role the handle was requested for.
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Index of the origin pool within its tier.
    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Chooses the order in which the pools of one tier are tried.
pub trait SelectionPolicy: Send + Sync {
    /// Pool indices to try, best first. `pool_count` is never zero.
    fn order(&self, pool_count: usize) -> Vec<usize>;
}

/// Rotates the starting pool on every acquisition.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn order(&self, pool_count: usize) -> Vec<usize> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % pool_count;
        (0..pool_count).map(|i| (start + i) % pool_count).collect()
    }
}

/// Always tries pools in declaration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl SelectionPolicy for FirstAvailable {
    fn order(&self, pool_count: usize) -> Vec<usize> {
        (0..pool_count).collect()
    }
}

/// Master (write) and slave (read) pools with a selection policy.
pub struct ReplicaSet<P: Pool> {
    masters: Vec<P>,
    slaves: Vec<P>,
    policy: Arc<dyn SelectionPolicy>,
    acquire_timeout: Duration,
}

impl<P: Pool> ReplicaSet<P> {
    /// Default bound on waiting for a free connection.
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(masters: Vec<P>) -> Self {
        Self {
            masters,
            slaves: Vec::new(),
            policy: Arc::new(RoundRobin::new()),
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_slaves(mut self, slaves: Vec<P>) -> Self {
        self.slaves = slaves;
        self
    }

    pub fn with_policy<S: SelectionPolicy + 'static>(mut self, policy: S) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn masters(&self) -> &[P] {
        &self.masters
    }

    pub fn slaves(&self) -> &[P] {
        &self.slaves
    }

    /// Tier serving a role. Reads use the masters only when no slave is configured.
    fn tier_for(&self, role: Role) -> Tier {
        match role {
            Role::Read if !self.slaves.is_empty() => Tier::Slave,
            _ => Tier::Master,
        }
    }

    fn pools(&self, tier: Tier) -> &[P] {
        match tier {
            Tier::Master => &self.masters,
            Tier::Slave => &self.slaves,
        }
    }

    /// Acquire a connection for `role`, waiting at most the acquire timeout.
    ///
    /// Exhaustion of the selected tier is reported as
    /// [`OrmError::PoolExhausted`]; the other tier is never tried instead.
    pub async fn acquire(&self, role: Role) -> OrmResult<ConnectionHandle<P::Conn>> {
        let tier = self.tier_for(role);
        let pools = self.pools(tier);
        if pools.is_empty() {
            return Err(OrmError::Config(format!("no {tier:?} pool configured")));
        }

        let started = Instant::now();
        let order = self.policy.order(pools.len());
        let attempt = async {
            let mut last_err = None;
            for idx in order {
                match pools[idx].acquire().await {
                    Ok(conn) => return Ok((idx, conn)),
                    Err(err) => {
                        tracing::debug!(
                            target: "relorm.pool",
                            %role,
                            pool = idx,
                            error = %err,
                            "pool acquisition failed, trying next"
                        );
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err)
        };

        match tokio::time::timeout(self.acquire_timeout, attempt).await {
            Ok(Ok((idx, conn))) => Ok(ConnectionHandle::new(role, tier, idx, conn)),
            Ok(Err(Some(err))) if !err.is_retryable() => Err(err),
            Ok(Err(_)) | Err(_) => Err(OrmError::PoolExhausted {
                role,
                waited: started.elapsed(),
            }),
        }
    }

    /// Return a handle's connection to its origin pool.
    pub fn release(&self, handle: ConnectionHandle<P::Conn>) {
        match self.pools(handle.tier).get(handle.pool_index) {
            Some(pool) => pool.release(handle.conn),
            None => drop(handle.conn),
        }
    }

    /// Drop a handle's connection without returning it for reuse.
    pub fn discard(&self, handle: ConnectionHandle<P::Conn>) {
        match self.pools(handle.tier).get(handle.pool_index) {
            Some(pool) => pool.discard(handle.conn),
            None => drop(handle.conn),
        }
    }
}

impl<P: Pool> fmt::Debug for ReplicaSet<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("masters", &self.masters.len())
            .field("slaves", &self.slaves.len())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPool;

    #[test]
    fn round_robin_rotates_start() {
        let rr = RoundRobin::new();
        assert_eq!(rr.order(3), vec![0, 1, 2]);
        assert_eq!(rr.order(3), vec![1, 2, 0]);
        assert_eq!(rr.order(3), vec![2, 0, 1]);
        assert_eq!(rr.order(3), vec![0, 1, 2]);
        assert_eq!(FirstAvailable.order(2), vec![0, 1]);
    }

    #[tokio::test]
    async fn writes_never_come_from_slaves() {
        let set = ReplicaSet::new(vec![MockPool::named("m0", 2)])
            .with_slaves(vec![MockPool::named("s0", 2), MockPool::named("s1", 2)]);

        for _ in 0..4 {
            let h = set.acquire(Role::Write).await.unwrap();
            assert_eq!(h.tier(), Tier::Master);
            set.release(h);
        }
        let r = set.acquire(Role::Read).await.unwrap();
        assert_eq!(r.tier(), Tier::Slave);
        set.release(r);
    }

    #[tokio::test]
    async fn reads_use_master_without_slaves() {
        let set = ReplicaSet::new(vec![MockPool::named("m0", 1)]);
        let h = set.acquire(Role::Read).await.unwrap();
        assert_eq!(h.tier(), Tier::Master);
        assert_eq!(h.role(), Role::Read);
    }

    #[tokio::test]
    async fn exhausted_slaves_do_not_fall_back_to_master() {
        let set = ReplicaSet::new(vec![MockPool::named("m0", 4)])
            .with_slaves(vec![MockPool::named("s0", 1)])
            .with_acquire_timeout(Duration::from_millis(20));

        let held = set.acquire(Role::Read).await.unwrap();
        let err = set.acquire(Role::Read).await.unwrap_err();
        assert!(matches!(err, OrmError::PoolExhausted { role: Role::Read, .. }));
        assert!(err.is_retryable());

        set.release(held);
        let again = set.acquire(Role::Read).await.unwrap();
        assert_eq!(again.tier(), Tier::Slave);
    }

    #[tokio::test]
    async fn first_available_skips_full_pool() {
        let set = ReplicaSet::new(vec![MockPool::named("m0", 1), MockPool::named("m1", 1)])
            .with_policy(FirstAvailable);

        let a = set.acquire(Role::Write).await.unwrap();
        let b = set.acquire(Role::Write).await.unwrap();
        assert_eq!(a.pool_index(), 0);
        assert_eq!(b.pool_index(), 1);
        assert_ne!(a.id(), b.id());
    }
}
