//! # relorm
//!
//! A fluent SQL builder with batched relation loading and master/slave
//! transaction routing.
//!
//! ## Features
//!
//! - **Fluent builder**: clauses accumulate in a [`Grammar`] and render to one
//!   parameterized statement with `?` placeholders
//! - **Soft deletes**: entities with a deletion timestamp hide trashed rows by default
//! - **Eager loading**: `with("posts.comments")` costs one query per relation path
//! - **Replica routing**: reads go to slaves, writes and everything inside a
//!   transaction go to the transaction's master connection
//! - **Nested transactions**: savepoints plus post-commit callbacks
//! - **Query monitoring**: timing, logging, statistics and SQL hooks
//!
//! ## Example
//!
//! ```ignore
//! use relorm::prelude::*;
//!
//! let db = Database::connect(&DbConfig::from_env()?)?;
//! let mut session = db.session();
//!
//! let page = session
//!     .model("User")?
//!     .where_eq("active", true)
//!     .with("posts.comments")
//!     .order_by_desc("created_at")
//!     .paginate(&mut session, 1, 20)
//!     .await?;
//!
//! relorm::transaction!(session, {
//!     session.table("audit").value("event", "listed users").insert(&mut session).await?;
//!     Ok(())
//! })?;
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod grammar;
pub mod monitor;
pub mod placeholder;
pub mod postgres;
pub mod prelude;
pub mod record;
pub mod relation;
pub mod session;
pub mod value;

#[cfg(test)]
mod testing;

pub use builder::{Builder, Page};
pub use cache::TableCache;
pub use config::{DbConfig, Selection};
pub use connection::{
    Connection, ConnectionHandle, FirstAvailable, Pool, ReplicaSet, Role, RoundRobin,
    SelectionPolicy, Tier,
};
pub use dialect::Dialect;
pub use error::{OrmError, OrmResult};
pub use grammar::{Boolean, ClauseKind, Fragment, Grammar, Statement, StatementKind};
pub use monitor::{
    CompositeHook, CompositeMonitor, HookAction, Instrumentation, LoggingMonitor, MonitorConfig,
    NoopMonitor, QueryContext, QueryHook, QueryMonitor, QueryResult, QueryStats, QueryType,
    StatsMonitor, TracingSqlHook,
};
pub use record::{FromRecord, Record, RecordList, Related, Row};
pub use relation::{
    Arity, EagerLoad, EntityMeta, EntityRegistration, EntityRegistry, RelationDecl, RelationScope,
};
pub use session::{Database, DatabaseBuilder, Lease, Session};
pub use value::{FromValue, Value};

#[cfg(feature = "pool")]
pub use postgres::{PgConnection, PgPool};

// Re-export inventory for `inventory::submit!` entity registrations
pub use inventory;

// NUMERIC values are read and bound through `rust_decimal`
pub use rust_decimal::Decimal;
