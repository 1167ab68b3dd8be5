//! Convenient imports for typical `relorm` usage.
//!
//! ```ignore
//! use relorm::prelude::*;
//! ```

pub use crate::{
    Builder, Database, DbConfig, EntityMeta, EntityRegistry, FromRecord, FromValue, OrmError,
    OrmResult, Record, RecordList, Session, Value,
};

#[cfg(feature = "pool")]
pub use crate::PgPool;
