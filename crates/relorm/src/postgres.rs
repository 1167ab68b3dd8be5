//! Postgres backend: `Value` wire conversion, pooled connections and the
//! [`Database::connect`] entry point.
//!
//! Statements arrive with `?` placeholders and are rewritten to `$1, $2, ...`
//! before being prepared (and cached per connection by deadpool).
//!
//! NUMERIC columns decode to exact decimal text and bind from text, ints or
//! floats through `rust_decimal`. Other variants bind only to the column types
//! that share their wire format.
//!
//! ```ignore
//! let db = Database::connect(&DbConfig::from_env()?)?;
//! let mut session = db.session();
//! let users = session.table("users").where_eq("active", true).get(&mut session).await?;
//! ```

use crate::error::{OrmError, OrmResult};
use crate::record::Row;
use crate::value::Value;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::error::Error;
use std::sync::Arc;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, WrongType};
use uuid::Uuid;

type BoxError = Box<dyn Error + Sync + Send>;

fn wrong_type<T>(ty: &Type) -> Result<IsNull, BoxError> {
    Err(Box::new(WrongType::new::<T>(ty.clone())))
}

/// Encode through `T`, refusing columns `T` has no wire format for.
fn checked<T: ToSql>(v: &T, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if !T::accepts(ty) {
        return wrong_type::<T>(ty);
    }
    v.to_sql(ty, out)
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => checked(v, ty, out),
            Value::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::INT8 => v.to_sql(ty, out),
                Type::OID => u32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*v).to_sql(ty, out),
                _ => wrong_type::<i64>(ty),
            },
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => v.to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*v)?.to_sql(ty, out),
                _ => wrong_type::<f64>(ty),
            },
            // NUMERIC values travel as text so they stay exact.
            Value::Text(v) if *ty == Type::NUMERIC => v.trim().parse::<Decimal>()?.to_sql(ty, out),
            Value::Text(v) => checked(v, ty, out),
            Value::Bytes(v) => checked(v, ty, out),
            Value::Json(v) => checked(v, ty, out),
            Value::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.naive_utc().to_sql(ty, out),
                Type::DATE => v.date_naive().to_sql(ty, out),
                _ => checked(v, ty, out),
            },
            Value::Uuid(v) => checked(v, ty, out),
        }
    }

    // NULL binds to any column; the other variants check `ty` in `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

fn get<'a, T: FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
    column: &str,
) -> OrmResult<Option<T>> {
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| OrmError::decode(column, e.to_string()))
}

fn decode_column(row: &tokio_postgres::Row, idx: usize, column: &str, ty: &Type) -> OrmResult<Value> {
    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx, column)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx, column)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx, column)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx, column)?.map(Value::Int),
        Type::OID => get::<u32>(row, idx, column)?.map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx, column)?.map(Value::from),
        Type::FLOAT8 => get::<f64>(row, idx, column)?.map(Value::Float),
        Type::NUMERIC => get::<Decimal>(row, idx, column)?.map(|d| Value::Text(d.to_string())),
        Type::BYTEA => get::<Vec<u8>>(row, idx, column)?.map(Value::Bytes),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx, column)?.map(Value::Json),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx, column)?.map(Value::Timestamp),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx, column)?
            .map(|ts| Value::Timestamp(ts.and_utc())),
        Type::DATE => get::<NaiveDate>(row, idx, column)?.map(|d| Value::Text(d.to_string())),
        Type::UUID => get::<Uuid>(row, idx, column)?.map(Value::Uuid),
        _ => get::<String>(row, idx, column)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Convert driver rows; the column list is shared by every row.
pub(crate) fn convert_rows(rows: &[tokio_postgres::Row], columns: Arc<[String]>) -> OrmResult<Vec<Row>> {
    rows.iter()
        .map(|row| {
            let values = row
                .columns()
                .iter()
                .enumerate()
                .map(|(idx, col)| decode_column(row, idx, col.name(), col.type_()))
                .collect::<OrmResult<Vec<_>>>()?;
            Ok(Row::new(columns.clone(), values))
        })
        .collect()
}

#[cfg(feature = "pool")]
pub use pooled::{PgConnection, PgPool};

#[cfg(feature = "pool")]
mod pooled {
    use super::convert_rows;
    use crate::config::DbConfig;
    use crate::connection::{Connection, Pool, ReplicaSet};
    use crate::dialect::Dialect;
    use crate::error::{OrmError, OrmResult};
    use crate::monitor::Instrumentation;
    use crate::placeholder;
    use crate::record::Row;
    use crate::relation::EntityRegistry;
    use crate::session::Database;
    use crate::value::Value;
    use deadpool_postgres::{Manager, ManagerConfig, Object, PoolError, RecyclingMethod, Runtime};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
    use tokio_postgres::types::ToSql;
    use tokio_postgres::{NoTls, Socket};

    /// A pooled Postgres connection.
    pub struct PgConnection {
        client: Object,
    }

    impl PgConnection {
        fn params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
        }
    }

    impl Connection for PgConnection {
        async fn query(&mut self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
            let numbered = placeholder::to_numbered(sql);
            let stmt = self
                .client
                .prepare_cached(&numbered)
                .await
                .map_err(|e| OrmError::from_db_error(e, sql, params.len()))?;
            let rows = self
                .client
                .query(&stmt, &Self::params(params))
                .await
                .map_err(|e| OrmError::from_db_error(e, sql, params.len()))?;
            let columns: Arc<[String]> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
            convert_rows(&rows, columns)
        }

        async fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<u64> {
            let numbered = placeholder::to_numbered(sql);
            let stmt = self
                .client
                .prepare_cached(&numbered)
                .await
                .map_err(|e| OrmError::from_db_error(e, sql, params.len()))?;
            self.client
                .execute(&stmt, &Self::params(params))
                .await
                .map_err(|e| OrmError::from_db_error(e, sql, params.len()))
        }

        async fn batch_execute(&mut self, sql: &str) -> OrmResult<()> {
            self.client
                .batch_execute(sql)
                .await
                .map_err(|e| OrmError::from_db_error(e, sql, 0))
        }

        fn cancel_token(&self) -> Option<tokio_postgres::CancelToken> {
            Some(self.client.cancel_token())
        }
    }

    /// One deadpool-backed Postgres node.
    #[derive(Clone)]
    pub struct PgPool {
        pool: deadpool_postgres::Pool,
        wait_timeout: Duration,
    }

    impl std::fmt::Debug for PgPool {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let status = self.pool.status();
            f.debug_struct("PgPool")
                .field("max_size", &status.max_size)
                .field("size", &status.size)
                .field("available", &status.available)
                .finish()
        }
    }

    impl PgPool {
        /// Plain-TCP pool. Connections are opened lazily on first use.
        pub fn connect(url: &str, max_size: usize, wait_timeout: Duration) -> OrmResult<Self> {
            Self::connect_with_tls(url, NoTls, max_size, wait_timeout)
        }

        /// Pool using a custom TLS connector.
        pub fn connect_with_tls<T>(
            url: &str,
            tls: T,
            max_size: usize,
            wait_timeout: Duration,
        ) -> OrmResult<Self>
        where
            T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
            T::Stream: Sync + Send,
            T::TlsConnect: Sync + Send,
            <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
        {
            let pg_config: tokio_postgres::Config = url
                .parse()
                .map_err(|e: tokio_postgres::Error| OrmError::Config(format!("invalid database url: {e}")))?;
            let manager = Manager::from_config(
                pg_config,
                tls,
                ManagerConfig {
                    recycling_method: RecyclingMethod::Fast,
                },
            );
            let pool = deadpool_postgres::Pool::builder(manager)
                .max_size(max_size)
                .runtime(Runtime::Tokio1)
                .wait_timeout(Some(wait_timeout))
                .build()
                .map_err(|e| OrmError::Config(e.to_string()))?;
            Ok(Self { pool, wait_timeout })
        }

        pub fn inner(&self) -> &deadpool_postgres::Pool {
            &self.pool
        }
    }

    impl Pool for PgPool {
        type Conn = PgConnection;

        async fn acquire(&self) -> OrmResult<PgConnection> {
            match self.pool.get().await {
                Ok(client) => Ok(PgConnection { client }),
                Err(PoolError::Timeout(_)) => Err(OrmError::Timeout(self.wait_timeout)),
                Err(e) => Err(e.into()),
            }
        }

        fn discard(&self, conn: PgConnection) {
            drop(Object::take(conn.client));
        }
    }

    impl Database<PgPool> {
        /// Build master and slave pools from `config`. No connection is opened yet.
        pub fn connect(config: &DbConfig) -> OrmResult<Self> {
            config.validate()?;
            let dialect = config.resolve_dialect()?;
            if dialect != Dialect::POSTGRES {
                return Err(OrmError::Config(format!(
                    "the postgres backend cannot run `{}` dialect statements",
                    dialect.name
                )));
            }
            let open = |urls: &[String]| -> OrmResult<Vec<PgPool>> {
                urls.iter()
                    .map(|url| PgPool::connect(url, config.max_pool_size, config.acquire_timeout))
                    .collect()
            };
            let set = ReplicaSet::new(open(&config.master_urls)?)
                .with_slaves(open(&config.slave_urls)?);

            tracing::debug!(
                target: "relorm.pool",
                masters = config.master_urls.len(),
                slaves = config.slave_urls.len(),
                max_pool_size = config.max_pool_size,
                "database pools configured"
            );

            Ok(Database::builder(config.configure(set))
                .dialect(dialect)
                .registry(EntityRegistry::from_inventory())
                .instrumentation(Instrumentation::new().with_config(config.monitor_config()))
                .build())
        }
    }
}
