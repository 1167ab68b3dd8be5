//! Statement monitoring and hooks.
//!
//! Every statement a [`Session`](crate::Session) runs passes through an
//! [`Instrumentation`]: hooks may inspect, rewrite or abort it, a scoped timer
//! measures it, and monitors receive the outcome when monitoring is enabled.
//!
//! ```ignore
//! use relorm::monitor::{Instrumentation, LoggingMonitor, MonitorConfig, TracingSqlHook};
//! use std::time::Duration;
//!
//! let instrumentation = Instrumentation::new()
//!     .with_config(
//!         MonitorConfig::new()
//!             .with_statement_timeout(Duration::from_secs(30))
//!             .with_slow_query_threshold(Duration::from_millis(500))
//!             .enable_monitoring(),
//!     )
//!     .with_monitor(LoggingMonitor::new())
//!     .add_hook(TracingSqlHook::new());
//! ```

mod config;
mod instrument;
mod monitors;
mod tracing_hook;
mod types;

#[cfg(test)]
mod tests;

pub use config::MonitorConfig;
pub use instrument::Instrumentation;
pub use monitors::{
    CompositeHook, CompositeMonitor, LoggingMonitor, NoopMonitor, QueryStats, StatsMonitor,
};
pub use tracing_hook::TracingSqlHook;
pub use types::{HookAction, QueryContext, QueryHook, QueryMonitor, QueryResult, QueryType};

pub(crate) fn truncate_sql_bytes(sql: &str, max_bytes: usize) -> &str {
    if sql.len() <= max_bytes {
        return sql;
    }
    let mut end = max_bytes;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}
