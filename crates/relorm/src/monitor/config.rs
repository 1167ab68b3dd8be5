use std::time::Duration;

/// Statement timeout and monitoring switches.
///
/// Monitoring is off by default; the timeout applies either way.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Per-statement timeout. `None` waits indefinitely.
    pub statement_timeout: Option<Duration>,
    /// Statements slower than this also trigger `on_slow_query`.
    pub slow_query_threshold: Option<Duration>,
    pub monitoring_enabled: bool,
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort statements running longer than `timeout` with [`OrmError::Timeout`](crate::OrmError::Timeout).
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }

    pub fn enable_monitoring(mut self) -> Self {
        self.monitoring_enabled = true;
        self
    }

    pub fn disable_monitoring(mut self) -> Self {
        self.monitoring_enabled = false;
        self
    }
}
