use super::config::MonitorConfig;
use super::monitors::{CompositeHook, NoopMonitor};
use super::types::{HookAction, QueryContext, QueryHook, QueryMonitor, QueryResult};
use crate::error::{OrmError, OrmResult};
use crate::placeholder;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monitor, hook and timeout settings applied around every statement.
#[derive(Clone)]
pub struct Instrumentation {
    monitor: Arc<dyn QueryMonitor>,
    hook: Option<Arc<dyn QueryHook>>,
    config: MonitorConfig,
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self {
            monitor: Arc::new(NoopMonitor),
            hook: None,
            config: MonitorConfig::default(),
        }
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("hook", &self.hook.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_monitor<M: QueryMonitor + 'static>(mut self, monitor: M) -> Self {
        self.monitor = Arc::new(monitor);
        self
    }

    pub fn with_monitor_arc(mut self, monitor: Arc<dyn QueryMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Add a hook; an existing hook runs first.
    pub fn add_hook<H: QueryHook + 'static>(self, hook: H) -> Self {
        self.add_hook_arc(Arc::new(hook))
    }

    pub fn add_hook_arc(mut self, hook: Arc<dyn QueryHook>) -> Self {
        self.hook = Some(match self.hook.take() {
            None => hook,
            Some(existing) => Arc::new(CompositeHook::new().add_arc(existing).add_arc(hook)),
        });
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run the hook chain; a rewrite must keep the placeholder count.
    pub(crate) fn apply_hook(&self, ctx: &mut QueryContext) -> OrmResult<()> {
        let Some(hook) = &self.hook else {
            return Ok(());
        };
        match hook.before_query(ctx) {
            HookAction::Continue => Ok(()),
            HookAction::ModifySql(sql) => {
                let placeholders = placeholder::count(&sql);
                if placeholders != ctx.param_count {
                    return Err(OrmError::PlaceholderMismatch {
                        sql,
                        placeholders,
                        params: ctx.param_count,
                    });
                }
                ctx.exec_sql = sql;
                Ok(())
            }
            HookAction::Abort(reason) => Err(OrmError::validation(format!(
                "statement aborted by hook: {reason}"
            ))),
        }
    }

    /// Start the scoped timer for one statement.
    pub(crate) fn start(&self, ctx: QueryContext) -> QueryTimer<'_> {
        if self.config.monitoring_enabled {
            self.monitor.on_query_start(&ctx);
        }
        QueryTimer {
            instrumentation: self,
            ctx,
            started: Instant::now(),
            finished: false,
        }
    }

    fn report(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult) {
        if !self.config.monitoring_enabled {
            return;
        }
        if let Some(hook) = &self.hook {
            hook.after_query(ctx, duration, result);
        }
        self.monitor.on_query_complete(ctx, duration, result);
        if self
            .config
            .slow_query_threshold
            .is_some_and(|threshold| duration > threshold)
        {
            self.monitor.on_slow_query(ctx, duration);
        }
    }

    /// Await `future` under the statement timeout, requesting server-side
    /// cancellation when it fires.
    pub(crate) async fn with_timeout<T, F>(
        &self,
        cancel: Option<tokio_postgres::CancelToken>,
        future: F,
    ) -> OrmResult<T>
    where
        F: Future<Output = OrmResult<T>> + Send,
    {
        let Some(timeout) = self.config.statement_timeout else {
            return future.await;
        };
        tokio::pin!(future);
        tokio::select! {
            result = &mut future => result,
            _ = tokio::time::sleep(timeout) => {
                if let Some(token) = cancel {
                    tokio::spawn(async move {
                        let _ = token.cancel_query(tokio_postgres::NoTls).await;
                    });
                }
                Err(OrmError::Timeout(timeout))
            }
        }
    }
}

/// Times one statement; reports on [`finish`](Self::finish), or as cancelled if dropped first.
pub(crate) struct QueryTimer<'a> {
    instrumentation: &'a Instrumentation,
    ctx: QueryContext,
    started: Instant,
    finished: bool,
}

impl QueryTimer<'_> {
    pub(crate) fn ctx(&self) -> &QueryContext {
        &self.ctx
    }

    pub(crate) fn finish<T>(mut self, result: &OrmResult<T>, outcome: impl FnOnce(&T) -> QueryResult) {
        let query_result = match result {
            Ok(value) => outcome(value),
            Err(OrmError::Timeout(d)) => QueryResult::Error(format!("timeout after {d:?}")),
            Err(e) => QueryResult::error(e.to_string()),
        };
        self.finished = true;
        self.instrumentation
            .report(&self.ctx, self.started.elapsed(), &query_result);
    }
}

impl Drop for QueryTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.instrumentation.report(
                &self.ctx,
                self.started.elapsed(),
                &QueryResult::Error("cancelled".to_string()),
            );
        }
    }
}
