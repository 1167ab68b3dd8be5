use crate::connection::Role;
use crate::grammar::StatementKind;
use std::fmt;
use std::time::Duration;

/// The type of SQL operation being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    /// Transaction control and other raw SQL.
    Other,
}

impl QueryType {
    /// Detect query type from the leading keyword.
    pub fn from_sql(sql: &str) -> Self {
        let head = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match head.as_str() {
            "SELECT" | "WITH" => QueryType::Select,
            "INSERT" => QueryType::Insert,
            "UPDATE" => QueryType::Update,
            "DELETE" => QueryType::Delete,
            _ => QueryType::Other,
        }
    }
}

impl From<StatementKind> for QueryType {
    fn from(kind: StatementKind) -> Self {
        match kind {
            StatementKind::Select => QueryType::Select,
            StatementKind::Insert => QueryType::Insert,
            StatementKind::Update => QueryType::Update,
            StatementKind::Delete => QueryType::Delete,
        }
    }
}

/// Context information about the statement being executed.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// SQL as rendered by the grammar (`?` placeholders).
    pub sql: String,
    /// SQL sent to the connection; hooks may rewrite it.
    pub exec_sql: String,
    pub param_count: usize,
    pub query_type: QueryType,
    /// Role the connection was requested for.
    pub role: Role,
    /// Whether the statement ran on a transaction-bound connection.
    pub in_transaction: bool,
    /// Optional query name/tag for identification.
    pub tag: Option<String>,
}

impl QueryContext {
    pub fn new(sql: &str, param_count: usize) -> Self {
        Self {
            sql: sql.to_string(),
            exec_sql: sql.to_string(),
            param_count,
            query_type: QueryType::from_sql(sql),
            role: Role::Read,
            in_transaction: false,
            tag: None,
        }
    }

    pub fn with_query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = query_type;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

const MAX_ERROR_LEN: usize = 512;

/// Outcome of a statement for monitoring purposes.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Rows(usize),
    Affected(u64),
    /// Error message, truncated to 512 bytes.
    Error(String),
}

impl QueryResult {
    pub fn error(msg: String) -> Self {
        if msg.len() > MAX_ERROR_LEN {
            Self::Error(format!("{}...", super::truncate_sql_bytes(&msg, MAX_ERROR_LEN)))
        } else {
            Self::Error(msg)
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, QueryResult::Error(_))
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryResult::Rows(n) => write!(f, "{n} rows"),
            QueryResult::Affected(n) => write!(f, "{n} affected"),
            QueryResult::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Receives timing for every executed statement.
pub trait QueryMonitor: Send + Sync {
    fn on_query_start(&self, _ctx: &QueryContext) {}

    fn on_query_complete(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult);

    /// Called in addition to `on_query_complete` when the slow threshold is exceeded.
    fn on_slow_query(&self, _ctx: &QueryContext, _duration: Duration) {}
}

/// Action to take after a hook inspects a statement.
#[derive(Debug, Clone)]
pub enum HookAction {
    Continue,
    /// Execute this SQL instead. Placeholder count must not change.
    ModifySql(String),
    Abort(String),
}

/// Inspect, rewrite or abort statements before execution.
pub trait QueryHook: Send + Sync {
    fn before_query(&self, _ctx: &QueryContext) -> HookAction {
        HookAction::Continue
    }

    fn after_query(&self, _ctx: &QueryContext, _duration: Duration, _result: &QueryResult) {}
}
