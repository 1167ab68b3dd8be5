//! Fluent statement builder.
//!
//! A [`Builder`] wraps a [`Grammar`] and turns column names, operators and
//! values into quoted, parameterized fragments. Methods consume and return the
//! builder; `clone()` yields a fully independent copy.
//!
//! Argument errors do not panic and do not touch the database: the first one
//! is recorded and returned by whichever execution method runs next.
//!
//! ```ignore
//! let adults = session
//!     .model("User")?
//!     .where_op("age", ">=", 18)
//!     .where_group(|q| q.where_eq("role", "admin").or_where("role", "staff"))
//!     .order_by_desc("created_at")
//!     .with("posts.comments")
//!     .get(&mut session)
//!     .await?;
//! ```

use crate::connection::Pool;
use crate::dialect::Dialect;
use crate::error::{OrmError, OrmResult};
use crate::grammar::{Boolean, ClauseKind, Grammar, Statement, StatementKind};
use crate::record::{Record, RecordList};
use crate::relation::{self, EagerLoad, EntityMeta};
use crate::session::Session;
use crate::value::Value;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Name of the standing soft-delete predicate.
pub(crate) const SOFT_DELETE_SCOPE: &str = "soft_delete";

const OPERATORS: &[&str] = &[
    "=", "<>", "!=", "<", "<=", ">", ">=", "like", "not like", "ilike", "not ilike",
];

/// Recorded build error; kept cloneable so builders stay `Clone`.
#[derive(Debug, Clone)]
enum Pending {
    Validation(String),
    Placeholders {
        sql: String,
        placeholders: usize,
        params: usize,
    },
}

impl From<OrmError> for Pending {
    fn from(err: OrmError) -> Self {
        match err {
            OrmError::PlaceholderMismatch {
                sql,
                placeholders,
                params,
            } => Pending::Placeholders {
                sql,
                placeholders,
                params,
            },
            OrmError::Validation(msg) => Pending::Validation(msg),
            other => Pending::Validation(other.to_string()),
        }
    }
}

impl From<Pending> for OrmError {
    fn from(p: Pending) -> Self {
        match p {
            Pending::Validation(msg) => OrmError::Validation(msg),
            Pending::Placeholders {
                sql,
                placeholders,
                params,
            } => OrmError::PlaceholderMismatch {
                sql,
                placeholders,
                params,
            },
        }
    }
}

/// One page of results plus totals.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub items: RecordList,
    pub total: i64,
    pub page: u64,
    pub per_page: u64,
    pub last_page: u64,
}

/// Fluent SELECT/INSERT/UPDATE/DELETE builder.
#[derive(Clone)]
pub struct Builder {
    grammar: Grammar,
    entity: Option<Arc<EntityMeta>>,
    eager: Vec<EagerLoad>,
    guarded: bool,
    build_error: Option<Pending>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("grammar", &self.grammar)
            .field("entity", &self.entity.as_ref().map(|e| e.name.as_str()))
            .field(
                "eager",
                &self.eager.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            )
            .field("guarded", &self.guarded)
            .field("build_error", &self.build_error)
            .finish()
    }
}

impl Builder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            grammar: Grammar::new(dialect),
            entity: None,
            eager: Vec::new(),
            guarded: true,
            build_error: None,
        }
    }

    /// Builder over a plain table with the default dialect.
    pub fn table(name: &str) -> Self {
        Self::new(Dialect::default()).from(name)
    }

    /// Builder over an entity's table, with its soft-delete scope installed.
    pub fn for_entity(meta: Arc<EntityMeta>, dialect: Dialect) -> Self {
        let mut builder = Self::new(dialect).from(&meta.table);
        if let Some(col) = meta.soft_delete.as_deref() {
            let sql = format!("{} IS NULL", builder.qualified(&meta.table, col));
            builder = builder.scope(SOFT_DELETE_SCOPE, sql);
        }
        builder.entity = Some(meta);
        builder
    }

    pub fn entity(&self) -> Option<&Arc<EntityMeta>> {
        self.entity.as_ref()
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn dialect(&self) -> Dialect {
        self.grammar.dialect()
    }

    fn wrap(&self, ident: &str) -> String {
        self.grammar.dialect().wrap(ident)
    }

    fn qualified(&self, table: &str, col: &str) -> String {
        self.wrap(&format!("{table}.{col}"))
    }

    fn fail(&mut self, err: impl Into<Pending>) {
        if self.build_error.is_none() {
            self.build_error = Some(err.into());
        }
    }

    fn push(mut self, kind: ClauseKind, sql: String, params: Vec<Value>, boolean: Boolean) -> Self {
        if let Err(err) = self.grammar.push(kind, sql, params, boolean) {
            self.fail(err);
        }
        self
    }

    fn scope(mut self, name: &str, sql: String) -> Self {
        if let Err(err) = self.grammar.push_scope(name, sql, Vec::new()) {
            self.fail(err);
        }
        self
    }

    fn operator(&mut self, op: &str) -> Option<String> {
        let normalized = op.trim().to_ascii_lowercase();
        if OPERATORS.contains(&normalized.as_str()) {
            Some(normalized.to_ascii_uppercase())
        } else {
            self.fail(Pending::Validation(format!("unsupported operator `{op}`")));
            None
        }
    }

    // ==================== SELECT list / FROM ====================

    /// Replace the select list.
    pub fn select(mut self, cols: &[&str]) -> Self {
        self.grammar.clear(ClauseKind::Select);
        for col in cols {
            self = self.add_select(col);
        }
        self
    }

    pub fn add_select(self, col: &str) -> Self {
        let sql = self.wrap(col);
        self.push(ClauseKind::Select, sql, Vec::new(), Boolean::And)
    }

    /// Append a raw select expression with `?` bindings.
    pub fn select_raw(self, sql: &str, params: Vec<Value>) -> Self {
        self.push(ClauseKind::Select, sql.to_string(), params, Boolean::And)
    }

    pub fn distinct(mut self) -> Self {
        self.grammar.set_distinct(true);
        self
    }

    pub fn from(mut self, table: &str) -> Self {
        self.grammar.clear(ClauseKind::From);
        let sql = self.wrap(table);
        self.push(ClauseKind::From, sql, Vec::new(), Boolean::And)
    }

    fn join_kind(mut self, kind: &str, table: &str, first: &str, op: &str, second: &str) -> Self {
        let Some(op) = self.operator(op) else {
            return self;
        };
        let sql = format!(
            "{kind} JOIN {} ON {} {op} {}",
            self.wrap(table),
            self.wrap(first),
            self.wrap(second)
        );
        self.push(ClauseKind::Join, sql, Vec::new(), Boolean::And)
    }

    pub fn join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.join_kind("INNER", table, first, op, second)
    }

    pub fn left_join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.join_kind("LEFT", table, first, op, second)
    }

    pub fn right_join(self, table: &str, first: &str, op: &str, second: &str) -> Self {
        self.join_kind("RIGHT", table, first, op, second)
    }

    // ==================== WHERE ====================

    fn where_with(mut self, col: &str, op: &str, value: Value, boolean: Boolean) -> Self {
        let Some(op) = self.operator(op) else {
            return self;
        };
        let sql = format!("{} {op} ?", self.wrap(col));
        self.push(ClauseKind::Where, sql, vec![value], boolean)
    }

    pub fn where_op(self, col: &str, op: &str, value: impl Into<Value>) -> Self {
        self.where_with(col, op, value.into(), Boolean::And)
    }

    pub fn where_eq(self, col: &str, value: impl Into<Value>) -> Self {
        self.where_with(col, "=", value.into(), Boolean::And)
    }

    /// `OR col = value`.
    pub fn or_where(self, col: &str, value: impl Into<Value>) -> Self {
        self.where_with(col, "=", value.into(), Boolean::Or)
    }

    pub fn or_where_op(self, col: &str, op: &str, value: impl Into<Value>) -> Self {
        self.where_with(col, op, value.into(), Boolean::Or)
    }

    fn where_in_with<V, I>(self, col: &str, values: I, negate: bool, boolean: Boolean) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            // Empty IN matches nothing; empty NOT IN matches everything.
            return if negate {
                self
            } else {
                self.push(ClauseKind::Where, "1 = 0".to_string(), Vec::new(), boolean)
            };
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let not = if negate { "NOT " } else { "" };
        let sql = format!("{} {not}IN ({placeholders})", self.wrap(col));
        self.push(ClauseKind::Where, sql, values, boolean)
    }

    pub fn where_in<V, I>(self, col: &str, values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        self.where_in_with(col, values, false, Boolean::And)
    }

    pub fn or_where_in<V, I>(self, col: &str, values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        self.where_in_with(col, values, false, Boolean::Or)
    }

    pub fn where_not_in<V, I>(self, col: &str, values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        self.where_in_with(col, values, true, Boolean::And)
    }

    pub fn where_null(self, col: &str) -> Self {
        let sql = format!("{} IS NULL", self.wrap(col));
        self.push(ClauseKind::Where, sql, Vec::new(), Boolean::And)
    }

    pub fn where_not_null(self, col: &str) -> Self {
        let sql = format!("{} IS NOT NULL", self.wrap(col));
        self.push(ClauseKind::Where, sql, Vec::new(), Boolean::And)
    }

    pub fn where_between(self, col: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        let sql = format!("{} BETWEEN ? AND ?", self.wrap(col));
        self.push(
            ClauseKind::Where,
            sql,
            vec![low.into(), high.into()],
            Boolean::And,
        )
    }

    /// Raw predicate with `?` bindings. The caller owns its SQL safety.
    pub fn where_raw(self, sql: &str, params: Vec<Value>) -> Self {
        self.push(ClauseKind::Where, sql.to_string(), params, Boolean::And)
    }

    pub fn or_where_raw(self, sql: &str, params: Vec<Value>) -> Self {
        self.push(ClauseKind::Where, sql.to_string(), params, Boolean::Or)
    }

    fn where_group_with<F>(mut self, f: F, boolean: Boolean) -> Self
    where
        F: FnOnce(Builder) -> Builder,
    {
        let nested = f(Builder::new(self.dialect()));
        if let Some(err) = nested.build_error {
            self.fail(err);
            return self;
        }
        match nested.grammar.folded(ClauseKind::Where) {
            Some(group) => self.push(
                ClauseKind::Where,
                format!("({})", group.sql),
                group.params,
                boolean,
            ),
            None => self,
        }
    }

    /// Parenthesized group of predicates built by `f`.
    pub fn where_group<F>(self, f: F) -> Self
    where
        F: FnOnce(Builder) -> Builder,
    {
        self.where_group_with(f, Boolean::And)
    }

    pub fn or_where_group<F>(self, f: F) -> Self
    where
        F: FnOnce(Builder) -> Builder,
    {
        self.where_group_with(f, Boolean::Or)
    }

    // ==================== GROUP / HAVING / ORDER / WINDOW ====================

    pub fn group_by(mut self, cols: &[&str]) -> Self {
        for col in cols {
            let sql = self.wrap(col);
            self = self.push(ClauseKind::Group, sql, Vec::new(), Boolean::And);
        }
        self
    }

    fn having_with(mut self, expr: &str, op: &str, value: Value, boolean: Boolean) -> Self {
        let Some(op) = self.operator(op) else {
            return self;
        };
        self.push(ClauseKind::Having, format!("{expr} {op} ?"), vec![value], boolean)
    }

    /// `HAVING expr op ?`; `expr` is raw SQL such as `COUNT(*)`.
    pub fn having(self, expr: &str, op: &str, value: impl Into<Value>) -> Self {
        self.having_with(expr, op, value.into(), Boolean::And)
    }

    pub fn or_having(self, expr: &str, op: &str, value: impl Into<Value>) -> Self {
        self.having_with(expr, op, value.into(), Boolean::Or)
    }

    pub fn order_by(self, col: &str) -> Self {
        let sql = format!("{} ASC", self.wrap(col));
        self.push(ClauseKind::Order, sql, Vec::new(), Boolean::And)
    }

    pub fn order_by_desc(self, col: &str) -> Self {
        let sql = format!("{} DESC", self.wrap(col));
        self.push(ClauseKind::Order, sql, Vec::new(), Boolean::And)
    }

    pub fn limit(mut self, take: u64) -> Self {
        self.grammar.set_take(Some(take));
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.grammar.set_offset(Some(offset));
        self
    }

    /// 1-based page window; `page` and `per_page` are clamped to at least 1.
    ///
    /// An offset past `u64::MAX` is recorded as a build error.
    pub fn for_page(mut self, page: u64, per_page: u64) -> Self {
        let per_page = per_page.max(1);
        match page_offset(page, per_page) {
            Ok(offset) => {
                self.grammar.set_window(Some(offset), Some(per_page));
            }
            Err(err) => self.fail(err),
        }
        self
    }

    // ==================== UNION ====================

    fn union_with(mut self, other: Builder, keyword: &str) -> Self {
        match other.to_statement(StatementKind::Select) {
            Ok(stmt) => self.push(
                ClauseKind::Union,
                format!("{keyword} ({})", stmt.sql),
                stmt.params,
                Boolean::And,
            ),
            Err(err) => {
                self.fail(err);
                self
            }
        }
    }

    pub fn union(self, other: Builder) -> Self {
        self.union_with(other, "UNION")
    }

    pub fn union_all(self, other: Builder) -> Self {
        self.union_with(other, "UNION ALL")
    }

    // ==================== VALUES ====================

    /// Set one column for INSERT/UPDATE.
    pub fn value(self, col: &str, value: impl Into<Value>) -> Self {
        let sql = self.wrap(col);
        self.push(ClauseKind::Values, sql, vec![value.into()], Boolean::And)
    }

    pub fn values<K, V, I>(mut self, pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (col, value) in pairs {
            self = self.value(col.as_ref(), value);
        }
        self
    }

    /// Multi-row INSERT; every row must have one value per column.
    pub fn values_many(mut self, cols: &[&str], rows: Vec<Vec<Value>>) -> Self {
        if rows.is_empty() {
            self.fail(Pending::Validation("values_many needs at least one row".into()));
            return self;
        }
        if let Some(bad) = rows.iter().position(|r| r.len() != cols.len()) {
            self.fail(Pending::Validation(format!(
                "row {bad} has {} value(s) for {} column(s)",
                rows[bad].len(),
                cols.len()
            )));
            return self;
        }
        let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); cols.len()];
        for row in rows {
            for (idx, value) in row.into_iter().enumerate() {
                columns[idx].push(value);
            }
        }
        for (col, values) in cols.iter().zip(columns) {
            let sql = self.wrap(col);
            self = self.push(ClauseKind::Values, sql, values, Boolean::And);
        }
        self
    }

    // ==================== LOCKS ====================

    pub fn lock_for_update(mut self) -> Self {
        self.grammar.clear(ClauseKind::Lock);
        self.push(ClauseKind::Lock, "FOR UPDATE".to_string(), Vec::new(), Boolean::And)
    }

    pub fn shared_lock(mut self) -> Self {
        self.grammar.clear(ClauseKind::Lock);
        self.push(ClauseKind::Lock, "FOR SHARE".to_string(), Vec::new(), Boolean::And)
    }

    // ==================== RELATIONS / SCOPES ====================

    /// Eager-load a relation path such as `posts` or `posts.comments`.
    pub fn with(mut self, path: &str) -> Self {
        self.eager.push(EagerLoad::new(path, None));
        self
    }

    /// Eager-load a relation path, narrowing the related query with `scope`.
    pub fn with_scoped<F>(mut self, path: &str, scope: F) -> Self
    where
        F: Fn(Builder) -> Builder + Send + Sync + 'static,
    {
        self.eager.push(EagerLoad::new(path, Some(Arc::new(scope))));
        self
    }

    pub(crate) fn eager_loads(&self) -> &[EagerLoad] {
        &self.eager
    }

    fn soft_delete_column(&self) -> Option<(String, String)> {
        let meta = self.entity.as_ref()?;
        let col = meta.soft_delete.as_ref()?;
        Some((meta.table.clone(), col.clone()))
    }

    /// Include soft-deleted rows.
    pub fn with_trashed(mut self) -> Self {
        self.grammar.remove_scope(SOFT_DELETE_SCOPE);
        self
    }

    /// Only soft-deleted rows.
    pub fn only_trashed(self) -> Self {
        match self.soft_delete_column() {
            Some((table, col)) => {
                let sql = format!("{} IS NOT NULL", self.qualified(&table, &col));
                self.scope(SOFT_DELETE_SCOPE, sql)
            }
            None => self,
        }
    }

    /// Allow UPDATE/DELETE without a WHERE clause.
    pub fn unguarded(mut self) -> Self {
        self.guarded = false;
        self
    }

    // ==================== RENDERING ====================

    /// Render as `kind`, surfacing any recorded build error first.
    pub fn to_statement(&self, kind: StatementKind) -> OrmResult<Statement> {
        if let Some(err) = &self.build_error {
            return Err(err.clone().into());
        }
        self.grammar.render(kind)
    }

    /// SELECT SQL and params, for inspection.
    pub fn to_sql(&self) -> OrmResult<(String, Vec<Value>)> {
        Ok(self.to_statement(StatementKind::Select)?.into_parts())
    }

    fn aggregate_statement(&self, function: &str, col: &str) -> OrmResult<Statement> {
        if let Some(err) = &self.build_error {
            return Err(err.clone().into());
        }
        let g = &self.grammar;
        let needs_subquery = g.has(ClauseKind::Group) || g.has(ClauseKind::Union) || g.is_distinct();

        if needs_subquery {
            let mut inner = g.deep_copy();
            inner
                .clear(ClauseKind::Order)
                .clear(ClauseKind::Lock)
                .set_window(None, None);
            let inner = inner.render(StatementKind::Select)?;
            let target = if col == "*" {
                "*".to_string()
            } else {
                let unqualified = col.rsplit('.').next().unwrap_or(col);
                self.wrap(&format!("agg_sub.{unqualified}"))
            };
            return Ok(Statement::new(
                StatementKind::Select,
                format!("SELECT {function}({target}) AS aggregate FROM ({}) AS agg_sub", inner.sql),
                inner.params,
            ));
        }

        let mut agg = g.for_aggregates();
        let target = if col == "*" { "*".to_string() } else { self.wrap(col) };
        agg.push(
            ClauseKind::Select,
            format!("{function}({target}) AS aggregate"),
            Vec::new(),
            Boolean::And,
        )?;
        agg.render(StatementKind::Select)
    }

    fn write_guard(&self, action: &str) -> OrmResult<()> {
        if self.guarded && !self.grammar.has(ClauseKind::Where) {
            return Err(OrmError::validation(format!(
                "{action} without a WHERE clause; call unguarded() to affect every row"
            )));
        }
        Ok(())
    }

    fn entity_name(&self) -> Option<Arc<str>> {
        self.entity.as_ref().map(|m| Arc::from(m.name.as_str()))
    }

    fn describe(&self) -> String {
        match &self.entity {
            Some(meta) => meta.name.clone(),
            None => self
                .grammar
                .fragments(ClauseKind::From)
                .first()
                .map(|f| f.sql.clone())
                .unwrap_or_default(),
        }
    }

    // ==================== EXECUTION ====================

    /// All matching records, with requested relations loaded.
    pub async fn get<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<RecordList> {
        let stmt = self.to_statement(StatementKind::Select)?;
        let rows = session.fetch(&stmt).await?;
        let mut list = RecordList::from_rows(self.entity_name(), rows);
        if !self.eager.is_empty() && !list.is_empty() {
            let meta = self.entity.as_ref().ok_or_else(|| {
                OrmError::relation(
                    self.eager[0].path.clone(),
                    "eager loading requires an entity builder",
                )
            })?;
            relation::eager_load(session, meta, &mut list, &self.eager).await?;
        }
        Ok(list)
    }

    pub async fn first<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<Option<Record>> {
        let list = self.clone().limit(1).get(session).await?;
        Ok(list.into_records().into_iter().next())
    }

    pub async fn first_or_fail<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<Record> {
        self.first(session)
            .await?
            .ok_or_else(|| OrmError::not_found(format!("no {} row matches", self.describe())))
    }

    fn primary_key(&self) -> String {
        self.entity
            .as_ref()
            .map(|m| m.primary_key.clone())
            .unwrap_or_else(|| "id".to_string())
    }

    pub async fn find<P: Pool>(
        &self,
        session: &mut Session<P>,
        id: impl Into<Value>,
    ) -> OrmResult<Option<Record>> {
        let pk = self.primary_key();
        self.clone().where_eq(&pk, id).first(session).await
    }

    pub async fn find_or_fail<P: Pool>(
        &self,
        session: &mut Session<P>,
        id: impl Into<Value>,
    ) -> OrmResult<Record> {
        let id = id.into();
        self.find(session, id.clone()).await?.ok_or_else(|| {
            OrmError::not_found(format!("{} with {} = {id:?}", self.describe(), self.primary_key()))
        })
    }

    pub async fn exists<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<bool> {
        let mut probe = self.clone();
        probe.grammar.clear(ClauseKind::Select);
        let stmt = probe
            .select_raw("1", Vec::new())
            .limit(1)
            .to_statement(StatementKind::Select)?;
        Ok(!session.fetch(&stmt).await?.is_empty())
    }

    async fn aggregate<P: Pool>(
        &self,
        session: &mut Session<P>,
        function: &str,
        col: &str,
    ) -> OrmResult<Value> {
        let stmt = self.aggregate_statement(function, col)?;
        let rows = session.fetch(&stmt).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_index(0))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn count<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<i64> {
        match self.aggregate(session, "COUNT", "*").await? {
            Value::Int(n) => Ok(n),
            Value::Null => Ok(0),
            other => Err(OrmError::decode(
                "aggregate",
                format!("expected int, got {}", other.type_name()),
            )),
        }
    }

    /// `SUM(col)`; `Value::Null` when no rows match.
    pub async fn sum<P: Pool>(&self, session: &mut Session<P>, col: &str) -> OrmResult<Value> {
        self.aggregate(session, "SUM", col).await
    }

    pub async fn avg<P: Pool>(&self, session: &mut Session<P>, col: &str) -> OrmResult<Option<f64>> {
        match self.aggregate(session, "AVG", col).await? {
            Value::Null => Ok(None),
            Value::Float(v) => Ok(Some(v)),
            Value::Int(v) => Ok(Some(v as f64)),
            other => Err(OrmError::decode(
                "aggregate",
                format!("expected number, got {}", other.type_name()),
            )),
        }
    }

    pub async fn min<P: Pool>(&self, session: &mut Session<P>, col: &str) -> OrmResult<Value> {
        self.aggregate(session, "MIN", col).await
    }

    pub async fn max<P: Pool>(&self, session: &mut Session<P>, col: &str) -> OrmResult<Value> {
        self.aggregate(session, "MAX", col).await
    }

    /// Count all matches, then fetch one page of them.
    pub async fn paginate<P: Pool>(
        &self,
        session: &mut Session<P>,
        page: u64,
        per_page: u64,
    ) -> OrmResult<Page> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        page_offset(page, per_page)?;
        let total = self.count(session).await?;
        let items = if total > 0 {
            self.clone().for_page(page, per_page).get(session).await?
        } else {
            RecordList::new(self.entity_name(), Vec::new())
        };
        let last_page = (u64::try_from(total).unwrap_or(0).div_ceil(per_page)).max(1);
        Ok(Page {
            items,
            total,
            page,
            per_page,
            last_page,
        })
    }

    pub async fn insert<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<u64> {
        let stmt = self.to_statement(StatementKind::Insert)?;
        session.execute(&stmt).await
    }

    pub async fn update<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<u64> {
        self.write_guard("UPDATE")?;
        let stmt = self.to_statement(StatementKind::Update)?;
        session.execute(&stmt).await
    }

    /// Delete matches; soft-deleting entities get their timestamp column set instead.
    pub async fn delete<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<u64> {
        self.write_guard("DELETE")?;
        match self.soft_delete_column() {
            Some((_, col)) => {
                let mut stamp = self.clone();
                stamp.grammar.clear(ClauseKind::Values);
                let stmt = stamp
                    .value(&col, Value::Timestamp(chrono::Utc::now()))
                    .to_statement(StatementKind::Update)?;
                session.execute(&stmt).await
            }
            None => {
                let stmt = self.to_statement(StatementKind::Delete)?;
                session.execute(&stmt).await
            }
        }
    }

    /// Physically delete matches, trashed rows included.
    pub async fn force_delete<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<u64> {
        self.write_guard("DELETE")?;
        let stmt = self
            .clone()
            .with_trashed()
            .to_statement(StatementKind::Delete)?;
        session.execute(&stmt).await
    }

    /// Clear the soft-delete column of matching trashed rows.
    pub async fn restore<P: Pool>(&self, session: &mut Session<P>) -> OrmResult<u64> {
        let Some((_, col)) = self.soft_delete_column() else {
            return Err(OrmError::validation(format!(
                "{} does not use soft deletes",
                self.describe()
            )));
        };
        self.write_guard("UPDATE")?;
        let mut restore = self.clone().with_trashed();
        restore.grammar.clear(ClauseKind::Values);
        let stmt = restore
            .value(&col, Value::Null)
            .to_statement(StatementKind::Update)?;
        session.execute(&stmt).await
    }
}

/// Row offset of 1-based `page`; `per_page` must already be at least 1.
fn page_offset(page: u64, per_page: u64) -> OrmResult<u64> {
    (page.max(1) - 1).checked_mul(per_page).ok_or_else(|| {
        OrmError::validation(format!("page {page} of {per_page} rows is out of range"))
    })
}
