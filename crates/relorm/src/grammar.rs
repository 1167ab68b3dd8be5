//! Clause accumulator and statement renderer.
//!
//! A [`Grammar`] holds ordered SQL fragments per clause kind, each fragment
//! carrying its own positional `?` parameters. Rendering concatenates the
//! fragments in insertion order, so the parameter list order always matches the
//! placeholder order in the text.
//!
//! WHERE/HAVING fragments are folded left to right using each fragment's own
//! boolean connector. There is no precedence reordering: `a AND b OR c` is
//! emitted exactly as pushed, and callers group with parenthesized fragments.

use crate::dialect::Dialect;
use crate::error::{OrmError, OrmResult};
use crate::placeholder;
use crate::value::Value;
use std::fmt;

/// Clause lists held by a [`Grammar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClauseKind {
    Select,
    From,
    Join,
    Where,
    Group,
    Having,
    Order,
    Union,
    Values,
    Lock,
}

const CLAUSE_COUNT: usize = 10;

impl ClauseKind {
    fn index(self) -> usize {
        self as usize
    }
}

/// Connector placed before a WHERE/HAVING fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Boolean {
    #[default]
    And,
    Or,
}

impl Boolean {
    pub fn as_str(self) -> &'static str {
        match self {
            Boolean::And => "AND",
            Boolean::Or => "OR",
        }
    }
}

/// One SQL fragment with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<Value>,
    pub boolean: Boolean,
}

impl Fragment {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            boolean: Boolean::And,
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    pub fn with_boolean(mut self, boolean: Boolean) -> Self {
        self.boolean = boolean;
        self
    }
}

/// The kind of statement a grammar is rendered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    /// Mutations must run on a write connection.
    pub fn is_write(self) -> bool {
        !matches!(self, StatementKind::Select)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered statement: SQL text plus parameters in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<Value>,
    /// SELECT carrying a row lock (`FOR UPDATE`/`FOR SHARE`).
    pub locking: bool,
}

impl Statement {
    pub fn new(kind: StatementKind, sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            params,
            locking: false,
        }
    }

    /// Whether the statement must run on a write connection.
    pub fn needs_write(&self) -> bool {
        self.kind.is_write() || self.locking
    }

    /// Fail fast when the placeholder count differs from the parameter count.
    pub fn check_parity(&self) -> OrmResult<()> {
        let placeholders = placeholder::count(&self.sql);
        if placeholders != self.params.len() {
            return Err(OrmError::PlaceholderMismatch {
                sql: self.sql.clone(),
                placeholders,
                params: self.params.len(),
            });
        }
        Ok(())
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

/// Accumulated clause fragments for one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Grammar {
    dialect: Dialect,
    clauses: [Vec<Fragment>; CLAUSE_COUNT],
    /// Standing predicates (e.g. soft-delete filter), rendered as their own AND group.
    scopes: Vec<(String, Fragment)>,
    offset: Option<u64>,
    take: Option<u64>,
    distinct: bool,
}

impl Grammar {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            clauses: Default::default(),
            scopes: Vec::new(),
            offset: None,
            take: None,
            distinct: false,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Append a fragment to a clause list.
    ///
    /// Except for VALUES (whose fragment text is a column and whose params are
    /// the per-row values), the fragment's `?` count must equal `params.len()`.
    pub fn push(
        &mut self,
        kind: ClauseKind,
        sql: impl Into<String>,
        params: Vec<Value>,
        boolean: Boolean,
    ) -> OrmResult<&mut Self> {
        let sql = sql.into();
        if sql.trim().is_empty() {
            return Err(OrmError::validation(format!("empty {kind:?} fragment")));
        }
        if kind == ClauseKind::Values {
            if params.is_empty() {
                return Err(OrmError::validation(format!("no values for column {sql}")));
            }
        } else {
            let placeholders = placeholder::count(&sql);
            if placeholders != params.len() {
                return Err(OrmError::PlaceholderMismatch {
                    sql,
                    placeholders,
                    params: params.len(),
                });
            }
        }
        self.clauses[kind.index()].push(Fragment {
            sql,
            params,
            boolean,
        });
        Ok(self)
    }

    pub fn fragments(&self, kind: ClauseKind) -> &[Fragment] {
        &self.clauses[kind.index()]
    }

    pub fn has(&self, kind: ClauseKind) -> bool {
        !self.clauses[kind.index()].is_empty()
    }

    pub fn clear(&mut self, kind: ClauseKind) -> &mut Self {
        self.clauses[kind.index()].clear();
        self
    }

    /// Install (or replace) a named standing predicate.
    pub fn push_scope(
        &mut self,
        name: &str,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> OrmResult<&mut Self> {
        let fragment = Fragment::new(sql, params);
        let placeholders = placeholder::count(&fragment.sql);
        if placeholders != fragment.params.len() {
            return Err(OrmError::PlaceholderMismatch {
                sql: fragment.sql,
                placeholders,
                params: fragment.params.len(),
            });
        }
        match self.scopes.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = fragment,
            None => self.scopes.push((name.to_string(), fragment)),
        }
        Ok(self)
    }

    /// Remove a named standing predicate. Returns whether it existed.
    pub fn remove_scope(&mut self, name: &str) -> bool {
        let before = self.scopes.len();
        self.scopes.retain(|(n, _)| n != name);
        self.scopes.len() != before
    }

    pub fn scope(&self, name: &str) -> Option<&Fragment> {
        self.scopes.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn set_window(&mut self, offset: Option<u64>, take: Option<u64>) -> &mut Self {
        self.offset = offset;
        self.take = take;
        self
    }

    pub fn set_offset(&mut self, offset: Option<u64>) -> &mut Self {
        self.offset = offset;
        self
    }

    pub fn set_take(&mut self, take: Option<u64>) -> &mut Self {
        self.take = take;
        self
    }

    pub fn window(&self) -> (Option<u64>, Option<u64>) {
        (self.offset, self.take)
    }

    pub fn set_distinct(&mut self, distinct: bool) -> &mut Self {
        self.distinct = distinct;
        self
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Fold one predicate clause (WHERE/HAVING) into a single fragment, scopes excluded.
    pub(crate) fn folded(&self, kind: ClauseKind) -> Option<Fragment> {
        let fragments = self.fragments(kind);
        if fragments.is_empty() {
            return None;
        }
        let mut out = Render::default();
        out.fold(fragments);
        Some(Fragment::new(out.sql, out.params))
    }

    /// Copy prepared for COUNT/SUM/AVG/MIN/MAX: no select list, ordering,
    /// window, lock or DISTINCT. The source grammar is not modified.
    pub fn for_aggregates(&self) -> Grammar {
        let mut g = self.deep_copy();
        g.clear(ClauseKind::Select)
            .clear(ClauseKind::Order)
            .clear(ClauseKind::Lock)
            .set_window(None, None)
            .set_distinct(false);
        g
    }

    /// Fully independent copy; mutating either side never affects the other.
    ///
    /// Every clause value is an owned [`Value`], so copying cannot fail.
    pub fn deep_copy(&self) -> Grammar {
        Grammar {
            dialect: self.dialect,
            clauses: self.clauses.clone(),
            scopes: self.scopes.clone(),
            offset: self.offset,
            take: self.take,
            distinct: self.distinct,
        }
    }

    /// Render the grammar as a statement of the given kind.
    pub fn render(&self, kind: StatementKind) -> OrmResult<Statement> {
        let mut out = Render::default();
        match kind {
            StatementKind::Select => self.render_select(&mut out)?,
            StatementKind::Insert => self.render_insert(&mut out)?,
            StatementKind::Update => self.render_update(&mut out)?,
            StatementKind::Delete => self.render_delete(&mut out)?,
        }
        Ok(Statement {
            kind,
            sql: out.sql,
            params: out.params,
            locking: kind == StatementKind::Select && self.has(ClauseKind::Lock),
        })
    }

    fn table(&self) -> OrmResult<&Fragment> {
        self.fragments(ClauseKind::From)
            .first()
            .ok_or_else(|| OrmError::validation("statement has no table (FROM clause is empty)"))
    }

    fn render_select(&self, out: &mut Render) -> OrmResult<()> {
        out.push("SELECT ");
        if self.distinct {
            out.push("DISTINCT ");
        }
        if self.has(ClauseKind::Select) {
            out.join(self.fragments(ClauseKind::Select), ", ");
        } else {
            out.push("*");
        }

        if !self.has(ClauseKind::From) {
            return Err(OrmError::validation("SELECT has no FROM clause"));
        }
        out.push(" FROM ");
        out.join(self.fragments(ClauseKind::From), ", ");

        for join in self.fragments(ClauseKind::Join) {
            out.push(" ");
            out.fragment(join);
        }

        self.render_where(out);

        if self.has(ClauseKind::Group) {
            out.push(" GROUP BY ");
            out.join(self.fragments(ClauseKind::Group), ", ");
        }

        if self.has(ClauseKind::Having) {
            out.push(" HAVING ");
            out.fold(self.fragments(ClauseKind::Having));
        }

        if self.has(ClauseKind::Order) {
            out.push(" ORDER BY ");
            out.join(self.fragments(ClauseKind::Order), ", ");
        }

        for union in self.fragments(ClauseKind::Union) {
            out.push(" ");
            out.fragment(union);
        }

        if let Some(limit) = self.dialect.render_limit(self.offset, self.take) {
            if self.dialect.window_needs_order && !self.has(ClauseKind::Order) {
                out.push(" ORDER BY (SELECT NULL)");
            }
            out.push(" ");
            out.push(&limit);
        }

        for lock in self.fragments(ClauseKind::Lock) {
            out.push(" ");
            out.fragment(lock);
        }
        Ok(())
    }

    fn render_insert(&self, out: &mut Render) -> OrmResult<()> {
        let table = self.table()?;
        let values = self.fragments(ClauseKind::Values);
        let Some(first) = values.first() else {
            return Err(OrmError::validation("INSERT has no values"));
        };
        let rows = first.params.len();
        if let Some(bad) = values.iter().find(|v| v.params.len() != rows) {
            return Err(OrmError::validation(format!(
                "INSERT column {} has {} value(s), expected {}",
                bad.sql,
                bad.params.len(),
                rows
            )));
        }

        out.push("INSERT INTO ");
        out.push(&table.sql);
        out.push(" (");
        out.push(
            &values
                .iter()
                .map(|v| v.sql.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );
        out.push(") VALUES ");

        let row_placeholders = format!("({})", vec!["?"; values.len()].join(", "));
        for row in 0..rows {
            if row > 0 {
                out.push(", ");
            }
            out.push(&row_placeholders);
            out.params
                .extend(values.iter().map(|v| v.params[row].clone()));
        }
        Ok(())
    }

    fn render_update(&self, out: &mut Render) -> OrmResult<()> {
        let table = self.table()?;
        let values = self.fragments(ClauseKind::Values);
        if values.is_empty() {
            return Err(OrmError::validation("UPDATE has no SET values"));
        }
        if let Some(bad) = values.iter().find(|v| v.params.len() != 1) {
            return Err(OrmError::validation(format!(
                "UPDATE column {} must have exactly one value, got {}",
                bad.sql,
                bad.params.len()
            )));
        }

        out.push("UPDATE ");
        out.push(&table.sql);
        out.push(" SET ");
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                out.push(", ");
            }
            out.push(&v.sql);
            out.push(" = ?");
            out.params.push(v.params[0].clone());
        }
        self.render_where(out);
        Ok(())
    }

    fn render_delete(&self, out: &mut Render) -> OrmResult<()> {
        let table = self.table()?;
        out.push("DELETE FROM ");
        out.push(&table.sql);
        self.render_where(out);
        Ok(())
    }

    /// Standing scopes and caller predicates become two AND'd groups, so a
    /// caller's `OR` can never escape the scope.
    fn render_where(&self, out: &mut Render) {
        let wheres = self.fragments(ClauseKind::Where);
        let scopes: Vec<&Fragment> = self.scopes.iter().map(|(_, f)| f).collect();

        match (scopes.is_empty(), wheres.is_empty()) {
            (true, true) => {}
            (false, true) => {
                out.push(" WHERE ");
                out.fold_and(&scopes);
            }
            (true, false) => {
                out.push(" WHERE ");
                out.fold(wheres);
            }
            (false, false) => {
                out.push(" WHERE (");
                out.fold_and(&scopes);
                out.push(") AND (");
                out.fold(wheres);
                out.push(")");
            }
        }
    }
}

#[derive(Default)]
struct Render {
    sql: String,
    params: Vec<Value>,
}

impl Render {
    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn fragment(&mut self, f: &Fragment) {
        self.sql.push_str(&f.sql);
        self.params.extend(f.params.iter().cloned());
    }

    fn join(&mut self, fragments: &[Fragment], sep: &str) {
        for (i, f) in fragments.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(sep);
            }
            self.fragment(f);
        }
    }

    /// Left-to-right fold using each fragment's own connector.
    fn fold(&mut self, fragments: &[Fragment]) {
        for (i, f) in fragments.iter().enumerate() {
            if i > 0 {
                self.sql.push(' ');
                self.sql.push_str(f.boolean.as_str());
                self.sql.push(' ');
            }
            self.fragment(f);
        }
    }

    fn fold_and(&mut self, fragments: &[&Fragment]) {
        for (i, f) in fragments.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(" AND ");
            }
            self.fragment(f);
        }
    }
}
