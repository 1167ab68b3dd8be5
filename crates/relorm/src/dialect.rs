//! SQL dialect capabilities.
//!
//! A dialect only decides the identifier quote character and the LIMIT/OFFSET
//! syntax, including whether that syntax needs an ORDER BY in front of it. Everything else in [`Grammar`](crate::grammar::Grammar)
//! is dialect-neutral. Dialects are looked up by name from configuration.
//!
//! ```ignore
//! let d = Dialect::lookup("mysql")?;
//! assert_eq!(d.wrap("users.id"), "`users`.`id`");
//! assert_eq!(d.render_limit(Some(20), Some(10)).as_deref(), Some("LIMIT 20,10"));
//! ```

use crate::error::{OrmError, OrmResult};
use std::fmt;

type LimitRenderer = fn(offset: Option<u64>, take: Option<u64>) -> Option<String>;

/// Dialect capability record.
#[derive(Clone, Copy)]
pub struct Dialect {
    /// Registry name.
    pub name: &'static str,
    /// Identifier quote character; doubled inside identifiers to escape it.
    pub quote_char: char,
    render_limit: LimitRenderer,
    /// The row window is only valid after an ORDER BY.
    pub window_needs_order: bool,
}

impl Dialect {
    pub const MYSQL: Dialect = Dialect {
        name: "mysql",
        quote_char: '`',
        render_limit: mysql_limit,
        window_needs_order: false,
    };

    pub const POSTGRES: Dialect = Dialect {
        name: "postgres",
        quote_char: '"',
        render_limit: postgres_limit,
        window_needs_order: false,
    };

    pub const MSSQL: Dialect = Dialect {
        name: "mssql",
        quote_char: '"',
        render_limit: mssql_limit,
        window_needs_order: true,
    };

    /// Find a dialect by configuration name (case-insensitive).
    pub fn lookup(name: &str) -> OrmResult<Dialect> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MYSQL),
            "postgres" | "postgresql" | "pgsql" => Ok(Self::POSTGRES),
            "mssql" | "sqlserver" => Ok(Self::MSSQL),
            _ => Err(OrmError::UnknownDialect(name.to_string())),
        }
    }

    /// Render the row window, or `None` when neither offset nor take is set.
    pub fn render_limit(&self, offset: Option<u64>, take: Option<u64>) -> Option<String> {
        (self.render_limit)(offset, take)
    }

    /// Quote a single identifier segment.
    pub fn quote(&self, ident: &str) -> String {
        let q = self.quote_char;
        let mut out = String::with_capacity(ident.len() + 2);
        out.push(q);
        for ch in ident.chars() {
            if ch == q {
                out.push(q);
            }
            out.push(ch);
        }
        out.push(q);
        out
    }

    /// Quote a column/table reference.
    ///
    /// Handles dotted paths (`users.id`), `*` segments and `x as y` aliases.
    pub fn wrap(&self, expr: &str) -> String {
        let expr = expr.trim();
        if let Some(pos) = expr.to_ascii_lowercase().find(" as ") {
            let (lhs, rhs) = (&expr[..pos], &expr[pos + 4..]);
            return format!("{} AS {}", self.wrap(lhs), self.quote(rhs.trim()));
        }

        expr.split('.')
            .map(|seg| {
                if seg == "*" {
                    seg.to_string()
                } else {
                    self.quote(seg)
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Self::POSTGRES
    }
}

impl PartialEq for Dialect {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Dialect {}

impl fmt::Debug for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialect")
            .field("name", &self.name)
            .field("quote_char", &self.quote_char)
            .finish()
    }
}

fn mysql_limit(offset: Option<u64>, take: Option<u64>) -> Option<String> {
    match (offset, take) {
        (None, None) => None,
        (None, Some(take)) => Some(format!("LIMIT {take}")),
        (Some(offset), Some(take)) => Some(format!("LIMIT {offset},{take}")),
        // MySQL has no OFFSET without LIMIT; the documented idiom is the max row count.
        (Some(offset), None) => Some(format!("LIMIT {offset},18446744073709551615")),
    }
}

fn postgres_limit(offset: Option<u64>, take: Option<u64>) -> Option<String> {
    match (offset, take) {
        (None, None) => None,
        (None, Some(take)) => Some(format!("LIMIT {take}")),
        (Some(offset), Some(take)) => Some(format!("LIMIT {take} OFFSET {offset}")),
        (Some(offset), None) => Some(format!("OFFSET {offset}")),
    }
}

fn mssql_limit(offset: Option<u64>, take: Option<u64>) -> Option<String> {
    if offset.is_none() && take.is_none() {
        return None;
    }
    let mut out = format!("OFFSET {} ROWS", offset.unwrap_or(0));
    if let Some(take) = take {
        out.push_str(&format!(" FETCH NEXT {take} ROWS ONLY"));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        assert_eq!(Dialect::lookup("MySQL").unwrap(), Dialect::MYSQL);
        assert_eq!(Dialect::lookup("postgresql").unwrap(), Dialect::POSTGRES);
        assert_eq!(Dialect::lookup("sqlserver").unwrap(), Dialect::MSSQL);
        assert!(matches!(
            Dialect::lookup("oracle"),
            Err(OrmError::UnknownDialect(_))
        ));
    }

    #[test]
    fn quoting_escapes_quote_char() {
        assert_eq!(Dialect::MYSQL.quote("we`ird"), "`we``ird`");
        assert_eq!(Dialect::POSTGRES.quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn wrap_handles_paths_and_aliases() {
        let d = Dialect::POSTGRES;
        assert_eq!(d.wrap("users.id"), "\"users\".\"id\"");
        assert_eq!(d.wrap("users.*"), "\"users\".*");
        assert_eq!(d.wrap("*"), "*");
        assert_eq!(d.wrap("users AS u"), "\"users\" AS \"u\"");
        assert_eq!(d.wrap("p.title as heading"), "\"p\".\"title\" AS \"heading\"");
    }

    #[test]
    fn limit_syntax_per_dialect() {
        assert_eq!(Dialect::MYSQL.render_limit(Some(20), Some(10)).as_deref(), Some("LIMIT 20,10"));
        assert_eq!(Dialect::MYSQL.render_limit(None, Some(5)).as_deref(), Some("LIMIT 5"));
        assert_eq!(
            Dialect::POSTGRES.render_limit(Some(20), Some(10)).as_deref(),
            Some("LIMIT 10 OFFSET 20")
        );
        assert_eq!(
            Dialect::MSSQL.render_limit(Some(20), Some(10)).as_deref(),
            Some("OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY")
        );
        assert_eq!(Dialect::MSSQL.render_limit(Some(3), None).as_deref(), Some("OFFSET 3 ROWS"));
        assert_eq!(Dialect::POSTGRES.render_limit(None, None), None);
    }
}
