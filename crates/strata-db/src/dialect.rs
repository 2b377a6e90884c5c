//! SQL dialects.
//!
//! Everything that differs between stores is behind the [`Dialect`] trait:
//! placeholder syntax, identifier quoting, boolean literals, the timestamp
//! type, the `LIMIT`/`OFFSET` form, case-sensitive pattern matching and the
//! result types of aggregates. The expression tree and the query set never
//! look at the dialect; only the compiler does.

use std::fmt;

use crate::model::SemanticType;
use crate::query::tree::{AggregateFunc, Window};

/// The type of database backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    /// PostgreSQL (`$1, $2, ...` placeholders).
    PostgreSQL,
    /// SQLite (`?` placeholders).
    SQLite,
    /// MySQL (`?` placeholders).
    MySQL,
}

impl DatabaseBackendType {
    /// Returns the dialect for this backend.
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            Self::PostgreSQL => &PostgresDialect,
            Self::SQLite => &SqliteDialect,
            Self::MySQL => &MySqlDialect,
        }
    }

    /// Parses an engine name as used in settings (`"sqlite"`, `"postgresql"`, ...).
    pub fn from_engine(engine: &str) -> Option<Self> {
        match engine.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            "postgres" | "postgresql" | "pg" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PostgreSQL => "postgresql",
            Self::SQLite => "sqlite",
            Self::MySQL => "mysql",
        };
        f.write_str(name)
    }
}

/// Where the needle of a pattern lookup must appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternPosition {
    /// Anywhere (`contains`).
    Anywhere,
    /// At the start (`startswith`).
    Start,
    /// At the end (`endswith`).
    End,
}

impl PatternPosition {
    fn wrap(self, escaped: &str, wildcard: char) -> String {
        match self {
            Self::Anywhere => format!("{wildcard}{escaped}{wildcard}"),
            Self::Start => format!("{escaped}{wildcard}"),
            Self::End => format!("{wildcard}{escaped}"),
        }
    }
}

/// Escapes `\`, `%` and `_` so the text matches literally under `LIKE`.
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Escapes `*`, `?` and `[` so the text matches literally under `GLOB`.
pub fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            _ => out.push(ch),
        }
    }
    out
}

const MAX_BOUND: u64 = i64::MAX.unsigned_abs();

fn clamp_bound(n: u64) -> u64 {
    n.min(MAX_BOUND)
}

/// The capabilities the compiler needs from a store.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// The backend this dialect renders for.
    fn backend(&self) -> DatabaseBackendType;

    /// Returns the placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Quotes an identifier.
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Returns the spelling of a boolean literal.
    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    /// Returns the column type used for timestamps, if parameters of that
    /// type need an explicit cast.
    fn timestamp_type(&self) -> Option<&'static str>;

    /// Renders a parameter placeholder for a value compared against a column
    /// of type `ty`.
    fn param(&self, index: usize, ty: SemanticType) -> String {
        let ph = self.placeholder(index);
        match (ty, self.timestamp_type()) {
            (SemanticType::DateTime, Some(name)) => format!("CAST({ph} AS {name})"),
            _ => ph,
        }
    }

    /// Wraps a text parameter so that `=` and `IN` compare case-sensitively.
    fn exact_text(&self, ph: String) -> String {
        ph
    }

    /// Renders `LIMIT`/`OFFSET` for a window (with a leading space), or an
    /// empty string when the window is unbounded.
    ///
    /// Bounds above `i64::MAX` are clamped, as stores take them as signed
    /// 64-bit integers.
    fn limit_offset(&self, window: Window) -> String {
        let limit = window.limit.map(clamp_bound);
        match (limit, clamp_bound(window.offset)) {
            (None, 0) => String::new(),
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (Some(limit), offset) => format!(" LIMIT {limit} OFFSET {offset}"),
            (None, offset) => self.offset_only(offset),
        }
    }

    /// Renders an offset without a limit.
    fn offset_only(&self, offset: u64) -> String;

    /// The `ESCAPE` clause appended to `LIKE` comparisons (with a leading space).
    fn like_escape(&self) -> &'static str {
        " ESCAPE '\\'"
    }

    /// Renders a case-sensitive pattern comparison of `lhs` against the
    /// pattern bound at `ph`.
    fn case_sensitive_match(&self, lhs: &str, ph: &str) -> String;

    /// Builds the pattern argument for a case-sensitive match.
    fn case_sensitive_pattern(&self, needle: &str, position: PatternPosition) -> String {
        position.wrap(&escape_like(needle), '%')
    }

    /// Builds the pattern argument for a case-insensitive (`LIKE`) match.
    fn insensitive_pattern(&self, needle: &str, position: PatternPosition) -> String {
        position.wrap(&escape_like(needle), '%')
    }

    /// Returns `true` if `INSERT ... RETURNING` is available.
    fn supports_returning(&self) -> bool;

    /// The tail of an `INSERT` that supplies no columns (with a leading space).
    fn default_values(&self) -> &'static str {
        " DEFAULT VALUES"
    }

    /// Renders an aggregate call over `expr`, a column of type `ty`
    /// (`None` for `COUNT(*)`).
    fn aggregate(
        &self,
        func: AggregateFunc,
        expr: &str,
        _ty: Option<SemanticType>,
        distinct: bool,
    ) -> String {
        let distinct = if distinct { "DISTINCT " } else { "" };
        format!("{}({distinct}{expr})", func.sql_name())
    }
}

/// SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn timestamp_type(&self) -> Option<&'static str> {
        None
    }

    fn offset_only(&self, offset: u64) -> String {
        format!(" LIMIT -1 OFFSET {offset}")
    }

    fn case_sensitive_match(&self, lhs: &str, ph: &str) -> String {
        format!("{lhs} GLOB {ph}")
    }

    fn case_sensitive_pattern(&self, needle: &str, position: PatternPosition) -> String {
        position.wrap(&escape_glob(needle), '*')
    }

    fn supports_returning(&self) -> bool {
        true
    }
}

/// PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn timestamp_type(&self) -> Option<&'static str> {
        Some("TIMESTAMP")
    }

    fn offset_only(&self, offset: u64) -> String {
        format!(" OFFSET {offset}")
    }

    fn case_sensitive_match(&self, lhs: &str, ph: &str) -> String {
        format!("{lhs} LIKE {ph}{}", self.like_escape())
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn aggregate(
        &self,
        func: AggregateFunc,
        expr: &str,
        ty: Option<SemanticType>,
        distinct: bool,
    ) -> String {
        let distinct = if distinct { "DISTINCT " } else { "" };
        let call = format!("{}({distinct}{expr})", func.sql_name());
        // SUM(int) and AVG(...) come back as NUMERIC, which has no lossless
        // mapping onto the value model.
        match (func, ty) {
            (AggregateFunc::Sum, Some(SemanticType::Integer)) => format!("CAST({call} AS BIGINT)"),
            (AggregateFunc::Avg, _) => format!("CAST({call} AS DOUBLE PRECISION)"),
            _ => call,
        }
    }
}

/// MySQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::MySQL
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn timestamp_type(&self) -> Option<&'static str> {
        Some("DATETIME")
    }

    fn exact_text(&self, ph: String) -> String {
        format!("CAST({ph} AS BINARY)")
    }

    fn offset_only(&self, offset: u64) -> String {
        format!(" LIMIT {} OFFSET {offset}", u64::MAX)
    }

    // MySQL treats backslash as the default LIKE escape, and an explicit
    // ESCAPE '\' clause would itself need escaping in the literal.
    fn like_escape(&self) -> &'static str {
        ""
    }

    fn case_sensitive_match(&self, lhs: &str, ph: &str) -> String {
        format!("{lhs} LIKE CAST({ph} AS BINARY)")
    }

    fn supports_returning(&self) -> bool {
        false
    }

    fn default_values(&self) -> &'static str {
        " () VALUES ()"
    }

    fn aggregate(
        &self,
        func: AggregateFunc,
        expr: &str,
        ty: Option<SemanticType>,
        distinct: bool,
    ) -> String {
        let distinct = if distinct { "DISTINCT " } else { "" };
        let call = format!("{}({distinct}{expr})", func.sql_name());
        match (func, ty) {
            (AggregateFunc::Sum, Some(SemanticType::Integer)) => format!("CAST({call} AS SIGNED)"),
            _ => call,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(PostgresDialect.placeholder(3), "$3");
        assert_eq!(SqliteDialect.placeholder(3), "?");
        assert_eq!(MySqlDialect.placeholder(3), "?");
    }

    #[test]
    fn test_quoting() {
        assert_eq!(SqliteDialect.quote("users"), "\"users\"");
        assert_eq!(PostgresDialect.quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(MySqlDialect.quote("users"), "`users`");
    }

    #[test]
    fn test_bool_literals() {
        assert_eq!(SqliteDialect.bool_literal(false), "0");
        assert_eq!(PostgresDialect.bool_literal(false), "FALSE");
        assert_eq!(MySqlDialect.bool_literal(true), "TRUE");
    }

    #[test]
    fn test_timestamp_params() {
        assert_eq!(
            PostgresDialect.param(1, SemanticType::DateTime),
            "CAST($1 AS TIMESTAMP)"
        );
        assert_eq!(
            MySqlDialect.param(1, SemanticType::DateTime),
            "CAST(? AS DATETIME)"
        );
        assert_eq!(SqliteDialect.param(1, SemanticType::DateTime), "?");
        assert_eq!(PostgresDialect.param(2, SemanticType::Integer), "$2");
    }

    #[test]
    fn test_limit_offset_forms() {
        let w = Window { offset: 0, limit: None };
        assert_eq!(SqliteDialect.limit_offset(w), "");
        let w = Window { offset: 0, limit: Some(2) };
        assert_eq!(PostgresDialect.limit_offset(w), " LIMIT 2");
        let w = Window { offset: 4, limit: Some(2) };
        assert_eq!(MySqlDialect.limit_offset(w), " LIMIT 2 OFFSET 4");
        let w = Window { offset: 4, limit: None };
        assert_eq!(SqliteDialect.limit_offset(w), " LIMIT -1 OFFSET 4");
        assert_eq!(PostgresDialect.limit_offset(w), " OFFSET 4");
        assert_eq!(
            MySqlDialect.limit_offset(w),
            " LIMIT 18446744073709551615 OFFSET 4"
        );
    }

    #[test]
    fn test_oversized_bounds_are_clamped() {
        let w = Window { offset: 0, limit: Some(u64::MAX) };
        assert_eq!(SqliteDialect.limit_offset(w), " LIMIT 9223372036854775807");
        assert_eq!(PostgresDialect.limit_offset(w), " LIMIT 9223372036854775807");
        let w = Window { offset: u64::MAX, limit: None };
        assert_eq!(SqliteDialect.limit_offset(w), " LIMIT -1 OFFSET 9223372036854775807");
        let w = Window { offset: 3, limit: Some(u64::MAX - 1) };
        assert_eq!(MySqlDialect.limit_offset(w), " LIMIT 9223372036854775807 OFFSET 3");
    }

    #[test]
    fn test_like_escaping() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(
            PostgresDialect.case_sensitive_pattern("a%b", PatternPosition::Start),
            "a\\%b%"
        );
        assert_eq!(
            SqliteDialect.insensitive_pattern("x_y", PatternPosition::End),
            "%x\\_y"
        );
    }

    #[test]
    fn test_glob_escaping() {
        assert_eq!(escape_glob("a*b?[c]"), "a[*]b[?][[]c]");
        assert_eq!(
            SqliteDialect.case_sensitive_pattern("Hi*", PatternPosition::Anywhere),
            "*Hi[*]*"
        );
    }

    #[test]
    fn test_case_sensitive_operators() {
        assert_eq!(SqliteDialect.case_sensitive_match("c", "?"), "c GLOB ?");
        assert_eq!(
            PostgresDialect.case_sensitive_match("c", "$1"),
            "c LIKE $1 ESCAPE '\\'"
        );
        assert_eq!(
            MySqlDialect.case_sensitive_match("c", "?"),
            "c LIKE CAST(? AS BINARY)"
        );
    }

    #[test]
    fn test_aggregate_result_casts() {
        assert_eq!(
            PostgresDialect.aggregate(AggregateFunc::Sum, "x", Some(SemanticType::Integer), false),
            "CAST(SUM(x) AS BIGINT)"
        );
        assert_eq!(
            PostgresDialect.aggregate(AggregateFunc::Avg, "x", Some(SemanticType::Integer), false),
            "CAST(AVG(x) AS DOUBLE PRECISION)"
        );
        assert_eq!(
            SqliteDialect.aggregate(AggregateFunc::Count, "x", None, true),
            "COUNT(DISTINCT x)"
        );
        assert_eq!(
            MySqlDialect.aggregate(AggregateFunc::Sum, "x", Some(SemanticType::Integer), false),
            "CAST(SUM(x) AS SIGNED)"
        );
    }

    #[test]
    fn test_backend_dialect_lookup() {
        assert_eq!(
            DatabaseBackendType::MySQL.dialect().backend(),
            DatabaseBackendType::MySQL
        );
        assert_eq!(
            DatabaseBackendType::from_engine("PostgreSQL"),
            Some(DatabaseBackendType::PostgreSQL)
        );
        assert_eq!(DatabaseBackendType::from_engine("oracle"), None);
        assert_eq!(DatabaseBackendType::SQLite.to_string(), "sqlite");
        assert!(!MySqlDialect.supports_returning());
    }
}
