//! SQL compiler.
//!
//! The [`SqlCompiler`] walks an [`ExpressionTree`] and renders parameterized
//! SQL for one [`Dialect`]. It never fails on a well-formed tree: conditions
//! were validated when they were parsed, so every remaining error is a
//! combination of clauses the statement kind cannot express.
//!
//! Relation filters become `IN` subqueries and never joins, so filtering
//! across a one-to-many relation cannot duplicate rows. Joins are only
//! emitted for eager loading of forward relations.

use strata_core::{StrataError, StrataResult};

use crate::dialect::{DatabaseBackendType, Dialect, PatternPosition};
use crate::model::{Cardinality, ColumnDef, ModelDescriptor, RelationDef, SemanticType};
use crate::query::lookups::{Condition, FieldPath, LookupKind};
use crate::query::tree::{BoundAggregate, ExpressionTree, Projection, SortField};
use crate::value::Value;

/// A rendered statement and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// The statement with dialect placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<Value>,
}

/// Alias of relation-filter subqueries.
const SUBQUERY_ALIAS: &str = "sub";
/// Alias of wrapped selects in `COUNT`, `EXISTS` and aggregates.
const WRAPPED_ALIAS: &str = "subquery";
/// Result column of `compile_count`.
pub const COUNT_ALIAS: &str = "__count";

/// Returns the join alias of an eager-loaded forward relation.
pub fn join_alias(relation: &RelationDef) -> String {
    format!("r_{}", relation.name)
}

/// Returns the result column name of `column` loaded through `relation`.
pub fn related_column_alias(relation: &RelationDef, column: &ColumnDef) -> String {
    format!("{}__{}", relation.name, column.name)
}

/// Checks that `aggregates` can be computed over the rows `tree` selects.
///
/// A reshaped tree is aggregated through a wrapped subquery, which only
/// exposes the projected columns.
pub(crate) fn check_aggregate(
    tree: &ExpressionTree,
    aggregates: &[BoundAggregate],
) -> StrataResult<()> {
    if aggregates.is_empty() {
        return Err(StrataError::UnsupportedOperation(
            "aggregate() requires at least one aggregate".to_string(),
        ));
    }
    if !tree.annotations().is_empty() {
        return Err(StrataError::UnsupportedOperation(
            "aggregate() cannot follow annotate()".to_string(),
        ));
    }
    if !tree.for_counting().is_reshaped() {
        return Ok(());
    }
    if let Some(columns) = tree.projection().columns() {
        for column in aggregates.iter().filter_map(|a| a.column) {
            if !columns.iter().any(|c| std::ptr::eq(*c, column)) {
                return Err(StrataError::UnsupportedOperation(format!(
                    "cannot aggregate '{}': it is not among the selected fields",
                    column.name
                )));
            }
        }
    }
    Ok(())
}

/// Translates expression trees into parameterized SQL.
pub struct SqlCompiler {
    dialect: &'static dyn Dialect,
}

impl SqlCompiler {
    /// Creates a compiler for the given backend type.
    pub fn new(backend: DatabaseBackendType) -> Self {
        Self {
            dialect: backend.dialect(),
        }
    }

    /// Creates a compiler for an explicit dialect.
    pub fn with_dialect(dialect: &'static dyn Dialect) -> Self {
        Self { dialect }
    }

    /// Returns the dialect.
    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    fn q(&self, ident: &str) -> String {
        self.dialect.quote(ident)
    }

    fn col(&self, table: &str, column: &str) -> String {
        format!("{}.{}", self.q(table), self.q(column))
    }

    fn push_param(&self, params: &mut Vec<Value>, value: Value, ty: SemanticType) -> String {
        params.push(value);
        self.dialect.param(params.len(), ty)
    }

    // ── SELECT ───────────────────────────────────────────────────────

    /// Compiles the row-returning `SELECT` of a query set.
    pub fn compile_select(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
    ) -> CompiledQuery {
        let mut params = Vec::new();
        let sql = self.select_sql(tree, model, &mut params, true);
        CompiledQuery { sql, params }
    }

    fn select_sql(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
        params: &mut Vec<Value>,
        with_window: bool,
    ) -> String {
        let table = model.table_name();
        let mut sql = String::from("SELECT ");
        if tree.is_distinct() {
            sql.push_str("DISTINCT ");
        }

        let mut select: Vec<String> = Vec::new();
        let mut joins = String::new();
        match tree.projection() {
            Projection::Model => {
                select.extend(model.columns().iter().map(|c| self.col(table, &c.name)));
                for relation in tree.eager() {
                    if !relation.cardinality.is_forward() {
                        continue;
                    }
                    let target = relation.target();
                    let alias = join_alias(relation);
                    for column in target.columns() {
                        select.push(format!(
                            "{} AS {}",
                            self.col(&alias, &column.name),
                            self.q(&related_column_alias(relation, column))
                        ));
                    }
                    joins.push_str(&format!(
                        " LEFT OUTER JOIN {} AS {} ON {} = {}",
                        self.q(target.table_name()),
                        self.q(&alias),
                        self.col(&alias, &target.primary_key().name),
                        self.col(table, &relation.join_column)
                    ));
                }
            }
            Projection::Fields(columns) => {
                select.extend(columns.iter().map(|c| self.col(table, &c.name)));
            }
            Projection::Flat(column) => select.push(self.col(table, &column.name)),
        }
        if !matches!(tree.projection(), Projection::Model) {
            for annotation in tree.annotations() {
                select.push(format!(
                    "{} AS {}",
                    self.aggregate_expr(annotation, table),
                    self.q(&annotation.alias)
                ));
            }
        }

        sql.push_str(&select.join(", "));
        sql.push_str(&format!(" FROM {}", self.q(table)));
        sql.push_str(&joins);
        sql.push_str(&self.where_sql(tree, model, params));

        if !tree.annotations().is_empty() {
            if let Some(columns) = tree.projection().columns() {
                let group: Vec<String> = columns.iter().map(|c| self.col(table, &c.name)).collect();
                sql.push_str(&format!(" GROUP BY {}", group.join(", ")));
            }
        }

        if !tree.ordering().is_empty() {
            let keys: Vec<String> = tree
                .ordering()
                .iter()
                .map(|key| {
                    let target = match &key.field {
                        SortField::Column(column) => self.col(table, &column.name),
                        SortField::Alias(alias) => self.q(alias),
                    };
                    if key.descending {
                        format!("{target} DESC")
                    } else {
                        format!("{target} ASC")
                    }
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }

        if with_window {
            sql.push_str(&self.dialect.limit_offset(tree.window()));
        }
        sql
    }

    /// Compiles the supplemental query that loads a `OneToMany` relation for
    /// the given parent keys.
    pub fn compile_eager_many(
        &self,
        relation: &RelationDef,
        keys: &[Value],
    ) -> StrataResult<CompiledQuery> {
        let target = relation.target();
        let table = target.table_name();
        let join = relation.remote_join_column()?;
        let mut params = Vec::new();
        let columns: Vec<String> = target.columns().iter().map(|c| self.col(table, &c.name)).collect();
        let placeholders: Vec<String> = keys
            .iter()
            .map(|key| self.push_param(&mut params, key.clone(), join.semantic_type))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IN ({}) ORDER BY {} ASC",
            columns.join(", "),
            self.q(table),
            self.col(table, &join.name),
            placeholders.join(", "),
            self.col(table, &target.primary_key().name)
        );
        Ok(CompiledQuery { sql, params })
    }

    // ── COUNT / EXISTS / aggregates ─────────────────────────────────

    /// Compiles a `COUNT(*)` of the rows the tree selects.
    ///
    /// A tree with a window, `DISTINCT` or annotations is counted through a
    /// wrapped subquery so the count matches what `all()` would return.
    pub fn compile_count(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
    ) -> CompiledQuery {
        let tree = tree.for_counting();
        let mut params = Vec::new();
        let sql = if tree.is_reshaped() {
            let inner = self.select_sql(&tree, model, &mut params, true);
            format!(
                "SELECT COUNT(*) AS {} FROM ({inner}) AS {}",
                self.q(COUNT_ALIAS),
                self.q(WRAPPED_ALIAS)
            )
        } else {
            format!(
                "SELECT COUNT(*) AS {} FROM {}{}",
                self.q(COUNT_ALIAS),
                self.q(model.table_name()),
                self.where_sql(&tree, model, &mut params)
            )
        };
        CompiledQuery { sql, params }
    }

    /// Compiles a probe that returns at most one row if the tree selects any.
    pub fn compile_exists(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
    ) -> CompiledQuery {
        let tree = tree.for_counting();
        let mut params = Vec::new();
        let sql = if tree.is_distinct() || !tree.annotations().is_empty() {
            let inner = self.select_sql(&tree, model, &mut params, true);
            format!("SELECT 1 AS {} FROM ({inner}) AS {} LIMIT 1", self.q("a"), self.q(WRAPPED_ALIAS))
        } else {
            format!(
                "SELECT 1 AS {} FROM {}{}{}",
                self.q("a"),
                self.q(model.table_name()),
                self.where_sql(&tree, model, &mut params),
                self.dialect.limit_offset(tree.window().limit(1))
            )
        };
        CompiledQuery { sql, params }
    }

    /// Compiles an `aggregate()` call into a single-row `SELECT`.
    pub fn compile_aggregate(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
        aggregates: &[BoundAggregate],
    ) -> StrataResult<CompiledQuery> {
        check_aggregate(tree, aggregates)?;
        let tree = tree.for_counting();
        let mut params = Vec::new();

        let (source, table) = if tree.is_reshaped() {
            let inner = self.select_sql(&tree, model, &mut params, true);
            (format!("({inner}) AS {}", self.q(WRAPPED_ALIAS)), WRAPPED_ALIAS)
        } else {
            let where_sql = self.where_sql(&tree, model, &mut params);
            (format!("{}{where_sql}", self.q(model.table_name())), model.table_name())
        };

        let select: Vec<String> = aggregates
            .iter()
            .map(|a| format!("{} AS {}", self.aggregate_expr(a, table), self.q(&a.alias)))
            .collect();
        let sql = format!("SELECT {} FROM {source}", select.join(", "));
        Ok(CompiledQuery { sql, params })
    }

    fn aggregate_expr(&self, aggregate: &BoundAggregate, table: &str) -> String {
        let (expr, ty) = match aggregate.column {
            Some(column) => (self.col(table, &column.name), Some(column.semantic_type)),
            None => ("*".to_string(), None),
        };
        self.dialect
            .aggregate(aggregate.func, &expr, ty, aggregate.distinct && aggregate.column.is_some())
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Compiles a bulk `UPDATE` of the rows the tree selects.
    pub fn compile_update(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
        assignments: &[(&'static ColumnDef, Value)],
    ) -> StrataResult<CompiledQuery> {
        if assignments.is_empty() {
            return Err(StrataError::UnsupportedOperation(
                "update() requires at least one assignment".to_string(),
            ));
        }
        let mut params = Vec::new();
        let set: Vec<String> = assignments
            .iter()
            .map(|(column, value)| {
                let ph = self.push_param(&mut params, value.clone(), column.semantic_type);
                format!("{} = {ph}", self.q(&column.name))
            })
            .collect();
        let where_sql = self.where_sql(tree, model, &mut params);
        let sql = format!(
            "UPDATE {} SET {}{where_sql}",
            self.q(model.table_name()),
            set.join(", ")
        );
        Ok(CompiledQuery { sql, params })
    }

    /// Compiles a bulk `DELETE` of the rows the tree selects.
    pub fn compile_delete(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
    ) -> CompiledQuery {
        let mut params = Vec::new();
        let where_sql = self.where_sql(tree, model, &mut params);
        let sql = format!("DELETE FROM {}{where_sql}", self.q(model.table_name()));
        CompiledQuery { sql, params }
    }

    /// Compiles a single-row `INSERT`, returning the primary key where the
    /// dialect supports `RETURNING`.
    pub fn compile_insert(
        &self,
        model: &'static ModelDescriptor,
        assignments: &[(&'static ColumnDef, Value)],
    ) -> CompiledQuery {
        let mut params = Vec::new();
        let mut sql = format!("INSERT INTO {}", self.q(model.table_name()));
        if assignments.is_empty() {
            sql.push_str(self.dialect.default_values());
        } else {
            let columns: Vec<String> = assignments.iter().map(|(c, _)| self.q(&c.name)).collect();
            let values: Vec<String> = assignments
                .iter()
                .map(|(column, value)| self.push_param(&mut params, value.clone(), column.semantic_type))
                .collect();
            sql.push_str(&format!(" ({}) VALUES ({})", columns.join(", "), values.join(", ")));
        }
        if self.dialect.supports_returning() {
            sql.push_str(&format!(" RETURNING {}", self.q(&model.primary_key().name)));
        }
        CompiledQuery { sql, params }
    }

    // ── WHERE ───────────────────────────────────────────────────────

    fn where_sql(
        &self,
        tree: &ExpressionTree,
        model: &'static ModelDescriptor,
        params: &mut Vec<Value>,
    ) -> String {
        if tree.is_empty_set() {
            return format!(" WHERE {}", self.dialect.bool_literal(false));
        }
        let conditions = tree.conditions();
        if conditions.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = conditions
            .into_iter()
            .map(|cond| self.condition_sql(cond, model, params))
            .collect();
        format!(" WHERE {}", parts.join(" AND "))
    }

    fn condition_sql(
        &self,
        cond: &Condition,
        model: &'static ModelDescriptor,
        params: &mut Vec<Value>,
    ) -> String {
        let table = model.table_name();
        let (sql, guard) = match cond.field() {
            FieldPath::Column(column) => {
                let lhs = self.col(table, &column.name);
                let sql = self.comparison_sql(&lhs, column, cond.operator(), cond.value(), params);
                (sql, column.nullable.then_some(lhs))
            }
            FieldPath::Related { relation, column } => {
                self.related_sql(cond, *relation, *column, model, params)
            }
        };
        if !cond.is_negated() {
            return sql;
        }
        let null_aware = !(cond.operator() == LookupKind::IsNull
            || (cond.operator() == LookupKind::Exact && cond.value().is_null()));
        match guard {
            Some(lhs) if null_aware => format!("NOT ({sql} AND {lhs} IS NOT NULL)"),
            _ => format!("NOT ({sql})"),
        }
    }

    /// Renders a relation filter as an `IN` subquery. Returns the SQL and,
    /// for a nullable local join column, the column to guard negation with.
    fn related_sql(
        &self,
        cond: &Condition,
        relation: &'static RelationDef,
        column: &'static ColumnDef,
        model: &'static ModelDescriptor,
        params: &mut Vec<Value>,
    ) -> (String, Option<String>) {
        let table = model.table_name();
        let target = relation.target();
        let sub = self.q(SUBQUERY_ALIAS);
        let inner_lhs = self.col(SUBQUERY_ALIAS, &column.name);
        match relation.cardinality {
            Cardinality::ManyToOne | Cardinality::OneToOne => {
                let inner = self.comparison_sql(&inner_lhs, column, cond.operator(), cond.value(), params);
                let lhs = self.col(table, &relation.join_column);
                let sql = format!(
                    "{lhs} IN (SELECT {} FROM {} AS {sub} WHERE {inner})",
                    self.col(SUBQUERY_ALIAS, &target.primary_key().name),
                    self.q(target.table_name()),
                );
                let nullable = model.column(&relation.join_column).is_some_and(|c| c.nullable);
                (sql, nullable.then_some(lhs))
            }
            Cardinality::OneToMany => {
                let join = self.col(SUBQUERY_ALIAS, &relation.join_column);
                let inner = self.comparison_sql(&inner_lhs, column, cond.operator(), cond.value(), params);
                let sql = format!(
                    "{} IN (SELECT {join} FROM {} AS {sub} WHERE {join} IS NOT NULL AND {inner})",
                    self.col(table, &model.primary_key().name),
                    self.q(target.table_name()),
                );
                (sql, None)
            }
        }
    }

    fn comparison_sql(
        &self,
        lhs: &str,
        column: &ColumnDef,
        operator: LookupKind,
        value: &Value,
        params: &mut Vec<Value>,
    ) -> String {
        let ty = column.semantic_type;
        let needle = || value.as_str().map_or_else(|| value.to_string(), ToString::to_string);
        match operator {
            LookupKind::Exact if value.is_null() => format!("{lhs} IS NULL"),
            LookupKind::Exact => {
                let ph = self.push_param(params, value.clone(), ty);
                let ph = if ty == SemanticType::Text { self.dialect.exact_text(ph) } else { ph };
                format!("{lhs} = {ph}")
            }
            LookupKind::IExact => {
                let ph = self.push_param(params, value.clone(), ty);
                format!("LOWER({lhs}) = LOWER({ph})")
            }
            LookupKind::Gt | LookupKind::Gte | LookupKind::Lt | LookupKind::Lte => {
                let op = match operator {
                    LookupKind::Gt => ">",
                    LookupKind::Gte => ">=",
                    LookupKind::Lt => "<",
                    _ => "<=",
                };
                let ph = self.push_param(params, value.clone(), ty);
                format!("{lhs} {op} {ph}")
            }
            LookupKind::Contains | LookupKind::StartsWith | LookupKind::EndsWith => {
                let pattern = self.dialect.case_sensitive_pattern(&needle(), position(operator));
                let ph = self.push_param(params, Value::String(pattern), ty);
                self.dialect.case_sensitive_match(lhs, &ph)
            }
            LookupKind::IContains | LookupKind::IStartsWith | LookupKind::IEndsWith => {
                let pattern = self.dialect.insensitive_pattern(&needle(), position(operator));
                let ph = self.push_param(params, Value::String(pattern), ty);
                format!("LOWER({lhs}) LIKE LOWER({ph}){}", self.dialect.like_escape())
            }
            LookupKind::In => {
                let items: Vec<&Value> = value
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .filter(|v| !v.is_null())
                    .collect();
                if items.is_empty() {
                    return self.false_predicate();
                }
                let placeholders: Vec<String> = items
                    .into_iter()
                    .map(|item| {
                        let ph = self.push_param(params, item.clone(), ty);
                        if ty == SemanticType::Text { self.dialect.exact_text(ph) } else { ph }
                    })
                    .collect();
                format!("{lhs} IN ({})", placeholders.join(", "))
            }
            LookupKind::IsNull => {
                if value.as_bool().unwrap_or(true) {
                    format!("{lhs} IS NULL")
                } else {
                    format!("{lhs} IS NOT NULL")
                }
            }
            LookupKind::Range => match value.as_list() {
                Some([low, high]) => {
                    let low = self.push_param(params, low.clone(), ty);
                    let high = self.push_param(params, high.clone(), ty);
                    format!("{lhs} BETWEEN {low} AND {high}")
                }
                _ => self.false_predicate(),
            },
        }
    }

    fn false_predicate(&self) -> String {
        let literal = self.dialect.bool_literal(false);
        format!("{literal} = {}", self.dialect.bool_literal(true))
    }
}

const fn position(operator: LookupKind) -> PatternPosition {
    match operator {
        LookupKind::StartsWith | LookupKind::IStartsWith => PatternPosition::Start,
        LookupKind::EndsWith | LookupKind::IEndsWith => PatternPosition::End,
        _ => PatternPosition::Anywhere,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RelationDef;
    use crate::query::lookups::parse;
    use crate::query::tree::{Aggregate, SortKey, Window};
    use std::sync::{Arc, LazyLock};

    static AUTHORS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
        ModelDescriptor::builder("authors")
            .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
            .column(ColumnDef::new("email", SemanticType::Text))
            .relation(RelationDef::one_to_many("books", books, "author_id"))
            .build()
            .unwrap()
    });

    static BOOKS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
        ModelDescriptor::builder("books")
            .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
            .column(ColumnDef::new("title", SemanticType::Text))
            .column(ColumnDef::new("pages", SemanticType::Integer).nullable())
            .column(ColumnDef::new("published", SemanticType::DateTime).nullable())
            .column(ColumnDef::new("in_print", SemanticType::Boolean))
            .column(ColumnDef::new("author_id", SemanticType::Integer).nullable())
            .relation(RelationDef::many_to_one("author", authors, "author_id"))
            .build()
            .unwrap()
    });

    fn authors() -> &'static ModelDescriptor {
        &AUTHORS
    }

    fn books() -> &'static ModelDescriptor {
        &BOOKS
    }

    fn sqlite() -> SqlCompiler {
        SqlCompiler::new(DatabaseBackendType::SQLite)
    }

    fn pg() -> SqlCompiler {
        SqlCompiler::new(DatabaseBackendType::PostgreSQL)
    }

    fn mysql() -> SqlCompiler {
        SqlCompiler::new(DatabaseBackendType::MySQL)
    }

    fn filtered(key: &str, value: impl Into<Value>) -> ExpressionTree {
        ExpressionTree::default().with_condition(parse(key, value.into(), books()).unwrap())
    }

    const BOOK_COLUMNS: &str = "\"books\".\"id\", \"books\".\"title\", \"books\".\"pages\", \
         \"books\".\"published\", \"books\".\"in_print\", \"books\".\"author_id\"";

    #[test]
    fn test_select_all() {
        let q = sqlite().compile_select(&ExpressionTree::default(), books());
        assert_eq!(q.sql, format!("SELECT {BOOK_COLUMNS} FROM \"books\""));
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_select_where_order_limit_pg() {
        let tree = filtered("in_print", true)
            .with_ordering(vec![SortKey {
                field: SortField::Column(books().column("id").unwrap()),
                descending: true,
            }])
            .with_window(Window::default().limit(2));
        let q = pg().compile_select(&tree, books());
        assert_eq!(
            q.sql,
            format!(
                "SELECT {BOOK_COLUMNS} FROM \"books\" WHERE \"books\".\"in_print\" = $1 \
                 ORDER BY \"books\".\"id\" DESC LIMIT 2"
            )
        );
        assert_eq!(q.params, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_pg_placeholders_are_numbered_in_order() {
        let tree = filtered("pages__gt", 10).with_condition(parse("title", Value::from("x"), books()).unwrap());
        let q = pg().compile_select(&tree, books());
        assert!(q.sql.contains("\"books\".\"pages\" > $1 AND \"books\".\"title\" = $2"));
        assert_eq!(q.params, vec![Value::Int(10), Value::from("x")]);
    }

    #[test]
    fn test_mysql_quotes_and_binary_exact() {
        let q = mysql().compile_select(&filtered("title", "Dune"), books());
        assert!(q.sql.starts_with("SELECT `books`.`id`"));
        assert!(q.sql.ends_with("WHERE `books`.`title` = CAST(? AS BINARY)"));
    }

    #[test]
    fn test_exact_null_is_is_null() {
        let q = sqlite().compile_select(&filtered("pages", Value::Null), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"pages\" IS NULL"));
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_case_insensitive_lookups_fold_both_sides() {
        let q = sqlite().compile_select(&filtered("title__icontains", "DUNE"), books());
        assert!(q.sql.ends_with("WHERE LOWER(\"books\".\"title\") LIKE LOWER(?) ESCAPE '\\'"));
        assert_eq!(q.params, vec![Value::from("%DUNE%")]);

        let q = pg().compile_select(&filtered("title__iexact", "dune"), books());
        assert!(q.sql.ends_with("WHERE LOWER(\"books\".\"title\") = LOWER($1)"));
    }

    #[test]
    fn test_case_sensitive_patterns_per_dialect() {
        let q = sqlite().compile_select(&filtered("title__startswith", "Du*"), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"title\" GLOB ?"));
        assert_eq!(q.params, vec![Value::from("Du[*]*")]);

        let q = pg().compile_select(&filtered("title__endswith", "50%"), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"title\" LIKE $1 ESCAPE '\\'"));
        assert_eq!(q.params, vec![Value::from("%50\\%")]);

        let q = mysql().compile_select(&filtered("title__contains", "a_b"), books());
        assert!(q.sql.ends_with("WHERE `books`.`title` LIKE CAST(? AS BINARY)"));
        assert_eq!(q.params, vec![Value::from("%a\\_b%")]);
    }

    #[test]
    fn test_in_and_empty_in() {
        let q = sqlite().compile_select(&filtered("id__in", Value::list([1, 2, 3])), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"id\" IN (?, ?, ?)"));
        assert_eq!(q.params.len(), 3);

        let q = sqlite().compile_select(&filtered("id__in", Value::List(vec![])), books());
        assert!(q.sql.ends_with("WHERE 0 = 1"));
    }

    #[test]
    fn test_range_and_isnull() {
        let q = sqlite().compile_select(&filtered("pages__range", (10, 20)), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"pages\" BETWEEN ? AND ?"));
        let q = sqlite().compile_select(&filtered("pages__isnull", false), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"pages\" IS NOT NULL"));
    }

    #[test]
    fn test_datetime_params_are_cast() {
        let q = pg().compile_select(&filtered("published__gte", "2024-01-01 00:00:00"), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"published\" >= CAST($1 AS TIMESTAMP)"));
        let q = sqlite().compile_select(&filtered("published__gte", "2024-01-01 00:00:00"), books());
        assert!(q.sql.ends_with("WHERE \"books\".\"published\" >= ?"));
    }

    #[test]
    fn test_negation_of_nullable_column_keeps_nulls() {
        let cond = parse("pages__gt", Value::from(100), books()).unwrap().negate();
        let tree = ExpressionTree::default().with_condition(cond);
        let q = sqlite().compile_select(&tree, books());
        assert!(q.sql.ends_with(
            "WHERE NOT (\"books\".\"pages\" > ? AND \"books\".\"pages\" IS NOT NULL)"
        ));
    }

    #[test]
    fn test_negation_of_required_column_and_isnull() {
        let cond = parse("title", Value::from("x"), books()).unwrap().negate();
        let q = sqlite().compile_select(&ExpressionTree::default().with_condition(cond), books());
        assert!(q.sql.ends_with("WHERE NOT (\"books\".\"title\" = ?)"));

        let cond = parse("pages__isnull", Value::from(true), books()).unwrap().negate();
        let q = sqlite().compile_select(&ExpressionTree::default().with_condition(cond), books());
        assert!(q.sql.ends_with("WHERE NOT (\"books\".\"pages\" IS NULL)"));
    }

    #[test]
    fn test_many_to_one_filter_is_subquery() {
        let q = sqlite().compile_select(&filtered("author__email__iendswith", "@x.io"), books());
        assert!(q.sql.ends_with(
            "WHERE \"books\".\"author_id\" IN (SELECT \"sub\".\"id\" FROM \"authors\" AS \"sub\" \
             WHERE LOWER(\"sub\".\"email\") LIKE LOWER(?) ESCAPE '\\')"
        ));
        assert_eq!(q.params, vec![Value::from("%@x.io")]);
    }

    #[test]
    fn test_one_to_many_filter_does_not_join() {
        let tree = ExpressionTree::default()
            .with_condition(parse("books__title__startswith", Value::from("D"), authors()).unwrap());
        let q = sqlite().compile_select(&tree, authors());
        assert!(!q.sql.contains("JOIN"));
        assert!(q.sql.ends_with(
            "WHERE \"authors\".\"id\" IN (SELECT \"sub\".\"author_id\" FROM \"books\" AS \"sub\" \
             WHERE \"sub\".\"author_id\" IS NOT NULL AND \"sub\".\"title\" GLOB ?)"
        ));
    }

    #[test]
    fn test_select_related_forward_join() {
        let tree = ExpressionTree::default().with_eager(vec![books().relation("author").unwrap()]);
        let q = sqlite().compile_select(&tree, books());
        assert!(q.sql.contains(
            "\"r_author\".\"id\" AS \"author__id\", \"r_author\".\"email\" AS \"author__email\""
        ));
        assert!(q.sql.ends_with(
            "FROM \"books\" LEFT OUTER JOIN \"authors\" AS \"r_author\" \
             ON \"r_author\".\"id\" = \"books\".\"author_id\""
        ));
    }

    #[test]
    fn test_select_related_one_to_many_uses_no_join() {
        let tree = ExpressionTree::default().with_eager(vec![authors().relation("books").unwrap()]);
        let q = sqlite().compile_select(&tree, authors());
        assert_eq!(q.sql, "SELECT \"authors\".\"id\", \"authors\".\"email\" FROM \"authors\"");

        let rel = authors().relation("books").unwrap();
        let q = pg().compile_eager_many(rel, &[Value::Int(1), Value::Int(2)]).unwrap();
        assert!(q.sql.contains("WHERE \"books\".\"author_id\" IN ($1, $2)"));
        assert!(q.sql.ends_with("ORDER BY \"books\".\"id\" ASC"));
    }

    #[test]
    fn test_offset_without_limit() {
        let tree = ExpressionTree::default().with_window(Window::default().offset(5));
        assert!(sqlite().compile_select(&tree, books()).sql.ends_with(" LIMIT -1 OFFSET 5"));
        assert!(pg().compile_select(&tree, books()).sql.ends_with(" OFFSET 5"));
    }

    #[test]
    fn test_values_projection_and_annotation() {
        let title = books().column("title").unwrap();
        let tree = ExpressionTree::default()
            .with_projection(Projection::Fields(Arc::from(vec![title])))
            .with_annotation(Aggregate::count("id").bind("n", books()).unwrap());
        let q = sqlite().compile_select(&tree, books());
        assert_eq!(
            q.sql,
            "SELECT \"books\".\"title\", COUNT(\"books\".\"id\") AS \"n\" FROM \"books\" \
             GROUP BY \"books\".\"title\""
        );
    }

    #[test]
    fn test_count_plain_and_wrapped() {
        let q = sqlite().compile_count(&filtered("in_print", true), books());
        assert_eq!(
            q.sql,
            "SELECT COUNT(*) AS \"__count\" FROM \"books\" WHERE \"books\".\"in_print\" = ?"
        );

        let tree = filtered("in_print", true).with_window(Window::default().limit(3));
        let q = sqlite().compile_count(&tree, books());
        assert!(q.sql.starts_with("SELECT COUNT(*) AS \"__count\" FROM (SELECT "));
        assert!(q.sql.ends_with(" LIMIT 3) AS \"subquery\""));
    }

    #[test]
    fn test_exists_probe() {
        let q = sqlite().compile_exists(&filtered("in_print", true), books());
        assert_eq!(
            q.sql,
            "SELECT 1 AS \"a\" FROM \"books\" WHERE \"books\".\"in_print\" = ? LIMIT 1"
        );
        let tree = ExpressionTree::default().with_window(Window::default().offset(2));
        let q = sqlite().compile_exists(&tree, books());
        assert!(q.sql.ends_with(" LIMIT 1 OFFSET 2"));
    }

    #[test]
    fn test_aggregate() {
        let aggs = vec![
            Aggregate::count("id").bind("n", books()).unwrap(),
            Aggregate::avg("pages").bind("avg_pages", books()).unwrap(),
        ];
        let q = pg().compile_aggregate(&ExpressionTree::default(), books(), &aggs).unwrap();
        assert_eq!(
            q.sql,
            "SELECT COUNT(\"books\".\"id\") AS \"n\", \
             CAST(AVG(\"books\".\"pages\") AS DOUBLE PRECISION) AS \"avg_pages\" FROM \"books\""
        );
    }

    #[test]
    fn test_aggregate_rejects_unprojected_column_when_wrapped() {
        let title = books().column("title").unwrap();
        let tree = ExpressionTree::default()
            .with_projection(Projection::Fields(Arc::from(vec![title])))
            .with_distinct();
        let aggs = vec![Aggregate::sum("pages").bind("s", books()).unwrap()];
        let err = sqlite().compile_aggregate(&tree, books(), &aggs).unwrap_err();
        assert!(matches!(err, StrataError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_update_params_precede_where() {
        let pages = books().column("pages").unwrap();
        let q = pg()
            .compile_update(&filtered("title", "x"), books(), &[(pages, Value::Int(3))])
            .unwrap();
        assert_eq!(
            q.sql,
            "UPDATE \"books\" SET \"pages\" = $1 WHERE \"books\".\"title\" = $2"
        );
        assert_eq!(q.params, vec![Value::Int(3), Value::from("x")]);
    }

    #[test]
    fn test_delete() {
        let q = sqlite().compile_delete(&ExpressionTree::default(), books());
        assert_eq!(q.sql, "DELETE FROM \"books\"");
    }

    #[test]
    fn test_insert_returning_per_dialect() {
        let title = books().column("title").unwrap();
        let q = sqlite().compile_insert(books(), &[(title, Value::from("Dune"))]);
        assert_eq!(q.sql, "INSERT INTO \"books\" (\"title\") VALUES (?) RETURNING \"id\"");
        let q = mysql().compile_insert(books(), &[(title, Value::from("Dune"))]);
        assert_eq!(q.sql, "INSERT INTO `books` (`title`) VALUES (?)");
        let q = mysql().compile_insert(books(), &[]);
        assert_eq!(q.sql, "INSERT INTO `books` () VALUES ()");
    }

    #[test]
    fn test_empty_set() {
        let q = pg().compile_select(&ExpressionTree::default().emptied(), books());
        assert!(q.sql.ends_with(" WHERE FALSE"));
    }
}
