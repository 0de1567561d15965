//! Catalog introspection behind `/tables`, `/schema` and `/describe`.
//!
//! Everything goes through the simple query protocol as ordinary
//! statements, so these commands are cancellable like any other. Values are
//! inlined as quoted literals.

use crate::handle::QueryOutput;
use std::fmt;

/// Tables, views and materialized views outside the system schemas.
pub const LIST_TABLES: &str = "\
SELECT n.nspname, c.relname, \
CASE c.relkind WHEN 'r' THEN 'table' WHEN 'p' THEN 'table' WHEN 'v' THEN 'view' \
WHEN 'm' THEN 'materialized view' ELSE 'other' END, \
GREATEST(c.reltuples, 0)::bigint \
FROM pg_catalog.pg_class c \
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
WHERE c.relkind IN ('r', 'p', 'v', 'm') \
AND n.nspname NOT IN ('information_schema', 'pg_catalog', 'pg_toast') \
ORDER BY 1, 2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub kind: String,
    /// Planner estimate from `pg_class.reltuples`; 0 when never analyzed.
    pub estimated_rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub foreign_schema: String,
    pub foreign_table: String,
    pub foreign_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub table: TableRef,
    pub kind: String,
    pub comment: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// `schema.table`, with `public` as the default schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn parse(target: &str) -> Option<Self> {
        let (schema, name) = match target.split_once('.') {
            Some((schema, name)) if !name.contains('.') => (schema, name),
            Some(_) => return None,
            None => ("public", target),
        };
        if schema.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// SQL string literal for `value`, valid whatever
/// `standard_conforming_strings` is set to.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Kind and comment of one table.
pub fn table_query(table: &TableRef) -> String {
    let (schema, name) = (quote_literal(&table.schema), quote_literal(&table.name));
    format!(
        "SELECT t.table_type, \
         obj_description(to_regclass(format('%I.%I', t.table_schema, t.table_name)), 'pg_class') \
         FROM information_schema.tables t \
         WHERE t.table_schema = {} AND t.table_name = {}",
        schema, name
    )
}

/// Columns in ordinal order, with a primary key flag.
pub fn columns_query(table: &TableRef) -> String {
    let (schema, name) = (quote_literal(&table.schema), quote_literal(&table.name));
    format!(
        "SELECT c.column_name, c.data_type, c.is_nullable, c.column_default, \
         EXISTS (SELECT 1 FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage k \
         ON k.constraint_name = tc.constraint_name AND k.table_schema = tc.table_schema \
         AND k.table_name = tc.table_name \
         WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = c.table_schema \
         AND tc.table_name = c.table_name AND k.column_name = c.column_name) \
         FROM information_schema.columns c \
         WHERE c.table_schema = {} AND c.table_name = {} \
         ORDER BY c.ordinal_position",
        schema, name
    )
}

pub fn foreign_keys_query(table: &TableRef) -> String {
    let (schema, name) = (quote_literal(&table.schema), quote_literal(&table.name));
    format!(
        "SELECT kcu.column_name, ccu.table_schema, ccu.table_name, ccu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
         ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         JOIN information_schema.constraint_column_usage ccu \
         ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
         WHERE tc.constraint_type = 'FOREIGN KEY' \
         AND tc.table_schema = {} AND tc.table_name = {} \
         ORDER BY kcu.column_name",
        schema, name
    )
}

fn text(row: &[Option<String>], idx: usize) -> String {
    row.get(idx).cloned().flatten().unwrap_or_default()
}

fn non_empty(row: &[Option<String>], idx: usize) -> Option<String> {
    row.get(idx).cloned().flatten().filter(|s| !s.is_empty())
}

pub fn parse_tables(output: &QueryOutput) -> Vec<TableInfo> {
    output
        .rows
        .iter()
        .map(|row| TableInfo {
            schema: text(row, 0),
            name: text(row, 1),
            kind: text(row, 2),
            estimated_rows: text(row, 3).parse().unwrap_or(0),
        })
        .collect()
}

/// Kind and comment from [`table_query`]; `None` when the table does not exist.
pub fn parse_table(output: &QueryOutput) -> Option<(String, Option<String>)> {
    let row = output.rows.first()?;
    let kind = match text(row, 0).as_str() {
        "BASE TABLE" => "table".to_string(),
        other => other.to_lowercase(),
    };
    Some((kind, non_empty(row, 1)))
}

pub fn parse_columns(output: &QueryOutput) -> Vec<ColumnInfo> {
    output
        .rows
        .iter()
        .map(|row| ColumnInfo {
            name: text(row, 0),
            data_type: text(row, 1),
            nullable: text(row, 2) == "YES",
            default: non_empty(row, 3),
            primary_key: text(row, 4) == "t",
        })
        .collect()
}

pub fn parse_foreign_keys(output: &QueryOutput) -> Vec<ForeignKey> {
    output
        .rows
        .iter()
        .map(|row| ForeignKey {
            column: text(row, 0),
            foreign_schema: text(row, 1),
            foreign_table: text(row, 2),
            foreign_column: text(row, 3),
        })
        .collect()
}
