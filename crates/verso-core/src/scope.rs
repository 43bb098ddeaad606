//! Read modes and query compilation.
//!
//! Every read carries an explicit [`ReadMode`] deciding which versions it
//! sees. A [`Query`] is an owned value built per call; compiling it against a
//! [`Schema`] yields SQL fragments with bound parameters.

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::error::{VersoError, VersoResult};
use crate::schema::{quote, FieldType, Schema, COLUMN_MODEL_ID, COLUMN_VERSION};
use crate::types::{Filter, FilterCondition, FilterOperator, FilterTranslator};

/// Which versions a read may see.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReadMode {
    /// Only current rows.
    #[default]
    Current,
    /// Current and archived rows.
    WithHistory,
    /// Only archived rows.
    OnlyHistory,
}

impl ReadMode {
    /// SQL predicate implied by the mode, if any.
    pub fn predicate(&self) -> Option<&'static str> {
        match self {
            ReadMode::Current => Some("\"is_current\" = 1"),
            ReadMode::WithHistory => None,
            ReadMode::OnlyHistory => Some("\"is_current\" = 0"),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// A read request against one versioned table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    mode: ReadMode,
    filter: Option<Filter>,
    order: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Query {
    /// Query in the given read mode.
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Only current rows.
    pub fn current() -> Self {
        Self::new(ReadMode::Current)
    }

    /// Current and archived rows.
    pub fn with_history() -> Self {
        Self::new(ReadMode::WithHistory)
    }

    /// Only archived rows.
    pub fn only_history() -> Self {
        Self::new(ReadMode::OnlyHistory)
    }

    /// Add a filter; repeated calls are ANDed together.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and_also(filter),
            None => filter,
        });
        self
    }

    /// Append a sort key.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Compile against a schema. Unknown column names are rejected.
    pub fn compile(&self, schema: &Schema) -> VersoResult<CompiledQuery> {
        let mut clauses: Vec<String> =
            self.mode.predicate().into_iter().map(String::from).collect();
        let mut params = Vec::new();

        if let Some(filter) = &self.filter {
            let (sql, filter_params) = SqlTranslator::new(schema).translate(filter)?;
            clauses.push(sql);
            params = filter_params;
        }

        let where_clause = if clauses.is_empty() {
            "1".to_string()
        } else {
            clauses.join(" AND ")
        };

        let order_clause = if self.order.is_empty() {
            format!(
                "{} ASC, {} ASC",
                quote(COLUMN_MODEL_ID),
                quote(COLUMN_VERSION)
            )
        } else {
            self.order
                .iter()
                .map(|(field, direction)| {
                    schema
                        .column_type(field)
                        .ok_or_else(|| VersoError::unknown_field(schema.table(), field))?;
                    Ok(format!("{} {}", quote(field), direction))
                })
                .collect::<VersoResult<Vec<_>>>()?
                .join(", ")
        };

        let limit = self.limit.map(|n| sql_bound("limit", n)).transpose()?;
        let offset = self.offset.map(|n| sql_bound("offset", n)).transpose()?;
        let limit_clause = match (limit, offset) {
            (None, None) => String::new(),
            (Some(limit), None) => format!("LIMIT {}", limit),
            (Some(limit), Some(offset)) => format!("LIMIT {} OFFSET {}", limit, offset),
            (None, Some(offset)) => format!("LIMIT -1 OFFSET {}", offset),
        };

        Ok(CompiledQuery {
            where_clause,
            order_clause,
            limit_clause,
            params,
        })
    }
}

/// SQLite takes `LIMIT`/`OFFSET` as signed 64-bit integers.
fn sql_bound(name: &str, value: u64) -> VersoResult<i64> {
    i64::try_from(value).map_err(|_| {
        VersoError::validation(format!("{} {} exceeds {}", name, value, i64::MAX))
    })
}

/// SQL fragments produced from a [`Query`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub where_clause: String,
    pub order_clause: String,
    pub limit_clause: String,
    pub params: Vec<SqlValue>,
}

impl CompiledQuery {
    /// Full `SELECT` over the schema's columns.
    pub fn select_sql(&self, schema: &Schema) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} {}",
            schema.select_columns(),
            schema.quoted_table(),
            self.where_clause,
            self.order_clause,
            self.limit_clause
        )
        .trim_end()
        .to_string()
    }

    /// `SELECT COUNT(*)` honouring limit and offset.
    pub fn count_sql(&self, schema: &Schema) -> String {
        format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} ORDER BY {} {})",
            schema.quoted_table(),
            self.where_clause,
            self.order_clause,
            self.limit_clause
        )
    }
}

/// Translates [`Filter`] trees into SQLite `WHERE` fragments.
pub struct SqlTranslator<'a> {
    schema: &'a Schema,
}

impl<'a> SqlTranslator<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    fn condition(&self, condition: &FilterCondition) -> VersoResult<(String, Vec<SqlValue>)> {
        let field = condition.field.as_str();
        let field_type = self
            .schema
            .column_type(field)
            .ok_or_else(|| VersoError::unknown_field(self.schema.table(), field))?;
        let column = quote(field);
        let bind = |value: &Value| bind_value(field_type, field, value);

        let translated = match &condition.operator {
            FilterOperator::Eq(Value::Null) => (format!("{} IS NULL", column), vec![]),
            FilterOperator::Ne(Value::Null) => (format!("{} IS NOT NULL", column), vec![]),
            FilterOperator::Eq(v) => (format!("{} = ?", column), vec![bind(v)?]),
            FilterOperator::Ne(v) => (format!("{} IS NOT ?", column), vec![bind(v)?]),
            FilterOperator::Gt(v) => (format!("{} > ?", column), vec![bind(v)?]),
            FilterOperator::Gte(v) => (format!("{} >= ?", column), vec![bind(v)?]),
            FilterOperator::Lt(v) => (format!("{} < ?", column), vec![bind(v)?]),
            FilterOperator::Lte(v) => (format!("{} <= ?", column), vec![bind(v)?]),
            FilterOperator::In(values) | FilterOperator::Nin(values) if values.is_empty() => {
                // IN () never matches, NOT IN () always does
                let always = matches!(condition.operator, FilterOperator::Nin(_));
                (if always { "1" } else { "0" }.to_string(), vec![])
            }
            FilterOperator::In(values) => (
                format!("{} IN ({})", column, placeholders(values.len())),
                values.iter().map(bind).collect::<VersoResult<Vec<_>>>()?,
            ),
            FilterOperator::Nin(values) => (
                format!("{} NOT IN ({})", column, placeholders(values.len())),
                values.iter().map(bind).collect::<VersoResult<Vec<_>>>()?,
            ),
            FilterOperator::Contains(needle) => (
                format!("instr({}, ?) > 0", column),
                vec![SqlValue::Text(needle.clone())],
            ),
            FilterOperator::Icontains(needle) => (
                format!("instr(lower({}), lower(?)) > 0", column),
                vec![SqlValue::Text(needle.clone())],
            ),
            FilterOperator::Between { min, max } => (
                format!("{} BETWEEN ? AND ?", column),
                vec![bind(min)?, bind(max)?],
            ),
            FilterOperator::IsNull => (format!("{} IS NULL", column), vec![]),
            FilterOperator::IsNotNull => (format!("{} IS NOT NULL", column), vec![]),
        };

        Ok(translated)
    }

    fn join(
        &self,
        filters: &[Filter],
        separator: &str,
        empty: &str,
    ) -> VersoResult<(String, Vec<SqlValue>)> {
        if filters.is_empty() {
            return Ok((empty.to_string(), vec![]));
        }

        let mut parts = Vec::with_capacity(filters.len());
        let mut params = Vec::new();
        for filter in filters {
            let (sql, filter_params) = self.translate(filter)?;
            parts.push(sql);
            params.extend(filter_params);
        }
        Ok((format!("({})", parts.join(separator)), params))
    }
}

impl FilterTranslator for SqlTranslator<'_> {
    type Output = (String, Vec<SqlValue>);
    type Error = VersoError;

    fn translate(&self, filter: &Filter) -> Result<Self::Output, Self::Error> {
        match filter {
            Filter::Condition(condition) => self.condition(condition),
            Filter::And(filters) => self.join(filters, " AND ", "1"),
            Filter::Or(filters) => self.join(filters, " OR ", "0"),
            Filter::Not(inner) => {
                let (sql, params) = self.translate(inner)?;
                Ok((format!("NOT ({})", sql), params))
            }
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Bind a filter operand with the column's storage type.
///
/// Timestamps and model ids are compared as stored, so a string operand is
/// accepted for any text column and a number for any numeric one.
fn bind_value(field_type: FieldType, field: &str, value: &Value) -> VersoResult<SqlValue> {
    match (field_type, value) {
        (FieldType::Json, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
        (FieldType::Real, Value::Number(n)) if n.is_i64() => {
            Ok(SqlValue::Real(n.as_f64().unwrap_or_default()))
        }
        _ => field_type.to_sql(field, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::schema::COLUMN_IS_CURRENT;
    use serde_json::json;

    fn widgets() -> Schema {
        Schema::new("widgets")
            .required_field("name", FieldType::Text)
            .field("price", FieldType::Real)
            .field("stock", FieldType::Integer)
    }

    #[test]
    fn test_read_mode_predicates() {
        let schema = widgets();
        assert_eq!(
            Query::current().compile(&schema).unwrap().where_clause,
            "\"is_current\" = 1"
        );
        assert_eq!(
            Query::only_history().compile(&schema).unwrap().where_clause,
            "\"is_current\" = 0"
        );
        assert_eq!(
            Query::with_history().compile(&schema).unwrap().where_clause,
            "1"
        );
        assert_eq!(ReadMode::default(), ReadMode::Current);
    }

    #[test]
    fn test_default_order() {
        let compiled = Query::current().compile(&widgets()).unwrap();
        assert_eq!(compiled.order_clause, "\"model_id\" ASC, \"version\" ASC");
        assert!(compiled.limit_clause.is_empty());
    }

    #[test]
    fn test_filters_compile_with_bound_params() {
        let query = Query::with_history()
            .filter(Filter::eq("name", "A"))
            .filter(Filter::between("price", 1, 5.5))
            .order_by("version", Direction::Desc)
            .limit(10)
            .offset(5);
        let compiled = query.compile(&widgets()).unwrap();

        assert_eq!(
            compiled.where_clause,
            "(\"name\" = ? AND \"price\" BETWEEN ? AND ?)"
        );
        assert_eq!(
            compiled.params,
            vec![
                SqlValue::Text("A".into()),
                SqlValue::Real(1.0),
                SqlValue::Real(5.5)
            ]
        );
        assert_eq!(compiled.order_clause, "\"version\" DESC");
        assert_eq!(compiled.limit_clause, "LIMIT 10 OFFSET 5");
    }

    #[test]
    fn test_null_and_empty_list_operators() {
        let schema = widgets();
        let translator = SqlTranslator::new(&schema);

        let (sql, params) = translator.translate(&Filter::eq("stock", Value::Null)).unwrap();
        assert_eq!(sql, "\"stock\" IS NULL");
        assert!(params.is_empty());

        let (sql, _) = translator.translate(&Filter::in_list("stock", vec![])).unwrap();
        assert_eq!(sql, "0");
        let (sql, _) = translator
            .translate(&Filter::not_in_list("stock", vec![]))
            .unwrap();
        assert_eq!(sql, "1");

        let (sql, params) = translator
            .translate(&Filter::in_list("stock", vec![json!(1), json!(2)]))
            .unwrap();
        assert_eq!(sql, "\"stock\" IN (?, ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_or_not_and_contains() {
        let schema = widgets();
        let filter = Filter::or(vec![
            Filter::icontains("name", "wid"),
            Filter::not(Filter::contains("name", "x")),
        ]);
        let (sql, params) = SqlTranslator::new(&schema).translate(&filter).unwrap();
        assert_eq!(
            sql,
            "(instr(lower(\"name\"), lower(?)) > 0 OR NOT (instr(\"name\", ?) > 0))"
        );
        assert_eq!(params.len(), 2);
        assert_eq!(
            SqlTranslator::new(&schema)
                .translate(&Filter::or(vec![]))
                .unwrap()
                .0,
            "0"
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let schema = widgets();
        let err = Query::current()
            .filter(Filter::eq("colour", "red"))
            .compile(&schema)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValUnknownField);

        let err = Query::current()
            .order_by("colour", Direction::Asc)
            .compile(&schema)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValUnknownField);
    }

    #[test]
    fn test_bookkeeping_columns_are_filterable() {
        let compiled = Query::with_history()
            .filter(Filter::eq("model_id", 7))
            .filter(Filter::eq(COLUMN_IS_CURRENT, false))
            .compile(&widgets())
            .unwrap();
        assert_eq!(
            compiled.params,
            vec![SqlValue::Integer(7), SqlValue::Integer(0)]
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let compiled = Query::current().offset(3).compile(&widgets()).unwrap();
        assert_eq!(compiled.limit_clause, "LIMIT -1 OFFSET 3");
    }

    #[test]
    fn test_oversized_paging_is_rejected() {
        let err = Query::current()
            .limit(u64::MAX)
            .compile(&widgets())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValInvalidInput);

        let err = Query::current()
            .offset(i64::MAX as u64 + 1)
            .compile(&widgets())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValInvalidInput);

        let compiled = Query::current()
            .limit(i64::MAX as u64)
            .compile(&widgets())
            .unwrap();
        assert_eq!(compiled.limit_clause, format!("LIMIT {}", i64::MAX));
    }

    #[test]
    fn test_compiled_sql_runs() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let schema = widgets();
        conn.execute_batch(&schema.create_table_sql()).unwrap();

        let compiled = Query::with_history()
            .filter(Filter::gte("stock", 1))
            .compile(&schema)
            .unwrap();
        let mut stmt = conn.prepare(&compiled.select_sql(&schema)).unwrap();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(compiled.params.iter()), |_| Ok(()))
            .unwrap()
            .count();
        assert_eq!(rows, 0);

        let count: i64 = conn
            .query_row(
                &compiled.count_sql(&schema),
                rusqlite::params_from_iter(compiled.params.iter()),
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }
}
