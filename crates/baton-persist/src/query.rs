// Typed SQL builder over a closed set of predicates.
// Values never reach the SQL text; they travel as numbered parameters.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue};

use crate::{PersistError, PersistResult};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Text(value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Text(text) => ToSqlOutput::from(text.as_str()),
            SqlValue::Integer(value) => ToSqlOutput::Owned(SqliteValue::Integer(*value)),
            SqlValue::Real(value) => ToSqlOutput::Owned(SqliteValue::Real(*value)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, SqlValue),
    Neq(String, SqlValue),
    Lt(String, SqlValue),
    Lte(String, SqlValue),
    Gt(String, SqlValue),
    Gte(String, SqlValue),
    In(String, Vec<SqlValue>),
    Like(String, String),
    IsNull(String),
    IsNotNull(String),
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<SqlValue>) -> Self {
        Predicate::Eq(column.to_string(), value.into())
    }

    pub fn neq(column: &str, value: impl Into<SqlValue>) -> Self {
        Predicate::Neq(column.to_string(), value.into())
    }

    pub fn gte(column: &str, value: impl Into<SqlValue>) -> Self {
        Predicate::Gte(column.to_string(), value.into())
    }

    pub fn is_in<V: Into<SqlValue>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    fn compile(&self, params: &mut Vec<SqlValue>) -> PersistResult<String> {
        match self {
            Predicate::Eq(column, SqlValue::Null) => {
                validate_identifier(column)?;
                Ok(format!("{column} IS NULL"))
            }
            Predicate::Neq(column, SqlValue::Null) => {
                validate_identifier(column)?;
                Ok(format!("{column} IS NOT NULL"))
            }
            Predicate::Eq(column, value) => comparison(column, "=", value, params),
            Predicate::Neq(column, value) => comparison(column, "!=", value, params),
            Predicate::Lt(column, value) => comparison(column, "<", value, params),
            Predicate::Lte(column, value) => comparison(column, "<=", value, params),
            Predicate::Gt(column, value) => comparison(column, ">", value, params),
            Predicate::Gte(column, value) => comparison(column, ">=", value, params),
            Predicate::Like(column, pattern) => {
                comparison(column, "LIKE", &SqlValue::Text(pattern.clone()), params)
            }
            Predicate::In(column, values) => {
                validate_identifier(column)?;
                if values.is_empty() {
                    return Ok("1 = 0".to_string());
                }
                let mut placeholders = Vec::with_capacity(values.len());
                for value in values {
                    params.push(value.clone());
                    placeholders.push(format!("?{}", params.len()));
                }
                Ok(format!("{column} IN ({})", placeholders.join(", ")))
            }
            Predicate::IsNull(column) => {
                validate_identifier(column)?;
                Ok(format!("{column} IS NULL"))
            }
            Predicate::IsNotNull(column) => {
                validate_identifier(column)?;
                Ok(format!("{column} IS NOT NULL"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone)]
pub struct SelectQuery {
    table: String,
    columns: Vec<String>,
    predicates: Vec<Predicate>,
    order_by: Vec<(String, Order)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectQuery {
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            predicates: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order_by.push((column.to_string(), order));
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

    /// Inclusive row window, `range(0, 9)` selects the first ten rows.
    pub fn range(self, start: u64, end: u64) -> Self {
        self.limit(end.saturating_sub(start) + 1).offset(start)
    }

    pub fn compile(&self) -> PersistResult<CompiledQuery> {
        validate_table(&self.table)?;
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            for column in &self.columns {
                validate_identifier(column)?;
            }
            self.columns.join(", ")
        };

        let mut params = Vec::new();
        let mut sql = format!("SELECT {columns} FROM {}", self.table);
        push_where(&mut sql, &self.predicates, &mut params)?;
        if !self.order_by.is_empty() {
            let mut terms = Vec::with_capacity(self.order_by.len());
            for (column, order) in &self.order_by {
                validate_identifier(column)?;
                let direction = match order {
                    Order::Asc => "ASC",
                    Order::Desc => "DESC",
                };
                terms.push(format!("{column} {direction}"));
            }
            sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            // sqlite only accepts OFFSET after LIMIT
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        Ok(CompiledQuery { sql, params })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateQuery {
    table: String,
    assignments: Vec<(String, SqlValue)>,
    predicates: Vec<Predicate>,
}

impl UpdateQuery {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            assignments: Vec::new(),
            predicates: Vec::new(),
        }
    }

    pub fn set(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.assignments.push((column.to_string(), value.into()));
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Unfiltered updates are rejected; every update targets explicit rows.
    pub fn compile(&self) -> PersistResult<CompiledQuery> {
        validate_table(&self.table)?;
        if self.assignments.is_empty() {
            return Err(PersistError::InvalidQuery(
                "update without assignments".to_string(),
            ));
        }
        if self.predicates.is_empty() {
            return Err(PersistError::InvalidQuery(
                "update without a filter".to_string(),
            ));
        }
        let mut params = Vec::with_capacity(self.assignments.len());
        let mut sets = Vec::with_capacity(self.assignments.len());
        for (column, value) in &self.assignments {
            validate_identifier(column)?;
            params.push(value.clone());
            sets.push(format!("{column} = ?{}", params.len()));
        }
        let mut sql = format!("UPDATE {} SET {}", self.table, sets.join(", "));
        push_where(&mut sql, &self.predicates, &mut params)?;
        Ok(CompiledQuery { sql, params })
    }
}

fn comparison(
    column: &str,
    op: &str,
    value: &SqlValue,
    params: &mut Vec<SqlValue>,
) -> PersistResult<String> {
    validate_identifier(column)?;
    params.push(value.clone());
    Ok(format!("{column} {op} ?{}", params.len()))
}

fn push_where(
    sql: &mut String,
    predicates: &[Predicate],
    params: &mut Vec<SqlValue>,
) -> PersistResult<()> {
    if predicates.is_empty() {
        return Ok(());
    }
    let mut clauses = Vec::with_capacity(predicates.len());
    for predicate in predicates {
        clauses.push(predicate.compile(params)?);
    }
    sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    Ok(())
}

fn validate_identifier(name: &str) -> PersistResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(PersistError::InvalidIdentifier(name.to_string()))
    }
}

// schema-qualified names (`schema.table`) are allowed for tables only
fn validate_table(name: &str) -> PersistResult<()> {
    let mut parts = name.split('.');
    let (Some(first), second, None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(PersistError::InvalidIdentifier(name.to_string()));
    };
    validate_identifier(first).map_err(|_| PersistError::InvalidIdentifier(name.to_string()))?;
    if let Some(second) = second {
        validate_identifier(second)
            .map_err(|_| PersistError::InvalidIdentifier(name.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_numbers_parameters_in_clause_order() {
        let query = SelectQuery::from("agent_runs")
            .columns(&["agent_run_id", "status"])
            .filter(Predicate::eq("status", "running"))
            .filter(Predicate::is_in("thread_id", ["t1", "t2"]))
            .filter(Predicate::IsNull("completed_at".to_string()))
            .order_by("started_at", Order::Desc)
            .range(10, 19)
            .compile()
            .expect("compile");
        assert_eq!(
            query.sql,
            "SELECT agent_run_id, status FROM agent_runs WHERE status = ?1 AND thread_id IN (?2, ?3) AND completed_at IS NULL ORDER BY started_at DESC LIMIT 10 OFFSET 10"
        );
        assert_eq!(
            query.params,
            vec![
                SqlValue::from("running"),
                SqlValue::from("t1"),
                SqlValue::from("t2")
            ]
        );
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let query = SelectQuery::from("agent_runs")
            .filter(Predicate::In("status".to_string(), Vec::new()))
            .compile()
            .expect("compile");
        assert_eq!(query.sql, "SELECT * FROM agent_runs WHERE 1 = 0");
        assert!(query.params.is_empty());
    }

    #[test]
    fn null_equality_compiles_to_null_checks() {
        let query = SelectQuery::from("agent_runs")
            .filter(Predicate::eq("error", SqlValue::Null))
            .filter(Predicate::neq("completed_at", SqlValue::Null))
            .compile()
            .expect("compile");
        assert_eq!(
            query.sql,
            "SELECT * FROM agent_runs WHERE error IS NULL AND completed_at IS NOT NULL"
        );
    }

    #[test]
    fn update_places_set_params_before_filter_params() {
        let query = UpdateQuery::table("agent_runs")
            .set("status", "failed")
            .set("error", "boom")
            .filter(Predicate::eq("agent_run_id", "r1"))
            .compile()
            .expect("compile");
        assert_eq!(
            query.sql,
            "UPDATE agent_runs SET status = ?1, error = ?2 WHERE agent_run_id = ?3"
        );
        assert_eq!(query.params[2], SqlValue::from("r1"));
    }

    #[test]
    fn update_without_filter_is_rejected() {
        let err = UpdateQuery::table("agent_runs")
            .set("status", "failed")
            .compile()
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidQuery(_)));
    }

    #[test]
    fn injected_identifiers_are_rejected() {
        let err = SelectQuery::from("agent_runs")
            .filter(Predicate::eq("status; DROP TABLE agent_runs", "x"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidIdentifier(_)));

        assert!(SelectQuery::from("public.agent_runs").compile().is_ok());
        assert!(SelectQuery::from("a.b.c").compile().is_err());
    }
}
