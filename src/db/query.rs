use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;
use std::error::Error as StdError;
use std::fmt::Write;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Row};
use uuid::Uuid;

/// How a failed statement is reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// A referenced table, column, function or schema does not exist.
    UnknownRelation,
    /// The statement is malformed.
    Syntax,
    /// Constraint violations, type mismatches, timeouts, lost connections.
    Other,
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionErrorKind::UnknownRelation => write!(f, "Unknown Relation"),
            ExecutionErrorKind::Syntax => write!(f, "Syntax Error"),
            ExecutionErrorKind::Other => write!(f, "Execution Error"),
        }
    }
}

/// A failed statement with the context PostgreSQL sent back.
///
/// `Display` is the server's message, verbatim.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    /// SQLSTATE code (e.g. "42P01"), empty when the failure never reached the server
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based byte offset into the statement
    pub position: Option<u32>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub line: Option<usize>,
    pub col: Option<usize>,
}

impl ExecutionError {
    pub fn from_pg_error(err: &tokio_postgres::Error, query: &str) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            let message = db_err.message().to_string();
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            let (line, col) = match position {
                Some(pos) => byte_offset_to_line_col(query, pos as usize),
                None => (None, None),
            };

            ExecutionError {
                kind: classify(&code, &message),
                code,
                message,
                detail: db_err.detail().map(|s| s.to_string()),
                hint: db_err.hint().map(|s| s.to_string()),
                position,
                table: db_err.table().map(|s| s.to_string()),
                column: db_err.column().map(|s| s.to_string()),
                line,
                col,
            }
        } else {
            // Closed connection, I/O, protocol errors
            let mut message = err.to_string();
            if let Some(source) = err.source() {
                let _ = write!(message, ": {}", source);
            }
            ExecutionError {
                kind: ExecutionErrorKind::Other,
                ..Self::from_message(message)
            }
        }
    }

    /// Build an error from a bare message, classified by its wording.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        ExecutionError {
            kind: classify("", &message),
            code: String::new(),
            message,
            detail: None,
            hint: None,
            position: None,
            table: None,
            column: None,
            line: None,
            col: None,
        }
    }

    /// Multi-line rendering for terminal output.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.kind, self.message)];

        if let (Some(line), Some(col)) = (self.line, self.col) {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }
        match (&self.table, &self.column) {
            (Some(table), Some(column)) => lines.push(format!("  Object: {}.{}", table, column)),
            (Some(table), None) => lines.push(format!("  Table: {}", table)),
            _ => {}
        }

        lines.join("\n")
    }
}

/// SQLSTATE first, message wording only when no code is available.
pub fn classify(code: &str, message: &str) -> ExecutionErrorKind {
    classify_sqlstate(code).unwrap_or_else(|| classify_message(message))
}

fn classify_sqlstate(code: &str) -> Option<ExecutionErrorKind> {
    match code {
        "" => None,
        // undefined_table, undefined_column, undefined_function, undefined_object,
        // invalid_schema_name
        "42P01" | "42703" | "42883" | "42704" | "3F000" => {
            Some(ExecutionErrorKind::UnknownRelation)
        }
        // syntax_error, syntax_error_or_access_rule_violation
        "42601" | "42000" => Some(ExecutionErrorKind::Syntax),
        _ => Some(ExecutionErrorKind::Other),
    }
}

fn classify_message(message: &str) -> ExecutionErrorKind {
    let lower = message.to_lowercase();
    if (lower.contains("relation") || lower.contains("column")) && lower.contains("does not exist")
    {
        ExecutionErrorKind::UnknownRelation
    } else if lower.contains("syntax error") {
        ExecutionErrorKind::Syntax
    } else {
        ExecutionErrorKind::Other
    }
}

/// Convert a 1-based byte offset in a query string to (line, column) both 1-based.
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || query.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(query.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(Decimal),
    Uuid(Uuid),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<CellValue>),
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Numeric(d) => d.to_string(),
            CellValue::Uuid(u) => u.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display()).collect();
                format!("{{{}}}", items.join(", "))
            }
            CellValue::Unknown(s) => s.clone(),
        }
    }

    pub fn display_width(&self) -> usize {
        unicode_width::UnicodeWidthStr::width(self.display().as_str())
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    pub execution_time: Duration,
    pub affected_rows: Option<u64>,
    pub error: Option<ExecutionError>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: vec![],
            rows: vec![],
            row_count: 0,
            execution_time: Duration::ZERO,
            affected_rows: None,
            error: None,
        }
    }

    pub fn error(err: ExecutionError, execution_time: Duration) -> Self {
        Self {
            execution_time,
            error: Some(err),
            ..Self::empty()
        }
    }

    /// Build a successful result from column names and rows, mostly for fakes and tests.
    pub fn from_rows(columns: &[&str], rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|name| ColumnInfo {
                    name: name.to_string(),
                    type_name: String::new(),
                })
                .collect(),
            row_count: rows.len(),
            rows,
            ..Self::empty()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Split into the rows or the execution failure.
    pub fn into_outcome(mut self) -> Result<QueryResult, ExecutionError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Whether `sql` yields a row set: queries, SHOW/EXPLAIN, and DML with RETURNING.
///
/// Anything the parser cannot read goes through `query` too, which keeps any
/// rows it returns and only loses the affected-row count.
fn returns_rows(sql: &str) -> bool {
    let Ok(statements) = SqlParser::parse_sql(&PostgreSqlDialect {}, sql) else {
        return true;
    };
    let [statement] = statements.as_slice() else {
        return true;
    };
    match statement {
        Statement::Query(_)
        | Statement::Explain { .. }
        | Statement::ExplainTable { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowTables { .. } => true,
        Statement::Insert(insert) => insert.returning.is_some(),
        Statement::Update { returning, .. } => returning.is_some(),
        Statement::Delete(delete) => delete.returning.is_some(),
        _ => false,
    }
}

/// Run one statement. Database failures come back inside the result, never as `Err`.
pub async fn execute_query(client: &Client, sql: &str) -> QueryResult {
    let start = Instant::now();
    let sql_trimmed = sql.trim().trim_end_matches(';').trim_end();

    if returns_rows(sql_trimmed) {
        match client.query(sql_trimmed, &[]).await {
            Ok(rows) => parse_rows(&rows, start.elapsed()),
            Err(e) => QueryResult::error(
                ExecutionError::from_pg_error(&e, sql_trimmed),
                start.elapsed(),
            ),
        }
    } else {
        match client.execute(sql_trimmed, &[]).await {
            Ok(affected) => QueryResult {
                execution_time: start.elapsed(),
                affected_rows: Some(affected),
                ..QueryResult::empty()
            },
            Err(e) => QueryResult::error(
                ExecutionError::from_pg_error(&e, sql_trimmed),
                start.elapsed(),
            ),
        }
    }
}

fn parse_rows(rows: &[Row], execution_time: Duration) -> QueryResult {
    let Some(first_row) = rows.first() else {
        return QueryResult {
            execution_time,
            ..QueryResult::empty()
        };
    };

    let columns: Vec<ColumnInfo> = first_row
        .columns()
        .iter()
        .map(|col| ColumnInfo {
            name: col.name().to_string(),
            type_name: col.type_().name().to_string(),
        })
        .collect();

    let result_rows: Vec<Vec<CellValue>> = rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(i, col)| extract_value(row, i, col.type_()))
                .collect()
        })
        .collect();

    QueryResult {
        columns,
        row_count: result_rows.len(),
        rows: result_rows,
        execution_time,
        affected_rows: None,
        error: None,
    }
}

/// Accepts any type, to tell a NULL from a value nothing here can decode.
struct RawValue;

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, _raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawValue)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int16)
            .unwrap_or(CellValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int32)
            .unwrap_or(CellValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int64)
            .unwrap_or(CellValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float32)
            .unwrap_or(CellValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float64)
            .unwrap_or(CellValue::Null),
        Type::NUMERIC => match row.try_get::<_, Option<Decimal>>(idx) {
            Ok(Some(d)) => CellValue::Numeric(d),
            Ok(None) => CellValue::Null,
            // NaN, infinities, or more digits than Decimal holds
            Err(_) => CellValue::Unknown(format!("[{}]", pg_type.name())),
        },
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Json)
            .unwrap_or(CellValue::Null),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<Option<String>>>>(idx)
            .ok()
            .flatten()
            .map(|items| {
                CellValue::Array(
                    items
                        .into_iter()
                        .map(|v| v.map(CellValue::Text).unwrap_or(CellValue::Null))
                        .collect(),
                )
            })
            .unwrap_or(CellValue::Null),
        Type::INT4_ARRAY => row
            .try_get::<_, Option<Vec<Option<i32>>>>(idx)
            .ok()
            .flatten()
            .map(|items| {
                CellValue::Array(
                    items
                        .into_iter()
                        .map(|v| v.map(CellValue::Int32).unwrap_or(CellValue::Null))
                        .collect(),
                )
            })
            .unwrap_or(CellValue::Null),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<Option<i64>>>>(idx)
            .ok()
            .flatten()
            .map(|items| {
                CellValue::Array(
                    items
                        .into_iter()
                        .map(|v| v.map(CellValue::Int64).unwrap_or(CellValue::Null))
                        .collect(),
                )
            })
            .unwrap_or(CellValue::Null),
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Uuid)
            .unwrap_or(CellValue::Null),
        _ => {
            // Fallback: text-like types (citext, enums) decode as strings
            match row.try_get::<_, Option<String>>(idx) {
                Ok(Some(s)) => CellValue::Text(s),
                Ok(None) => CellValue::Null,
                Err(_) => match row.try_get::<_, Option<RawValue>>(idx) {
                    Ok(Some(_)) => CellValue::Unknown(format!("[{}]", pg_type.name())),
                    _ => CellValue::Null,
                },
            }
        }
    }
}
