//! Statement parsing for the in-memory backend.
//!
//! Transaction control is recognised by keyword, since its spelling differs
//! between dialects. Data statements go through `sqlparser`.

use serde_json::{Number, Value};
use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use crate::connection::{ConnectionError, ConnectionResult};

/// A statement the in-memory backend can apply.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MemoryStatement {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
    /// Session settings (`SET ...`, `PRAGMA ...`), accepted and ignored.
    Session,
    CreateTable(String),
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Delete {
        table: String,
        filter: Option<(String, Value)>,
    },
}

/// Parse one statement.
pub(crate) fn parse(sql: &str) -> ConnectionResult<MemoryStatement> {
    let sql = sql.trim().trim_end_matches(';').trim();
    if sql.is_empty() {
        return Err(ConnectionError::Syntax("empty statement".into()));
    }

    let words: Vec<&str> = sql.split_whitespace().collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();
    let upper: Vec<&str> = upper.iter().map(String::as_str).collect();
    if let Some(statement) = parse_control(&words, &upper) {
        return Ok(statement);
    }

    let dialect = GenericDialect {};
    let statements = SqlParser::parse_sql(&dialect, sql)?;
    let [statement] = statements.as_slice() else {
        return Err(ConnectionError::Syntax(
            "expected exactly one statement".into(),
        ));
    };

    match statement {
        sp::Statement::CreateTable(create) => {
            Ok(MemoryStatement::CreateTable(extract_table_name(&create.name)?))
        }
        sp::Statement::Insert(insert) => convert_insert(insert),
        sp::Statement::Delete(delete) => convert_delete(delete),
        other => Err(ConnectionError::Unsupported(other.to_string())),
    }
}

fn parse_control(words: &[&str], upper: &[&str]) -> Option<MemoryStatement> {
    // The savepoint name is always the last word; keep its original case.
    let last = || words.last().map(|w| w.to_string()).unwrap_or_default();

    let statement = match upper {
        ["BEGIN", ..] | ["START", "TRANSACTION", ..] => MemoryStatement::Begin,
        ["COMMIT", ..] | ["END", ..] => MemoryStatement::Commit,
        ["ROLLBACK", "TO", "SAVEPOINT", _] | ["ROLLBACK", "TO", _] => {
            MemoryStatement::RollbackTo(last())
        }
        ["ROLLBACK", "TRANSACTION" | "TRAN", _] => MemoryStatement::RollbackTo(last()),
        ["ROLLBACK"] | ["ROLLBACK", "TRANSACTION" | "TRAN" | "WORK"] => {
            MemoryStatement::Rollback
        }
        ["SAVEPOINT", _] | ["SAVE", "TRANSACTION" | "TRAN", _] => {
            MemoryStatement::Savepoint(last())
        }
        ["RELEASE", "SAVEPOINT", _] | ["RELEASE", _] => MemoryStatement::Release(last()),
        ["SET", ..] | ["PRAGMA", ..] => MemoryStatement::Session,
        _ => return None,
    };
    Some(statement)
}

fn convert_insert(insert: &sp::Insert) -> ConnectionResult<MemoryStatement> {
    let table = match &insert.table {
        sp::TableObject::TableName(name) => extract_table_name(name)?,
        sp::TableObject::TableFunction(_) => {
            return Err(ConnectionError::Unsupported(
                "table function not supported".into(),
            ))
        }
    };

    if insert.columns.is_empty() {
        return Err(ConnectionError::Unsupported(
            "INSERT requires a column list".into(),
        ));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

    let rows = match insert.source.as_ref().map(|s| s.body.as_ref()) {
        Some(sp::SetExpr::Values(sp::Values { rows, .. })) => rows
            .iter()
            .map(|row| row.iter().map(convert_expr).collect::<ConnectionResult<Vec<_>>>())
            .collect::<ConnectionResult<Vec<_>>>()?,
        _ => {
            return Err(ConnectionError::Unsupported(
                "INSERT ... SELECT not supported".into(),
            ))
        }
    };

    if let Some(row) = rows.iter().find(|row| row.len() != columns.len()) {
        return Err(ConnectionError::Syntax(format!(
            "expected {} values, got {}",
            columns.len(),
            row.len()
        )));
    }

    Ok(MemoryStatement::Insert {
        table,
        columns,
        rows,
    })
}

fn convert_delete(delete: &sp::Delete) -> ConnectionResult<MemoryStatement> {
    let tables = match &delete.from {
        sp::FromTable::WithFromKeyword(tables) => tables,
        sp::FromTable::WithoutKeyword(tables) => tables,
    };
    let [from] = tables.as_slice() else {
        return Err(ConnectionError::Unsupported(
            "DELETE from multiple tables not supported".into(),
        ));
    };
    let table = match &from.relation {
        sp::TableFactor::Table { name, .. } => extract_table_name(name)?,
        other => {
            return Err(ConnectionError::Unsupported(format!(
                "unsupported DELETE target: {}",
                other
            )))
        }
    };

    let filter = match &delete.selection {
        None => None,
        Some(sp::Expr::BinaryOp {
            left,
            op: sp::BinaryOperator::Eq,
            right,
        }) => match left.as_ref() {
            sp::Expr::Identifier(column) => Some((column.value.clone(), convert_expr(right)?)),
            other => {
                return Err(ConnectionError::Unsupported(format!(
                    "unsupported DELETE filter column: {}",
                    other
                )))
            }
        },
        Some(other) => {
            return Err(ConnectionError::Unsupported(format!(
                "only `column = literal` filters are supported, got {}",
                other
            )))
        }
    };

    Ok(MemoryStatement::Delete { table, filter })
}

fn convert_expr(expr: &sp::Expr) -> ConnectionResult<Value> {
    match expr {
        sp::Expr::Value(v) => convert_value(v),
        sp::Expr::UnaryOp {
            op: sp::UnaryOperator::Minus,
            expr,
        } => match convert_expr(expr)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(-i))
                } else {
                    let f = n.as_f64().unwrap_or_default();
                    Ok(Number::from_f64(-f).map(Value::Number).unwrap_or(Value::Null))
                }
            }
            other => Err(ConnectionError::Unsupported(format!(
                "cannot negate {}",
                other
            ))),
        },
        sp::Expr::Nested(inner) => convert_expr(inner),
        other => Err(ConnectionError::Unsupported(format!(
            "only literal values are supported, got {}",
            other
        ))),
    }
}

fn convert_value(v: &sp::ValueWithSpan) -> ConnectionResult<Value> {
    match &v.value {
        sp::Value::Null => Ok(Value::Null),
        sp::Value::Boolean(b) => Ok(Value::Bool(*b)),
        sp::Value::Number(s, _) => {
            if let Ok(i) = s.parse::<i64>() {
                Ok(Value::from(i))
            } else if let Some(n) = s.parse::<f64>().ok().and_then(Number::from_f64) {
                Ok(Value::Number(n))
            } else {
                Err(ConnectionError::Syntax(format!("invalid number: {}", s)))
            }
        }
        sp::Value::SingleQuotedString(s) => Ok(Value::String(s.clone())),
        sp::Value::DoubleQuotedString(s) => Ok(Value::String(s.clone())),
        other => Err(ConnectionError::Unsupported(format!(
            "unsupported value: {:?}",
            other
        ))),
    }
}

fn extract_table_name(name: &sp::ObjectName) -> ConnectionResult<String> {
    // Use just the table name, ignoring schema
    name.0
        .last()
        .map(|i| i.as_ident().map(|id| id.value.clone()).unwrap_or_else(|| i.to_string()))
        .ok_or_else(|| ConnectionError::Syntax("empty table name".into()))
}
