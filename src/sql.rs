use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{AvailabilityQuery, ReserveRequest};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        /// Generated when the statement leaves it out.
        id: Option<Ulid>,
        name: Option<String>,
        is_bookable: bool,
    },
    SetBookable {
        id: Ulid,
        is_bookable: bool,
    },
    InsertWindow {
        id: Option<Ulid>,
        resource_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: u32,
    },
    DeleteWindow {
        id: Ulid,
    },
    /// Values stay raw; the engine validates them.
    InsertReservation {
        request: ReserveRequest,
        returning: bool,
    },
    SelectAvailability {
        query: AvailabilityQuery,
    },
    SelectResources,
    SelectWindows {
        resource_id: Ulid,
    },
    SelectReservations {
        resource_id: Ulid,
        date: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "is_bookable"];
const WINDOW_COLUMNS: &[&str] = &["id", "resource_id", "day_of_week", "start_time", "end_time", "capacity"];
const RESERVATION_COLUMNS: &[&str] = &["resource_id", "customer_id", "start_datetime", "end_datetime"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = match table.as_str() {
        "resources" => RESOURCE_COLUMNS,
        "windows" => WINDOW_COLUMNS,
        "reservations" => RESERVATION_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, defaults)?;

    match table.as_str() {
        "resources" => Ok(Command::InsertResource {
            id: row.get("id").copied().map(parse_ulid_or_null).transpose()?.flatten(),
            name: row.get("name").copied().map(parse_text_or_null).transpose()?.flatten(),
            is_bookable: row.get("is_bookable").copied().map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "windows" => {
            let day = parse_i64(required(&row, "day_of_week")?)?;
            Ok(Command::InsertWindow {
                id: row.get("id").copied().map(parse_ulid_or_null).transpose()?.flatten(),
                resource_id: parse_ulid(required(&row, "resource_id")?)?,
                day_of_week: u8::try_from(day)
                    .ok()
                    .filter(|d| *d <= 6)
                    .ok_or_else(|| SqlError::Parse(format!("day_of_week {day} not in 0..6")))?,
                start_time: parse_time(required(&row, "start_time")?)?,
                end_time: parse_time(required(&row, "end_time")?)?,
                capacity: parse_u32(required(&row, "capacity")?)?,
            })
        }
        _ => {
            let text = |col: &str| -> Result<Option<String>, SqlError> {
                Ok(row.get(col).copied().map(parse_text_or_null).transpose()?.flatten())
            };
            Ok(Command::InsertReservation {
                request: ReserveRequest {
                    resource_id: text("resource_id")?,
                    customer_id: text("customer_id")?,
                    start_datetime: text("start_datetime")?,
                    end_datetime: text("end_datetime")?,
                },
                returning: insert.returning.is_some(),
            })
        }
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "resources" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut is_bookable = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        };
        match column.as_deref() {
            Some("is_bookable") => is_bookable = Some(parse_bool(&assignment.value)?),
            Some(other) => return Err(SqlError::Unsupported(format!("cannot update column {other}"))),
            None => return Err(SqlError::Parse("unsupported assignment target".into())),
        }
    }
    Ok(Command::SetBookable {
        id,
        is_bookable: is_bookable.ok_or(SqlError::Parse("SET is_bookable required".into()))?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "windows" => Ok(Command::DeleteWindow { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &'static str| filters.get(col).copied().ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            query: AvailabilityQuery {
                resource_id: filters.get("resource_id").copied().map(parse_text_or_null).transpose()?.flatten(),
                date: filters.get("date").copied().map(parse_text_or_null).transpose()?.flatten(),
            },
        }),
        "resources" => Ok(Command::SelectResources),
        "windows" => Ok(Command::SelectWindows {
            resource_id: parse_ulid(filter("resource_id")?)?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            resource_id: parse_ulid(filter("resource_id")?)?,
            date: parse_date(filter("date")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms of an AND chain, by lower-cased column name.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref());
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row keyed by column. Without a column list, values are
/// taken positionally against `defaults`.
fn insert_row<'a>(insert: &'a ast::Insert, defaults: &[&str]) -> Result<HashMap<String, &'a Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    for col in &columns {
        if !defaults.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(col.clone()));
        }
    }
    Ok(columns.into_iter().zip(row.iter()).collect())
}

fn required<'a>(row: &HashMap<String, &'a Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(col).copied().ok_or(SqlError::MissingColumn(col))
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal behind an expression, looking through casts like `'09:00'::time`.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(SqlError::Parse(format!("expected text, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match parse_text_or_null(expr)? {
        None => Ok(None),
        Some(s) => Ulid::from_string(&s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|_| SqlError::Parse(format!("bad time {s:?}, expected HH:MM[:SS]")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_insert_resource() {
        let sql = format!("INSERT INTO resources (id, name, is_bookable) VALUES ('{ID}', 'Table 4', false)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource {
                id: Some(id()),
                name: Some("Table 4".into()),
                is_bookable: false,
            }
        );
    }

    #[test]
    fn parse_insert_resource_defaults() {
        let cmd = parse_sql("INSERT INTO resources (name) VALUES ('Room A')").unwrap();
        assert_eq!(
            cmd,
            Command::InsertResource {
                id: None,
                name: Some("Room A".into()),
                is_bookable: true,
            }
        );
    }

    #[test]
    fn parse_insert_resource_positional() {
        let sql = format!("INSERT INTO resources VALUES ('{ID}', NULL, 't')");
        match parse_sql(&sql).unwrap() {
            Command::InsertResource { id: rid, name, is_bookable } => {
                assert_eq!(rid, Some(id()));
                assert_eq!(name, None);
                assert!(is_bookable);
            }
            other => panic!("expected InsertResource, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_bookable() {
        let sql = format!("UPDATE resources SET is_bookable = false WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetBookable {
                id: id(),
                is_bookable: false
            }
        );
        let other_column = format!("UPDATE resources SET name = 'x' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&other_column), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_insert_window() {
        let sql = format!(
            "INSERT INTO windows (resource_id, day_of_week, start_time, end_time, capacity) \
             VALUES ('{ID}', 1, '09:00', '17:30:00', 4)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertWindow {
                id: None,
                resource_id: id(),
                day_of_week: 1,
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(17, 30, 0).unwrap(),
                capacity: 4,
            }
        );
    }

    #[test]
    fn parse_insert_window_rejects_bad_day() {
        let sql = format!(
            "INSERT INTO windows (resource_id, day_of_week, start_time, end_time, capacity) \
             VALUES ('{ID}', 7, '09:00', '17:00', 1)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_window_missing_column() {
        let sql = format!("INSERT INTO windows (resource_id, day_of_week) VALUES ('{ID}', 1)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("start_time"))));
    }

    #[test]
    fn parse_delete_window() {
        let sql = format!("DELETE FROM windows WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteWindow { id: id() });
    }

    #[test]
    fn parse_insert_reservation_keeps_raw_values() {
        let sql = format!(
            "INSERT INTO reservations (resource_id, customer_id, start_datetime, end_datetime) \
             VALUES ('{ID}', 'cust-1', '2024-01-01T09:00:00', '2024-01-01T10:00:00') RETURNING *"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertReservation {
                request: ReserveRequest {
                    resource_id: Some(ID.into()),
                    customer_id: Some("cust-1".into()),
                    start_datetime: Some("2024-01-01T09:00:00".into()),
                    end_datetime: Some("2024-01-01T10:00:00".into()),
                },
                returning: true,
            }
        );
    }

    #[test]
    fn parse_insert_reservation_partial_columns() {
        // Missing values reach the engine, which reports them.
        let sql = format!("INSERT INTO reservations (resource_id, customer_id) VALUES ('{ID}', NULL)");
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { request, returning } => {
                assert_eq!(request.resource_id.as_deref(), Some(ID));
                assert_eq!(request.customer_id, None);
                assert_eq!(request.start_datetime, None);
                assert!(!returning);
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE resource_id = '{ID}' AND date = '2024-01-01'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                query: AvailabilityQuery {
                    resource_id: Some(ID.into()),
                    date: Some("2024-01-01".into()),
                }
            }
        );
    }

    #[test]
    fn parse_select_availability_without_date() {
        let sql = format!("SELECT * FROM availability WHERE resource_id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::SelectAvailability { query } => assert_eq!(query.date, None),
            other => panic!("expected SelectAvailability, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_listings() {
        assert_eq!(parse_sql("SELECT * FROM resources").unwrap(), Command::SelectResources);

        let sql = format!("SELECT * FROM windows WHERE resource_id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectWindows { resource_id: id() });

        let sql = format!("SELECT * FROM reservations WHERE resource_id = '{ID}' AND date = '2024-01-01'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations {
                resource_id: id(),
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            }
        );

        assert!(matches!(
            parse_sql("SELECT * FROM windows"),
            Err(SqlError::MissingFilter("resource_id"))
        ));
    }

    #[test]
    fn parse_rejects_range_filters() {
        let sql = format!("SELECT * FROM availability WHERE resource_id = '{ID}' AND date >= '2024-01-01'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(
            parse_sql("INSERT INTO resources (colour) VALUES ('red')"),
            Err(SqlError::UnknownColumn(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEC nonsense"), Err(SqlError::Parse(_))));
    }
}
