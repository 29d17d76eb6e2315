use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_IN_CLAUSE_IDS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        category: Option<String>,
        seats: u32,
        status: ResourceStatus,
    },
    UpdateResourceStatus {
        id: Ulid,
        status: ResourceStatus,
    },
    InsertRequester {
        id: Ulid,
        name: Option<String>,
    },
    InsertReservation {
        id: Ulid,
        requester_id: Ulid,
        resource_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    CancelReservation {
        id: Ulid,
        requester_id: Option<Ulid>,
    },
    CompleteReservation {
        id: Ulid,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAvailableResources {
        start: Ms,
        end: Ms,
        filter: ResourceFilter,
    },
    SelectResources,
    SelectReservation {
        id: Ulid,
    },
    SelectReservationsByRequester {
        requester_id: Ulid,
        status: Option<ReservationStatus>,
    },
    SelectReservationsByResource {
        resource_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Parse a simple-query string that may hold several `;`-separated
/// statements. Every statement must parse before any of them runs.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let commands = split_statements(sql)
        .into_iter()
        .map(parse_sql)
        .collect::<Result<Vec<_>, _>>()?;
    if commands.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(commands)
}

/// Split on `;` outside quoted strings and identifiers, dropping empty pieces.
fn split_statements(sql: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut quote = None;
    let mut begin = 0;
    for (i, c) in sql.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ';') => {
                pieces.push(&sql[begin..i]);
                begin = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&sql[begin..]);
    pieces.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Parse exactly one statement.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel: channel.to_string() });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("one statement expected".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(&table.relation, assignments, selection.as_ref())
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resources" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("resources", 3, values.len()));
            }
            let status = match values.get(3) {
                Some(v) => parse_resource_status(v)?,
                None => ResourceStatus::Available,
            };
            Ok(Command::InsertResource {
                id: parse_ulid_expr(&values[0])?,
                category: parse_string_or_null(&values[1])?,
                seats: parse_u32(&values[2])?,
                status,
            })
        }
        "requesters" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("requesters", 1, 0));
            }
            let name = match values.get(1) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertRequester { id: parse_ulid_expr(&values[0])?, name })
        }
        "reservations" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("reservations", 5, values.len()));
            }
            Ok(Command::InsertReservation {
                id: parse_ulid_expr(&values[0])?,
                requester_id: parse_ulid_expr(&values[1])?,
                resource_id: parse_ulid_expr(&values[2])?,
                start: parse_i64_or_null(&values[3])?,
                end: parse_i64_or_null(&values[4])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let status = assignments
        .iter()
        .find(|a| assignment_column(&a.target).as_deref() == Some("status"))
        .map(|a| parse_string_expr(&a.value))
        .transpose()?
        .ok_or(SqlError::Unsupported("UPDATE must set status".into()))?;

    let mut preds = Vec::new();
    if let Some(selection) = selection {
        collect_predicates(selection, &mut preds)?;
    }
    let id = find_pred(&preds, "id", Op::Eq).ok_or(SqlError::MissingFilter("id"))?;
    let id = parse_ulid_expr(id)?;

    match table.as_str() {
        "resources" => Ok(Command::UpdateResourceStatus {
            id,
            status: status.parse::<ResourceStatus>().map_err(SqlError::Parse)?,
        }),
        "reservations" => {
            let status: ReservationStatus = status.parse().map_err(SqlError::Parse)?;
            match status {
                ReservationStatus::Cancelled => Ok(Command::CancelReservation {
                    id,
                    requester_id: find_pred(&preds, "requester_id", Op::Eq)
                        .map(parse_ulid_expr)
                        .transpose()?,
                }),
                ReservationStatus::Completed => Ok(Command::CompleteReservation { id }),
                ReservationStatus::Active => Err(SqlError::Unsupported(
                    "reservations can only be set to CANCELLED or COMPLETED".into(),
                )),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }
    let window = |preds: &[Predicate]| -> Result<(Ms, Ms), SqlError> {
        let start = find_pred(preds, "start", Op::GtEq).ok_or(SqlError::MissingFilter("start"))?;
        let end = find_pred(preds, "end", Op::LtEq).ok_or(SqlError::MissingFilter("end"))?;
        Ok((parse_i64_expr(start)?, parse_i64_expr(end)?))
    };

    match table.as_str() {
        "availability" => {
            let resource_id = find_pred(&preds, "resource_id", Op::Eq)
                .ok_or(SqlError::MissingFilter("resource_id"))?;
            let (start, end) = window(&preds)?;
            Ok(Command::SelectAvailability {
                resource_id: parse_ulid_expr(resource_id)?,
                start,
                end,
            })
        }
        "available_resources" => {
            let (start, end) = window(&preds)?;
            let ids = preds.iter().find_map(|p| match p {
                Predicate::InList { column, values } if column == "id" => Some(values),
                _ => None,
            });
            let ids = match ids {
                Some(values) => {
                    if values.len() > MAX_IN_CLAUSE_IDS {
                        return Err(SqlError::LimitExceeded("too many ids in IN list"));
                    }
                    Some(values.iter().map(parse_ulid_expr).collect::<Result<Vec<_>, _>>()?)
                }
                None => find_pred(&preds, "id", Op::Eq)
                    .map(|e| parse_ulid_expr(e).map(|id| vec![id]))
                    .transpose()?,
            };
            let filter = ResourceFilter {
                ids,
                min_seats: find_pred(&preds, "seats", Op::GtEq).map(parse_u32).transpose()?,
                category: find_pred(&preds, "category", Op::Eq)
                    .map(parse_string_expr)
                    .transpose()?,
            };
            Ok(Command::SelectAvailableResources { start, end, filter })
        }
        "resources" => Ok(Command::SelectResources),
        "reservations" => {
            if let Some(id) = find_pred(&preds, "id", Op::Eq) {
                return Ok(Command::SelectReservation { id: parse_ulid_expr(id)? });
            }
            if let Some(requester) = find_pred(&preds, "requester_id", Op::Eq) {
                let status = find_pred(&preds, "status", Op::Eq)
                    .map(|e| {
                        parse_string_expr(e)?
                            .parse::<ReservationStatus>()
                            .map_err(SqlError::Parse)
                    })
                    .transpose()?;
                return Ok(Command::SelectReservationsByRequester {
                    requester_id: parse_ulid_expr(requester)?,
                    status,
                });
            }
            if let Some(resource) = find_pred(&preds, "resource_id", Op::Eq) {
                return Ok(Command::SelectReservationsByResource {
                    resource_id: parse_ulid_expr(resource)?,
                });
            }
            Err(SqlError::MissingFilter("requester_id or resource_id"))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

enum Predicate {
    Compare { column: String, op: Op, value: Expr },
    InList { column: String, values: Vec<Expr> },
}

/// Flatten a conjunction of `col <op> value` / `col IN (...)` terms.
fn collect_predicates(expr: &Expr, out: &mut Vec<Predicate>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out)?,
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Predicate::Compare { column, op, value: (**right).clone() });
        }
        Expr::InList { expr, list, negated: false } => {
            let column = expr_column_name(expr)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {expr}")))?;
            out.push(Predicate::InList { column, values: list.clone() });
        }
        other => return Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
    Ok(())
}

fn find_pred<'a>(preds: &'a [Predicate], name: &str, wanted: Op) -> Option<&'a Expr> {
    preds.iter().find_map(|p| match p {
        Predicate::Compare { column, op, value } if column == name && *op == wanted => Some(value),
        _ => None,
    })
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(target: &AssignmentTarget) -> Option<String> {
    match target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_resource_status(expr: &Expr) -> Result<ResourceStatus, SqlError> {
    parse_string_expr(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64_expr(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::LimitExceeded(what) => write!(f, "limit exceeded: {what}"),
        }
    }
}

impl std::error::Error for SqlError {}
