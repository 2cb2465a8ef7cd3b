use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::Timestamp;

/// Parsed command from SQL input.
///
/// Identifiers stay as text: malformed ids are reported by the engine as
/// invalid input rather than as syntax errors.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        name: String,
    },
    InsertReservation {
        resource_id: String,
        start: Timestamp,
        end: Timestamp,
    },
    SelectResources {
        filter: ResourceFilter,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    Health,
}

#[derive(Debug, PartialEq)]
pub enum ResourceFilter {
    All,
    ById(String),
    NamePrefix(String),
}

#[derive(Debug, PartialEq)]
pub enum ReservationFilter {
    All,
    ByResource(String),
    ById(String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        many => {
            return Err(SqlError::Unsupported(format!(
                "{} statements in one query; send them separately",
                many.len()
            )));
        }
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        Statement::Delete(_) => Err(SqlError::Unsupported("DELETE: rows cannot be removed".into())),
        Statement::Update { .. } => Err(SqlError::Unsupported("UPDATE: rows are immutable".into())),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resources" => {
            let [name] = bind_columns("resources", &["name"], &insert.columns, &values)?;
            Ok(Command::InsertResource {
                name: parse_string_expr(name)?,
            })
        }
        "reservations" => {
            let [resource_id, start, end] =
                bind_columns("reservations", &["resource_id", "start", "end"], &insert.columns, &values)?;
            Ok(Command::InsertReservation {
                resource_id: parse_string_expr(resource_id)?,
                start: parse_i64_expr(start)?,
                end: parse_i64_expr(end)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Order INSERT values as `table_columns`. With a column list the values are
/// matched by name; without one they are taken in table order.
fn bind_columns<'a, const N: usize>(
    table: &'static str,
    table_columns: &[&str; N],
    columns: &[ast::Ident],
    values: &'a [Expr],
) -> Result<[&'a Expr; N], SqlError> {
    if !columns.is_empty() && columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "INSERT has {} target columns but {} expressions",
            columns.len(),
            values.len()
        )));
    }
    if values.len() != N {
        return Err(SqlError::WrongArity(table, N, values.len()));
    }
    if columns.is_empty() {
        return Ok(std::array::from_fn(|i| &values[i]));
    }

    let mut bound: [Option<&Expr>; N] = [None; N];
    for (column, value) in columns.iter().zip(values) {
        let name = column.value.to_lowercase();
        let slot = table_columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| SqlError::Parse(format!("column {name:?} of {table} does not exist")))?;
        if bound[slot].replace(value).is_some() {
            return Err(SqlError::Parse(format!("column {name:?} specified more than once")));
        }
    }
    let mut out = [&values[0]; N];
    for (i, value) in bound.into_iter().enumerate() {
        out[i] = value.ok_or_else(|| SqlError::Parse(format!("column {:?} is missing", table_columns[i])))?;
    }
    Ok(out)
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
    let selection = select.selection.as_ref();

    match table.as_str() {
        "resources" => {
            let filter = match selection {
                None => ResourceFilter::All,
                Some(expr) => match single_filter(expr)? {
                    (col, Filter::Eq(id)) if col == "id" => ResourceFilter::ById(id),
                    (col, Filter::Like(pattern)) if col == "name" => {
                        ResourceFilter::NamePrefix(like_prefix(&pattern)?)
                    }
                    (col, _) => return Err(SqlError::Unsupported(format!("filter on resources.{col}"))),
                },
            };
            Ok(Command::SelectResources { filter })
        }
        "reservations" => {
            let filter = match selection {
                None => ReservationFilter::All,
                Some(expr) => match single_filter(expr)? {
                    (col, Filter::Eq(id)) if col == "id" => ReservationFilter::ById(id),
                    (col, Filter::Eq(id)) if col == "resource_id" => ReservationFilter::ByResource(id),
                    (col, _) => return Err(SqlError::Unsupported(format!("filter on reservations.{col}"))),
                },
            };
            Ok(Command::SelectReservations { filter })
        }
        "health" => Ok(Command::Health),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

enum Filter {
    Eq(String),
    Like(String),
}

/// A WHERE clause made of exactly one `column = 'v'` or `column LIKE 'p'`.
fn single_filter(expr: &Expr) -> Result<(String, Filter), SqlError> {
    match expr {
        Expr::Nested(inner) => single_filter(inner),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse("expected column = value".into()))?;
            Ok((col, Filter::Eq(parse_string_expr(right)?)))
        }
        Expr::Like {
            negated: false,
            expr,
            pattern,
            ..
        } => {
            let col = expr_column_name(expr).ok_or_else(|| SqlError::Parse("expected column LIKE pattern".into()))?;
            Ok((col, Filter::Like(parse_string_expr(pattern)?)))
        }
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

/// Turn a LIKE pattern into the literal prefix it matches. Only a single
/// trailing `%` is accepted; `\` escapes a literal `%` or `_`.
fn like_prefix(pattern: &str) -> Result<String, SqlError> {
    let mut prefix = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    let mut terminated = false;
    while let Some(c) = chars.next() {
        if terminated {
            return Err(SqlError::Parse(format!("LIKE {pattern:?}: '%' must be last")));
        }
        match c {
            '\\' => match chars.next() {
                Some(escaped) => prefix.push(escaped),
                None => return Err(SqlError::Parse(format!("LIKE {pattern:?}: dangling escape"))),
            },
            '%' => terminated = true,
            '_' => return Err(SqlError::Parse(format!("LIKE {pattern:?}: '_' wildcard not supported"))),
            c => prefix.push(c),
        }
    }
    if !terminated {
        return Err(SqlError::Parse(format!("LIKE {pattern:?}: expected a trailing '%'")));
    }
    if prefix.is_empty() {
        return Err(SqlError::Parse("LIKE prefix must not be empty".into()));
    }
    Ok(prefix)
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!("multi-row INSERT ({} rows)", rows.len()))),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("timestamp out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
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
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) => "42601",
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
        }
    }
}
