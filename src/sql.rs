use sqlparser::ast::{
    self, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectNamePart, SelectItem,
    SetExpr, Statement, TableFactor, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// Parsed command from SQL input.
///
/// The surface is deliberately tiny: one procedure call that performs the
/// atomic reservation, and the read views. There is no INSERT — admitting a
/// booking any other way would reopen the read-then-write race the
/// procedure exists to close.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `SELECT reserve(date, group_size, student_ids [, key])`
    Reserve {
        key: Option<Ulid>,
        date: String,
        group_size: u32,
        student_ids: String,
    },
    /// `SELECT * FROM slot_usage [WHERE date = '...']`
    SelectSlotUsage { date: Option<String> },
    /// `SELECT * FROM bookings [WHERE date = '...']` — always returned in
    /// `created_at` order regardless of any ORDER BY.
    SelectBookings { date: Option<String> },
    /// `SELECT has_booking(identifier)`
    HasBooking { identifier: String },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Query(query) => parse_select(query),
        Statement::Insert(_) | Statement::Delete(_) => Err(SqlError::Unsupported(
            "bookings are created through reserve() and never deleted".into(),
        )),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return parse_procedure_call(select);
    }

    let table = table_factor_name(&select.from[0].relation)?;
    let date = extract_date_filter(&select.selection)?;

    match table.as_str() {
        "slot_usage" => Ok(Command::SelectSlotUsage { date }),
        "bookings" => Ok(Command::SelectBookings { date }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Parse `SELECT fn(args...)` — the procedure-call form.
fn parse_procedure_call(select: &ast::Select) -> Result<Command, SqlError> {
    if select.projection.len() != 1 {
        return Err(SqlError::Unsupported(
            "expected a single procedure call".into(),
        ));
    }
    let expr = match &select.projection[0] {
        SelectItem::UnnamedExpr(expr) => expr,
        SelectItem::ExprWithAlias { expr, .. } => expr,
        _ => return Err(SqlError::Unsupported("expected a procedure call".into())),
    };
    let func = match expr {
        Expr::Function(f) => f,
        _ => return Err(SqlError::Unsupported("expected a procedure call".into())),
    };
    let name = object_name_last(&func.name)
        .ok_or_else(|| SqlError::Parse("empty function name".into()))?;
    let args = function_args(func)?;

    match name.as_str() {
        "reserve" => {
            if args.len() < 3 || args.len() > 4 {
                return Err(SqlError::WrongArity("reserve", 3, args.len()));
            }
            let key = if args.len() == 4 {
                parse_ulid_or_null(args[3])?
            } else {
                None
            };
            Ok(Command::Reserve {
                key,
                date: parse_str_expr(args[0])?,
                group_size: parse_u32_expr(args[1])?,
                student_ids: parse_str_expr(args[2])?,
            })
        }
        "has_booking" => {
            if args.len() != 1 {
                return Err(SqlError::WrongArity("has_booking", 1, args.len()));
            }
            Ok(Command::HasBooking {
                identifier: parse_str_expr(args[0])?,
            })
        }
        _ => Err(SqlError::UnknownFunction(name)),
    }
}

/// Accept only `date = '...'` (or no filter at all) on the read views.
fn extract_date_filter(selection: &Option<Expr>) -> Result<Option<String>, SqlError> {
    let Some(sel) = selection else {
        return Ok(None);
    };
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("date") => {
            Ok(Some(parse_str_expr(right)?))
        }
        _ => Err(SqlError::Unsupported(
            "only `date = '...'` filters are supported".into(),
        )),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn function_args(func: &ast::Function) -> Result<Vec<&Expr>, SqlError> {
    let list = match &func.args {
        FunctionArguments::List(list) => list,
        FunctionArguments::None => return Ok(Vec::new()),
        FunctionArguments::Subquery(_) => {
            return Err(SqlError::Unsupported("subquery argument".into()));
        }
    };
    list.args
        .iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e),
            _ => Err(SqlError::Parse("expected plain positional argument".into())),
        })
        .collect()
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

fn parse_str_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!(
            "expected non-negative integer, got {expr:?}"
        )))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?,
            )),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownFunction(String),
    WrongArity(&'static str, usize, usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownFunction(name) => write!(f, "unknown function: {name}"),
            SqlError::WrongArity(what, expected, got) => {
                write!(f, "{what}: expected {expected} arguments, got {got}")
            }
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reserve() {
        let sql = "SELECT reserve('December 2', 3, '12345678, 87654321, 11223344')";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::Reserve {
                key: None,
                date: "December 2".into(),
                group_size: 3,
                student_ids: "12345678, 87654321, 11223344".into(),
            }
        );
    }

    #[test]
    fn parse_reserve_with_idempotency_key() {
        let sql = "SELECT reserve('December 4', 1, '12345678', '01ARZ3NDEKTSV4RRFFQ69G5FAV')";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::Reserve { key, date, .. } => {
                assert_eq!(key.unwrap().to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
                assert_eq!(date, "December 4");
            }
            _ => panic!("expected Reserve, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_reserve_null_key_means_no_key() {
        // Extended-protocol clients bind NULL for an absent key.
        let cmd = parse_sql("SELECT reserve('December 2', 1, '12345678', NULL)").unwrap();
        match cmd {
            Command::Reserve { key, .. } => assert!(key.is_none()),
            _ => panic!("expected Reserve, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_reserve_wrong_arity() {
        assert!(matches!(
            parse_sql("SELECT reserve('December 2')"),
            Err(SqlError::WrongArity("reserve", 3, 1))
        ));
        assert!(matches!(
            parse_sql("SELECT reserve('a', 1, 'x', 'k', 'extra')"),
            Err(SqlError::WrongArity("reserve", 3, 5))
        ));
    }

    #[test]
    fn parse_reserve_quoted_group_size() {
        // Extended-protocol parameters arrive as quoted strings.
        let cmd = parse_sql("SELECT reserve('December 2', '2', '12345678')").unwrap();
        match cmd {
            Command::Reserve { group_size, .. } => assert_eq!(group_size, 2),
            _ => panic!("expected Reserve, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_reserve_bad_group_size() {
        assert!(parse_sql("SELECT reserve('December 2', 'two', 'x')").is_err());
        assert!(parse_sql("SELECT reserve('December 2', -1, 'x')").is_err());
    }

    #[test]
    fn parse_has_booking() {
        let cmd = parse_sql("SELECT has_booking('12345678')").unwrap();
        assert_eq!(
            cmd,
            Command::HasBooking {
                identifier: "12345678".into()
            }
        );
    }

    #[test]
    fn parse_unknown_function_errors() {
        assert!(matches!(
            parse_sql("SELECT book_everything('now')"),
            Err(SqlError::UnknownFunction(_))
        ));
    }

    #[test]
    fn parse_slot_usage() {
        let cmd = parse_sql("SELECT * FROM slot_usage").unwrap();
        assert_eq!(cmd, Command::SelectSlotUsage { date: None });
    }

    #[test]
    fn parse_slot_usage_with_date() {
        let cmd = parse_sql("SELECT * FROM slot_usage WHERE date = 'December 2'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectSlotUsage {
                date: Some("December 2".into())
            }
        );
    }

    #[test]
    fn parse_bookings() {
        let cmd = parse_sql("SELECT * FROM bookings").unwrap();
        assert_eq!(cmd, Command::SelectBookings { date: None });
    }

    #[test]
    fn parse_bookings_with_date_and_order() {
        // ORDER BY is tolerated; results are created_at-ordered regardless.
        let cmd =
            parse_sql("SELECT * FROM bookings WHERE date = 'December 4' ORDER BY created_at")
                .unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookings {
                date: Some("December 4".into())
            }
        );
    }

    #[test]
    fn parse_unsupported_filter_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE group_size = 2"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM students"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_insert_rejected() {
        let sql = "INSERT INTO bookings (date, group_size) VALUES ('December 2', 1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_delete_rejected() {
        let sql = "DELETE FROM bookings WHERE date = 'December 2'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
