//! Compiles [`Filter`] expressions into SQL against a resolved bucket schema.
//!
//! The logical `_id` attribute may be backed by two physical columns. In
//! [`IdState::Split`] every reference to it expands into an `OR` over both
//! columns, so a comparison matches whichever column holds the row's value.
//! Wide values always exceed legacy values, which makes
//! `COALESCE(_id, _idx)` order rows by creation.

use rusqlite::types::Value as SqlValue;

use crate::catalog::{
    BucketSchema, IdState, PropertyType, ETAG_COLUMN, KEY_COLUMN, MTIME_COLUMN,
};
use crate::filter::{CompareOp, Filter};
use crate::query::options::{Sort, SortOrder};
use crate::storage::sql::quote_ident;
use crate::types::ident::is_representable;
use crate::types::{BucketError, IdColumn, Result};

/// SQL boolean expression plus its positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    /// Expression text using `?` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attribute<'a> {
    Identifier,
    Column { name: &'a str, kind: PropertyType },
}

fn attribute<'a>(schema: &BucketSchema, name: &'a str) -> Option<Attribute<'a>> {
    match name {
        "_id" => Some(Attribute::Identifier),
        KEY_COLUMN | ETAG_COLUMN => Some(Attribute::Column {
            name,
            kind: PropertyType::String,
        }),
        MTIME_COLUMN => Some(Attribute::Column {
            name,
            kind: PropertyType::Number,
        }),
        _ => schema.property(name).map(|spec| Attribute::Column {
            name,
            kind: spec.kind,
        }),
    }
}

/// Parses filter literal text as a value of `kind`.
///
/// Surrounding whitespace is ignored for numbers and booleans; string values
/// stay verbatim.
pub(crate) fn literal(kind: PropertyType, raw: &str) -> std::result::Result<SqlValue, String> {
    match kind {
        PropertyType::String => Ok(SqlValue::Text(raw.to_owned())),
        PropertyType::Number => {
            let raw = raw.trim();
            if let Ok(int) = raw.parse::<i64>() {
                return Ok(SqlValue::Integer(int));
            }
            match raw.parse::<f64>() {
                Ok(float) if float.is_finite() => Ok(SqlValue::Real(float)),
                _ => Err(format!("'{raw}' is not a number")),
            }
        }
        PropertyType::Boolean => match raw.trim() {
            "true" => Ok(SqlValue::Integer(1)),
            "false" => Ok(SqlValue::Integer(0)),
            _ => Err(format!("'{raw}' is not a boolean")),
        },
    }
}

/// Converts a document field into the column value for a property of `kind`.
pub(crate) fn column_value(
    kind: PropertyType,
    value: &serde_json::Value,
) -> std::result::Result<SqlValue, String> {
    use serde_json::Value;
    match (kind, value) {
        (_, Value::Null) => Ok(SqlValue::Null),
        (PropertyType::String, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
        (PropertyType::Number, Value::Number(n)) => match n.as_i64() {
            Some(int) => Ok(SqlValue::Integer(int)),
            None => n
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| format!("number {n} is out of range")),
        },
        (PropertyType::Boolean, Value::Bool(b)) => Ok(SqlValue::Integer(i64::from(*b))),
        (kind, other) => Err(format!("expected {kind:?} value, got {other}")),
    }
}

/// Compiles `filter` into a predicate over the bucket relation.
pub fn compile_filter(schema: &BucketSchema, filter: &Filter) -> Result<Predicate> {
    let mut compiler = Compiler {
        schema,
        filter,
        params: Vec::new(),
    };
    let sql = compiler.expr(filter)?;
    Ok(Predicate {
        sql,
        params: compiler.params,
    })
}

struct Compiler<'a> {
    schema: &'a BucketSchema,
    filter: &'a Filter,
    params: Vec<SqlValue>,
}

impl Compiler<'_> {
    fn fail(&self, reason: impl Into<String>) -> BucketError {
        BucketError::predicate(self.filter.to_string(), reason)
    }

    fn resolve<'n>(&self, attr: &'n str) -> Result<Attribute<'n>> {
        attribute(self.schema, attr).ok_or_else(|| {
            self.fail(format!(
                "attribute '{attr}' is not indexed in bucket '{}'",
                self.schema.name()
            ))
        })
    }

    fn expr(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::And(children) => self.join(children, " AND "),
            Filter::Or(children) => self.join(children, " OR "),
            Filter::Not(child) => Ok(format!("NOT COALESCE({}, 0)", self.expr(child)?)),
            Filter::Present { attr } => Ok(match self.resolve(attr)? {
                Attribute::Identifier => self.per_id_column(|column| {
                    format!("{} IS NOT NULL", quote_ident(column.name()))
                }),
                Attribute::Column { name, .. } => format!("({} IS NOT NULL)", quote_ident(name)),
            }),
            Filter::Compare { attr, op, value } => match self.resolve(attr)? {
                Attribute::Identifier => self.compare_identifier(*op, value),
                Attribute::Column { name, kind } => {
                    let bound =
                        literal(kind, value).map_err(|reason| self.fail(reason))?;
                    self.params.push(bound);
                    Ok(format!("({} {} ?)", quote_ident(name), op.symbol()))
                }
            },
        }
    }

    fn join(&mut self, children: &[Filter], sep: &str) -> Result<String> {
        let parts = children
            .iter()
            .map(|child| self.expr(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(sep)))
    }

    fn compare_identifier(&mut self, op: CompareOp, raw: &str) -> Result<String> {
        let bound: i64 = raw
            .trim()
            .parse()
            .map_err(|_| self.fail(format!("identifier '{raw}' is not an integer")))?;
        if !is_representable(bound) {
            return Err(self.fail(format!(
                "identifier {bound} is outside the representable range"
            )));
        }
        let columns = self.schema.id_state().columns();
        self.params
            .extend(std::iter::repeat(SqlValue::Integer(bound)).take(columns.len()));
        Ok(self.per_id_column(|column| {
            format!("{} {} ?", quote_ident(column.name()), op.symbol())
        }))
    }

    fn per_id_column(&self, render: impl Fn(IdColumn) -> String) -> String {
        let parts: Vec<String> = self
            .schema
            .id_state()
            .columns()
            .iter()
            .map(|column| format!("({})", render(*column)))
            .collect();
        format!("({})", parts.join(" OR "))
    }
}

/// Compiles an `ORDER BY` clause body for `sort`.
///
/// `physical` is the identifier state of the relation as it exists now,
/// which may be ahead of the state `schema` was resolved with. Ordering by
/// `_id` alone on a relation that already has `_idx` would put every wide
/// row (whose `_id` is NULL) first.
pub fn compile_sort(schema: &BucketSchema, sort: &Sort, physical: IdState) -> Result<String> {
    let direction = match sort.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    match attribute(schema, &sort.attribute) {
        Some(Attribute::Identifier) => Ok(match physical {
            IdState::Narrow => format!("\"_id\" {direction}"),
            IdState::Split => format!("COALESCE(\"_id\", \"_idx\") {direction}"),
        }),
        Some(Attribute::Column { name, .. }) if name == KEY_COLUMN => {
            Ok(format!("\"{KEY_COLUMN}\" {direction}"))
        }
        Some(Attribute::Column { name, .. }) => Ok(format!(
            "{} {direction}, \"{KEY_COLUMN}\" {direction}",
            quote_ident(name)
        )),
        None => Err(BucketError::InvalidArgument(format!(
            "cannot sort bucket '{}' by non-indexed attribute '{}'",
            schema.name(),
            sort.attribute
        ))),
    }
}
