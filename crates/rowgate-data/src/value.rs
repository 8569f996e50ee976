//! Tagged argument values carried from the parameter engine into SQL
//! binds and the script sandbox.

use serde_json::{Number, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

/// A coerced parameter value. This is the only shape that crosses from
/// the HTTP boundary into SQL binds; the inbound JSON/form tree is never
/// reused.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Absent optional parameter; binds as NULL of the declared type.
    Null(NullKind),
    /// Boolean scalar.
    Bool(bool),
    /// 64-bit signed integer scalar.
    Int(i64),
    /// Double-precision float scalar.
    Float(f64),
    /// UTF-8 string scalar.
    Text(String),
    /// JSON document (script-supplied arguments only).
    Json(Value),
    /// Homogeneous boolean array.
    BoolArray(Vec<bool>),
    /// Homogeneous integer array.
    IntArray(Vec<i64>),
    /// Homogeneous float array.
    FloatArray(Vec<f64>),
    /// Homogeneous string array.
    TextArray(Vec<String>),
}

/// The declared type of a NULL bind. The wire protocol names a concrete
/// parameter type for every bind, so a NULL has to carry the type of the
/// parameter it stands in for; a NULL declared as text does not cast
/// implicitly into integer or boolean SQL contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullKind {
    /// NULL in a string position (also the fallback when nothing better
    /// is known, e.g. a script-supplied null).
    Text,
    /// NULL in an integer position.
    Int,
    /// NULL in a float position.
    Float,
    /// NULL in a boolean position.
    Bool,
    /// NULL in a boolean-array position.
    BoolArray,
    /// NULL in an integer-array position.
    IntArray,
    /// NULL in a float-array position.
    FloatArray,
    /// NULL in a string-array position.
    TextArray,
}

impl ArgValue {
    /// JSON rendering of the value, used for `$sys.params` and debug
    /// logging.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null(_) => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Text(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
            Self::BoolArray(a) => Value::Array(a.iter().map(|b| Value::Bool(*b)).collect()),
            Self::IntArray(a) => {
                Value::Array(a.iter().map(|i| Value::Number((*i).into())).collect())
            }
            Self::FloatArray(a) => Value::Array(
                a.iter()
                    .map(|f| Number::from_f64(*f).map_or(Value::Null, Value::Number))
                    .collect(),
            ),
            Self::TextArray(a) => {
                Value::Array(a.iter().map(|s| Value::String(s.clone())).collect())
            }
        }
    }

    /// Convert a JSON value into an argument value. Integral numbers map
    /// to `Int`, other numbers to `Float`; objects and arrays ride along
    /// as JSON documents. A JSON null carries no type information and
    /// binds as a text NULL.
    #[must_use]
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null(NullKind::Text),
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or_default()),
                Self::Int,
            ),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

/// Bind a slice of argument values onto a query in order. NULLs are
/// declared with the type recorded in their [`NullKind`].
#[must_use]
pub fn bind_args<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &[ArgValue],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            ArgValue::Null(kind) => match kind {
                NullKind::Text => query.bind(None::<String>),
                NullKind::Int => query.bind(None::<i64>),
                NullKind::Float => query.bind(None::<f64>),
                NullKind::Bool => query.bind(None::<bool>),
                NullKind::BoolArray => query.bind(None::<Vec<bool>>),
                NullKind::IntArray => query.bind(None::<Vec<i64>>),
                NullKind::FloatArray => query.bind(None::<Vec<f64>>),
                NullKind::TextArray => query.bind(None::<Vec<String>>),
            },
            ArgValue::Bool(b) => query.bind(*b),
            ArgValue::Int(i) => query.bind(*i),
            ArgValue::Float(f) => query.bind(*f),
            ArgValue::Text(s) => query.bind(s.clone()),
            ArgValue::Json(v) => query.bind(v.clone()),
            ArgValue::BoolArray(a) => query.bind(a.clone()),
            ArgValue::IntArray(a) => query.bind(a.clone()),
            ArgValue::FloatArray(a) => query.bind(a.clone()),
            ArgValue::TextArray(a) => query.bind(a.clone()),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_preserves_scalar_tags() {
        assert_eq!(
            ArgValue::from_json(&json!(null)),
            ArgValue::Null(NullKind::Text)
        );
        assert_eq!(ArgValue::from_json(&json!(true)), ArgValue::Bool(true));
        assert_eq!(ArgValue::from_json(&json!(42)), ArgValue::Int(42));
        assert_eq!(ArgValue::from_json(&json!(1.5)), ArgValue::Float(1.5));
        assert_eq!(
            ArgValue::from_json(&json!("x")),
            ArgValue::Text("x".to_string())
        );
    }

    #[test]
    fn typed_nulls_render_as_plain_json_null() {
        assert_eq!(ArgValue::Null(NullKind::Int).to_json(), Value::Null);
        assert_eq!(ArgValue::Null(NullKind::TextArray).to_json(), Value::Null);
    }

    #[test]
    fn typed_arrays_render_as_json_arrays() {
        let v = ArgValue::IntArray(vec![1, 2, 3]);
        assert_eq!(v.to_json(), json!([1, 2, 3]));
        let v = ArgValue::TextArray(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(v.to_json(), json!(["a", "b"]));
    }

    #[test]
    fn non_finite_floats_render_as_null() {
        assert_eq!(ArgValue::Float(f64::NAN).to_json(), Value::Null);
    }
}
