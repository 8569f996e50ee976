//! The parameter coercion and validation pipeline.
//!
//! For each request, every declared parameter is located (path, query or
//! body), coerced to its declared type and validated. Any failure rejects
//! the whole request with HTTP 400 naming the parameter. The compiled
//! per-parameter artifacts (anchored regexes, enums coerced to their
//! intrinsic lists) are built once at startup and read-only afterwards.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};

use rowgate_config::validate::{float_to_int, string_to_int};
use rowgate_config::{Endpoint, Param, ParamLocation, ParamType};
use rowgate_data::{ArgValue, NullKind};

/// A parameter failure; terminates the request with HTTP 400.
#[derive(Debug, Clone)]
pub struct ParamError {
    /// Name of the offending parameter.
    pub name: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "param {:?}: {}", self.name, self.reason)
    }
}

impl ParamError {
    fn new(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// The located raw inputs of one request, before coercion.
#[derive(Debug, Default)]
pub struct RequestValues {
    /// Router-extracted path components.
    pub path: HashMap<String, String>,
    /// URL query values (multi-valued). Populated for GET requests only.
    pub query: HashMap<String, Vec<String>>,
    /// Decoded JSON body object, when the request carried one.
    pub json_body: Option<Map<String, Value>>,
    /// Decoded urlencoded form body (multi-valued).
    pub form_body: Option<HashMap<String, Vec<String>>>,
}

enum Located<'a> {
    Path(&'a str),
    Multi(&'a [String]),
    Json(&'a Value),
}

impl RequestValues {
    fn locate(&self, p: &Param) -> Option<Located<'_>> {
        match p.location_of()? {
            ParamLocation::Path => self
                .path
                .get(&p.name)
                .filter(|v| !v.is_empty())
                .map(|v| Located::Path(v)),
            ParamLocation::Query => self.query.get(&p.name).map(|v| Located::Multi(v)),
            ParamLocation::Body => {
                if let Some(json) = &self.json_body {
                    json.get(&p.name).map(Located::Json)
                } else if let Some(form) = &self.form_body {
                    form.get(&p.name).map(|v| Located::Multi(v))
                } else {
                    None
                }
            }
        }
    }
}

enum EnumList {
    Text(Vec<String>),
    Int(Vec<i64>),
    Float(Vec<f64>),
}

struct ParamInfo {
    regex: Option<Regex>,
    enum_values: Option<EnumList>,
}

/// Compiled parameter artifacts, keyed by `<endpoint-URI>#<param-name>`.
pub struct ParamEngine {
    info: HashMap<String, ParamInfo>,
}

impl ParamEngine {
    /// Compile regexes and intrinsic enum lists for every declared
    /// parameter.
    #[must_use]
    pub fn compile(endpoints: &[Endpoint]) -> Self {
        let mut info = HashMap::new();
        for ep in endpoints {
            for p in &ep.params {
                let regex = if p.pattern.is_empty() {
                    None
                } else {
                    Regex::new(&format!("^{}$", p.pattern)).ok()
                };
                let enum_values = coerce_enum(p);
                if regex.is_some() || enum_values.is_some() {
                    info.insert(format!("{}#{}", ep.uri, p.name), ParamInfo { regex, enum_values });
                }
            }
        }
        Self { info }
    }

    fn lookup(&self, uri: &str, name: &str) -> Option<&ParamInfo> {
        self.info.get(&format!("{uri}#{name}"))
    }

    /// Locate, coerce and validate every parameter of the endpoint in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns the first parameter failure; the caller answers 400.
    pub fn collect(
        &self,
        ep: &Endpoint,
        values: &RequestValues,
    ) -> Result<Vec<ArgValue>, ParamError> {
        let mut out = Vec::with_capacity(ep.params.len());
        for p in &ep.params {
            let Some(located) = values.locate(p) else {
                if p.required {
                    return Err(ParamError::new(&p.name, "value required but not supplied"));
                }
                out.push(null_value(p));
                continue;
            };

            // A boolean query/form parameter with an empty value means true.
            if p.type_of() == Some(ParamType::Boolean) {
                if let Located::Multi(values) = &located {
                    if values.len() == 1 && values[0].is_empty() {
                        out.push(ArgValue::Bool(true));
                        continue;
                    }
                }
            }

            let coerced = self
                .coerce(ep, p, &located)
                .map_err(|reason| ParamError::new(&p.name, format!("invalid value: {reason}")))?;
            out.push(coerced);
        }
        Ok(out)
    }

    fn coerce(&self, ep: &Endpoint, p: &Param, v: &Located<'_>) -> Result<ArgValue, String> {
        let scalar = match v {
            Located::Path(s) => Some(ScalarIn::Text(s)),
            Located::Multi(values) if values.len() == 1 => Some(ScalarIn::Text(&values[0])),
            Located::Json(value) => Some(ScalarIn::Json(value)),
            Located::Multi(_) => None,
        };

        match p.type_of() {
            Some(ParamType::String) => {
                let scalar = scalar.ok_or("not a string")?;
                let s = scalar.as_text()?;
                self.check_string(ep, p, s).map(ArgValue::Text)
            }
            Some(ParamType::Integer) => {
                let s = scalar.ok_or_else(|| convert_failure(v, "integer"))?;
                self.check_integer(ep, p, &s).map(ArgValue::Int)
            }
            Some(ParamType::Number) => {
                let s = scalar.ok_or_else(|| convert_failure(v, "number"))?;
                self.check_number(ep, p, &s).map(ArgValue::Float)
            }
            Some(ParamType::Boolean) => {
                let s = scalar.ok_or_else(|| convert_failure(v, "boolean"))?;
                check_bool(&s).map(ArgValue::Bool)
            }
            Some(ParamType::Array) => self.check_array(ep, p, v),
            None => Err("unknown parameter type".to_string()),
        }
    }

    fn check_string(&self, ep: &Endpoint, p: &Param, s: &str) -> Result<String, String> {
        if !p.enum_values.is_empty() {
            if let Some(EnumList::Text(allowed)) = self
                .lookup(&ep.uri, &p.name)
                .and_then(|info| info.enum_values.as_ref())
            {
                if allowed.iter().any(|v| v == s) {
                    return Ok(s.to_string());
                }
            }
            return Err("does not match any of the enumerated values".to_string());
        }

        if let Some(max_length) = p.max_length.filter(|m| *m >= 0) {
            if s.len() as i64 > max_length {
                return Err(format!("exceeds specified max length of {max_length}"));
            }
        }

        if !p.pattern.is_empty() {
            if let Some(rx) = self
                .lookup(&ep.uri, &p.name)
                .and_then(|info| info.regex.as_ref())
            {
                if !rx.is_match(s) {
                    return Err(format!("does not match pattern {}", p.pattern));
                }
            }
        }

        Ok(s.to_string())
    }

    fn check_integer(&self, ep: &Endpoint, p: &Param, v: &ScalarIn<'_>) -> Result<i64, String> {
        let i = match v {
            ScalarIn::Text(s) => string_to_int(s).ok_or("not a valid integer")?,
            ScalarIn::Json(value) => match value {
                Value::String(s) => string_to_int(s).ok_or("not a valid integer")?,
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().and_then(float_to_int))
                    .ok_or("not a valid integer")?,
                other => return Err(convert_failure_value(other, "integer")),
            },
        };

        if !p.enum_values.is_empty() {
            if let Some(EnumList::Int(allowed)) = self
                .lookup(&ep.uri, &p.name)
                .and_then(|info| info.enum_values.as_ref())
            {
                if allowed.contains(&i) {
                    return Ok(i);
                }
            }
            return Err("does not match any of the enumerated values".to_string());
        }

        #[allow(clippy::cast_possible_truncation)]
        if let Some(minimum) = p.minimum {
            let minimum = minimum as i64;
            if i < minimum {
                return Err(format!("is lower than the minimum of {minimum}"));
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        if let Some(maximum) = p.maximum {
            let maximum = maximum as i64;
            if i > maximum {
                return Err(format!("is higher than the maximum of {maximum}"));
            }
        }

        Ok(i)
    }

    fn check_number(&self, ep: &Endpoint, p: &Param, v: &ScalarIn<'_>) -> Result<f64, String> {
        let f = match v {
            ScalarIn::Text(s) => s.parse::<f64>().map_err(|_| "not a valid number")?,
            ScalarIn::Json(value) => match value {
                Value::String(s) => s.parse::<f64>().map_err(|_| "not a valid number")?,
                Value::Number(n) => n.as_f64().ok_or("not a valid number")?,
                other => return Err(convert_failure_value(other, "number")),
            },
        };
        if !f.is_finite() {
            return Err("not a valid number".to_string());
        }

        if !p.enum_values.is_empty() {
            if let Some(EnumList::Float(allowed)) = self
                .lookup(&ep.uri, &p.name)
                .and_then(|info| info.enum_values.as_ref())
            {
                #[allow(clippy::float_cmp)]
                if allowed.iter().any(|v| *v == f) {
                    return Ok(f);
                }
            }
            return Err("does not match any of the enumerated values".to_string());
        }

        if let Some(minimum) = p.minimum {
            if f < minimum {
                return Err(format!("is lower than the minimum of {minimum}"));
            }
        }
        if let Some(maximum) = p.maximum {
            if f > maximum {
                return Err(format!("is higher than the maximum of {maximum}"));
            }
        }

        Ok(f)
    }

    fn check_array(&self, ep: &Endpoint, p: &Param, v: &Located<'_>) -> Result<ArgValue, String> {
        let elems: Vec<ScalarIn<'_>> = match v {
            Located::Multi(values) => values.iter().map(|s| ScalarIn::Text(s)).collect(),
            Located::Json(Value::Array(values)) => values.iter().map(ScalarIn::Json).collect(),
            Located::Json(other) => return Err(convert_failure_value(other, "array")),
            Located::Path(_) => return Err("cannot convert value to array".to_string()),
        };

        if let Some(min_items) = p.min_items {
            if (elems.len() as i64) < min_items {
                return Err(format!(
                    "fewer than the specified minimum of {min_items} items"
                ));
            }
        }
        if let Some(max_items) = p.max_items {
            if (elems.len() as i64) > max_items {
                return Err(format!(
                    "more than the specified maximum of {max_items} items"
                ));
            }
        }

        let elem_error = |i: usize, reason: String| format!("element #{}: {reason}", i + 1);
        match p.elem_type_of() {
            Some(ParamType::Integer) => {
                let mut out = Vec::with_capacity(elems.len());
                for (i, e) in elems.iter().enumerate() {
                    out.push(
                        self.check_integer(ep, p, e)
                            .map_err(|reason| elem_error(i, reason))?,
                    );
                }
                Ok(ArgValue::IntArray(out))
            }
            Some(ParamType::Number) => {
                let mut out = Vec::with_capacity(elems.len());
                for (i, e) in elems.iter().enumerate() {
                    out.push(
                        self.check_number(ep, p, e)
                            .map_err(|reason| elem_error(i, reason))?,
                    );
                }
                Ok(ArgValue::FloatArray(out))
            }
            Some(ParamType::String) => {
                let mut out = Vec::with_capacity(elems.len());
                for (i, e) in elems.iter().enumerate() {
                    let s = e.as_text().map_err(|reason| elem_error(i, reason))?;
                    out.push(
                        self.check_string(ep, p, s)
                            .map_err(|reason| elem_error(i, reason))?,
                    );
                }
                Ok(ArgValue::TextArray(out))
            }
            Some(ParamType::Boolean) => {
                let mut out = Vec::with_capacity(elems.len());
                for (i, e) in elems.iter().enumerate() {
                    out.push(check_bool(e).map_err(|reason| elem_error(i, reason))?);
                }
                Ok(ArgValue::BoolArray(out))
            }
            _ => Err(format!("invalid elemType {:?}", p.elem_type)),
        }
    }
}

enum ScalarIn<'a> {
    Text(&'a str),
    Json(&'a Value),
}

impl ScalarIn<'_> {
    fn as_text(&self) -> Result<&str, String> {
        match self {
            Self::Text(s) => Ok(s),
            Self::Json(Value::String(s)) => Ok(s),
            Self::Json(other) => Err(format!(
                "cannot convert value of type {} to string",
                json_type_name(other)
            )),
        }
    }
}

// The NULL bound for an absent optional parameter declares the
// parameter's type, so it lands in typed SQL contexts without a cast.
fn null_value(p: &Param) -> ArgValue {
    let kind = match p.type_of() {
        Some(ParamType::Integer) => NullKind::Int,
        Some(ParamType::Number) => NullKind::Float,
        Some(ParamType::Boolean) => NullKind::Bool,
        Some(ParamType::Array) => match p.elem_type_of() {
            Some(ParamType::Integer) => NullKind::IntArray,
            Some(ParamType::Number) => NullKind::FloatArray,
            Some(ParamType::Boolean) => NullKind::BoolArray,
            _ => NullKind::TextArray,
        },
        _ => NullKind::Text,
    };
    ArgValue::Null(kind)
}

fn check_bool(v: &ScalarIn<'_>) -> Result<bool, String> {
    let text = match v {
        ScalarIn::Text(s) => Some(*s),
        ScalarIn::Json(Value::String(s)) => Some(s.as_str()),
        ScalarIn::Json(Value::Bool(b)) => return Ok(*b),
        ScalarIn::Json(other) => return Err(convert_failure_value(other, "boolean")),
    };
    match text.map(str::to_lowercase).as_deref() {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        _ => Err("cannot convert value to boolean".to_string()),
    }
}

fn convert_failure(v: &Located<'_>, target: &str) -> String {
    match v {
        Located::Multi(_) => format!("cannot convert multiple values to {target}"),
        Located::Json(value) => convert_failure_value(value, target),
        Located::Path(_) => format!("cannot convert value to {target}"),
    }
}

fn convert_failure_value(v: &Value, target: &str) -> String {
    format!(
        "cannot convert value of type {} to {target}",
        json_type_name(v)
    )
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce_enum(p: &Param) -> Option<EnumList> {
    if p.enum_values.is_empty() {
        return None;
    }
    match p.type_of()? {
        ParamType::String => {
            let values: Vec<String> = p
                .enum_values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            (!values.is_empty()).then_some(EnumList::Text(values))
        }
        ParamType::Integer => {
            let values: Vec<i64> = p
                .enum_values
                .iter()
                .filter_map(|v| match v {
                    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(float_to_int)),
                    Value::String(s) => string_to_int(s),
                    _ => None,
                })
                .collect();
            (!values.is_empty()).then_some(EnumList::Int(values))
        }
        ParamType::Number => {
            let values: Vec<f64> = p
                .enum_values
                .iter()
                .filter_map(|v| match v {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.parse::<f64>().ok(),
                    _ => None,
                })
                .collect();
            (!values.is_empty()).then_some(EnumList::Float(values))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint_with(params: Vec<Param>) -> Endpoint {
        Endpoint {
            uri: "/test".to_string(),
            impl_type: "static-text".to_string(),
            params,
            ..Endpoint::default()
        }
    }

    fn param(name: &str, location: &str, ptype: &str) -> Param {
        Param {
            name: name.to_string(),
            location: location.to_string(),
            param_type: ptype.to_string(),
            ..Param::default()
        }
    }

    fn query_values(pairs: &[(&str, &[&str])]) -> RequestValues {
        RequestValues {
            query: pairs
                .iter()
                .map(|(k, vs)| ((*k).to_string(), vs.iter().map(|v| (*v).to_string()).collect()))
                .collect(),
            ..RequestValues::default()
        }
    }

    #[test]
    fn required_parameter_must_be_supplied() {
        let mut p = param("year", "query", "integer");
        p.required = true;
        let ep = endpoint_with(vec![p]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        let err = engine
            .collect(&ep, &RequestValues::default())
            .expect_err("missing required param");
        assert_eq!(err.name, "year");
        assert!(err.reason.contains("value required but not supplied"));

        let args = engine
            .collect(&ep, &query_values(&[("year", &["1972"])]))
            .expect("valid request");
        assert_eq!(args, vec![ArgValue::Int(1972)]);
    }

    #[test]
    fn optional_absent_parameter_becomes_a_typed_null() {
        let mut years = param("years", "query", "array");
        years.elem_type = "integer".to_string();
        let ep = endpoint_with(vec![
            param("q", "query", "string"),
            param("age", "query", "integer"),
            param("ratio", "body", "number"),
            param("flag", "query", "boolean"),
            years,
        ]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));
        let args = engine
            .collect(&ep, &RequestValues::default())
            .expect("optional params");
        assert_eq!(
            args,
            vec![
                ArgValue::Null(NullKind::Text),
                ArgValue::Null(NullKind::Int),
                ArgValue::Null(NullKind::Float),
                ArgValue::Null(NullKind::Bool),
                ArgValue::Null(NullKind::IntArray),
            ]
        );
    }

    #[test]
    fn integer_fraction_tolerance() {
        let mut p = param("year", "path", "integer");
        p.minimum = Some(1900.0);
        p.maximum = Some(2050.0);
        let ep = endpoint_with(vec![p]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        let path_request = |v: &str| RequestValues {
            path: [("year".to_string(), v.to_string())].into_iter().collect(),
            ..RequestValues::default()
        };

        assert_eq!(
            engine.collect(&ep, &path_request("1972")).expect("int"),
            vec![ArgValue::Int(1972)]
        );
        assert_eq!(
            engine.collect(&ep, &path_request("1972.00")).expect("frac-free float"),
            vec![ArgValue::Int(1972)]
        );
        assert!(engine.collect(&ep, &path_request("1972.5")).is_err());
        assert!(engine.collect(&ep, &path_request("1800")).is_err());
        assert!(engine.collect(&ep, &path_request("2051")).is_err());
        assert!(engine.collect(&ep, &path_request("NaN")).is_err());
    }

    #[test]
    fn integer_range_messages_name_the_bound() {
        let mut p = param("n", "query", "integer");
        p.minimum = Some(10.0);
        let ep = endpoint_with(vec![p]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));
        let err = engine
            .collect(&ep, &query_values(&[("n", &["3"])]))
            .expect_err("below minimum");
        assert!(err.reason.contains("is lower than the minimum of 10"));
    }

    #[test]
    fn enum_takes_precedence_over_range() {
        let mut p = param("n", "query", "integer");
        p.minimum = Some(0.0);
        p.enum_values = vec![json!(1), json!(2)];
        let ep = endpoint_with(vec![p]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        assert!(engine.collect(&ep, &query_values(&[("n", &["1"])])).is_ok());
        // 50 satisfies the minimum but is not enumerated.
        let err = engine
            .collect(&ep, &query_values(&[("n", &["50"])]))
            .expect_err("not enumerated");
        assert!(err.reason.contains("does not match any of the enumerated values"));
    }

    #[test]
    fn string_checks_apply_in_order() {
        let mut p = param("s", "query", "string");
        p.max_length = Some(5);
        p.pattern = "[a-z]+".to_string();
        let ep = endpoint_with(vec![p]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        assert!(engine.collect(&ep, &query_values(&[("s", &["abc"])])).is_ok());
        let err = engine
            .collect(&ep, &query_values(&[("s", &["abcdef"])]))
            .expect_err("too long");
        assert!(err.reason.contains("exceeds specified max length of 5"));
        let err = engine
            .collect(&ep, &query_values(&[("s", &["ABC"])]))
            .expect_err("pattern anchored");
        assert!(err.reason.contains("does not match pattern"));
    }

    #[test]
    fn string_enum_requires_exact_match() {
        let mut p = param("color", "query", "string");
        p.enum_values = vec![json!("red"), json!("green")];
        // With an enum present, the other checks are inert.
        p.max_length = Some(1);
        let ep = endpoint_with(vec![p]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        assert_eq!(
            engine
                .collect(&ep, &query_values(&[("color", &["green"])]))
                .expect("enumerated"),
            vec![ArgValue::Text("green".to_string())]
        );
        assert!(engine
            .collect(&ep, &query_values(&[("color", &["blue"])]))
            .is_err());
    }

    #[test]
    fn boolean_empty_value_means_true() {
        let ep = endpoint_with(vec![param("flag", "query", "boolean")]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        assert_eq!(
            engine
                .collect(&ep, &query_values(&[("flag", &[""])]))
                .expect("empty boolean"),
            vec![ArgValue::Bool(true)]
        );
        assert_eq!(
            engine
                .collect(&ep, &query_values(&[("flag", &["FALSE"])]))
                .expect("case-insensitive"),
            vec![ArgValue::Bool(false)]
        );
        assert!(engine
            .collect(&ep, &query_values(&[("flag", &["yes"])]))
            .is_err());
    }

    #[test]
    fn arrays_coerce_each_element() {
        let mut p = param("years", "query", "array");
        p.elem_type = "integer".to_string();
        p.min_items = Some(2);
        p.max_items = Some(3);
        let ep = endpoint_with(vec![p]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        assert_eq!(
            engine
                .collect(&ep, &query_values(&[("years", &["1972", "1974"])]))
                .expect("two ints"),
            vec![ArgValue::IntArray(vec![1972, 1974])]
        );
        let err = engine
            .collect(&ep, &query_values(&[("years", &["1972"])]))
            .expect_err("too few");
        assert!(err.reason.contains("fewer than the specified minimum of 2"));
        let err = engine
            .collect(&ep, &query_values(&[("years", &["1", "2", "x"])]))
            .expect_err("bad element");
        assert!(err.reason.contains("element #3"));
    }

    #[test]
    fn json_body_values_coerce_by_tag() {
        let mut arr = param("tags", "body", "array");
        arr.elem_type = "string".to_string();
        let ep = endpoint_with(vec![
            param("name", "body", "string"),
            param("count", "body", "integer"),
            arr,
        ]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));

        let body = json!({
            "name": "widget",
            "count": 3.0,
            "tags": ["a", "b"]
        });
        let values = RequestValues {
            json_body: body.as_object().cloned(),
            ..RequestValues::default()
        };
        let args = engine.collect(&ep, &values).expect("json body");
        assert_eq!(
            args,
            vec![
                ArgValue::Text("widget".to_string()),
                ArgValue::Int(3),
                ArgValue::TextArray(vec!["a".to_string(), "b".to_string()]),
            ]
        );

        let bad = RequestValues {
            json_body: json!({ "name": 7, "count": 1, "tags": [] }).as_object().cloned(),
            ..RequestValues::default()
        };
        let err = engine.collect(&ep, &bad).expect_err("wrong tag");
        assert!(err.reason.contains("cannot convert value of type number to string"));
    }

    #[test]
    fn multiple_values_for_a_scalar_are_rejected() {
        let ep = endpoint_with(vec![param("n", "query", "integer")]);
        let engine = ParamEngine::compile(std::slice::from_ref(&ep));
        let err = engine
            .collect(&ep, &query_values(&[("n", &["1", "2"])]))
            .expect_err("multi scalar");
        assert!(err.reason.contains("cannot convert multiple values"));
    }
}
