//! Response body encoders for query and exec endpoints.
//!
//! The JSON layouts are part of the stable HTTP surface: two-space outer
//! indent, one result row per line, trailing newline. Exec failures are
//! the one compact shape.

use serde::Serialize;
use serde_json::Value;

/// Wire shape of an exec response.
#[derive(Debug, Serialize)]
pub struct ExecResult {
    /// Rows affected by the statement.
    #[serde(rename = "rowsAffected")]
    pub rows_affected: u64,
    /// Failure detail, present only on errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Encode a successful or failed query result:
/// `{"rows": [[…], …]}` or `{"rows": null, "error": "…"}`.
#[must_use]
pub fn query_result_json(rows: Option<&[Vec<Value>]>, error: Option<&str>) -> String {
    let mut out = String::from("{\n  \"rows\": ");
    match rows {
        None => out.push_str("null"),
        Some([]) => out.push_str("[]"),
        Some(rows) => {
            out.push_str("[\n");
            for (i, row) in rows.iter().enumerate() {
                out.push_str("    ");
                out.push_str(&serde_json::to_string(row).unwrap_or_else(|_| "null".to_string()));
                if i + 1 < rows.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str("  ]");
        }
    }
    if let Some(error) = error {
        out.push_str(",\n  \"error\": ");
        out.push_str(&serde_json::to_string(error).unwrap_or_else(|_| "\"\"".to_string()));
    }
    out.push_str("\n}\n");
    out
}

/// Encode a successful exec response (pretty, trailing newline).
#[must_use]
pub fn exec_result_json(rows_affected: u64) -> String {
    let result = ExecResult {
        rows_affected,
        error: None,
    };
    let mut out = serde_json::to_string_pretty(&result).unwrap_or_else(|_| "{}".to_string());
    out.push('\n');
    out
}

/// Encode a failed exec response (compact, trailing newline).
#[must_use]
pub fn exec_error_json(error: &str) -> String {
    let result = ExecResult {
        rows_affected: 0,
        error: Some(error.to_string()),
    };
    let mut out = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
    out.push('\n');
    out
}

/// Encode a JSON value prettily with a trailing newline (script object
/// results).
#[must_use]
pub fn pretty_json(value: &Value) -> String {
    let mut out = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string());
    out.push('\n');
    out
}

/// Encode rows as CSV. Zero rows produce an empty body.
#[must_use]
pub fn rows_to_csv(rows: &[Vec<Value>]) -> Vec<u8> {
    if rows.is_empty() {
        return Vec::new();
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        let record: Vec<String> = row.iter().map(value_to_text).collect();
        if writer.write_record(&record).is_err() {
            break;
        }
    }
    writer.into_inner().unwrap_or_default()
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::Null => "<nil>".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_rows_encode_one_per_line() {
        let rows = vec![
            vec![json!("The Dark Knight"), json!(2008)],
            vec![json!("The Shawshank Redemption"), json!(1994)],
            vec![json!("The Godfather Part II"), json!(1974)],
            vec![json!("The Godfather"), json!(1972)],
            vec![json!("12 Angry Men"), json!(1957)],
        ];
        let body = query_result_json(Some(&rows), None);
        assert_eq!(
            body,
            "{\n  \"rows\": [\n    [\"The Dark Knight\",2008],\n    [\"The Shawshank Redemption\",1994],\n    [\"The Godfather Part II\",1974],\n    [\"The Godfather\",1972],\n    [\"12 Angry Men\",1957]\n  ]\n}\n"
        );
    }

    #[test]
    fn empty_result_set_stays_inline() {
        assert_eq!(query_result_json(Some(&[]), None), "{\n  \"rows\": []\n}\n");
    }

    #[test]
    fn query_failure_carries_null_rows_and_error() {
        let body = query_result_json(None, Some("ERROR: boom (SQLSTATE 42601)"));
        assert_eq!(
            body,
            "{\n  \"rows\": null,\n  \"error\": \"ERROR: boom (SQLSTATE 42601)\"\n}\n"
        );
    }

    #[test]
    fn exec_success_is_pretty_and_failure_compact() {
        assert_eq!(exec_result_json(5), "{\n  \"rowsAffected\": 5\n}\n");
        assert_eq!(
            exec_error_json("ERROR: cannot execute UPDATE in a read-only transaction (SQLSTATE 25006)"),
            "{\"rowsAffected\":0,\"error\":\"ERROR: cannot execute UPDATE in a read-only transaction (SQLSTATE 25006)\"}\n"
        );
    }

    #[test]
    fn csv_rows_use_default_textual_forms() {
        let rows = vec![
            vec![json!("The Dark Knight"), json!(2008), json!(true), json!(null)],
            vec![json!("a,b"), json!(1.5), json!(false), json!("x")],
        ];
        let body = String::from_utf8(rows_to_csv(&rows)).expect("utf8");
        assert_eq!(
            body,
            "The Dark Knight,2008,true,<nil>\n\"a,b\",1.5,false,x\n"
        );
    }

    #[test]
    fn csv_with_no_rows_is_empty() {
        assert!(rows_to_csv(&[]).is_empty());
    }
}
