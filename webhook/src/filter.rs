//! Boolean filter-expression evaluation over a payload+headers map. The
//! expression language is `evalexpr`'s: arithmetic/comparison/boolean
//! operators over flattened fields, no arbitrary code execution.
//!
//! `evalexpr` identifiers cannot contain `.`, but filters are written as
//! dotted paths (`payload.ref == 'refs/heads/main'`). We flatten the
//! payload/headers JSON into dotted keys, then textually rewrite those same
//! dotted paths in the expression into the flattened identifier form before
//! evaluating, leaving string literals untouched.

use std::collections::HashMap;

use evalexpr::{Context, ContextWithMutableVariables, HashMapContext, Value as EvalValue};
use serde_json::Value as JsonValue;

use crate::error::Error;

const SEPARATOR: &str = "__";

pub fn evaluate(
    filter: &str,
    payload: &JsonValue,
    headers: &HashMap<String, String>,
) -> Result<bool, Error> {
    let mut context = HashMapContext::new();
    flatten_into("payload", payload, &mut context)?;
    for (k, v) in headers {
        let flat_key = format!("headers{SEPARATOR}{}", sanitize_segment(k));
        context
            .set_value(flat_key, EvalValue::from(v.clone()))
            .map_err(|e| Error::Filter(e.to_string()))?;
    }

    let rewritten = rewrite_dotted_paths(filter);
    evalexpr::eval_boolean_with_context(&rewritten, &context)
        .map_err(|e| Error::Filter(e.to_string()))
}

fn flatten_into(
    prefix: &str,
    value: &JsonValue,
    context: &mut HashMapContext,
) -> Result<(), Error> {
    match value {
        JsonValue::Object(map) => {
            for (k, v) in map {
                let key = format!("{prefix}{SEPARATOR}{}", sanitize_segment(k));
                flatten_into(&key, v, context)?;
            }
            Ok(())
        }
        JsonValue::String(s) => context
            .set_value(prefix.to_string(), EvalValue::from(s.clone()))
            .map_err(|e| Error::Filter(e.to_string())),
        JsonValue::Bool(b) => context
            .set_value(prefix.to_string(), EvalValue::from(*b))
            .map_err(|e| Error::Filter(e.to_string())),
        JsonValue::Number(n) => {
            let v = if let Some(i) = n.as_i64() {
                EvalValue::from(i)
            } else {
                EvalValue::from(n.as_f64().unwrap_or(0.0))
            };
            context
                .set_value(prefix.to_string(), v)
                .map_err(|e| Error::Filter(e.to_string()))
        }
        // Arrays aren't addressable by a filter expression; skip rather than
        // invent an indexing scheme nothing in the corpus uses.
        JsonValue::Array(_) | JsonValue::Null => Ok(()),
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase()
}

/// Replaces `ident(.ident)+` sequences outside of string literals with
/// `ident__ident...`, matching the flattening scheme above. Single-quoted
/// string literals (the filter syntax used throughout the spec, e.g.
/// `payload.ref == 'refs/heads/main'`) are rewritten to evalexpr's
/// double-quoted form, since evalexpr itself only parses double quotes.
fn rewrite_dotted_paths(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut chars = expr.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c == '\'' {
            out.push('"');
            for (_, inner) in chars.by_ref() {
                if inner == '\'' {
                    break;
                }
                if inner == '"' || inner == '\\' {
                    out.push('\\');
                }
                out.push(inner);
            }
            out.push('"');
            continue;
        }
        if c == '"' {
            out.push(c);
            for (_, inner) in chars.by_ref() {
                out.push(inner);
                if inner == '"' {
                    break;
                }
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            ident.push(c);
            while let Some(&(_, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' || next == '.' {
                    // Don't swallow a trailing '.' that isn't followed by an identifier char
                    // (shouldn't occur in well-formed filters, but be conservative).
                    ident.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let trimmed = ident.trim_end_matches('.');
            out.push_str(&trimmed.replace('.', SEPARATOR).to_lowercase());
            if trimmed.len() != ident.len() {
                out.push_str(&ident[trimmed.len()..]);
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matches_equality_on_nested_field() {
        let payload = json!({"ref": "refs/heads/main", "commit": "abc"});
        let headers = HashMap::new();
        assert!(
            evaluate("payload.ref == \"refs/heads/main\"", &payload, &headers).unwrap()
        );
    }

    #[test]
    fn single_quoted_string_literals_are_accepted() {
        let payload = json!({"ref": "refs/heads/main", "commit": "abc"});
        let headers = HashMap::new();
        assert!(
            evaluate("payload.ref == 'refs/heads/main'", &payload, &headers).unwrap()
        );
    }

    #[test]
    fn non_matching_expression_is_false() {
        let payload = json!({"ref": "refs/heads/dev"});
        let headers = HashMap::new();
        assert!(
            !evaluate("payload.ref == \"refs/heads/main\"", &payload, &headers).unwrap()
        );
    }

    #[test]
    fn header_fields_are_addressable() {
        let payload = json!({});
        let mut headers = HashMap::new();
        headers.insert("x-github-event".to_string(), "push".to_string());
        assert!(evaluate("headers.x_github_event == \"push\"", &payload, &headers).unwrap());
    }

    #[test]
    fn boolean_and_numeric_fields_evaluate() {
        let payload = json!({"draft": false, "pr": {"number": 42}});
        let headers = HashMap::new();
        assert!(evaluate("!payload.draft && payload.pr.number == 42", &payload, &headers).unwrap());
    }

    #[test]
    fn malformed_expression_is_a_filter_error() {
        let payload = json!({});
        let headers = HashMap::new();
        assert!(evaluate("payload.ref ==", &payload, &headers).is_err());
    }
}
