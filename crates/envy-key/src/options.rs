//! Deterministic serialization of package option tables
//!
//! Options arrive from the scripting runtime as a structured value and are
//! flattened into the canonical text form that becomes part of the package
//! key. The traversal is fully deterministic: map keys are sorted
//! byte-lexicographically, numbers keep their integer/float distinction, and
//! strings use a fixed escape set, so equal inputs always serialize to
//! byte-equal output regardless of insertion order.

use serde_json::Value;

use crate::KeyError;

/// Serialize an options table to its canonical text form.
///
/// An absent or empty table serializes to `"{}"`. Scalars at the top level
/// are rejected: options are always a table.
pub fn canonicalize_options(value: &Value) -> Result<String, KeyError> {
    match value {
        Value::Null => Ok("{}".to_string()),
        Value::Object(_) | Value::Array(_) => {
            let mut out = String::new();
            write_value(&mut out, value)?;
            Ok(out)
        }
        other => Err(KeyError::InvalidOptions {
            reason: format!("top-level options must be a table, got {}", kind_name(other)),
        }),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "table",
    }
}

fn write_value(out: &mut String, value: &Value) -> Result<(), KeyError> {
    match value {
        Value::Null => out.push_str("nil"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_quoted(out, s),
        Value::Array(items) => {
            // Array part: one-based indices, written numerically.
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('[');
                out.push_str(&(i + 1).to_string());
                out.push_str("]=");
                write_value(out, item)?;
            }
            out.push('}');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_key(out, key);
                out.push('=');
                write_value(out, &map[key.as_str()])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(out: &mut String, n: &serde_json::Number) -> Result<(), KeyError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(KeyError::InvalidOptions {
                reason: "non-finite number in options".to_string(),
            });
        }
        // Shortest round-trip form; always carries a decimal point or
        // exponent, keeping floats distinguishable from integers.
        out.push_str(&format!("{f:?}"));
    } else {
        return Err(KeyError::InvalidOptions {
            reason: "unrepresentable number in options".to_string(),
        });
    }
    Ok(())
}

fn is_bare_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_key(out: &mut String, key: &str) {
    if is_bare_key(key) {
        out.push_str(key);
    } else {
        out.push('[');
        write_quoted(out, key);
        out.push(']');
    }
}

fn write_quoted(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
