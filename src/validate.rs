//! Validates a parsed field's value against its `valid:` constraint, and
//! fixed `contents:` against the raw bytes actually read.

use crate::errors::{ErrorKind, KaitaiError, Result};
use crate::expr::{self, EvalCtx};
use crate::schema::Valid;
use crate::value::Value;

/// Checks `contents:` fixed-byte matching: the raw bytes read for the
/// field must equal the declared literal exactly.
pub fn check_contents(field_id: &str, expected: &[u8], actual: &[u8]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(KaitaiError::new(ErrorKind::ContentValidationFailed {
            field: field_id.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }))
    }
}

/// Checks a `valid:` constraint against the already-parsed field value.
pub fn check_valid(field_id: &str, valid: &Valid, value: &Value, ctx: &mut EvalCtx) -> Result<()> {
    let ok = match valid {
        Valid::Eq(expected) => json_eq(value, expected),
        Valid::Range { min, max } => {
            let in_min = min.as_ref().map_or(true, |m| json_le(m, value));
            let in_max = max.as_ref().map_or(true, |m| json_le_rev(value, m));
            in_min && in_max
        }
        Valid::AnyOf(options) => options.iter().any(|o| json_eq(value, o)),
        Valid::InEnum => matches!(value, Value::Enum(e) if e.valid),
        Valid::Expr(source) => {
            let ast = ctx.cache.compile(source)?;
            expr::eval(&ast, ctx)?.truthy()
        }
    };
    if ok {
        Ok(())
    } else {
        Err(KaitaiError::new(ErrorKind::ValidationFailed {
            field: field_id.to_string(),
            reason: describe(valid),
        }))
    }
}

fn describe(valid: &Valid) -> String {
    match valid {
        Valid::Eq(v) => format!("expected exactly {v}"),
        Valid::Range { min, max } => format!("expected in range [{min:?}, {max:?}]"),
        Valid::AnyOf(opts) => format!("expected one of {opts:?}"),
        Valid::InEnum => "value is not a valid enum member".to_string(),
        Valid::Expr(src) => format!("failed expression `{src}`"),
    }
}

fn json_eq(value: &Value, expected: &serde_json::Value) -> bool {
    match expected {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                value.as_i64() == Some(i)
            } else {
                n.as_f64() == value.as_f64()
            }
        }
        serde_json::Value::String(s) => value.as_str() == Some(s.as_str()),
        serde_json::Value::Bool(b) => matches!(value, Value::Bool(v) if v == b),
        serde_json::Value::Array(items) => match value.as_bytes() {
            Some(bytes) => bytes_match(bytes, items),
            None => false,
        },
        _ => false,
    }
}

fn bytes_match(bytes: &[u8], items: &[serde_json::Value]) -> bool {
    bytes.len() == items.len()
        && bytes
            .iter()
            .zip(items)
            .all(|(b, i)| i.as_u64() == Some(*b as u64))
}

/// Byte sequences compare lexicographically (shorter is less, as for
/// strings), everything else falls back to numeric comparison.
fn json_le(bound: &serde_json::Value, value: &Value) -> bool {
    if let (serde_json::Value::Array(bound_bytes), Some(val_bytes)) = (bound, value.as_bytes()) {
        return match bytes_from_json(bound_bytes) {
            Some(b) => b.as_slice() <= val_bytes,
            None => false,
        };
    }
    if let (serde_json::Value::String(s), Some(val_str)) = (bound, value.as_str()) {
        return s.as_str() <= val_str;
    }
    match (bound.as_f64(), value.as_f64()) {
        (Some(b), Some(v)) => b <= v,
        _ => false,
    }
}

fn json_le_rev(value: &Value, bound: &serde_json::Value) -> bool {
    if let (Some(val_bytes), serde_json::Value::Array(bound_bytes)) = (value.as_bytes(), bound) {
        return match bytes_from_json(bound_bytes) {
            Some(b) => val_bytes <= b.as_slice(),
            None => false,
        };
    }
    if let (Some(val_str), serde_json::Value::String(s)) = (value.as_str(), bound) {
        return val_str <= s.as_str();
    }
    match (value.as_f64(), bound.as_f64()) {
        (Some(v), Some(b)) => v <= b,
        _ => false,
    }
}

fn bytes_from_json(items: &[serde_json::Value]) -> Option<Vec<u8>> {
    items.iter().map(|i| i.as_u64().map(|n| n as u8)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_mismatch_reports_both_sides() {
        let err = check_contents("magic", &[0x89, b'P'], &[0x89, b'X']).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ContentValidationFailed { .. }));
    }

    #[test]
    fn contents_match_is_ok() {
        assert!(check_contents("magic", &[1, 2, 3], &[1, 2, 3]).is_ok());
    }

    #[test]
    fn eq_constraint_on_integer() {
        assert!(json_eq(&Value::unsigned(1, 42), &serde_json::json!(42)));
        assert!(!json_eq(&Value::unsigned(1, 42), &serde_json::json!(43)));
    }

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(json_le(&serde_json::json!(0), &Value::unsigned(1, 0)));
        assert!(json_le_rev(&Value::unsigned(1, 10), &serde_json::json!(10)));
    }

    #[test]
    fn byte_sequence_ranges_compare_lexicographically() {
        let value = Value::Bytes(vec![0x01, 0x02]);
        assert!(json_le(&serde_json::json!([0x01, 0x00]), &value));
        assert!(json_le_rev(&value, &serde_json::json!([0x01, 0x02])));
        assert!(!json_le(&serde_json::json!([0x01, 0x03]), &value));
    }

    #[test]
    fn byte_sequence_eq_checks_each_element() {
        let value = Value::Bytes(vec![0x89, b'P', b'N', b'G']);
        assert!(json_eq(&value, &serde_json::json!([0x89, 80, 78, 71])));
        assert!(!json_eq(&value, &serde_json::json!([0x89, 80, 78, 72])));
    }
}
