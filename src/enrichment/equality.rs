//! Deep equality for signal values.
//!
//! Object key order never matters, and an integer equals a float only when
//! the float holds exactly that integer. Comparison walks an explicit work
//! list, so nesting depth is limited by memory rather than the call stack.

use serde_json::{Number, Value};

/// Whether two signal values are deep-equal.
pub fn signals_equal(a: &Value, b: &Value) -> bool {
    let mut pending = vec![(a, b)];
    while let Some((a, b)) = pending.pop() {
        let same = match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::String(x), Value::String(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
            (Value::Array(x), Value::Array(y)) => {
                if x.len() != y.len() {
                    return false;
                }
                pending.extend(x.iter().zip(y));
                true
            }
            (Value::Object(x), Value::Object(y)) => {
                if x.len() != y.len() {
                    return false;
                }
                for (key, l) in x {
                    let Some(r) = y.get(key) else {
                        return false;
                    };
                    pending.push((l, r));
                }
                true
            }
            _ => false,
        };
        if !same {
            return false;
        }
    }
    true
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    match (x.is_f64(), y.is_f64()) {
        (false, false) => match (x.as_i64(), y.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => x.as_u64().is_some() && x.as_u64() == y.as_u64(),
        },
        (true, true) => x.as_f64() == y.as_f64(),
        (true, false) => float_is_integer(x.as_f64(), y),
        (false, true) => float_is_integer(y.as_f64(), x),
    }
}

/// Exact comparison: no rounding of the integer side.
fn float_is_integer(float: Option<f64>, integer: &Number) -> bool {
    let Some(f) = float else {
        return false;
    };
    if !f.is_finite() || f.fract() != 0.0 {
        return false;
    }
    if f < 0.0 {
        if f < -9_223_372_036_854_775_808.0 {
            return false;
        }
        #[allow(clippy::cast_possible_truncation)] // integral and within i64 range
        let truncated = f as i64;
        integer.as_i64() == Some(truncated)
    } else {
        if f >= 18_446_744_073_709_551_616.0 {
            return false;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // integral, in u64 range
        let truncated = f as u64;
        integer.as_u64() == Some(truncated)
    }
}
