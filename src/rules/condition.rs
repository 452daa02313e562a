//! Rule conditions.
//!
//! A condition compares one tag's current value against a fixed comparison
//! value with a single operator. Conditions combine under AND/OR; `negate`
//! inverts a condition's truth value before combination.

use serde::{Deserialize, Serialize};

use crate::core::value::{TagValue, Value};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// String containment (`haystack contains needle`); for arrays,
    /// element membership.
    Contains,
}

/// How a rule combines its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicMode {
    /// All conditions must be true (after negation).
    #[default]
    And,
    /// At least one condition must be true (after negation).
    Or,
}

/// One comparison against one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Device owning the referenced tag.
    pub device: String,

    /// Referenced tag.
    pub tag: String,

    /// Comparison operator.
    pub op: CompareOp,

    /// Comparison value.
    pub value: Value,

    /// Invert the result before combination.
    #[serde(default)]
    pub negate: bool,
}

impl Condition {
    /// Evaluate against the tag's current observation.
    ///
    /// An error observation satisfies nothing, negated or not: a device
    /// falling offline must not fire rules through negation.
    pub fn matches(&self, current: &TagValue) -> bool {
        if current.is_error() {
            return false;
        }
        let raw = compare(self.op, &current.value, &self.value);
        if self.negate {
            !raw
        } else {
            raw
        }
    }
}

/// Compare `lhs op rhs` with numeric coercion.
fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => equal(lhs, rhs),
        CompareOp::Ne => !equal(lhs, rhs),
        CompareOp::Gt => ordering(lhs, rhs).map(|o| o.is_gt()).unwrap_or(false),
        CompareOp::Ge => ordering(lhs, rhs).map(|o| o.is_ge()).unwrap_or(false),
        CompareOp::Lt => ordering(lhs, rhs).map(|o| o.is_lt()).unwrap_or(false),
        CompareOp::Le => ordering(lhs, rhs).map(|o| o.is_le()).unwrap_or(false),
        CompareOp::Contains => contains(lhs, rhs),
    }
}

fn equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn ordering(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (lhs, rhs) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn contains(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Text(hay), Value::Text(needle)) => hay.contains(needle.as_str()),
        (Value::Array(items), needle) => items.iter().any(|v| equal(v, needle)),
        _ => false,
    }
}

/// Combine per-condition results under a logic mode.
pub fn combine(mode: LogicMode, results: impl IntoIterator<Item = bool>) -> bool {
    let mut iter = results.into_iter();
    match mode {
        LogicMode::And => {
            let mut any = false;
            for r in iter {
                if !r {
                    return false;
                }
                any = true;
            }
            any
        }
        LogicMode::Or => iter.any(|r| r),
    }
}
