//! Change detection.
//!
//! Decides, per tag and per structured-tag member, whether a freshly polled
//! value constitutes a publishable change against the previously stored
//! value. Ignored members are excluded from the comparison but never from
//! the stored value or the published payload.

use std::collections::BTreeSet;

use crate::core::value::{TagValue, Value};
use crate::driver::family::{self, ProtocolFamily};
use crate::driver::traits::TypeTemplate;

/// Decide whether `next` is a publishable change over `prev`.
///
/// Rules, in order:
/// - first observation (`prev` is `None`) always fires;
/// - a read error is a value in its own right: error vs success, success vs
///   error, and error vs *different* error all fire;
/// - structured values compare member-by-member with `ignored` members
///   excluded;
/// - otherwise decoded values compare structurally, with raw bytes as a
///   tiebreak when both observations carry them.
pub fn is_change(prev: Option<&TagValue>, next: &TagValue, ignored: &BTreeSet<String>) -> bool {
    let Some(prev) = prev else {
        return true;
    };

    match (&prev.error, &next.error) {
        (None, Some(_)) | (Some(_), None) => return true,
        (Some(a), Some(b)) => return a != b,
        (None, None) => {}
    }

    if !values_equal(&prev.value, &next.value, ignored) {
        return true;
    }

    // Decoded-equal: fall back to raw bytes when both sides carry them, so
    // encoding-level differences (e.g. string padding) still register.
    if let (Some(a), Some(b)) = (&prev.raw, &next.raw) {
        return a != b;
    }
    false
}

/// Structural equality with ignored members excluded at the top level.
fn values_equal(a: &Value, b: &Value, ignored: &BTreeSet<String>) -> bool {
    match (a, b) {
        (Value::Struct(ma), Value::Struct(mb)) => {
            let keys: BTreeSet<&String> = ma
                .keys()
                .chain(mb.keys())
                .filter(|k| !ignored.contains(*k))
                .collect();
            keys.into_iter()
                .all(|k| match (ma.get(k), mb.get(k)) {
                    (Some(va), Some(vb)) => va == vb,
                    _ => false,
                })
        }
        _ => a == b,
    }
}

/// Members of a template whose declared type is a volatile kind.
///
/// Applied once when a structured tag is enabled for publishing, so an
/// embedded clock does not republish the tag on every poll. User edits to
/// the ignore set afterwards are never overwritten.
pub fn volatile_members(family: ProtocolFamily, template: &TypeTemplate) -> BTreeSet<String> {
    template
        .visible_members()
        .filter(|m| family::is_volatile_type(family, m.type_code))
        .map(|m| m.name.clone())
        .collect()
}
