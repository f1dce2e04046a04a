use std::collections::BTreeMap;

/// A mapping of text keys to arbitrary values, as described in spec.md §3.
///
/// `BTreeMap` rather than `HashMap` so that encoding order is deterministic
/// (useful for tests asserting on encoded bytes, and for log output).
pub type Message = BTreeMap<String, rmpv::Value>;

/// Convenience constructors mirroring how callers build messages in the
/// original (plain Python dicts of strings/bytes/numbers).
pub fn text(s: impl Into<String>) -> rmpv::Value {
    rmpv::Value::String(s.into().into())
}

pub fn binary(b: impl Into<Vec<u8>>) -> rmpv::Value {
    rmpv::Value::Binary(b.into())
}

pub fn integer(n: i64) -> rmpv::Value {
    rmpv::Value::Integer(n.into())
}
