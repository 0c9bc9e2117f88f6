//! Deterministic memo-key derivation and call/return encoding.
//!
//! A [`Call`] is the identity `(task name, args)` plus the memo key the
//! [`Codec`] derives from it. Two calls with the same memo key are the same
//! logical invocation for memoization purposes — this crate owns the one
//! correctness requirement in the whole engine: that derivation must be
//! canonical across processes.

use std::fmt;

use serde_json::Value;

/// A call identity: the task name, its JSON-encoded arguments, and the
/// derived memo key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub task_name: String,
    pub args: Value,
    pub memo_key: String,
}

impl Call {
    pub fn new(task_name: impl Into<String>, args: Value, memo_key: String) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            memo_key,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize value: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode value: {0}")]
    Decode(serde_json::Error),
}

/// Derives memo keys and encodes/decodes JSON payloads.
///
/// Implementations must be deterministic: given the same logical
/// `(task_name, args)`, every process must derive the same memo key.
///
/// The contract is kept deliberately small — a capability set of
/// `create_call` / `encode_value` / `decode_value`, all object-safe, no
/// tagged variant — per the spec's own design note that codec
/// polymorphism needs nothing more. The `invokeTask` capability the spec
/// also names (decode args, run the user function, encode the result) is
/// not part of this trait: it has no meaning without a task registry, so
/// `memo-engine`'s `TaskRegistry::invoke_task` realizes it by composing
/// `encode_value`/`decode_value` with `serde_json::to_value`/`from_value`
/// at the call site, where the task's concrete argument/return types are
/// still in scope.
pub trait Codec: Send + Sync + 'static {
    /// Build a `Call` from a task name and already-JSON-encoded arguments.
    fn create_call(&self, task_name: &str, args: Value) -> Call;

    /// Encode a JSON value for persistence (call args or a return value).
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decode a previously-encoded JSON value.
    fn decode_value(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The default codec: memo key is the UTF-8 canonical JSON of
/// `[taskName, args]`. `serde_json::Value`'s object representation is a
/// `BTreeMap` (we never enable the `preserve_order` feature), so member
/// ordering is already canonical; `serde_json::Number`'s own `Display`
/// normalizes numeric literals. This is the only correctness requirement
/// the spec imposes on a codec, and it falls out of serde_json's defaults
/// rather than needing a hand-rolled canonicalizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    fn memo_key(task_name: &str, args: &Value) -> String {
        // Array form keeps the task name out of the args' own key space,
        // so `["f", {}]` and `["g", {}]` never collide. The queue message
        // grammar (`rootId/memoKey`) splits on the *first* '/' only, so a
        // memo key is free to contain '/'; only the rootId must not.
        format!(
            "[{},{}]",
            serde_json::to_string(task_name).expect("string serialization cannot fail"),
            args
        )
    }
}

impl fmt::Display for JsonCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCodec")
    }
}

impl Codec for JsonCodec {
    fn create_call(&self, task_name: &str, args: Value) -> Call {
        let memo_key = Self::memo_key(task_name, &args);
        Call::new(task_name, args, memo_key)
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memo_key_is_deterministic_across_instances() {
        let a = JsonCodec::new().create_call("triangular_sum", json!({"n": 3}));
        let b = JsonCodec::new().create_call("triangular_sum", json!({"n": 3}));
        assert_eq!(a.memo_key, b.memo_key);
    }

    #[test]
    fn memo_key_is_order_independent_for_named_parameters() {
        let a = JsonCodec.create_call("f", json!({"b": 2, "a": 1}));
        let b = JsonCodec.create_call("f", json!({"a": 1, "b": 2}));
        assert_eq!(a.memo_key, b.memo_key);
    }

    #[test]
    fn distinct_task_names_never_collide_on_identical_args() {
        let a = JsonCodec.create_call("f", json!(1));
        let b = JsonCodec.create_call("g", json!(1));
        assert_ne!(a.memo_key, b.memo_key);
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let codec = JsonCodec::new();
        let bytes = codec.encode_value(&json!({"ok": true, "n": 42})).unwrap();
        let value = codec.decode_value(&bytes).unwrap();
        assert_eq!(value, json!({"ok": true, "n": 42}));
    }

    proptest::proptest! {
        #[test]
        fn memo_key_stable_under_reserialization(n in 0i64..10_000) {
            let a = JsonCodec.create_call("triangular_sum", json!({"n": n}));
            let b = JsonCodec.create_call("triangular_sum", json!({"n": n}));
            prop_assert_eq!(a.memo_key, b.memo_key);
        }
    }
}
