//! Content hashing and deterministic record-id derivation.
//!
//! Every derived record id has the shape `<run_id>/<record_type>/<component>`.
//! Derived markers use a component computed from stable inputs, so deriving
//! the same marker twice yields the same id and the second `put_new` is a
//! no-op. That is the whole idempotency mechanism of the engine.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Payload key holding the canonical hash of the rest of the payload.
pub const PAYLOAD_HASH_KEY: &str = "payload_hash";

/// Run id used when a record id carries no recognisable run prefix.
pub const DEFAULT_RUN_ID: &str = "run";

/// Compute the SHA-256 hex digest of bytes.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 hex digest of a UTF-8 string.
#[must_use]
pub fn sha256_text(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Stream a file through SHA-256.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Serialize a JSON value with object keys sorted and no whitespace.
///
/// `serde_json::Map` is ordered by key unless the `preserve_order` feature
/// is enabled somewhere in the build, so compact serialization is already
/// canonical.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Canonical hash of a payload, ignoring its own `payload_hash` field.
#[must_use]
pub fn payload_hash(payload: &Value) -> String {
    match payload {
        Value::Object(map) if map.contains_key(PAYLOAD_HASH_KEY) => {
            let mut stripped = map.clone();
            stripped.remove(PAYLOAD_HASH_KEY);
            sha256_text(&canonical_json(&Value::Object(stripped)))
        }
        other => sha256_text(&canonical_json(other)),
    }
}

/// Stamp `payload_hash` onto an object payload.
pub fn seal_payload(payload: &mut Value) {
    let hash = payload_hash(payload);
    if let Value::Object(map) = payload {
        map.insert(PAYLOAD_HASH_KEY.to_string(), Value::String(hash));
    }
}

/// Check a sealed payload. Payloads without a `payload_hash` are reported as
/// `None` (legacy shape, nothing to verify).
#[must_use]
pub fn verify_payload_hash(payload: &Value) -> Option<bool> {
    let stored = payload.get(PAYLOAD_HASH_KEY)?.as_str()?;
    Some(stored == payload_hash(payload))
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-')
}

/// Deterministic, reversible, filesystem- and URL-safe encoding of a string.
///
/// Bytes outside `[A-Za-z0-9._-]` become `~XX` (upper-case hex).
#[must_use]
pub fn encode_record_id_component(seed: &str) -> String {
    let mut out = String::with_capacity(seed.len());
    for byte in seed.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push('~');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    if out.is_empty() {
        out.push('~');
    }
    out
}

/// Inverse of [`encode_record_id_component`]. Returns `None` on malformed input.
#[must_use]
pub fn decode_record_id_component(component: &str) -> Option<String> {
    if component == "~" {
        return Some(String::new());
    }
    let bytes = component.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'~' {
            let hex_pair = component.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex_pair, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Assemble `<run_id>/<record_type>/<component>`.
#[must_use]
pub fn record_id(run_id: &str, record_type: &str, component: &str) -> String {
    format!("{run_id}/{record_type}/{component}")
}

/// Derived id whose component is the encoded seed.
#[must_use]
pub fn derived_id(run_id: &str, record_type: &str, seed: &str) -> String {
    record_id(run_id, record_type, &encode_record_id_component(seed))
}

/// Derived id whose component is a 32-hex-char SHA-256 prefix of the seed.
/// Used where seeds are long composites.
#[must_use]
pub fn hashed_id(run_id: &str, record_type: &str, seed: &str) -> String {
    let digest = sha256_text(seed);
    derived_id(run_id, record_type, &digest[..32])
}

/// Run id prefix of a record id (`run1/evidence.capture.frame/7` -> `run1`).
#[must_use]
pub fn run_id_of(record_id: &str) -> &str {
    match record_id.split_once('/') {
        Some((run, _)) if !run.is_empty() => run,
        _ => DEFAULT_RUN_ID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "c": [3, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":[3,2],"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_json_ignores_insertion_order() {
        let mut map = serde_json::Map::new();
        map.insert("zeta".to_string(), json!("x y"));
        map.insert("alpha".to_string(), json!(1.5));
        map.insert("mid".to_string(), Value::Null);
        assert_eq!(
            canonical_json(&Value::Object(map)),
            r#"{"alpha":1.5,"mid":null,"zeta":"x y"}"#
        );
    }

    #[test]
    fn payload_hash_ignores_its_own_field() {
        let mut payload = json!({"source_record_id": "r/f/1", "complete": true});
        let before = payload_hash(&payload);
        seal_payload(&mut payload);
        assert_eq!(payload_hash(&payload), before);
        assert_eq!(verify_payload_hash(&payload), Some(true));

        payload["complete"] = json!(false);
        assert_eq!(verify_payload_hash(&payload), Some(false));
    }

    #[test]
    fn unsealed_payload_has_nothing_to_verify() {
        assert_eq!(verify_payload_hash(&json!({"a": 1})), None);
    }

    #[test]
    fn component_encoding_is_safe_and_reversible() {
        let seed = "run1/evidence.capture.frame/0007 x";
        let encoded = encode_record_id_component(seed);
        assert_eq!(encoded, "run1~2Fevidence.capture.frame~2F0007~20x");
        assert!(!encoded.contains('/'));
        assert_eq!(decode_record_id_component(&encoded).as_deref(), Some(seed));
    }

    #[test]
    fn empty_seed_encodes_to_placeholder() {
        assert_eq!(encode_record_id_component(""), "~");
        assert_eq!(decode_record_id_component("~").as_deref(), Some(""));
    }

    #[test]
    fn malformed_component_does_not_decode() {
        assert_eq!(decode_record_id_component("abc~4"), None);
        assert_eq!(decode_record_id_component("abc~ZZ"), None);
    }

    #[test]
    fn hashed_id_is_stable_and_short() {
        let a = hashed_id("run1", "obs.uia.focus", "frame|U1|h1");
        let b = hashed_id("run1", "obs.uia.focus", "frame|U1|h1");
        assert_eq!(a, b);
        assert_eq!(a.rsplit('/').next().map(str::len), Some(32));
    }

    #[test]
    fn run_id_prefix_extraction() {
        assert_eq!(run_id_of("run9/evidence.capture.frame/1"), "run9");
        assert_eq!(run_id_of("F1"), DEFAULT_RUN_ID);
        assert_eq!(run_id_of("/x/y"), DEFAULT_RUN_ID);
    }
}
