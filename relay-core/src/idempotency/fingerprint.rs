use crate::error::RelayError;
use crate::object::{ContentHash, Payload};
use sha2::{Digest, Sha256};

/// SHA-256 fingerprint of a payload, hex encoded.
///
/// Hashing goes through the serialized JSON form, whose map keys are
/// ordered, so two payloads that differ only in key order fingerprint
/// identically.
pub fn content_hash(payload: &Payload) -> Result<ContentHash, RelayError> {
    let bytes = serde_json::to_vec(payload.as_json())?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ContentHash::new(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_content_fingerprints_identically() {
        let a = Payload::new(json!({"doc": "a-17", "pages": 3}));
        let b = Payload::new(json!({"pages": 3, "doc": "a-17"}));
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn different_content_fingerprints_differently() {
        let a = Payload::new(json!({"doc": "a-17"}));
        let b = Payload::new(json!({"doc": "a-18"}));
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }
}
