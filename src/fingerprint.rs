//! Content-addressed cache keys (§4.1).
//!
//! SHA-256 over (hash of PDF bytes, label, canonical schema JSON), truncated
//! to 128 bits. A cryptographic hash is stronger than the spec requires, but
//! it is already a dependency used elsewhere in this codebase for content
//! hashing, so reusing it avoids pulling in a second hashing crate just to
//! get a "fast non-cryptographic" one.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::Schema;

/// A 128-bit fingerprint over (PDF bytes, label, canonical schema).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    pub fn compute(pdf_bytes: &[u8], label: &str, schema: &Schema) -> Self {
        let mut bytes_hasher = Sha256::new();
        bytes_hasher.update(pdf_bytes);
        let bytes_digest = bytes_hasher.finalize();

        let mut hasher = Sha256::new();
        hasher.update(bytes_digest);
        hasher.update(label.as_bytes());
        hasher.update(schema.canonical_json().as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: Vec<(&str, &str)>) -> Schema {
        Schema::new(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn same_input_same_key() {
        let s = schema(vec![("nome", "Full name")]);
        let a = CacheKey::compute(b"pdf-bytes", "oab", &s);
        let b = CacheKey::compute(b"pdf-bytes", "oab", &s);
        assert_eq!(a, b);
    }

    #[test]
    fn reordered_schema_same_key() {
        let s1 = schema(vec![("nome", "Full name"), ("cpf", "CPF number")]);
        let s2 = schema(vec![("cpf", "CPF number"), ("nome", "Full name")]);
        let a = CacheKey::compute(b"pdf-bytes", "oab", &s1);
        let b = CacheKey::compute(b"pdf-bytes", "oab", &s2);
        assert_eq!(a, b);
    }

    #[test]
    fn different_bytes_different_key() {
        let s = schema(vec![("nome", "Full name")]);
        let a = CacheKey::compute(b"pdf-bytes-1", "oab", &s);
        let b = CacheKey::compute(b"pdf-bytes-2", "oab", &s);
        assert_ne!(a, b);
    }

    #[test]
    fn different_label_different_key() {
        let s = schema(vec![("nome", "Full name")]);
        let a = CacheKey::compute(b"pdf-bytes", "oab", &s);
        let b = CacheKey::compute(b"pdf-bytes", "tela", &s);
        assert_ne!(a, b);
    }
}
