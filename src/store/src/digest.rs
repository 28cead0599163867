//! Content digests of the form `algorithm:hex`.
//!
//! The full form (`sha256:<hex>`) serves as manifest identity on disk;
//! the encoded form (hex only) names blob files and per-layer
//! extraction directories.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use strata_core::error::{Result, StrataError};

/// A parsed content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Parse an `algorithm:hex` digest string.
    ///
    /// Only `sha256` digests are accepted; they are the only kind the
    /// store can verify.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| invalid(s, "missing ':' separator"))?;
        if algorithm != "sha256" {
            return Err(invalid(s, "unsupported digest algorithm"));
        }
        if encoded.len() != 64 {
            return Err(invalid(s, "digest is not 64 hex characters"));
        }
        if !encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid(s, "digest contains non-hex characters"));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }

    /// Compute the sha256 digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: format!("{:x}", Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex portion, used as a filesystem name for blobs and layer
    /// directories.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// A running verifier for content claimed to match this digest.
    pub fn verifier(&self) -> DigestVerifier {
        DigestVerifier {
            hasher: Sha256::new(),
            expected: self.encoded.clone(),
        }
    }
}

fn invalid(digest: &str, message: &str) -> StrataError {
    StrataError::ManifestFormat(format!("invalid digest {digest:?}: {message}"))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl TryFrom<String> for Digest {
    type Error = StrataError;

    fn try_from(s: String) -> Result<Self> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.to_string()
    }
}

/// Incrementally hashes content and compares against an expected digest.
pub struct DigestVerifier {
    hasher: Sha256,
    expected: String,
}

impl DigestVerifier {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Whether the content fed so far hashes to the expected digest.
    pub fn verified(self) -> bool {
        format!("{:x}", self.hasher.finalize()) == self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "e7d92cdc71feacf90708cb59182d0df1b911f8ae022d21f9b5b1a18b0f1deb19";

    #[test]
    fn test_parse_valid_digest() {
        let d = Digest::parse(&format!("sha256:{HEX}")).unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.encoded(), HEX);
        assert_eq!(d.to_string(), format!("sha256:{HEX}"));
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        assert!(Digest::parse(HEX).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_algorithm() {
        assert!(Digest::parse(&format!("md5:{HEX}")).is_err());
    }

    #[test]
    fn test_parse_rejects_short_hex() {
        assert!(Digest::parse("sha256:abc123").is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        let bad = format!("sha256:{}", "z".repeat(64));
        assert!(Digest::parse(&bad).is_err());
    }

    #[test]
    fn test_from_bytes_matches_known_vector() {
        // sha256("hello")
        let d = Digest::from_bytes(b"hello");
        assert_eq!(
            d.encoded(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_verifier_accepts_matching_content() {
        let d = Digest::from_bytes(b"layer data");
        let mut v = d.verifier();
        v.update(b"layer ");
        v.update(b"data");
        assert!(v.verified());
    }

    #[test]
    fn test_verifier_rejects_mismatched_content() {
        let d = Digest::from_bytes(b"layer data");
        let mut v = d.verifier();
        v.update(b"other data");
        assert!(!v.verified());
    }

    #[test]
    fn test_serde_round_trip() {
        let d = Digest::parse(&format!("sha256:{HEX}")).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"sha256:{HEX}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let result: std::result::Result<Digest, _> = serde_json::from_str("\"not-a-digest\"");
        assert!(result.is_err());
    }
}
