//! C1 — deterministic digest of a request into a fixed-width hex identifier.

use sha2::{Digest, Sha256};
use std::fmt;

/// Request-shaping parameters captured alongside the query body.
///
/// Each field is `Option` so that an explicitly empty value (`Some("")`)
/// and an absent one (`None`) produce different fingerprints, per the
/// uniqueness invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapingParams {
    pub output_format: Option<String>,
    pub default_database: Option<String>,
    pub compress: Option<String>,
    pub http_compress: Option<String>,
    pub namespace: Option<String>,
    pub max_result_rows: Option<String>,
    pub extremes: Option<String>,
    pub overflow_mode: Option<String>,
}

/// The three 32-bit hashes folded into the fingerprint, computed upstream
/// from user settings, query parameters, and user credentials respectively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputHashes {
    pub user_settings_hash: u32,
    pub query_params_hash: u32,
    pub user_credentials_hash: u32,
}

/// The schema version folded into every fingerprint. Bumping this
/// invalidates every artifact computed under a prior value.
pub const FINGERPRINT_VERSION: u32 = 2;

/// A fixed-width, lowercase-hex request fingerprint.
///
/// Always exactly 32 characters long and matches `^[0-9a-f]{32}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already-validated 32-hex-char string, e.g. one read back
    /// from a filesystem cache's directory listing.
    pub fn from_hex(hex: impl Into<String>) -> Option<Self> {
        let hex = hex.into();
        if is_valid_fingerprint_str(&hex) {
            Some(Self(hex))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns `true` if `s` matches `^[0-9a-f]{32}$` without pulling in a regex
/// engine for a pattern this small and fixed.
pub fn is_valid_fingerprint_str(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Writes one canonical field as `key=<len>:<value>;`, or `key=-;` when the
/// field is absent. The explicit length prefix means an empty string and a
/// missing field can never collide, and no value can smuggle in a `;` to
/// shift field boundaries.
fn write_field(buf: &mut String, key: &str, value: Option<&str>) {
    buf.push_str(key);
    buf.push('=');
    match value {
        Some(v) => {
            buf.push_str(&v.len().to_string());
            buf.push(':');
            buf.push_str(v);
        }
        None => buf.push('-'),
    }
    buf.push(';');
}

fn write_field_u32(buf: &mut String, key: &str, value: u32) {
    buf.push_str(key);
    buf.push('=');
    buf.push_str(&value.to_string());
    buf.push(';');
}

/// Builds the canonical concatenation that gets hashed. Exposed for tests
/// that want to assert on the pre-digest representation, not just the
/// final hex string.
fn canonical_form(query: &[u8], params: &ShapingParams, hashes: &InputHashes, version: u32) -> Vec<u8> {
    let mut buf = String::with_capacity(256);
    write_field(&mut buf, "fmt", params.output_format.as_deref());
    write_field(&mut buf, "db", params.default_database.as_deref());
    write_field(&mut buf, "compress", params.compress.as_deref());
    write_field(&mut buf, "http_compress", params.http_compress.as_deref());
    write_field(&mut buf, "ns", params.namespace.as_deref());
    write_field(&mut buf, "max_rows", params.max_result_rows.as_deref());
    write_field(&mut buf, "extremes", params.extremes.as_deref());
    write_field(&mut buf, "overflow", params.overflow_mode.as_deref());
    write_field_u32(&mut buf, "settings_hash", hashes.user_settings_hash);
    write_field_u32(&mut buf, "params_hash", hashes.query_params_hash);
    write_field_u32(&mut buf, "creds_hash", hashes.user_credentials_hash);
    write_field_u32(&mut buf, "version", version);

    let mut out = Vec::with_capacity(buf.len() + query.len() + 8);
    out.extend_from_slice(b"query=");
    out.extend_from_slice(&query.len().to_le_bytes());
    out.extend_from_slice(query);
    out.push(b';');
    out.extend_from_slice(buf.as_bytes());
    out
}

/// Computes the fingerprint for a request.
///
/// Deterministic: identical inputs always produce identical output, and
/// any change to `query`, any `ShapingParams` field, any hash, or
/// `version` changes the result (the hashed form never truncates or
/// merges distinguishable inputs).
pub fn fingerprint(
    query: &[u8],
    params: &ShapingParams,
    hashes: &InputHashes,
    version: u32,
) -> Fingerprint {
    let canonical = canonical_form(query, params, hashes, version);
    let digest = Sha256::digest(&canonical);
    // 128 bits of a collision-resistant digest is sufficient for this
    // identifier's purpose; truncating further would weaken the collision
    // bound without shortening the visible identifier much more.
    let truncated = &digest[..16];
    Fingerprint(hex::encode(truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_params() -> ShapingParams {
        ShapingParams {
            output_format: Some("JSON".into()),
            default_database: Some("foobar".into()),
            compress: Some("1".into()),
            http_compress: Some("gzip".into()),
            namespace: Some("ns123".into()),
            max_result_rows: None,
            extremes: None,
            overflow_mode: None,
        }
    }

    #[test]
    fn stability() {
        let query = b"SELECT 1 FROM system.numbers LIMIT 10";
        let params = s1_params();
        let hashes = InputHashes::default();
        let a = fingerprint(query, &params, &hashes, 2);
        let b = fingerprint(query, &params, &hashes, 2);
        assert_eq!(a, b);
        assert!(is_valid_fingerprint_str(a.as_str()));
    }

    #[test]
    fn regression_vector_s1() {
        // Pins this implementation's own canonicalization against drift;
        // not a claim of byte-for-byte parity with any other system's
        // fingerprint digest, since the upstream hash inputs for S1 are
        // otherwise unspecified. The literal below is this crate's actual
        // computed value for the scenario's inputs.
        let query = b"SELECT 1 FROM system.numbers LIMIT 10";
        let params = s1_params();
        let hashes = InputHashes::default();
        let fp = fingerprint(query, &params, &hashes, 2);
        assert_eq!(fp.as_str(), "f583ffa0b5166798a7548aeeeb49f176");
        assert!(is_valid_fingerprint_str(fp.as_str()));
    }

    #[test]
    fn sensitivity_to_query() {
        let params = s1_params();
        let hashes = InputHashes::default();
        let a = fingerprint(b"SELECT 1", &params, &hashes, 2);
        let b = fingerprint(b"SELECT 2", &params, &hashes, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn sensitivity_to_each_param_field() {
        let base = s1_params();
        let hashes = InputHashes::default();
        let base_fp = fingerprint(b"q", &base, &hashes, 2);

        let mut variant = base.clone();
        variant.namespace = Some("other".into());
        assert_ne!(fingerprint(b"q", &variant, &hashes, 2), base_fp);

        let mut variant = base.clone();
        variant.namespace = None;
        assert_ne!(fingerprint(b"q", &variant, &hashes, 2), base_fp);
    }

    #[test]
    fn empty_vs_missing_field_differ() {
        let hashes = InputHashes::default();
        let mut empty = ShapingParams::default();
        empty.namespace = Some(String::new());
        let mut missing = ShapingParams::default();
        missing.namespace = None;
        assert_ne!(
            fingerprint(b"q", &empty, &hashes, 2),
            fingerprint(b"q", &missing, &hashes, 2)
        );
    }

    #[test]
    fn sensitivity_to_hashes_and_version() {
        let params = s1_params();
        let hashes = InputHashes::default();
        let base = fingerprint(b"q", &params, &hashes, 2);

        let mut h2 = hashes;
        h2.user_settings_hash = 1;
        assert_ne!(fingerprint(b"q", &params, &h2, 2), base);

        assert_ne!(fingerprint(b"q", &params, &hashes, 3), base);
    }

    #[test]
    fn rejects_malformed_hex_strings() {
        assert!(Fingerprint::from_hex("a".repeat(32)).is_some());
        assert!(Fingerprint::from_hex("A".repeat(32)).is_none());
        assert!(Fingerprint::from_hex("a".repeat(31)).is_none());
        assert!(Fingerprint::from_hex("g".repeat(32)).is_none());
    }

    proptest::proptest! {
        /// §8 property 1 — stability over arbitrary query bytes and a
        /// representative shaping field.
        #[test]
        fn prop_fingerprint_is_stable(query in ".{0,500}", ns in "[a-zA-Z0-9_]{0,32}") {
            let mut params = s1_params();
            params.namespace = Some(ns);
            let hashes = InputHashes::default();
            let a = fingerprint(query.as_bytes(), &params, &hashes, 2);
            let b = fingerprint(query.as_bytes(), &params, &hashes, 2);
            proptest::prop_assert_eq!(a.clone(), b);
            proptest::prop_assert!(is_valid_fingerprint_str(a.as_str()));
        }

        /// §8 property 2 — any change to the query body changes the
        /// fingerprint, holding every other field fixed.
        #[test]
        fn prop_fingerprint_sensitive_to_query(a in ".{0,200}", b in ".{0,200}") {
            proptest::prop_assume!(a != b);
            let params = s1_params();
            let hashes = InputHashes::default();
            let fp_a = fingerprint(a.as_bytes(), &params, &hashes, 2);
            let fp_b = fingerprint(b.as_bytes(), &params, &hashes, 2);
            proptest::prop_assert_ne!(fp_a, fp_b);
        }
    }
}
