//! Deterministic request fingerprints.
//!
//! A fingerprint is the lowercase hex SHA-256 of a canonical string built from
//! named fields. Every field is always present in the canonical string: values
//! are length-prefixed and absent values use a bare sentinel, so a literal
//! `"nil"` value can never collide with a missing one.

use std::fmt;

use sha2::{Digest, Sha256};

/// Sentinel written in place of an absent field value.
const ABSENT: &str = "nil";

/// Separator between encoded fields.
const FIELD_SEPARATOR: char = '\n';

/// Hex-encoded 256-bit digest identifying a source, an output, or a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an ordered list of named, optionally absent fields.
    pub fn of_fields(fields: &[(&str, Option<String>)]) -> Self {
        Self::digest(canonical_string(fields).as_bytes())
    }

    /// Combine a source fingerprint and an output fingerprint into the
    /// fingerprint of a full request.
    pub fn combine(source: &Fingerprint, output: &Fingerprint) -> Self {
        Self::digest(format!("{}_{}", source.0, output.0).as_bytes())
    }

    /// Hash raw bytes.
    fn digest(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
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

/// Build the canonical, injective encoding of a field list.
fn canonical_string(fields: &[(&str, Option<String>)]) -> String {
    let mut out = String::new();
    for (i, (name, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        out.push_str(name);
        out.push(':');
        match value {
            Some(v) => {
                out.push_str(&v.len().to_string());
                out.push(':');
                out.push_str(v);
            }
            None => out.push_str(ABSENT),
        }
    }
    out
}

/// Render a float in a stable, locale-independent form.
///
/// Uses the shortest representation that round-trips, with `-0.0` folded
/// into `0.0`.
pub fn canonical_float(value: f64) -> String {
    let normalized = if value == 0.0 { 0.0 } else { value };
    format!("{normalized}")
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = Fingerprint::of_fields(&[("source", Some("a.png".to_string()))]);
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.as_str(), fp.as_str().to_lowercase());
    }

    #[test]
    fn same_fields_same_fingerprint() {
        let fields = [
            ("format", Some("jpeg".to_string())),
            ("size", None),
            ("quality", Some(canonical_float(0.8))),
        ];
        assert_eq!(Fingerprint::of_fields(&fields), Fingerprint::of_fields(&fields));
    }

    #[test]
    fn known_digest_is_stable_across_runs() {
        // sha256("a:nil")
        let fp = Fingerprint::of_fields(&[("a", None)]);
        assert_eq!(
            fp.as_str(),
            hex::encode(Sha256::digest(b"a:nil")),
        );
    }

    #[test]
    fn absent_value_does_not_collide_with_literal_nil() {
        let absent = Fingerprint::of_fields(&[("size", None)]);
        let literal = Fingerprint::of_fields(&[("size", Some("nil".to_string()))]);
        assert_ne!(absent, literal);
    }

    #[test]
    fn separator_inside_value_does_not_shift_fields() {
        let a = Fingerprint::of_fields(&[
            ("a", Some("x\nb:1:y".to_string())),
            ("b", None),
        ]);
        let b = Fingerprint::of_fields(&[
            ("a", Some("x".to_string())),
            ("b", Some("y".to_string())),
        ]);
        assert_ne!(a, b);
    }

    #[test]
    fn field_order_matters() {
        let a = Fingerprint::of_fields(&[("w", Some("1".into())), ("h", Some("2".into()))]);
        let b = Fingerprint::of_fields(&[("h", Some("2".into())), ("w", Some("1".into()))]);
        assert_ne!(a, b);
    }

    #[test]
    fn combine_matches_underscore_join() {
        let s = Fingerprint::of_fields(&[("source", Some("s".into()))]);
        let o = Fingerprint::of_fields(&[("format", Some("png".into()))]);
        let expected = hex::encode(Sha256::digest(format!("{s}_{o}").as_bytes()));
        assert_eq!(Fingerprint::combine(&s, &o).as_str(), expected);
    }

    #[test]
    fn distinct_values_rarely_collide() {
        let mut seen = HashSet::new();
        for i in 0..5_000 {
            let fp = Fingerprint::of_fields(&[("n", Some(i.to_string()))]);
            assert!(seen.insert(fp), "collision at {i}");
        }
    }

    #[test]
    fn canonical_float_is_stable() {
        assert_eq!(canonical_float(0.8), "0.8");
        assert_eq!(canonical_float(0.80), "0.8");
        assert_eq!(canonical_float(1.0), "1");
        assert_eq!(canonical_float(-0.0), "0");
        assert_eq!(canonical_float(0.0), "0");
        assert_ne!(canonical_float(0.8), canonical_float(0.81));
    }
}
