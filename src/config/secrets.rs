//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides the constant-time comparison used
//! to check the pre-shared API key.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
use subtle::ConstantTimeEq;

/// Compare a presented key against the configured one without
/// short-circuiting on the first differing byte.
pub fn key_matches(expected: &SecretString, presented: &str) -> bool {
    let expected = expected.expose_secret().as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    bool::from(expected.ct_eq(presented))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_comparison() {
        let key = SecretString::from("s3cret");
        assert!(key_matches(&key, "s3cret"));
        assert!(!key_matches(&key, "s3creT"));
        assert!(!key_matches(&key, "s3cret-longer"));
        assert!(!key_matches(&key, ""));
    }
}
