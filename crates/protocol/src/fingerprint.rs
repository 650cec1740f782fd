//! Certificate fingerprints.
//!
//! The signaler prints its certificate's fingerprint at startup and agents
//! pin it in their known-hosts files, so both sides must render it the
//! same way: the SHA-1 digest of the DER certificate as uppercase
//! colon-separated hex.

use sha1::{Digest, Sha1};

/// Renders a certificate's SHA-1 digest in the known-hosts form.
pub fn fingerprint(der: &[u8]) -> String {
    Sha1::digest(der)
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        // 20 bytes as uppercase hex pairs joined by colons.
        let fp = fingerprint(b"anything");
        assert_eq!(fp.len(), 20 * 2 + 19);
        assert_eq!(fp.matches(':').count(), 19);
        assert!(fp
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase() || c == ':'));
    }

    #[test]
    fn test_known_vector() {
        // SHA-1 of "abc" is A9993E364706816ABA3E25717850C26C9CD0D89D.
        let fp = fingerprint(b"abc");
        assert!(fp.starts_with("A9:99:3E:36"));
        assert!(fp.ends_with("D0:D8:9D"));
    }

    #[test]
    fn test_stable() {
        assert_eq!(fingerprint(b"der"), fingerprint(b"der"));
        assert_ne!(fingerprint(b"der"), fingerprint(b"other"));
    }
}
