//! Salted password hashing for playback users.
//!
//! Hashes are stored and compared as lowercase hex of `H(salt + password)`.

use sha1::{Digest, Sha1};
use sha2::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Sha1,
    Sha256,
}

/// Hex digest of `salt + password` under the given algorithm.
pub fn make_hash(hash_type: HashType, password: &str, salt: &str) -> String {
    match hash_type {
        HashType::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(salt.as_bytes());
            hasher.update(password.as_bytes());
            format!("{:x}", hasher.finalize())
        }
        HashType::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(salt.as_bytes());
            hasher.update(password.as_bytes());
            format!("{:x}", hasher.finalize())
        }
    }
}

/// Check a candidate password against a stored hex hash.
pub fn check_hash(hash_type: HashType, password: &str, salt: &str, expected_hex: &str) -> bool {
    make_hash(hash_type, password, salt).eq_ignore_ascii_case(expected_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Known vectors: sha256("pepper" + "secret") and sha1 of the same input.
    #[test]
    fn known_digests_match() {
        assert_eq!(
            make_hash(HashType::Sha256, "secret", "pepper"),
            "744a9101f7182a6ae0d978121ff74e33cac8d2832579c0637c1c37e9bbb6c065"
        );
        assert_eq!(
            make_hash(HashType::Sha1, "secret", "pepper"),
            "4f2a9862378c29783ab305c0aea53c1f1cb67b1d"
        );
    }

    #[test]
    fn check_accepts_uppercase_stored_hash() {
        assert!(check_hash(
            HashType::Sha256,
            "pass",
            "salt",
            "9C95BF909CF17BEAA7A4C71D86671566294699A994DB7AAA8FFEA004F425954F"
        ));
    }

    #[test]
    fn check_rejects_wrong_password_and_wrong_salt() {
        let stored = make_hash(HashType::Sha256, "pass", "salt");
        assert!(!check_hash(HashType::Sha256, "wrong", "salt", &stored));
        assert!(!check_hash(HashType::Sha256, "pass", "other", &stored));
        assert!(!check_hash(HashType::Sha1, "pass", "salt", &stored));
    }
}
