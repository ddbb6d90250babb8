//! Official-account handshake signature.
//!
//! The platform signs the URL-verification request by sorting
//! `{timestamp, nonce, token}` lexicographically, concatenating them and
//! taking the lowercase hex SHA-1 digest of the result.

use sha1::{Digest, Sha1};

/// Computes the expected handshake signature for the given parts.
pub fn compute_signature(timestamp: &str, nonce: &str, token: &str) -> String {
    let mut parts = [timestamp, nonce, token];
    parts.sort_unstable();

    let mut sha = Sha1::new();
    sha.update(parts.concat().as_bytes());
    hex::encode(sha.finalize())
}

/// Returns `true` when `signature` matches the sorted SHA-1 of the parts.
///
/// The comparison is case-sensitive: the platform always sends lowercase hex.
pub fn verify_signature(signature: &str, timestamp: &str, nonce: &str, token: &str) -> bool {
    compute_signature(timestamp, nonce, token) == signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_sorted_sha1() {
        let token = "tankkyo_chatbot";
        let timestamp = "1700000000";
        let nonce = "nonce123";

        let mut parts = vec![token, timestamp, nonce];
        parts.sort_unstable();
        let mut sha = Sha1::new();
        sha.update(parts.join(""));
        let signature = hex::encode(sha.finalize());

        assert!(verify_signature(&signature, timestamp, nonce, token));
    }

    #[test]
    fn argument_order_does_not_matter_for_digest() {
        assert_eq!(
            compute_signature("b", "a", "c"),
            compute_signature("c", "b", "a")
        );
    }

    #[test]
    fn any_single_character_mutation_fails() {
        let signature = compute_signature("1700000000", "n", "secret");
        for idx in 0..signature.len() {
            let mut mutated: Vec<char> = signature.chars().collect();
            mutated[idx] = if mutated[idx] == '0' { '1' } else { '0' };
            let mutated: String = mutated.into_iter().collect();
            assert!(!verify_signature(&mutated, "1700000000", "n", "secret"));
        }
    }

    #[test]
    fn uppercase_signature_is_rejected() {
        let signature = compute_signature("1700000000", "n", "secret").to_ascii_uppercase();
        assert!(!verify_signature(&signature, "1700000000", "n", "secret"));
    }

    #[test]
    fn wrong_token_is_rejected() {
        let signature = compute_signature("1700000000", "n", "secret");
        assert!(!verify_signature(&signature, "1700000000", "n", "other"));
    }
}
