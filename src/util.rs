use sha2::{Digest, Sha256};

const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int has undefined behaviour for huge floats. Refuse to convert floats with
/// magnitude greater than 2**53 - 1, after which 64-bit floats no longer retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.is_finite() && f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

/// One-way hash of a context key as handed to big segment stores: base64 of its SHA-256 digest.
pub(crate) fn hash_context_key(key: &str) -> String {
    use base64::Engine;

    let digest = Sha256::digest(key.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1.99, Some(1) ; "truncates positive fraction")]
    #[test_case(9007199254740991.0, Some(9007199254740991) ; "largest safe integer")]
    #[test_case(9007199254740992.0, None ; "above safe range")]
    #[test_case(-1.99, Some(-1) ; "truncates negative fraction")]
    #[test_case(-9007199254740992.0, None ; "below safe range")]
    #[test_case(f64::NAN, None ; "nan")]
    #[test_case(f64::INFINITY, None ; "infinity")]
    fn float_bounds(have: f64, expect: Option<i64>) {
        assert_eq!(f64_to_i64_safe(have), expect);
    }

    #[test]
    fn context_key_hash_is_base64_sha256() {
        // echo -n "userkey" | openssl dgst -sha256 -binary | base64
        assert_eq!(
            hash_context_key("userkey"),
            "72cBpXPyn4N6TqqlS8Tti37jEcoNhFzL9ZdG1jXkILE="
        );
        assert_ne!(hash_context_key("a"), hash_context_key("b"));
    }
}
