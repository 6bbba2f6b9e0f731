//! Opaque token values: `qr_` followed by 22 base62 characters drawn from the
//! OS CSPRNG (~131 bits of entropy).

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

pub const TOKEN_PREFIX: &str = "qr_";
pub const TOKEN_BODY_LEN: usize = 22;
pub const TOKEN_LEN: usize = TOKEN_PREFIX.len() + TOKEN_BODY_LEN;

/// Path segment under which tokens are embedded in printed URLs.
const SCAN_PATH: &str = "/qr/";

pub fn generate() -> String {
    let body: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_BODY_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", TOKEN_PREFIX, body)
}

/// Structural check only: prefix, length, charset. Never touches storage.
pub fn is_valid_format(s: &str) -> bool {
    s.len() == TOKEN_LEN
        && s.starts_with(TOKEN_PREFIX)
        && s[TOKEN_PREFIX.len()..].bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Accepts either a bare token or the full printed URL
/// (`https://<host>/qr/<token>?...`) and returns the candidate token text.
/// The result still has to pass [`is_valid_format`].
pub fn extract_candidate(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.rfind(SCAN_PATH) {
        Some(idx) => {
            let rest = &trimmed[idx + SCAN_PATH.len()..];
            let end = rest.find(['?', '#', '/']).unwrap_or(rest.len());
            &rest[..end]
        }
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_tokens_are_well_formed() {
        for _ in 0..1_000 {
            let t = generate();
            assert_eq!(t.len(), TOKEN_LEN);
            assert!(is_valid_format(&t), "generated token failed validation: {}", t);
        }
    }

    #[test]
    fn test_generated_tokens_do_not_repeat() {
        let set: HashSet<String> = (0..5_000).map(|_| generate()).collect();
        assert_eq!(set.len(), 5_000);
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(!is_valid_format(""));
        assert!(!is_valid_format("qr_"));
        assert!(!is_valid_format("qr_abc"));
        // right length, wrong prefix
        assert!(!is_valid_format("xx_ABCDEFGHIJKLMNOPQRSTUV"));
        // one char too long / too short
        assert!(!is_valid_format("qr_ABCDEFGHIJKLMNOPQRSTUVW"));
        assert!(!is_valid_format("qr_ABCDEFGHIJKLMNOPQRSTU"));
        // non-base62 characters
        assert!(!is_valid_format("qr_ABCDEFGHIJKLMNOPQRST-V"));
        assert!(!is_valid_format("qr_ABCDEFGHIJKLMNOPQRST V"));
        assert!(!is_valid_format("qr_ABCDEFGHIJKLMNOPQRSTé"));
        assert!(is_valid_format("qr_ABCDEFGHIJKLMNOPQRSTU9"));
    }

    #[test]
    fn test_extract_candidate_from_printed_url() {
        let tok = "qr_ABCDEFGHIJKLMNOPQRSTU9";
        assert_eq!(extract_candidate(tok), tok);
        assert_eq!(extract_candidate(&format!("  {}\n", tok)), tok);
        assert_eq!(
            extract_candidate(&format!("https://labels.example.com/qr/{}?utm=x", tok)),
            tok
        );
        assert_eq!(extract_candidate(&format!("https://h/qr/{}/", tok)), tok);
        assert_eq!(extract_candidate("https://h/other/path"), "https://h/other/path");
    }
}
