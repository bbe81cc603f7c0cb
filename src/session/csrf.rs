//! CSRF token generation and verification (spec.md §4.13).
//!
//! A 64-hex-char token lives in a cookie; non-safe methods must present the
//! same value back via either the `_csrf` form field or the
//! `X-CSRF-Token` header. Comparison is constant-time.

use rand::RngCore;

#[derive(Debug, Clone)]
pub struct CsrfToken(String);

impl CsrfToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn from_cookie_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks the cookie token against the header token *or* the form-field
/// token (spec.md §4.13: "a form field `_csrf` or header `X-CSRF-Token`"),
/// preferring the header when both are present.
pub fn verify_csrf_token(cookie_token: Option<&str>, header_token: Option<&str>, form_token: Option<&str>) -> bool {
    let Some(cookie) = cookie_token else { return false };
    match header_token.or(form_token) {
        Some(candidate) => constant_time_eq(cookie.as_bytes(), candidate.as_bytes()),
        None => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_is_64_hex_chars() {
        let token = CsrfToken::generate();
        assert_eq!(token.as_str().len(), 64);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn matching_header_token_passes() {
        let token = CsrfToken::generate();
        assert!(verify_csrf_token(Some(token.as_str()), Some(token.as_str()), None));
    }

    #[test]
    fn matching_form_field_passes_when_no_header_present() {
        let token = CsrfToken::generate();
        assert!(verify_csrf_token(Some(token.as_str()), None, Some(token.as_str())));
    }

    #[test]
    fn mismatched_token_fails() {
        let cookie = CsrfToken::generate();
        let other = CsrfToken::generate();
        assert!(!verify_csrf_token(Some(cookie.as_str()), Some(other.as_str()), None));
    }

    #[test]
    fn missing_cookie_fails_even_with_a_matching_header() {
        let token = CsrfToken::generate();
        assert!(!verify_csrf_token(None, Some(token.as_str()), None));
    }
}
