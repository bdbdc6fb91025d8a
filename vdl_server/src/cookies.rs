//! Minimal cookie plumbing for the `user_id` cookie.

use axum::http::HeaderMap;

const COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;

/// Value of a cookie from the request headers, if present.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(axum::http::header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                if let Some(value) = parts.next() {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

/// `Set-Cookie` value for a freshly issued user id.
pub fn user_cookie(user_id: &str) -> String {
    format!("user_id={user_id}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}; SameSite=Lax")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    #[test]
    fn finds_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "theme=dark; user_id=abc-123; lang=en".parse().unwrap());
        assert_eq!(cookie_value(&headers, "user_id").as_deref(), Some("abc-123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn empty_value_counts_as_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "user_id=".parse().unwrap());
        assert_eq!(cookie_value(&headers, "user_id"), None);
    }
}
