//! CSRF guard middleware (spec.md §4.13). Applied with
//! `axum::middleware::from_fn_with_state(csrf_config, csrf_guard)`.

use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::CsrfConfig;
use crate::error::Error;
use crate::session::verify_csrf_token;

pub async fn csrf_guard(State(config): State<CsrfConfig>, request: Request, next: Next) -> Response {
    if matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return next.run(request).await;
    }

    let cookie_token = cookie_value(request.headers(), &config.cookie_name);
    let header_token = request
        .headers()
        .get(&config.header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let needs_form_scan = header_token.is_none() && content_type.starts_with("application/x-www-form-urlencoded");

    let (parts, body, form_token) = if needs_form_scan {
        let (parts, body) = request.into_parts();
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(_) => return Error::BadRequest("unreadable request body".into()).into_response(),
        };
        let form_token = find_form_field(&bytes, &config.form_field_name);
        (parts, Body::from(bytes), form_token)
    } else {
        let (parts, body) = request.into_parts();
        (parts, body, None)
    };

    if !verify_csrf_token(cookie_token.as_deref(), header_token.as_deref(), form_token.as_deref()) {
        return Error::Forbidden.into_response();
    }

    let request = Request::from_parts(parts, body);
    next.run(request).await
}

fn cookie_value(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(axum::http::header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key.trim() == name {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

fn find_form_field(body: &[u8], field: &str) -> Option<String> {
    let body = std::str::from_utf8(body).ok()?;
    for pair in body.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == field {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_field_is_found_among_other_pairs() {
        let body = b"name=ada&_csrf=abc123&lang=rust";
        assert_eq!(find_form_field(body, "_csrf").as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_field_yields_none() {
        let body = b"name=ada";
        assert_eq!(find_form_field(body, "_csrf"), None);
    }

    #[test]
    fn cookie_value_extracts_named_cookie() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, "a=1; csrf_token=xyz".parse().unwrap());
        assert_eq!(cookie_value(&headers, "csrf_token").as_deref(), Some("xyz"));
    }
}
