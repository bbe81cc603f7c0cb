//! ResponseWriter (spec.md §4.11): serializes a final `Value` plus the
//! `basil.http.response` block into status + headers + body.

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use cookie::{Cookie, SameSite};

use crate::value::{BasilDict, Value};

/// The mutable response block read back from `basil.http.response`
/// (spec.md §3).
pub struct ResponseBlock {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, CookieSpec)>,
}

impl Default for ResponseBlock {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }
}

/// A cookie to write: either a plain string value (secure defaults apply)
/// or the full option table from spec.md §4.11.
pub enum CookieSpec {
    Plain(String),
    Options {
        value: String,
        max_age_secs: Option<i64>,
        /// Absolute expiry as a Unix timestamp in seconds (spec.md §4.11
        /// `expires`: `{unix}`).
        expires_unix: Option<i64>,
        path: Option<String>,
        domain: Option<String>,
        secure: Option<bool>,
        http_only: Option<bool>,
        same_site: Option<String>,
    },
}

pub struct ResponseWriter {
    dev_mode: bool,
}

impl ResponseWriter {
    pub fn new(dev_mode: bool) -> Self {
        Self { dev_mode }
    }

    /// Steps 1–3 of spec.md §4.11.
    pub fn write(&self, value: Value, block: &ResponseBlock) -> Response {
        let mut response = self.write_body(value, block.status);

        for (name, value) in &block.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }

        for (name, spec) in &block.cookies {
            if let Some(header) = self.build_cookie(name, spec) {
                if let Ok(value) = HeaderValue::from_str(&header) {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
            }
        }

        response
    }

    fn write_body(&self, value: Value, status: u16) -> Response {
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);

        match value {
            Value::Null => {
                if status == 200 {
                    StatusCode::NO_CONTENT.into_response()
                } else {
                    (status_code, Body::empty()).into_response()
                }
            }
            Value::String(s) => {
                let is_html = s.trim_start().starts_with('<');
                let content_type = if is_html {
                    "text/html; charset=utf-8"
                } else {
                    "text/plain; charset=utf-8"
                };
                let mut response = (status_code, s).into_response();
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(content_type),
                );
                response
            }
            Value::Dictionary(ref dict) if dict.get("body").is_some() => {
                let inner = dict.get("body").unwrap();
                let status = dict
                    .get("status")
                    .and_then(|v| v.as_integer())
                    .map(|s| s as u16)
                    .unwrap_or(status);
                let mut response = self.write_body(inner, status);
                if let Some(headers) = dict.get("headers").and_then(|v| v.as_dict().cloned()) {
                    apply_headers(&mut response, &headers);
                }
                response
            }
            other => {
                let json = other.to_json();
                let mut response = (status_code, axum::Json(json)).into_response();
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
        }
    }

    fn build_cookie(&self, name: &str, spec: &CookieSpec) -> Option<String> {
        match spec {
            CookieSpec::Plain(value) => {
                let mut builder = Cookie::build((name.to_string(), value.clone()))
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax);
                if !self.dev_mode {
                    builder = builder.secure(true);
                }
                Some(builder.build().to_string())
            }
            CookieSpec::Options {
                value,
                max_age_secs,
                expires_unix,
                path,
                domain,
                secure,
                http_only,
                same_site,
            } => {
                let mut builder = Cookie::build((name.to_string(), value.clone()))
                    .path(path.clone().unwrap_or_else(|| "/".to_string()));

                if let Some(domain) = domain {
                    builder = builder.domain(domain.clone());
                }
                if let Some(max_age) = max_age_secs {
                    builder = builder.max_age(cookie::time::Duration::seconds(*max_age));
                }
                if let Some(unix) = expires_unix {
                    if let Ok(at) = cookie::time::OffsetDateTime::from_unix_timestamp(*unix) {
                        builder = builder.expires(at);
                    }
                }

                let same_site_value = same_site.as_deref().map(parse_same_site).unwrap_or(SameSite::Lax);
                // `SameSite=None` forces `Secure=true` (spec.md §4.11 table).
                let secure_value = secure.unwrap_or(!self.dev_mode) || same_site_value == SameSite::None;
                builder = builder.same_site(same_site_value);
                builder = builder.secure(secure_value);
                builder = builder.http_only(http_only.unwrap_or(true));

                Some(builder.build().to_string())
            }
        }
    }
}

fn parse_same_site(raw: &str) -> SameSite {
    match raw.to_ascii_lowercase().as_str() {
        "strict" => SameSite::Strict,
        "none" => SameSite::None,
        _ => SameSite::Lax,
    }
}

/// Merges a `headers` dictionary onto an already-built response (spec.md
/// §4.10 step 8, §4.11 step 3: the explicit `{status, headers, body}` shape
/// recurses on `body` using the declared status *and* headers).
fn apply_headers(response: &mut Response, headers: &BasilDict) {
    for key in headers.keys() {
        let Some(value) = headers.get(&key).and_then(|v| v.as_str().map(str::to_string)) else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            response.headers_mut().insert(name, value);
        }
    }
}

/// Reads `basil.http.response` back into a `ResponseBlock` (spec.md §4.9
/// step 12).
pub fn read_response_block(dict: &BasilDict) -> ResponseBlock {
    let status = dict
        .get("status")
        .and_then(|v| v.as_integer())
        .map(|s| s as u16)
        .unwrap_or(200);

    let headers = dict
        .get("headers")
        .and_then(|v| v.as_dict().cloned())
        .map(|headers| {
            headers
                .keys()
                .filter_map(|key| {
                    headers
                        .get(&key)
                        .and_then(|v| v.as_str().map(|s| (key.clone(), s.to_string())))
                })
                .collect()
        })
        .unwrap_or_default();

    let cookies = dict
        .get("cookies")
        .and_then(|v| v.as_dict().cloned())
        .map(|cookies| {
            cookies
                .keys()
                .filter_map(|key| cookies.get(&key).map(|v| (key.clone(), to_cookie_spec(v))))
                .collect()
        })
        .unwrap_or_default();

    ResponseBlock { status, headers, cookies }
}

fn to_cookie_spec(value: Value) -> CookieSpec {
    match value {
        Value::String(s) => CookieSpec::Plain(s),
        Value::Dictionary(dict) => CookieSpec::Options {
            value: dict.get("value").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default(),
            max_age_secs: dict.get("maxAge").and_then(as_max_age_secs),
            expires_unix: dict.get("expires").and_then(as_expires_unix),
            path: dict.get("path").and_then(|v| v.as_str().map(str::to_string)),
            domain: dict.get("domain").and_then(|v| v.as_str().map(str::to_string)),
            secure: dict.get("secure").and_then(as_bool),
            http_only: dict.get("httpOnly").and_then(as_bool),
            same_site: dict.get("sameSite").and_then(|v| v.as_str().map(str::to_string)),
        },
        _ => CookieSpec::Plain(String::new()),
    }
}

fn as_bool(value: Value) -> Option<bool> {
    match value {
        Value::Boolean(b) => Some(b),
        _ => None,
    }
}

const SECONDS_PER_MONTH: i64 = 30 * 24 * 3600;

/// `maxAge` accepts a plain integer (seconds) or a duration object —
/// `{totalSeconds}`, or `{months, seconds}` where `months` are treated as
/// 30-day periods (spec.md §4.11 cookie table).
fn as_max_age_secs(value: Value) -> Option<i64> {
    match value {
        Value::Integer(secs) => Some(secs),
        Value::Dictionary(dict) => {
            if let Some(total) = dict.get("totalSeconds").and_then(|v| v.as_integer()) {
                return Some(total);
            }
            let months = dict.get("months").and_then(|v| v.as_integer()).unwrap_or(0);
            let seconds = dict.get("seconds").and_then(|v| v.as_integer()).unwrap_or(0);
            if months == 0 && seconds == 0 {
                None
            } else {
                Some(months * SECONDS_PER_MONTH + seconds)
            }
        }
        _ => None,
    }
}

/// `expires` is an absolute duration object `{unix}` — a Unix timestamp in
/// seconds (spec.md §4.11 cookie table).
fn as_expires_unix(value: Value) -> Option<i64> {
    match value {
        Value::Dictionary(dict) => dict.get("unix").and_then(|v| v.as_integer()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_value_at_default_status_is_204() {
        let writer = ResponseWriter::new(false);
        let response = writer.write(Value::Null, &ResponseBlock::default());
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn string_starting_with_angle_bracket_is_html() {
        let writer = ResponseWriter::new(false);
        let response = writer.write(Value::String("<p>hi</p>".into()), &ResponseBlock::default());
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/html"));
    }

    #[test]
    fn plain_string_is_text_plain() {
        let writer = ResponseWriter::new(false);
        let response = writer.write(Value::String("hi".into()), &ResponseBlock::default());
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }

    #[test]
    fn array_is_json_encoded() {
        let writer = ResponseWriter::new(false);
        let response = writer.write(
            Value::Array(vec![Value::Integer(1), Value::Integer(2)]),
            &ResponseBlock::default(),
        );
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert_eq!(content_type, "application/json");
    }

    #[test]
    fn same_site_none_forces_secure() {
        let writer = ResponseWriter::new(true);
        let header = writer
            .build_cookie(
                "sess",
                &CookieSpec::Options {
                    value: "x".into(),
                    max_age_secs: None,
                    expires_unix: None,
                    path: None,
                    domain: None,
                    secure: None,
                    http_only: None,
                    same_site: Some("None".into()),
                },
            )
            .unwrap();
        assert!(header.contains("Secure"));
        assert!(header.contains("SameSite=None"));
    }

    #[test]
    fn explicit_cookie_options_render_expected_attributes() {
        let writer = ResponseWriter::new(false);
        let header = writer
            .build_cookie(
                "name",
                &CookieSpec::Options {
                    value: "x".into(),
                    max_age_secs: Some(3600),
                    expires_unix: None,
                    path: None,
                    domain: None,
                    secure: None,
                    http_only: Some(true),
                    same_site: Some("Strict".into()),
                },
            )
            .unwrap();
        assert!(header.contains("Path=/"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Strict"));
        assert!(header.contains("Max-Age=3600"));
    }

    #[test]
    fn body_dict_with_headers_merges_them_onto_the_recursed_response() {
        let env = crate::value::Environment::new(std::path::PathBuf::from("/tmp"));
        let dict = BasilDict::new(&env);
        dict.insert("status", Value::Integer(201));
        let headers = BasilDict::new(&env);
        headers.insert("X-Foo", Value::String("bar".into()));
        dict.insert("headers", Value::Dictionary(headers));
        dict.insert("body", Value::String("ok".into()));

        let writer = ResponseWriter::new(false);
        let response = writer.write(Value::Dictionary(dict), &ResponseBlock::default());
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-foo").unwrap(), "bar");
    }

    #[test]
    fn max_age_accepts_total_seconds_duration_object() {
        let env = crate::value::Environment::new(std::path::PathBuf::from("/tmp"));
        let dict = BasilDict::new(&env);
        let duration = BasilDict::new(&env);
        duration.insert("totalSeconds", Value::Integer(120));
        dict.insert("maxAge", Value::Dictionary(duration));
        assert_eq!(as_max_age_secs(Value::Dictionary(dict.clone())), None);
        assert_eq!(as_max_age_secs(dict.get("maxAge").unwrap()), Some(120));
    }

    #[test]
    fn max_age_accepts_months_and_seconds_duration_object() {
        let env = crate::value::Environment::new(std::path::PathBuf::from("/tmp"));
        let duration = BasilDict::new(&env);
        duration.insert("months", Value::Integer(1));
        duration.insert("seconds", Value::Integer(30));
        assert_eq!(as_max_age_secs(Value::Dictionary(duration)), Some(SECONDS_PER_MONTH + 30));
    }

    #[test]
    fn expires_reads_unix_timestamp_and_renders_expires_header() {
        let env = crate::value::Environment::new(std::path::PathBuf::from("/tmp"));
        let duration = BasilDict::new(&env);
        duration.insert("unix", Value::Integer(2_000_000_000));
        assert_eq!(as_expires_unix(Value::Dictionary(duration)), Some(2_000_000_000));

        let writer = ResponseWriter::new(false);
        let header = writer
            .build_cookie(
                "name",
                &CookieSpec::Options {
                    value: "x".into(),
                    max_age_secs: None,
                    expires_unix: Some(2_000_000_000),
                    path: None,
                    domain: None,
                    secure: None,
                    http_only: None,
                    same_site: None,
                },
            )
            .unwrap();
        assert!(header.contains("Expires="));
    }
}
