//! RequestContextBuilder (spec.md §4.6): a pure translation from an HTTP
//! request into the script-visible record that becomes `basil.http.request`.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;

use crate::value::{BasilDict, Environment, Value};

const MAX_MULTIPART_BYTES: usize = 32 * 1024 * 1024;

/// One parsed multipart field: either a plain value or a file part whose
/// content is never exposed to the script, only its metadata (spec.md §4.6).
pub enum MultipartField {
    Value(String),
    File { filename: String, size: usize, content_type: Option<String> },
}

/// A canonical path object for filesystem routing (spec.md §4.6).
pub fn subpath_value(segments: &[String]) -> Value {
    let dict = BasilDict::detached();
    dict.insert("__type", Value::String("path".into()));
    dict.insert("absolute", Value::Boolean(false));
    dict.insert(
        "segments",
        Value::Array(segments.iter().map(|s| Value::String(s.clone())).collect()),
    );
    Value::Dictionary(dict)
}

/// Builds the `basil.http.request` dictionary. `env` provides the
/// dictionary's owning Environment for lazily-evaluated slots, though
/// nothing here is lazy today — every field is known up front.
#[allow(clippy::too_many_arguments)]
pub fn build_request_context(
    env: &Environment,
    method: &Method,
    path: &str,
    raw_query: &str,
    headers: &HeaderMap,
    host: &str,
    remote_addr: &str,
    body: Option<(&str, Bytes)>,
) -> BasilDict {
    let dict = BasilDict::new(env);
    dict.insert("method", Value::String(method.to_string()));
    dict.insert("path", Value::String(path.to_string()));
    dict.insert("query", Value::Dictionary(parse_query(raw_query, env)));
    dict.insert("headers", Value::Dictionary(headers_to_dict(headers, env)));
    dict.insert("cookies", Value::Dictionary(cookies_to_dict(headers, env)));
    dict.insert("host", Value::String(host.to_string()));
    dict.insert("remoteAddr", Value::String(remote_addr.to_string()));

    if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        if let Some((content_type, bytes)) = body {
            apply_body(&dict, env, content_type, bytes);
        }
    }

    dict
}

fn apply_body(dict: &BasilDict, env: &Environment, raw_content_type: &str, bytes: Bytes) {
    let media_type = raw_content_type.split(';').next().unwrap_or("").trim();

    if media_type == "multipart/form-data" {
        if bytes.len() > MAX_MULTIPART_BYTES {
            tracing::warn!(size = bytes.len(), "multipart body exceeds 32 MiB in-memory limit");
        }
        let boundary = boundary_from_header(raw_content_type);
        let (fields, files) = parse_multipart(&bytes, boundary.as_deref());
        let form = BasilDict::new(env);
        for (name, value) in fields {
            form.insert(name, Value::String(value));
        }
        dict.insert("form", Value::Dictionary(form));

        let files_dict = BasilDict::new(env);
        for (name, file) in files {
            let entry = BasilDict::new(env);
            entry.insert("filename", Value::String(file.filename));
            entry.insert("size", Value::Integer(file.size as i64));
            if let Some(ct) = file.content_type {
                entry.insert("contentType", Value::String(ct));
            }
            files_dict.insert(name, Value::Dictionary(entry));
        }
        dict.insert("files", Value::Dictionary(files_dict));
        return;
    }

    if media_type == "application/x-www-form-urlencoded" {
        let raw = String::from_utf8_lossy(&bytes);
        dict.insert("form", Value::Dictionary(parse_query(&raw, env)));
        return;
    }

    if media_type == "application/json" {
        let raw = String::from_utf8_lossy(&bytes).to_string();
        dict.insert("body", Value::String(raw.clone()));
        if let Ok(json @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(&raw) {
            dict.insert("json", json_to_value(&json, env));
        }
        return;
    }

    dict.insert("body", Value::String(String::from_utf8_lossy(&bytes).to_string()));
}

fn json_to_value(json: &serde_json::Value, env: &Environment) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(|v| json_to_value(v, env)).collect())
        }
        serde_json::Value::Object(map) => {
            let dict = BasilDict::new(env);
            for (k, v) in map {
                dict.insert(k.clone(), json_to_value(v, env));
            }
            Value::Dictionary(dict)
        }
    }
}

/// Last-value-wins query parsing, with a parallel `__all` suffix entry
/// holding the full slice when a key repeats (spec.md §4.6).
fn parse_query(raw_query: &str, env: &Environment) -> BasilDict {
    let dict = BasilDict::new(env);
    let mut multi: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();

    for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (decode_form(k), decode_form(v)),
            None => (decode_form(pair), String::new()),
        };
        multi.entry(key.clone()).or_default().push(value.clone());
        dict.insert(key, Value::String(value));
    }

    for (key, values) in multi {
        if values.len() > 1 {
            dict.insert(
                format!("{key}__all"),
                Value::Array(values.into_iter().map(Value::String).collect()),
            );
        }
    }

    dict
}

fn decode_form(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hi = chars.next();
                let lo = chars.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                        out.push(byte as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other),
        }
    }
    out
}

fn headers_to_dict(headers: &HeaderMap, env: &Environment) -> BasilDict {
    let dict = BasilDict::new(env);
    for name in headers.keys() {
        if let Some(value) = headers.get(name) {
            dict.insert(
                name.as_str().to_string(),
                Value::String(value.to_str().unwrap_or("").to_string()),
            );
        }
    }
    dict
}

fn cookies_to_dict(headers: &HeaderMap, env: &Environment) -> BasilDict {
    let dict = BasilDict::new(env);
    for value in headers.get_all(axum::http::header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                dict.insert(name.trim().to_string(), Value::String(value.trim().to_string()));
            }
        }
    }
    dict
}

fn boundary_from_header(raw_content_type: &str) -> Option<String> {
    raw_content_type.split(';').skip(1).find_map(|param| {
        let param = param.trim();
        param
            .strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    })
}

struct ParsedFile {
    filename: String,
    size: usize,
    content_type: Option<String>,
}

/// A minimal multipart/form-data scanner: enough to split fields and
/// file-part metadata out of a boundary-delimited body without pulling in
/// a full multipart crate. File content itself is discarded immediately
/// after its length is measured (spec.md §4.6: "never file content").
fn parse_multipart(body: &[u8], boundary: Option<&str>) -> (Vec<(String, String)>, Vec<(String, ParsedFile)>) {
    let mut fields = Vec::new();
    let mut files = Vec::new();

    let Some(boundary) = boundary else {
        return (fields, files);
    };
    let delimiter = format!("--{boundary}").into_bytes();

    let parts: Vec<&[u8]> = split_on(body, &delimiter);
    for part in parts {
        let part = trim_crlf(part);
        if part.is_empty() || part == b"--" {
            continue;
        }
        let Some(header_end) = find(part, b"\r\n\r\n") else {
            continue;
        };
        let header_block = &part[..header_end];
        let content = &part[header_end + 4..];
        let content = trim_trailing_crlf(content);

        let header_text = String::from_utf8_lossy(header_block);
        let Some(disposition) = header_text
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
        else {
            continue;
        };
        let name = extract_quoted(disposition, "name").unwrap_or_default();
        let filename = extract_quoted(disposition, "filename");

        if let Some(filename) = filename {
            let content_type = header_text
                .lines()
                .find(|l| l.to_ascii_lowercase().starts_with("content-type"))
                .and_then(|l| l.split_once(':'))
                .map(|(_, v)| v.trim().to_string());
            files.push((
                name,
                ParsedFile { filename, size: content.len(), content_type },
            ));
        } else {
            fields.push((name, String::from_utf8_lossy(content).to_string()));
        }
    }

    (fields, files)
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = find(rest, needle) {
        parts.push(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    parts.push(rest);
    parts
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len().max(1))
        .position(|window| window == needle)
}

fn trim_crlf(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(b"\r\n").unwrap_or(bytes);
    bytes
}

fn trim_trailing_crlf(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\r\n").unwrap_or(bytes)
}

fn extract_quoted(header_line: &str, key: &str) -> Option<String> {
    let marker = format!("{key}=\"");
    let start = header_line.find(&marker)? + marker.len();
    let end = header_line[start..].find('"')? + start;
    Some(header_line[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn query_last_value_wins_with_all_values_preserved() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let dict = parse_query("a=1&a=2&b=x", &env);
        assert_eq!(dict.get("a").unwrap().as_str(), Some("2"));
        let all = dict.get("a__all").unwrap();
        match all {
            Value::Array(items) => assert_eq!(items.len(), 2),
            _ => panic!("expected array"),
        }
        assert_eq!(dict.get("b").unwrap().as_str(), Some("x"));
    }

    #[test]
    fn form_urlencoded_body_is_parsed_as_form() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let dict = build_request_context(
            &env,
            &Method::POST,
            "/submit",
            "",
            &HeaderMap::new(),
            "example.com",
            "127.0.0.1",
            Some((
                "application/x-www-form-urlencoded",
                Bytes::from_static(b"name=ada&lang=rust"),
            )),
        );
        let form = dict.get("form").unwrap();
        let form_dict = form.as_dict().unwrap();
        assert_eq!(form_dict.get("name").unwrap().as_str(), Some("ada"));
        assert_eq!(form_dict.get("lang").unwrap().as_str(), Some("rust"));
    }

    #[test]
    fn json_body_decodes_object_into_dictionary() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let dict = build_request_context(
            &env,
            &Method::POST,
            "/submit",
            "",
            &HeaderMap::new(),
            "example.com",
            "127.0.0.1",
            Some(("application/json", Bytes::from_static(br#"{"ok":true}"#))),
        );
        let json = dict.get("json").unwrap();
        assert!(matches!(json.as_dict().unwrap().get("ok"), Some(Value::Boolean(true))));
    }

    #[test]
    fn cookies_are_parsed_into_name_value_pairs() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, "a=1; b=2".parse().unwrap());
        let dict = cookies_to_dict(&headers, &env);
        assert_eq!(dict.get("a").unwrap().as_str(), Some("1"));
        assert_eq!(dict.get("b").unwrap().as_str(), Some("2"));
    }

    #[test]
    fn subpath_value_shapes_a_path_object() {
        let value = subpath_value(&["2025".into(), "Q4".into()]);
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get("__type").unwrap().as_str(), Some("path"));
    }
}
