//! PageHandler (spec.md §4.9): evaluates page scripts, extracts response
//! metadata, handles redirects and errors.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

use crate::cache::{response::cache_key, FragmentCache, ResponseCache, ScriptCache};
use crate::context::{build_request_context, subpath_value};
use crate::error::Error;
use crate::error_renderer::ErrorRenderer;
use crate::response::{read_response_block, ResponseWriter};
use crate::session::{CsrfToken, SessionStore};
use crate::value::{BasilDict, Environment, Evaluator, SecurityPolicy, Value};

pub struct PageHandler {
    pub scripts: Arc<ScriptCache>,
    pub responses: Arc<ResponseCache>,
    pub fragments: Arc<FragmentCache>,
    pub sessions: Arc<dyn SessionStore>,
    pub evaluator: Arc<dyn Evaluator>,
    pub writer: ResponseWriter,
    pub error_renderer: Arc<ErrorRenderer>,
    pub dev_mode: bool,
    pub session_cookie_name: String,
    pub csrf_cookie_name: String,
}

#[allow(clippy::too_many_arguments)]
pub struct PageRequest<'a> {
    pub handler_path: &'a Path,
    pub root_path: &'a Path,
    pub cacheable: bool,
    pub cache_ttl: Duration,
    pub method: &'a Method,
    pub path: &'a str,
    pub raw_query: &'a str,
    pub headers: &'a HeaderMap,
    pub host: &'a str,
    pub remote_addr: &'a str,
    pub body: Option<(&'a str, Bytes)>,
    pub subpath: Option<Vec<String>>,
    pub auth_required: bool,
    pub user: Option<Value>,
    pub public_dir: Option<&'a Path>,
}

impl PageHandler {
    pub fn handle(&self, req: PageRequest) -> Response {
        // Step 1: cached-response consult.
        let key = cache_key(req.method.as_str(), req.path, req.raw_query);
        if req.cacheable && *req.method == Method::GET {
            if let Some(entry) = self.responses.get(&key) {
                let mut response = (
                    StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
                    entry.body.clone(),
                )
                    .into_response();
                *response.headers_mut() = entry.headers.clone();
                response
                    .headers_mut()
                    .insert("x-cache", HeaderValue::from_static("HIT"));
                return response;
            }
        }

        // Step 2: obtain the parsed program.
        let program = match self.scripts.get_ast(req.handler_path) {
            Ok(program) => program,
            Err(Error::Parse(parse_err)) => {
                return self.error_renderer.render_parse_error(&parse_err, req.root_path);
            }
            Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response(),
        };

        // Step 3: fresh-per-request module imports.
        self.evaluator.clear_module_cache();

        // Step 4: issue or reuse the CSRF token.
        let existing_csrf = read_cookie(req.headers, &self.csrf_cookie_name);
        let (csrf_token, newly_issued) = match existing_csrf {
            Some(value) => (CsrfToken::from_cookie_value(value), false),
            None => (CsrfToken::generate(), true),
        };

        // Step 5: load session state.
        let session_cookie = read_cookie(req.headers, &self.session_cookie_name);
        let mut session = self.sessions.load(session_cookie.as_deref());
        let session_before = session.snapshot();

        // Step 6-7: build the Environment and BasilContext.
        let mut env = Environment::new(req.root_path.to_path_buf());
        env.set_filename(req.handler_path.to_path_buf());
        env.set_security_policy(SecurityPolicy::standard(req.root_path.to_path_buf()));

        let request_dict = build_request_context(
            &env,
            req.method,
            req.path,
            req.raw_query,
            req.headers,
            req.host,
            req.remote_addr,
            req.body,
        );
        if let Some(subpath) = &req.subpath {
            request_dict.insert("subpath", subpath_value(subpath));
        }

        let response_dict = BasilDict::new(&env);
        response_dict.insert("status", Value::Integer(200));
        response_dict.insert("headers", Value::Dictionary(BasilDict::new(&env)));
        response_dict.insert("cookies", Value::Dictionary(BasilDict::new(&env)));

        let auth_dict = BasilDict::new(&env);
        auth_dict.insert("required", Value::Boolean(req.auth_required));
        auth_dict.insert("user", req.user.clone().unwrap_or(Value::Null));

        let session_dict = BasilDict::new(&env);
        for (key, value) in &session_before {
            session_dict.insert(key.clone(), value.clone());
        }
        let flash_dict = BasilDict::new(&env);
        for (key, value) in session.flash() {
            flash_dict.insert(key.clone(), value.clone());
        }
        session_dict.insert("__flash", Value::Dictionary(flash_dict));
        session_dict.insert("__pendingFlash", Value::Dictionary(BasilDict::new(&env)));

        let basil = BasilDict::new(&env);
        basil.insert("http", {
            let http = BasilDict::new(&env);
            http.insert("request", Value::Dictionary(request_dict));
            http.insert("response", Value::Dictionary(response_dict.clone()));
            Value::Dictionary(http)
        });
        basil.insert("auth", Value::Dictionary(auth_dict));
        basil.insert("csrf", {
            let csrf = BasilDict::new(&env);
            csrf.insert("token", Value::String(csrf_token.as_str().to_string()));
            Value::Dictionary(csrf)
        });
        basil.insert("session", Value::Dictionary(session_dict.clone()));
        if let Some(dir) = req.public_dir {
            basil.insert("public_dir", Value::String(dir.display().to_string()));
        }
        basil.insert("context", Value::Dictionary(BasilDict::new(&env)));

        env.set_basil(basil);

        // Step 8: evaluate.
        let result = self.evaluator.eval(&program, &mut env);

        // Step 9: error handling.
        if let Value::Error(runtime_err) = &result {
            tracing::error!(error = %runtime_err.message, "page script failed");
            return self.error_renderer.render_runtime_error(runtime_err, req.root_path);
        }

        // Step 10: redirects.
        if let Value::Redirect(redirect) = &result {
            let status = StatusCode::from_u16(redirect.status).unwrap_or(StatusCode::FOUND);
            let mut response = (status, axum::body::Body::empty()).into_response();
            if let Ok(value) = HeaderValue::from_str(&redirect.url) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            self.commit_session(&mut session, &session_before, &session_dict, &mut response);
            self.set_csrf_cookie_if_needed(newly_issued, &csrf_token, &mut response);
            return response;
        }

        // Step 12: read response block and write (step 11's session sync
        // happens inside `commit_session` below, alongside the cookie write).
        let block = read_response_block(&response_dict);
        let mut response = self.writer.write(result, &block);

        self.commit_session(&mut session, &session_before, &session_dict, &mut response);
        self.set_csrf_cookie_if_needed(newly_issued, &csrf_token, &mut response);

        // Step 13: cache-miss marker. `handle` is synchronous and its
        // `Response` body is a lazy `axum::body::Body` stream, so capturing
        // the body bytes for `ResponseCache::set` requires an async read;
        // the server layer does that buffering for cacheable routes after
        // this call returns, using `key` and `req.cache_ttl` (spec.md §4.9
        // step 13).
        if req.cacheable && *req.method == Method::GET {
            response
                .headers_mut()
                .insert("x-cache", HeaderValue::from_static("MISS"));
        }
        let _ = &key;

        response
    }

    fn sync_session_from_dict(
        &self,
        session: &mut crate::session::SessionData,
        before: &std::collections::HashMap<String, Value>,
        dict: &BasilDict,
    ) {
        let after_keys: Vec<String> = dict
            .keys()
            .into_iter()
            .filter(|k| k != "__flash" && k != "__pendingFlash")
            .collect();

        for key in &after_keys {
            let new_value = dict.get(key).unwrap_or(Value::Null);
            let changed = match before.get(key) {
                Some(old) => old.to_json() != new_value.to_json(),
                None => true,
            };
            if changed {
                session.set(key.clone(), new_value);
            }
        }
        for key in before.keys() {
            if !after_keys.contains(key) {
                session.remove(key);
            }
        }

        if let Some(Value::Dictionary(pending)) = dict.get("__pendingFlash") {
            for key in pending.keys() {
                if let Some(value) = pending.get(&key) {
                    session.set_flash(key, value);
                }
            }
        }
    }

    fn commit_session(
        &self,
        session: &mut crate::session::SessionData,
        before: &std::collections::HashMap<String, Value>,
        dict: &BasilDict,
        response: &mut Response,
    ) {
        self.sync_session_from_dict(session, before, dict);
        if let Some(attrs) = self.sessions.save(session) {
            if let Some(header_value) = build_session_cookie(&attrs) {
                if let Ok(value) = HeaderValue::from_str(&header_value) {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
            }
        }
    }

    fn set_csrf_cookie_if_needed(&self, newly_issued: bool, token: &CsrfToken, response: &mut Response) {
        if !newly_issued {
            return;
        }
        let cookie = cookie::Cookie::build((self.csrf_cookie_name.clone(), token.as_str().to_string()))
            .path("/")
            .http_only(false)
            .same_site(cookie::SameSite::Lax)
            .secure(!self.dev_mode)
            .build();
        if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

fn build_session_cookie(attrs: &crate::session::SessionCookieAttrs) -> Option<String> {
    let same_site = match attrs.same_site.to_ascii_lowercase().as_str() {
        "strict" => cookie::SameSite::Strict,
        "none" => cookie::SameSite::None,
        _ => cookie::SameSite::Lax,
    };
    let mut builder = cookie::Cookie::build((attrs.name.clone(), attrs.value.clone()))
        .path(attrs.path.clone())
        .max_age(cookie::time::Duration::seconds(attrs.max_age.as_secs() as i64))
        .same_site(same_site)
        .secure(attrs.secure)
        .http_only(attrs.http_only);
    if let Some(domain) = &attrs.domain {
        builder = builder.domain(domain.clone());
    }
    Some(builder.build().to_string())
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::MemorySessionStore;
    use crate::value::NullEvaluator;
    use bytes::Bytes as AxumBytes;
    use std::io::Write;

    fn handler(dev_mode: bool, result: Value) -> (PageHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("index.pars");
        let mut file = std::fs::File::create(&script_path).unwrap();
        file.write_all(b"page body").unwrap();

        let evaluator = Arc::new(NullEvaluator { result });
        let handler = PageHandler {
            scripts: Arc::new(ScriptCache::new(dev_mode, evaluator.clone())),
            responses: Arc::new(ResponseCache::new(dev_mode, false)),
            fragments: Arc::new(FragmentCache::new(dev_mode, false, 100)),
            sessions: Arc::new(MemorySessionStore::new(SessionConfig::default(), dev_mode)),
            evaluator,
            writer: ResponseWriter::new(dev_mode),
            error_renderer: Arc::new(ErrorRenderer::new(dev_mode)),
            dev_mode,
            session_cookie_name: "basil_session".to_string(),
            csrf_cookie_name: "csrf_token".to_string(),
        };
        (handler, dir)
    }

    fn base_request<'a>(handler_path: &'a Path, root_path: &'a Path, headers: &'a HeaderMap) -> PageRequest<'a> {
        PageRequest {
            handler_path,
            root_path,
            cacheable: false,
            cache_ttl: Duration::ZERO,
            method: &Method::GET,
            path: "/",
            raw_query: "",
            headers,
            host: "example.com",
            remote_addr: "127.0.0.1",
            body: None,
            subpath: None,
            auth_required: false,
            user: None,
            public_dir: None,
        }
    }

    #[test]
    fn plain_string_result_renders_200_html_or_text() {
        let (handler, dir) = handler(false, Value::String("hello".into()));
        let headers = HeaderMap::new();
        let script_path = dir.path().join("index.pars");
        let response = handler.handle(base_request(&script_path, dir.path(), &headers));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn first_request_without_csrf_cookie_issues_one() {
        let (handler, dir) = handler(false, Value::Null);
        let headers = HeaderMap::new();
        let script_path = dir.path().join("index.pars");
        let response = handler.handle(base_request(&script_path, dir.path(), &headers));
        let set_cookie_count = response.headers().get_all(header::SET_COOKIE).iter().count();
        assert!(set_cookie_count >= 1);
    }

    #[test]
    fn redirect_result_emits_3xx_with_location() {
        let redirect = crate::value::RedirectValue::new("/target", 302).unwrap();
        let (handler, dir) = handler(false, Value::Redirect(redirect));
        let headers = HeaderMap::new();
        let script_path = dir.path().join("index.pars");
        let response = handler.handle(base_request(&script_path, dir.path(), &headers));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/target");
    }

    #[test]
    fn parse_error_renders_dev_page_when_dev_mode() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pars");
        let evaluator = Arc::new(NullEvaluator { result: Value::Null });
        let handler = PageHandler {
            scripts: Arc::new(ScriptCache::new(true, evaluator.clone())),
            responses: Arc::new(ResponseCache::new(true, false)),
            fragments: Arc::new(FragmentCache::new(true, false, 100)),
            sessions: Arc::new(MemorySessionStore::new(SessionConfig::default(), true)),
            evaluator,
            writer: ResponseWriter::new(true),
            error_renderer: Arc::new(ErrorRenderer::new(true)),
            dev_mode: true,
            session_cookie_name: "basil_session".to_string(),
            csrf_cookie_name: "csrf_token".to_string(),
        };
        let headers = HeaderMap::new();
        let req = base_request(&missing, dir.path(), &headers);
        let response = handler.handle(req);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn body_is_ignored_for_get_requests() {
        let (handler, dir) = handler(false, Value::Null);
        let headers = HeaderMap::new();
        let script_path = dir.path().join("index.pars");
        let mut req = base_request(&script_path, dir.path(), &headers);
        req.body = Some(("application/json", AxumBytes::from_static(b"{}")));
        let response = handler.handle(req);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
