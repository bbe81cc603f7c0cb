//! ApiDispatcher (spec.md §4.10): method/path dispatch within an API
//! script module, auth enforcement, rate limiting, response shaping.

use std::time::Duration;

use axum::http::Method;

use crate::error::Error;
use crate::rate_limit::RateLimiter;
use crate::value::{BasilDict, Evaluator, Value};

/// Auth metadata an export may be wrapped in (`api.public(fn)`,
/// `api.admin(fn)`, `api.roles([...], fn)`); a bare function defaults to
/// `Auth` — "authenticated user required" (spec.md §4.10 step 5, end-to-end
/// scenario 2).
enum ExportAuth {
    Public,
    Auth,
    Admin,
    Roles(Vec<String>),
}

fn unwrap_export(export: Value) -> (ExportAuth, Value) {
    if let Value::Dictionary(ref dict) = export {
        if let Some(tag) = dict.get("__auth").and_then(|v| v.as_str().map(str::to_string)) {
            let handler = dict.get("handler").unwrap_or(Value::Null);
            let mode = match tag.as_str() {
                "public" => ExportAuth::Public,
                "admin" => ExportAuth::Admin,
                "roles" => {
                    let roles = dict
                        .get("roles")
                        .map(|v| match v {
                            Value::Array(items) => items
                                .into_iter()
                                .filter_map(|i| i.as_str().map(str::to_string))
                                .collect(),
                            _ => Vec::new(),
                        })
                        .unwrap_or_default();
                    ExportAuth::Roles(roles)
                }
                _ => ExportAuth::Auth,
            };
            return (mode, handler);
        }
    }
    (ExportAuth::Auth, export)
}

fn export_name_for(method: &Method, has_id: bool) -> Option<&'static str> {
    match *method {
        Method::GET if has_id => Some("getById"),
        Method::GET => Some("get"),
        Method::POST => Some("post"),
        Method::PUT => Some("put"),
        Method::PATCH => Some("patch"),
        Method::DELETE => Some("delete"),
        _ => None,
    }
}

fn supported_methods(module: &BasilDict) -> Vec<String> {
    let mut methods = Vec::new();
    if module.get("get").is_some() || module.get("getById").is_some() {
        methods.push("GET".to_string());
    }
    for (key, verb) in [("post", "POST"), ("put", "PUT"), ("patch", "PATCH"), ("delete", "DELETE")] {
        if module.get(key).is_some() {
            methods.push(verb.to_string());
        }
    }
    methods
}

/// `rateLimit.window` accepts a plain integer (seconds) or a duration
/// string — `"30s"`, `"5m"`, `"2h"`, `"1d"` — as in the §8 rate-limit
/// scenario's `window:"1s"`. A bare numeric string is also read as seconds.
fn parse_window_secs(value: Value) -> Option<u64> {
    match value {
        Value::Integer(secs) if secs >= 0 => Some(secs as u64),
        Value::String(s) => {
            let s = s.trim();
            let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
                Some(idx) => s.split_at(idx),
                None => (s, ""),
            };
            let amount: u64 = digits.parse().ok()?;
            let multiplier = match unit {
                "" | "s" => 1,
                "m" => 60,
                "h" => 3_600,
                "d" => 86_400,
                _ => return None,
            };
            Some(amount * multiplier)
        }
        _ => None,
    }
}

pub struct ApiDispatcher<'a> {
    pub evaluator: &'a dyn Evaluator,
    pub rate_limiter: &'a RateLimiter,
}

/// The authenticated user, if any — an opaque record the dispatcher only
/// reads `role` from for admin/roles enforcement (spec.md's "consumed as
/// an opaque user record" Non-goal).
pub struct AuthContext<'a> {
    pub user: Option<&'a Value>,
    pub rate_limit_key: &'a str,
}

impl<'a> ApiDispatcher<'a> {
    pub fn dispatch(
        &self,
        module: &BasilDict,
        subpath: &str,
        method: &Method,
        request_object: BasilDict,
        auth: &AuthContext,
    ) -> Result<Value, Error> {
        let (module, remaining) = resolve_nested_routes(module, subpath);

        let segments: Vec<&str> = remaining.split('/').filter(|s| !s.is_empty()).collect();
        let has_id = segments.len() == 1;
        let id = if has_id { Some(segments[0].to_string()) } else { None };

        let Some(export_name) = export_name_for(method, has_id) else {
            return Err(Error::MethodNotAllowed { allow: supported_methods(&module) });
        };

        let Some(export) = module.get(export_name) else {
            return Err(Error::MethodNotAllowed { allow: supported_methods(&module) });
        };

        let (auth_mode, handler) = unwrap_export(export);
        enforce_auth(&auth_mode, auth.user)?;

        let (requests, window) = module
            .get("rateLimit")
            .and_then(|v| v.as_dict().cloned())
            .and_then(|dict| {
                let requests = dict.get("requests").and_then(|v| v.as_integer())? as u32;
                let window = dict.get("window").and_then(parse_window_secs)?;
                Some((requests, window))
            })
            .unwrap_or((60, 60));

        if !self.rate_limiter.allow(auth.rate_limit_key, requests, Duration::from_secs(window)) {
            return Err(Error::TooManyRequests);
        }

        if let Some(id) = &id {
            request_object.insert("id", Value::String(id.clone()));
        }
        if let Some(user) = auth.user {
            request_object.insert("user", user.clone());
        }

        Ok(self.evaluator.call(&handler, Value::Dictionary(request_object)))
    }
}

fn enforce_auth(mode: &ExportAuth, user: Option<&Value>) -> Result<(), Error> {
    match mode {
        ExportAuth::Public => Ok(()),
        ExportAuth::Auth => {
            if user.is_some() {
                Ok(())
            } else {
                Err(Error::Unauthorized)
            }
        }
        ExportAuth::Admin => match user {
            None => Err(Error::Unauthorized),
            Some(user) if has_role(user, "admin") => Ok(()),
            Some(_) => Err(Error::Forbidden),
        },
        ExportAuth::Roles(required) => match user {
            None => Err(Error::Unauthorized),
            Some(user) if required.iter().any(|role| has_role(user, role)) => Ok(()),
            Some(_) => Err(Error::Forbidden),
        },
    }
}

fn has_role(user: &Value, role: &str) -> bool {
    user.as_dict()
        .and_then(|dict| dict.get("role"))
        .and_then(|v| v.as_str().map(str::to_string))
        .is_some_and(|r| r == role)
}

/// Step 2: longest-prefix match against the module's nested `routes`
/// dictionary, recursing until no further `routes` table matches.
fn resolve_nested_routes(module: &BasilDict, subpath: &str) -> (BasilDict, String) {
    let mut module = module.clone();
    let mut remaining = subpath.trim_start_matches('/').to_string();

    loop {
        let Some(routes) = module.get("routes").and_then(|v| v.as_dict().cloned()) else {
            break;
        };

        let mut best: Option<(String, BasilDict)> = None;
        for key in routes.keys() {
            let trimmed_key = key.trim_matches('/');
            if remaining == trimmed_key || remaining.starts_with(&format!("{trimmed_key}/")) {
                if best.as_ref().map(|(k, _)| key.len() > k.len()).unwrap_or(true) {
                    if let Some(sub) = routes.get(&key).and_then(|v| v.as_dict().cloned()) {
                        best = Some((key.clone(), sub));
                    }
                }
            }
        }

        let Some((matched_key, sub_module)) = best else {
            break;
        };

        let trimmed_key = matched_key.trim_matches('/');
        remaining = remaining
            .strip_prefix(trimmed_key)
            .unwrap_or(&remaining)
            .trim_start_matches('/')
            .to_string();
        module = sub_module;
    }

    (module, remaining)
}
