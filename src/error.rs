//! Unified error type for the Basil core.
//!
//! Every fallible operation in the crate returns `Result<T, Error>`. The
//! variants here are the Rust expression of the Parse/Runtime/Dispatch/
//! Transport taxonomy: parse and runtime errors come from the script
//! evaluator collaborator, dispatch errors are synthesized by the core
//! itself, transport errors wrap I/O failures reading scripts, static files,
//! or request bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::value::BasilDict;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A parse error produced by `ScriptCache::getAST`.
#[derive(Debug, Clone, Serialize)]
pub struct ParseError {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub hint: Option<String>,
}

/// A runtime error produced by the evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeError {
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub hint: Option<String>,
    pub class: Option<String>,
    /// Structured error body a script supplied via `api.fail(...)`.
    #[serde(skip)]
    pub user_dict: Option<BasilDict>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error in {}:{}:{}: {}", .0.file, .0.line, .0.column, .0.message)]
    Parse(ParseError),

    #[error("runtime error: {}", .0.message)]
    Runtime(RuntimeError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed { allow: Vec<String> },

    #[error("too many requests")]
    TooManyRequests,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("session error: {0}")]
    Session(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to (spec.md §7's Dispatch-error table,
    /// plus 500 for everything else).
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Runtime(e) => e
                .user_dict
                .as_ref()
                .and_then(|d| d.get("status"))
                .and_then(|v| v.as_integer())
                .and_then(|s| StatusCode::from_u16(s as u16).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Error::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> String {
        format!("HTTP-{}", self.status().as_u16())
    }
}

/// The API error envelope from spec.md §6:
/// `{"error": {"code": "HTTP-4xx"|"HTTP-5xx", "message": "...", ...}}`.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });

        if let Error::MethodNotAllowed { allow } = &self {
            body["error"]["allow"] = json!(allow.join(", "));
        }

        if let Error::Runtime(RuntimeError { user_dict: Some(dict), .. }) = &self {
            if let serde_json::Value::Object(ref mut map) = body["error"] {
                if let Ok(serde_json::Value::Object(extra)) = serde_json::to_value(dict) {
                    for (k, v) in extra {
                        map.entry(k).or_insert(v);
                    }
                }
            }
        }

        let mut response = (status, axum::Json(body)).into_response();
        if let Error::MethodNotAllowed { allow } = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(&allow.join(", ")) {
                response.headers_mut().insert(axum::http::header::ALLOW, value);
            }
        }
        response
    }
}
