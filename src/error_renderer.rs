//! ErrorRenderer (spec.md §7): in development, turns structured script
//! errors into source-annotated HTML. In production, errors never surface
//! past a generic 500.

use std::path::{Path, PathBuf};

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

use crate::error::{ParseError, RuntimeError};

pub struct ErrorRenderer {
    dev_mode: bool,
}

impl ErrorRenderer {
    pub fn new(dev_mode: bool) -> Self {
        Self { dev_mode }
    }

    pub fn render_parse_error(&self, err: &ParseError, base_dir: &Path) -> Response {
        if !self.dev_mode {
            return generic_500();
        }
        let relative = relative_to(&err.file, base_dir);
        let excerpt = source_excerpt(Path::new(&err.file), err.line);
        let message = rewrite_message(&err.message);
        let html = render_page(&relative, err.line, err.column, &message, err.hint.as_deref(), &excerpt);
        (StatusCode::INTERNAL_SERVER_ERROR, Html(html)).into_response()
    }

    pub fn render_runtime_error(&self, err: &RuntimeError, base_dir: &Path) -> Response {
        if !self.dev_mode {
            return generic_500();
        }
        let file = err.file.clone().unwrap_or_default();
        let relative = relative_to(&file, base_dir);
        let excerpt = err
            .line
            .map(|line| source_excerpt(Path::new(&file), line))
            .unwrap_or_default();
        let message = rewrite_message(&err.message);
        let html = render_page(
            &relative,
            err.line.unwrap_or(0),
            err.column.unwrap_or(0),
            &message,
            err.hint.as_deref(),
            &excerpt,
        );
        (StatusCode::INTERNAL_SERVER_ERROR, Html(html)).into_response()
    }

    /// 404 page listing every path the walk-back tried (spec.md §4.8 step 5).
    pub fn render_not_found(&self, tried: &[PathBuf]) -> Response {
        if !self.dev_mode {
            return (StatusCode::NOT_FOUND, "Not Found").into_response();
        }
        let list: String = tried
            .iter()
            .map(|p| format!("<li><code>{}</code></li>", escape_html(&p.display().to_string())))
            .collect();
        let html = format!(
            "<!DOCTYPE html><html><head><title>404 Not Found</title>{CSS}</head>\
             <body><div class=\"panel\"><h1>404 Not Found</h1>\
             <p>No handler matched this path. Paths tried, deepest first:</p><ul>{list}</ul></div></body></html>"
        );
        (StatusCode::NOT_FOUND, Html(html)).into_response()
    }
}

fn generic_500() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

fn relative_to(file: &str, base_dir: &Path) -> String {
    Path::new(file)
        .strip_prefix(base_dir)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| file.to_string())
}

/// Rewrites common evaluator messages into friendlier prose (spec.md §7
/// examples, verbatim).
fn rewrite_message(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("console") {
        return "'console' is not defined — use log()".to_string();
    }
    if lower.contains("expected (") || lower.contains("missing (") {
        return "Missing parentheses around condition".to_string();
    }
    raw.to_string()
}

fn source_excerpt(path: &Path, faulted_line: u32) -> Vec<(u32, String, bool)> {
    let Ok(source) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = source.lines().collect();
    let faulted_idx = faulted_line.saturating_sub(1) as usize;
    let start = faulted_idx.saturating_sub(5);
    let end = (faulted_idx + 5).min(lines.len().saturating_sub(1));

    (start..=end)
        .filter_map(|i| lines.get(i).map(|line| (i as u32 + 1, colorize(line), i == faulted_idx)))
        .collect()
}

const KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "fn", "return", "let", "true", "false", "null", "import", "export",
];

/// Naive single-pass tokenizer: keyword / string / number / tag / comment /
/// function-call heuristics, each wrapped in a `<span class="tok-*">`.
fn colorize(line: &str) -> String {
    if let Some(comment_at) = line.find("//") {
        let (code, comment) = line.split_at(comment_at);
        return format!("{}<span class=\"tok-comment\">{}</span>", colorize_code(code), escape_html(comment));
    }
    colorize_code(line)
}

fn colorize_code(line: &str) -> String {
    let mut out = String::new();
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            let quote = c;
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            i = (i + 1).min(chars.len());
            let text: String = chars[start..i].iter().collect();
            out.push_str(&format!("<span class=\"tok-string\">{}</span>", escape_html(&text)));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push_str(&format!("<span class=\"tok-number\">{}</span>", escape_html(&text)));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let followed_by_paren = chars.get(i) == Some(&'(');
            if KEYWORDS.contains(&word.as_str()) {
                out.push_str(&format!("<span class=\"tok-keyword\">{}</span>", escape_html(&word)));
            } else if followed_by_paren {
                out.push_str(&format!("<span class=\"tok-function\">{}</span>", escape_html(&word)));
            } else if word.starts_with(char::is_uppercase) {
                out.push_str(&format!("<span class=\"tok-tag\">{}</span>", escape_html(&word)));
            } else {
                out.push_str(&escape_html(&word));
            }
        } else {
            out.push_str(&escape_html(&c.to_string()));
            i += 1;
        }
    }
    out
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

const CSS: &str = "<style>\
body{font-family:monospace;background:#1e1e1e;color:#d4d4d4;padding:2rem}\
.panel{max-width:900px;margin:0 auto}\
h1{color:#f14c4c}.hint{color:#9cdcfe}\
.excerpt{background:#252526;padding:1rem;border-radius:4px;overflow-x:auto}\
.line{display:flex}.line.fault{background:#3a1d1d}\
.lineno{color:#6a6a6a;width:3rem;text-align:right;margin-right:1rem;user-select:none}\
.tok-keyword{color:#569cd6}.tok-string{color:#ce9178}.tok-number{color:#b5cea8}\
.tok-comment{color:#6a9955;font-style:italic}.tok-tag{color:#4ec9b0}.tok-function{color:#dcdcaa}\
</style>";

fn render_page(
    file: &str,
    line: u32,
    column: u32,
    message: &str,
    hint: Option<&str>,
    excerpt: &[(u32, String, bool)],
) -> String {
    let hint_html = hint
        .map(|h| format!("<p class=\"hint\">Hint: {}</p>", escape_html(h)))
        .unwrap_or_default();

    let excerpt_html: String = excerpt
        .iter()
        .map(|(n, code, faulted)| {
            let class = if *faulted { "line fault" } else { "line" };
            format!("<div class=\"{class}\"><span class=\"lineno\">{n}</span><span>{code}</span></div>")
        })
        .collect();

    format!(
        "<!DOCTYPE html><html><head><title>Script Error</title>{CSS}</head>\
         <body><div class=\"panel\">\
         <h1>Script Error</h1>\
         <p>{} at line {}, column {}</p>\
         <p>{}</p>{}\
         <div class=\"excerpt\">{}</div>\
         </div></body></html>",
        escape_html(file),
        line,
        column,
        escape_html(message),
        hint_html,
        excerpt_html,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_mode_never_reveals_parse_details() {
        let renderer = ErrorRenderer::new(false);
        let err = ParseError {
            file: "/app/pages/index.pars".into(),
            line: 3,
            column: 1,
            message: "unexpected token".into(),
            hint: None,
        };
        let response = renderer.render_parse_error(&err, Path::new("/app"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn console_reference_is_rewritten() {
        assert_eq!(
            rewrite_message("ReferenceError: console is not defined"),
            "'console' is not defined — use log()"
        );
    }

    #[test]
    fn missing_parens_message_is_rewritten() {
        assert_eq!(rewrite_message("expected ( after if"), "Missing parentheses around condition");
    }

    #[test]
    fn dev_not_found_lists_every_tried_path() {
        let renderer = ErrorRenderer::new(true);
        let response = renderer.render_not_found(&[PathBuf::from("/site/a/index.pars"), PathBuf::from("/site/index.pars")]);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn prod_not_found_is_generic() {
        let renderer = ErrorRenderer::new(false);
        let response = renderer.render_not_found(&[PathBuf::from("/site/index.pars")]);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
