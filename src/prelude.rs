//! Prelude (spec.md §9 "Global mutable state"): bundles the process-wide
//! bits the reference keeps as singletons — the prelude AST, the live-reload
//! script's asset URL, and whether dev-mode reload injection is active —
//! into one collaborator handed to the server at construction instead of
//! living as true globals.

use std::sync::Arc;

use crate::assets::AssetRegistry;
use crate::error::Error;
use crate::value::{Evaluator, Program};

/// Script injected into `text/html` responses in dev mode (spec.md §9
/// "Live-reload wiring"). Polls the sequence endpoint and reloads the page
/// the first time it observes an increase.
const LIVERELOAD_JS: &str = r#"(function () {
  var last = null;
  setInterval(function () {
    fetch('/__/livereload/poll').then(function (r) { return r.json(); }).then(function (body) {
      if (last === null) { last = body.seq; return; }
      if (body.seq !== last) { location.reload(); }
    }).catch(function () {});
  }, 500);
})();"#;

pub struct Prelude {
    program: Option<Program>,
    livereload_url: Option<String>,
    dev_reload: bool,
}

impl Prelude {
    /// Parses `prelude_source` (if any) once, up front — unlike page
    /// scripts, the prelude is not re-parsed per request even in dev mode.
    /// Registers the live-reload script with `assets` when `dev_reload` is
    /// set, so it is served content-addressed like any other asset.
    pub fn new(
        prelude_source: Option<&str>,
        evaluator: &dyn Evaluator,
        assets: &AssetRegistry,
        dev_reload: bool,
    ) -> Result<Self, Error> {
        let program = prelude_source
            .map(|source| evaluator.parse(source, std::path::Path::new("<prelude>")))
            .transpose()
            .map_err(Error::Parse)?;

        let livereload_url = if dev_reload {
            Some(assets.register_bytes(LIVERELOAD_JS.as_bytes(), "js")?)
        } else {
            None
        };

        Ok(Self { program, livereload_url, dev_reload })
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn dev_reload(&self) -> bool {
        self.dev_reload
    }

    /// Appends the live-reload `<script>` tag just before `</body>`, or at
    /// the end of the document if there is none. No-op outside dev mode, or
    /// when registration never happened.
    pub fn inject_livereload(&self, html: &str) -> String {
        let Some(url) = &self.livereload_url else {
            return html.to_string();
        };
        let tag = format!("<script src=\"{url}\"></script>");
        match html.rfind("</body>") {
            Some(pos) => {
                let mut out = String::with_capacity(html.len() + tag.len());
                out.push_str(&html[..pos]);
                out.push_str(&tag);
                out.push_str(&html[pos..]);
                out
            }
            None => format!("{html}{tag}"),
        }
    }
}

pub fn default_prelude() -> Prelude {
    Prelude { program: None, livereload_url: None, dev_reload: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{NullEvaluator, Value};

    #[test]
    fn dev_mode_off_never_touches_html() {
        let prelude = default_prelude();
        let html = "<html><body>hi</body></html>";
        assert_eq!(prelude.inject_livereload(html), html);
    }

    #[test]
    fn dev_mode_on_inserts_script_before_closing_body() {
        let evaluator = NullEvaluator { result: Value::Null };
        let assets = AssetRegistry::new();
        let prelude = Prelude::new(None, &evaluator, &assets, true).unwrap();

        let html = "<html><body>hi</body></html>";
        let injected = prelude.inject_livereload(html);
        assert!(injected.contains("<script src=\"/__p/"));
        assert!(injected.find("<script").unwrap() < injected.find("</body>").unwrap());
    }

    #[test]
    fn missing_body_tag_appends_at_the_end() {
        let evaluator = NullEvaluator { result: Value::Null };
        let assets = AssetRegistry::new();
        let prelude = Prelude::new(None, &evaluator, &assets, true).unwrap();

        let html = "<html>no body tag</html>";
        let injected = prelude.inject_livereload(html);
        assert!(injected.ends_with("</script>"));
    }

    #[test]
    fn prelude_source_is_parsed_once_at_construction() {
        let evaluator = NullEvaluator { result: Value::Null };
        let assets = AssetRegistry::new();
        let prelude = Prelude::new(Some("fn helper() {}"), &evaluator, &assets, false).unwrap();
        assert!(prelude.program().is_some());
        assert!(!prelude.dev_reload());
    }
}
