//! Application state shared across handlers: every long-lived collaborator
//! the request-dispatch core needs, wrapped once in `Arc` so cloning
//! `AppState` into an axum handler is cheap.

use std::sync::Arc;

use crate::assets::AssetRegistry;
use crate::cache::{FragmentCache, ResponseCache, ScriptCache};
use crate::config::Config;
use crate::error::Result;
use crate::error_renderer::ErrorRenderer;
use crate::prelude::Prelude;
use crate::rate_limit::RateLimiter;
use crate::response::ResponseWriter;
use crate::router::Router;
use crate::session::{MemorySessionStore, SessionStore};
use crate::value::Evaluator;
use crate::watcher::Watcher;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    scripts: Arc<ScriptCache>,
    responses: Arc<ResponseCache>,
    fragments: Arc<FragmentCache>,
    assets: Arc<AssetRegistry>,
    rate_limiter: Arc<RateLimiter>,
    sessions: Arc<dyn SessionStore>,
    evaluator: Arc<dyn Evaluator>,
    prelude: Arc<Prelude>,
    router: Arc<Router>,
    watcher: Arc<Watcher>,
    error_renderer: Arc<ErrorRenderer>,
    writer: Arc<ResponseWriter>,
}

impl AppState {
    pub fn builder(evaluator: Arc<dyn Evaluator>) -> AppStateBuilder {
        AppStateBuilder::new(evaluator)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scripts(&self) -> &Arc<ScriptCache> {
        &self.scripts
    }

    pub fn responses(&self) -> &Arc<ResponseCache> {
        &self.responses
    }

    pub fn fragments(&self) -> &Arc<FragmentCache> {
        &self.fragments
    }

    pub fn assets(&self) -> &Arc<AssetRegistry> {
        &self.assets
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }

    pub fn prelude(&self) -> &Arc<Prelude> {
        &self.prelude
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }

    pub fn error_renderer(&self) -> &Arc<ErrorRenderer> {
        &self.error_renderer
    }

    pub fn writer(&self) -> &Arc<ResponseWriter> {
        &self.writer
    }

    pub fn dev_mode(&self) -> bool {
        self.config.server.dev
    }
}

/// Assembles an `AppState` from a loaded `Config` and the one external
/// collaborator the core does not provide itself: the script evaluator.
/// Everything else (caches, registries, the watcher) is constructed from
/// `config` with sensible defaults, mirroring the pool-construction shape of
/// the framework lineage's own `AppStateBuilder` but with no optional
/// connection pools to lazily dial — every collaborator here is in-process.
pub struct AppStateBuilder {
    config: Option<Config>,
    evaluator: Arc<dyn Evaluator>,
    sessions: Option<Arc<dyn SessionStore>>,
    prelude_source: Option<String>,
}

impl AppStateBuilder {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            config: None,
            evaluator,
            sessions: None,
            prelude_source: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the default in-memory session store (e.g. for a persistent
    /// backend). Defaults to `MemorySessionStore` when not set.
    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn prelude_source(mut self, source: impl Into<String>) -> Self {
        self.prelude_source = Some(source.into());
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = self.config.unwrap_or_else(|| {
            Config::load().unwrap_or_else(|err| {
                tracing::warn!(%err, "failed to load configuration, using defaults");
                Config::default()
            })
        });
        let dev_mode = config.server.dev;

        let scripts = Arc::new(ScriptCache::new(dev_mode, self.evaluator.clone()));
        let responses = Arc::new(ResponseCache::new(dev_mode, false));
        let fragments = Arc::new(FragmentCache::new(dev_mode, false, config.cache.fragment_cache_max_entries));
        let assets = Arc::new(AssetRegistry::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new(config.session.clone(), dev_mode)));
        let error_renderer = Arc::new(ErrorRenderer::new(dev_mode));
        let writer = Arc::new(ResponseWriter::new(dev_mode));

        let prelude = Prelude::new(self.prelude_source.as_deref(), self.evaluator.as_ref(), &assets, dev_mode)?;

        let global_public_dir = config
            .routes
            .iter()
            .find(|r| r.prefix == "/")
            .and_then(|r| r.public_dir.clone());
        let router = Arc::new(Router::new(config.routes.clone(), global_public_dir, config.site.clone()));

        let watcher = Arc::new(Watcher::start(config.watch_dirs.clone(), scripts.clone(), responses.clone()));

        Ok(AppState {
            config: Arc::new(config),
            scripts,
            responses,
            fragments,
            assets,
            rate_limiter,
            sessions,
            evaluator: self.evaluator,
            prelude: Arc::new(prelude),
            router,
            watcher,
            error_renderer,
            writer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{NullEvaluator, Value};

    #[test]
    fn builder_assembles_state_from_default_config() {
        let evaluator: Arc<dyn Evaluator> = Arc::new(NullEvaluator { result: Value::Null });
        let state = AppState::builder(evaluator).config(Config::default()).build().unwrap();
        assert!(!state.dev_mode());
        assert_eq!(state.rate_limiter().len(), 0);
    }

    #[test]
    fn dev_mode_flows_through_from_config() {
        let evaluator: Arc<dyn Evaluator> = Arc::new(NullEvaluator { result: Value::Null });
        let mut config = Config::default();
        config.server.dev = true;
        let state = AppState::builder(evaluator).config(config).build().unwrap();
        assert!(state.dev_mode());
    }
}
