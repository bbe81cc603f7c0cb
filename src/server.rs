//! `BasilServer`/`BasilServerBuilder` (spec.md §4.13): middleware layering,
//! the dispatch fallback that ties Router/PageHandler/ApiDispatcher
//! together, and graceful shutdown.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router as AxumRouter,
};
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    compression::{predicate::SizeAbove, CompressionLayer},
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::assets::{mime_guess_from_ext, serve_asset};
use crate::cache::response::cache_key;
use crate::config::{AuthMode, CorsConfig, RouteConfig, RouteType};
use crate::context::build_request_context;
use crate::dispatch::{ApiDispatcher, AuthContext};
use crate::error::{Error, Result};
use crate::middleware::{csrf_guard, resolve_remote_addr, RemoteAddr};
use crate::page::{PageHandler, PageRequest};
use crate::rate_limit::resolve_key;
use crate::response::ResponseBlock;
use crate::router::{find_handler, Dispatch, WalkBackResult};
use crate::state::AppState;
use crate::value::{BasilDict, Environment, SecurityPolicy, Value};

/// Builds the fully middleware-wrapped router (spec.md §4.13). Three
/// independently state-resolved sub-routers are merged first — `/__p/*`
/// assets, the `/__/` control endpoints, and the catch-all dispatch
/// fallback — since axum requires every `Router` being merged to share the
/// same (here, unit) state type.
pub fn build_router(state: AppState) -> AxumRouter {
    let asset_router: AxumRouter<()> = AxumRouter::new()
        .route("/__p/{hash_and_ext}", get(serve_asset))
        .with_state((state.assets().clone(), state.dev_mode()));

    let control_router: AxumRouter<()> = AxumRouter::new()
        .route("/__/livereload/poll", get(livereload_poll))
        .route("/__/health", get(health))
        .with_state(state.clone());

    let main_router: AxumRouter<()> = AxumRouter::new()
        .fallback(dispatch_handler)
        .with_state(state.clone());

    let router = asset_router.merge(control_router).merge(main_router);

    let config = state.config();
    let csrf_config = config.session.csrf.clone();
    let trust_proxies = config.server.trust_proxies;
    let cors_layer = build_cors_layer(&config.cors);
    let body_limit_bytes = config.server.body_limit_mb * 1024 * 1024;
    let timeout = Duration::from_secs(config.server.timeout_secs);
    let compression = config.compression.clone();
    let security_headers = config.security_headers.clone();

    // Innermost first: csrf -> cors -> compression -> security headers ->
    // proxy-aware remote address -> body limit -> timeout -> logging
    // (outermost), per spec.md §4.13.
    let mut router = router.layer(axum::middleware::from_fn_with_state(csrf_config, csrf_guard));

    if let Some(cors) = cors_layer {
        router = router.layer(cors);
    }

    if compression.enabled {
        let threshold = compression.threshold_bytes.min(u16::MAX as usize) as u16;
        router = router.layer(CompressionLayer::new().compress_when(SizeAbove::new(threshold)));
    }

    let router = crate::middleware::apply_security_headers(router, &security_headers);

    router
        .layer(axum::middleware::from_fn_with_state(trust_proxies, resolve_remote_addr))
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if config.allowed_origins.is_empty() {
        return None;
    }

    let mut layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if config.allowed_origins.iter().any(|o| o == "*") {
        layer = layer.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        layer = layer.allow_origin(AllowOrigin::list(origins));
    }

    if config.allow_credentials {
        layer = layer.allow_credentials(true);
    }

    Some(layer)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Dev-only (spec.md §6: "`/__/livereload/poll` (dev only, JSON)... All
/// `/__/…` paths are 404 in production mode except the asset paths").
async fn livereload_poll(State(state): State<AppState>) -> Response {
    if !state.dev_mode() {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({ "seq": state.watcher().sequence() })).into_response()
}

/// The catch-all fallback: consults `Router::dispatch` (spec.md §4.7) and
/// routes to the page/API/site/static handling it names.
async fn dispatch_handler(State(state): State<AppState>, request: Request) -> Response {
    let remote_addr = request
        .extensions()
        .get::<RemoteAddr>()
        .map(|r| r.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path().to_string();
    let raw_query = uri.query().unwrap_or("").to_string();
    let headers = request.headers().clone();
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body_bytes = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        let limit = state.config().server.body_limit_mb * 1024 * 1024;
        match axum::body::to_bytes(request.into_body(), limit).await {
            Ok(bytes) => Some(bytes),
            Err(_) => return Error::BadRequest("request body too large or unreadable".into()).into_response(),
        }
    } else {
        None
    };

    match state.router().dispatch(&path) {
        Dispatch::Asset | Dispatch::NotFound => state.error_renderer().render_not_found(&[]),
        Dispatch::Static(file) => serve_static_file(&file, state.dev_mode()),
        Dispatch::Explicit(route) => {
            handle_explicit_route(
                &state, &route, &path, &method, &raw_query, &headers, &host, &remote_addr, &content_type, body_bytes,
            )
            .await
        }
        Dispatch::Site => {
            let Some(site) = state.router().site().cloned() else {
                return state.error_renderer().render_not_found(&[]);
            };
            dispatch_walkback(
                &state,
                &site.root,
                site.public_dir.as_deref(),
                &path,
                &method,
                &raw_query,
                &headers,
                &host,
                &remote_addr,
                &content_type,
                body_bytes,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_explicit_route(
    state: &AppState,
    route: &RouteConfig,
    path: &str,
    method: &Method,
    raw_query: &str,
    headers: &axum::http::HeaderMap,
    host: &str,
    remote_addr: &str,
    content_type: &str,
    body_bytes: Option<Bytes>,
) -> Response {
    match route.route_type {
        RouteType::Api => {
            handle_api_route(state, route, path, method, raw_query, headers, host, remote_addr, content_type, body_bytes)
                .await
        }
        RouteType::Page => {
            let root = route
                .handler_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let subpath = relative_segments(path, &route.prefix);
            render_page(
                state,
                &route.handler_path,
                &root,
                Some(&route.auth),
                route.cache_ttl_secs,
                path,
                method,
                raw_query,
                headers,
                host,
                remote_addr,
                content_type,
                body_bytes,
                if subpath.is_empty() { None } else { Some(subpath) },
                None,
            )
            .await
        }
        RouteType::Site => {
            let root = route.handler_path.clone();
            let url_path = path.strip_prefix(route.prefix.as_str()).unwrap_or(path);
            dispatch_walkback(
                state,
                &root,
                route.public_dir.as_deref(),
                url_path,
                method,
                raw_query,
                headers,
                host,
                remote_addr,
                content_type,
                body_bytes,
            )
            .await
        }
    }
}

fn relative_segments(path: &str, prefix: &str) -> Vec<String> {
    path.strip_prefix(prefix)
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Filesystem walk-back dispatch shared by site mode and a `site`-typed
/// explicit route (spec.md §4.8).
#[allow(clippy::too_many_arguments)]
async fn dispatch_walkback(
    state: &AppState,
    site_root: &Path,
    public_dir: Option<&Path>,
    url_path: &str,
    method: &Method,
    raw_query: &str,
    headers: &axum::http::HeaderMap,
    host: &str,
    remote_addr: &str,
    content_type: &str,
    body_bytes: Option<Bytes>,
) -> Response {
    match find_handler(site_root, public_dir, url_path) {
        WalkBackResult::Found { handler_path, subpath } => {
            render_page(
                state,
                &handler_path,
                site_root,
                None,
                0,
                url_path,
                method,
                raw_query,
                headers,
                host,
                remote_addr,
                content_type,
                body_bytes,
                if subpath.is_empty() { None } else { Some(subpath) },
                public_dir,
            )
            .await
        }
        WalkBackResult::RedirectTrailingSlash(target) => redirect(&target),
        WalkBackResult::Static(path) => serve_static_file(&path, state.dev_mode()),
        WalkBackResult::RejectedTraversal | WalkBackResult::RejectedHidden => {
            state.error_renderer().render_not_found(&[])
        }
        WalkBackResult::NotFound { tried } => state.error_renderer().render_not_found(&tried),
    }
}

fn redirect(location: &str) -> Response {
    let mut response = (StatusCode::PERMANENT_REDIRECT, Body::empty()).into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

#[allow(clippy::too_many_arguments)]
async fn render_page(
    state: &AppState,
    handler_path: &Path,
    root_path: &Path,
    auth_mode: Option<&AuthMode>,
    cache_ttl_secs: u64,
    path: &str,
    method: &Method,
    raw_query: &str,
    headers: &axum::http::HeaderMap,
    host: &str,
    remote_addr: &str,
    content_type: &str,
    body_bytes: Option<Bytes>,
    subpath: Option<Vec<String>>,
    public_dir: Option<&Path>,
) -> Response {
    let session_cookie = read_session_cookie(headers, &state.config().session.cookie_name);
    let probe_session = state.sessions().load(session_cookie.as_deref());
    let user = probe_session.get("user").cloned();

    let auth_required = match auth_mode {
        Some(mode) => {
            if let Err(err) = enforce_route_auth(mode, user.as_ref()) {
                return err.into_response();
            }
            !matches!(mode, AuthMode::Public)
        }
        None => false,
    };

    let page_handler = PageHandler {
        scripts: state.scripts().clone(),
        responses: state.responses().clone(),
        fragments: state.fragments().clone(),
        sessions: state.sessions().clone(),
        evaluator: state.evaluator().clone(),
        writer: crate::response::ResponseWriter::new(state.dev_mode()),
        error_renderer: state.error_renderer().clone(),
        dev_mode: state.dev_mode(),
        session_cookie_name: state.config().session.cookie_name.clone(),
        csrf_cookie_name: state.config().session.csrf.cookie_name.clone(),
    };

    let cacheable = cache_ttl_secs > 0 && *method == Method::GET;
    let key = cache_key(method.as_str(), path, raw_query);
    let body = body_bytes.as_ref().map(|b| (content_type, b.clone()));

    let req = PageRequest {
        handler_path,
        root_path,
        cacheable,
        cache_ttl: Duration::from_secs(cache_ttl_secs),
        method,
        path,
        raw_query,
        headers,
        host,
        remote_addr,
        body,
        subpath,
        auth_required,
        user,
        public_dir,
    };

    let response = page_handler.handle(req);
    let response = inject_livereload_if_applicable(response, state).await;

    if cacheable {
        finalize_cacheable_response(response, state.responses(), key, Duration::from_secs(cache_ttl_secs)).await
    } else {
        response
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_api_route(
    state: &AppState,
    route: &RouteConfig,
    path: &str,
    method: &Method,
    raw_query: &str,
    headers: &axum::http::HeaderMap,
    host: &str,
    remote_addr: &str,
    content_type: &str,
    body_bytes: Option<Bytes>,
) -> Response {
    let session_cookie = read_session_cookie(headers, &state.config().session.cookie_name);
    let probe_session = state.sessions().load(session_cookie.as_deref());
    let user = probe_session.get("user").cloned();

    if let Err(err) = enforce_route_auth(&route.auth, user.as_ref()) {
        return err.into_response();
    }

    let program = match state.scripts().get_ast(&route.handler_path) {
        Ok(program) => program,
        Err(Error::Parse(parse_err)) => {
            let root = route.handler_path.parent().unwrap_or(Path::new("."));
            return state.error_renderer().render_parse_error(&parse_err, root);
        }
        Err(_) => return Error::Internal("failed to load API module".into()).into_response(),
    };
    state.evaluator().clear_module_cache();

    let mut env = Environment::new(route.handler_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")));
    env.set_filename(route.handler_path.clone());
    env.set_security_policy(SecurityPolicy::standard(
        route.handler_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
    ));

    let body = body_bytes.as_ref().map(|b| (content_type, b.clone()));
    let request_dict = build_request_context(&env, method, path, raw_query, headers, host, remote_addr, body);

    let basil = BasilDict::new(&env);
    basil.insert("http", {
        let http = BasilDict::new(&env);
        http.insert("request", Value::Dictionary(request_dict.clone()));
        Value::Dictionary(http)
    });
    let auth_dict = BasilDict::new(&env);
    auth_dict.insert("user", user.clone().unwrap_or(Value::Null));
    basil.insert("auth", Value::Dictionary(auth_dict));
    env.set_basil(basil);

    let module = match state.evaluator().eval(&program, &mut env) {
        Value::Dictionary(dict) => dict,
        Value::Error(err) => {
            let root = route.handler_path.parent().unwrap_or(Path::new("."));
            return state.error_renderer().render_runtime_error(&err, root);
        }
        _ => return Error::Internal("API module did not export a dictionary".into()).into_response(),
    };

    let subpath = path.strip_prefix(route.prefix.as_str()).unwrap_or(path);
    let rate_limit_key = resolve_key(user_id_of(user.as_ref()).as_deref(), remote_addr);
    let dispatcher = ApiDispatcher {
        evaluator: state.evaluator().as_ref(),
        rate_limiter: state.rate_limiter(),
    };
    let auth_context = AuthContext { user: user.as_ref(), rate_limit_key: &rate_limit_key };

    match dispatcher.dispatch(&module, subpath, method, request_dict, &auth_context) {
        Ok(value) => state.writer().write(value, &ResponseBlock::default()),
        Err(err) => err.into_response(),
    }
}

fn user_id_of(user: Option<&Value>) -> Option<String> {
    user.and_then(|u| u.as_dict())
        .and_then(|d| d.get("id"))
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_integer().map(|i| i.to_string())))
}

/// Route-level auth (spec.md §3 "Route"): gates the whole route before a
/// page or API module ever runs. Distinct from the per-export auth a script
/// can layer on top of an API handler via `api.public/admin/roles`.
fn enforce_route_auth(mode: &AuthMode, user: Option<&Value>) -> Result<()> {
    match mode {
        AuthMode::Public => Ok(()),
        AuthMode::Auth => {
            if user.is_some() {
                Ok(())
            } else {
                Err(Error::Unauthorized)
            }
        }
        AuthMode::Admin => match user {
            None => Err(Error::Unauthorized),
            Some(user) if has_role(user, "admin") => Ok(()),
            Some(_) => Err(Error::Forbidden),
        },
        AuthMode::Roles { roles } => match user {
            None => Err(Error::Unauthorized),
            Some(user) if roles.iter().any(|role| has_role(user, role)) => Ok(()),
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

fn read_session_cookie(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
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

fn serve_static_file(path: &Path, dev_mode: bool) -> Response {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let mime = mime_guess_from_ext(ext);
    // Static files are not content-addressed the way registered assets are,
    // so they get a revalidating Cache-Control rather than the immutable
    // long-cache `/__p/` assets use.
    let cache_control = if dev_mode {
        "no-cache, no-store, must-revalidate"
    } else {
        "public, max-age=3600"
    };

    let mut response = bytes.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    response
}

/// Buffers cacheable GET 2xx bodies and writes them into `ResponseCache`
/// (spec.md §4.9 step 13), since `PageHandler::handle` only marks the
/// response `x-cache: MISS` and leaves the async buffering to this layer.
async fn finalize_cacheable_response(response: Response, responses: &crate::cache::ResponseCache, key: String, ttl: Duration) -> Response {
    let is_fresh_miss = response
        .headers()
        .get("x-cache")
        .map(|v| v == "MISS")
        .unwrap_or(false);
    if !is_fresh_miss || !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    responses.set(key, ttl, parts.status.as_u16(), parts.headers.clone(), bytes.clone());

    Response::from_parts(parts, Body::from(bytes))
}

/// Injects the dev-mode live-reload `<script>` tag into `text/html`
/// responses (spec.md §9 "Live-reload wiring").
async fn inject_livereload_if_applicable(response: Response, state: &AppState) -> Response {
    if !state.dev_mode() || !state.prelude().dev_reload() {
        return response;
    }

    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false);
    if !is_html {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return Response::from_parts(parts, Body::empty());
    };
    let html = String::from_utf8_lossy(&bytes);
    let injected = state.prelude().inject_livereload(&html);

    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(injected))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }
}

pub struct BasilServer {
    state: AppState,
    addr: SocketAddr,
}

impl BasilServer {
    pub fn builder(state: AppState) -> BasilServerBuilder {
        BasilServerBuilder { state }
    }

    /// The fully assembled router, for tests driven with
    /// `tower::ServiceExt::oneshot` or embedding elsewhere.
    pub fn router(&self) -> AxumRouter {
        build_router(self.state.clone())
    }

    pub async fn serve(self) -> Result<()> {
        let router = build_router(self.state.clone());
        let listener = TcpListener::bind(self.addr).await.map_err(Error::Transport)?;

        tracing::info!(addr = %self.addr, "starting basil server");

        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(Error::Transport)?;

        tracing::info!("server shutdown complete");
        Ok(())
    }
}

pub struct BasilServerBuilder {
    state: AppState,
}

impl BasilServerBuilder {
    /// Installs a `tracing-subscriber` formatter based on the configured
    /// `log_level`/`log_json`, falling back to `RUST_LOG` when set.
    /// Tolerant of a subscriber already being installed (e.g. in tests).
    pub fn init_tracing(self) -> Self {
        use tracing_subscriber::EnvFilter;

        let config = self.state.config();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone()));

        let result = if config.server.log_json {
            tracing_subscriber::fmt().json().with_env_filter(filter).try_init()
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).try_init()
        };
        if let Err(err) = result {
            tracing::debug!(%err, "tracing subscriber already initialized");
        }

        self
    }

    pub fn build(self) -> Result<BasilServer> {
        let config = self.state.config();
        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| Error::Internal(format!("invalid server address: {e}")))?;
        Ok(BasilServer { state: self.state, addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Evaluator, NullEvaluator};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let evaluator: Arc<dyn Evaluator> = Arc::new(NullEvaluator { result: Value::Null });
        AppState::builder(evaluator).config(crate::config::Config::default()).build().unwrap()
    }

    #[tokio::test]
    async fn unmatched_path_with_no_site_configured_is_404() {
        let router = build_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_asset_hash_is_404() {
        let router = build_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/__p/deadbeef.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_gated_page_route_without_session_is_unauthorized() {
        let mut config = crate::config::Config::default();
        config.routes.push(crate::config::RouteConfig {
            prefix: "/admin".to_string(),
            handler_path: PathBuf::from("/nonexistent/admin.pars"),
            auth: AuthMode::Auth,
            public_dir: None,
            cache_ttl_secs: 0,
            route_type: RouteType::Page,
        });
        let evaluator: Arc<dyn Evaluator> = Arc::new(NullEvaluator { result: Value::Null });
        let state = AppState::builder(evaluator).config(config).build().unwrap();

        let router = build_router(state);
        let response = router
            .oneshot(Request::builder().uri("/admin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = build_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/__/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn livereload_poll_is_404_in_production() {
        let router = build_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/__/livereload/poll").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn livereload_poll_reports_sequence_in_dev_mode() {
        let mut config = crate::config::Config::default();
        config.server.dev = true;
        let evaluator: Arc<dyn Evaluator> = Arc::new(NullEvaluator { result: Value::Null });
        let state = AppState::builder(evaluator).config(config).build().unwrap();

        let router = build_router(state);
        let response = router
            .oneshot(Request::builder().uri("/__/livereload/poll").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_get_export_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let handler_path = dir.path().join("widgets.pars");
        std::fs::write(&handler_path, "-- test fixture, never parsed").unwrap();

        let mut config = crate::config::Config::default();
        config.routes.push(crate::config::RouteConfig {
            prefix: "/api/widgets".to_string(),
            handler_path,
            auth: AuthMode::Public,
            public_dir: None,
            cache_ttl_secs: 0,
            route_type: RouteType::Api,
        });

        let env = Environment::new(dir.path().to_path_buf());
        let module = BasilDict::new(&env);
        module.insert("get", Value::Function(Arc::new(())));
        let result = Value::Dictionary(module);

        let evaluator: Arc<dyn Evaluator> = Arc::new(NullEvaluator { result });
        let state = AppState::builder(evaluator).config(config).build().unwrap();

        let router = build_router(state);
        let response = router
            .oneshot(Request::builder().uri("/api/widgets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_api_method_is_405() {
        let dir = tempfile::tempdir().unwrap();
        let handler_path = dir.path().join("widgets.pars");
        std::fs::write(&handler_path, "-- test fixture, never parsed").unwrap();

        let mut config = crate::config::Config::default();
        config.routes.push(crate::config::RouteConfig {
            prefix: "/api/widgets".to_string(),
            handler_path,
            auth: AuthMode::Public,
            public_dir: None,
            cache_ttl_secs: 0,
            route_type: RouteType::Api,
        });

        let env = Environment::new(dir.path().to_path_buf());
        let module = BasilDict::new(&env);
        module.insert("get", Value::Function(Arc::new(())));
        let result = Value::Dictionary(module);

        let evaluator: Arc<dyn Evaluator> = Arc::new(NullEvaluator { result });
        let state = AppState::builder(evaluator).config(config).build().unwrap();

        let router = build_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/widgets")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
