//! Typed configuration, loaded via `figment`.
//!
//! Precedence (highest wins): `BASIL_`-prefixed environment variables >
//! `./basil.toml` in the working directory > the XDG config directory >
//! built-in defaults. This mirrors the precedence chain used throughout
//! this codebase's configuration layer.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub site: Option<SiteConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitDefaults,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Directories the Watcher observes for live reload (spec.md §4.12).
    #[serde(default)]
    pub watch_dirs: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            routes: Vec::new(),
            site: None,
            session: SessionConfig::default(),
            security_headers: SecurityHeadersConfig::default(),
            cors: CorsConfig::default(),
            compression: CompressionConfig::default(),
            rate_limit: RateLimitDefaults::default(),
            cache: CacheConfig::default(),
            watch_dirs: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(base_dirs) = xdg_config_path() {
            figment = figment.merge(Toml::file(base_dirs));
        }

        figment = figment.merge(Toml::file("basil.toml"));
        figment = figment.merge(Env::prefixed("BASIL_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Internal(format!("failed to load configuration: {e}")))
    }
}

fn xdg_config_path() -> Option<PathBuf> {
    xdg::BaseDirectories::with_prefix("basil")
        .ok()
        .and_then(|dirs| dirs.find_config_file("basil.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Development mode. Disables ResponseCache/FragmentCache (unless
    /// explicitly overridden), enables ErrorRenderer's HTML pages, and
    /// serves assets with `no-cache` headers (spec.md §3 invariant 5, §7, §6).
    #[serde(default)]
    pub dev: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
    /// Trust `X-Forwarded-For` for the proxy-aware remote address
    /// middleware (spec.md §4.13).
    #[serde(default)]
    pub trust_proxies: bool,
    /// `RUST_LOG`-style filter directive, used when the environment does
    /// not already override it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit structured JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev: false,
            timeout_secs: default_timeout_secs(),
            body_limit_mb: default_body_limit_mb(),
            trust_proxies: false,
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_body_limit_mb() -> usize {
    32
}

/// A configured route entry (spec.md §3 "Route").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    pub handler_path: PathBuf,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
    /// Cache TTL in seconds; `0` means not cacheable.
    #[serde(default)]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub route_type: RouteType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    #[default]
    Page,
    Api,
    Site,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AuthMode {
    #[default]
    Public,
    Auth,
    Admin,
    Roles {
        roles: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,
    #[serde(default)]
    pub cookie_domain: Option<String>,
    #[serde(default = "default_same_site")]
    pub same_site: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub csrf: CsrfConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            expiry_secs: default_expiry_secs(),
            cookie_path: default_cookie_path(),
            cookie_domain: None,
            same_site: default_same_site(),
            secret: None,
            csrf: CsrfConfig::default(),
        }
    }
}

fn default_cookie_name() -> String {
    "basil_session".to_string()
}
fn default_expiry_secs() -> u64 {
    86_400
}
fn default_cookie_path() -> String {
    "/".to_string()
}
fn default_same_site() -> String {
    "lax".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "default_csrf_cookie")]
    pub cookie_name: String,
    #[serde(default = "default_csrf_header")]
    pub header_name: String,
    #[serde(default = "default_csrf_field")]
    pub form_field_name: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_csrf_cookie(),
            header_name: default_csrf_header(),
            form_field_name: default_csrf_field(),
        }
    }
}

fn default_csrf_cookie() -> String {
    "csrf_token".to_string()
}
fn default_csrf_header() -> String {
    "X-CSRF-Token".to_string()
}
fn default_csrf_field() -> String {
    "_csrf".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hsts: bool,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,
    #[serde(default = "default_true")]
    pub x_content_type_options: bool,
    #[serde(default = "default_frame_options")]
    pub x_frame_options: String,
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: false,
            hsts_max_age_secs: default_hsts_max_age(),
            x_content_type_options: true,
            x_frame_options: default_frame_options(),
            referrer_policy: default_referrer_policy(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_hsts_max_age() -> u64 {
    31_536_000
}
fn default_frame_options() -> String {
    "DENY".to_string()
}
fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins; wildcard `*` accepted. Empty means CORS is disabled.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_compression_threshold")]
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: default_compression_threshold(),
        }
    }
}

fn default_compression_threshold() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDefaults {
    #[serde(default = "default_rpm")]
    pub requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            requests: default_rpm(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_rpm() -> u32 {
    60
}
fn default_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_fragment_cache_cap")]
    pub fragment_cache_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fragment_cache_max_entries: default_fragment_cache_cap(),
        }
    }
}

fn default_fragment_cache_cap() -> usize {
    100
}
