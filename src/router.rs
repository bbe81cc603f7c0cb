//! Router (spec.md §4.7) and filesystem walk-back / siteHandler (spec.md
//! §4.8).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{RouteConfig, RouteType, SiteConfig};

#[derive(Debug)]
pub enum Dispatch {
    Asset,
    Static(PathBuf),
    Explicit(Arc<RouteConfig>),
    Site,
    NotFound,
}

pub struct Router {
    routes: Vec<RouteConfig>,
    global_public_dir: Option<PathBuf>,
    site: Option<SiteConfig>,
}

impl Router {
    pub fn new(routes: Vec<RouteConfig>, global_public_dir: Option<PathBuf>, site: Option<SiteConfig>) -> Self {
        Self { routes, global_public_dir, site }
    }

    /// Six-step precedence, first match wins (spec.md §4.7).
    pub fn dispatch(&self, path: &str) -> Dispatch {
        if let Some(rest) = path.strip_prefix("/__p/") {
            if !rest.is_empty() {
                return Dispatch::Asset;
            }
        }

        // Step 2: explicit static routes (site-typed, own public dir) whose
        // prefix is not the bare root.
        for route in &self.routes {
            if route.route_type != RouteType::Site || route.prefix == "/" {
                continue;
            }
            let Some(dir) = &route.public_dir else { continue };
            if let Some(rel) = path.strip_prefix(&route.prefix) {
                let candidate = dir.join(rel.trim_start_matches('/'));
                if candidate.is_file() {
                    return Dispatch::Static(candidate);
                }
            }
        }

        // Step 3: explicit routes by prefix, longest-prefix wins.
        let mut best: Option<&RouteConfig> = None;
        for route in &self.routes {
            if route.prefix == "/" {
                continue;
            }
            if path.starts_with(route.prefix.as_str())
                && best.map(|b| route.prefix.len() > b.prefix.len()).unwrap_or(true)
            {
                best = Some(route);
            }
        }
        if let Some(route) = best {
            return Dispatch::Explicit(Arc::new(route.clone()));
        }

        // Step 4: root-handler fallback.
        if path != "/" {
            if let Some(dir) = &self.global_public_dir {
                let candidate = dir.join(path.trim_start_matches('/'));
                if candidate.is_file() {
                    return Dispatch::Static(candidate);
                }
            }
        }
        if let Some(root) = self.routes.iter().find(|r| r.prefix == "/") {
            return Dispatch::Explicit(Arc::new(root.clone()));
        }

        // Step 5: site mode.
        if self.site.is_some() {
            return Dispatch::Site;
        }

        Dispatch::NotFound
    }

    pub fn site(&self) -> Option<&SiteConfig> {
        self.site.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalkBackResult {
    Found { handler_path: PathBuf, subpath: Vec<String> },
    RedirectTrailingSlash(String),
    Static(PathBuf),
    RejectedTraversal,
    RejectedHidden,
    NotFound { tried: Vec<PathBuf> },
}

/// `siteHandler::find_handler` (spec.md §4.8, steps 1–5).
pub fn find_handler(site_root: &Path, public_dir: Option<&Path>, url_path: &str) -> WalkBackResult {
    let segments: Vec<&str> = url_path.split('/').filter(|s| !s.is_empty()).collect();

    for seg in &segments {
        if *seg == ".." {
            return WalkBackResult::RejectedTraversal;
        }
        if seg.starts_with('.') {
            return WalkBackResult::RejectedHidden;
        }
    }

    if !url_path.ends_with('/') {
        let dir_path = site_root.join(segments.join("/"));
        if dir_path.is_dir() && dir_path.join("index.pars").is_file() {
            return WalkBackResult::RedirectTrailingSlash(format!("{url_path}/"));
        }
    }

    if let Some(dir) = public_dir {
        let candidate = dir.join(segments.join("/"));
        if candidate.is_file() {
            return WalkBackResult::Static(candidate);
        }
    }

    let mut tried = Vec::new();
    for depth in (0..=segments.len()).rev() {
        let dir = site_root.join(segments[..depth].join("/"));

        if depth > 0 {
            let folder_named = dir.join(format!("{}.pars", segments[depth - 1]));
            tried.push(folder_named.clone());
            if folder_named.is_file() {
                return WalkBackResult::Found {
                    handler_path: folder_named,
                    subpath: segments[depth..].iter().map(|s| s.to_string()).collect(),
                };
            }
        }

        let index = dir.join("index.pars");
        tried.push(index.clone());
        if index.is_file() {
            return WalkBackResult::Found {
                handler_path: index,
                subpath: segments[depth..].iter().map(|s| s.to_string()).collect(),
            };
        }
    }

    WalkBackResult::NotFound { tried }
}
