//! AssetRegistry (spec.md §4.4): content-addressed public URL allocator for
//! private files, plus its companion `/__p/<hash>.<ext>` HTTP handler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

const MAX_ASSET_BYTES: u64 = 100 * 1024 * 1024;
const WARN_ASSET_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
struct AssetEntry {
    hash: String,
    mtime: SystemTime,
    size: u64,
}

/// Two indexes, exactly as spec.md §3 describes: hash→filepath and
/// filepath→{hash,mtime,size}, so re-registering an unchanged file is a
/// cheap stat rather than a re-read-and-rehash.
pub struct AssetRegistry {
    by_hash: DashMap<String, PathBuf>,
    by_path: DashMap<PathBuf, AssetEntry>,
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self {
            by_hash: DashMap::new(),
            by_path: DashMap::new(),
        }
    }

    /// `Register(filepath) → url`.
    pub fn register(&self, filepath: &Path) -> Result<String, crate::error::Error> {
        let metadata = std::fs::metadata(filepath).map_err(crate::error::Error::Transport)?;
        let size = metadata.len();
        let mtime = metadata
            .modified()
            .map_err(crate::error::Error::Transport)?;

        if size > MAX_ASSET_BYTES {
            return Err(crate::error::Error::BadRequest(format!(
                "asset {} exceeds the 100 MiB registration limit",
                filepath.display()
            )));
        }
        if size > WARN_ASSET_BYTES {
            tracing::warn!(path = %filepath.display(), size, "asset exceeds 10 MiB");
        }

        if let Some(entry) = self.by_path.get(filepath) {
            if entry.mtime == mtime && entry.size == size {
                return Ok(stable_url(&entry.hash, filepath));
            }
        }

        let bytes = std::fs::read(filepath).map_err(crate::error::Error::Transport)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let hash = to_hex16(&digest);

        self.by_hash.insert(hash.clone(), filepath.to_path_buf());
        self.by_path.insert(
            filepath.to_path_buf(),
            AssetEntry { hash: hash.clone(), mtime, size },
        );

        Ok(stable_url(&hash, filepath))
    }

    /// `Lookup(hash) → (filepath, ok)`.
    pub fn lookup(&self, hash: &str) -> Option<PathBuf> {
        self.by_hash.get(hash).map(|entry| entry.clone())
    }

    /// Registers in-memory content (e.g. the livereload script embedded in
    /// the binary) under the same content-addressed scheme as `register`,
    /// writing it once to a temp file so `serve_asset` can read it back.
    pub fn register_bytes(&self, bytes: &[u8], ext: &str) -> Result<String, crate::error::Error> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = to_hex16(&hasher.finalize());

        if let Some(path) = self.by_hash.get(&hash) {
            return Ok(stable_url(&hash, &path));
        }

        let path = std::env::temp_dir().join(format!("basil-asset-{hash}.{ext}"));
        std::fs::write(&path, bytes).map_err(crate::error::Error::Transport)?;
        let metadata = std::fs::metadata(&path).map_err(crate::error::Error::Transport)?;

        self.by_hash.insert(hash.clone(), path.clone());
        self.by_path.insert(
            path.clone(),
            AssetEntry {
                hash: hash.clone(),
                mtime: metadata.modified().map_err(crate::error::Error::Transport)?,
                size: metadata.len(),
            },
        );

        Ok(stable_url(&hash, &path))
    }

    pub fn clear(&self) {
        self.by_hash.clear();
        self.by_path.clear();
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

fn to_hex16(digest: &[u8]) -> String {
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn stable_url(hash: &str, filepath: &Path) -> String {
    let ext = filepath
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("/__p/{hash}{ext}")
}

/// The HTTP handler for `GET /__p/<hash>.<ext>` (spec.md §4.4, §6).
///
/// State the handler needs: the registry itself and whether the server is
/// running in development mode (controls the Cache-Control header).
pub async fn serve_asset(
    State((registry, dev_mode)): State<(Arc<AssetRegistry>, bool)>,
    AxumPath(hash_and_ext): AxumPath<String>,
) -> Response {
    let (hash, ext) = match hash_and_ext.split_once('.') {
        Some((hash, ext)) => (hash, ext),
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    let Some(filepath) = registry.lookup(hash) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Defense against extension confusion (spec.md §4.4): the stored
    // file's own extension must equal the one requested.
    let stored_ext = filepath.extension().and_then(|e| e.to_str()).unwrap_or("");
    if stored_ext != ext {
        return StatusCode::NOT_FOUND.into_response();
    }

    let bytes = match std::fs::read(&filepath) {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let mime = mime_guess_from_ext(ext);
    let cache_control = if dev_mode {
        "no-cache, no-store, must-revalidate"
    } else {
        "public, max-age=31536000, immutable"
    };

    let mut response = bytes.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    response
}

pub(crate) fn mime_guess_from_ext(ext: &str) -> &'static str {
    match ext {
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "woff2" => "font/woff2",
        "woff" => "font/woff",
        _ => "application/octet-stream",
    }
}
