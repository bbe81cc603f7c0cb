//! Watcher (spec.md §4.12): observes the configured source directories and
//! invalidates ScriptCache/ResponseCache on change, coalescing bursts of
//! filesystem events into a single reload signal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::{ResponseCache, ScriptCache};

/// Events within this window collapse into a single reload (spec.md §4.12).
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Clears caches on filesystem change and exposes a monotonically increasing
/// sequence number for clients to poll (`/__/livereload/poll`).
pub struct Watcher {
    sequence: Arc<AtomicU64>,
    _notify: Option<RecommendedWatcher>,
}

impl Watcher {
    /// Starts observing `dirs`. A background task debounces raw filesystem
    /// events and clears `scripts`/`responses` once per coalesced burst.
    /// `dirs` empty is a valid, inert watcher (nothing to observe).
    pub fn start(dirs: Vec<PathBuf>, scripts: Arc<ScriptCache>, responses: Arc<ResponseCache>) -> Self {
        let sequence = Arc::new(AtomicU64::new(0));

        if dirs.is_empty() {
            return Self { sequence, _notify: None };
        }

        let (tx, rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = match RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => warn!(%err, "watcher event error"),
            },
            notify::Config::default(),
        ) {
            Ok(w) => w,
            Err(err) => {
                warn!(%err, "failed to start filesystem watcher; live reload disabled");
                return Self { sequence, _notify: None };
            }
        };

        for dir in &dirs {
            if let Err(err) = watcher.watch(dir, RecursiveMode::Recursive) {
                warn!(%err, dir = %dir.display(), "failed to watch directory");
            }
        }

        tokio::spawn(debounce_loop(rx, sequence.clone(), scripts, responses));

        Self { sequence, _notify: Some(watcher) }
    }

    /// A watcher with no directories configured; clears nothing, sequence
    /// never advances.
    pub fn inert() -> Self {
        Self { sequence: Arc::new(AtomicU64::new(0)), _notify: None }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<Event>,
    sequence: Arc<AtomicU64>,
    scripts: Arc<ScriptCache>,
    responses: Arc<ResponseCache>,
) {
    while rx.recv().await.is_some() {
        // Drain whatever else arrives within the debounce window so a burst
        // of events (editor save = delete + create + modify) becomes one
        // cache clear and one sequence bump.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(DEBOUNCE) => break,
                more = rx.recv() => {
                    if more.is_none() {
                        break;
                    }
                }
            }
        }

        scripts.clear();
        responses.clear();
        sequence.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NullEvaluator;
    use crate::value::Value;

    #[test]
    fn inert_watcher_starts_at_sequence_zero() {
        let watcher = Watcher::inert();
        assert_eq!(watcher.sequence(), 0);
    }

    #[tokio::test]
    async fn empty_dirs_produces_an_inert_watcher() {
        let evaluator = Arc::new(NullEvaluator { result: Value::Null });
        let scripts = Arc::new(ScriptCache::new(false, evaluator));
        let responses = Arc::new(ResponseCache::new(false, false));
        let watcher = Watcher::start(Vec::new(), scripts, responses);
        assert_eq!(watcher.sequence(), 0);
    }

    #[tokio::test]
    async fn change_under_a_watched_directory_bumps_the_sequence_and_clears_caches() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("index.pars");
        std::fs::write(&script_path, "one").unwrap();

        let evaluator = Arc::new(NullEvaluator { result: Value::Null });
        let scripts = Arc::new(ScriptCache::new(false, evaluator));
        scripts.get_ast(&script_path).unwrap();
        assert_eq!(scripts.len(), 1);
        let responses = Arc::new(ResponseCache::new(false, false));
        responses.set(
            "k".to_string(),
            Duration::from_secs(60),
            200,
            axum::http::HeaderMap::new(),
            bytes::Bytes::new(),
        );

        let watcher = Watcher::start(vec![dir.path().to_path_buf()], scripts.clone(), responses.clone());

        std::fs::write(&script_path, "two").unwrap();

        // Give the debounced background task time to observe and react.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if watcher.sequence() > 0 {
                break;
            }
        }

        assert!(watcher.sequence() > 0, "watcher never observed the change");
        assert!(scripts.is_empty());
        assert!(responses.get("k").is_none());
    }
}
