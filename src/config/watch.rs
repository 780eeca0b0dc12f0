//! Filesystem hot-reload for `~/.clp/`.
//!
//! Grounded in `api_claude`'s `dynamic-config` feature (the Wandalen pack's
//! `notify` + `parking_lot` combination): a background watcher thread feeds
//! change events into an async task that reloads the matching `Document`
//! from disk, so an operator editing `claude.json` by hand (or the external
//! config-editor UI, out of scope here) is picked up without a restart.

use std::path::PathBuf;
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::store::ConfigStore;

/// Start watching `store.root()` for writes and reload the affected document
/// on each event. Returns a guard; dropping it stops the watcher.
pub fn spawn_watcher(store: Arc<ConfigStore>) -> WatcherGuard {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

    // `notify`'s callback runs on its own thread; hand events off to tokio
    // via an unbounded channel rather than blocking that thread.
    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                ) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
        },
        notify::Config::default(),
    );

    let watcher = match watcher {
        Ok(w) => Arc::new(Mutex::new(w)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to construct config file watcher, hot-reload disabled");
            return WatcherGuard { handle: None };
        }
    };

    if let Err(e) = watcher
        .lock()
        .watch(store.root(), RecursiveMode::Recursive)
    {
        tracing::warn!(error = %e, path = %store.root().display(), "failed to watch config directory, hot-reload disabled");
        return WatcherGuard { handle: None };
    }

    let handle = tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of this task.
        let _watcher = watcher;
        while let Some(path) = rx.recv().await {
            if let Err(e) = store.reload_path(&path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to reload changed config document");
            } else {
                tracing::debug!(path = %path.display(), "reloaded config document after external change");
            }
        }
    });

    WatcherGuard {
        handle: Some(handle),
    }
}

pub struct WatcherGuard {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
