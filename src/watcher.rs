//! Config watcher: single-path watch, debounce, typed reload fan-out.
//!
//! Design reference: spec §4.10. Grounded on `notify` +
//! `notify-debouncer-mini` (see `other_examples/.../fs_watch/watcher.rs`'s
//! debounce-then-reload design sketch) combined with the teacher's
//! background-task-plus-stop-handle shape used by
//! `observability::retention::spawn_retention_task`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebouncedEventKind, Debouncer};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to start file watcher on {path}: {source}")]
    Start { path: PathBuf, #[source] source: notify_debouncer_mini::notify::Error },
}

type Handlers<T> = Arc<Mutex<HashMap<u64, Box<dyn Fn(T) + Send + Sync>>>>;

/// An idempotent unsubscribe token: calling `unsubscribe` more than once,
/// or after the watcher has stopped, is a no-op (spec §4.10).
pub struct Unsubscriber<T> {
    id: u64,
    handlers: Handlers<T>,
}

impl<T> Unsubscriber<T> {
    pub fn unsubscribe(&self) {
        self.handlers.lock().expect("handler registry lock poisoned").remove(&self.id);
    }
}

/// Watches a single file path and fans out successfully-loaded values to
/// registered handlers after a debounce window.
pub struct ConfigWatcher<T> {
    handlers: Handlers<T>,
    next_id: AtomicU64,
    current: Arc<RwLock<Option<T>>>,
    stopped: Arc<AtomicBool>,
    debouncer: Mutex<Option<Debouncer<notify_debouncer_mini::notify::RecommendedWatcher>>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<T> ConfigWatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start watching `path`. `loader` re-reads and parses the file;
    /// `on_error` is invoked with the loader's error message on failure,
    /// and reload handlers are *not* called in that case (spec §4.10).
    pub fn watch<L, E, H>(
        path: impl Into<PathBuf>,
        debounce: Duration,
        loader: L,
        on_error: H,
    ) -> Result<Self, WatcherError>
    where
        L: Fn(&Path) -> Result<T, E> + Send + 'static,
        E: std::fmt::Display,
        H: Fn(String) + Send + 'static,
    {
        let path = path.into();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer =
            new_debouncer(debounce, tx).map_err(|source| WatcherError::Start { path: path.clone(), source })?;
        debouncer
            .watcher()
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|source| WatcherError::Start { path: path.clone(), source })?;

        let handlers: Handlers<T> = Arc::new(Mutex::new(HashMap::new()));
        let current = Arc::new(RwLock::new(None));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread_handlers = handlers.clone();
        let thread_current = current.clone();
        let thread_stopped = stopped.clone();
        let thread_path = path.clone();

        let join = std::thread::spawn(move || {
            for result in rx {
                if thread_stopped.load(Ordering::SeqCst) {
                    break;
                }
                let fired = match result {
                    Ok(events) => events.iter().any(|e| e.kind == DebouncedEventKind::Any),
                    Err(errors) => {
                        for e in errors {
                            warn!(path = %thread_path.display(), error = %e, "config watcher notify error");
                        }
                        false
                    }
                };
                if !fired {
                    continue;
                }

                match loader(&thread_path) {
                    Ok(value) => {
                        *thread_current.write().expect("current value lock poisoned") = Some(value.clone());
                        if thread_stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        let handlers = thread_handlers.lock().expect("handler registry lock poisoned");
                        info!(path = %thread_path.display(), handler_count = handlers.len(), "config reloaded");
                        for handler in handlers.values() {
                            handler(value.clone());
                        }
                    }
                    Err(e) => on_error(e.to_string()),
                }
            }
        });

        Ok(Self {
            handlers,
            next_id: AtomicU64::new(0),
            current,
            stopped,
            debouncer: Mutex::new(Some(debouncer)),
            join: Mutex::new(Some(join)),
        })
    }

    /// Register a reload handler; returns a move-only-in-spirit token whose
    /// `unsubscribe` is idempotent.
    pub fn on_reload<F>(&self, handler: F) -> Unsubscriber<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .insert(id, Box::new(handler));
        Unsubscriber { id, handlers: self.handlers.clone() }
    }

    #[must_use]
    pub fn current(&self) -> Option<T> {
        self.current.read().expect("current value lock poisoned").clone()
    }

    /// Stop watching. After this returns, no further handlers fire (spec
    /// §4.10 invariant).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // dropping the debouncer tears down the underlying OS watch, which
        // closes the channel and lets the background thread exit.
        drop(self.debouncer.lock().expect("debouncer lock poisoned").take());
        if let Some(handle) = self.join.lock().expect("join lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl<T> Drop for ConfigWatcher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::RecvTimeoutError;

    #[test]
    fn reload_fans_out_to_handlers_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "value = 1\n").unwrap();

        let watcher = ConfigWatcher::watch(
            path.clone(),
            Duration::from_millis(50),
            |p| std::fs::read_to_string(p).map_err(|e| e.to_string()),
            |err| panic!("unexpected loader error: {err}"),
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let _unsub = watcher.on_reload(move |value: String| {
            let _ = tx.send(value);
        });

        std::fs::write(&path, "value = 2\n").unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5));
        assert!(matches!(received, Ok(_)), "expected a reload within 5s, got {received:?}");
        assert_eq!(received.unwrap(), "value = 2\n");
        assert_eq!(watcher.current(), Some("value = 2\n".to_owned()));
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_future_fires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "a\n").unwrap();

        let watcher = ConfigWatcher::watch(
            path.clone(),
            Duration::from_millis(50),
            |p| std::fs::read_to_string(p).map_err(|e| e.to_string()),
            |_| {},
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let unsub = watcher.on_reload(move |value: String| {
            let _ = tx.send(value);
        });
        unsub.unsubscribe();
        unsub.unsubscribe(); // idempotent

        std::fs::write(&path, "b\n").unwrap();
        let received = rx.recv_timeout(Duration::from_millis(500));
        assert_eq!(received, Err(RecvTimeoutError::Timeout));
    }

    #[test]
    fn no_handlers_fire_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "a\n").unwrap();

        let watcher = ConfigWatcher::watch(
            path.clone(),
            Duration::from_millis(50),
            |p| std::fs::read_to_string(p).map_err(|e| e.to_string()),
            |_| {},
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let _unsub = watcher.on_reload(move |value: String| {
            let _ = tx.send(value);
        });

        watcher.stop();
        std::fs::write(&path, "b\n").unwrap();
        let received = rx.recv_timeout(Duration::from_millis(300));
        assert_eq!(received, Err(RecvTimeoutError::Timeout));
    }
}
