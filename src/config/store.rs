//! Config directory watcher.
//!
//! Tracks every file under the config directory by modification time. A
//! poll compares the stored timestamps against the filesystem and calls the
//! listener bound to each changed file exactly once. Files without a
//! listener are tracked but never produce a callback.

use crate::config::flatten_table;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

/// Something that reloads itself when its config file changes.
#[async_trait]
pub trait ConfigListener: Send + Sync {
    /// Called once per detected change of the file this listener is bound to.
    async fn load_conf(&self, path: &Path) -> Result<()>;
}

/// One tracked file.
struct ConfigFileRecord {
    /// `None` until the file has been seen on disk.
    last_modified: Option<SystemTime>,
    /// Held weakly: the store never keeps its listeners alive.
    listener: Option<Weak<dyn ConfigListener>>,
}

/// A file whose timestamp changed during a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub file_name: String,
    pub path: PathBuf,
    /// Whether a listener was called for this change.
    pub notified: bool,
}

/// Polling watcher over one config directory.
pub struct ConfigStore {
    dir: PathBuf,
    records: Mutex<BTreeMap<String, ConfigFileRecord>>,
}

impl ConfigStore {
    /// Open a store over `dir` and record the current timestamp of every file
    /// in it. Files present at open time never count as changed.
    ///
    /// The initial scan reads the directory on the calling thread; later
    /// polls read it on the blocking pool.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let store = Self {
            dir: dir.into(),
            records: Mutex::new(BTreeMap::new()),
        };
        store.apply(read_timestamps(&store.dir));
        store
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read a TOML file into flat `key -> value` pairs.
    pub async fn load(path: &Path) -> Result<BTreeMap<String, String>> {
        let content = tokio::fs::read_to_string(path).await?;
        let table: toml::Table = toml::from_str(&content)?;
        Ok(flatten_table(&table))
    }

    /// Bind `listener` to `file_name`. First registrant wins: returns `false`
    /// if the file already has a listener. The file need not exist yet; its
    /// later appearance counts as a change.
    pub fn register_listener(&self, file_name: &str, listener: Weak<dyn ConfigListener>) -> bool {
        let mut records = self.lock();
        let record = records
            .entry(file_name.to_string())
            .or_insert_with(|| ConfigFileRecord {
                last_modified: None,
                listener: None,
            });
        if record.listener.is_some() {
            warn!(file = file_name, "config file already has a listener, ignoring");
            return false;
        }
        record.listener = Some(listener);
        debug!(file = file_name, "config listener registered");
        true
    }

    /// Names of all tracked files.
    pub fn tracked_files(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Compare timestamps and call the listener of every changed file.
    ///
    /// Listener errors are logged; they never stop the remaining files from
    /// being processed.
    pub async fn poll_changes(&self) -> Vec<ChangedFile> {
        let dir = self.dir.clone();
        let on_disk = tokio::task::spawn_blocking(move || read_timestamps(&dir))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e)));
        let pending = self.apply(on_disk);
        let mut changed = Vec::with_capacity(pending.len());

        for (file_name, listener) in pending {
            let path = self.dir.join(&file_name);
            let notified = match listener {
                Some(listener) => {
                    info!(file = %file_name, "config file changed, reloading");
                    if let Err(e) = listener.load_conf(&path).await {
                        error!(file = %file_name, error = %e, "config reload failed");
                    }
                    true
                }
                None => {
                    debug!(file = %file_name, "config file changed, no listener");
                    false
                }
            };
            changed.push(ChangedFile {
                file_name,
                path,
                notified,
            });
        }

        changed
    }

    /// Update timestamps from a directory read. Returns the changed files
    /// together with their live listener, if any. The lock is released before
    /// any listener runs, so listeners may register further files.
    fn apply(
        &self,
        on_disk: std::io::Result<BTreeMap<String, SystemTime>>,
    ) -> Vec<(String, Option<Arc<dyn ConfigListener>>)> {
        let on_disk = match on_disk {
            Ok(map) => map,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "cannot read config dir");
                return Vec::new();
            }
        };

        let mut records = self.lock();
        let mut pending = Vec::new();

        for (file_name, modified) in &on_disk {
            match records.get_mut(file_name) {
                Some(record) => {
                    if record.last_modified == Some(*modified) {
                        continue;
                    }
                    record.last_modified = Some(*modified);
                    let listener = record.listener.as_ref().and_then(Weak::upgrade);
                    pending.push((file_name.clone(), listener));
                }
                None => {
                    // First sighting: tracked silently.
                    records.insert(
                        file_name.clone(),
                        ConfigFileRecord {
                            last_modified: Some(*modified),
                            listener: None,
                        },
                    );
                }
            }
        }

        records.retain(|file_name, record| {
            if on_disk.contains_key(file_name) {
                return true;
            }
            if record.listener.is_some() {
                if record.last_modified.take().is_some() {
                    warn!(file = %file_name, "watched config file disappeared");
                }
                true
            } else {
                false
            }
        });

        pending
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ConfigFileRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Modification time of every regular file in `dir`. A file whose metadata
/// cannot be read is skipped with a warning. Blocking.
fn read_timestamps(dir: &Path) -> std::io::Result<BTreeMap<String, SystemTime>> {
    let mut out = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let meta = match entry.metadata().and_then(|m| m.modified().map(|t| (m, t))) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(file = %entry.path().display(), error = %e, "cannot stat config file");
                continue;
            }
        };
        if !meta.0.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            out.insert(name.to_string(), meta.1);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ConfigListener for Counting {
        async fn load_conf(&self, _path: &Path) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bump_mtime(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn existing_files_are_not_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), "x = 1").unwrap();
        let store = ConfigStore::open(dir.path());
        assert!(store.poll_changes().await.is_empty());
        assert_eq!(store.tracked_files(), vec!["a.toml".to_string()]);
    }

    #[tokio::test]
    async fn first_registrant_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path());
        let a: Arc<dyn ConfigListener> = Arc::new(Counting(AtomicUsize::new(0)));
        let b: Arc<dyn ConfigListener> = Arc::new(Counting(AtomicUsize::new(0)));
        assert!(store.register_listener("a.toml", Arc::downgrade(&a)));
        assert!(!store.register_listener("a.toml", Arc::downgrade(&b)));
    }

    #[tokio::test]
    async fn appearing_watched_file_triggers_listener() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path());
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        let dyn_listener: Arc<dyn ConfigListener> = listener.clone();
        store.register_listener("late.toml", Arc::downgrade(&dyn_listener));

        std::fs::write(dir.path().join("late.toml"), "x = 1").unwrap();
        let changed = store.poll_changes().await;
        assert_eq!(changed.len(), 1);
        assert!(changed[0].notified);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        // No further change, no further callback.
        assert!(store.poll_changes().await.is_empty());
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_listener_is_not_called() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.toml");
        std::fs::write(&path, "x = 1").unwrap();
        let store = ConfigStore::open(dir.path());
        {
            let listener: Arc<dyn ConfigListener> = Arc::new(Counting(AtomicUsize::new(0)));
            store.register_listener("a.toml", Arc::downgrade(&listener));
        }
        bump_mtime(&path, 5);
        let changed = store.poll_changes().await;
        assert_eq!(changed.len(), 1);
        assert!(!changed[0].notified);
    }

    #[tokio::test]
    async fn load_flattens_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "url = \"http://fax\"\n[retry]\nmax_tries = 4\n").unwrap();
        let map = ConfigStore::load(&path).await.unwrap();
        assert_eq!(map["url"], "http://fax");
        assert_eq!(map["retry.max_tries"], "4");
    }
}
