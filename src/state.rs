//! Persisted port bindings.
//!
//! The router remembers which physical port each serial endpoint resolved
//! to, so restarts can skip the trial phase. The store is a flat key/value
//! namespace: `<endpoint>.port` entries plus the config digest used to
//! invalidate bindings when the configuration changes.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_DIGEST_KEY: &str = "config.digest";

pub fn port_key(name: &str) -> String {
    format!("{name}.port")
}

/// Small injected key/value persistence interface.
pub trait PortStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// TOML-file backed store. Every mutation rewrites the file; the data is a
/// handful of short strings and writes happen a few times per process
/// lifetime, so no write batching is needed.
pub struct FilePortStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl FilePortStore {
    /// Open a store at `path`. A missing file starts empty; an unreadable
    /// or corrupt file is discarded with a warning rather than refusing to
    /// start the router.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str::<BTreeMap<String, String>>(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!("state file {} is corrupt, starting empty: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("cannot read state file {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    fn save(&self, map: &BTreeMap<String, String>) {
        match toml::to_string(map) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!("cannot write state file {}: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("cannot serialize state: {}", e),
        }
    }
}

impl PortStore for FilePortStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        let mut map = self.map.lock();
        map.insert(key.to_string(), value.to_string());
        self.save(&map);
    }

    fn remove(&self, key: &str) {
        let mut map = self.map.lock();
        if map.remove(key).is_some() {
            self.save(&map);
        }
    }
}

/// In-memory store for tests and for running with persistence disabled.
#[derive(Default)]
pub struct MemoryPortStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl PortStore for MemoryPortStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map.lock().remove(key);
    }
}
