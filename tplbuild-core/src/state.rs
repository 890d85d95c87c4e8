//! Persistent build state.
//!
//! `.tplbuilddata.json` holds everything tplbuild manages itself rather
//! than being user configuration: the source-image digest locks, the
//! cached base-image digests, and the hash salt. Writes are atomic
//! (write-temp-then-rename) and in-process access is serialised by a
//! single writer; cross-process access is not protected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TplError};

/// Name of the state file within the project directory.
pub const STATE_FILE: &str = ".tplbuilddata.json";

/// On-disk state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildData {
    pub version: String,
    /// Folded into every base-image content hash; rotating it forces all
    /// base images to rebuild.
    pub salt: String,
    /// `repo:tag@platform` -> locked manifest digest.
    pub sources: BTreeMap<String, String>,
    /// base content hash -> platform -> manifest digest.
    pub base_images: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for BuildData {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            salt: uuid::Uuid::new_v4().to_string(),
            sources: BTreeMap::new(),
            base_images: BTreeMap::new(),
        }
    }
}

/// Key under which a source image lock is stored.
pub fn source_key(repo: &str, tag: &str, platform: &str) -> String {
    format!("{repo}:{tag}@{platform}")
}

/// Single-writer store over the state document.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    data: Mutex<BuildData>,
}

impl StateStore {
    /// Load the state for a project directory, creating fresh state (with
    /// a random salt) when no file exists yet.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(STATE_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|err| TplError::State {
                reason: format!("{}: {err}", path.display()),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BuildData::default(),
            Err(err) => {
                return Err(TplError::State {
                    reason: format!("{}: {err}", path.display()),
                })
            }
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// In-memory store used by tests.
    pub fn in_memory(data: BuildData) -> Self {
        Self {
            path: PathBuf::from(STATE_FILE),
            data: Mutex::new(data),
        }
    }

    /// Atomically persist the current state.
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().expect("state lock poisoned");
        let mut text = serde_json::to_string_pretty(&*data).map_err(|err| TplError::State {
            reason: format!("serializing state: {err}"),
        })?;
        text.push('\n');
        drop(data);

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|err| TplError::io(dir, err))?;
        std::io::Write::write_all(&mut temp, text.as_bytes())
            .map_err(|err| TplError::io(temp.path(), err))?;
        temp.persist(&self.path).map_err(|err| TplError::State {
            reason: format!("replacing {}: {}", self.path.display(), err.error),
        })?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    pub fn salt(&self) -> String {
        self.data.lock().expect("state lock poisoned").salt.clone()
    }

    /// Replace the salt with a fresh value, dropping the now-unreachable
    /// base image records.
    pub fn rotate_salt(&self) -> String {
        let mut data = self.data.lock().expect("state lock poisoned");
        data.salt = uuid::Uuid::new_v4().to_string();
        data.base_images.clear();
        data.salt.clone()
    }

    pub fn get_source(&self, repo: &str, tag: &str, platform: &str) -> Option<String> {
        self.data
            .lock()
            .expect("state lock poisoned")
            .sources
            .get(&source_key(repo, tag, platform))
            .cloned()
    }

    pub fn set_source(&self, repo: &str, tag: &str, platform: &str, digest: &str) {
        self.data
            .lock()
            .expect("state lock poisoned")
            .sources
            .insert(source_key(repo, tag, platform), digest.to_string());
    }

    pub fn clear_sources(&self) {
        self.data
            .lock()
            .expect("state lock poisoned")
            .sources
            .clear();
    }

    pub fn sources(&self) -> BTreeMap<String, String> {
        self.data
            .lock()
            .expect("state lock poisoned")
            .sources
            .clone()
    }

    pub fn get_base(&self, content_hash: &str, platform: &str) -> Option<String> {
        self.data
            .lock()
            .expect("state lock poisoned")
            .base_images
            .get(content_hash)
            .and_then(|by_platform| by_platform.get(platform))
            .cloned()
    }

    pub fn set_base(&self, content_hash: &str, platform: &str, digest: &str) {
        self.data
            .lock()
            .expect("state lock poisoned")
            .base_images
            .entry(content_hash.to_string())
            .or_default()
            .insert(platform.to_string(), digest.to_string());
    }

    /// Snapshot of the current document.
    pub fn snapshot(&self) -> BuildData {
        self.data.lock().expect("state lock poisoned").clone()
    }
}
