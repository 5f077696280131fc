//! Plugins switched off by the user or by the resource monitor
//!
//! The set lives in `<plugins_dir>/disabled.json` so a disable survives a
//! host restart. Plugins listed there load as `Disabled` without being
//! activated; only an explicit enable takes them back out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const DISABLED_FILE_NAME: &str = "disabled.json";

#[derive(Debug, Error)]
pub enum DisabledError {
    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid disabled plugin list: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct DisabledFile {
    version: u32,
    plugins: BTreeSet<String>,
}

/// File-backed set of disabled plugin ids
#[derive(Debug)]
pub struct DisabledPlugins {
    path: PathBuf,
    ids: Mutex<BTreeSet<String>>,
}

impl DisabledPlugins {
    /// Open the list at `path`; a missing file is an empty list
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DisabledError> {
        let path = path.as_ref().to_path_buf();
        let ids = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<DisabledFile>(&content)?.plugins,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(source) => return Err(DisabledError::Io { path, source }),
        };
        Ok(Self {
            path,
            ids: Mutex::new(ids),
        })
    }

    /// Open `<plugins_dir>/disabled.json`
    ///
    /// An unreadable list is logged and replaced by an empty one; the next
    /// disable rewrites it.
    pub fn in_dir(plugins_dir: &Path) -> Self {
        let path = plugins_dir.join(DISABLED_FILE_NAME);
        Self::open(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable disabled plugin list");
            Self {
                path,
                ids: Mutex::new(BTreeSet::new()),
            }
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).contains(plugin_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    /// Add `plugin_id` and write the file; returns whether it was new
    pub fn insert(&self, plugin_id: &str) -> Result<bool, DisabledError> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(plugin_id.to_string()) {
            return Ok(false);
        }
        if let Err(e) = self.save(&ids) {
            ids.remove(plugin_id);
            return Err(e);
        }
        Ok(true)
    }

    /// Drop `plugin_id` and write the file; returns whether it was listed
    pub fn remove(&self, plugin_id: &str) -> Result<bool, DisabledError> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.remove(plugin_id) {
            return Ok(false);
        }
        if let Err(e) = self.save(&ids) {
            ids.insert(plugin_id.to_string());
            return Err(e);
        }
        Ok(true)
    }

    fn save(&self, ids: &BTreeSet<String>) -> Result<(), DisabledError> {
        let io = |source| DisabledError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let file = DisabledFile {
            version: 1,
            plugins: ids.clone(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?).map_err(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let disabled = DisabledPlugins::in_dir(dir.path());
        assert!(!disabled.contains("demo"));

        assert!(disabled.insert("demo").unwrap());
        assert!(!disabled.insert("demo").unwrap());
        assert!(disabled.insert("other").unwrap());

        let reopened = DisabledPlugins::open(dir.path().join(DISABLED_FILE_NAME)).unwrap();
        assert_eq!(reopened.ids(), vec!["demo", "other"]);

        assert!(reopened.remove("demo").unwrap());
        assert!(!reopened.remove("demo").unwrap());
        assert_eq!(DisabledPlugins::in_dir(dir.path()).ids(), vec!["other"]);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DISABLED_FILE_NAME), "{ nope").unwrap();

        assert!(matches!(
            DisabledPlugins::open(dir.path().join(DISABLED_FILE_NAME)),
            Err(DisabledError::Parse(_))
        ));
        let recovered = DisabledPlugins::in_dir(dir.path());
        assert!(recovered.ids().is_empty());
        recovered.insert("demo").unwrap();
        assert!(DisabledPlugins::open(recovered.path()).unwrap().contains("demo"));
    }
}
