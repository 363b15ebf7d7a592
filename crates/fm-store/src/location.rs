use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::error::{Result, StoreError};
use crate::store::Store;

pub const DEFAULT_STORE: &str = "default";
pub const CONFIG_FILE: &str = "fm.toml";

/// `$FM_DATA_DIR`, else `~/.fractal-memory`.
pub fn default_base_dir() -> PathBuf {
    if let Ok(dir) = env::var("FM_DATA_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs_home().join(".fractal-memory")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Reduce a store name to characters safe in a filename.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        DEFAULT_STORE.to_string()
    } else {
        cleaned
    }
}

/// Where a named store and its config live.
///
/// Layout:
/// ```text
/// ~/.fractal-memory/
/// ├── fm.toml
/// └── stores/
///     ├── default.db
///     └── <name>.db
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreLocation {
    base: PathBuf,
    name: String,
}

impl StoreLocation {
    /// `base_dir` overrides the default base directory (for testing).
    pub fn new(name: Option<&str>, base_dir: Option<&Path>) -> Self {
        Self {
            base: base_dir.map(PathBuf::from).unwrap_or_else(default_base_dir),
            name: sanitize_name(name.unwrap_or(DEFAULT_STORE)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn db_path(&self) -> PathBuf {
        self.base.join("stores").join(format!("{}.db", self.name))
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join(CONFIG_FILE)
    }

    /// Open the store, creating directories as needed.
    pub fn open(&self) -> Result<Store> {
        let stores = self.base.join("stores");
        fs::create_dir_all(&stores).map_err(|e| {
            StoreError::InvalidData(format!("failed to create {}: {e}", stores.display()))
        })?;
        let path = self.db_path();
        tracing::debug!(path = %path.display(), "opening store");
        Store::open(&path)
    }
}
