//! Environment record persistence.
//!
//! One JSON document per environment under a state directory. This is the
//! record `load` resumes from; it is written once per materialization and
//! removed on destroy.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::backend::Environment;

/// Errors from environment record storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed environment record {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed store of environment records.
#[derive(Debug, Clone)]
pub struct EnvStore {
    dir: PathBuf,
}

impl EnvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn save(&self, environment: &Environment) -> Result<(), StoreError> {
        let path = self.record_path(&environment.name);
        let path_display = path.display().to_string();

        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;

        let json =
            serde_json::to_vec_pretty(environment).map_err(|source| StoreError::Malformed {
                path: path_display.clone(),
                source,
            })?;
        fs::write(&path, json).map_err(|source| StoreError::Io {
            path: path_display.clone(),
            source,
        })?;

        debug!(environment = %environment.name, path = %path_display, "Saved environment record");
        Ok(())
    }

    /// Loads the record under `name`, `None` if there is no record.
    /// A record that exists but cannot be parsed is an error, not `None`.
    pub fn load(&self, name: &str) -> Result<Option<Environment>, StoreError> {
        let path = self.record_path(name);
        let display = path.display().to_string();

        let json = match fs::read(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: display,
                    source,
                })
            }
        };

        let environment =
            serde_json::from_slice(&json).map_err(|source| StoreError::Malformed {
                path: display,
                source,
            })?;
        Ok(Some(environment))
    }

    /// Removes the record under `name`. Missing records are fine.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(environment = name, "Removed environment record");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}
