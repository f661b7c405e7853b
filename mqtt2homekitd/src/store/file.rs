use std::path::{Path, PathBuf};
use crate::error::BridgeError;

/// The state file. Every save overwrites the whole file; last writer wins.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Contents of the file, or `None` on first start
    pub fn load(&self) -> Result<Option<Vec<u8>>, BridgeError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BridgeError::Persistence(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Write to a sibling temp file, then rename over the state file
    pub fn save(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let failed = |e: std::io::Error| {
            BridgeError::Persistence(format!("Failed to write {}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(failed)?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, bytes).map_err(failed)?;
        std::fs::rename(&tmp, &self.path).map_err(failed)?;
        Ok(())
    }
}
