//! Output path sandbox.
//!
//! Every artifact destination must resolve to a path inside a configured
//! root. Resolution is lexical: the destination usually does not exist
//! yet, so traversal is rejected by inspecting components instead of
//! canonicalizing the candidate.

use std::path::{Component, Path, PathBuf};

use crate::error::CompositionError;

/// Confines output destinations to a single root directory.
#[derive(Debug, Clone)]
pub struct OutputSandbox {
    root: PathBuf,
}

impl OutputSandbox {
    /// Create a sandbox rooted at `root`, creating the directory if it
    /// does not exist. The root is canonicalized so that prefix checks
    /// are not fooled by symlinks in the root itself.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a candidate destination to an absolute path under the root.
    ///
    /// Relative candidates are joined onto the root. Absolute candidates
    /// must already lie inside it. Any `..` component or embedded null
    /// byte is rejected outright.
    pub fn resolve(&self, candidate: &Path) -> Result<PathBuf, CompositionError> {
        let raw = candidate.to_string_lossy();
        if raw.contains('\0') {
            return Err(CompositionError::SandboxViolation(
                "path contains null bytes".to_string(),
            ));
        }

        for component in candidate.components() {
            if matches!(component, Component::ParentDir) {
                return Err(CompositionError::SandboxViolation(format!(
                    "path traversal in destination: {}",
                    candidate.display()
                )));
            }
        }

        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        if !resolved.starts_with(&self.root) {
            return Err(CompositionError::SandboxViolation(format!(
                "destination escapes output root: {}",
                resolved.display()
            )));
        }

        Ok(resolved)
    }
}
