//! Artifact namespaces
//!
//! Every session owns one directory under the output root, named by its
//! session id. Every execution gets a fresh run bucket inside it. Listing a
//! run only ever sees that run's files, so charts from earlier runs or other
//! sessions cannot leak into a result.

use crate::error::{AnalystError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// File extensions treated as chart artifacts.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg", "gif"];

pub fn is_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ARTIFACT_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Directory allocated for a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunBucket {
    pub id: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the namespace of one session.
    pub fn for_session(output_root: &Path, session_id: &str) -> Result<Self> {
        if !is_safe_component(session_id) {
            return Err(AnalystError::Config(format!(
                "invalid session id '{}'",
                session_id
            )));
        }
        let root = output_root.join(session_id);
        std::fs::create_dir_all(&root)?;
        let root = std::fs::canonicalize(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove everything in the namespace. Returns the number of entries removed.
    pub fn clear(&self) -> Result<usize> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)?;
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            removed += 1;
        }
        if removed > 0 {
            debug!("Cleared {} entries from {}", removed, self.root.display());
        }
        Ok(removed)
    }

    pub fn allocate_run(&self) -> Result<RunBucket> {
        let id = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(&id);
        std::fs::create_dir_all(&dir)?;
        Ok(RunBucket { id, dir })
    }

    /// Artifacts written by one run, sorted by path.
    pub fn list_run(&self, run: &RunBucket) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        collect_artifacts(&run.dir, &mut found)?;
        found.sort();
        Ok(found)
    }

    /// Every artifact currently in the namespace.
    pub fn list_all(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if self.root.exists() {
            collect_artifacts(&self.root, &mut found)?;
        }
        found.sort();
        Ok(found)
    }
}

fn collect_artifacts(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_artifacts(&path, found)?;
        } else if is_artifact(&path) {
            found.push(path);
        }
    }
    Ok(())
}

fn is_safe_component(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
