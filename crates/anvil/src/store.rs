//! Artifact store: a path-safe filesystem namespace rooted at the run
//! directory.
//!
//! Every artifact write in the engine goes through this store. Paths are
//! interpreted relative to the run root and must resolve (after symlink
//! expansion) strictly inside it; anything else fails with `PathEscape`.
//! Writes are atomic at file granularity: content goes to a uniquely-named
//! temp file in the destination directory and is renamed into place, so
//! concurrent last-writer-wins artifacts (the blackboard) are never observed
//! torn.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path escapes the run root: {0}")]
    PathEscape(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Path-safe store rooted at a run directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(io_err(root))?;
        let root = root.canonicalize().map_err(io_err(root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative artifact path to an absolute one, enforcing
    /// containment.
    ///
    /// Rejects absolute inputs and `..` components outright, then verifies
    /// that the canonicalized nearest-existing ancestor of the joined path
    /// still lies inside the root. The second check is what catches symlinks
    /// that point outside the run directory.
    pub fn path(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            return Err(StoreError::PathEscape(relative.to_path_buf()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(StoreError::PathEscape(relative.to_path_buf())),
            }
        }

        let joined = self.root.join(relative);
        let resolved = resolve_existing_prefix(&joined).map_err(io_err(&joined))?;
        if !resolved.starts_with(&self.root) {
            return Err(StoreError::PathEscape(relative.to_path_buf()));
        }
        Ok(joined)
    }

    pub fn exists(&self, relative: impl AsRef<Path>) -> Result<bool> {
        Ok(self.path(relative)?.exists())
    }

    pub fn mkdirs(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let abs = self.path(relative)?;
        std::fs::create_dir_all(&abs).map_err(io_err(&abs))?;
        Ok(abs)
    }

    /// Atomically write bytes: temp file in the target directory, then
    /// rename.
    pub fn write(&self, relative: impl AsRef<Path>, bytes: &[u8]) -> Result<PathBuf> {
        let abs = self.path(&relative)?;
        let dir = abs.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let file_name = abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));
        std::fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &abs).map_err(io_err(&abs))?;
        Ok(abs)
    }

    pub fn write_str(&self, relative: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
        self.write(relative, content.as_bytes())
    }

    /// Write a value as pretty-printed JSON with a trailing newline.
    pub fn write_json<T: serde::Serialize>(
        &self,
        relative: impl AsRef<Path>,
        value: &T,
    ) -> Result<PathBuf> {
        let abs = self.path(&relative)?;
        let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            path: abs,
            source,
        })?;
        bytes.push(b'\n');
        self.write(relative, &bytes)
    }

    pub fn read(&self, relative: impl AsRef<Path>) -> Result<Vec<u8>> {
        let abs = self.path(relative)?;
        std::fs::read(&abs).map_err(io_err(&abs))
    }

    pub fn read_to_string(&self, relative: impl AsRef<Path>) -> Result<String> {
        let abs = self.path(relative)?;
        std::fs::read_to_string(&abs).map_err(io_err(&abs))
    }

    pub fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        relative: impl AsRef<Path>,
    ) -> Result<T> {
        let abs = self.path(&relative)?;
        let bytes = self.read(relative)?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path: abs, source })
    }
}

/// Canonicalize the nearest existing ancestor of `path` and re-join the
/// remaining components.
fn resolve_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name() else {
            break;
        };
        tail.push(name.to_os_string());
        if !existing.pop() {
            break;
        }
    }
    let mut resolved = existing.canonicalize()?;
    for component in tail.iter().rev() {
        resolved.push(component);
    }
    Ok(resolved)
}
