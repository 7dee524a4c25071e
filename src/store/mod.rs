//! Durable, directory-structured artifact storage.
//!
//! The store is the system of record for a project. It has one subarea per
//! stage output plus a decisions subarea:
//!
//! ```text
//! state/
//! ├── inputs/            # intake artifacts, plus <run-id>/ snapshots
//! ├── designs/<run-id>/
//! ├── implementations/<run-id>/
//! ├── tests/<run-id>/
//! └── decisions/
//! ```
//!
//! Every write goes through a temp file in the destination directory that is
//! synced and then renamed into place, so readers never observe a partial
//! artifact.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::stage::Stage;

/// A top-level area of the state directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subarea {
    Inputs,
    Designs,
    Implementations,
    Tests,
    Decisions,
}

impl Subarea {
    pub const ALL: [Subarea; 5] = [
        Subarea::Inputs,
        Subarea::Designs,
        Subarea::Implementations,
        Subarea::Tests,
        Subarea::Decisions,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Subarea::Inputs => "inputs",
            Subarea::Designs => "designs",
            Subarea::Implementations => "implementations",
            Subarea::Tests => "tests",
            Subarea::Decisions => "decisions",
        }
    }
}

impl fmt::Display for Subarea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Address of one artifact in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub subarea: Subarea,
    pub key: String,
}

impl ArtifactRef {
    pub fn new(subarea: Subarea, key: impl Into<String>) -> Self {
        Self {
            subarea,
            key: key.into(),
        }
    }

    /// An artifact under the run's own directory: `<run-id>/<name>`.
    pub fn run_scoped(subarea: Subarea, run_id: Uuid, name: &str) -> Self {
        Self::new(subarea, format!("{}/{}", run_id, name))
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subarea, self.key)
    }
}

/// How a decisions-subarea write treats an existing artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail without touching the existing artifact
    CreateNew,
    /// Atomically replace the existing artifact
    Replace,
}

/// Read/write contract over the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the subarea directories.
    pub fn init(&self) -> Result<(), StoreError> {
        for subarea in Subarea::ALL {
            let dir = self.root.join(subarea.dir_name());
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Resolve an artifact to its path, rejecting keys that escape the subarea.
    pub fn path_of(&self, subarea: Subarea, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(subarea.dir_name()).join(key))
    }

    pub fn exists(&self, subarea: Subarea, key: &str) -> bool {
        self.path_of(subarea, key)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    pub fn read(&self, subarea: Subarea, key: &str) -> Result<String, StoreError> {
        let path = self.path_of(subarea, key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                subarea,
                key: key.to_string(),
            }),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Read an artifact if present.
    pub fn read_optional(&self, subarea: Subarea, key: &str) -> Result<Option<String>, StoreError> {
        match self.read(subarea, key) {
            Ok(contents) => Ok(Some(contents)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a stage output. Only the owning stage may write to a subarea,
    /// and within the shared `tests` subarea only to its own document.
    pub fn write(
        &self,
        stage: Stage,
        subarea: Subarea,
        key: &str,
        contents: &str,
    ) -> Result<ArtifactRef, StoreError> {
        if !stage_owns(stage, subarea, key) {
            return Err(StoreError::NotOwner { stage, subarea });
        }
        let path = self.path_of(subarea, key)?;
        atomic_write(&path, contents.as_bytes())?;
        debug!(%stage, artifact = %format!("{}/{}", subarea, key), "Wrote artifact");
        Ok(ArtifactRef::new(subarea, key))
    }

    /// Write into the decisions subarea. Returns `false` when `CreateNew`
    /// found an existing artifact.
    pub fn write_decision(
        &self,
        key: &str,
        contents: &str,
        mode: WriteMode,
    ) -> Result<bool, StoreError> {
        let path = self.path_of(Subarea::Decisions, key)?;
        match mode {
            WriteMode::CreateNew => atomic_create(&path, contents.as_bytes()),
            WriteMode::Replace => atomic_write(&path, contents.as_bytes()).map(|_| true),
        }
    }

    /// SHA-256 hex digest of one artifact.
    pub fn hash(&self, subarea: Subarea, key: &str) -> Result<String, StoreError> {
        let contents = self.read(subarea, key)?;
        Ok(content_hash(contents.as_bytes()))
    }

    /// Combined digest over several artifacts, order-sensitive.
    pub fn hash_artifacts(&self, artifacts: &[ArtifactRef]) -> Result<String, StoreError> {
        let mut hasher = Sha256::new();
        for artifact in artifacts {
            let digest = self.hash(artifact.subarea, &artifact.key)?;
            hasher.update(artifact.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// File names directly inside `subarea/<dir>` (or the subarea root), sorted.
    pub fn list(&self, subarea: Subarea, dir: Option<&str>) -> Result<Vec<String>, StoreError> {
        let base = match dir {
            Some(d) => self.path_of(subarea, d)?,
            None => self.root.join(subarea.dir_name()),
        };
        let entries = match fs::read_dir(&base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&base, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&base, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".tmp_") {
                continue;
            }
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn stage_owns(stage: Stage, subarea: Subarea, key: &str) -> bool {
    if stage.subarea() != subarea {
        return false;
    }
    match subarea {
        Subarea::Tests => {
            let file = key.rsplit('/').next().unwrap_or(key);
            stage.output_name() == Some(file)
        }
        _ => true,
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.split('/').any(|segment| segment.is_empty()) {
        return Err(invalid("empty path segments are not allowed"));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            Component::ParentDir => return Err(invalid("parent components are not allowed")),
            _ => return Err(invalid("key must be a relative path")),
        }
    }
    Ok(())
}

/// SHA-256 hex digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_temp(path: &Path, content: &[u8]) -> Result<PathBuf, StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    let temp_path = parent.join(format!(".tmp_{}", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path).map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::io(&temp_path, e))?;
    Ok(temp_path)
}

/// Replace `path` atomically: temp file in the same directory, fsync, rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let temp_path = write_temp(path, content)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Create `path` atomically only if it does not exist yet.
///
/// Returns `Ok(false)` if the artifact already exists; the existing content
/// is left untouched.
pub fn atomic_create(path: &Path, content: &[u8]) -> Result<bool, StoreError> {
    let temp_path = write_temp(path, content)?;
    let linked = fs::hard_link(&temp_path, path);
    let _ = fs::remove_file(&temp_path);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Write a serializable record with `atomic_write`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(StoreError::Encode)?;
    atomic_write(path, json.as_bytes())
}

/// Read a JSON record, `Ok(None)` if the file does not exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        })
}
