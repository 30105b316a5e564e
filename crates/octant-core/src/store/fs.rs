//! Filesystem-backed state store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{BootSummary, MembraneDescriptor, RuntimeRecord, StateStore, StoreError, VertexTable};
use crate::vertex::Chirality;

const MODE_FILE: &str = "chirality";
const VERTICES_FILE: &str = "vertices.json";
const BOOT_FILE: &str = "boot.json";
const MEMBRANES_DIR: &str = "membranes";
const RUNTIME_DIR: &str = "runtime";

/// State store rooted at a directory (normally `/run/octant`).
#[derive(Debug, Clone)]
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    /// A store rooted at `root`. Touches nothing until used.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Opens the store, creating the directory layout if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(root);
        store.initialize()?;
        Ok(store)
    }

    /// The state directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn membrane_path(&self, name: &str) -> PathBuf {
        self.root.join(MEMBRANES_DIR).join(format!("{name}.json"))
    }

    fn runtime_path(&self, name: &str) -> PathBuf {
        self.root.join(RUNTIME_DIR).join(format!("{name}.json"))
    }
}

/// Writes `data` to `target` via temp file, fsync and rename.
fn atomic_write(target: &Path, data: &[u8]) -> Result<(), StoreError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::io(format!("creating temp file in {}", parent.display()), e))?;

    let mut file = temp.as_file();
    file.write_all(data)
        .map_err(|e| StoreError::io(format!("writing temp file for {}", target.display()), e))?;
    file.sync_all()
        .map_err(|e| StoreError::io(format!("syncing temp file for {}", target.display()), e))?;

    temp.persist(target).map_err(|e| {
        StoreError::io(format!("renaming temp file to {}", target.display()), e.error)
    })?;
    Ok(())
}

fn write_json<T: Serialize>(target: &Path, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        what: target.display().to_string(),
        source,
    })?;
    atomic_write(target, &data)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn remove_file(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(format!("removing {}", path.display()), e)),
    }
}

fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(format!("listing {}", dir.display()), e)),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut values = Vec::with_capacity(paths.len());
    for path in paths {
        // A file removed between listing and reading is simply skipped.
        if let Some(value) = read_json(&path)? {
            values.push(value);
        }
    }
    Ok(values)
}

impl StateStore for FsStateStore {
    fn initialize(&self) -> Result<(), StoreError> {
        for dir in [
            self.root.clone(),
            self.root.join(MEMBRANES_DIR),
            self.root.join(RUNTIME_DIR),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    fn mode(&self) -> Result<Chirality, StoreError> {
        let path = self.root.join(MODE_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => text
                .parse()
                .map_err(|_| StoreError::InvalidMode(text.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Chirality::Production),
            Err(e) => Err(StoreError::io(format!("reading {}", path.display()), e)),
        }
    }

    fn set_mode(&self, mode: Chirality) -> Result<(), StoreError> {
        atomic_write(&self.root.join(MODE_FILE), format!("{mode}\n").as_bytes())
    }

    fn vertex_table(&self) -> Result<VertexTable, StoreError> {
        Ok(read_json(&self.root.join(VERTICES_FILE))?.unwrap_or_default())
    }

    fn set_vertex_table(&self, table: &VertexTable) -> Result<(), StoreError> {
        write_json(&self.root.join(VERTICES_FILE), table)
    }

    fn membrane(&self, name: &str) -> Result<Option<MembraneDescriptor>, StoreError> {
        read_json(&self.membrane_path(name))
    }

    fn put_membrane(&self, descriptor: &MembraneDescriptor) -> Result<(), StoreError> {
        write_json(&self.membrane_path(&descriptor.name), descriptor)
    }

    fn remove_membrane(&self, name: &str) -> Result<bool, StoreError> {
        remove_file(&self.membrane_path(name))
    }

    fn membranes(&self) -> Result<Vec<MembraneDescriptor>, StoreError> {
        read_dir_json(&self.root.join(MEMBRANES_DIR))
    }

    fn runtime(&self, name: &str) -> Result<Option<RuntimeRecord>, StoreError> {
        read_json(&self.runtime_path(name))
    }

    fn put_runtime(&self, record: &RuntimeRecord) -> Result<(), StoreError> {
        write_json(&self.runtime_path(&record.name), record)
    }

    fn remove_runtime(&self, name: &str) -> Result<bool, StoreError> {
        remove_file(&self.runtime_path(name))
    }

    fn runtimes(&self) -> Result<Vec<RuntimeRecord>, StoreError> {
        read_dir_json(&self.root.join(RUNTIME_DIR))
    }

    fn boot_summary(&self) -> Result<Option<BootSummary>, StoreError> {
        read_json(&self.root.join(BOOT_FILE))
    }

    fn put_boot_summary(&self, summary: &BootSummary) -> Result<(), StoreError> {
        write_json(&self.root.join(BOOT_FILE), summary)
    }
}
