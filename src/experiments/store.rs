use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use fs2::FileExt;
use tempfile::NamedTempFile;
use serde::{Deserialize, Serialize};

use super::config::{Experiment, ExperimentError};

/// The experiments stored for one funnel plus the version they were read at.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoredExperiments {
    pub version: u64,
    pub experiments: Vec<Experiment>,
}

/// Persistence boundary for experiments, addressed by funnel id.
///
/// `save_experiments` is a compare-and-swap: it must fail with
/// [`ExperimentError::Conflict`] when the stored version no longer equals
/// `expected_version`, and return the new version on success.
pub trait ExperimentRepository: Send + Sync {
    /// Empty list at version 0 when nothing is stored for the funnel.
    fn load_experiments(&self, funnel_id: &str) -> Result<StoredExperiments, ExperimentError>;

    /// Replaces the funnel's whole experiment list.
    fn save_experiments(
        &self,
        funnel_id: &str,
        experiments: Vec<Experiment>,
        expected_version: u64,
    ) -> Result<u64, ExperimentError>;
}

impl<R: ExperimentRepository + ?Sized> ExperimentRepository for Arc<R> {
    fn load_experiments(&self, funnel_id: &str) -> Result<StoredExperiments, ExperimentError> {
        (**self).load_experiments(funnel_id)
    }

    fn save_experiments(
        &self,
        funnel_id: &str,
        experiments: Vec<Experiment>,
        expected_version: u64,
    ) -> Result<u64, ExperimentError> {
        (**self).save_experiments(funnel_id, experiments, expected_version)
    }
}

fn version_conflict(funnel_id: &str, expected: u64, actual: u64) -> ExperimentError {
    ExperimentError::Conflict(format!(
        "funnel '{}' expected version {}, found {}",
        funnel_id, expected, actual
    ))
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryExperimentRepository {
    funnels: DashMap<String, StoredExperiments>,
}

impl InMemoryExperimentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExperimentRepository for InMemoryExperimentRepository {
    fn load_experiments(&self, funnel_id: &str) -> Result<StoredExperiments, ExperimentError> {
        Ok(self
            .funnels
            .get(funnel_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    fn save_experiments(
        &self,
        funnel_id: &str,
        experiments: Vec<Experiment>,
        expected_version: u64,
    ) -> Result<u64, ExperimentError> {
        // The entry guard holds the shard lock across compare and swap.
        let mut entry = self.funnels.entry(funnel_id.to_string()).or_default();
        if entry.version != expected_version {
            return Err(version_conflict(funnel_id, expected_version, entry.version));
        }
        entry.version += 1;
        entry.experiments = experiments;
        Ok(entry.version)
    }
}

// ── JSON files ──────────────────────────────────────────────────────

/// One JSON document per funnel under `{data_dir}/.experiments/`.
///
/// Saves hold an exclusive OS lock on `{funnel}.lock` across the version
/// check and the write, so repositories in other threads or processes that
/// share the directory see the same compare-and-swap. Documents are replaced
/// by renaming a uniquely named temp file; readers never observe a partial
/// document and take no lock.
pub struct FileExperimentRepository {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileExperimentRepository {
    pub fn new(data_dir: &Path) -> Result<Self, ExperimentError> {
        let dir = data_dir.join(".experiments");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    /// Funnel ids with at least one stored document.
    pub fn funnel_ids(&self) -> Result<Vec<String>, ExperimentError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, funnel_id: &str) -> Result<PathBuf, ExperimentError> {
        if funnel_id.is_empty()
            || funnel_id.contains(|c: char| c == '/' || c == '\\')
            || funnel_id.contains("..")
            || funnel_id.starts_with('.')
        {
            return Err(ExperimentError::InvalidConfig(format!(
                "funnel id '{}' is not a safe file name",
                funnel_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", funnel_id)))
    }

    fn lock_path_for(&self, funnel_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", funnel_id))
    }

    fn lock_for(&self, funnel_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(funnel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn read(&self, path: &Path) -> Result<StoredExperiments, ExperimentError> {
        if !path.exists() {
            return Ok(StoredExperiments::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn atomic_write(&self, path: &Path, stored: &StoredExperiments) -> Result<(), ExperimentError> {
        let data = serde_json::to_string_pretty(stored)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ExperimentRepository for FileExperimentRepository {
    fn load_experiments(&self, funnel_id: &str) -> Result<StoredExperiments, ExperimentError> {
        let path = self.path_for(funnel_id)?;
        self.read(&path)
    }

    fn save_experiments(
        &self,
        funnel_id: &str,
        experiments: Vec<Experiment>,
        expected_version: u64,
    ) -> Result<u64, ExperimentError> {
        let path = self.path_for(funnel_id)?;
        let lock = self.lock_for(funnel_id);
        let _guard = lock
            .lock()
            .map_err(|_| ExperimentError::Conflict(format!("lock poisoned for '{}'", funnel_id)))?;
        // Released when the handle is dropped, including on early return.
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path_for(funnel_id))?;
        lock_file.lock_exclusive()?;

        let current = self.read(&path)?;
        if current.version != expected_version {
            return Err(version_conflict(funnel_id, expected_version, current.version));
        }
        let stored = StoredExperiments {
            version: current.version + 1,
            experiments,
        };
        self.atomic_write(&path, &stored)?;
        Ok(stored.version)
    }
}
