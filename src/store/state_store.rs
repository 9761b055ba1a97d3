use crate::engine::context::PlaybookState;
use crate::error::{CatalystError, ErrorCode};
use crate::shared::fs_atomic::write_atomic;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File-backed persistence for run state. Live snapshots sit directly under
/// the root; completed and abandoned runs move to a dated archive tree.
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

    pub fn live_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("run-{run_id}.json"))
    }

    pub fn archive_path(&self, run_id: &str, archived_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join("history")
            .join(archived_at.format("%Y").to_string())
            .join(archived_at.format("%m").to_string())
            .join(archived_at.format("%d").to_string())
            .join(format!("run-{run_id}.json"))
    }

    pub fn save(&self, state: &PlaybookState) -> Result<(), CatalystError> {
        let path = self.live_path(&state.run_id);
        let body = serde_json::to_vec_pretty(state).map_err(|err| {
            CatalystError::new(
                ErrorCode::StateSaveFailed,
                format!("could not serialize state for run `{}`", state.run_id),
            )
            .caused_by_foreign(err)
        })?;
        write_atomic(&path, &body).map_err(|err| {
            CatalystError::new(
                ErrorCode::StateSaveFailed,
                format!("could not write state at {}", path.display()),
            )
            .caused_by_foreign(err)
        })
    }

    pub fn load(&self, run_id: &str) -> Result<PlaybookState, CatalystError> {
        let path = self.live_path(run_id);
        let raw = fs::read_to_string(&path).map_err(|err| {
            CatalystError::new(
                ErrorCode::StateLoadFailed,
                format!("no live state for run `{run_id}` at {}", path.display()),
            )
            .caused_by_foreign(err)
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            CatalystError::new(
                ErrorCode::StateCorrupted,
                format!("state for run `{run_id}` is not parseable"),
            )
            .caused_by_foreign(err)
            .with_guidance("the live state file is damaged; abandon the run or restore the file")
        })
    }

    pub fn has_live(&self, run_id: &str) -> bool {
        self.live_path(run_id).is_file()
    }

    /// Moves the live state file into today's archive directory.
    pub fn archive(&self, run_id: &str) -> Result<PathBuf, CatalystError> {
        let live = self.live_path(run_id);
        let target = self.archive_path(run_id, Utc::now());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                CatalystError::new(
                    ErrorCode::StateArchiveFailed,
                    format!("could not create archive directory {}", parent.display()),
                )
                .caused_by_foreign(err)
            })?;
        }
        fs::rename(&live, &target).map_err(|err| {
            CatalystError::new(
                ErrorCode::StateArchiveFailed,
                format!(
                    "could not archive run `{run_id}` from {} to {}",
                    live.display(),
                    target.display()
                ),
            )
            .caused_by_foreign(err)
        })?;
        Ok(target)
    }

    /// Live runs whose state file mtime precedes `now - older_than_days`.
    /// Enumeration is tolerant: entries that vanish mid-scan are skipped.
    pub fn list_stale(&self, older_than_days: u64) -> Result<Vec<String>, CatalystError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CatalystError::new(
                    ErrorCode::StateLoadFailed,
                    format!("could not enumerate state root {}", self.root.display()),
                )
                .caused_by_foreign(err))
            }
        };

        let cutoff = std::time::SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(older_than_days * 86_400));
        let Some(cutoff) = cutoff else {
            return Ok(Vec::new());
        };

        let mut stale = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Some(run_id) = run_id_from_path(&path) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if modified < cutoff {
                stale.push(run_id);
            }
        }
        stale.sort();
        Ok(stale)
    }

    pub fn list_live(&self) -> Result<Vec<String>, CatalystError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CatalystError::new(
                    ErrorCode::StateLoadFailed,
                    format!("could not enumerate state root {}", self.root.display()),
                )
                .caused_by_foreign(err))
            }
        };
        let mut runs = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            if let Some(run_id) = run_id_from_path(&entry.path()) {
                runs.push(run_id);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

fn run_id_from_path(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".json")?;
    let run_id = stem.strip_prefix("run-")?;
    if run_id.is_empty() {
        return None;
    }
    Some(run_id.to_string())
}
