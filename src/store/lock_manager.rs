use crate::error::{CatalystError, ErrorCode};
use crate::playbook::types::ResourceSet;
use crate::shared::fs_atomic::create_exclusive;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const DEFAULT_REAP_AFTER_SECONDS: u64 = 24 * 60 * 60;

/// One lock file per holding run. Conflicts are exact-name intersections
/// over the declared paths and branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLock {
    pub run_id: String,
    pub actor: String,
    pub acquired_at: String,
    pub resources: ResourceSet,
    #[serde(default, rename = "ttlHint", skip_serializing_if = "Option::is_none")]
    pub ttl_hint_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
    reap_after_seconds: u64,
}

impl LockManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reap_after_seconds: DEFAULT_REAP_AFTER_SECONDS,
        }
    }

    pub fn with_reap_after_seconds(mut self, reap_after_seconds: u64) -> Self {
        self.reap_after_seconds = reap_after_seconds;
        self
    }

    pub fn lock_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{run_id}.json"))
    }

    /// Reaps stale locks, rejects on any resource intersection with a live
    /// holder, then claims the requested resources with a create-exclusive
    /// lock file.
    pub fn acquire(
        &self,
        run_id: &str,
        resources: &ResourceSet,
        actor: &str,
        ttl_hint_seconds: Option<u64>,
    ) -> Result<(), CatalystError> {
        if resources.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        for (path, lock) in self.enumerate()? {
            let Some(lock) = lock else {
                // Unparseable lock files cannot name a holder; treat as junk.
                let _ = fs::remove_file(&path);
                continue;
            };
            if self.is_stale(&lock, now) || lock.run_id == run_id {
                let _ = fs::remove_file(&path);
                continue;
            }
            if let Some(resource) = first_conflict(resources, &lock.resources) {
                return Err(CatalystError::new(
                    ErrorCode::ResourceLocked,
                    format!(
                        "resource `{resource}` is held by run `{}` (actor `{}`)",
                        lock.run_id, lock.actor
                    ),
                )
                .with_meta("heldBy", lock.run_id.clone())
                .with_meta("actor", lock.actor.clone())
                .with_guidance("wait for the holding run to finish, or release its lock"));
            }
        }

        let lock = RunLock {
            run_id: run_id.to_string(),
            actor: actor.to_string(),
            acquired_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            resources: resources.clone(),
            ttl_hint_seconds,
        };
        let body = serde_json::to_vec_pretty(&lock).map_err(|err| {
            CatalystError::new(
                ErrorCode::ResourceLocked,
                format!("could not serialize lock for run `{run_id}`"),
            )
            .caused_by_foreign(err)
        })?;
        create_exclusive(&self.lock_path(run_id), &body).map_err(|err| {
            CatalystError::new(
                ErrorCode::ResourceLocked,
                format!("could not create lock file for run `{run_id}`"),
            )
            .caused_by_foreign(err)
        })
    }

    pub fn release(&self, run_id: &str) -> Result<(), CatalystError> {
        match fs::remove_file(self.lock_path(run_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CatalystError::execution(format!(
                "could not release lock for run `{run_id}`"
            ))
            .caused_by_foreign(err)),
        }
    }

    pub fn holder(&self, run_id: &str) -> Option<RunLock> {
        let raw = fs::read_to_string(self.lock_path(run_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn enumerate(&self) -> Result<Vec<(PathBuf, Option<RunLock>)>, CatalystError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CatalystError::new(
                    ErrorCode::ResourceLocked,
                    format!("could not enumerate lock directory {}", self.root.display()),
                )
                .caused_by_foreign(err))
            }
        };

        let mut locks = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if !is_lock_file(&path) {
                continue;
            }
            let lock = fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<RunLock>(&raw).ok());
            locks.push((path, lock));
        }
        Ok(locks)
    }

    fn is_stale(&self, lock: &RunLock, now: DateTime<Utc>) -> bool {
        let Ok(acquired_at) = DateTime::parse_from_rfc3339(&lock.acquired_at) else {
            return true;
        };
        let age = now.signed_duration_since(acquired_at.with_timezone(&Utc));
        let age_seconds = age.num_seconds().max(0) as u64;
        if age_seconds > self.reap_after_seconds {
            return true;
        }
        lock.ttl_hint_seconds
            .is_some_and(|ttl| age_seconds > ttl)
    }
}

fn is_lock_file(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

fn first_conflict<'a>(requested: &'a ResourceSet, held: &ResourceSet) -> Option<&'a str> {
    for path in &requested.paths {
        if held.paths.iter().any(|other| other == path) {
            return Some(path);
        }
    }
    for branch in &requested.branches {
        if held.branches.iter().any(|other| other == branch) {
            return Some(branch);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paths(paths: &[&str]) -> ResourceSet {
        ResourceSet {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            branches: Vec::new(),
        }
    }

    #[test]
    fn overlapping_paths_conflict_until_release() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path());

        locks
            .acquire("run-a", &paths(&["src/api"]), "alice", None)
            .expect("first acquire");
        let err = locks
            .acquire("run-b", &paths(&["src/api", "src/web"]), "bob", None)
            .expect_err("conflict");
        assert_eq!(err.code, ErrorCode::ResourceLocked);
        assert!(err.message.contains("run-a"));
        assert!(err.message.contains("alice"));

        locks.release("run-a").expect("release");
        locks
            .acquire("run-b", &paths(&["src/api"]), "bob", None)
            .expect("acquire after release");
    }

    #[test]
    fn exact_name_equality_does_not_cover_subpaths() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path());
        locks
            .acquire("run-a", &paths(&["src/api"]), "alice", None)
            .expect("acquire");
        locks
            .acquire("run-b", &paths(&["src/api/sub"]), "bob", None)
            .expect("sibling path is free");
    }

    #[test]
    fn branch_overlap_is_a_conflict() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path());
        let branch = ResourceSet {
            paths: Vec::new(),
            branches: vec!["main".to_string()],
        };
        locks.acquire("run-a", &branch, "alice", None).expect("acquire");
        let err = locks
            .acquire("run-b", &branch, "bob", None)
            .expect_err("conflict");
        assert_eq!(err.code, ErrorCode::ResourceLocked);
    }

    #[test]
    fn stale_locks_are_reaped_before_the_conflict_check() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path()).with_reap_after_seconds(60);

        let old = RunLock {
            run_id: "run-old".to_string(),
            actor: "alice".to_string(),
            acquired_at: "2020-01-01T00:00:00.000Z".to_string(),
            resources: paths(&["src/api"]),
            ttl_hint_seconds: None,
        };
        fs::create_dir_all(dir.path()).expect("root");
        fs::write(
            locks.lock_path("run-old"),
            serde_json::to_vec_pretty(&old).expect("serialize"),
        )
        .expect("seed stale lock");

        locks
            .acquire("run-new", &paths(&["src/api"]), "bob", None)
            .expect("stale holder reaped");
        assert!(locks.holder("run-old").is_none());
        assert!(locks.holder("run-new").is_some());
    }

    #[test]
    fn elapsed_ttl_hint_makes_a_lock_stale() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path());

        let recent = Utc::now() - chrono::Duration::seconds(30);
        let lock = RunLock {
            run_id: "run-short".to_string(),
            actor: "alice".to_string(),
            acquired_at: recent.to_rfc3339_opts(SecondsFormat::Millis, true),
            resources: paths(&["src/api"]),
            ttl_hint_seconds: Some(5),
        };
        fs::create_dir_all(dir.path()).expect("root");
        fs::write(
            locks.lock_path("run-short"),
            serde_json::to_vec_pretty(&lock).expect("serialize"),
        )
        .expect("seed lock");

        locks
            .acquire("run-new", &paths(&["src/api"]), "bob", None)
            .expect("ttl elapsed");
    }

    #[test]
    fn release_is_a_no_op_for_missing_locks() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path());
        locks.release("never-held").expect("no-op");
    }

    #[test]
    fn empty_resource_sets_acquire_nothing() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(dir.path());
        locks
            .acquire("run-a", &ResourceSet::default(), "alice", None)
            .expect("empty set");
        assert!(locks.holder("run-a").is_none());
    }
}
