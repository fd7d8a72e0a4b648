use crate::{RuntimeError, COPY_PREFIX, KEEP_MARKER, LOCK_FILE};
use cradle_lock::{FileLock, LockError, LockFlags};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of one garbage-collection pass over a variable directory.
#[derive(Debug, Default)]
pub struct GcReport {
    pub examined: usize,
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
}

/// Delete stale mutable copies under `variable_dir`.
///
/// `gc_lock` must be an exclusive lock on the variable directory's own
/// lock file, which serializes GC against concurrent copy creation (copy
/// creation holds the same lock non-exclusively). For each `tmp-*`
/// subdirectory, a create+exclusive probe on its `usr/.ref` (or `.ref`)
/// proves nobody holds even a shared lock on the copy, making deletion
/// safe. A `keep` marker suppresses deletion unconditionally, and any
/// probe failure other than "not found" keeps the copy: when in doubt, do
/// not delete.
pub fn garbage_collect(
    variable_dir: &Path,
    gc_lock: &FileLock,
) -> Result<GcReport, RuntimeError> {
    if !gc_lock.is_exclusive() {
        return Err(RuntimeError::GcNeedsExclusiveLock(variable_dir.to_owned()));
    }

    let mut report = GcReport::default();
    let reader =
        std::fs::read_dir(variable_dir).map_err(|e| RuntimeError::io(variable_dir, e))?;
    for entry in reader {
        let entry = entry.map_err(|e| RuntimeError::io(variable_dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(COPY_PREFIX) {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        report.examined += 1;

        if path.join(KEEP_MARKER).exists() {
            debug!(copy = %path.display(), "keep marker present, skipping");
            report.kept.push(path);
            continue;
        }

        match probe_copy(&path) {
            Probe::Idle(_lock) => {
                // Holding the probe lock while deleting: nobody else can
                // acquire it now, and the exclusive variable-directory lock
                // keeps new copies from appearing mid-pass.
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        info!(copy = %path.display(), "removed stale mutable copy");
                        report.removed.push(path);
                    }
                    Err(e) => {
                        warn!(copy = %path.display(), error = %e, "failed to remove copy");
                        report.kept.push(path);
                    }
                }
            }
            Probe::InUse => {
                debug!(copy = %path.display(), "still locked, keeping");
                report.kept.push(path);
            }
            Probe::Unsure(e) => {
                warn!(copy = %path.display(), error = %e, "cannot probe copy, keeping");
                report.kept.push(path);
            }
        }
    }
    Ok(report)
}

enum Probe {
    Idle(FileLock),
    InUse,
    Unsure(LockError),
}

fn probe_copy(copy: &Path) -> Probe {
    let flags = LockFlags {
        create: true,
        exclusive: true,
        ..LockFlags::default()
    };
    for candidate in [copy.join("usr").join(LOCK_FILE), copy.join(LOCK_FILE)] {
        match FileLock::acquire(&candidate, flags) {
            Ok(lock) => return Probe::Idle(lock),
            Err(LockError::Busy(_)) => return Probe::InUse,
            Err(LockError::Io { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                // No usr/ directory; fall through to the top-level name.
                continue;
            }
            Err(e) => return Probe::Unsure(e),
        }
    }
    Probe::InUse
}

/// Convenience wrapper: take the exclusive variable-directory lock without
/// waiting and run a pass. Contention is not an error, merely "someone
/// else is using the directory right now": returns `None`.
pub fn garbage_collect_if_idle(variable_dir: &Path) -> Result<Option<GcReport>, RuntimeError> {
    let lock_path = variable_dir.join(LOCK_FILE);
    match FileLock::acquire(
        &lock_path,
        LockFlags {
            create: true,
            exclusive: true,
            ..LockFlags::default()
        },
    ) {
        Ok(lock) => Ok(Some(garbage_collect(variable_dir, &lock)?)),
        Err(LockError::Busy(_)) => {
            debug!(dir = %variable_dir.display(), "variable directory busy, skipping GC");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exclusive_var_lock(dir: &Path) -> FileLock {
        FileLock::acquire(
            &dir.join(LOCK_FILE),
            LockFlags {
                create: true,
                exclusive: true,
                ..LockFlags::default()
            },
        )
        .unwrap()
    }

    fn make_copy(dir: &Path, name: &str) -> PathBuf {
        let copy = dir.join(name);
        std::fs::create_dir_all(copy.join("usr")).unwrap();
        copy
    }

    #[test]
    fn removes_unlocked_copy() {
        let dir = tempfile::tempdir().unwrap();
        let copy = make_copy(dir.path(), "tmp-abc123");

        let lock = exclusive_var_lock(dir.path());
        let report = garbage_collect(dir.path(), &lock).unwrap();
        assert_eq!(report.removed, vec![copy.clone()]);
        assert!(!copy.exists());
    }

    #[test]
    fn keep_marker_suppresses_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let copy = make_copy(dir.path(), "tmp-keepme");
        std::fs::write(copy.join(KEEP_MARKER), b"").unwrap();

        let lock = exclusive_var_lock(dir.path());
        let report = garbage_collect(dir.path(), &lock).unwrap();
        assert!(report.removed.is_empty());
        assert!(copy.exists());
    }

    #[test]
    fn shared_lock_on_copy_prevents_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let copy = make_copy(dir.path(), "tmp-inuse");
        let _user = FileLock::acquire(
            &copy.join("usr").join(LOCK_FILE),
            LockFlags {
                create: true,
                ..LockFlags::default()
            },
        )
        .unwrap();

        let lock = exclusive_var_lock(dir.path());
        let report = garbage_collect(dir.path(), &lock).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, vec![copy.clone()]);
        assert!(copy.exists());
    }

    #[test]
    fn copy_without_usr_is_probed_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let copy = dir.path().join("tmp-flat");
        std::fs::create_dir_all(&copy).unwrap();

        let lock = exclusive_var_lock(dir.path());
        let report = garbage_collect(dir.path(), &lock).unwrap();
        assert_eq!(report.removed, vec![copy]);
    }

    #[test]
    fn non_copy_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("unrelated")).unwrap();
        std::fs::write(dir.path().join("tmp-file-not-dir"), b"").unwrap();

        let lock = exclusive_var_lock(dir.path());
        let report = garbage_collect(dir.path(), &lock).unwrap();
        assert_eq!(report.examined, 0);
        assert!(dir.path().join("unrelated").exists());
    }

    #[test]
    fn requires_exclusive_lock() {
        let dir = tempfile::tempdir().unwrap();
        let shared = FileLock::acquire(
            &dir.path().join(LOCK_FILE),
            LockFlags {
                create: true,
                ..LockFlags::default()
            },
        )
        .unwrap();
        let err = garbage_collect(dir.path(), &shared).unwrap_err();
        assert!(matches!(err, RuntimeError::GcNeedsExclusiveLock(_)));
    }

    #[test]
    fn gc_skips_when_variable_dir_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        make_copy(dir.path(), "tmp-live");
        let _creation = FileLock::acquire(
            &dir.path().join(LOCK_FILE),
            LockFlags {
                create: true,
                ..LockFlags::default()
            },
        )
        .unwrap();

        let outcome = garbage_collect_if_idle(dir.path()).unwrap();
        assert!(outcome.is_none());
        assert!(dir.path().join("tmp-live").exists());
    }

    #[test]
    fn concurrent_gc_deletes_each_copy_once() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            make_copy(dir.path(), &format!("tmp-{i}"));
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let dir = dir.path().to_owned();
            handles.push(std::thread::spawn(move || {
                garbage_collect_if_idle(&dir).unwrap()
            }));
        }

        let mut total_removed = 0;
        for handle in handles {
            if let Some(report) = handle.join().unwrap() {
                total_removed += report.removed.len();
            }
        }
        // The exclusive variable-directory lock serializes the passes;
        // whichever ran saw each copy at most once.
        assert_eq!(total_removed, 4);
        for i in 0..4 {
            assert!(!dir.path().join(format!("tmp-{i}")).exists());
        }
    }
}
