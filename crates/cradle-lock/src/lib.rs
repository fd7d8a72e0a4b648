//! Advisory file locking for Cradle.
//!
//! These are `fcntl(2)` record locks, compatible with the locks taken out by
//! `bwrap --lock-file` and Flatpak, so a runtime directory can be shared with
//! external tools that use the same convention. Open-file-description locks
//! are preferred because they survive `fork()`; on kernels without OFD
//! support there is a documented fallback to process-associated locks, and
//! callers can ask [`FileLock::is_ofd`] which kind they got when deciding
//! whether to hand the descriptor to a child process or tell the child to
//! re-acquire the lock itself.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock is held by someone else and `wait` was not requested.
    #[error("lock on '{0}' is busy")]
    Busy(PathBuf),
    #[error("cannot lock '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How to acquire a lock. Plain data; construct with struct update syntax
/// from [`LockFlags::default`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LockFlags {
    /// Create the lock file if it does not exist.
    pub create: bool,
    /// Block until the lock can be acquired instead of failing with
    /// [`LockError::Busy`].
    pub wait: bool,
    /// Take a write (exclusive) lock rather than a read (shared) lock.
    pub exclusive: bool,
    /// Skip OFD locks entirely and use process-associated locks.
    pub process_oriented: bool,
    /// Fail rather than fall back if the kernel lacks OFD lock support.
    pub require_ofd: bool,
}

/// A held advisory lock. Released when dropped (closing the descriptor
/// releases both OFD and process-associated `fcntl` locks).
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    is_ofd: bool,
    exclusive: bool,
}

impl FileLock {
    /// Open (or create) `path` and acquire a lock on it.
    pub fn acquire(path: &Path, flags: LockFlags) -> Result<Self, LockError> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if flags.create {
            opts.write(true).create(true);
        } else if flags.exclusive {
            // A write lock needs a writable descriptor.
            opts.write(true);
        }

        let file = opts.open(path).map_err(|source| LockError::Io {
            path: path.to_owned(),
            source,
        })?;

        let is_ofd = lock_fd(&file, path, flags)?;
        debug!(
            path = %path.display(),
            exclusive = flags.exclusive,
            is_ofd,
            "acquired lock"
        );

        Ok(Self {
            file,
            path: path.to_owned(),
            is_ofd,
            exclusive: flags.exclusive,
        })
    }

    /// Whether this is an open-file-description lock. OFD locks survive
    /// `fork()`, so the descriptor can be inherited by a child; a
    /// process-associated lock would be silently lost and the child must
    /// re-acquire it.
    pub fn is_ofd(&self) -> bool {
        self.is_ofd
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give up ownership of the descriptor, keeping the lock held, so it
    /// can be passed across `exec()` to a child process.
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Acquire the lock on an already-open descriptor. Returns whether an OFD
/// lock was obtained.
#[allow(unsafe_code)]
fn lock_fd(file: &File, path: &Path, flags: LockFlags) -> Result<bool, LockError> {
    // Try OFD first unless told not to, then fall back to process-associated.
    let start = i32::from(!flags.process_oriented);

    for ofd in (0..=start).rev() {
        let cmd = match (ofd > 0, flags.wait) {
            (true, true) => libc::F_OFD_SETLKW,
            (true, false) => libc::F_OFD_SETLK,
            (false, true) => libc::F_SETLKW,
            (false, false) => libc::F_SETLK,
        };

        let mut fl: libc::flock = {
            // SAFETY: flock is plain old data; an all-zeroes value is valid.
            let mut fl: libc::flock = unsafe { std::mem::zeroed() };
            fl.l_type = if flags.exclusive {
                libc::F_WRLCK as libc::c_short
            } else {
                libc::F_RDLCK as libc::c_short
            };
            fl.l_whence = libc::SEEK_SET as libc::c_short;
            fl.l_start = 0;
            fl.l_len = 0;
            fl
        };

        loop {
            // SAFETY: fd is owned by `file` and stays open for the duration
            // of the call; `fl` is a valid flock for F_SETLK-family commands.
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut fl) };
            if rc == 0 {
                return Ok(ofd > 0);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Kernel without OFD lock support: retry process-associated
                // unless the caller needs the lock to survive fork().
                Some(libc::EINVAL) if ofd > 0 && !flags.require_ofd => break,
                Some(libc::EACCES | libc::EAGAIN) => {
                    return Err(LockError::Busy(path.to_owned()));
                }
                _ => {
                    return Err(LockError::Io {
                        path: path.to_owned(),
                        source: err,
                    });
                }
            }
        }
    }

    Err(LockError::Io {
        path: path.to_owned(),
        source: io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel does not support open-file-description locks",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(".ref")
    }

    #[test]
    fn create_makes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        assert!(!path.exists());

        let lock = FileLock::acquire(
            &path,
            LockFlags {
                create: true,
                ..LockFlags::default()
            },
        )
        .unwrap();
        assert!(path.exists());
        assert!(!lock.is_exclusive());
    }

    #[test]
    fn missing_file_without_create_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileLock::acquire(&lock_path(&dir), LockFlags::default()).unwrap_err();
        match err {
            LockError::Io { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            LockError::Busy(_) => panic!("expected Io, got Busy"),
        }
    }

    #[test]
    fn two_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let flags = LockFlags {
            create: true,
            ..LockFlags::default()
        };

        let _a = FileLock::acquire(&path, flags).unwrap();
        let _b = FileLock::acquire(&path, flags).unwrap();
    }

    #[test]
    fn exclusive_conflicts_with_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let shared = FileLock::acquire(
            &path,
            LockFlags {
                create: true,
                ..LockFlags::default()
            },
        )
        .unwrap();
        // OFD locks conflict between two descriptors even within one
        // process, so this exercises real contention.
        assert!(shared.is_ofd(), "test requires OFD lock support");

        let err = FileLock::acquire(
            &path,
            LockFlags {
                create: true,
                exclusive: true,
                ..LockFlags::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, LockError::Busy(_)));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let flags = LockFlags {
            create: true,
            exclusive: true,
            ..LockFlags::default()
        };

        {
            let _lock = FileLock::acquire(&path, flags).unwrap();
        }
        let _again = FileLock::acquire(&path, flags).unwrap();
    }

    #[test]
    fn busy_error_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let _held = FileLock::acquire(
            &path,
            LockFlags {
                create: true,
                exclusive: true,
                ..LockFlags::default()
            },
        )
        .unwrap();
        let err = FileLock::acquire(
            &path,
            LockFlags {
                create: true,
                exclusive: true,
                ..LockFlags::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains(".ref"));
    }

    #[test]
    fn into_file_keeps_the_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let flags = LockFlags {
            create: true,
            exclusive: true,
            ..LockFlags::default()
        };

        let held = FileLock::acquire(&path, flags).unwrap().into_file();
        let err = FileLock::acquire(&path, flags).unwrap_err();
        assert!(matches!(err, LockError::Busy(_)));
        drop(held);
    }
}
