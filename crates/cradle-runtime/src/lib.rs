//! Runtime tree management for Cradle.
//!
//! This crate owns the immutable base runtime and its optional mutable
//! on-disk copy: layout detection (manifest-described merged `/usr`,
//! Flatpak-style `files/` tree, or plain sysroot), advisory locking on the
//! source, manifest-driven or recursive-copy materialization of mutable
//! copies under a shared variable directory, and garbage collection of
//! copies left behind by finished or crashed invocations.

pub mod copy;
pub mod gc;
pub mod layout;
pub mod mtree;
pub mod os_release;
pub mod store;

pub use gc::{garbage_collect, garbage_collect_if_idle, GcReport};
pub use layout::{RuntimeLayout, RuntimeTree};
pub use mtree::{FileManifest, ManifestEntry, ManifestEntryKind};
pub use os_release::OsRelease;
pub use store::{create_scratch_root, MutableCopy, RuntimeStore};

use std::path::PathBuf;
use thiserror::Error;

/// Name of the lock file inside a runtime tree or mutable copy.
pub const LOCK_FILE: &str = ".ref";
/// Marker file that opts a mutable copy out of garbage collection.
pub const KEEP_MARKER: &str = "keep";
/// Prefix of mutable-copy directories under the variable directory.
pub const COPY_PREFIX: &str = "tmp-";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("runtime source '{0}' is not a directory")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Lock(#[from] cradle_lock::LockError),
    #[error("file manifest '{path}' is malformed at line {line}: {message}")]
    BadManifest {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("garbage collection requires an exclusive lock on '{0}'")]
    GcNeedsExclusiveLock(PathBuf),
    #[error("manifest names '{0}' but the runtime does not ship it")]
    MissingManifestSource(PathBuf),
}

impl RuntimeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
