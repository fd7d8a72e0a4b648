use crate::{RuntimeError, LOCK_FILE};
use cradle_lock::{FileLock, LockFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Candidate names for the file manifest at the runtime source root. The
/// compressed form is preferred.
const MANIFEST_NAMES: &[&str] = &["usr-mtree.txt.gz", "usr-mtree.txt"];

/// How the runtime source directory is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeLayout {
    /// A Flatpak-style runtime whose `files/` tree is a merged `/usr`,
    /// described by a file manifest at the source root.
    ManifestDescribed { manifest_path: PathBuf },
    /// A Flatpak-style runtime with a `files/` tree but no manifest.
    FlatpakFiles,
    /// The source itself is the merged `/usr` or a plain sysroot.
    Plain,
}

/// An opened runtime source: the versioned base OS tree a game runs on.
#[derive(Debug)]
pub struct RuntimeTree {
    source_path: PathBuf,
    files_root: PathBuf,
    layout: RuntimeLayout,
    is_merged_usr: bool,
}

impl RuntimeTree {
    /// Identify the layout of `source_path`.
    ///
    /// Detection precedence: a (possibly gzip-compressed) file manifest at
    /// the source root marks a merged-usr Flatpak-style runtime; otherwise
    /// a `files/` directory marks a Flatpak-style runtime; otherwise the
    /// source itself is the tree.
    pub fn open(source_path: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        let source_path = source_path.into();
        if !source_path.is_dir() {
            return Err(RuntimeError::NotADirectory(source_path));
        }

        for name in MANIFEST_NAMES {
            let manifest_path = source_path.join(name);
            if manifest_path.is_file() {
                debug!(manifest = %manifest_path.display(), "manifest-described runtime");
                return Ok(Self {
                    files_root: source_path.join("files"),
                    source_path,
                    layout: RuntimeLayout::ManifestDescribed { manifest_path },
                    is_merged_usr: true,
                });
            }
        }

        if source_path.join("files").is_dir() {
            return Ok(Self {
                files_root: source_path.join("files"),
                source_path,
                layout: RuntimeLayout::FlatpakFiles,
                is_merged_usr: true,
            });
        }

        // A plain tree is a merged /usr when it has no usr/ of its own.
        let is_merged_usr = !source_path.join("usr").is_dir();
        Ok(Self {
            files_root: source_path.clone(),
            source_path,
            layout: RuntimeLayout::Plain,
            is_merged_usr,
        })
    }

    #[inline]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Root of the actual file tree: either the source itself or
    /// `<source>/files`.
    #[inline]
    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    #[inline]
    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    #[inline]
    pub fn is_merged_usr(&self) -> bool {
        self.is_merged_usr
    }

    /// The directory holding `lib/os-release` and library directories:
    /// the files root for a merged `/usr`, `<files_root>/usr` otherwise.
    pub fn usr_root(&self) -> PathBuf {
        if self.is_merged_usr {
            self.files_root.clone()
        } else {
            self.files_root.join("usr")
        }
    }

    /// Take a shared creation lock on `<files_root>/.ref`.
    ///
    /// Failing because the lock is busy is fatal for the caller: an
    /// exclusive holder means the runtime may be mid-deletion.
    pub fn acquire_source_lock(&self) -> Result<FileLock, RuntimeError> {
        let lock = FileLock::acquire(
            &self.files_root.join(LOCK_FILE),
            LockFlags {
                create: true,
                ..LockFlags::default()
            },
        )?;
        Ok(lock)
    }
}
