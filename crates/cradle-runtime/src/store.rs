use crate::copy::{copy_tree, normalize_usrmerge};
use crate::layout::{RuntimeLayout, RuntimeTree};
use crate::mtree::FileManifest;
use crate::os_release::OsRelease;
use crate::{RuntimeError, COPY_PREFIX, KEEP_MARKER, LOCK_FILE};
use cradle_lock::{FileLock, LockFlags};
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A mutable on-disk copy of the runtime, living under the shared variable
/// directory as `tmp-XXXXXX/`.
///
/// The copy holds its own lock on `usr/.ref`, independent of the source
/// tree's lock, so its lifetime is decoupled: garbage collection will only
/// delete it once this lock (and every other) is gone.
#[derive(Debug)]
pub struct MutableCopy {
    root: PathBuf,
    lock: FileLock,
}

impl MutableCopy {
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn usr(&self) -> PathBuf {
        self.root.join("usr")
    }

    #[inline]
    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    /// Opt this copy out of garbage collection permanently.
    pub fn mark_keep(&self) -> Result<(), RuntimeError> {
        let marker = self.root.join(KEEP_MARKER);
        std::fs::write(&marker, b"").map_err(|e| RuntimeError::io(&marker, e))
    }

    /// Give up the copy, keeping the lock alive for hand-off to a child
    /// process.
    pub fn into_parts(self) -> (PathBuf, FileLock) {
        (self.root, self.lock)
    }
}

/// Owns the read-only runtime tree and, once requested, a mutable copy.
#[derive(Debug)]
pub struct RuntimeStore {
    tree: RuntimeTree,
    os_release: OsRelease,
    source_lock: Option<FileLock>,
    mutable_copy: Option<MutableCopy>,
}

impl RuntimeStore {
    /// Open the runtime at `source_path` and take a shared creation lock
    /// on it. A busy lock is fatal: an exclusive holder means the runtime
    /// may be mid-deletion.
    pub fn open(source_path: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        let tree = RuntimeTree::open(source_path)?;
        let source_lock = tree.acquire_source_lock()?;
        let os_release = OsRelease::probe(&tree.usr_root());
        debug!(
            source = %tree.source_path().display(),
            id = os_release.id.as_deref().unwrap_or("unknown"),
            "opened runtime"
        );
        Ok(Self {
            tree,
            os_release,
            source_lock: Some(source_lock),
            mutable_copy: None,
        })
    }

    #[inline]
    pub fn tree(&self) -> &RuntimeTree {
        &self.tree
    }

    #[inline]
    pub fn os_release(&self) -> &OsRelease {
        &self.os_release
    }

    #[inline]
    pub fn mutable_copy(&self) -> Option<&MutableCopy> {
        self.mutable_copy.as_ref()
    }

    /// The root of the tree that classification and capture should edit or
    /// read: the mutable copy if one exists, the pristine files root
    /// otherwise.
    pub fn effective_root(&self) -> PathBuf {
        match &self.mutable_copy {
            Some(copy) => copy.root().to_owned(),
            None => self.tree.files_root().to_owned(),
        }
    }

    /// Materialize a mutable copy of the runtime under `variable_dir`.
    ///
    /// Holds a shared wait lock on the variable directory while creating,
    /// so creation can proceed concurrently with other creations but never
    /// with garbage collection. On success the source lock is dropped in
    /// favor of the copy's own lock.
    /// Idempotent: a second call with a copy already in place does nothing.
    /// The copy is available from [`mutable_copy`](Self::mutable_copy)
    /// afterwards.
    pub fn make_mutable_copy(&mut self, variable_dir: &Path) -> Result<(), RuntimeError> {
        if self.mutable_copy.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(variable_dir)
            .map_err(|e| RuntimeError::io(variable_dir, e))?;
        let _creation_lock = FileLock::acquire(
            &variable_dir.join(LOCK_FILE),
            LockFlags {
                create: true,
                wait: true,
                ..LockFlags::default()
            },
        )?;

        let copy_root = make_copy_dir(variable_dir)?;
        let copy_usr = copy_root.join("usr");

        match self.tree.layout() {
            RuntimeLayout::ManifestDescribed { manifest_path } => {
                let manifest = FileManifest::load(manifest_path)?;
                manifest.apply(self.tree.files_root(), &copy_usr)?;
            }
            RuntimeLayout::FlatpakFiles => {
                copy_tree(self.tree.files_root(), &copy_usr)?;
            }
            RuntimeLayout::Plain => {
                if self.tree.is_merged_usr() {
                    copy_tree(self.tree.files_root(), &copy_usr)?;
                } else {
                    copy_tree(self.tree.files_root(), &copy_root)?;
                }
            }
        }

        // The copy may have inherited the source's lock file as a hard
        // link; break it so the copy's lock state is independent.
        let _ = std::fs::remove_file(copy_usr.join(LOCK_FILE));

        normalize_usrmerge(&copy_root)?;

        let lock = FileLock::acquire(
            &copy_usr.join(LOCK_FILE),
            LockFlags {
                create: true,
                ..LockFlags::default()
            },
        )?;

        info!(copy = %copy_root.display(), "materialized mutable runtime copy");
        self.mutable_copy = Some(MutableCopy {
            root: copy_root,
            lock,
        });
        // The copy's lock now stands in for the source lock.
        self.source_lock = None;

        Ok(())
    }
}

/// Create a locked scratch directory under `variable_dir` for per-launch
/// state (such as an overrides tree) when the runtime itself is used in
/// place. Named `tmp-XXXXXX` and locked at `.ref` like a mutable copy, so
/// garbage collection applies the same rules to it.
pub fn create_scratch_root(variable_dir: &Path) -> Result<MutableCopy, RuntimeError> {
    std::fs::create_dir_all(variable_dir).map_err(|e| RuntimeError::io(variable_dir, e))?;
    let _creation_lock = FileLock::acquire(
        &variable_dir.join(LOCK_FILE),
        LockFlags {
            create: true,
            wait: true,
            ..LockFlags::default()
        },
    )?;

    let root = make_copy_dir(variable_dir)?;
    let lock = FileLock::acquire(
        &root.join(LOCK_FILE),
        LockFlags {
            create: true,
            ..LockFlags::default()
        },
    )?;
    info!(scratch = %root.display(), "created scratch root");
    Ok(MutableCopy { root, lock })
}

/// Create `tmp-XXXXXX` under the variable directory.
#[allow(unsafe_code)]
fn make_copy_dir(variable_dir: &Path) -> Result<PathBuf, RuntimeError> {
    let template = variable_dir.join(format!("{COPY_PREFIX}XXXXXX"));
    let template = CString::new(template.into_os_string().into_vec())
        .map_err(|_| RuntimeError::NotADirectory(variable_dir.to_owned()))?;
    let raw = template.into_raw();
    // SAFETY: `raw` is a valid NUL-terminated template ending in XXXXXX,
    // owned by us for the duration of the call; mkdtemp edits it in place.
    let result = unsafe { libc::mkdtemp(raw) };
    // SAFETY: `raw` came from CString::into_raw and is reclaimed exactly once.
    let template = unsafe { CString::from_raw(raw) };
    if result.is_null() {
        return Err(RuntimeError::io(
            variable_dir,
            std::io::Error::last_os_error(),
        ));
    }
    Ok(PathBuf::from(OsString::from_vec(
        template.as_bytes().to_vec(),
    )))
}
