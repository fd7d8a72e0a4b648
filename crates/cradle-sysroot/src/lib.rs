//! Sysroot path resolution for Cradle.
//!
//! A [`Sysroot`] resolves logical (in-container) paths against an on-disk
//! root directory, treating absolute symlink targets as relative to that
//! root rather than to the process's `/`, the way the dynamic linker would
//! see them after a `chroot`. A [`Provider`] pairs a sysroot with the same
//! tree's location in the host namespace and its mount point inside the
//! container being assembled.

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Symlink chain length after which resolution gives up. Matches the
/// kernel's ELOOP limit.
const MAX_SYMLINK_DEPTH: u32 = 40;

#[derive(Debug, Error)]
pub enum SysrootError {
    #[error("'{0}' is not a directory")]
    NotADirectory(PathBuf),
    #[error("too many levels of symbolic links resolving '{0}'")]
    TooManyLinks(PathBuf),
    #[error("cannot resolve '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A directory acting as the root of a filesystem tree.
#[derive(Debug, Clone)]
pub struct Sysroot {
    root: PathBuf,
}

impl Sysroot {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SysrootError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SysrootError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether this sysroot is the process's own root filesystem.
    pub fn is_process_root(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Join a logical path onto the root without following symlinks.
    /// Leading `/` on `logical` is ignored.
    pub fn join(&self, logical: impl AsRef<Path>) -> PathBuf {
        let logical = logical.as_ref();
        self.root
            .join(logical.strip_prefix("/").unwrap_or(logical))
    }

    /// Resolve `logical` against the root, following symlinks as if
    /// chrooted: an absolute symlink target restarts resolution from the
    /// sysroot's own root, never escaping into the host's `/`.
    ///
    /// The returned path is a real on-disk path under [`root`](Self::root).
    /// The final component is allowed not to exist; intermediate
    /// components must.
    pub fn resolve(&self, logical: impl AsRef<Path>) -> Result<PathBuf, SysrootError> {
        let logical = logical.as_ref().to_owned();
        let mut depth = 0u32;
        let mut resolved = PathBuf::new();
        let mut pending: Vec<PathBuf> = vec![logical.clone()];

        while let Some(part) = pending.pop() {
            let mut components = part.components();
            while let Some(comp) = components.next() {
                match comp {
                    Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                    Component::ParentDir => {
                        resolved.pop();
                    }
                    Component::Normal(name) => {
                        let candidate = self.root.join(&resolved).join(name);
                        match std::fs::symlink_metadata(&candidate) {
                            Ok(meta) if meta.file_type().is_symlink() => {
                                depth += 1;
                                if depth > MAX_SYMLINK_DEPTH {
                                    return Err(SysrootError::TooManyLinks(logical));
                                }
                                let target = std::fs::read_link(&candidate).map_err(|source| {
                                    SysrootError::Io {
                                        path: candidate.clone(),
                                        source,
                                    }
                                })?;
                                // Whatever came after the symlink still has
                                // to be walked, after the target itself.
                                let rest: PathBuf = components.as_path().to_owned();
                                if !rest.as_os_str().is_empty() {
                                    pending.push(rest);
                                }
                                if target.is_absolute() {
                                    resolved.clear();
                                }
                                pending.push(target);
                                break;
                            }
                            Ok(_) => resolved.push(name),
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                                // Tolerated only for the trailing component.
                                if components.as_path().as_os_str().is_empty()
                                    && pending.is_empty()
                                {
                                    resolved.push(name);
                                } else {
                                    return Err(SysrootError::Io {
                                        path: candidate,
                                        source: e,
                                    });
                                }
                            }
                            Err(source) => {
                                return Err(SysrootError::Io {
                                    path: candidate,
                                    source,
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(self.root.join(resolved))
    }
}

/// A graphics provider: a tree containing the driver stack to be blended
/// into the container.
///
/// The same tree can be visible at different paths in the current mount
/// namespace (where this process reads it), in the host's namespace (the
/// paths the sandbox launcher binds from), and inside the container (where
/// captured symlinks must point).
#[derive(Debug, Clone)]
pub struct Provider {
    sysroot: Sysroot,
    host_ns_root: PathBuf,
    container_mount_point: PathBuf,
}

impl Provider {
    pub fn new(
        sysroot: Sysroot,
        host_ns_root: impl Into<PathBuf>,
        container_mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sysroot,
            host_ns_root: host_ns_root.into(),
            container_mount_point: container_mount_point.into(),
        }
    }

    #[inline]
    pub fn sysroot(&self) -> &Sysroot {
        &self.sysroot
    }

    #[inline]
    pub fn container_mount_point(&self) -> &Path {
        &self.container_mount_point
    }

    /// Where `logical` lives in the current mount namespace.
    pub fn in_current_ns(&self, logical: impl AsRef<Path>) -> PathBuf {
        self.sysroot.join(logical)
    }

    /// Where `logical` lives in the host's mount namespace.
    pub fn in_host_ns(&self, logical: impl AsRef<Path>) -> PathBuf {
        let logical = logical.as_ref();
        self.host_ns_root
            .join(logical.strip_prefix("/").unwrap_or(logical))
    }

    /// Where `logical` will appear inside the container.
    pub fn in_container(&self, logical: impl AsRef<Path>) -> PathBuf {
        let logical = logical.as_ref();
        self.container_mount_point
            .join(logical.strip_prefix("/").unwrap_or(logical))
    }

    /// True when token expansion (`$ORIGIN` and friends) is possible:
    /// the dynamic linker can only be asked about libraries it can load,
    /// which requires the provider to be the process's own root.
    pub fn is_process_root(&self) -> bool {
        self.sysroot.is_process_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn open_rejects_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            Sysroot::open(&file),
            Err(SysrootError::NotADirectory(_))
        ));
    }

    #[test]
    fn join_strips_leading_slash() {
        let dir = tempfile::tempdir().unwrap();
        let sysroot = Sysroot::open(dir.path()).unwrap();
        assert_eq!(
            sysroot.join("/usr/lib"),
            dir.path().join("usr/lib")
        );
    }

    #[test]
    fn resolve_follows_relative_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        std::fs::write(dir.path().join("usr/lib/libz.so.1.2"), b"").unwrap();
        symlink("libz.so.1.2", dir.path().join("usr/lib/libz.so.1")).unwrap();

        let sysroot = Sysroot::open(dir.path()).unwrap();
        let resolved = sysroot.resolve("usr/lib/libz.so.1").unwrap();
        assert_eq!(resolved, dir.path().join("usr/lib/libz.so.1.2"));
    }

    #[test]
    fn absolute_symlink_stays_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        std::fs::write(dir.path().join("usr/lib/real"), b"").unwrap();
        std::fs::create_dir(dir.path().join("lib-link-parent")).unwrap();
        // Points at /usr/lib/real; must resolve inside the sysroot, not the
        // host's /usr.
        symlink("/usr/lib/real", dir.path().join("lib-link-parent/l")).unwrap();

        let sysroot = Sysroot::open(dir.path()).unwrap();
        let resolved = sysroot.resolve("lib-link-parent/l").unwrap();
        assert_eq!(resolved, dir.path().join("usr/lib/real"));
    }

    #[test]
    fn symlinked_directory_in_the_middle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib64")).unwrap();
        std::fs::write(dir.path().join("usr/lib64/libGL.so.1"), b"").unwrap();
        symlink("usr/lib64", dir.path().join("lib64")).unwrap();

        let sysroot = Sysroot::open(dir.path()).unwrap();
        let resolved = sysroot.resolve("lib64/libGL.so.1").unwrap();
        assert_eq!(resolved, dir.path().join("usr/lib64/libGL.so.1"));
    }

    #[test]
    fn symlink_loop_errors_out() {
        let dir = tempfile::tempdir().unwrap();
        symlink("b", dir.path().join("a")).unwrap();
        symlink("a", dir.path().join("b")).unwrap();

        let sysroot = Sysroot::open(dir.path()).unwrap();
        assert!(matches!(
            sysroot.resolve("a"),
            Err(SysrootError::TooManyLinks(_))
        ));
    }

    #[test]
    fn trailing_component_may_be_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        let sysroot = Sysroot::open(dir.path()).unwrap();
        let resolved = sysroot.resolve("etc/does-not-exist").unwrap();
        assert_eq!(resolved, dir.path().join("etc/does-not-exist"));
    }

    #[test]
    fn missing_intermediate_component_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sysroot = Sysroot::open(dir.path()).unwrap();
        assert!(matches!(
            sysroot.resolve("no-such/dir/file"),
            Err(SysrootError::Io { .. })
        ));
    }

    #[test]
    fn provider_namespace_views() {
        let dir = tempfile::tempdir().unwrap();
        let sysroot = Sysroot::open(dir.path()).unwrap();
        let provider = Provider::new(sysroot, "/run/host", "/run/gfx");

        assert_eq!(
            provider.in_current_ns("/usr/lib/libGL.so.1"),
            dir.path().join("usr/lib/libGL.so.1")
        );
        assert_eq!(
            provider.in_host_ns("usr/lib/libGL.so.1"),
            PathBuf::from("/run/host/usr/lib/libGL.so.1")
        );
        assert_eq!(
            provider.in_container("usr/lib/libGL.so.1"),
            PathBuf::from("/run/gfx/usr/lib/libGL.so.1")
        );
        assert!(!provider.is_process_root());
    }
}
