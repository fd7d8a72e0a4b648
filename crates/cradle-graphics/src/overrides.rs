use crate::arch::Architecture;
use crate::manifest::DriverKind;
use crate::GraphicsError;
use std::path::{Path, PathBuf};

/// The writable tree of captured provider libraries and rewritten
/// manifests, mounted at `/overrides` inside the container.
///
/// Layout:
///
/// ```text
/// overrides/
///   lib/<tuple>/              captured shared-subdir libraries
///   lib/<tuple>/<kind>/       captured per-kind absolute-path drivers
///   lib/<tuple>/aliases/      development-name symlinks
///   share/<kind-dir>/         rewritten JSON manifests
/// ```
#[derive(Debug, Clone)]
pub struct OverridesTree {
    root: PathBuf,
    container_root: PathBuf,
}

impl OverridesTree {
    /// Creates the tree skeleton under `root` in the current namespace.
    /// `container_root` is where the tree will be mounted in the container,
    /// normally `/overrides`; rewritten manifests and environment variables
    /// use container paths.
    pub fn create(
        root: impl Into<PathBuf>,
        container_root: impl Into<PathBuf>,
    ) -> Result<Self, GraphicsError> {
        let tree = Self {
            root: root.into(),
            container_root: container_root.into(),
        };
        for arch in Architecture::ALL {
            let libdir = tree.libdir(arch);
            std::fs::create_dir_all(&libdir)
                .map_err(|e| GraphicsError::io(&libdir, e))?;
            let aliasdir = tree.aliasdir(arch);
            std::fs::create_dir_all(&aliasdir)
                .map_err(|e| GraphicsError::io(&aliasdir, e))?;
        }
        let share = tree.root.join("share");
        std::fs::create_dir_all(&share).map_err(|e| GraphicsError::io(&share, e))?;
        Ok(tree)
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn container_root(&self) -> &Path {
        &self.container_root
    }

    /// Per-architecture library directory, current namespace.
    pub fn libdir(&self, arch: Architecture) -> PathBuf {
        self.root.join("lib").join(arch.tuple())
    }

    /// Per-architecture alias directory, current namespace.
    pub fn aliasdir(&self, arch: Architecture) -> PathBuf {
        self.libdir(arch).join("aliases")
    }

    /// Capture destination for absolute-path drivers of one kind.
    pub fn kind_libdir(&self, arch: Architecture, kind: DriverKind) -> PathBuf {
        self.libdir(arch).join(kind.capture_dir_name())
    }

    /// Directory where rewritten manifests of one kind are written,
    /// current namespace. `None` for kinds without JSON manifests.
    pub fn manifest_dir(&self, kind: DriverKind) -> Option<PathBuf> {
        Some(self.root.join("share").join(kind.manifest_dir_name()?))
    }

    /// Same directory as seen from inside the container.
    pub fn container_manifest_dir(&self, kind: DriverKind) -> Option<PathBuf> {
        Some(
            self.container_root
                .join("share")
                .join(kind.manifest_dir_name()?),
        )
    }

    /// Container path of the per-architecture library directory.
    pub fn container_libdir(&self, arch: Architecture) -> PathBuf {
        self.container_root.join("lib").join(arch.tuple())
    }

    /// Container path of the per-kind capture directory, for rewritten
    /// `library_path` values and search-path environment variables.
    pub fn container_kind_libdir(&self, arch: Architecture, kind: DriverKind) -> PathBuf {
        self.container_libdir(arch).join(kind.capture_dir_name())
    }

    /// Translates a path under this tree in the current namespace to the
    /// corresponding container path. Returns `None` for paths outside the
    /// tree.
    pub fn to_container_path(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(self.container_root.join(rel))
    }
}
