use crate::plan::{is_mutable_path, ConstructionPlan};
use crate::PlanError;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which root(s) a realization applies to when CPU-emulation support is
/// enabled. The emulator resolves symlinks as if chrooted into a secondary
/// "interpreter root", so some paths must exist there too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSelect {
    RealOnly,
    InterpreterOnly,
    Both,
}

impl RootSelect {
    #[inline]
    pub fn wants_real(self) -> bool {
        matches!(self, Self::RealOnly | Self::Both)
    }

    #[inline]
    pub fn wants_interpreter(self) -> bool {
        matches!(self, Self::InterpreterOnly | Self::Both)
    }
}

/// Default classification of a container path by its top-level directory:
/// anything the (possibly emulated) dynamic linker resolves belongs in both
/// roots, transient state only in the real root.
pub fn default_root_select(container_path: &Path) -> RootSelect {
    let relative = container_path
        .strip_prefix("/")
        .unwrap_or(container_path);
    let top = relative
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .unwrap_or_default();
    match top.as_str() {
        "usr" | "bin" | "sbin" | "etc" | "overrides" => RootSelect::Both,
        t if t.starts_with("lib") => RootSelect::Both,
        _ => RootSelect::RealOnly,
    }
}

/// Make a piece of content appear at a container path.
///
/// Selected once at setup start: [`InPlaceRealizer`] when a mutable runtime
/// copy exists, [`PlanRealizer`] otherwise. Call sites never test for a
/// nullable copy.
pub trait PathRealizer {
    /// Make `container_path` a symlink to `target`.
    fn ensure_symlink(
        &mut self,
        target: &Path,
        container_path: &Path,
        roots: RootSelect,
    ) -> Result<(), PlanError>;

    /// Make `container_path` a regular file with the given content.
    fn write_data(
        &mut self,
        bytes: &[u8],
        container_path: &Path,
        roots: RootSelect,
    ) -> Result<(), PlanError>;

    /// Make `container_path` a directory.
    fn ensure_dir(&mut self, container_path: &Path, roots: RootSelect) -> Result<(), PlanError>;
}

fn relative(container_path: &Path) -> Result<&Path, PlanError> {
    container_path
        .strip_prefix("/")
        .map_err(|_| PlanError::NotAbsolute(container_path.to_owned()))
}

/// Realizes paths by editing a mutable runtime copy directly. Can target
/// `/usr`-resident paths (they are real directories in the copy) as well as
/// the mutable area.
#[derive(Debug)]
pub struct InPlaceRealizer {
    copy_root: PathBuf,
    interpreter_root: Option<PathBuf>,
}

impl InPlaceRealizer {
    pub fn new(copy_root: impl Into<PathBuf>) -> Self {
        Self {
            copy_root: copy_root.into(),
            interpreter_root: None,
        }
    }

    pub fn with_interpreter_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.interpreter_root = Some(root.into());
        self
    }

    fn check_writable(container_path: &Path) -> Result<(), PlanError> {
        let rel = relative(container_path)?;
        if rel.starts_with("usr") || is_mutable_path(container_path) {
            Ok(())
        } else {
            Err(PlanError::NotMutable(container_path.to_owned()))
        }
    }

    fn selected_roots(&self, roots: RootSelect) -> Vec<&Path> {
        let mut out = Vec::new();
        if roots.wants_real() {
            out.push(self.copy_root.as_path());
        }
        if roots.wants_interpreter() {
            if let Some(interp) = &self.interpreter_root {
                out.push(interp.as_path());
            }
        }
        out
    }

    /// Remove whatever is at `dest` so it can be replaced. A missing entry
    /// is fine.
    fn clear_entry(dest: &Path) -> Result<(), PlanError> {
        match std::fs::symlink_metadata(dest) {
            Ok(meta) if meta.is_dir() => {
                std::fs::remove_dir_all(dest).map_err(|source| PlanError::Io {
                    path: dest.to_owned(),
                    source,
                })
            }
            Ok(_) => std::fs::remove_file(dest).map_err(|source| PlanError::Io {
                path: dest.to_owned(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PlanError::Io {
                path: dest.to_owned(),
                source,
            }),
        }
    }

    fn prepare_dest(root: &Path, container_path: &Path) -> Result<PathBuf, PlanError> {
        let dest = root.join(relative(container_path)?);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PlanError::Io {
                path: parent.to_owned(),
                source,
            })?;
        }
        Ok(dest)
    }
}

impl PathRealizer for InPlaceRealizer {
    fn ensure_symlink(
        &mut self,
        target: &Path,
        container_path: &Path,
        roots: RootSelect,
    ) -> Result<(), PlanError> {
        Self::check_writable(container_path)?;
        for root in self.selected_roots(roots) {
            let dest = Self::prepare_dest(root, container_path)?;
            Self::clear_entry(&dest)?;
            std::os::unix::fs::symlink(target, &dest).map_err(|source| PlanError::Io {
                path: dest.clone(),
                source,
            })?;
            debug!(dest = %dest.display(), target = %target.display(), "symlinked in place");
        }
        Ok(())
    }

    fn write_data(
        &mut self,
        bytes: &[u8],
        container_path: &Path,
        roots: RootSelect,
    ) -> Result<(), PlanError> {
        Self::check_writable(container_path)?;
        for root in self.selected_roots(roots) {
            let dest = Self::prepare_dest(root, container_path)?;
            Self::clear_entry(&dest)?;
            std::fs::write(&dest, bytes).map_err(|source| PlanError::Io {
                path: dest.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn ensure_dir(&mut self, container_path: &Path, roots: RootSelect) -> Result<(), PlanError> {
        Self::check_writable(container_path)?;
        for root in self.selected_roots(roots) {
            let dest = root.join(relative(container_path)?);
            std::fs::create_dir_all(&dest).map_err(|source| PlanError::Io {
                path: dest.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Realizes paths by appending operations to a [`ConstructionPlan`] for the
/// external launcher.
///
/// The launcher cannot mount over a path that is itself a symlink, which
/// `/usr`-resident destinations typically are; those require the in-place
/// backend and are reported as [`PlanError::NeedsMutableCopy`].
#[derive(Debug)]
pub struct PlanRealizer<'a> {
    plan: &'a mut ConstructionPlan,
    interpreter_prefix: Option<PathBuf>,
}

impl<'a> PlanRealizer<'a> {
    pub fn new(plan: &'a mut ConstructionPlan) -> Self {
        Self {
            plan,
            interpreter_prefix: None,
        }
    }

    /// Container-path prefix under which the interpreter root is mounted,
    /// e.g. `/run/interpreter-host`.
    pub fn with_interpreter_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.interpreter_prefix = Some(prefix.into());
        self
    }

    fn check_plannable(container_path: &Path) -> Result<(), PlanError> {
        let rel = relative(container_path)?;
        if rel.starts_with("usr") || rel.as_os_str().is_empty() {
            return Err(PlanError::NeedsMutableCopy(container_path.to_owned()));
        }
        if !is_mutable_path(container_path) {
            return Err(PlanError::NotMutable(container_path.to_owned()));
        }
        Ok(())
    }

    fn destinations(&self, container_path: &Path, roots: RootSelect) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if roots.wants_real() {
            out.push(container_path.to_owned());
        }
        if roots.wants_interpreter() {
            if let Some(prefix) = &self.interpreter_prefix {
                let rel = container_path
                    .strip_prefix("/")
                    .unwrap_or(container_path);
                out.push(prefix.join(rel));
            }
        }
        out
    }
}

impl PathRealizer for PlanRealizer<'_> {
    fn ensure_symlink(
        &mut self,
        target: &Path,
        container_path: &Path,
        roots: RootSelect,
    ) -> Result<(), PlanError> {
        Self::check_plannable(container_path)?;
        for dest in self.destinations(container_path, roots) {
            self.plan.symlink(target, dest);
        }
        Ok(())
    }

    fn write_data(
        &mut self,
        bytes: &[u8],
        container_path: &Path,
        roots: RootSelect,
    ) -> Result<(), PlanError> {
        Self::check_plannable(container_path)?;
        for dest in self.destinations(container_path, roots) {
            self.plan.bind_data(bytes.to_vec(), dest);
        }
        Ok(())
    }

    fn ensure_dir(&mut self, container_path: &Path, roots: RootSelect) -> Result<(), PlanError> {
        Self::check_plannable(container_path)?;
        for dest in self.destinations(container_path, roots) {
            self.plan.dir(dest);
        }
        Ok(())
    }
}
