//! Co-location of auxiliary driver data directories.
//!
//! Drivers read configuration from `share/` directories next to their
//! install prefix (Mesa's `drirc.d`, glvnd's egl vendor data). Given a
//! resolved library path, walk upward past the library-directory layers
//! to the notional prefix and look for `<prefix>/share/<name>`, falling
//! back to `/usr/share/<name>`. Everything found is mounted at its own
//! path, and one discovery additionally covers the canonical
//! `/usr/share/<name>` location for drivers that hard-code it.

use cradle_sysroot::Provider;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One directory to make visible in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMount {
    /// Logical path within the provider.
    pub source: PathBuf,
    /// Where it appears in the container.
    pub container_path: PathBuf,
}

pub struct DataCoLocator<'a> {
    provider: &'a Provider,
    discovered: BTreeMap<String, BTreeSet<PathBuf>>,
}

impl<'a> DataCoLocator<'a> {
    pub fn new(provider: &'a Provider) -> Self {
        Self {
            provider,
            discovered: BTreeMap::new(),
        }
    }

    /// Looks for a `share/<name>` directory belonging to the library at
    /// `resolved_library` (a logical provider path). `prefer_usr_share`
    /// checks the canonical location first, for driver stacks known to
    /// hard-code it regardless of their install prefix.
    pub fn locate(&mut self, resolved_library: &Path, name: &str, prefer_usr_share: bool) {
        let prefix = install_prefix(resolved_library);
        let prefixed = prefix.join("share").join(name);
        let canonical = Path::new("/usr/share").join(name);
        let candidates = if prefer_usr_share {
            [canonical.clone(), prefixed]
        } else {
            [prefixed, canonical]
        };

        for candidate in candidates {
            if self.provider.in_current_ns(&candidate).is_dir() {
                debug!(
                    library = %resolved_library.display(),
                    dir = %candidate.display(),
                    "found driver data directory"
                );
                self.discovered
                    .entry(name.to_owned())
                    .or_default()
                    .insert(candidate);
                return;
            }
        }
        debug!(
            library = %resolved_library.display(),
            name,
            "no data directory found"
        );
    }

    /// The mounts realizing every discovery, deterministically ordered.
    /// When no discovery already covers `/usr/share/<name>`, the first
    /// discovered directory is mounted there as well.
    pub fn mounts(&self) -> Vec<DataMount> {
        let mut mounts = Vec::new();
        for (name, dirs) in &self.discovered {
            let canonical = Path::new("/usr/share").join(name);
            for dir in dirs {
                mounts.push(DataMount {
                    source: dir.clone(),
                    container_path: dir.clone(),
                });
            }
            if !dirs.contains(&canonical) {
                if let Some(first) = dirs.iter().next() {
                    mounts.push(DataMount {
                        source: first.clone(),
                        container_path: canonical,
                    });
                }
            }
        }
        mounts
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
    }
}

/// Strips the library-directory layers off a library path: the multiarch
/// tuple directory, `lib64`, `lib32`, and `lib` itself.
fn install_prefix(library: &Path) -> PathBuf {
    let mut dir = library.parent().unwrap_or(Path::new("/"));
    while is_libdir_component(dir.file_name()) {
        dir = dir.parent().unwrap_or(Path::new("/"));
    }
    dir.to_owned()
}

fn is_libdir_component(name: Option<&OsStr>) -> bool {
    let Some(name) = name.and_then(OsStr::to_str) else {
        return false;
    };
    matches!(name, "lib" | "lib64" | "lib32") || name.contains("-linux-")
}
