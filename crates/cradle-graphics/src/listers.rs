//! Enumeration of driver instances in a provider tree.
//!
//! JSON-based kinds (Vulkan, EGL, OpenXR) are found by scanning the
//! loader's manifest search directories; module-based kinds (DRI, VDPAU,
//! VA-API) by filename convention inside the provider's library
//! directories. Listing is read-only and never fatal: an unreadable
//! directory is logged and skipped, an unparsable manifest is carried
//! along with its parse error so classification can report it.

use crate::arch::Architecture;
use crate::manifest::{DriverKind, DriverManifest};
use cradle_sysroot::Provider;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One driver found in the provider, before classification.
#[derive(Debug, Clone)]
pub struct DriverInstance {
    kind: DriverKind,
    /// Set for module-based kinds, which are found per-architecture.
    /// JSON manifests are architecture-neutral and resolved per-arch later.
    arch: Option<Architecture>,
    /// Logical path within the provider where the instance was found.
    provider_path: PathBuf,
    manifest: Option<DriverManifest>,
    /// What classification resolves: the manifest's `library_path`, or for
    /// module-based kinds the logical path of the module itself.
    library_ref: Option<String>,
}

impl DriverInstance {
    #[inline]
    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    #[inline]
    pub fn arch(&self) -> Option<Architecture> {
        self.arch
    }

    #[inline]
    pub fn provider_path(&self) -> &Path {
        &self.provider_path
    }

    pub fn manifest(&self) -> Option<&DriverManifest> {
        self.manifest.as_ref()
    }

    pub fn library_ref(&self) -> Option<&str> {
        self.library_ref.as_deref()
    }

    /// Parse failure carried from manifest loading, if any.
    pub fn parse_error(&self) -> Option<&str> {
        self.manifest.as_ref().and_then(DriverManifest::parse_error)
    }

    /// A meta-layer aggregates other layers and names no library of its
    /// own; it is copied through without capture.
    pub fn is_meta_layer(&self) -> bool {
        self.kind.is_name_identified()
            && self.parse_error().is_none()
            && self.library_ref.is_none()
    }
}

/// Lists JSON-manifest drivers of `kind`, walking the loader's search
/// directories in precedence order. Entries are sorted per directory so a
/// run is deterministic.
pub fn list_json_drivers(provider: &Provider, kind: DriverKind) -> Vec<DriverInstance> {
    let mut found = Vec::new();
    for search_dir in kind.manifest_search_dirs() {
        let dir = provider.in_current_ns(search_dir);
        for name in sorted_entries(&dir) {
            if !name.to_string_lossy().ends_with(".json") {
                continue;
            }
            let logical = Path::new("/").join(search_dir).join(&name);
            let manifest = DriverManifest::load(kind, &dir.join(&name));
            if let Some(err) = manifest.parse_error() {
                warn!(path = %logical.display(), error = err, "ignoring unparsable manifest");
            }
            let library_ref = manifest.library_path().map(str::to_owned);
            found.push(DriverInstance {
                kind,
                arch: None,
                provider_path: logical,
                manifest: Some(manifest),
                library_ref,
            });
        }
    }
    debug!(?kind, count = found.len(), "listed JSON drivers");
    found
}

/// Lists module-based drivers of `kind` for one architecture by scanning
/// the conventional module subdirectory of each library directory.
pub fn list_module_drivers(
    provider: &Provider,
    arch: Architecture,
    kind: DriverKind,
) -> Vec<DriverInstance> {
    let (subdir, matches): (&str, fn(&str) -> bool) = match kind {
        DriverKind::Dri => ("dri", |n| n.ends_with("_dri.so")),
        DriverKind::VaApi => ("dri", |n| n.ends_with("_drv_video.so")),
        DriverKind::Vdpau => ("vdpau", |n| {
            n.starts_with("libvdpau_") && n.contains(".so")
        }),
        _ => {
            debug!(?kind, "not a module-based driver kind");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    let mut seen_names = std::collections::HashSet::new();
    for lib_dir in arch.lib_dirs() {
        let logical_dir = Path::new("/").join(&lib_dir).join(subdir);
        let dir = provider.in_current_ns(&logical_dir);
        for name in sorted_entries(&dir) {
            let name_str = name.to_string_lossy().into_owned();
            if !matches(&name_str) {
                continue;
            }
            // The same module earlier in the search path shadows later
            // copies, matching loader behavior.
            if !seen_names.insert(name_str) {
                continue;
            }
            let logical = logical_dir.join(&name);
            found.push(DriverInstance {
                kind,
                arch: Some(arch),
                library_ref: Some(logical.to_string_lossy().into_owned()),
                provider_path: logical,
                manifest: None,
            });
        }
    }
    debug!(?kind, tuple = arch.tuple(), count = found.len(), "listed module drivers");
    found
}

fn sorted_entries(dir: &Path) -> Vec<std::ffi::OsString> {
    let mut names = Vec::new();
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(e) => names.push(e.file_name()),
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "error reading directory entry");
                    }
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot list directory");
        }
    }
    names.sort();
    names
}
