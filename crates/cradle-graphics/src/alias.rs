//! SONAME alias reconciliation.
//!
//! Distributions disagree about which filename in a library family is the
//! real file and which is the alias (`libbz2.so.1.0` vs `libbz2.so.1`).
//! The runtime ships an ABI manifest naming each family; this module
//! creates symlinks in the overrides alias directory so that every name a
//! binary might link against resolves, preferring the provider's naming
//! whenever the provider supplied the library.

use crate::arch::Architecture;
use crate::capture::{CapturePattern, PatternFlags};
use crate::overrides::OverridesTree;
use crate::GraphicsError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A library whose ABI must match another library captured from the
/// provider, so presence in the runtime is not good enough.
pub struct RelatedSonames {
    pub primary: &'static str,
    pub related: &'static [&'static str],
}

/// Families captured together whenever their primary library came from
/// the provider, even when the provider's copies are older than the
/// runtime's.
pub const RELATED_SONAMES: &[RelatedSonames] = &[
    // glibc dlopens its NSS plugins; mixing runtime plugins with a
    // provider libc crashes.
    RelatedSonames {
        primary: "libc.so.6",
        related: &[
            "libnss_compat.so.2",
            "libnss_db.so.2",
            "libnss_dns.so.2",
            "libnss_files.so.2",
        ],
    },
    RelatedSonames {
        primary: "libxkbcommon.so.0",
        related: &["libxkbcommon-x11.so.0"],
    },
];

/// Capture patterns for the libraries that must accompany `primary` when
/// it was taken from the provider. Empty when `primary` has no known
/// companions.
pub fn related_capture_patterns(primary: &str) -> Vec<CapturePattern> {
    RELATED_SONAMES
        .iter()
        .filter(|r| r.primary == primary)
        .flat_map(|r| r.related.iter())
        .map(|soname| {
            CapturePattern::soname(*soname).with_flags(PatternFlags {
                even_if_older: true,
                if_exists: true,
                ..PatternFlags::default()
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLibrary {
    /// Just a SONAME, no aliases.
    Plain(String),
    /// `{"libbz2.so.1.0": {"aliases": ["libbz2.so.1"]}}`
    WithDetails(BTreeMap<String, RawDetails>),
}

#[derive(Debug, Deserialize)]
struct RawDetails {
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    shared_libraries: Vec<RawLibrary>,
}

/// One entry of the ABI manifest: a canonical SONAME and the other names
/// the same library is known by elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryFamily {
    pub soname: String,
    pub aliases: Vec<String>,
}

/// The runtime's ABI manifest, listing the library families the runtime
/// promises to games.
#[derive(Debug, Clone)]
pub struct AbiManifest {
    families: Vec<LibraryFamily>,
}

impl AbiManifest {
    pub fn load(path: &Path) -> Result<Self, GraphicsError> {
        let bytes = std::fs::read(path).map_err(|e| GraphicsError::io(path, e))?;
        let raw: RawManifest =
            serde_json::from_slice(&bytes).map_err(|source| GraphicsError::Json {
                path: path.to_owned(),
                source,
            })?;
        let mut families = Vec::new();
        for lib in raw.shared_libraries {
            match lib {
                RawLibrary::Plain(soname) => families.push(LibraryFamily {
                    soname,
                    aliases: Vec::new(),
                }),
                RawLibrary::WithDetails(map) => {
                    for (soname, details) in map {
                        families.push(LibraryFamily {
                            soname,
                            aliases: details.aliases,
                        });
                    }
                }
            }
        }
        Ok(Self { families })
    }

    pub fn from_families(families: Vec<LibraryFamily>) -> Self {
        Self { families }
    }

    pub fn families(&self) -> &[LibraryFamily] {
        &self.families
    }
}

/// Resolves alias families for one architecture against the overrides
/// tree and the runtime.
pub struct AliasResolver<'a> {
    arch: Architecture,
    overrides: &'a OverridesTree,
    /// Root of the (possibly mutable-copy) runtime tree.
    runtime_root: &'a Path,
}

impl<'a> AliasResolver<'a> {
    pub fn new(arch: Architecture, overrides: &'a OverridesTree, runtime_root: &'a Path) -> Self {
        Self {
            arch,
            overrides,
            runtime_root,
        }
    }

    /// Processes every family in the manifest. A family that neither the
    /// provider nor the runtime can satisfy is fatal on the primary
    /// architecture and skipped with a diagnostic on secondary ones.
    pub fn resolve_all(&self, manifest: &AbiManifest) -> Result<(), GraphicsError> {
        for family in manifest.families() {
            self.resolve_family(family)?;
        }
        Ok(())
    }

    fn resolve_family(&self, family: &LibraryFamily) -> Result<(), GraphicsError> {
        let target = match self.pick_target(family) {
            Some(target) => target,
            None if self.arch.is_primary() => {
                return Err(GraphicsError::MissingRuntimeLibrary {
                    soname: family.soname.clone(),
                    tuple: self.arch.tuple().to_owned(),
                });
            }
            None => {
                debug!(
                    soname = family.soname,
                    tuple = self.arch.tuple(),
                    "library family unsupported on secondary architecture"
                );
                return Ok(());
            }
        };

        let aliasdir = self.overrides.aliasdir(self.arch);
        std::fs::create_dir_all(&aliasdir).map_err(|e| GraphicsError::io(&aliasdir, e))?;

        // The canonical name only needs a link when it differs from what
        // the target already provides.
        let target_basename = target.file_name().and_then(|n| n.to_str());
        if target_basename != Some(family.soname.as_str()) {
            replace_symlink(&target, &aliasdir.join(&family.soname))?;
        }
        // Alias links are unconditional; recreating one that matches is
        // harmless.
        for alias in &family.aliases {
            replace_symlink(&target, &aliasdir.join(alias))?;
        }
        Ok(())
    }

    /// The container path every name in the family should point at.
    fn pick_target(&self, family: &LibraryFamily) -> Option<PathBuf> {
        // Provider naming wins: whichever family member actually has a
        // captured file is the real one.
        let libdir = self.overrides.libdir(self.arch);
        for name in std::iter::once(&family.soname).chain(family.aliases.iter()) {
            if is_present(&libdir.join(name)) {
                return Some(self.overrides.container_libdir(self.arch).join(name));
            }
        }

        // Otherwise the runtime's interoperable library paths.
        let tuple = self.arch.tuple();
        for prefix in [format!("usr/lib/{tuple}"), format!("lib/{tuple}")] {
            let on_disk = self.runtime_root.join(&prefix).join(&family.soname);
            if is_present(&on_disk) {
                return Some(Path::new("/").join(prefix).join(&family.soname));
            }
        }
        None
    }
}

fn is_present(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

fn replace_symlink(target: &Path, link: &Path) -> Result<(), GraphicsError> {
    if std::fs::symlink_metadata(link).is_ok() {
        std::fs::remove_file(link).map_err(|e| GraphicsError::io(link, e))?;
    }
    match std::os::unix::fs::symlink(target, link) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(link = %link.display(), error = %e, "cannot create alias symlink");
            Err(GraphicsError::io(link, e))
        }
    }
}
