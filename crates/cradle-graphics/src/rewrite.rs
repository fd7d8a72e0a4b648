//! Emission of per-container driver manifests and loader environment.
//!
//! Absolute drivers get a cloned manifest whose `library_path` points at
//! the captured container path; Soname and meta-layer drivers get the
//! provider's own JSON copied through unchanged, deduplicated by content
//! because multiarch providers often ship byte-identical manifests for
//! two architectures. Emitted paths accumulate into the loader
//! environment variables handed to the container.

use crate::arch::Architecture;
use crate::classify::{Classification, DriverRecord};
use crate::manifest::DriverKind;
use crate::overrides::OverridesTree;
use crate::GraphicsError;
use cradle_sysroot::Provider;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct ManifestRewriter<'a> {
    overrides: &'a OverridesTree,
    provider: &'a Provider,
    /// Container paths of emitted manifests, in emission order, per kind.
    emitted: HashMap<DriverKind, Vec<PathBuf>>,
    /// Content digests of verbatim copies already written, per kind.
    verbatim_digests: HashMap<DriverKind, HashMap<blake3::Hash, PathBuf>>,
    counters: HashMap<DriverKind, usize>,
}

impl<'a> ManifestRewriter<'a> {
    pub fn new(overrides: &'a OverridesTree, provider: &'a Provider) -> Self {
        Self {
            overrides,
            provider,
            emitted: HashMap::new(),
            verbatim_digests: HashMap::new(),
            counters: HashMap::new(),
        }
    }

    /// Emits the manifest for one record on one architecture, according to
    /// its classification. Records with no manifest, no classification, or
    /// classified Nonexistent are skipped.
    pub fn emit(
        &mut self,
        record: &DriverRecord,
        arch: Architecture,
    ) -> Result<(), GraphicsError> {
        let kind = record.instance().kind();
        if record.instance().manifest().is_none() || kind.manifest_dir_name().is_none() {
            return Ok(());
        }
        // The OpenXR loader supports a single active runtime; first found
        // wins and later candidates are dropped with a diagnostic.
        if kind == DriverKind::OpenXr
            && self.emitted.get(&kind).is_some_and(|v| !v.is_empty())
        {
            warn!(
                manifest = %record.instance().provider_path().display(),
                "multiple OpenXR runtimes found, keeping the first"
            );
            return Ok(());
        }

        match record.classification(arch) {
            Some(Classification::Absolute) => self.emit_rewritten(record, arch),
            Some(Classification::Soname | Classification::MetaLayer) => {
                self.emit_verbatim(record)
            }
            Some(Classification::Nonexistent) | None => Ok(()),
        }
    }

    fn emit_rewritten(
        &mut self,
        record: &DriverRecord,
        arch: Architecture,
    ) -> Result<(), GraphicsError> {
        let kind = record.instance().kind();
        let Some(manifest) = record.instance().manifest() else {
            return Ok(());
        };
        let Some(captured) = record.captured_container_path(arch) else {
            return Ok(());
        };
        let Some(rewritten) =
            manifest.with_library_path(&captured.to_string_lossy())
        else {
            return Ok(());
        };

        let filename = self.next_filename(record, kind, arch);
        self.write_manifest(kind, &filename, &rewritten.to_json_bytes()?)
    }

    fn emit_verbatim(&mut self, record: &DriverRecord) -> Result<(), GraphicsError> {
        let kind = record.instance().kind();
        let source = self
            .provider
            .in_current_ns(record.instance().provider_path());
        let bytes = std::fs::read(&source).map_err(|e| GraphicsError::io(&source, e))?;

        let digest = blake3::hash(&bytes);
        let digests = self.verbatim_digests.entry(kind).or_default();
        if let Some(existing) = digests.get(&digest) {
            debug!(
                manifest = %record.instance().provider_path().display(),
                existing = %existing.display(),
                "identical manifest already emitted"
            );
            return Ok(());
        }

        let filename = match record.instance().provider_path().file_name() {
            Some(name) => {
                let seq = self.next_seq(kind);
                format!("{seq:02}-{}", name.to_string_lossy())
            }
            None => format!("{:02}.json", self.next_seq(kind)),
        };
        let container = self.write_manifest_path(kind, &filename);
        self.verbatim_digests
            .entry(kind)
            .or_default()
            .insert(digest, container);
        self.write_manifest(kind, &filename, &bytes)
    }

    /// Layer identity is name-based, not path-based, so layers use a
    /// fixed `<seq>-<tuple>.json` scheme; everything else keeps its
    /// original basename behind a unique numeric prefix.
    fn next_filename(
        &mut self,
        record: &DriverRecord,
        kind: DriverKind,
        arch: Architecture,
    ) -> String {
        let seq = self.next_seq(kind);
        if kind.is_name_identified() {
            format!("{seq}-{}.json", arch.tuple())
        } else {
            match record.instance().provider_path().file_name() {
                Some(name) => format!("{seq:02}-{}", name.to_string_lossy()),
                None => format!("{seq:02}.json"),
            }
        }
    }

    fn next_seq(&mut self, kind: DriverKind) -> usize {
        let counter = self.counters.entry(kind).or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }

    fn write_manifest_path(&self, kind: DriverKind, filename: &str) -> PathBuf {
        // emit() filters kinds without a manifest directory before this
        // point; fall back to share/ to stay total.
        self.overrides
            .container_manifest_dir(kind)
            .unwrap_or_else(|| self.overrides.container_root().join("share"))
            .join(filename)
    }

    fn write_manifest(
        &mut self,
        kind: DriverKind,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), GraphicsError> {
        let dir = self
            .overrides
            .manifest_dir(kind)
            .unwrap_or_else(|| self.overrides.root().join("share"));
        std::fs::create_dir_all(&dir).map_err(|e| GraphicsError::io(&dir, e))?;
        let path = dir.join(filename);
        std::fs::write(&path, bytes).map_err(|e| GraphicsError::io(&path, e))?;

        let container = self.write_manifest_path(kind, filename);
        debug!(path = %container.display(), "emitted driver manifest");
        self.emitted.entry(kind).or_default().push(container);
        Ok(())
    }

    /// Container paths emitted so far for one kind, in emission order.
    pub fn emitted(&self, kind: DriverKind) -> &[PathBuf] {
        self.emitted.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// The loader environment describing everything emitted. Vulkan
    /// layers are intentionally absent: their manifests live under
    /// `share/vulkan`, which reaches the loader through `XDG_DATA_DIRS`.
    pub fn finish(self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let mut put_list = |kind: DriverKind, var: &str| {
            if let Some(paths) = self.emitted.get(&kind) {
                if !paths.is_empty() {
                    env.insert(var.to_owned(), join_paths(paths));
                }
            }
        };
        put_list(DriverKind::VulkanIcd, "VK_DRIVER_FILES");
        put_list(DriverKind::EglIcd, "__EGL_VENDOR_LIBRARY_FILENAMES");
        put_list(
            DriverKind::EglExternalPlatform,
            "__EGL_EXTERNAL_PLATFORM_CONFIG_FILENAMES",
        );
        if let Some(path) = self
            .emitted
            .get(&DriverKind::OpenXr)
            .and_then(|v| v.first())
        {
            env.insert(
                "XR_RUNTIME_JSON".to_owned(),
                path.to_string_lossy().into_owned(),
            );
        }
        env
    }
}

/// Search-path variable for a module-based driver kind, listing the
/// per-architecture capture directories in container terms. `None` when
/// no architecture captured anything for the kind.
pub fn module_search_path_env(
    kind: DriverKind,
    overrides: &OverridesTree,
    arches: &[Architecture],
) -> Option<(String, String)> {
    let var = match kind {
        DriverKind::Dri => "LIBGL_DRIVERS_PATH",
        DriverKind::VaApi => "LIBVA_DRIVERS_PATH",
        DriverKind::Vdpau => "VDPAU_DRIVER_PATH",
        _ => return None,
    };
    let dirs: Vec<PathBuf> = arches
        .iter()
        .filter(|&&arch| {
            overrides
                .kind_libdir(arch, kind)
                .read_dir()
                .map(|mut it| it.next().is_some())
                .unwrap_or(false)
        })
        .map(|&arch| overrides.container_kind_libdir(arch, kind))
        .collect();
    if dirs.is_empty() {
        return None;
    }
    // The VDPAU loader takes exactly one directory, not a search path.
    if kind == DriverKind::Vdpau && dirs.len() > 1 {
        warn!("VDPAU supports a single driver directory, using the primary architecture's");
    }
    let value = if kind == DriverKind::Vdpau {
        dirs[0].to_string_lossy().into_owned()
    } else {
        join_paths(&dirs)
    };
    Some((var.to_owned(), value))
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
