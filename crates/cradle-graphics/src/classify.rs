//! Driver classification and capture.
//!
//! For each driver instance and architecture, decide how the library it
//! names can be made available in the container, then drive the capture
//! helper to populate the overrides tree. The decision is recorded exactly
//! once per architecture; the rewriter and alias resolver read it later.

use crate::arch::Architecture;
use crate::capture::{CaptureHelper, CapturePattern, PatternFlags};
use crate::listers::DriverInstance;
use crate::manifest::DriverKind;
use crate::overrides::OverridesTree;
use crate::GraphicsError;
use cradle_sysroot::Provider;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How a driver's library reference was resolved for one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRef {
    /// A filesystem path inside the provider.
    Absolute(PathBuf),
    /// A bare name for the dynamic linker's search rules.
    Soname(String),
}

/// The final decision for one driver on one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Captured by path; manifest must be rewritten to the container path.
    Absolute,
    /// Captured by SONAME; manifest is usable as-is.
    Soname,
    /// Aggregation-only layer with no library of its own.
    MetaLayer,
    /// The library could not be resolved or captured on this architecture.
    Nonexistent,
}

#[derive(Debug, Clone, Default)]
struct ArchState {
    resolved: Option<ResolvedRef>,
    classification: Option<Classification>,
    captured_container_path: Option<PathBuf>,
}

/// A driver instance plus its per-architecture classification state.
#[derive(Debug, Clone)]
pub struct DriverRecord {
    instance: DriverInstance,
    per_arch: BTreeMap<Architecture, ArchState>,
}

impl DriverRecord {
    pub fn new(instance: DriverInstance) -> Self {
        Self {
            instance,
            per_arch: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn instance(&self) -> &DriverInstance {
        &self.instance
    }

    pub fn classification(&self, arch: Architecture) -> Option<Classification> {
        self.per_arch.get(&arch).and_then(|s| s.classification)
    }

    pub fn resolved(&self, arch: Architecture) -> Option<&ResolvedRef> {
        self.per_arch.get(&arch).and_then(|s| s.resolved.as_ref())
    }

    /// Where the captured library will be visible inside the container.
    /// Only present for [`Classification::Absolute`].
    pub fn captured_container_path(&self, arch: Architecture) -> Option<&Path> {
        self.per_arch
            .get(&arch)
            .and_then(|s| s.captured_container_path.as_deref())
    }

    /// Usable on at least one architecture.
    pub fn is_usable(&self) -> bool {
        self.per_arch.values().any(|s| {
            !matches!(
                s.classification,
                None | Some(Classification::Nonexistent)
            )
        })
    }

    /// Records the decision for one architecture. Setting it twice is a
    /// programming error.
    pub(crate) fn set_classification(
        &mut self,
        arch: Architecture,
        classification: Classification,
    ) -> Result<(), GraphicsError> {
        let state = self.per_arch.entry(arch).or_default();
        if state.classification.is_some() {
            debug_assert!(false, "classification set twice");
            return Err(GraphicsError::ClassificationAlreadySet {
                driver: self.instance.provider_path().display().to_string(),
                tuple: arch.tuple().to_owned(),
            });
        }
        state.classification = Some(classification);
        Ok(())
    }

    pub(crate) fn set_resolved(&mut self, arch: Architecture, resolved: ResolvedRef) {
        self.per_arch.entry(arch).or_default().resolved = Some(resolved);
    }

    pub(crate) fn set_captured(&mut self, arch: Architecture, container_path: PathBuf) {
        self.per_arch.entry(arch).or_default().captured_container_path = Some(container_path);
    }
}

/// Classifies and captures all drivers of one kind for one architecture.
pub struct DriverBatch<'a> {
    kind: DriverKind,
    arch: Architecture,
    provider: &'a Provider,
    overrides: &'a OverridesTree,
    helper: &'a CaptureHelper,
}

impl<'a> DriverBatch<'a> {
    pub fn new(
        kind: DriverKind,
        arch: Architecture,
        provider: &'a Provider,
        overrides: &'a OverridesTree,
        helper: &'a CaptureHelper,
    ) -> Self {
        Self {
            kind,
            arch,
            provider,
            overrides,
            helper,
        }
    }

    /// Resolves, classifies, and captures every record in the batch.
    /// On return, every record has a classification for this architecture.
    pub fn process(&self, records: &mut [DriverRecord]) -> Result<(), GraphicsError> {
        let mut sonames: Vec<usize> = Vec::new();
        let mut absolutes: Vec<usize> = Vec::new();

        for (i, record) in records.iter_mut().enumerate() {
            // A module-based instance found for a different architecture is
            // not part of this batch and gets no state here.
            if let Some(arch) = record.instance.arch() {
                if arch != self.arch {
                    continue;
                }
            }
            match self.resolve(&record.instance) {
                Resolution::Ref(ResolvedRef::Absolute(path)) => {
                    record.set_resolved(self.arch, ResolvedRef::Absolute(path));
                    absolutes.push(i);
                }
                Resolution::Ref(ResolvedRef::Soname(name)) => {
                    record.set_resolved(self.arch, ResolvedRef::Soname(name));
                    sonames.push(i);
                }
                Resolution::MetaLayer => {
                    record.set_classification(self.arch, Classification::MetaLayer)?;
                }
                Resolution::Failed(reason) => {
                    debug!(
                        driver = %record.instance.provider_path().display(),
                        tuple = self.arch.tuple(),
                        reason,
                        "driver not usable"
                    );
                    record.set_classification(self.arch, Classification::Nonexistent)?;
                }
            }
        }

        self.capture_sonames(records, &sonames)?;
        self.capture_absolutes(records, &absolutes)?;
        Ok(())
    }

    fn resolve(&self, instance: &DriverInstance) -> Resolution {
        let Some(reference) = instance.library_ref() else {
            if instance.is_meta_layer() {
                return Resolution::MetaLayer;
            }
            return Resolution::Failed("no library reference".to_owned());
        };

        let reference = if reference.contains('$') {
            if !self.provider.is_process_root() {
                // Token expansion means asking the dynamic linker, which
                // only works against our own root filesystem.
                warn!(
                    driver = %instance.provider_path().display(),
                    reference,
                    "cannot expand dynamic-linker tokens for a foreign provider"
                );
                return Resolution::Failed("unexpandable dynamic-linker tokens".to_owned());
            }
            let manifest_dir = instance
                .provider_path()
                .parent()
                .unwrap_or(Path::new("/"))
                .to_owned();
            expand_tokens(reference, &manifest_dir, self.arch)
        } else {
            reference.to_owned()
        };

        if reference.starts_with('/') {
            Resolution::Ref(ResolvedRef::Absolute(PathBuf::from(reference)))
        } else if reference.contains('/') {
            // Relative to the manifest's own directory.
            let base = instance
                .provider_path()
                .parent()
                .unwrap_or(Path::new("/"));
            Resolution::Ref(ResolvedRef::Absolute(base.join(reference)))
        } else {
            Resolution::Ref(ResolvedRef::Soname(reference))
        }
    }

    /// Sonames fold into one helper invocation against the shared library
    /// directory; the dynamic linker does not care about directory order
    /// for them.
    fn capture_sonames(
        &self,
        records: &mut [DriverRecord],
        indices: &[usize],
    ) -> Result<(), GraphicsError> {
        if indices.is_empty() {
            return Ok(());
        }
        let dest = self.overrides.libdir(self.arch);
        let patterns: Vec<CapturePattern> = indices
            .iter()
            .filter_map(|&i| match records[i].resolved(self.arch) {
                Some(ResolvedRef::Soname(name)) => Some(
                    CapturePattern::soname(name.clone()).with_flags(PatternFlags {
                        if_exists: true,
                        ..PatternFlags::default()
                    }),
                ),
                _ => None,
            })
            .collect();
        self.helper.capture_into(&dest, &patterns)?;

        for &i in indices {
            let Some(ResolvedRef::Soname(name)) = records[i].resolved(self.arch).cloned() else {
                continue;
            };
            // The helper silently declines sonames it cannot find for this
            // architecture; absence after capture means not usable.
            let classification = match std::fs::symlink_metadata(dest.join(&name)) {
                Ok(_) => Classification::Soname,
                Err(_) => Classification::Nonexistent,
            };
            records[i].set_classification(self.arch, classification)?;
        }
        Ok(())
    }

    fn capture_absolutes(
        &self,
        records: &mut [DriverRecord],
        indices: &[usize],
    ) -> Result<(), GraphicsError> {
        if indices.is_empty() {
            return Ok(());
        }

        let shared_dest = self.overrides.kind_libdir(self.arch, self.kind);
        let use_numbered = self.needs_numbered_subdirs(records, indices, &shared_dest);
        // Manifest order is preserved either way; numbered subdirectories
        // keep it visible to loaders that read directories in order.
        let width = if indices.len() <= 1 {
            1
        } else {
            (indices.len() - 1).to_string().len()
        };

        // Group by the identity of the resolved file so hard-linked or
        // symlinked duplicates are captured once.
        let mut leaders: HashMap<(u64, u64), (usize, PathBuf)> = HashMap::new();
        let mut touched_dirs: Vec<PathBuf> = Vec::new();

        for (seq, &i) in indices.iter().enumerate() {
            let Some(ResolvedRef::Absolute(logical)) = records[i].resolved(self.arch).cloned()
            else {
                continue;
            };
            let dest = if use_numbered {
                shared_dest.join(format!("{seq:0width$}"))
            } else {
                shared_dest.clone()
            };
            std::fs::create_dir_all(&dest).map_err(|e| GraphicsError::io(&dest, e))?;
            touched_dirs.push(dest.clone());

            let Some(basename) = logical.file_name().map(Path::new) else {
                records[i].set_classification(self.arch, Classification::Nonexistent)?;
                continue;
            };
            let expected = dest.join(basename);

            let identity = match self.identity_of(&logical) {
                Ok(id) => id,
                Err(reason) => {
                    debug!(
                        driver = %records[i].instance.provider_path().display(),
                        tuple = self.arch.tuple(),
                        reason,
                        "cannot resolve driver library"
                    );
                    records[i].set_classification(self.arch, Classification::Nonexistent)?;
                    continue;
                }
            };

            match leaders.get(&identity) {
                None => {
                    leaders.insert(identity, (i, expected.clone()));
                    let pattern =
                        CapturePattern::path(&logical).with_flags(PatternFlags {
                            even_if_older: true,
                            if_exists: true,
                            ..PatternFlags::default()
                        });
                    self.helper.capture_into(&dest, &[pattern])?;
                    self.finish_absolute(&mut records[i], &expected)?;
                }
                Some((leader, leader_expected)) => {
                    // Same file as an earlier driver: replay the leader's
                    // symlink instead of re-capturing the closure.
                    let (leader, leader_expected) = (*leader, leader_expected.clone());
                    self.replicate_from_leader(records, leader, &leader_expected, i, &expected)?;
                }
            }
        }

        touched_dirs.dedup();
        for dir in touched_dirs {
            sweep_dangling_symlinks(&dir);
        }
        Ok(())
    }

    /// All drivers share one subdirectory unless two of them would collide
    /// on basename, or something other than a capture of the same provider
    /// file already occupies one of the basenames. Re-running over an
    /// unchanged driver set therefore reuses the shared layout.
    fn needs_numbered_subdirs(
        &self,
        records: &[DriverRecord],
        indices: &[usize],
        shared_dest: &Path,
    ) -> bool {
        let mut seen = HashSet::new();
        for &i in indices {
            let Some(ResolvedRef::Absolute(path)) = records[i].resolved(self.arch) else {
                continue;
            };
            let Some(basename) = path.file_name() else {
                continue;
            };
            if !seen.insert(basename.to_owned()) {
                return true;
            }
            match std::fs::read_link(shared_dest.join(basename)) {
                Ok(target) if self.is_same_capture(&target, path) => {}
                Ok(_) => return true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(_) => return true,
            }
        }
        false
    }

    /// Whether an existing captured symlink already points at the provider
    /// file this driver resolves to. Duplicates of the same file replay
    /// their leader's target, so the comparison is by identity, not path.
    fn is_same_capture(&self, existing_target: &Path, logical: &Path) -> bool {
        let Ok(rel) = existing_target.strip_prefix(self.helper.link_target()) else {
            return false;
        };
        match (
            self.identity_of(&Path::new("/").join(rel)),
            self.identity_of(logical),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Device+inode of the file the driver resolves to, in the current
    /// namespace. A provider seen through a bind mount can report device
    /// numbers that differ from the host's, which may under-deduplicate;
    /// that matches the capture helper's own view of identity.
    fn identity_of(&self, logical: &Path) -> Result<(u64, u64), String> {
        let real = self
            .provider
            .sysroot()
            .resolve(logical)
            .map_err(|e| e.to_string())?;
        let meta = std::fs::metadata(&real).map_err(|e| e.to_string())?;
        (meta.is_file())
            .then(|| (meta.dev(), meta.ino()))
            .ok_or_else(|| format!("'{}' is not a regular file", real.display()))
    }

    fn finish_absolute(
        &self,
        record: &mut DriverRecord,
        expected: &Path,
    ) -> Result<(), GraphicsError> {
        match std::fs::symlink_metadata(expected) {
            Ok(meta) => {
                if !meta.file_type().is_symlink() {
                    warn!(
                        path = %expected.display(),
                        "capture helper produced a non-symlink, continuing"
                    );
                }
                if let Some(container) = self.overrides.to_container_path(expected) {
                    record.set_captured(self.arch, container);
                }
                record.set_classification(self.arch, Classification::Absolute)?;
            }
            Err(_) => {
                // Wrong architecture or vanished file; the helper declines
                // silently.
                record.set_classification(self.arch, Classification::Nonexistent)?;
            }
        }
        Ok(())
    }

    fn replicate_from_leader(
        &self,
        records: &mut [DriverRecord],
        leader: usize,
        leader_expected: &Path,
        follower: usize,
        expected: &Path,
    ) -> Result<(), GraphicsError> {
        if records[leader].classification(self.arch) != Some(Classification::Absolute) {
            records[follower].set_classification(self.arch, Classification::Nonexistent)?;
            return Ok(());
        }
        let target = std::fs::read_link(leader_expected)
            .map_err(|e| GraphicsError::io(leader_expected, e))?;
        if expected != leader_expected {
            if std::fs::symlink_metadata(expected).is_ok() {
                std::fs::remove_file(expected).map_err(|e| GraphicsError::io(expected, e))?;
            }
            std::os::unix::fs::symlink(&target, expected)
                .map_err(|e| GraphicsError::io(expected, e))?;
        }
        if let Some(container) = self.overrides.to_container_path(expected) {
            records[follower].set_captured(self.arch, container);
        }
        records[follower].set_classification(self.arch, Classification::Absolute)?;
        info!(
            follower = %records[follower].instance.provider_path().display(),
            leader = %records[leader].instance.provider_path().display(),
            "drivers share one file, captured once"
        );
        Ok(())
    }
}

enum Resolution {
    Ref(ResolvedRef),
    MetaLayer,
    Failed(String),
}

fn expand_tokens(reference: &str, manifest_dir: &Path, arch: Architecture) -> String {
    let lib = format!("lib/{}", arch.tuple());
    let origin = manifest_dir.to_string_lossy();
    reference
        .replace("${ORIGIN}", &origin)
        .replace("$ORIGIN", &origin)
        .replace("${LIB}", &lib)
        .replace("$LIB", &lib)
        .replace("${PLATFORM}", arch.platform_tag())
        .replace("$PLATFORM", arch.platform_tag())
}

/// Deletes development symlinks (relative, same-directory targets) whose
/// target no longer exists, so a deleted library does not leave broken
/// `libfoo.so -> libfoo.so.4` links behind.
fn sweep_dangling_symlinks(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if !meta.file_type().is_symlink() {
            continue;
        }
        let Ok(target) = std::fs::read_link(&path) else {
            continue;
        };
        // Only same-directory relative targets; captured links point out
        // of the tree by absolute path and cannot be checked here.
        if target.is_absolute() || target.components().count() != 1 {
            continue;
        }
        if std::fs::symlink_metadata(dir.join(&target)).is_err() {
            debug!(path = %path.display(), "removing dangling development symlink");
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Removes runtime libraries that a captured provider library shadows.
/// Must run after all capture for `arch` has completed, since it reads the
/// final contents of the overrides library directory.
pub fn prune_shadowed(
    runtime_root: &Path,
    overrides: &OverridesTree,
    arch: Architecture,
) -> Result<Vec<PathBuf>, GraphicsError> {
    let libdir = overrides.libdir(arch);
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(&libdir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GraphicsError::io(&libdir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| GraphicsError::io(&libdir, e))?;
        let meta = entry
            .metadata()
            .map_err(|e| GraphicsError::io(entry.path(), e))?;
        if !meta.is_dir() {
            names.push(entry.file_name());
        }
    }

    let mut removed = Vec::new();
    for rel in arch.lib_dirs() {
        let dir = runtime_root.join(rel);
        for name in &names {
            let shadowed = dir.join(name);
            match std::fs::symlink_metadata(&shadowed) {
                Ok(_) => {
                    std::fs::remove_file(&shadowed)
                        .map_err(|e| GraphicsError::io(&shadowed, e))?;
                    debug!(path = %shadowed.display(), "pruned shadowed runtime library");
                    removed.push(shadowed);
                }
                Err(_) => {}
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listers::list_json_drivers;
    use cradle_sysroot::Sysroot;
    use std::os::unix::fs::{symlink, PermissionsExt};

    struct Fixture {
        _dir: tempfile::TempDir,
        provider: Provider,
        overrides: OverridesTree,
        helper: CaptureHelper,
        invocation_log: PathBuf,
        provider_root: PathBuf,
    }

    /// A stand-in capture tool: creates `dest/<basename> -> <link-target><path>`
    /// for path patterns, `dest/<soname>` links for sonames that exist under
    /// the provider's usr/lib, and logs one line per invocation.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let provider_root = dir.path().join("provider");
        std::fs::create_dir_all(&provider_root).unwrap();
        let invocation_log = dir.path().join("invocations.log");

        let tool = dir.path().join("fake-capture");
        std::fs::write(
            &tool,
            format!(
                r#"#!/bin/sh
echo run >> {log}
dest=; provider=; link=
while [ $# -gt 0 ]; do
  case "$1" in
    --dest) dest="$2"; shift 2;;
    --provider) provider="$2"; shift 2;;
    --link-target) link="$2"; shift 2;;
    *)
      pat="$1"
      pat="${{pat#even-if-older:}}"
      pat="${{pat#if-exists:}}"
      case "$pat" in
        path:*)
          p="${{pat#path:}}"
          ln -sfn "$link$p" "$dest/$(basename "$p")"
          ;;
        soname:*)
          s="${{pat#soname:}}"
          if [ -e "$provider/usr/lib/$s" ]; then
            ln -sfn "$link/usr/lib/$s" "$dest/$s"
          fi
          ;;
      esac
      shift;;
  esac
done
"#,
                log = invocation_log.display()
            ),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&tool).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&tool, perms).unwrap();

        let provider = Provider::new(
            Sysroot::open(&provider_root).unwrap(),
            "/run/host",
            "/run/gfx",
        );
        let overrides =
            OverridesTree::create(dir.path().join("overrides"), "/overrides").unwrap();
        let helper = CaptureHelper::new(&tool, &provider_root, "/run/host");
        Fixture {
            _dir: dir,
            provider,
            overrides,
            helper,
            invocation_log,
            provider_root,
        }
    }

    fn write_manifest(fx: &Fixture, rel: &str, library_path: &str) {
        let path = fx.provider_root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            path,
            format!(r#"{{"ICD": {{"library_path": "{library_path}", "api_version": "1.3.0"}}}}"#),
        )
        .unwrap();
    }

    fn write_library(fx: &Fixture, rel: &str) {
        let path = fx.provider_root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"\x7fELF").unwrap();
    }

    fn icd_records(fx: &Fixture) -> Vec<DriverRecord> {
        list_json_drivers(&fx.provider, DriverKind::VulkanIcd)
            .into_iter()
            .map(DriverRecord::new)
            .collect()
    }

    fn batch<'a>(fx: &'a Fixture) -> DriverBatch<'a> {
        DriverBatch::new(
            DriverKind::VulkanIcd,
            Architecture::X86_64,
            &fx.provider,
            &fx.overrides,
            &fx.helper,
        )
    }

    fn invocation_count(fx: &Fixture) -> usize {
        std::fs::read_to_string(&fx.invocation_log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn absolute_driver_lands_in_shared_subdir() {
        let fx = fixture();
        write_library(&fx, "usr/lib/x86_64-linux-gnu/libvulkan_radeon.so");
        write_manifest(
            &fx,
            "etc/vulkan/icd.d/radeon.json",
            "/usr/lib/x86_64-linux-gnu/libvulkan_radeon.so",
        );

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();

        assert_eq!(
            records[0].classification(Architecture::X86_64),
            Some(Classification::Absolute)
        );
        assert_eq!(
            records[0].captured_container_path(Architecture::X86_64),
            Some(Path::new(
                "/overrides/lib/x86_64-linux-gnu/vulkan/libvulkan_radeon.so"
            ))
        );
        let out = fx
            .overrides
            .kind_libdir(Architecture::X86_64, DriverKind::VulkanIcd)
            .join("libvulkan_radeon.so");
        assert_eq!(
            std::fs::read_link(out).unwrap(),
            Path::new("/run/host/usr/lib/x86_64-linux-gnu/libvulkan_radeon.so")
        );
    }

    #[test]
    fn colliding_basenames_force_numbered_subdirs() {
        let fx = fixture();
        write_library(&fx, "usr/lib/a/libdrv.so");
        write_library(&fx, "usr/lib/b/libdrv.so");
        write_manifest(&fx, "etc/vulkan/icd.d/aa.json", "/usr/lib/a/libdrv.so");
        write_manifest(&fx, "etc/vulkan/icd.d/bb.json", "/usr/lib/b/libdrv.so");

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();

        let base = fx
            .overrides
            .kind_libdir(Architecture::X86_64, DriverKind::VulkanIcd);
        assert!(base.join("0/libdrv.so").is_symlink());
        assert!(base.join("1/libdrv.so").is_symlink());
        assert!(!base.join("libdrv.so").exists());
        for r in &records {
            assert_eq!(
                r.classification(Architecture::X86_64),
                Some(Classification::Absolute)
            );
        }
    }

    /// Paths and symlink targets under a capture directory, sorted.
    fn capture_layout(dir: &Path) -> Vec<(PathBuf, Option<PathBuf>)> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && !path.is_symlink() {
                out.extend(capture_layout(&path));
            } else {
                out.push((path.clone(), std::fs::read_link(&path).ok()));
            }
        }
        out.sort();
        out
    }

    #[test]
    fn recapture_of_the_same_drivers_changes_nothing() {
        let fx = fixture();
        write_library(&fx, "usr/lib/a/libdrv.so");
        std::fs::create_dir_all(fx.provider_root.join("usr/lib/b")).unwrap();
        std::fs::hard_link(
            fx.provider_root.join("usr/lib/a/libdrv.so"),
            fx.provider_root.join("usr/lib/b/libsame.so"),
        )
        .unwrap();
        write_library(&fx, "usr/lib/x86_64-linux-gnu/libvulkan_radeon.so");
        write_manifest(&fx, "etc/vulkan/icd.d/aa.json", "/usr/lib/a/libdrv.so");
        write_manifest(&fx, "etc/vulkan/icd.d/bb.json", "/usr/lib/b/libsame.so");
        write_manifest(
            &fx,
            "etc/vulkan/icd.d/cc.json",
            "/usr/lib/x86_64-linux-gnu/libvulkan_radeon.so",
        );

        let base = fx
            .overrides
            .kind_libdir(Architecture::X86_64, DriverKind::VulkanIcd);

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();
        let first = capture_layout(&base);
        assert!(!first.is_empty());

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();

        assert_eq!(capture_layout(&base), first);
        assert!(
            !base.join("0").exists(),
            "a second run over the same drivers must not switch to numbered subdirs"
        );
        for r in &records {
            assert_eq!(
                r.classification(Architecture::X86_64),
                Some(Classification::Absolute)
            );
        }
    }

    #[test]
    fn hardlinked_duplicates_captured_once() {
        let fx = fixture();
        write_library(&fx, "usr/lib/a/libdrv.so");
        std::fs::create_dir_all(fx.provider_root.join("usr/lib/b")).unwrap();
        std::fs::hard_link(
            fx.provider_root.join("usr/lib/a/libdrv.so"),
            fx.provider_root.join("usr/lib/b/libsame.so"),
        )
        .unwrap();
        write_manifest(&fx, "etc/vulkan/icd.d/aa.json", "/usr/lib/a/libdrv.so");
        write_manifest(&fx, "etc/vulkan/icd.d/bb.json", "/usr/lib/b/libsame.so");

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();

        // One helper run for the leader; the follower is a replayed symlink.
        assert_eq!(invocation_count(&fx), 1);
        let base = fx
            .overrides
            .kind_libdir(Architecture::X86_64, DriverKind::VulkanIcd);
        assert_eq!(
            std::fs::read_link(base.join("libsame.so")).unwrap(),
            std::fs::read_link(base.join("libdrv.so")).unwrap()
        );
        for r in &records {
            assert_eq!(
                r.classification(Architecture::X86_64),
                Some(Classification::Absolute)
            );
        }
    }

    #[test]
    fn soname_driver_classified_by_capture_result() {
        let fx = fixture();
        write_library(&fx, "usr/lib/libvulkan_lvp.so");
        write_manifest(&fx, "etc/vulkan/icd.d/lvp.json", "libvulkan_lvp.so");
        write_manifest(&fx, "etc/vulkan/icd.d/gone.json", "libvulkan_gone.so");

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();

        // gone.json sorts first.
        assert_eq!(
            records[0].classification(Architecture::X86_64),
            Some(Classification::Nonexistent)
        );
        assert_eq!(
            records[1].classification(Architecture::X86_64),
            Some(Classification::Soname)
        );
        assert!(fx
            .overrides
            .libdir(Architecture::X86_64)
            .join("libvulkan_lvp.so")
            .is_symlink());
    }

    #[test]
    fn missing_file_degrades_to_nonexistent() {
        let fx = fixture();
        write_manifest(&fx, "etc/vulkan/icd.d/ghost.json", "/usr/lib/libghost.so");

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();
        assert_eq!(
            records[0].classification(Architecture::X86_64),
            Some(Classification::Nonexistent)
        );
        assert!(!records[0].is_usable());
    }

    #[test]
    fn classification_cannot_be_set_twice() {
        let fx = fixture();
        write_manifest(&fx, "etc/vulkan/icd.d/ghost.json", "/usr/lib/libghost.so");

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();
        let err = records[0]
            .set_classification(Architecture::X86_64, Classification::Soname)
            .unwrap_err();
        assert!(matches!(
            err,
            GraphicsError::ClassificationAlreadySet { .. }
        ));
    }

    #[test]
    fn foreign_provider_tokens_are_not_expanded() {
        let fx = fixture();
        write_manifest(&fx, "etc/vulkan/icd.d/tok.json", "$ORIGIN/../libtok.so");

        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();
        assert_eq!(
            records[0].classification(Architecture::X86_64),
            Some(Classification::Nonexistent)
        );
    }

    #[test]
    fn token_expansion_substitutes_all_tokens() {
        let expanded = expand_tokens(
            "$ORIGIN/../${LIB}/$PLATFORM/libx.so",
            Path::new("/etc/vulkan/icd.d"),
            Architecture::X86_64,
        );
        assert_eq!(
            expanded,
            "/etc/vulkan/icd.d/../lib/x86_64-linux-gnu/x86_64/libx.so"
        );
    }

    #[test]
    fn dangling_development_symlinks_are_swept() {
        let fx = fixture();
        let dir = fx
            .overrides
            .kind_libdir(Architecture::X86_64, DriverKind::VulkanIcd);
        std::fs::create_dir_all(&dir).unwrap();
        symlink("libgone.so.4", dir.join("libgone.so")).unwrap();
        symlink("/run/host/usr/lib/libout.so", dir.join("libout.so")).unwrap();

        write_library(&fx, "usr/lib/x/libdrv.so");
        write_manifest(&fx, "etc/vulkan/icd.d/drv.json", "/usr/lib/x/libdrv.so");
        let mut records = icd_records(&fx);
        batch(&fx).process(&mut records).unwrap();

        assert!(!dir.join("libgone.so").is_symlink());
        // Absolute targets cannot be checked from here and are kept.
        assert!(dir.join("libout.so").is_symlink());
    }

    #[test]
    fn prune_removes_shadowed_runtime_libraries() {
        let fx = fixture();
        let runtime = fx._dir.path().join("runtime-usr");
        let rt_lib = runtime.join("usr/lib/x86_64-linux-gnu");
        std::fs::create_dir_all(&rt_lib).unwrap();
        std::fs::write(rt_lib.join("libGL.so.1"), b"old").unwrap();
        std::fs::write(rt_lib.join("libuntouched.so.1"), b"x").unwrap();

        let ov_lib = fx.overrides.libdir(Architecture::X86_64);
        symlink("/run/host/usr/lib/libGL.so.1", ov_lib.join("libGL.so.1")).unwrap();

        let removed = prune_shadowed(&runtime, &fx.overrides, Architecture::X86_64).unwrap();
        assert_eq!(removed, vec![rt_lib.join("libGL.so.1")]);
        assert!(!rt_lib.join("libGL.so.1").exists());
        assert!(rt_lib.join("libuntouched.so.1").exists());
    }
}
