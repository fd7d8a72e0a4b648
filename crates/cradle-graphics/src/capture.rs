//! Invocation of the per-architecture capture helper.
//!
//! Capturing a library means symlinking it, and the transitive closure of
//! its `DT_NEEDED` dependencies that are newer than the runtime's copies,
//! into an overrides directory. That ELF-level work is delegated to an
//! external per-architecture tool so this process does not need to load
//! foreign-architecture libraries itself.

use crate::GraphicsError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, trace};

/// Per-pattern behavior switches, rendered as prefixes on the pattern
/// argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternFlags {
    /// Capture even when the provider's copy is older than the runtime's.
    /// Used for libraries that must match a driver byte-for-byte.
    pub even_if_older: bool,
    /// A pattern matching nothing is not an error.
    pub if_exists: bool,
    /// Capture the library itself but not its dependency closure.
    pub no_dependencies: bool,
}

/// One thing to capture: a library named by SONAME, by absolute path in
/// the provider, or a glob over SONAMEs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturePattern {
    Soname { name: String, flags: PatternFlags },
    Path { path: PathBuf, flags: PatternFlags },
    SonameGlob { glob: String, flags: PatternFlags },
}

impl CapturePattern {
    pub fn soname(name: impl Into<String>) -> Self {
        Self::Soname {
            name: name.into(),
            flags: PatternFlags::default(),
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path {
            path: path.into(),
            flags: PatternFlags::default(),
        }
    }

    pub fn soname_glob(glob: impl Into<String>) -> Self {
        Self::SonameGlob {
            glob: glob.into(),
            flags: PatternFlags::default(),
        }
    }

    pub fn with_flags(mut self, new_flags: PatternFlags) -> Self {
        match &mut self {
            Self::Soname { flags, .. }
            | Self::Path { flags, .. }
            | Self::SonameGlob { flags, .. } => *flags = new_flags,
        }
        self
    }

    fn flags(&self) -> PatternFlags {
        match self {
            Self::Soname { flags, .. }
            | Self::Path { flags, .. }
            | Self::SonameGlob { flags, .. } => *flags,
        }
    }
}

impl fmt::Display for CapturePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags();
        if flags.even_if_older {
            write!(f, "even-if-older:")?;
        }
        if flags.if_exists {
            write!(f, "if-exists:")?;
        }
        if flags.no_dependencies {
            write!(f, "no-dependencies:")?;
        }
        match self {
            Self::Soname { name, .. } => write!(f, "soname:{name}"),
            Self::Path { path, .. } => write!(f, "path:{}", path.display()),
            Self::SonameGlob { glob, .. } => write!(f, "soname-match:{glob}"),
        }
    }
}

/// Runs one architecture's capture tool against one destination directory.
#[derive(Debug, Clone)]
pub struct CaptureHelper {
    tool: PathBuf,
    provider_root: PathBuf,
    /// Prefix for the symlink targets the helper writes; where the
    /// provider will be visible when the links are dereferenced.
    link_target: PathBuf,
}

impl CaptureHelper {
    pub fn new(
        tool: impl Into<PathBuf>,
        provider_root: impl Into<PathBuf>,
        link_target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool: tool.into(),
            provider_root: provider_root.into(),
            link_target: link_target.into(),
        }
    }

    #[inline]
    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Prefix the helper writes into its symlink targets.
    #[inline]
    pub fn link_target(&self) -> &Path {
        &self.link_target
    }

    /// Captures every pattern into `dest`, which must already exist.
    /// Returns without running anything when `patterns` is empty.
    pub fn capture_into(
        &self,
        dest: &Path,
        patterns: &[CapturePattern],
    ) -> Result<(), GraphicsError> {
        if patterns.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new(&self.tool);
        cmd.arg("--dest").arg(dest);
        cmd.arg("--provider").arg(&self.provider_root);
        cmd.arg("--link-target").arg(&self.link_target);
        for pattern in patterns {
            cmd.arg(pattern.to_string());
        }
        trace!(tool = %self.tool.display(), ?patterns, dest = %dest.display(), "running capture helper");

        let output = cmd.output().map_err(|source| GraphicsError::HelperSpawn {
            tool: self.tool.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(GraphicsError::HelperFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        debug!(dest = %dest.display(), count = patterns.len(), "captured patterns");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_helper(dir: &Path, script_body: &str) -> PathBuf {
        let path = dir.join("fake-capture");
        std::fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn pattern_rendering() {
        assert_eq!(
            CapturePattern::soname("libvulkan_radeon.so").to_string(),
            "soname:libvulkan_radeon.so"
        );
        assert_eq!(
            CapturePattern::path("/usr/lib/dri/iris_dri.so")
                .with_flags(PatternFlags {
                    even_if_older: true,
                    ..PatternFlags::default()
                })
                .to_string(),
            "even-if-older:path:/usr/lib/dri/iris_dri.so"
        );
        assert_eq!(
            CapturePattern::soname_glob("libnvidia-*.so.*")
                .with_flags(PatternFlags {
                    if_exists: true,
                    no_dependencies: true,
                    ..PatternFlags::default()
                })
                .to_string(),
            "if-exists:no-dependencies:soname-match:libnvidia-*.so.*"
        );
    }

    #[test]
    fn arguments_reach_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("argv.log");
        let tool = fake_helper(
            dir.path(),
            &format!("printf '%s\\n' \"$@\" > {}", log.display()),
        );

        let helper = CaptureHelper::new(&tool, "/provider", "/run/host");
        helper
            .capture_into(
                dir.path(),
                &[
                    CapturePattern::soname("libGLX_mesa.so.0"),
                    CapturePattern::path("/opt/drv.so"),
                ],
            )
            .unwrap();

        let logged = std::fs::read_to_string(&log).unwrap();
        let args: Vec<&str> = logged.lines().collect();
        assert_eq!(args[0], "--dest");
        assert_eq!(args[1], dir.path().to_str().unwrap());
        assert_eq!(args[2], "--provider");
        assert_eq!(args[3], "/provider");
        assert_eq!(args[4], "--link-target");
        assert_eq!(args[5], "/run/host");
        assert_eq!(args[6], "soname:libGLX_mesa.so.0");
        assert_eq!(args[7], "path:/opt/drv.so");
    }

    #[test]
    fn nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_helper(dir.path(), "echo 'no such soname' >&2; exit 1");

        let helper = CaptureHelper::new(&tool, "/provider", "/run/host");
        let err = helper
            .capture_into(dir.path(), &[CapturePattern::soname("libnope.so")])
            .unwrap_err();
        match err {
            GraphicsError::HelperFailed { stderr, .. } => {
                assert!(stderr.contains("no such soname"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_tool_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let helper = CaptureHelper::new(dir.path().join("absent"), "/provider", "/run/host");
        let err = helper
            .capture_into(dir.path(), &[CapturePattern::soname("libm.so.6")])
            .unwrap_err();
        assert!(matches!(err, GraphicsError::HelperSpawn { .. }));
    }

    #[test]
    fn empty_pattern_list_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        // Tool does not even exist; it must not be run.
        let helper = CaptureHelper::new(dir.path().join("absent"), "/provider", "/run/host");
        helper.capture_into(dir.path(), &[]).unwrap();
    }
}
