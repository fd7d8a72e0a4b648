use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// One operation for the external sandbox launcher. The launcher applies
/// operations strictly in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanOp {
    /// Bind-mount `host_path` at `container_path`.
    Bind {
        host_path: PathBuf,
        container_path: PathBuf,
        read_only: bool,
    },
    /// Create a file at `container_path` with the given content.
    BindData {
        bytes: Vec<u8>,
        container_path: PathBuf,
    },
    /// Create a symlink at `container_path` pointing to `target`.
    Symlink {
        target: PathBuf,
        container_path: PathBuf,
    },
    /// Create a directory (and parents) at `container_path`.
    Dir { container_path: PathBuf },
    /// Mount a tmpfs at `container_path`.
    Tmpfs { container_path: PathBuf },
}

/// Ordered instructions for the sandbox launcher, built up during container
/// setup.
///
/// The plan is extended while setup runs and then turned into a
/// [`LaunchInvocation`] exactly once by [`finish`](Self::finish), which
/// takes the plan by value: extending a finished plan is unrepresentable.
#[derive(Debug, Default)]
pub struct ConstructionPlan {
    ops: Vec<PlanOp>,
    env: BTreeMap<String, String>,
}

impl ConstructionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PlanOp) {
        self.ops.push(op);
    }

    pub fn bind(&mut self, host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) {
        self.ops.push(PlanOp::Bind {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        });
    }

    pub fn ro_bind(&mut self, host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) {
        self.ops.push(PlanOp::Bind {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        });
    }

    pub fn bind_data(&mut self, bytes: Vec<u8>, container_path: impl Into<PathBuf>) {
        self.ops.push(PlanOp::BindData {
            bytes,
            container_path: container_path.into(),
        });
    }

    pub fn symlink(&mut self, target: impl Into<PathBuf>, container_path: impl Into<PathBuf>) {
        self.ops.push(PlanOp::Symlink {
            target: target.into(),
            container_path: container_path.into(),
        });
    }

    pub fn dir(&mut self, container_path: impl Into<PathBuf>) {
        self.ops.push(PlanOp::Dir {
            container_path: container_path.into(),
        });
    }

    pub fn tmpfs(&mut self, container_path: impl Into<PathBuf>) {
        self.ops.push(PlanOp::Tmpfs {
            container_path: container_path.into(),
        });
    }

    /// Set an environment variable for the launched command. Later
    /// assignments win.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Append `dir` to a `PATH`-style search-path variable.
    pub fn append_search_path(&mut self, key: &str, dir: &str) {
        match self.env.get_mut(key) {
            Some(existing) if !existing.is_empty() => {
                existing.push(':');
                existing.push_str(dir);
            }
            _ => {
                self.env.insert(key.to_owned(), dir.to_owned());
            }
        }
    }

    pub fn ops(&self) -> &[PlanOp] {
        &self.ops
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Seal the plan. Consumes `self`, so the plan cannot grow afterwards.
    pub fn finish(self) -> LaunchInvocation {
        LaunchInvocation {
            ops: self.ops,
            env: self.env,
        }
    }
}

/// A sealed plan, ready to hand to the sandbox launcher.
#[derive(Debug, Serialize)]
pub struct LaunchInvocation {
    ops: Vec<PlanOp>,
    env: BTreeMap<String, String>,
}

impl LaunchInvocation {
    pub fn ops(&self) -> &[PlanOp] {
        &self.ops
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Render the operations as a bwrap-compatible argument list.
    ///
    /// `BindData` content cannot travel in argv; each one references a
    /// descriptor number obtained from [`data_payloads`](Self::data_payloads)
    /// by index (the launcher is handed the payloads over pipes).
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        let mut data_index = 0usize;
        for op in &self.ops {
            match op {
                PlanOp::Bind {
                    host_path,
                    container_path,
                    read_only,
                } => {
                    args.push(OsString::from(if *read_only {
                        "--ro-bind"
                    } else {
                        "--bind"
                    }));
                    args.push(host_path.into());
                    args.push(container_path.into());
                }
                PlanOp::BindData { container_path, .. } => {
                    args.push(OsString::from("--bind-data"));
                    args.push(OsString::from(data_index.to_string()));
                    args.push(container_path.into());
                    data_index += 1;
                }
                PlanOp::Symlink {
                    target,
                    container_path,
                } => {
                    args.push(OsString::from("--symlink"));
                    args.push(target.into());
                    args.push(container_path.into());
                }
                PlanOp::Dir { container_path } => {
                    args.push(OsString::from("--dir"));
                    args.push(container_path.into());
                }
                PlanOp::Tmpfs { container_path } => {
                    args.push(OsString::from("--tmpfs"));
                    args.push(container_path.into());
                }
            }
        }
        args
    }

    /// The `BindData` payloads, in the order their indices appear in
    /// [`to_args`](Self::to_args).
    pub fn data_payloads(&self) -> Vec<&[u8]> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                PlanOp::BindData { bytes, .. } => Some(bytes.as_slice()),
                _ => None,
            })
            .collect()
    }

    /// `KEY=VALUE` environment assignments, sorted by key.
    pub fn env_assignments(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Top-level container directories that remain writable, everything else in
/// the assembled root is immutable.
const MUTABLE_TOP_LEVEL: &[&str] = &["etc", "overrides", "run", "tmp", "var"];

/// Reserved mount points for the provider itself, carved out of the
/// mutable set.
const RESERVED_SUBPATHS: &[&str] = &["run/host", "run/gfx", "run/interpreter-host"];

/// Whether `container_path` may be created or replaced by setup.
pub fn is_mutable_path(container_path: &Path) -> bool {
    let relative = match container_path.strip_prefix("/") {
        Ok(p) => p,
        Err(_) => container_path,
    };
    for reserved in RESERVED_SUBPATHS {
        if relative.starts_with(reserved) {
            return false;
        }
    }
    MUTABLE_TOP_LEVEL
        .iter()
        .any(|top| relative.starts_with(top))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_keep_insertion_order() {
        let mut plan = ConstructionPlan::new();
        plan.dir("/overrides");
        plan.symlink("/run/gfx/usr/lib/libGL.so.1", "/overrides/lib/libGL.so.1");
        plan.tmpfs("/tmp");

        let inv = plan.finish();
        assert!(matches!(inv.ops()[0], PlanOp::Dir { .. }));
        assert!(matches!(inv.ops()[1], PlanOp::Symlink { .. }));
        assert!(matches!(inv.ops()[2], PlanOp::Tmpfs { .. }));
    }

    #[test]
    fn to_args_renders_bwrap_style() {
        let mut plan = ConstructionPlan::new();
        plan.ro_bind("/home/user/.steam/runtime", "/usr");
        plan.symlink("usr/bin", "/bin");

        let args = plan.finish().to_args();
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--ro-bind",
                "/home/user/.steam/runtime",
                "/usr",
                "--symlink",
                "usr/bin",
                "/bin",
            ]
        );
    }

    #[test]
    fn bind_data_payloads_are_indexed_in_order() {
        let mut plan = ConstructionPlan::new();
        plan.bind_data(b"first".to_vec(), "/etc/a");
        plan.bind(PathBuf::from("/x"), PathBuf::from("/y"));
        plan.bind_data(b"second".to_vec(), "/etc/b");

        let inv = plan.finish();
        assert_eq!(inv.data_payloads(), vec![&b"first"[..], &b"second"[..]]);
        let args = inv.to_args();
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        // The second payload references index 1.
        let pos = rendered.iter().position(|a| a == "/etc/b").unwrap();
        assert_eq!(rendered[pos - 1], "1");
    }

    #[test]
    fn search_path_appends_with_colon() {
        let mut plan = ConstructionPlan::new();
        plan.append_search_path("VK_DRIVER_FILES", "/overrides/share/vulkan/icd.d/a.json");
        plan.append_search_path("VK_DRIVER_FILES", "/overrides/share/vulkan/icd.d/b.json");
        assert_eq!(
            plan.env().get("VK_DRIVER_FILES").unwrap(),
            "/overrides/share/vulkan/icd.d/a.json:/overrides/share/vulkan/icd.d/b.json"
        );
    }

    #[test]
    fn mutable_paths_allow_list() {
        assert!(is_mutable_path(Path::new("/etc/ld.so.conf")));
        assert!(is_mutable_path(Path::new("/var/tmp")));
        assert!(is_mutable_path(Path::new("/overrides/lib")));
        assert!(is_mutable_path(Path::new("/run/user/1000")));
        assert!(!is_mutable_path(Path::new("/usr/lib/libc.so.6")));
        assert!(!is_mutable_path(Path::new("/opt/something")));
    }

    #[test]
    fn reserved_provider_mounts_are_not_mutable() {
        assert!(!is_mutable_path(Path::new("/run/host")));
        assert!(!is_mutable_path(Path::new("/run/host/usr")));
        assert!(!is_mutable_path(Path::new("/run/gfx/usr/lib")));
        // Sibling names that merely share a string prefix are still mutable.
        assert!(is_mutable_path(Path::new("/run/hostile")));
        assert!(is_mutable_path(Path::new("/run/gfx2")));
    }
}
