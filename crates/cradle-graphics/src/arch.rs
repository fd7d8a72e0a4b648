use std::path::{Path, PathBuf};

/// CPU architectures a container can support. The first entry of
/// [`Architecture::ALL`] is the primary architecture; the rest are
/// secondary/compat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    X86_64,
    I386,
}

/// Static per-architecture facts, looked up through [`Architecture`]
/// methods rather than positional indexing.
struct ArchDetails {
    arch: Architecture,
    tuple: &'static str,
    ld_so: &'static str,
    platform_tag: &'static str,
}

const DETAILS: &[ArchDetails] = &[
    ArchDetails {
        arch: Architecture::X86_64,
        tuple: "x86_64-linux-gnu",
        ld_so: "/lib64/ld-linux-x86-64.so.2",
        platform_tag: "x86_64",
    },
    ArchDetails {
        arch: Architecture::I386,
        tuple: "i386-linux-gnu",
        ld_so: "/lib/ld-linux.so.2",
        platform_tag: "i686",
    },
];

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::X86_64, Architecture::I386];

    fn details(self) -> &'static ArchDetails {
        let entry = match self {
            Self::X86_64 => &DETAILS[0],
            Self::I386 => &DETAILS[1],
        };
        debug_assert_eq!(entry.arch, self);
        entry
    }

    /// The Debian-style multiarch tuple, used for library directory names.
    pub fn tuple(self) -> &'static str {
        self.details().tuple
    }

    /// Absolute path of the dynamic linker for this architecture.
    pub fn ld_so(self) -> &'static str {
        self.details().ld_so
    }

    /// The `$PLATFORM` string the dynamic linker would substitute.
    pub fn platform_tag(self) -> &'static str {
        self.details().platform_tag
    }

    /// Whether a driver failure on this architecture is fatal (nothing can
    /// run without the primary architecture's loader and libc).
    pub fn is_primary(self) -> bool {
        self == Self::ALL[0]
    }

    pub fn from_tuple(tuple: &str) -> Option<Self> {
        DETAILS.iter().find(|d| d.tuple == tuple).map(|d| d.arch)
    }

    /// Library directories, relative to a tree root, that the dynamic
    /// linker searches for this architecture, most specific first.
    pub fn lib_dirs(self) -> Vec<PathBuf> {
        let tuple = self.tuple();
        let mut dirs = vec![
            PathBuf::from(format!("usr/lib/{tuple}")),
            PathBuf::from(format!("lib/{tuple}")),
        ];
        if self.is_primary() {
            dirs.push(PathBuf::from("usr/lib64"));
            dirs.push(PathBuf::from("lib64"));
        } else {
            dirs.push(PathBuf::from("usr/lib32"));
            dirs.push(PathBuf::from("lib32"));
        }
        dirs.push(PathBuf::from("usr/lib"));
        dirs.push(PathBuf::from("lib"));
        dirs
    }
}

/// Everything classification and capture need to know about one
/// architecture of the container being assembled. Built once at setup
/// start; read-only afterwards.
#[derive(Debug, Clone)]
pub struct ArchitectureContext {
    arch: Architecture,
    overrides_libdir: PathBuf,
    overrides_aliasdir: PathBuf,
    capture_tool: PathBuf,
}

impl ArchitectureContext {
    pub fn new(
        arch: Architecture,
        overrides_libdir: impl Into<PathBuf>,
        overrides_aliasdir: impl Into<PathBuf>,
        capture_tool: impl Into<PathBuf>,
    ) -> Self {
        Self {
            arch,
            overrides_libdir: overrides_libdir.into(),
            overrides_aliasdir: overrides_aliasdir.into(),
            capture_tool: capture_tool.into(),
        }
    }

    #[inline]
    pub fn arch(&self) -> Architecture {
        self.arch
    }

    #[inline]
    pub fn tuple(&self) -> &'static str {
        self.arch.tuple()
    }

    #[inline]
    pub fn overrides_libdir(&self) -> &Path {
        &self.overrides_libdir
    }

    #[inline]
    pub fn overrides_aliasdir(&self) -> &Path {
        &self.overrides_aliasdir
    }

    /// The per-architecture build of the dependency-closure capture tool.
    #[inline]
    pub fn capture_tool(&self) -> &Path {
        &self.capture_tool
    }
}
