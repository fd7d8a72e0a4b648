//! Graphics driver blending for Cradle.
//!
//! This crate implements the driver side of container assembly: concurrent
//! per-architecture enumeration of the provider's driver stack (Vulkan,
//! EGL, VDPAU, DRI, VA-API, OpenXR), classification of each driver as
//! path-based or name-based, capture of dependency closures into the
//! overrides tree via an external helper, SONAME alias reconciliation
//! between runtime and provider, rewritten JSON manifests with loader
//! search paths, and co-location of auxiliary data directories.

pub mod alias;
pub mod arch;
pub mod capture;
pub mod classify;
pub mod colocate;
pub mod enumerate;
pub mod listers;
pub mod manifest;
pub mod overrides;
pub mod rewrite;

pub use alias::{
    related_capture_patterns, AbiManifest, AliasResolver, LibraryFamily, RelatedSonames,
    RELATED_SONAMES,
};
pub use arch::{Architecture, ArchitectureContext};
pub use capture::{CaptureHelper, CapturePattern, PatternFlags};
pub use classify::{prune_shadowed, Classification, DriverBatch, DriverRecord, ResolvedRef};
pub use colocate::{DataCoLocator, DataMount};
pub use enumerate::{EnumerationJob, EnumerationTasks, SystemInfoCache};
pub use listers::DriverInstance;
pub use manifest::{DriverKind, DriverManifest};
pub use overrides::OverridesTree;
pub use rewrite::{module_search_path_env, ManifestRewriter};

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("graphics I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot run capture helper '{tool}': {source}")]
    HelperSpawn {
        tool: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("capture helper failed with {status}: {stderr}")]
    HelperFailed { status: ExitStatus, stderr: String },
    #[error("classification for '{driver}' on {tuple} was already set")]
    ClassificationAlreadySet { driver: String, tuple: String },
    #[error("runtime is missing required library '{soname}' for {tuple}")]
    MissingRuntimeLibrary { soname: String, tuple: String },
    #[error("no architecture is usable on both container and provider (tried: {0})")]
    NoCommonArchitecture(String),
    #[error(transparent)]
    Sysroot(#[from] cradle_sysroot::SysrootError),
}

impl GraphicsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
