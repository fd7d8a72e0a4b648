//! Construction-plan assembly and path realization for Cradle.
//!
//! This crate implements the hand-off surface between container setup and
//! the external sandbox launcher: an ordered [`ConstructionPlan`] of
//! bind/symlink/dir/tmpfs operations plus environment assignments, and the
//! [`PathRealizer`] abstraction that makes "put this content at that
//! container path" work both by editing a mutable runtime copy in place
//! ([`InPlaceRealizer`]) and by emitting plan operations for the launcher
//! ([`PlanRealizer`]).

pub mod plan;
pub mod realize;

pub use plan::{ConstructionPlan, LaunchInvocation, PlanOp};
pub use realize::{default_root_select, InPlaceRealizer, PathRealizer, PlanRealizer, RootSelect};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{0}' is not mutable inside the container")]
    NotMutable(PathBuf),
    #[error("cannot mount over '{0}' without a mutable runtime copy")]
    NeedsMutableCopy(PathBuf),
    #[error("container path '{0}' must be absolute")]
    NotAbsolute(PathBuf),
}
