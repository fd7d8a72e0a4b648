pub mod assemble;
pub mod gc;

use cradle_graphics::GraphicsError;
use cradle_lock::LockError;
use cradle_runtime::RuntimeError;
use thiserror::Error;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_BUSY: u8 = 3;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Graphics(#[from] GraphicsError),
    #[error(transparent)]
    Plan(#[from] cradle_plan::PlanError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Sysroot(#[from] cradle_sysroot::SysrootError),
    #[error("cannot serialize plan: {0}")]
    Render(#[from] serde_json::Error),
    #[error("cannot write '{path}': {source}")]
    Output {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Distinguished exit codes for failures callers may want to react to;
/// `None` means the generic failure code.
pub fn exit_code_for(error: &CommandError) -> Option<u8> {
    match error {
        CommandError::Lock(LockError::Busy(_))
        | CommandError::Runtime(RuntimeError::Lock(LockError::Busy(_))) => Some(EXIT_BUSY),
        CommandError::Runtime(RuntimeError::NotADirectory(_) | RuntimeError::BadManifest { .. })
        | CommandError::Graphics(
            GraphicsError::Json { .. } | GraphicsError::NoCommonArchitecture(_),
        ) => Some(EXIT_CONFIG_ERROR),
        _ => None,
    }
}
