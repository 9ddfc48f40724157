use crate::config::ConfigError;
use crate::remote::RemoteError;
use crate::render::RenderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The renderer exited with a code that is neither success nor one of
    /// the partial/total failure codes.
    #[error("failed to create image (code: {0})")]
    UnrecognizedExit(i32),
}

impl Error {
    /// Errors that must stop the process right away instead of being
    /// counted toward the failure threshold.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::UnrecognizedExit(_))
    }

    /// Process exit code to use when this error ends the program.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::UnrecognizedExit(code) => u8::try_from(*code).ok().filter(|c| *c != 0).unwrap_or(1),
            _ => 1,
        }
    }
}
