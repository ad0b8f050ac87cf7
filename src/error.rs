use thiserror::Error;

/// Startup and wiring failures.
///
/// The stores and the process session carry their own error types; this one
/// covers what `main` has to report before the supervisor is running.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Process error: {0}")]
    Process(#[from] crate::process::ProcessError),

    #[error("Amnesty error: {0}")]
    Amnesty(#[from] crate::amnesty::AmnestyError),
}

pub type Result<T> = std::result::Result<T, Error>;
