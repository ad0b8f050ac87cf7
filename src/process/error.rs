use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process is already running")]
    AlreadyRunning,

    #[error("process is not running")]
    NotRunning,

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("failed to capture child {0} stream")]
    StreamCapture(&'static str),

    #[error("timed out writing to child stdin")]
    StdinStalled,

    #[error("failed to deliver signal to child: {0}")]
    Signal(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
