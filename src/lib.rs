//! # Warden
//!
//! A supervisor for a long-running game server. It launches the server as a
//! child process, reads its console output line by line, and turns the log
//! stream into moderation state: who is online, who is banned, and which
//! commands get players banned automatically. A community amnesty store lets
//! banned players file requests that execute against the console once enough
//! distinct addresses vote for them.
//!
//! ## Modules
//!
//! - `process` - Child process session with lazily-compacting output buffers
//! - `moderation` - Log-line classifier, player presence, and the ban store
//! - `amnesty` - Threshold-voting request store with auto-execution
//! - `supervisor` - Ingestion loop tying process output to the stores
//! - `config` - TOML configuration with historical defaults
//! - `error` - Top-level error type for startup and wiring
pub mod amnesty;
pub mod config;
pub mod error;
pub mod moderation;
pub mod process;
pub mod supervisor;

pub use error::{Error, Result};
