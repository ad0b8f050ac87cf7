pub mod buffer;
pub mod error;
pub mod session;

pub use buffer::{LineBuffer, DEFAULT_COMPACT_THRESHOLD};
pub use error::ProcessError;
pub use session::{OutputStream, ServerProcess, EXIT_CODE_PENDING};
