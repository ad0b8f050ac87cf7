//! Log classification, player presence, and ban enforcement.

pub mod event;
pub mod persist;
pub mod store;


pub use event::{strip_ansi, LogEvent, LogEventKind};
pub use store::{BanRecord, ForbiddenCommand, ModerationStore, OnlinePlayer};

/// Write channel into the supervised server's console.
///
/// The moderation store uses it to forward `ban` / `pardon` directives
/// without reaching into the process session directly. Implementations must
/// not call back into the store.
pub trait CommandSink: Send + Sync {
    fn submit(&self, command: &str);
}
