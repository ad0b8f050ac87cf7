//! Community amnesty votes
//!
//! Players who got banned (usually by the automatic keyword rules) can file a
//! request to re-run or reverse a command; once enough distinct addresses
//! vote for it, a background sweep executes it against the server console.

pub mod persist;
pub mod store;


pub use store::{AmnestyError, AmnestyRequest, AmnestyStore, VoteOutcome};

use crate::moderation::event::normalize_for_match;

/// Executes a fulfilled request's command. Invoked by the sweep task with no
/// store lock held; implementations may call back into other components.
pub trait RequestExecutor: Send + Sync {
    fn execute(&self, command: &str, applicant: &str);
}

/// Supplied by the presence layer so new requests can be rejected when the
/// applicant has never been seen on the server.
pub trait PlayerCheck: Send + Sync {
    fn is_known(&self, name: &str) -> bool;
}

/// True when `command` is a pardon of the applicant themself.
///
/// Comparison is case-insensitive and ignores whitespace and a leading `/`:
/// `is_self_pardon("ALICE", "pardon   alice")` holds.
pub fn is_self_pardon(applicant: &str, command: &str) -> bool {
    let cmd = normalize_for_match(command);
    let cmd = cmd.strip_prefix('/').unwrap_or(&cmd);
    match cmd.strip_prefix("pardon") {
        Some(rest) => rest.contains(&applicant.to_lowercase()),
        None => false,
    }
}

#[cfg(test)]
mod self_pardon_tests {
    use super::is_self_pardon;

    #[test]
    fn detects_plain_self_pardon() {
        assert!(is_self_pardon("Alice", "/pardon Alice"));
    }

    #[test]
    fn rejects_other_commands() {
        assert!(!is_self_pardon("Alice", "/ban Bob"));
        assert!(!is_self_pardon("Alice", "/pardon Bob"));
    }

    #[test]
    fn ignores_case_and_spacing() {
        assert!(is_self_pardon("ALICE", "pardon   alice"));
        assert!(is_self_pardon("alice", "/PARDON Alice please"));
    }
}
