//! Log event types and raw-line text handling
//!
//! The server writes human-oriented log lines, frequently wrapped in terminal
//! color codes. Everything here deals with turning one raw line into clean
//! text plus a timestamp; the classification itself lives on the store, which
//! owns the player state the classifier mutates.

use chrono::{DateTime, Local, NaiveTime, TimeZone};

/// What a classified log line turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogEventKind {
    /// Line carried no recognized player activity.
    #[default]
    None,
    PlayerJoin,
    PlayerLeave,
    PlayerCommand,
    PlayerChat,
}

/// A classified log line.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub kind: LogEventKind,
    pub timestamp: DateTime<Local>,
    pub player: String,
    /// Client brand for join events, empty otherwise.
    pub client: String,
    pub content: String,
}

impl LogEvent {
    pub(crate) fn unclassified(timestamp: DateTime<Local>) -> Self {
        Self {
            kind: LogEventKind::None,
            timestamp,
            player: String::new(),
            client: String::new(),
            content: String::new(),
        }
    }
}

/// Remove ANSI control sequences from a line.
///
/// Handles proper `ESC[...x` sequences, stray ESC bytes, and the truncated
/// `[123;45m` form that survives when an upstream filter already ate the
/// escape byte. Idempotent: stripping a stripped line is a no-op.
pub fn strip_ansi(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b {
            if i + 1 < bytes.len() && bytes[i + 1] == b'[' {
                i += 2;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b';') {
                    i += 1;
                }
                if i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                continue;
            }
            i += 1;
            continue;
        }
        if bytes[i] == b'[' {
            let mut j = i + 1;
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                while j < bytes.len() && (bytes[j].is_ascii_digit() || bytes[j] == b';') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j] == b'm' {
                    i = j + 1;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse the `[HH:MM:SS` prefix of a log line into a timestamp on today's
/// date. Falls back to the current time when the prefix is absent or
/// malformed.
pub fn parse_log_time(line: &str) -> DateTime<Local> {
    let now = Local::now();
    let Some(start) = line.find('[') else {
        return now;
    };
    let rest = &line[start + 1..];
    let end = rest
        .find(|c: char| c == ']' || c == ' ')
        .unwrap_or(rest.len());
    let Ok(time) = NaiveTime::parse_from_str(&rest[..end], "%H:%M:%S") else {
        return now;
    };
    match Local.from_local_datetime(&now.date_naive().and_time(time)) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => now,
    }
}

/// Lowercase and drop spaces/tabs; the normal form used for forbidden-keyword
/// matching and self-pardon checks.
pub fn normalize_for_match(s: &str) -> String {
    s.chars()
        .filter(|&c| c != ' ' && c != '\t')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn strips_escape_sequences() {
        let raw = "\x1b[32m[12:00:01] [Server thread/INFO]\x1b[0m: hello";
        assert_eq!(strip_ansi(raw), "[12:00:01] [Server thread/INFO]: hello");
    }

    #[test]
    fn strips_truncated_sequences_without_escape() {
        assert_eq!(strip_ansi("[0;32mtext[0m"), "text");
    }

    #[test]
    fn keeps_ordinary_brackets() {
        let line = "[12:00:01] [Server thread/INFO]: ok";
        assert_eq!(strip_ansi(line), line);
    }

    #[test]
    fn stripping_is_idempotent() {
        let raw = "\x1b[31;1mwarn\x1b[0m [1;33m!";
        let once = strip_ansi(raw);
        assert_eq!(strip_ansi(&once), once);
    }

    #[test]
    fn parses_bracketed_time_prefix() {
        let ts = parse_log_time("[13:45:09] [Server thread/INFO]: hi");
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (13, 45, 9));
    }

    #[test]
    fn malformed_time_falls_back_to_now() {
        let before = Local::now();
        let ts = parse_log_time("no timestamp here");
        assert!(ts >= before);
    }

    #[test]
    fn normalize_drops_whitespace_and_case() {
        assert_eq!(normalize_for_match("Kill  All\tMobs"), "killallmobs");
    }
}
