//! Plain-text persistence for the moderation store
//!
//! Three files, all line oriented and kept byte-compatible with earlier
//! deployments:
//!
//! - player list: one name per line
//! - ban list: `name|reason|ban_time|unban_time`, `#` comments,
//!   `0000-00-00 00:00:00` as the "never expires" sentinel
//! - forbidden commands: `keyword hours`, leading `/` on the keyword
//!   stripped, `#` comments
//!
//! Malformed records are skipped with a warning instead of failing the load.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::store::{BanRecord, ForbiddenCommand};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const PERMANENT_SENTINEL: &str = "0000-00-00 00:00:00";

pub fn format_time(time: &DateTime<Local>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Format an expiry, mapping "no expiry" to the on-disk sentinel.
pub fn format_unban_time(time: &Option<DateTime<Local>>) -> String {
    match time {
        Some(t) => format_time(t),
        None => PERMANENT_SENTINEL.to_string(),
    }
}

pub fn parse_time(s: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(s, TIME_FORMAT).ok()?;
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => Some(dt),
        chrono::LocalResult::None => None,
    }
}

/// Read the known-player list, creating an empty file when absent.
pub fn load_players(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        touch(path)?;
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read player list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

pub fn save_players<'a>(path: &Path, players: impl Iterator<Item = &'a String>) -> Result<()> {
    let mut out = String::new();
    for name in players {
        out.push_str(name);
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

/// Read the ban list, creating an empty file when absent.
pub fn load_bans(path: &Path) -> Result<HashMap<String, BanRecord>> {
    if !path.exists() {
        touch(path)?;
        return Ok(HashMap::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read ban list {}", path.display()))?;
    let mut bans = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(4, '|');
        let (Some(name), Some(reason), Some(ban), Some(unban)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            tracing::warn!(line, "skipping malformed ban record");
            continue;
        };
        let Some(banned_at) = parse_time(ban) else {
            tracing::warn!(line, "skipping ban record with bad ban time");
            continue;
        };
        let unban_at = if unban == PERMANENT_SENTINEL {
            None
        } else {
            match parse_time(unban) {
                Some(t) => Some(t),
                None => {
                    tracing::warn!(line, "skipping ban record with bad unban time");
                    continue;
                }
            }
        };
        bans.insert(
            name.to_string(),
            BanRecord {
                name: name.to_string(),
                reason: reason.to_string(),
                banned_at,
                unban_at,
            },
        );
    }
    Ok(bans)
}

pub fn save_bans<'a>(path: &Path, bans: impl Iterator<Item = &'a BanRecord>) -> Result<()> {
    let mut out = String::from("# name|reason|ban_time|unban_time\n");
    for ban in bans {
        out.push_str(&format!(
            "{}|{}|{}|{}\n",
            ban.name,
            ban.reason,
            format_time(&ban.banned_at),
            format_unban_time(&ban.unban_at),
        ));
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

/// Read the forbidden-command rules, creating an empty file when absent.
pub fn load_forbidden(path: &Path) -> Result<Vec<ForbiddenCommand>> {
    if !path.exists() {
        touch(path)?;
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read forbidden commands {}", path.display()))?;
    let mut rules = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(keyword), Some(hours)) = (parts.next(), parts.next()) else {
            tracing::warn!(line, "skipping malformed forbidden-command rule");
            continue;
        };
        let Ok(ban_hours) = hours.parse::<u64>() else {
            tracing::warn!(line, "skipping forbidden-command rule with bad hours");
            continue;
        };
        let keyword = keyword.strip_prefix('/').unwrap_or(keyword).to_string();
        rules.push(ForbiddenCommand { keyword, ban_hours });
    }
    Ok(rules)
}

fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, "").with_context(|| format!("failed to create {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn player_list_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("players.list");
        let players = vec!["Alice".to_string(), "Bob".to_string()];
        save_players(&path, players.iter()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Alice\nBob\n");
        assert_eq!(load_players(&path).unwrap(), players);
    }

    #[test]
    fn missing_files_are_created_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("players.list");
        assert!(load_players(&path).unwrap().is_empty());
        assert!(path.exists());
    }

    #[test]
    fn ban_list_round_trips_with_sentinel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("banned.list");
        fs::write(
            &path,
            "# name|reason|ban_time|unban_time\n\
             Alice|griefing|2024-01-02 03:04:05|2024-01-03 03:04:05\n\
             Bob|cheating|2024-01-02 03:04:05|0000-00-00 00:00:00\n",
        )
        .unwrap();

        let bans = load_bans(&path).unwrap();
        assert_eq!(bans.len(), 2);
        assert!(bans["Alice"].unban_at.is_some());
        assert!(bans["Bob"].unban_at.is_none());
        assert!(bans["Bob"].is_permanent());

        save_bans(&path, bans.values()).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# name|reason|ban_time|unban_time\n"));
        assert!(written.contains("Bob|cheating|2024-01-02 03:04:05|0000-00-00 00:00:00"));
        assert!(written.contains("Alice|griefing|2024-01-02 03:04:05|2024-01-03 03:04:05"));
    }

    #[test]
    fn malformed_ban_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("banned.list");
        fs::write(
            &path,
            "garbage\nAlice|ok|2024-01-02 03:04:05|0000-00-00 00:00:00\nBob|bad|not a time|x\n",
        )
        .unwrap();
        let bans = load_bans(&path).unwrap();
        assert_eq!(bans.len(), 1);
        assert!(bans.contains_key("Alice"));
    }

    #[test]
    fn forbidden_rules_strip_leading_slash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forbidden.list");
        fs::write(&path, "# rules\n/kill 1\nstop 0\nbroken\nbad nan\n").unwrap();
        let rules = load_forbidden(&path).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].keyword, "kill");
        assert_eq!(rules[0].ban_hours, 1);
        assert_eq!(rules[1].keyword, "stop");
        assert_eq!(rules[1].ban_hours, 0);
    }
}
