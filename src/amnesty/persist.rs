//! Block-delimited persistence for amnesty requests
//!
//! Each record is bounded by `=== REQUEST ===` / `=== END ===` markers with
//! one `key|value` field per line. The format is kept byte-compatible with
//! existing data files; unknown keys are ignored and blocks without an id
//! are dropped.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use crate::moderation::persist::{format_time, parse_time};

use super::store::AmnestyRequest;

const BLOCK_START: &str = "=== REQUEST ===";
const BLOCK_END: &str = "=== END ===";

/// Read the request store; an absent file is an empty store.
pub fn load_requests(path: &Path) -> Result<HashMap<String, AmnestyRequest>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read request store {}", path.display()))?;

    let mut requests = HashMap::new();
    let mut current: Option<AmnestyRequest> = None;

    for line in text.lines() {
        let line = line.trim();
        if line == BLOCK_START {
            current = Some(AmnestyRequest::default());
            continue;
        }
        if line == BLOCK_END {
            if let Some(req) = current.take() {
                if !req.id.is_empty() {
                    requests.insert(req.id.clone(), req);
                }
            }
            continue;
        }
        let Some(req) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once('|') else {
            continue;
        };
        match key {
            "id" => req.id = value.to_string(),
            "applicant" => req.applicant = value.to_string(),
            "command" => req.command = value.to_string(),
            "reason" => req.reason = value.to_string(),
            "image" => {
                req.image_path = (!value.is_empty()).then(|| value.to_string());
            }
            "created" => {
                if let Some(t) = parse_time(value) {
                    req.created_at = t;
                }
            }
            "executed" => req.executed = value == "1",
            "executed_at" => req.executed_at = parse_time(value),
            "votes" => {
                req.voted_addresses = value
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect::<BTreeSet<_>>();
            }
            _ => {}
        }
    }

    Ok(requests)
}

pub fn save_requests<'a>(
    path: &Path,
    requests: impl Iterator<Item = &'a AmnestyRequest>,
) -> Result<()> {
    let mut out = String::new();
    for req in requests {
        out.push_str(BLOCK_START);
        out.push('\n');
        out.push_str(&format!("id|{}\n", req.id));
        out.push_str(&format!("applicant|{}\n", req.applicant));
        out.push_str(&format!("command|{}\n", req.command));
        out.push_str(&format!("reason|{}\n", req.reason));
        out.push_str(&format!("image|{}\n", req.image_path.as_deref().unwrap_or("")));
        out.push_str(&format!("created|{}\n", format_time(&req.created_at)));
        out.push_str(&format!("executed|{}\n", if req.executed { "1" } else { "0" }));
        out.push_str(&format!(
            "executed_at|{}\n",
            req.executed_at
                .filter(|_| req.executed)
                .map(|t| format_time(&t))
                .unwrap_or_default()
        ));
        let votes: Vec<&str> = req.voted_addresses.iter().map(String::as_str).collect();
        out.push_str(&format!("votes|{}\n", votes.join(",")));
        out.push_str(BLOCK_END);
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use tempfile::tempdir;

    #[test]
    fn round_trips_a_full_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requests.dat");

        let mut req = AmnestyRequest {
            id: "1a2b3c-4321".to_string(),
            applicant: "Alice".to_string(),
            command: "/pardon Alice".to_string(),
            reason: "false positive".to_string(),
            image_path: Some("1a2b3c-4321.png".to_string()),
            created_at: parse_time("2024-05-01 10:00:00").unwrap(),
            ..Default::default()
        };
        req.voted_addresses.insert("10.0.0.1".to_string());
        req.voted_addresses.insert("10.0.0.2".to_string());

        save_requests(&path, [&req].into_iter()).unwrap();
        let loaded = load_requests(&path).unwrap();
        let got = &loaded["1a2b3c-4321"];
        assert_eq!(got.applicant, "Alice");
        assert_eq!(got.command, "/pardon Alice");
        assert_eq!(got.image_path.as_deref(), Some("1a2b3c-4321.png"));
        assert_eq!(got.vote_count(), 2);
        assert!(!got.executed);
        assert!(got.executed_at.is_none());
    }

    #[test]
    fn reads_hand_written_fixture() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requests.dat");
        fs::write(
            &path,
            "=== REQUEST ===\n\
             id|abc-1000\n\
             applicant|Bob\n\
             command|/pardon Bob\n\
             reason|sorry\n\
             image|\n\
             created|2024-05-01 10:00:00\n\
             executed|1\n\
             executed_at|2024-05-02 11:00:00\n\
             votes|1.1.1.1,2.2.2.2,3.3.3.3\n\
             === END ===\n",
        )
        .unwrap();

        let loaded = load_requests(&path).unwrap();
        let req = &loaded["abc-1000"];
        assert!(req.executed);
        assert_eq!(
            req.executed_at.map(|t| format_time(&t)).as_deref(),
            Some("2024-05-02 11:00:00")
        );
        assert_eq!(req.vote_count(), 3);
        assert!(req.image_path.is_none());
    }

    #[test]
    fn blocks_without_id_are_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requests.dat");
        fs::write(
            &path,
            "=== REQUEST ===\napplicant|Ghost\n=== END ===\nstray|line\n",
        )
        .unwrap();
        assert!(load_requests(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        assert!(load_requests(&dir.path().join("nope.dat")).unwrap().is_empty());
    }

    #[test]
    fn executed_at_written_empty_for_pending_requests() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requests.dat");
        let req = AmnestyRequest {
            id: "x-1".to_string(),
            applicant: "A".to_string(),
            command: "/c".to_string(),
            created_at: Local::now(),
            ..Default::default()
        };
        save_requests(&path, [&req].into_iter()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("executed|0\n"));
        assert!(text.contains("executed_at|\n"));
        assert!(text.contains("votes|\n"));
    }
}
