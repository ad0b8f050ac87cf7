//! Moderation store: player presence, bans, forbidden-command rules
//!
//! One lock guards all mutable state. Anything that crosses into another
//! component (the ban/pardon directives sent to the server console, file
//! saves) happens after the lock is released; the lock is never held across
//! an await or a callback.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::event::{normalize_for_match, parse_log_time, strip_ansi, LogEvent, LogEventKind};
use super::persist::{self, format_time};
use super::CommandSink;

const JOINED_WITH: &str = " joined with ";
const JOINED_VANILLA: &str = " joined the game";
const LEFT_GAME: &str = " left the game";
const ISSUED_COMMAND: &str = " issued server command: /";

/// One ban on record. `unban_at == None` means the ban never expires.
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub name: String,
    pub reason: String,
    pub banned_at: DateTime<Local>,
    pub unban_at: Option<DateTime<Local>>,
}

impl BanRecord {
    pub fn is_permanent(&self) -> bool {
        self.unban_at.is_none()
    }
}

/// A currently connected player.
#[derive(Debug, Clone)]
pub struct OnlinePlayer {
    pub name: String,
    pub joined_at: DateTime<Local>,
    pub client: String,
}

/// Keyword rule that triggers an automatic ban. `ban_hours == 0` means the
/// ban is permanent.
#[derive(Debug, Clone)]
pub struct ForbiddenCommand {
    pub keyword: String,
    pub ban_hours: u64,
}

#[derive(Default)]
struct State {
    /// Every name ever seen joining, in first-seen order. Names are never
    /// removed; the order breaks ties when resolving the acting player of an
    /// operator-action line.
    known: Vec<String>,
    online: std::collections::HashMap<String, OnlinePlayer>,
    bans: std::collections::HashMap<String, BanRecord>,
    rules: Vec<ForbiddenCommand>,
}

/// Classifies server log lines, tracks who is online, and enforces bans.
pub struct ModerationStore {
    state: Mutex<State>,
    player_file: PathBuf,
    banned_file: PathBuf,
    sink: Arc<dyn CommandSink>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ModerationStore {
    /// Load persisted players, bans and forbidden-command rules. Missing
    /// files are created empty; unreadable files are logged and treated as
    /// empty.
    pub fn new(
        player_file: impl Into<PathBuf>,
        banned_file: impl Into<PathBuf>,
        forbidden_file: impl Into<PathBuf>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        let player_file = player_file.into();
        let banned_file = banned_file.into();
        let forbidden_file = forbidden_file.into();

        let known = persist::load_players(&player_file).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to load player list");
            Vec::new()
        });
        let bans = persist::load_bans(&banned_file).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to load ban list");
            Default::default()
        });
        let rules = persist::load_forbidden(&forbidden_file).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to load forbidden commands");
            Vec::new()
        });
        tracing::info!(
            players = known.len(),
            bans = bans.len(),
            rules = rules.len(),
            "moderation store loaded"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                known,
                online: Default::default(),
                bans,
                rules,
            }),
            player_file,
            banned_file,
            sink,
            sweep: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Classify one raw log line and apply its side effects.
    ///
    /// Presence changes are visible to concurrent readers as soon as this
    /// returns. An automatic ban triggered by a forbidden keyword is issued
    /// after the presence lock is dropped.
    pub fn process_line(&self, raw: &str) -> LogEvent {
        let clean = strip_ansi(raw);
        let timestamp = parse_log_time(&clean);
        let mut event = LogEvent::unclassified(timestamp);

        let Some(marker) = clean.find("]: ") else {
            return event;
        };
        let content = &clean[marker + 3..];

        // Join reported by a modded client handshake.
        if let Some(pos) = content.find(JOINED_WITH) {
            if let Some(player_pos) = content[..pos].rfind("Player ") {
                let name = content[player_pos + 7..pos].trim().to_string();
                let client = content[pos + JOINED_WITH.len()..].trim().to_string();
                event.kind = LogEventKind::PlayerJoin;
                event.player = name.clone();
                event.client = client.clone();
                self.record_join(name, client, timestamp);
                return event;
            }
        }

        // Vanilla join.
        if let Some(pos) = content.find(JOINED_VANILLA) {
            let name = content[..pos].trim().to_string();
            event.kind = LogEventKind::PlayerJoin;
            event.player = name.clone();
            event.client = "vanilla".to_string();
            self.record_join(name, event.client.clone(), timestamp);
            return event;
        }

        if let Some(pos) = content.find(LEFT_GAME) {
            let name = content[..pos].trim().to_string();
            event.kind = LogEventKind::PlayerLeave;
            event.player = name.clone();
            self.state.lock().unwrap().online.remove(&name);
            return event;
        }

        // Slash command echoed by the server.
        if let Some(pos) = content.find(ISSUED_COMMAND) {
            let name = content[..pos].trim().to_string();
            let command = content[pos + ISSUED_COMMAND.len()..]
                .trim_end_matches(['\n', '\r'])
                .to_string();
            event.kind = LogEventKind::PlayerCommand;
            event.player = name.clone();
            event.content = format!("/{command}");

            let matched = self.match_forbidden(content);
            if let Some(rule) = matched {
                let reason = forbidden_reason("command", &event.content, &rule);
                self.ban(&name, &reason, rule.ban_hours);
            }
            return event;
        }

        // Operator action line: "[Alice: Set own game mode to Creative Mode]".
        if content.starts_with('[') {
            let end_bracket = content.find(']');
            let colon = content.find(':');
            if let (Some(end_bracket), Some(colon)) = (end_bracket, colon) {
                if colon < end_bracket {
                    let bracket = content[1..end_bracket]
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    let actor = self.resolve_actor(content);

                    event.kind = LogEventKind::PlayerCommand;
                    event.player = actor.clone().unwrap_or_default();
                    event.content = format!("[{bracket}]");

                    if let Some(rule) = self.match_forbidden(&bracket) {
                        if let Some(actor) = actor {
                            let reason = forbidden_reason("action", &event.content, &rule);
                            self.ban(&actor, &reason, rule.ban_hours);
                        }
                    }
                    return event;
                }
            }
        }

        // Chat: "<Alice> hello".
        if let Some(rest) = content.strip_prefix('<') {
            if let Some(end) = rest.find('>') {
                event.kind = LogEventKind::PlayerChat;
                event.player = rest[..end].to_string();
                event.content = rest[end + 1..]
                    .trim()
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                return event;
            }
        }

        event
    }

    fn record_join(&self, name: String, client: String, joined_at: DateTime<Local>) {
        let mut state = self.state.lock().unwrap();
        if !state.known.contains(&name) {
            state.known.push(name.clone());
        }
        state.online.insert(
            name.clone(),
            OnlinePlayer {
                name,
                joined_at,
                client,
            },
        );
    }

    /// First rule whose normalized keyword occurs in the normalized text.
    fn match_forbidden(&self, text: &str) -> Option<ForbiddenCommand> {
        let haystack = normalize_for_match(text);
        let state = self.state.lock().unwrap();
        state
            .rules
            .iter()
            .find(|rule| haystack.contains(&normalize_for_match(&rule.keyword)))
            .cloned()
    }

    /// The known player whose name appears earliest in `content`. Ties fall
    /// to the name seen first.
    fn resolve_actor(&self, content: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let mut found: Option<(usize, &String)> = None;
        for name in &state.known {
            if let Some(pos) = content.find(name.as_str()) {
                if found.is_none_or(|(best, _)| pos < best) {
                    found = Some((pos, name));
                }
            }
        }
        found.map(|(_, name)| name.clone())
    }

    /// Ban a player and forward the directive to the server console.
    ///
    /// Permanent iff `hours == 0`. A blank name is a no-op; otherwise the
    /// record always lands, even if persistence lags behind.
    pub fn ban(&self, name: &str, reason: &str, hours: u64) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let banned_at = Local::now();
        let unban_at = if hours == 0 {
            None
        } else {
            Some(banned_at + ChronoDuration::hours(hours as i64))
        };
        {
            let mut state = self.state.lock().unwrap();
            state.bans.insert(
                name.to_string(),
                BanRecord {
                    name: name.to_string(),
                    reason: reason.to_string(),
                    banned_at,
                    unban_at,
                },
            );
        }
        tracing::info!(player = name, reason, hours, "player banned");
        self.sink.submit(&format!("ban {name} {reason}"));
        self.save();
    }

    /// Lift a ban. Returns false when the player was not banned.
    pub fn pardon(&self, name: &str) -> bool {
        let removed = self.state.lock().unwrap().bans.remove(name).is_some();
        if !removed {
            return false;
        }
        tracing::info!(player = name, "player pardoned");
        self.sink.submit(&format!("pardon {name}"));
        self.save();
        true
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.state.lock().unwrap().bans.contains_key(name)
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.state.lock().unwrap().online.contains_key(name)
    }

    /// Every player ever seen, in first-seen order.
    pub fn list_players(&self) -> Vec<String> {
        self.state.lock().unwrap().known.clone()
    }

    pub fn list_banned(&self) -> Vec<String> {
        self.state.lock().unwrap().bans.keys().cloned().collect()
    }

    pub fn list_banned_info(&self) -> Vec<BanRecord> {
        self.state.lock().unwrap().bans.values().cloned().collect()
    }

    pub fn list_online(&self) -> Vec<OnlinePlayer> {
        self.state.lock().unwrap().online.values().cloned().collect()
    }

    /// Write the player and ban lists out. Failures are logged; the
    /// in-memory state stays authoritative.
    pub fn save(&self) {
        let (players, bans) = {
            let state = self.state.lock().unwrap();
            (
                state.known.clone(),
                state.bans.values().cloned().collect::<Vec<_>>(),
            )
        };
        if let Err(e) = persist::save_players(&self.player_file, players.iter()) {
            tracing::error!(error = %e, "failed to save player list");
        }
        if let Err(e) = persist::save_bans(&self.banned_file, bans.iter()) {
            tracing::error!(error = %e, "failed to save ban list");
        }
    }

    /// Start the periodic sweep that pardons lapsed non-permanent bans.
    pub fn start_expiry_sweep(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => store.sweep_expired(),
                }
            }
            tracing::debug!("ban expiry sweep stopped");
        });
        *self.sweep.lock().unwrap() = Some(handle);
    }

    /// Pardon every non-permanent ban whose expiry has passed.
    pub fn sweep_expired(&self) {
        let now = Local::now();
        let lapsed: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .bans
                .values()
                .filter(|b| b.unban_at.is_some_and(|t| now >= t))
                .map(|b| b.name.clone())
                .collect()
        };
        for name in lapsed {
            self.pardon(&name);
            tracing::info!(player = %name, "ban expired, auto-pardoned");
        }
    }

    /// Stop the sweep task, clear the online set, and save.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweep.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.state.lock().unwrap().online.clear();
        self.save();
    }

    #[cfg(test)]
    pub(crate) fn set_rules(&self, rules: Vec<ForbiddenCommand>) {
        self.state.lock().unwrap().rules = rules;
    }

    #[cfg(test)]
    pub(crate) fn backdate_ban(&self, name: &str, unban_at: DateTime<Local>) {
        let mut state = self.state.lock().unwrap();
        if let Some(ban) = state.bans.get_mut(name) {
            ban.unban_at = Some(unban_at);
        }
    }
}

/// Amnesty requests are only accepted from names the server has seen join.
impl crate::amnesty::PlayerCheck for ModerationStore {
    fn is_known(&self, name: &str) -> bool {
        self.state.lock().unwrap().known.iter().any(|n| n == name)
    }
}

fn forbidden_reason(what: &str, content: &str, rule: &ForbiddenCommand) -> String {
    let penalty = if rule.ban_hours == 0 {
        "permanently banned.".to_string()
    } else {
        let until = Local::now() + ChronoDuration::hours(rule.ban_hours as i64);
        format!("banned until {}.", format_time(&until))
    };
    format!(
        "Issued forbidden {what}: {content}, {penalty} An appeal can be filed through the amnesty vote page."
    )
}
