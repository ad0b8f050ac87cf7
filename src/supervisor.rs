//! Supervision loop: wires process output through the classifier
//!
//! One background task reads the server's stdout line by line, hands each
//! line to the moderation store for classification, and keeps a bounded
//! cache of the most recent player events for the outer API layer. Stderr
//! lines are passed through to the tracing log unclassified. The
//! supervisor is also the command entry point into the server console, both
//! for callers and for the stores' directive seams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::amnesty::RequestExecutor;
use crate::moderation::{CommandSink, LogEventKind, ModerationStore};
use crate::process::{OutputStream, ProcessError, ServerProcess};

/// Event kinds surfaced to API consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Join,
    Leave,
    Command,
    Chat,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Join => "join",
            LogKind::Leave => "leave",
            LogKind::Command => "command",
            LogKind::Chat => "chat",
        }
    }
}

/// One cached player event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Processing time, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    pub kind: LogKind,
    pub player: String,
    pub content: String,
}

/// Ties the process session, the classifier, and the event cache together.
pub struct Supervisor {
    process: Arc<ServerProcess>,
    moderation: Arc<ModerationStore>,
    cache: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    poll_interval: Duration,
    ingest: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(
        process: Arc<ServerProcess>,
        moderation: Arc<ModerationStore>,
        capacity: usize,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            process,
            moderation,
            cache: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            poll_interval,
            ingest: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Launch the server process and start ingesting its output.
    pub fn start(self: &Arc<Self>) -> Result<(), ProcessError> {
        self.process.run()?;
        let supervisor = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(supervisor.ingest_loop(shutdown_rx));
        *self.ingest.lock().unwrap() = Some(handle);
        tracing::info!("supervision loop started");
        Ok(())
    }

    async fn ingest_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            // Read before checking liveness: the reader task drains the
            // final output burst into the buffers before it clears the
            // running flag, and those lines must still be ingested.
            let mut progressed = false;
            let line = self.process.read_output(true, OutputStream::Stdout);
            if !line.is_empty() {
                self.ingest_line(&line);
                progressed = true;
            }
            let err = self.process.read_output(true, OutputStream::Stderr);
            if !err.is_empty() {
                tracing::warn!(target: "server", "{}", err.trim_end());
                progressed = true;
            }
            if progressed {
                continue;
            }
            let wait = if self.process.is_running() {
                self.poll_interval
            } else {
                Duration::from_millis(100)
            };
            if idle(&mut shutdown_rx, wait).await {
                break;
            }
        }
        tracing::debug!("supervision loop stopped");
    }

    /// Classify one line and cache the resulting event, if any.
    fn ingest_line(&self, line: &str) {
        let event = self.moderation.process_line(line);
        let kind = match event.kind {
            LogEventKind::PlayerJoin => LogKind::Join,
            LogEventKind::PlayerLeave => LogKind::Leave,
            LogEventKind::PlayerCommand => LogKind::Command,
            LogEventKind::PlayerChat => LogKind::Chat,
            LogEventKind::None => {
                // Not a player event; pass the raw line through to our log.
                tracing::info!(target: "server", "{}", line.trim_end());
                return;
            }
        };
        let content = match kind {
            LogKind::Join => event.client,
            LogKind::Leave => String::new(),
            _ => event.content,
        };
        tracing::info!(
            kind = kind.as_str(),
            player = %event.player,
            content = %content,
            "player event"
        );
        self.push_entry(LogEntry {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            kind,
            player: event.player,
            content,
        });
    }

    fn push_entry(&self, entry: LogEntry) {
        let mut cache = self.cache.lock().unwrap();
        cache.push_back(entry);
        while cache.len() > self.capacity {
            cache.pop_front();
        }
    }

    /// The most recent `limit` events, oldest first. `limit == 0` means all.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        let cache = self.cache.lock().unwrap();
        if limit == 0 || limit >= cache.len() {
            return cache.iter().cloned().collect();
        }
        cache.iter().skip(cache.len() - limit).cloned().collect()
    }

    /// Send a console command to the server. A leading `/` is stripped; the
    /// console grammar does not use one.
    pub fn execute_command(&self, command: &str) -> Result<(), ProcessError> {
        let command = command.strip_prefix('/').unwrap_or(command);
        self.process.send_line(&format!("{command}\n"))?;
        tracing::info!(command, "executed console command");
        Ok(())
    }

    /// Stop ingesting and ask the server to terminate.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.ingest.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.process.stop() {
            tracing::debug!(error = %e, "server process was not running at stop");
        }
    }
}

/// Vote fulfillment runs through the same console entry point.
impl RequestExecutor for Supervisor {
    fn execute(&self, command: &str, applicant: &str) {
        tracing::info!(command, applicant, "executing amnesty request");
        if let Err(e) = self.execute_command(command) {
            tracing::error!(error = %e, command, "failed to execute amnesty request");
        }
    }
}

/// Console sink backed directly by the process session's stdin.
///
/// The moderation store holds this instead of the whole supervisor, so ban
/// directives never re-enter supervisor state.
pub struct ProcessCommandSink {
    process: Arc<ServerProcess>,
}

impl ProcessCommandSink {
    pub fn new(process: Arc<ServerProcess>) -> Self {
        Self { process }
    }
}

impl CommandSink for ProcessCommandSink {
    fn submit(&self, command: &str) {
        if let Err(e) = self.process.send_line(&format!("{command}\n")) {
            tracing::error!(error = %e, command, "failed to forward console directive");
        }
    }
}

/// Wait for either the shutdown flag or the timeout. True means shut down.
async fn idle(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(command: &str, capacity: usize) -> (TempDir, Arc<ServerProcess>, Arc<Supervisor>) {
        let dir = TempDir::new().unwrap();
        let process = Arc::new(ServerProcess::new(command, Duration::from_millis(10)));
        let moderation = Arc::new(ModerationStore::new(
            dir.path().join("players.list"),
            dir.path().join("banned.list"),
            dir.path().join("forbidden.list"),
            Arc::new(ProcessCommandSink::new(Arc::clone(&process))),
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&process),
            moderation,
            capacity,
            Duration::from_millis(10),
        ));
        (dir, process, supervisor)
    }

    #[test]
    fn cache_evicts_oldest_beyond_capacity() {
        let (_dir, _process, supervisor) = fixture("true", 2);
        for i in 0..4 {
            supervisor.ingest_line(&format!(
                "[12:00:0{i}] [Server thread/INFO]: <P{i}> msg {i}\n"
            ));
        }
        let logs = supervisor.recent_logs(0);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].player, "P2");
        assert_eq!(logs[1].player, "P3");
    }

    #[test]
    fn recent_logs_honors_limit() {
        let (_dir, _process, supervisor) = fixture("true", 10);
        for i in 0..5 {
            supervisor.ingest_line(&format!("[12:00:00] [Server thread/INFO]: <P{i}> hi\n"));
        }
        let logs = supervisor.recent_logs(2);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].player, "P3");
        assert_eq!(logs[1].player, "P4");
    }

    #[test]
    fn unclassified_lines_are_not_cached() {
        let (_dir, _process, supervisor) = fixture("true", 10);
        supervisor.ingest_line("[12:00:00] [Server thread/INFO]: Loading world...\n");
        assert!(supervisor.recent_logs(0).is_empty());
    }

    #[test]
    fn join_entries_carry_client_as_content() {
        let (_dir, _process, supervisor) = fixture("true", 10);
        supervisor.ingest_line("[12:00:00] [Server thread/INFO]: Alice joined the game\n");
        supervisor.ingest_line("[12:01:00] [Server thread/INFO]: Alice left the game\n");
        let logs = supervisor.recent_logs(0);
        assert_eq!(logs[0].kind, LogKind::Join);
        assert_eq!(logs[0].content, "vanilla");
        assert_eq!(logs[1].kind, LogKind::Leave);
        assert_eq!(logs[1].content, "");
    }

    #[tokio::test]
    async fn execute_command_strips_slash_and_reaches_stdin() {
        // Run the process without the ingestion task so this test is the
        // only consumer of the stdout buffer.
        let (_dir, process, supervisor) = fixture("cat", 10);
        process.run().unwrap();
        supervisor.execute_command("/say hello").unwrap();

        let mut echoed = String::new();
        for _ in 0..300 {
            echoed = process.read_output(true, OutputStream::Stdout);
            if !echoed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(echoed, "say hello\n");

        let _ = process.kill();
        process.shutdown().await;
    }

    #[tokio::test]
    async fn execute_command_fails_when_process_is_down() {
        let (_dir, _process, supervisor) = fixture("true", 10);
        assert!(matches!(
            supervisor.execute_command("/say hi"),
            Err(ProcessError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn drains_events_buffered_at_process_exit() {
        let (_dir, process, supervisor) = fixture(
            "echo '[12:00:01] [Server thread/INFO]: Alice joined the game'",
            10,
        );
        supervisor.start().unwrap();
        for _ in 0..300 {
            if !process.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!process.is_running(), "echo did not exit in time");

        // The line must arrive even though the process is already gone.
        let mut logs = Vec::new();
        for _ in 0..300 {
            logs = supervisor.recent_logs(0);
            if !logs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::Join);
        assert_eq!(logs[0].player, "Alice");

        supervisor.stop().await;
        process.shutdown().await;
    }

    #[tokio::test]
    async fn stderr_lines_are_drained_without_caching() {
        let (_dir, process, supervisor) = fixture("echo oops >&2", 10);
        supervisor.start().unwrap();
        for _ in 0..300 {
            if !process.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!process.is_running(), "process did not exit in time");

        let mut drained = false;
        for _ in 0..300 {
            if process.stderr_buffer().is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained, "stderr buffer was never consumed");
        assert!(supervisor.recent_logs(0).is_empty());

        supervisor.stop().await;
        process.shutdown().await;
    }

    #[tokio::test]
    async fn ingests_player_events_end_to_end() {
        let (_dir, process, supervisor) = fixture(
            "echo '[12:00:01] [Server thread/INFO]: Alice joined the game'",
            10,
        );
        supervisor.start().unwrap();

        let mut logs = Vec::new();
        for _ in 0..300 {
            logs = supervisor.recent_logs(0);
            if !logs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::Join);
        assert_eq!(logs[0].player, "Alice");

        supervisor.stop().await;
        process.shutdown().await;
    }
}
