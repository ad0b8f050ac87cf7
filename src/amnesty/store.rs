//! Vote-request store and its background sweep

use chrono::{DateTime, Duration as ChronoDuration, Local};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{persist, PlayerCheck, RequestExecutor};

#[derive(Debug, Error)]
pub enum AmnestyError {
    #[error("applicant and command must not be empty")]
    InvalidRequest,

    #[error("unknown applicant: {0}")]
    UnknownApplicant(String),
}

/// Result of casting a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Accepted,
    AlreadyVoted,
    NotFound,
    AlreadyExecuted,
}

/// One amnesty request moving through
/// created → voted → executed → removed (24h later).
#[derive(Debug, Clone)]
pub struct AmnestyRequest {
    pub id: String,
    pub applicant: String,
    pub command: String,
    pub reason: String,
    /// File name of the uploaded evidence image, relative to the upload dir.
    pub image_path: Option<String>,
    pub voted_addresses: BTreeSet<String>,
    pub created_at: DateTime<Local>,
    pub executed: bool,
    pub executed_at: Option<DateTime<Local>>,
}

impl Default for AmnestyRequest {
    fn default() -> Self {
        Self {
            id: String::new(),
            applicant: String::new(),
            command: String::new(),
            reason: String::new(),
            image_path: None,
            voted_addresses: BTreeSet::new(),
            created_at: Local::now(),
            executed: false,
            executed_at: None,
        }
    }
}

impl AmnestyRequest {
    pub fn vote_count(&self) -> usize {
        self.voted_addresses.len()
    }
}

/// Owns pending amnesty requests, their votes, and the execute/cleanup sweep.
pub struct AmnestyStore {
    requests: Mutex<HashMap<String, AmnestyRequest>>,
    data_file: PathBuf,
    upload_dir: PathBuf,
    threshold: AtomicUsize,
    retention: ChronoDuration,
    executor: Arc<dyn RequestExecutor>,
    player_check: Mutex<Option<Arc<dyn PlayerCheck>>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl AmnestyStore {
    /// Load persisted requests and make sure the upload directory exists.
    pub fn new(
        data_file: impl Into<PathBuf>,
        upload_dir: impl Into<PathBuf>,
        threshold: usize,
        retention: Duration,
        executor: Arc<dyn RequestExecutor>,
    ) -> Self {
        let data_file = data_file.into();
        let upload_dir = upload_dir.into();
        if let Err(e) = fs::create_dir_all(&upload_dir) {
            tracing::error!(error = %e, dir = %upload_dir.display(), "failed to create upload dir");
        }
        let requests = persist::load_requests(&data_file).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to load request store");
            HashMap::new()
        });
        tracing::info!(requests = requests.len(), "amnesty store loaded");

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            requests: Mutex::new(requests),
            data_file,
            upload_dir,
            threshold: AtomicUsize::new(threshold),
            retention: ChronoDuration::from_std(retention)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
            executor,
            player_check: Mutex::new(None),
            sweep: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Install an applicant-existence check. Requests from names the check
    /// rejects fail with [`AmnestyError::UnknownApplicant`]; without one,
    /// any non-empty applicant is accepted.
    pub fn set_player_check(&self, check: Arc<dyn PlayerCheck>) {
        *self.player_check.lock().unwrap() = Some(check);
    }

    /// File a new request, returning its generated id.
    ///
    /// The optional image is written under the upload directory named after
    /// the id; a failed image write is logged and the request proceeds
    /// without one.
    pub fn create_request(
        &self,
        applicant: &str,
        command: &str,
        reason: &str,
        image: Option<(&[u8], &str)>,
    ) -> Result<String, AmnestyError> {
        let applicant = applicant.trim();
        let command = command.trim();
        if applicant.is_empty() || command.is_empty() {
            return Err(AmnestyError::InvalidRequest);
        }
        let check = self.player_check.lock().unwrap().clone();
        if let Some(check) = check {
            if !check.is_known(applicant) {
                return Err(AmnestyError::UnknownApplicant(applicant.to_string()));
            }
        }

        let id = generate_id();
        let image_path = image.and_then(|(data, ext)| {
            let filename = format!("{id}{ext}");
            match fs::write(self.upload_dir.join(&filename), data) {
                Ok(()) => Some(filename),
                Err(e) => {
                    tracing::error!(error = %e, "failed to store request image");
                    None
                }
            }
        });

        let request = AmnestyRequest {
            id: id.clone(),
            applicant: applicant.to_string(),
            command: command.to_string(),
            reason: reason.trim().to_string(),
            image_path,
            ..Default::default()
        };
        self.requests.lock().unwrap().insert(id.clone(), request);
        tracing::info!(id = %id, applicant, command, "amnesty request created");
        self.save();
        Ok(id)
    }

    /// Record a vote from `address`. Execution is left to the sweep so the
    /// critical section stays short and free of side effects.
    pub fn vote(&self, id: &str, address: &str) -> VoteOutcome {
        let mut requests = self.requests.lock().unwrap();
        let Some(request) = requests.get_mut(id) else {
            return VoteOutcome::NotFound;
        };
        if request.executed {
            return VoteOutcome::AlreadyExecuted;
        }
        if !request.voted_addresses.insert(address.to_string()) {
            return VoteOutcome::AlreadyVoted;
        }
        VoteOutcome::Accepted
    }

    /// Snapshot of all requests, newest first.
    pub fn list_requests(&self) -> Vec<AmnestyRequest> {
        let mut list: Vec<AmnestyRequest> =
            self.requests.lock().unwrap().values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn get_request(&self, id: &str) -> Option<AmnestyRequest> {
        self.requests.lock().unwrap().get(id).cloned()
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::SeqCst)
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::SeqCst);
    }

    /// Start the periodic execute/cleanup sweep.
    pub fn start_sweep(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => store.run_sweep(),
                }
            }
            tracing::debug!("amnesty sweep stopped");
        });
        *self.sweep.lock().unwrap() = Some(handle);
    }

    /// One sweep iteration: execute requests that reached the threshold,
    /// then drop executed requests past the retention window.
    pub fn run_sweep(&self) {
        self.execute_ready();
        self.cleanup_expired();
    }

    fn execute_ready(&self) {
        let threshold = self.threshold();
        let ready: Vec<(String, String)> = {
            let mut requests = self.requests.lock().unwrap();
            let now = Local::now();
            requests
                .values_mut()
                .filter(|r| !r.executed && r.vote_count() >= threshold)
                .map(|r| {
                    r.executed = true;
                    r.executed_at = Some(now);
                    (r.command.clone(), r.applicant.clone())
                })
                .collect()
        };

        // Callbacks run with the store lock released.
        for (command, applicant) in &ready {
            tracing::info!(command, applicant, "amnesty request reached threshold, executing");
            self.executor.execute(command, applicant);
        }
        if !ready.is_empty() {
            self.save();
        }
    }

    fn cleanup_expired(&self) {
        let now = Local::now();
        let (removed, images): (Vec<String>, Vec<String>) = {
            let mut requests = self.requests.lock().unwrap();
            let expired: Vec<String> = requests
                .values()
                .filter(|r| {
                    r.executed
                        && r.executed_at
                            .is_some_and(|t| now - t >= self.retention)
                })
                .map(|r| r.id.clone())
                .collect();
            let mut images = Vec::new();
            for id in &expired {
                if let Some(request) = requests.remove(id) {
                    images.extend(request.image_path);
                }
            }
            (expired, images)
        };

        for image in &images {
            let path = self.upload_dir.join(image);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to delete request image");
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "cleaned up expired amnesty requests");
            self.save();
        }
    }

    /// Persist the store; failures are logged, memory stays authoritative.
    pub fn save(&self) {
        let snapshot: Vec<AmnestyRequest> =
            self.requests.lock().unwrap().values().cloned().collect();
        if let Err(e) = persist::save_requests(&self.data_file, snapshot.iter()) {
            tracing::error!(error = %e, "failed to save request store");
        }
    }

    /// Stop the sweep task and save.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweep.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.save();
    }

    #[cfg(test)]
    pub(crate) fn backdate_execution(&self, id: &str, executed_at: DateTime<Local>) {
        let mut requests = self.requests.lock().unwrap();
        if let Some(request) = requests.get_mut(id) {
            request.executed_at = Some(executed_at);
        }
    }

    #[cfg(test)]
    pub(crate) fn replace_for_test(&self, request: AmnestyRequest) {
        self.requests
            .lock()
            .unwrap()
            .insert(request.id.clone(), request);
    }
}

/// Millisecond timestamp in hex plus a 4-digit random suffix.
///
/// Matches the historical id shape; uniqueness under concurrent creation is
/// best-effort only.
fn generate_id() -> String {
    let millis = Local::now().timestamp_millis();
    let suffix: u32 = rand::rng().random_range(1000..=9999);
    format!("{millis:x}-{suffix}")
}
