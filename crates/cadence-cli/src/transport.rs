//! File transport between CLI invocations and a running loop.
//!
//! `cadence signal` and `cadence resolve` drop one JSON file per message into
//! `<data_dir>/inbox/`. A message is written under a hidden temporary name and
//! renamed into place, so the loop only ever sees complete files. File names
//! carry a nanosecond stamp; the loop claims files in stamp order and deletes
//! each one after reading it. Assignments go the other way, appended to
//! `<data_dir>/outbox/assignments.jsonl`.

use async_trait::async_trait;
use cadence_core::{CadenceResult, CompletionSignal, ResolutionRequest};
use cadence_orchestrator::{Assignment, WorkerDispatcher};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const SIGNAL_PREFIX: &str = "signal";
pub const RESOLUTION_PREFIX: &str = "resolution";
pub const ASSIGNMENTS_FILE: &str = "assignments.jsonl";

/// Width of the zero-padded stamp in inbox file names.
const STAMP_WIDTH: usize = 20;

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// The stamp of an inbox file named `<prefix>-<stamp>-<id>.json`.
fn stamp_of(name: &str, prefix: &str) -> Option<i64> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    if !rest.ends_with(".json") {
        return None;
    }
    rest.get(..STAMP_WIDTH)?.parse().ok()
}

async fn append_line<T: Serialize + ?Sized>(path: &Path, value: &T) -> CadenceResult<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Inbound queue of signals and resolutions.
pub struct FileInbox {
    dir: PathBuf,
    /// Last stamp this process handed out; stamps never repeat or go back.
    last_stamp: AtomicI64,
}

impl FileInbox {
    pub async fn open(data_dir: &Path) -> CadenceResult<Self> {
        let dir = data_dir.join("inbox");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            last_stamp: AtomicI64::new(0),
        })
    }

    pub async fn push_signal(&self, signal: &CompletionSignal) -> CadenceResult<()> {
        self.deliver(SIGNAL_PREFIX, &signal.to_envelope()).await
    }

    pub async fn push_resolution(&self, request: &ResolutionRequest) -> CadenceResult<()> {
        self.deliver(RESOLUTION_PREFIX, request).await
    }

    fn next_stamp(&self) -> i64 {
        let now = now_nanos();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    /// Write one message to its own file.
    async fn deliver<T: Serialize + ?Sized>(&self, prefix: &str, value: &T) -> CadenceResult<()> {
        let body = serde_json::to_vec(value)?;
        let id = Uuid::new_v4().simple();
        let stamp = self.next_stamp();
        let tmp = self.dir.join(format!(".{prefix}-{id}.tmp"));
        let path = self
            .dir
            .join(format!("{prefix}-{stamp:0width$}-{id}.json", width = STAMP_WIDTH));
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Take every complete `prefix` message stamped before this call, oldest
    /// first.
    ///
    /// A writer stamps its next message only after the previous one is in
    /// place, so cutting off at the current time never skips a message while
    /// taking a later one from the same writer.
    async fn claim(&self, prefix: &str) -> CadenceResult<Vec<String>> {
        let cutoff = now_nanos();
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if stamp_of(&name, prefix).is_some_and(|stamp| stamp < cutoff) {
                names.push(name);
            }
        }
        names.sort();

        let mut bodies = Vec::with_capacity(names.len());
        for name in names {
            let path = self.dir.join(&name);
            let body = match tokio::fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            tokio::fs::remove_file(&path).await?;
            bodies.push(body);
        }
        Ok(bodies)
    }

    /// Claim pending signals. Malformed messages are logged and dropped.
    pub async fn claim_signals(&self) -> CadenceResult<Vec<CompletionSignal>> {
        let mut signals = Vec::new();
        for body in self.claim(SIGNAL_PREFIX).await? {
            match CompletionSignal::from_json(&body) {
                Ok(signal) => signals.push(signal),
                Err(e) => warn!(error = %e, "Malformed signal dropped"),
            }
        }
        Ok(signals)
    }

    /// Claim pending resolutions. Malformed messages are logged and dropped.
    pub async fn claim_resolutions(&self) -> CadenceResult<Vec<ResolutionRequest>> {
        let mut requests = Vec::new();
        for body in self.claim(RESOLUTION_PREFIX).await? {
            match serde_json::from_str::<ResolutionRequest>(&body) {
                Ok(request) => requests.push(request),
                Err(e) => warn!(error = %e, "Malformed resolution dropped"),
            }
        }
        Ok(requests)
    }
}

/// Writes each assignment as a JSON line for external workers to pick up.
pub struct FileDispatcher {
    path: PathBuf,
}

impl FileDispatcher {
    pub async fn open(data_dir: &Path) -> CadenceResult<Self> {
        let dir = data_dir.join("outbox");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            path: dir.join(ASSIGNMENTS_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WorkerDispatcher for FileDispatcher {
    async fn dispatch(&self, assignment: Assignment) -> CadenceResult<()> {
        append_line(&self.path, &assignment).await?;
        info!(
            task_id = %assignment.task_id,
            role = %assignment.role,
            phase = %assignment.phase,
            "Assignment written to outbox"
        );
        Ok(())
    }
}
