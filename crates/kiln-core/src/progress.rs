//! Per-job progress publication with snapshot-then-live subscriptions.
//!
//! Each job owns an append-only event log summarized as a checklist (the
//! latest event per `(variant, step)` in first-seen order) plus an optional
//! summary and terminal event. Publishing and subscribing take the same
//! per-job lock, so a subscriber's snapshot and its live receiver never
//! overlap or leave a gap.

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub type JobId = Uuid;

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Step,
    Summary,
    Completed,
    Failed,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub variant: Option<usize>,
    pub step: String,
    pub status: String,
    pub is_error: bool,
    /// `mm:ss` since the job started
    pub elapsed: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub kind: EventKind,
}

fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[derive(Default)]
struct StreamState {
    sequence: u64,
    checklist: Vec<ProgressEvent>,
    summary: Option<ProgressEvent>,
    terminal: Option<ProgressEvent>,
}

impl StreamState {
    fn snapshot(&self) -> Vec<ProgressEvent> {
        let mut events = self.checklist.clone();
        events.extend(self.summary.iter().cloned());
        events.extend(self.terminal.iter().cloned());
        events
    }

    fn record(&mut self, event: &ProgressEvent) {
        match event.kind {
            EventKind::Step => {
                match self
                    .checklist
                    .iter_mut()
                    .find(|e| e.variant == event.variant && e.step == event.step)
                {
                    Some(existing) => *existing = event.clone(),
                    None => self.checklist.push(event.clone()),
                }
            }
            EventKind::Summary => self.summary = Some(event.clone()),
            EventKind::Completed | EventKind::Failed => self.terminal = Some(event.clone()),
        }
    }
}

struct JobStream {
    job_id: JobId,
    started: Instant,
    state: Mutex<StreamState>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl JobStream {
    fn new(job_id: JobId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            job_id,
            started: Instant::now(),
            state: Mutex::new(StreamState::default()),
            sender,
        }
    }

    fn publish(
        &self,
        kind: EventKind,
        variant: Option<usize>,
        step: &str,
        status: &str,
        is_error: bool,
    ) -> Option<ProgressEvent> {
        let Ok(mut state) = self.state.lock() else {
            log::error!("Progress state poisoned for job {}", self.job_id);
            return None;
        };

        if let Some(terminal) = &state.terminal {
            log::debug!(
                "Dropping progress for finished job {} ({:?}): {}",
                self.job_id,
                terminal.kind,
                step
            );
            return None;
        }

        state.sequence += 1;
        let event = ProgressEvent {
            job_id: self.job_id,
            variant,
            step: step.to_string(),
            status: status.to_string(),
            is_error,
            elapsed: format_elapsed(self.started.elapsed().as_secs()),
            timestamp: Utc::now(),
            sequence: state.sequence,
            kind,
        };
        state.record(&event);

        // No receivers is fine; late subscribers read the snapshot
        let _ = self.sender.send(event.clone());
        Some(event)
    }

    fn snapshot(&self) -> Vec<ProgressEvent> {
        self.state
            .lock()
            .map(|state| state.snapshot())
            .unwrap_or_default()
    }

    fn subscribe(&self) -> (Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        match self.state.lock() {
            Ok(state) => (state.snapshot(), self.sender.subscribe()),
            Err(_) => (Vec::new(), self.sender.subscribe()),
        }
    }
}

/// Registry of per-job progress streams
pub struct ProgressChannel {
    streams: RwLock<HashMap<JobId, Arc<JobStream>>>,
    capacity: usize,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Live buffer size per subscriber before it is resynchronized
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a job; its clock starts now
    pub fn open(&self, job_id: JobId) {
        self.stream(job_id);
    }

    fn stream(&self, job_id: JobId) -> Arc<JobStream> {
        if let Ok(streams) = self.streams.read() {
            if let Some(stream) = streams.get(&job_id) {
                return stream.clone();
            }
        }
        match self.streams.write() {
            Ok(mut streams) => streams
                .entry(job_id)
                .or_insert_with(|| Arc::new(JobStream::new(job_id, self.capacity)))
                .clone(),
            Err(_) => Arc::new(JobStream::new(job_id, self.capacity)),
        }
    }

    fn existing(&self, job_id: &JobId) -> Option<Arc<JobStream>> {
        self.streams.read().ok()?.get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.existing(job_id).is_some()
    }

    /// Publish a checklist step update
    pub fn publish(
        &self,
        job_id: JobId,
        variant: Option<usize>,
        step: &str,
        status: &str,
        is_error: bool,
    ) -> Option<ProgressEvent> {
        self.stream(job_id)
            .publish(EventKind::Step, variant, step, status, is_error)
    }

    pub fn publish_summary(&self, job_id: JobId, status: &str) -> Option<ProgressEvent> {
        self.stream(job_id)
            .publish(EventKind::Summary, None, "Summary", status, false)
    }

    /// Publish the final event. Later publications for the job are dropped.
    pub fn publish_terminal(
        &self,
        job_id: JobId,
        kind: EventKind,
        status: &str,
    ) -> Option<ProgressEvent> {
        if !kind.is_terminal() {
            log::warn!("publish_terminal called with non-terminal kind {:?}", kind);
            return None;
        }
        let is_error = kind == EventKind::Failed;
        self.stream(job_id)
            .publish(kind, None, "Result", status, is_error)
    }

    /// Latest state of every step plus any summary and terminal event
    pub fn snapshot(&self, job_id: &JobId) -> Option<Vec<ProgressEvent>> {
        self.existing(job_id).map(|stream| stream.snapshot())
    }

    /// Snapshot first, then live events; ends after the terminal event
    pub fn subscribe(&self, job_id: &JobId) -> Option<ProgressStream> {
        let job_stream = self.existing(job_id)?;
        let (snapshot, mut receiver) = job_stream.subscribe();

        let events = async_stream::stream! {
            let mut last_sequence = 0u64;

            for event in snapshot {
                last_sequence = last_sequence.max(event.sequence);
                let terminal = event.kind.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }

            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.sequence <= last_sequence {
                            continue;
                        }
                        last_sequence = event.sequence;
                        let terminal = event.kind.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "Progress subscriber for job {} lagged by {} events, resynchronizing",
                            job_stream.job_id,
                            skipped
                        );
                        let mut missed: Vec<ProgressEvent> = job_stream
                            .snapshot()
                            .into_iter()
                            .filter(|e| e.sequence > last_sequence)
                            .collect();
                        missed.sort_by_key(|e| e.sequence);
                        for event in missed {
                            last_sequence = event.sequence;
                            let terminal = event.kind.is_terminal();
                            yield event;
                            if terminal {
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        };

        Some(Box::pin(events))
    }

    /// Bind a reporter to one job (and optionally one variant)
    pub fn reporter(self: &Arc<Self>, job_id: JobId, variant: Option<usize>) -> ProgressReporter {
        ProgressReporter {
            channel: self.clone(),
            job_id,
            variant,
        }
    }
}

/// Convenience handle for publishing steps of one job or variant
#[derive(Clone)]
pub struct ProgressReporter {
    channel: Arc<ProgressChannel>,
    job_id: JobId,
    variant: Option<usize>,
}

impl ProgressReporter {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn step(&self, step: &str, status: &str) {
        self.channel
            .publish(self.job_id, self.variant, step, status, false);
    }

    pub fn error(&self, step: &str, status: &str) {
        self.channel
            .publish(self.job_id, self.variant, step, status, true);
    }
}
