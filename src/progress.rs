//! Progress & Log Channel (C8): a thread-safe, append-only observation stream. Every writer
//! gets a cloned [`tokio::sync::broadcast::Sender`]; consumers subscribe independently and
//! never block producers. Every event is also mirrored through `tracing` so an operator can
//! watch logs without wiring up a channel subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::{CourseId, Source};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub thread: String,
    pub level: Level,
    pub stage: Stage,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Start,
    WorkerLaunched,
    CourseCompleted,
    IngestionStart,
    Done,
    FileDownloading,
    FileOk,
    FileFailed,
}

#[derive(Clone)]
pub struct ProgressChannel {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, level: Level, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        let event = ProgressEvent {
            timestamp: Utc::now(),
            thread: current_thread_label(),
            level,
            stage,
            message: message.clone(),
        };
        match level {
            Level::Info => info!(stage = ?stage, "{message}"),
            Level::Warn => warn!(stage = ?stage, "{message}"),
            Level::Error => tracing::error!(stage = ?stage, "{message}"),
        }
        // A lagging or absent subscriber must never block a producer; broadcast::send only
        // fails when there are no receivers at all, which is a valid, non-fatal state.
        let _ = self.sender.send(event);
    }

    pub fn course_completed(&self, course_id: CourseId, source: Source, downloaded: usize) {
        self.emit(
            Level::Info,
            Stage::CourseCompleted,
            format!("course {course_id} ({source}) done: {downloaded} new files"),
        );
    }

    pub fn file_event(&self, stage: Stage, filename: &str) {
        self.emit(Level::Info, stage, filename.to_string());
    }
}

fn current_thread_label() -> String {
    std::thread::current()
        .name()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{:?}", std::thread::current().id()))
}
