use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::FileState;

/// Events emitted while a file moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stage {
        state: FileState,
        message: String,
    },
    Rows {
        state: FileState,
        processed: u64,
    },
    Completed {
        state: FileState,
    },
    Failed {
        error: String,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests and headless runs.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// A progress event tagged with the file it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub file_id: String,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Forwards events to a broadcast channel. Sending with no subscribers is
/// not an error.
pub struct BroadcastProgress {
    file_id: String,
    sender: Arc<broadcast::Sender<ProgressUpdate>>,
}

impl BroadcastProgress {
    pub fn new(file_id: &str, sender: Arc<broadcast::Sender<ProgressUpdate>>) -> Self {
        Self {
            file_id: file_id.to_string(),
            sender,
        }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.sender.send(ProgressUpdate {
            file_id: self.file_id.clone(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_progress_tags_file() {
        let (tx, mut rx) = broadcast::channel(8);
        let progress = BroadcastProgress::new("file-1", Arc::new(tx));

        progress.report(ProgressEvent::Rows {
            state: FileState::Parsing,
            processed: 500,
        });

        let update = rx.try_recv().unwrap();
        assert_eq!(update.file_id, "file-1");
        assert_eq!(
            update.event,
            ProgressEvent::Rows {
                state: FileState::Parsing,
                processed: 500
            }
        );
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let (tx, rx) = broadcast::channel(8);
        drop(rx);
        let progress = BroadcastProgress::new("file-1", Arc::new(tx));
        progress.report(ProgressEvent::Failed {
            error: "boom".into(),
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let update = ProgressUpdate {
            file_id: "f".into(),
            event: ProgressEvent::Completed {
                state: FileState::Loaded,
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "completed");
        assert_eq!(json["state"], "loaded");
        assert_eq!(json["file_id"], "f");
    }
}
