//! Broadcast + history store for clone progress events.

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Number of events kept for late subscribers.
const HISTORY_LIMIT: usize = 1024;

/// Progress notification emitted while a clone operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloneEvent {
    /// Block progress, e.g. "Cloning from radio" 3/16.
    Status {
        message: String,
        current: u32,
        max: u32,
    },
    /// Free-form driver log line.
    Log { message: String },
    /// An operation finished.
    Finished { ok: bool },
}

impl std::fmt::Display for CloneEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status {
                message,
                current,
                max,
            } => write!(f, "{message}: {current}/{max}"),
            Self::Log { message } => f.write_str(message),
            Self::Finished { ok: true } => f.write_str("finished"),
            Self::Finished { ok: false } => f.write_str("failed"),
        }
    }
}

/// Progress store with broadcast and history support.
///
/// Subscribers that attach mid-operation receive the history first and
/// then live events.
pub struct ProgressStore {
    history: RwLock<VecDeque<CloneEvent>>,
    sender: broadcast::Sender<CloneEvent>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HISTORY_LIMIT);
        Self {
            history: RwLock::new(VecDeque::with_capacity(32)),
            sender,
        }
    }

    /// Create a shared store.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: CloneEvent) {
        let _ = self.sender.send(event.clone());

        let Ok(mut history) = self.history.write() else {
            return;
        };
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Push block progress.
    pub fn push_status(&self, message: impl Into<String>, current: u32, max: u32) {
        self.push(CloneEvent::Status {
            message: message.into(),
            current,
            max,
        });
    }

    /// Push a log line.
    pub fn push_log(&self, message: impl Into<String>) {
        self.push(CloneEvent::Log {
            message: message.into(),
        });
    }

    /// Push an operation outcome.
    pub fn push_finished(&self, ok: bool) {
        self.push(CloneEvent::Finished { ok });
    }

    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<CloneEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn get_history(&self) -> Vec<CloneEvent> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, CloneEvent> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let store = ProgressStore::new();
        for i in 0..(HISTORY_LIMIT as u32 + 10) {
            store.push_status("Cloning from radio", i, 0);
        }
        let history = store.get_history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(
            history[0],
            CloneEvent::Status {
                message: "Cloning from radio".into(),
                current: 10,
                max: 0
            }
        );
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = ProgressStore::shared();
        store.push_log("entering programming mode");

        let mut stream = store.history_plus_stream();
        store.push_finished(true);

        assert_eq!(
            stream.next().await,
            Some(CloneEvent::Log {
                message: "entering programming mode".into()
            })
        );
        assert_eq!(stream.next().await, Some(CloneEvent::Finished { ok: true }));
    }

    #[test]
    fn test_event_display() {
        let event = CloneEvent::Status {
            message: "Cloning to radio".into(),
            current: 3,
            max: 16,
        };
        assert_eq!(event.to_string(), "Cloning to radio: 3/16");
    }
}
