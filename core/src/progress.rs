//! Progress channel for indexing passes.
//!
//! Collaborators call [`ProgressHub::subscribe`] and iterate the returned
//! stream. A stream yields the events of the current (or next) pass and ends
//! when that pass finishes; subscribe again to follow the following pass.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Scanning,
    Indexing,
    Committing,
    Done,
    Cancelled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Cancelled | Phase::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub current_path: Option<String>,
    pub percent: f32,
    pub files_scanned: usize,
    pub files_changed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
pub struct ProgressHub {
    subscribers: Mutex<Vec<Sender<ProgressEvent>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ProgressStream {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        ProgressStream { rx }
    }

    pub fn emit(&self, event: ProgressEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Sends the terminal event and closes every open stream.
    pub fn finish(&self, event: ProgressEvent) {
        let mut subscribers = self.subscribers.lock();
        for tx in subscribers.iter() {
            let _ = tx.send(event.clone());
        }
        subscribers.clear();
    }
}

/// Lazy, finite sequence of the events of one indexing pass.
#[derive(Debug)]
pub struct ProgressStream {
    rx: Receiver<ProgressEvent>,
}

impl Iterator for ProgressStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(phase: Phase) -> ProgressEvent {
        ProgressEvent {
            phase,
            current_path: None,
            percent: 0.0,
            files_scanned: 0,
            files_changed: 0,
            elapsed_ms: 0,
        }
    }

    #[test]
    fn stream_ends_with_the_pass() {
        let hub = ProgressHub::new();
        let stream = hub.subscribe();
        hub.emit(event(Phase::Indexing));
        hub.finish(event(Phase::Done));
        let phases: Vec<Phase> = stream.map(|e| e.phase).collect();
        assert_eq!(phases, vec![Phase::Indexing, Phase::Done]);
    }

    #[test]
    fn resubscribe_follows_next_pass() {
        let hub = ProgressHub::new();
        let first = hub.subscribe();
        hub.finish(event(Phase::Done));
        assert_eq!(first.count(), 1);

        let second = hub.subscribe();
        hub.emit(event(Phase::Scanning));
        hub.finish(event(Phase::Cancelled));
        assert_eq!(second.map(|e| e.phase).last(), Some(Phase::Cancelled));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = ProgressHub::new();
        drop(hub.subscribe());
        hub.emit(event(Phase::Indexing));
        assert!(hub.subscribers.lock().is_empty());
    }
}
