//! The outbound command queue.
//!
//! The queue is the single serialization point for state-changing SOAP
//! requests to one renderer. Enqueueing deduplicates by command kind: a
//! burst of SetVolume calls collapses to the newest one, and two rapid
//! ToggleMute calls cancel each other entirely.

use std::collections::VecDeque;
use std::mem::discriminant;
use std::sync::{Condvar, Mutex};

use crate::model::MediaData;

/// One unit of work for the queue worker.
#[derive(Clone, Debug)]
pub enum SessionCommand {
    Play,
    Pause,
    Stop,
    Seek { ticks: i64 },
    /// Desired volume, already in device scale.
    SetVolume { device_value: i64 },
    Mute,
    Unmute,
    ToggleMute,
    /// Load and play an item (§ media change protocol).
    SetMedia { media: MediaData },
    /// Pipeline the following item without touching current playback.
    SetNextMedia { media: MediaData },
}

impl SessionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionCommand::Play => "Play",
            SessionCommand::Pause => "Pause",
            SessionCommand::Stop => "Stop",
            SessionCommand::Seek { .. } => "Seek",
            SessionCommand::SetVolume { .. } => "SetVolume",
            SessionCommand::Mute => "Mute",
            SessionCommand::Unmute => "Unmute",
            SessionCommand::ToggleMute => "ToggleMute",
            SessionCommand::SetMedia { .. } => "SetMedia",
            SessionCommand::SetNextMedia { .. } => "SetNextMedia",
        }
    }
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<SessionCommand>,
    disposed: bool,
}

/// FIFO with kind-level deduplication. `pop_wait` blocks until a command
/// is available or the queue is disposed.
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    signal: Condvar,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue {
            inner: Mutex::new(QueueInner::default()),
            signal: Condvar::new(),
        }
    }

    /// Append a command, collapsing any pending command of the same kind.
    ///
    /// ToggleMute is special: it removes a pending ToggleMute instead of
    /// replacing it, so two rapid toggles net out to nothing.
    pub fn enqueue(&self, command: SessionCommand) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return;
        }

        if matches!(command, SessionCommand::ToggleMute) {
            let before = inner.pending.len();
            inner
                .pending
                .retain(|c| !matches!(c, SessionCommand::ToggleMute));
            if inner.pending.len() < before {
                // Cancelled out a pending toggle.
                return;
            }
        } else {
            let kind = discriminant(&command);
            inner.pending.retain(|c| discriminant(c) != kind);
        }

        inner.pending.push_back(command);
        drop(inner);
        self.signal.notify_one();
    }

    /// Block until a command is available; None once disposed.
    pub fn pop_wait(&self) -> Option<SessionCommand> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.disposed {
                return None;
            }
            if let Some(command) = inner.pending.pop_front() {
                return Some(command);
            }
            inner = self.signal.wait(inner).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain and shut down; wakes any blocked worker.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disposed = true;
        inner.pending.clear();
        drop(inner);
        self.signal.notify_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().unwrap().disposed
    }

    /// Current contents, front first.
    pub fn pending_snapshot(&self) -> Vec<SessionCommand> {
        self.inner.lock().unwrap().pending.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(queue: &CommandQueue) -> Vec<&'static str> {
        queue.pending_snapshot().iter().map(|c| c.kind()).collect()
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = CommandQueue::new();
        queue.enqueue(SessionCommand::Stop);
        queue.enqueue(SessionCommand::Play);
        queue.enqueue(SessionCommand::Seek { ticks: 1 });
        assert_eq!(kinds(&queue), ["Stop", "Play", "Seek"]);
    }

    #[test]
    fn same_kind_is_deduplicated_to_newest() {
        let queue = CommandQueue::new();
        queue.enqueue(SessionCommand::SetVolume { device_value: 10 });
        queue.enqueue(SessionCommand::SetVolume { device_value: 20 });
        queue.enqueue(SessionCommand::SetVolume { device_value: 30 });
        queue.enqueue(SessionCommand::SetVolume { device_value: 40 });

        let pending = queue.pending_snapshot();
        assert_eq!(pending.len(), 1);
        match &pending[0] {
            SessionCommand::SetVolume { device_value } => assert_eq!(*device_value, 40),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn dedup_moves_command_to_the_back() {
        let queue = CommandQueue::new();
        queue.enqueue(SessionCommand::SetVolume { device_value: 10 });
        queue.enqueue(SessionCommand::Pause);
        queue.enqueue(SessionCommand::SetVolume { device_value: 20 });
        assert_eq!(kinds(&queue), ["Pause", "SetVolume"]);
    }

    #[test]
    fn never_two_entries_of_same_kind() {
        let queue = CommandQueue::new();
        for ticks in 0..50 {
            queue.enqueue(SessionCommand::Seek { ticks });
            queue.enqueue(SessionCommand::Play);
        }
        let mut seen = std::collections::HashSet::new();
        for command in queue.pending_snapshot() {
            assert!(seen.insert(command.kind()), "duplicate {}", command.kind());
        }
    }

    #[test]
    fn rapid_toggle_mute_cancels_out() {
        let queue = CommandQueue::new();
        queue.enqueue(SessionCommand::ToggleMute);
        queue.enqueue(SessionCommand::ToggleMute);
        assert!(queue.is_empty());

        // A third toggle is a fresh request.
        queue.enqueue(SessionCommand::ToggleMute);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_returns_front_and_none_after_dispose() {
        let queue = CommandQueue::new();
        queue.enqueue(SessionCommand::Play);
        assert!(matches!(queue.pop_wait(), Some(SessionCommand::Play)));

        queue.dispose();
        assert!(queue.pop_wait().is_none());
        // Enqueue after dispose is a no-op.
        queue.enqueue(SessionCommand::Play);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_wait_wakes_on_enqueue() {
        use std::sync::Arc;
        let queue = Arc::new(CommandQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop_wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.enqueue(SessionCommand::Pause);
        let got = popper.join().unwrap();
        assert!(matches!(got, Some(SessionCommand::Pause)));
    }
}
