use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

const SINK_CAPACITY: usize = 256;

/// One item on a session's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// SSE comment line (`: text`), used for greetings and heartbeats.
    Comment(String),
    /// SSE `data:` event carrying a JSON-RPC message.
    Message(Value),
}

#[derive(Debug)]
enum SinkState {
    Detached,
    Attached {
        generation: u64,
        sender: mpsc::Sender<SinkEvent>,
    },
}

/// The single outbound event stream of a session. At most one subscriber is live; attaching
/// again replaces (and thereby ends) the previous stream.
#[derive(Debug)]
pub struct EventSink {
    state: Mutex<SinkState>,
    attachments: Mutex<u64>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self {
            state: Mutex::new(SinkState::Detached),
            attachments: Mutex::new(0),
        }
    }
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self) -> ReceiverStream<SinkEvent> {
        let (sender, receiver) = mpsc::channel(SINK_CAPACITY);
        let generation = {
            let mut attachments = lock(&self.attachments);
            *attachments += 1;
            *attachments
        };
        let previous = std::mem::replace(
            &mut *lock(&self.state),
            SinkState::Attached { generation, sender },
        );
        if let SinkState::Attached { generation, .. } = previous {
            tracing::debug!(replaced_generation = generation, "event sink replaced");
        }
        ReceiverStream::new(receiver)
    }

    /// Whether a subscriber is attached and has not gone away.
    pub fn is_open(&self) -> bool {
        let mut state = lock(&self.state);
        let open = match &*state {
            SinkState::Attached { sender, .. } => !sender.is_closed(),
            SinkState::Detached => return false,
        };
        if !open {
            *state = SinkState::Detached;
        }
        open
    }

    /// Pushes an event if a subscriber is open. Returns whether it was queued.
    pub fn push(&self, event: SinkEvent) -> bool {
        let mut state = lock(&self.state);
        let (sent, generation) = match &*state {
            SinkState::Attached { sender, generation } => (sender.try_send(event), *generation),
            SinkState::Detached => return false,
        };
        match sent {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(generation = generation, "event sink full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                *state = SinkState::Detached;
                false
            }
        }
    }

    /// Ends the current stream, if any.
    pub fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *lock(&self.state), SinkState::Detached);
        matches!(previous, SinkState::Attached { .. })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
