//! Event model: a typed notification channel with multiple observers, per
//! §9 "Event emitter over listeners." Translated from the source's
//! event-emitter pattern to a `tokio::sync::broadcast` channel so multiple
//! test-harness tasks can each `subscribe()`.

use crate::types::SupervisorState;

/// Vestigial replication event names are kept per spec.md §1's note that
/// this subsystem does not implement clustering despite carrying their
/// shape; no component here drives `ReplState`/`Primary` beyond output
/// parsing passing them through.
#[derive(Debug, Clone)]
pub enum Event {
    StateChange(SupervisorState),
    InstanceError(String),
    InstanceStarted,
    InstanceClosed { code: Option<i32>, signal: Option<String> },
    ReplState(String),
    Primary,
}

/// Capacity for the broadcast channel. Generous enough that a slow
/// subscriber during a burst of output-parsed events doesn't lag out.
const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(CHANNEL_CAPACITY);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish best-effort: a channel with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::StateChange(SupervisorState::Starting));
        let event = rx.recv().await.unwrap();
        match event {
            Event::StateChange(SupervisorState::Starting) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::InstanceStarted);
    }
}
