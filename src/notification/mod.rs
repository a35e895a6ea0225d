use tokio::sync::broadcast;

use crate::types::Event;

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of monitoring events to any number of subscribers.
///
/// Publishing never blocks; slow subscribers miss the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        log::debug!(
            "event {} entity={} {:?} -> {:?}",
            event.event_type.as_str(),
            event.entity_id,
            event.previous_state,
            event.new_state
        );
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    use crate::types::EventType;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(Event::transition(EventType::AgentStatusUpdate, id, "idle", "busy"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_id, id);
        assert_eq!(event.new_state.as_deref(), Some("busy"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventType::SystemAlert, Uuid::new_v4()));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
