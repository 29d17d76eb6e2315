use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource broadcast of committed events, backing LISTEN/NOTIFY.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a resource's events. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose last receiver has gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Channel name clients LISTEN on for a resource.
pub fn channel_name(resource_id: Ulid) -> String {
    format!("resource_{resource_id}")
}

/// JSON payload for a NOTIFY message.
pub fn payload(event: &Event) -> String {
    let body = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
    serde_json::json!({ "kind": event.kind(), "event": body }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceStatus;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = Event::ResourceStatusChanged {
            id: rid,
            status: ResourceStatus::Maintenance,
        };
        hub.send(rid, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send(rid, &Event::ResourceStatusChanged { id: rid, status: ResourceStatus::Available });
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let kept = hub.subscribe(Ulid::new());
        drop(hub.subscribe(Ulid::new()));
        assert_eq!(hub.channel_count(), 2);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
        drop(kept);
    }

    #[test]
    fn payload_is_json_with_kind() {
        let rid = Ulid::new();
        let text =
            payload(&Event::ResourceStatusChanged { id: rid, status: ResourceStatus::Rented });
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["kind"], "resource_status_changed");
        assert_eq!(channel_name(rid), format!("resource_{rid}"));
    }
}
