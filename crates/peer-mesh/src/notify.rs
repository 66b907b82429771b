use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{ConnectionId, PeerConnectionRecord};

/// Published whenever a connection record changes or disappears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Destroyed {
        id: ConnectionId,
        previous: PeerConnectionRecord,
    },
    Updated {
        id: ConnectionId,
        previous: PeerConnectionRecord,
        current: PeerConnectionRecord,
    },
}

impl ConnectionEvent {
    pub fn destroyed(previous: PeerConnectionRecord) -> Self {
        ConnectionEvent::Destroyed {
            id: previous.id.clone(),
            previous,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        match self {
            ConnectionEvent::Destroyed { id, .. } | ConnectionEvent::Updated { id, .. } => id,
        }
    }
}

/// Fan-out of [`ConnectionEvent`]s. Publishing with no subscribers is not
/// an error.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ConnectionEvent) {
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::trace!(receivers, "published connection event");
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionState;

    #[tokio::test]
    async fn subscribers_see_destroy_with_previous_snapshot() {
        let notifier = Notifier::default();
        let mut sub = notifier.subscribe();
        let record = PeerConnectionRecord {
            id: ConnectionId::from("c1"),
            initiator: "a".into(),
            endpoint: "b".into(),
            state: ConnectionState::Established,
        };
        notifier.publish(ConnectionEvent::destroyed(record.clone()));
        match sub.recv().await.unwrap() {
            ConnectionEvent::Destroyed { id, previous } => {
                assert_eq!(id, record.id);
                assert_eq!(previous, record);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn publish_without_subscribers_is_silent() {
        let notifier = Notifier::new(4);
        notifier.publish(ConnectionEvent::destroyed(PeerConnectionRecord {
            id: ConnectionId::from("c1"),
            initiator: "a".into(),
            endpoint: "b".into(),
            state: ConnectionState::Reserved,
        }));
    }
}
