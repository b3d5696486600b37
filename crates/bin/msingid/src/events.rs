//! server event stream
//!
//! Events fan out to WebSocket clients through a bounded broadcast
//! channel. Lagging subscribers lose events; there is no redelivery.
//! Timestamps come from the shared clock and are monotonic per
//! publisher.

use crate::clock::Clock;
use serde::Serialize;
use tokio::sync::broadcast;

/// per-subscriber buffered events before lag drops kick in
pub const EVENT_BUFFER: usize = 256;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "proof:submitted")]
    ProofSubmitted {
        nullifier: String,
        epoch: u64,
        tx_hash: String,
        is_mock: bool,
    },

    #[serde(rename = "packet:invalid")]
    PacketInvalid { reason: String },

    #[serde(rename = "packet:error")]
    PacketError { detail: String },

    #[serde(rename = "registry:updated")]
    RegistryUpdated {
        merkle_root: String,
        leaf_count: u64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub t_ms: u64,
}

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
    clock: Clock,
}

impl EventHub {
    pub fn new(clock: Clock) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx, clock }
    }

    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            kind,
            t_ms: self.clock.now_ms(),
        };
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = Event {
            kind: EventKind::PacketInvalid {
                reason: "stale".into(),
            },
            t_ms: 1234,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"packet:invalid""#));
        assert!(json.contains(r#""reason":"stale""#));
        assert!(json.contains(r#""t_ms":1234"#));
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let hub = EventHub::new(Clock::manual(1_000, 86_400));
        let mut rx = hub.subscribe();

        hub.publish(EventKind::RegistryUpdated {
            merkle_root: "00".into(),
            leaf_count: 1,
        });
        hub.publish(EventKind::PacketError {
            detail: "boom".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first.kind, EventKind::RegistryUpdated { .. }));
        assert!(matches!(second.kind, EventKind::PacketError { .. }));
        assert!(second.t_ms >= first.t_ms);
    }
}
