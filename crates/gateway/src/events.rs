use std::sync::atomic::{AtomicU64, Ordering};

use {
    clawgate_protocol::EventFrame,
    serde::Serialize,
    serde_json::{Value, json},
    tokio::sync::broadcast,
    tracing::trace,
};

const BUS_CAPACITY: usize = 256;

/// Push notices fanned out to every connected WebSocket client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    Tick,
    ConfigReloaded {
        hot_paths: Vec<String>,
        actions: Vec<String>,
        restart: bool,
    },
    ConfigInvalid {
        message: String,
        issues: Vec<String>,
    },
    TurnStarted {
        agent_id: String,
        session_key: String,
    },
    TurnFinished {
        agent_id: String,
        session_key: String,
        ok: bool,
    },
    SessionReset {
        session_key: String,
        session_id: String,
    },
    Outbound {
        channel: String,
        peer: String,
        content: String,
    },
    System {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Shutdown {
        restart: bool,
    },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::ConfigReloaded { .. } => "config.reloaded",
            Self::ConfigInvalid { .. } => "config.invalid",
            Self::TurnStarted { .. } => "turn.started",
            Self::TurnFinished { .. } => "turn.finished",
            Self::SessionReset { .. } => "session.reset",
            Self::Outbound { .. } => "channel.outbound",
            Self::System { .. } => "system-event",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            // Externally tagged: unwrap the single variant field.
            Ok(Value::Object(mut map)) if map.len() == 1 => map
                .values_mut()
                .next()
                .map(Value::take)
                .unwrap_or(Value::Null),
            _ => json!({}),
        }
    }
}

/// Sequenced broadcast of [`GatewayEvent`]s. Slow subscribers lag and skip.
pub struct EventBus {
    tx: broadcast::Sender<EventFrame>,
    seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish to current subscribers; returns how many received it.
    pub fn publish(&self, event: GatewayEvent) -> usize {
        let frame = EventFrame::new(event.name(), event.payload(), self.next_seq());
        trace!(event = %frame.event, seq = frame.seq, "event published");
        self.tx.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_are_sequenced_and_flattened() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(GatewayEvent::Tick);
        bus.publish(GatewayEvent::SessionReset {
            session_key: "agent:main:main".into(),
            session_id: "s2".into(),
        });

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.event, "tick");
        assert_eq!(tick.seq, 1);
        assert_eq!(tick.payload, json!({}));

        let reset = rx.recv().await.unwrap();
        assert_eq!(reset.event, "session.reset");
        assert_eq!(reset.seq, 2);
        assert_eq!(reset.payload["sessionKey"], "agent:main:main");
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(GatewayEvent::Tick), 0);
        assert_eq!(bus.next_seq(), 2);
    }
}
