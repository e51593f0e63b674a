use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Machine,
    Image,
    Job,
    Target,
    Session,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Machine,
        EntityKind::Image,
        EntityKind::Job,
        EntityKind::Target,
        EntityKind::Session,
    ];
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Machine => write!(f, "machine"),
            EntityKind::Image => write!(f, "image"),
            EntityKind::Job => write!(f, "job"),
            EntityKind::Target => write!(f, "target"),
            EntityKind::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub state: String,
    /// Strictly increasing per entity, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

struct History {
    sequences: HashMap<(EntityKind, String), u64>,
    recent: VecDeque<StatusEvent>,
}

/// Fan-out of state changes, one broadcast channel per entity type.
///
/// Publishing never blocks: a subscriber that falls more than the channel
/// capacity behind sees `RecvError::Lagged` and should resync from the
/// store. Sequence numbers are assigned and sent under one lock, so each
/// channel carries an entity's events in sequence order.
pub struct EventPublisher {
    channels: HashMap<EntityKind, broadcast::Sender<StatusEvent>>,
    history: Mutex<History>,
    history_limit: usize,
}

impl EventPublisher {
    pub fn new(buffer: usize, history_limit: usize) -> Self {
        let channels = EntityKind::ALL
            .iter()
            .map(|kind| (*kind, broadcast::channel(buffer.max(1)).0))
            .collect();
        Self {
            channels,
            history: Mutex::new(History {
                sequences: HashMap::new(),
                recent: VecDeque::with_capacity(history_limit.min(4096)),
            }),
            history_limit,
        }
    }

    pub fn publish(
        &self,
        kind: EntityKind,
        entity_id: &str,
        state: impl fmt::Display,
        detail: Option<String>,
    ) -> StatusEvent {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("event history mutex poisoned, continuing");
                poisoned.into_inner()
            }
        };
        let seq = history
            .sequences
            .entry((kind, entity_id.to_owned()))
            .or_insert(0);
        *seq += 1;

        let event = StatusEvent {
            entity_type: kind,
            entity_id: entity_id.to_owned(),
            state: state.to_string(),
            sequence: *seq,
            timestamp: Utc::now(),
            detail,
        };
        debug!(
            "{kind} {entity_id} -> {} (seq {})",
            event.state, event.sequence
        );

        if self.history_limit > 0 {
            if history.recent.len() == self.history_limit {
                history.recent.pop_front();
            }
            history.recent.push_back(event.clone());
        }
        if let Some(tx) = self.channels.get(&kind) {
            // No receivers is fine.
            let _ = tx.send(event.clone());
        }
        event
    }

    pub fn subscribe(&self, kind: EntityKind) -> broadcast::Receiver<StatusEvent> {
        match self.channels.get(&kind) {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<StatusEvent> {
        let Ok(history) = self.history.lock() else {
            return Vec::new();
        };
        let skip = history.recent.len().saturating_sub(limit);
        history.recent.iter().skip(skip).cloned().collect()
    }

    /// Drop the sequence counter of an entity that no longer exists.
    pub fn forget(&self, kind: EntityKind, entity_id: &str) {
        if let Ok(mut history) = self.history.lock() {
            history.sequences.remove(&(kind, entity_id.to_owned()));
        }
    }

    pub fn latest_sequence(&self, kind: EntityKind, entity_id: &str) -> Option<u64> {
        let history = self.history.lock().ok()?;
        history
            .sequences
            .get(&(kind, entity_id.to_owned()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn sequences_are_per_entity() {
        let events = EventPublisher::new(16, 16);
        let mut rx = events.subscribe(EntityKind::Session);

        events.publish(EntityKind::Session, "s1", "starting", None);
        events.publish(EntityKind::Session, "s2", "starting", None);
        events.publish(EntityKind::Session, "s1", "active", None);
        events.publish(EntityKind::Machine, "M1", "online", None);

        let seen: Vec<(String, u64)> = (0..3)
            .map(|_| rx.try_recv().unwrap())
            .map(|e| (e.entity_id, e.sequence))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("s1".to_owned(), 1),
                ("s2".to_owned(), 1),
                ("s1".to_owned(), 2)
            ]
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(events.latest_sequence(EntityKind::Session, "s1"), Some(2));
        assert_eq!(events.latest_sequence(EntityKind::Machine, "M1"), Some(1));
        assert_eq!(events.latest_sequence(EntityKind::Image, "x"), None);

        events.forget(EntityKind::Session, "s1");
        assert_eq!(events.latest_sequence(EntityKind::Session, "s1"), None);
        assert_eq!(events.latest_sequence(EntityKind::Session, "s2"), Some(1));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let events = EventPublisher::new(2, 0);
        let mut rx = events.subscribe(EntityKind::Job);
        for i in 0..5 {
            events.publish(EntityKind::Job, "j1", format!("p{i}"), None);
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.sequence, 4);
    }

    #[test]
    fn history_ring_keeps_latest() {
        let events = EventPublisher::new(4, 3);
        for i in 1..=5 {
            events.publish(EntityKind::Image, "win11", format!("s{i}"), None);
        }
        let recent = events.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].sequence, 3);
        assert_eq!(recent[2].sequence, 5);
        assert_eq!(events.recent(1)[0].state, "s5");
    }

    #[test]
    fn publish_without_subscribers() {
        let events = EventPublisher::new(4, 4);
        let e = events.publish(
            EntityKind::Target,
            "M1-win11",
            "active",
            Some("attached".to_owned()),
        );
        assert_eq!(e.sequence, 1);
        assert_eq!(e.detail.as_deref(), Some("attached"));
    }

    #[test]
    fn event_wire_shape() {
        let events = EventPublisher::new(4, 4);
        let e = events.publish(EntityKind::Session, "abc", "active", None);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["entity_type"], "session");
        assert_eq!(json["entity_id"], "abc");
        assert_eq!(json["sequence"], 1);
        assert!(json.get("detail").is_none());
    }
}
