//! Topic → listener bookkeeping and inbound dispatch.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::protocol::InboundEvent;

/// Callback invoked for every inbound event on a subscribed topic.
///
/// Registering the same `Arc` twice on a topic is a no-op.
pub type Listener = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

pub(crate) type ListenerId = u64;

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: HashMap<String, Vec<(ListenerId, Listener)>>,
    /// Never reset, so a handle from before `clear()` cannot remove a newer listener.
    next_id: ListenerId,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `listener` on `topic`. Returns the listener id and whether the
    /// topic entry was created by this call.
    pub(crate) fn add(&mut self, topic: &str, listener: Listener) -> (ListenerId, bool) {
        let created = !self.topics.contains_key(topic);
        let entry = self.topics.entry(topic.to_string()).or_default();
        if let Some((id, _)) = entry.iter().find(|(_, l)| Arc::ptr_eq(l, &listener)) {
            return (*id, created);
        }
        self.next_id += 1;
        let id = self.next_id;
        entry.push((id, listener));
        (id, created)
    }

    /// Remove one listener. Returns `true` when the topic entry went away with it.
    pub(crate) fn remove(&mut self, topic: &str, id: ListenerId) -> bool {
        let Some(entry) = self.topics.get_mut(topic) else {
            return false;
        };
        entry.retain(|(lid, _)| *lid != id);
        if entry.is_empty() {
            self.topics.remove(topic);
            return true;
        }
        false
    }

    pub(crate) fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Snapshot of registered topics, for resubscribe-all.
    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Snapshot of a topic's listeners in registration order.
    pub(crate) fn listeners(&self, topic: &str) -> Vec<Listener> {
        self.topics
            .get(topic)
            .map(|entry| entry.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.topics.len()
    }

    pub(crate) fn clear(&mut self) {
        self.topics.clear();
    }
}

/// Invoke every listener in order. A panicking listener is logged and skipped;
/// the rest still run. Returns how many listeners panicked.
pub(crate) fn dispatch(listeners: &[Listener], event: &InboundEvent) -> usize {
    let mut failed = 0;
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            failed += 1;
            tracing::error!(topic = %event.topic, id = ?event.id, "topic listener panicked");
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn event(topic: &str) -> InboundEvent {
        InboundEvent {
            topic: topic.to_string(),
            payload: serde_json::json!(1),
            id: None,
            timestamp: 0,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Listener {
        let log = Arc::clone(log);
        Arc::new(move |_: &InboundEvent| log.lock().unwrap().push(name))
    }

    #[test]
    fn first_listener_creates_topic() {
        let mut reg = SubscriptionRegistry::new();
        let noop: Listener = Arc::new(|_: &InboundEvent| {});
        let (_, created) = reg.add("t", Arc::clone(&noop));
        assert!(created);
        let (_, created) = reg.add("t", Arc::new(|_: &InboundEvent| {}));
        assert!(!created);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn same_arc_is_deduplicated() {
        let mut reg = SubscriptionRegistry::new();
        let l: Listener = Arc::new(|_: &InboundEvent| {});
        let (a, _) = reg.add("t", Arc::clone(&l));
        let (b, _) = reg.add("t", Arc::clone(&l));
        assert_eq!(a, b);
        assert_eq!(reg.listeners("t").len(), 1);
    }

    #[test]
    fn last_removal_deletes_topic() {
        let mut reg = SubscriptionRegistry::new();
        let (a, _) = reg.add("t", Arc::new(|_: &InboundEvent| {}));
        let (b, _) = reg.add("t", Arc::new(|_: &InboundEvent| {}));
        assert!(!reg.remove("t", a));
        assert!(reg.contains("t"));
        assert!(reg.remove("t", b));
        assert!(!reg.contains("t"));
        assert_eq!(reg.len(), 0);
        // removing again is harmless
        assert!(!reg.remove("t", b));
    }

    #[test]
    fn ids_survive_clear() {
        let mut reg = SubscriptionRegistry::new();
        let (old, _) = reg.add("t", Arc::new(|_: &InboundEvent| {}));
        reg.clear();
        let (new, _) = reg.add("t", Arc::new(|_: &InboundEvent| {}));
        assert_ne!(old, new);
        assert!(!reg.remove("t", old));
        assert!(reg.contains("t"));
    }

    #[test]
    fn dispatch_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = SubscriptionRegistry::new();
        reg.add("t", recorder(&log, "first"));
        reg.add("t", recorder(&log, "second"));
        reg.add("u", recorder(&log, "other"));

        dispatch(&reg.listeners("t"), &event("t"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert!(reg.listeners("nope").is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = SubscriptionRegistry::new();
        reg.add(
            "t",
            Arc::new(|e: &InboundEvent| {
                if e.topic == "t" {
                    panic!("listener bug");
                }
            }),
        );
        reg.add("t", recorder(&log, "survivor"));

        let failed = dispatch(&reg.listeners("t"), &event("t"));
        assert_eq!(failed, 1);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }
}
