//! Topic fan-out for dispatched packets.
//!
//! Every packet that passes the filter is published to a fixed, ordered list
//! of topics derived from its classification:
//!
//! 1. `"any"` - every dispatched packet
//! 2. the packet's `type`
//! 3. its `superType`, when non-empty
//! 4. its `subType`, when non-empty
//! 5. `"raw"` - deprecated alias of `"any"`
//!
//! Subscribers on one topic run in subscription order.
//!
//! # Deadlock Prevention
//!
//! Callbacks for a topic are collected under the router lock, then the lock
//! is released before they run. A callback may therefore subscribe or
//! unsubscribe without deadlocking; the change applies from the next topic on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::constants::{TOPIC_ANY, TOPIC_RAW};
use crate::packet::PacketEnvelope;

/// Callback invoked with each packet published on a topic.
pub type PacketCallback = Arc<dyn Fn(&Arc<PacketEnvelope>) + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    callback: PacketCallback,
    once: bool,
}

/// Topics `packet` is published on, in emission order.
#[must_use]
pub fn topics_for(packet: &PacketEnvelope) -> Vec<&str> {
    let mut topics = Vec::with_capacity(5);
    topics.push(TOPIC_ANY);
    topics.push(packet.packet_type.as_str());
    if !packet.super_type.is_empty() {
        topics.push(packet.super_type.as_str());
    }
    if !packet.sub_type.is_empty() {
        topics.push(packet.sub_type.as_str());
    }
    topics.push(TOPIC_RAW);
    topics
}

/// Registry of topic subscriptions.
#[derive(Default)]
pub struct EventRouter {
    /// Topic -> subscriptions in subscription order.
    subscriptions: HashMap<String, Vec<Subscription>>,
    next_id: u64,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("topic_count", &self.subscriptions.len())
            .field("total_subscriptions", &self.subscription_count())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl EventRouter {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, topic: &str, callback: PacketCallback, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id, callback, once });

        log::debug!("[Router] Registered subscription '{}' for '{}'", id, topic);
        id
    }

    /// Subscribe `callback` to `topic`.
    pub fn subscribe(&mut self, topic: &str, callback: PacketCallback) -> SubscriptionId {
        self.insert(topic, callback, false)
    }

    /// Subscribe `callback` to the next packet on `topic` only.
    pub fn subscribe_once(&mut self, topic: &str, callback: PacketCallback) -> SubscriptionId {
        self.insert(topic, callback, true)
    }

    /// Remove a subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for subs in self.subscriptions.values_mut() {
            if let Some(idx) = subs.iter().position(|s| s.id == id) {
                subs.remove(idx);
                removed = true;
                break;
            }
        }
        self.subscriptions.retain(|_, subs| !subs.is_empty());
        if removed {
            log::debug!("[Router] Unregistered subscription '{}'", id);
        }
        removed
    }

    /// Whether `topic` has any subscriber.
    #[must_use]
    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.subscriptions.get(topic).is_some_and(|s| !s.is_empty())
    }

    /// Total number of subscriptions across all topics.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.values().map(Vec::len).sum()
    }

    /// Callbacks for `topic` in subscription order, dropping one-shot entries.
    fn take_callbacks(&mut self, topic: &str) -> Vec<PacketCallback> {
        let Some(subs) = self.subscriptions.get_mut(topic) else {
            return Vec::new();
        };
        let callbacks = subs.iter().map(|s| Arc::clone(&s.callback)).collect();
        subs.retain(|s| !s.once);
        if subs.is_empty() {
            self.subscriptions.remove(topic);
        }
        callbacks
    }
}

/// Router shared between the session (subscribers) and the pipeline (publisher).
#[derive(Debug, Clone, Default)]
pub struct SharedRouter {
    inner: Arc<Mutex<EventRouter>>,
}

impl SharedRouter {
    /// Empty shared router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventRouter> {
        self.inner.lock().expect("router mutex poisoned")
    }

    /// Subscribe a closure to `topic`.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<PacketEnvelope>) + Send + Sync + 'static,
    {
        self.lock().subscribe(topic, Arc::new(callback))
    }

    /// Remove a subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().unsubscribe(id)
    }

    /// Receiver resolving with the next packet published on `topic`.
    pub fn once(&self, topic: &str) -> oneshot::Receiver<Arc<PacketEnvelope>> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.lock().subscribe_once(
            topic,
            Arc::new(move |packet: &Arc<PacketEnvelope>| {
                if let Some(tx) = tx.lock().expect("once sender mutex poisoned").take() {
                    let _ = tx.send(Arc::clone(packet));
                }
            }),
        );
        rx
    }

    /// Whether `topic` has any subscriber.
    #[must_use]
    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.lock().has_subscribers(topic)
    }

    /// Total number of subscriptions across all topics.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock().subscription_count()
    }

    /// Publish `packet` on each of its topics in order.
    ///
    /// Returns the number of callbacks invoked.
    pub fn publish(&self, packet: &Arc<PacketEnvelope>) -> usize {
        let mut invoked = 0;
        for topic in topics_for(packet) {
            let callbacks = self.lock().take_callbacks(topic);
            for callback in callbacks {
                callback(packet);
                invoked += 1;
            }
        }
        invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(packet_type: &str, sub_type: &str, super_type: &str) -> Arc<PacketEnvelope> {
        let json = serde_json::json!({
            "opcode": 1,
            "type": packet_type,
            "subType": sub_type,
            "superType": super_type,
        });
        Arc::new(PacketEnvelope::decode(&json.to_string()).unwrap())
    }

    fn recorder(router: &SharedRouter, topics: &[&str]) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for topic in topics {
            let log = Arc::clone(&log);
            let name = (*topic).to_string();
            router.subscribe(topic, move |_| log.lock().unwrap().push(name.clone()));
        }
        log
    }

    #[test]
    fn test_topics_for_full_classification() {
        let p = packet("T", "S", "P");
        assert_eq!(topics_for(&p), vec!["any", "T", "P", "S", "raw"]);
    }

    #[test]
    fn test_topics_for_skips_empty_levels() {
        let p = packet("T", "", "");
        assert_eq!(topics_for(&p), vec!["any", "T", "raw"]);
    }

    #[test]
    fn test_publish_order() {
        let router = SharedRouter::new();
        let log = recorder(&router, &["raw", "S", "P", "T", "any"]);

        let invoked = router.publish(&packet("T", "S", "P"));

        assert_eq!(invoked, 5);
        assert_eq!(*log.lock().unwrap(), vec!["any", "T", "P", "S", "raw"]);
    }

    #[test]
    fn test_multiple_subscribers_in_subscription_order() {
        let router = SharedRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            router.subscribe("any", move |_| log.lock().unwrap().push(i));
        }

        router.publish(&packet("T", "", ""));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unsubscribe() {
        let router = SharedRouter::new();
        let log = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&log);
        let id = router.subscribe("T", move |_| *counter.lock().unwrap() += 1);

        router.publish(&packet("T", "", ""));
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        router.publish(&packet("T", "", ""));

        assert_eq!(*log.lock().unwrap(), 1);
        assert!(!router.has_subscribers("T"));
        assert_eq!(router.subscription_count(), 0);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let router = SharedRouter::new();
        let mut rx = router.once("T");
        assert!(router.has_subscribers("T"));

        let first = packet("T", "", "");
        router.publish(&first);
        router.publish(&packet("T", "", ""));

        let received = rx.try_recv().unwrap();
        assert!(Arc::ptr_eq(&received, &first));
        assert!(!router.has_subscribers("T"));
    }

    #[test]
    fn test_callback_may_subscribe_during_publish() {
        let router = SharedRouter::new();
        let inner = router.clone();
        let hits = Arc::new(Mutex::new(0));
        let hits_in = Arc::clone(&hits);
        router.subscribe("any", move |_| {
            let hits = Arc::clone(&hits_in);
            inner.subscribe("raw", move |_| *hits.lock().unwrap() += 1);
        });

        router.publish(&packet("T", "", ""));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_subscription_id_display() {
        let mut router = EventRouter::new();
        let id = router.subscribe("any", Arc::new(|_: &Arc<PacketEnvelope>| {}));
        assert_eq!(id.to_string(), "sub_0");
    }
}
