//! In-process topic-keyed publish/subscribe hub.
//!
//! A single [`Bus`] is shared (behind an `Arc`) by every ingress task and
//! every consumer task. Each subscriber owns an independent bounded
//! delivery queue; a slow subscriber drops messages rather than blocking
//! the publisher or any other subscriber.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sgm_protocol::{Envelope, Message, Topic};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// Per-subscription queue depth. A publisher never blocks past this.
const QUEUE_DEPTH: usize = 256;

/// Which topics a subscription wants.
#[derive(Debug, Clone)]
pub enum Topics {
    /// The `*` wildcard: every topic.
    All,
    Set(HashSet<Topic>),
}

impl Topics {
    pub fn one(topic: Topic) -> Self {
        Topics::Set(HashSet::from([topic]))
    }

    fn matches(&self, topic: Topic) -> bool {
        match self {
            Topics::All => true,
            Topics::Set(set) => set.contains(&topic),
        }
    }
}

/// Opaque handle returned by [`Bus::subscribe`], used to [`Bus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    topics: Topics,
    tx: mpsc::Sender<Envelope>,
}

/// A subscriber's inbound queue, as returned by [`Bus::subscribe`].
pub struct Subscription {
    pub id: SubscriptionId,
    pub rx: mpsc::Receiver<Envelope>,
}

/// The process-wide pub/sub singleton. Construct one with [`Bus::new`]
/// before any ingress task starts; every ingress and consumer holds a
/// clone of the `Arc<Bus>`.
pub struct Bus {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Arc<Bus> {
        Arc::new(Bus {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Subscribes to the given topic set, returning a handle and its queue.
    pub async fn subscribe(&self, topics: Topics) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        self.entries.write().await.push(Entry { id, topics, tx });
        Subscription { id, rx }
    }

    /// Enqueues `message` under `topic` to every matching subscription.
    ///
    /// Delivery to a single subscriber never blocks the publisher: a full
    /// queue is dropped and logged; a subscriber whose queue has been
    /// closed (it unsubscribed or was dropped) is pruned lazily.
    pub async fn publish(&self, topic: Topic, message: Message) {
        let envelope = Envelope::new(topic, message);
        let mut stale = Vec::new();
        {
            let entries = self.entries.read().await;
            for entry in entries.iter().filter(|e| e.topics.matches(topic)) {
                match entry.tx.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscription = entry.id.0, %topic, "bus: subscriber queue full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale.push(entry.id);
                    }
                }
            }
        }
        if !stale.is_empty() {
            let mut entries = self.entries.write().await;
            entries.retain(|e| !stale.contains(&e.id));
        }
    }

    /// Closes the subscription's queue; the subscriber's next read signals
    /// end-of-stream.
    pub async fn unsubscribe(&self, handle: SubscriptionId) {
        self.entries.write().await.retain(|e| e.id != handle);
    }

    /// Closes every live subscription. Called after ingress has been
    /// cancelled so every consumer observes clean end-of-stream.
    pub async fn shutdown(&self) {
        self.entries.write().await.clear();
    }

    #[cfg(test)]
    async fn subscriber_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgm_protocol::{Timestamp, SENDER_ME};

    fn msg(text: &str) -> Message {
        Message::new(Timestamp::ZERO, SENDER_ME, text)
    }

    #[tokio::test]
    async fn wildcard_subscriber_receives_every_topic() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topics::All).await;

        bus.publish('1', msg("")).await;
        bus.publish('G', msg("gps")).await;

        let first = sub.rx.recv().await.unwrap();
        assert_eq!(first.topic, '1');
        let second = sub.rx.recv().await.unwrap();
        assert_eq!(second.topic, 'G');
    }

    #[tokio::test]
    async fn topic_subscriber_only_receives_matching_topic() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topics::one('G')).await;

        bus.publish('1', msg("connect")).await;
        bus.publish('G', msg("gps")).await;

        let only = sub.rx.recv().await.unwrap();
        assert_eq!(only.topic, 'G');
        assert_eq!(only.message.text, "gps");
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_subscriber() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topics::All).await;
        for i in 0..5 {
            bus.publish('p', msg(&i.to_string())).await;
        }
        for i in 0..5 {
            let env = sub.rx.recv().await.unwrap();
            assert_eq!(env.message.text, i.to_string());
        }
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_queue() {
        let bus = Bus::new();
        let sub = bus.subscribe(Topics::All).await;
        let id = sub.id;
        let mut rx = sub.rx;
        bus.unsubscribe(id).await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn a_full_queue_drops_for_that_subscriber_without_blocking_others() {
        let bus = Bus::new();
        let slow = bus.subscribe(Topics::All).await;
        let mut fast = bus.subscribe(Topics::All).await;

        // Overflow the slow subscriber's queue; the fast one still gets
        // every message because publish() never awaits a full queue.
        for i in 0..(QUEUE_DEPTH + 10) {
            bus.publish('p', msg(&i.to_string())).await;
        }

        let mut fast_count = 0;
        while fast.rx.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(fast_count, QUEUE_DEPTH + 10);
        drop(slow);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = Bus::new();
        let sub = bus.subscribe(Topics::All).await;
        drop(sub);
        bus.publish('1', msg("")).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
