// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multi-topic in-process pub/sub with per-subscriber bounded queues.
//!
//! Publishing never blocks on a slow consumer (unless the topic's policy is
//! `block`): when a subscriber's queue is full the per-topic drop policy
//! applies and a drop counter advances. Subscribers observe messages in
//! enqueue order; there is no cross-topic ordering guarantee.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Core topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    DeviceSnapshot,
    AlertWarning,
    AlertResolved,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceSnapshot => "DEVICE_SNAPSHOT",
            Self::AlertWarning => "ALERT_WARNING",
            Self::AlertResolved => "ALERT_RESOLVED",
        }
    }

    pub const ALL: [Topic; 3] = [Self::DeviceSnapshot, Self::AlertWarning, Self::AlertResolved];
}

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    #[default]
    DropOldest,
    DropNewest,
    Block,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TopicPolicy {
    pub queue_maxsize: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
}

impl Default for TopicPolicy {
    fn default() -> Self {
        Self { queue_maxsize: 100, drop_policy: DropPolicy::DropOldest }
    }
}

struct SubscriberQueue<T> {
    queue: parking_lot::Mutex<VecDeque<T>>,
    maxsize: usize,
    policy: DropPolicy,
    notify: Notify,
    space: Notify,
    closed: AtomicBool,
}

impl<T> SubscriberQueue<T> {
    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

struct TopicState<T> {
    policy: TopicPolicy,
    subscribers: Vec<Arc<SubscriberQueue<T>>>,
    dropped: Arc<AtomicU64>,
}

impl<T> TopicState<T> {
    fn new(policy: TopicPolicy) -> Self {
        Self { policy, subscribers: Vec::new(), dropped: Arc::new(AtomicU64::new(0)) }
    }
}

/// Receiving end of a subscription. Dropping it detaches the queue.
pub struct Subscription<T> {
    inner: Arc<SubscriberQueue<T>>,
}

impl<T> Subscription<T> {
    /// Receive the next message. Returns `None` once the hub is closed and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(message) = self.inner.queue.lock().pop_front() {
                self.inner.space.notify_one();
                return Some(message);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        let message = self.inner.queue.lock().pop_front();
        if message.is_some() {
            self.inner.space.notify_one();
        }
        message
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        // Unblock any publisher waiting for space on this queue; the stored
        // permit covers a publisher that has not started waiting yet.
        self.inner.space.notify_one();
    }
}

/// Per-topic statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub subscriber_count: usize,
    pub queue_lengths: Vec<usize>,
    pub queue_maxsize: usize,
    pub drop_policy: DropPolicy,
    pub total_dropped: u64,
}

/// In-memory pub/sub hub.
pub struct PubSub<T: Clone + Send + 'static> {
    topics: parking_lot::Mutex<HashMap<Topic, TopicState<T>>>,
    closed: AtomicBool,
}

impl<T: Clone + Send + 'static> Default for PubSub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> PubSub<T> {
    pub fn new() -> Self {
        Self { topics: parking_lot::Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// Set queue bounds and drop policy for a topic. Applies to new
    /// subscriptions.
    pub fn set_topic_policy(&self, topic: Topic, policy: TopicPolicy) {
        let mut topics = self.topics.lock();
        topics.entry(topic).or_insert_with(|| TopicState::new(policy)).policy = policy;
    }

    /// Register a subscriber with its own bounded queue.
    pub fn subscribe(&self, topic: Topic) -> Subscription<T> {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic).or_insert_with(|| TopicState::new(TopicPolicy::default()));
        let queue = Arc::new(SubscriberQueue {
            queue: parking_lot::Mutex::new(VecDeque::new()),
            maxsize: state.policy.queue_maxsize,
            policy: state.policy.drop_policy,
            notify: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
        });
        state.subscribers.push(Arc::clone(&queue));
        Subscription { inner: queue }
    }

    /// Deliver a message to every current subscriber of the topic, applying
    /// the drop policy on full queues.
    pub async fn publish(&self, topic: Topic, message: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Iterate a snapshot of subscribers so a concurrent subscribe/drop
        // cannot invalidate the walk; prune detached queues in passing.
        let (subscribers, dropped) = {
            let mut topics = self.topics.lock();
            let Some(state) = topics.get_mut(&topic) else {
                return;
            };
            state.subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
            (state.subscribers.clone(), Arc::clone(&state.dropped))
        };

        for subscriber in subscribers {
            self.deliver(&subscriber, &dropped, message.clone()).await;
        }
    }

    async fn deliver(
        &self,
        subscriber: &Arc<SubscriberQueue<T>>,
        dropped: &Arc<AtomicU64>,
        message: T,
    ) {
        loop {
            {
                let mut queue = subscriber.queue.lock();
                if queue.len() < subscriber.maxsize {
                    queue.push_back(message);
                    subscriber.notify.notify_one();
                    return;
                }
                match subscriber.policy {
                    DropPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(message);
                        dropped.fetch_add(1, Ordering::Relaxed);
                        subscriber.notify.notify_one();
                        return;
                    }
                    DropPolicy::DropNewest => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    DropPolicy::Block => {}
                }
            }
            // Block policy: wait for the consumer to free a slot.
            if subscriber.closed.load(Ordering::Acquire) {
                return;
            }
            subscriber.space.notified().await;
        }
    }

    pub fn get_dropped_count(&self, topic: Topic) -> u64 {
        self.topics
            .lock()
            .get(&topic)
            .map(|state| state.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Reset drop counters, returning the previous values.
    pub fn reset_dropped_counts(&self) -> HashMap<Topic, u64> {
        let topics = self.topics.lock();
        topics
            .iter()
            .map(|(topic, state)| (*topic, state.dropped.swap(0, Ordering::Relaxed)))
            .collect()
    }

    pub fn get_topic_stats(&self, topic: Topic) -> Option<TopicStats> {
        let topics = self.topics.lock();
        let state = topics.get(&topic)?;
        let live: Vec<_> =
            state.subscribers.iter().filter(|s| !s.closed.load(Ordering::Acquire)).collect();
        Some(TopicStats {
            subscriber_count: live.len(),
            queue_lengths: live.iter().map(|s| s.len()).collect(),
            queue_maxsize: state.policy.queue_maxsize,
            drop_policy: state.policy.drop_policy,
            total_dropped: state.dropped.load(Ordering::Relaxed),
        })
    }

    /// Detach all subscribers and clear state. Publishing afterwards is a
    /// no-op; subscribers drain what they already have, then see end-of-stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut topics = self.topics.lock();
        for state in topics.values_mut() {
            for subscriber in &state.subscribers {
                subscriber.closed.store(true, Ordering::Release);
                // notify_one stores a permit: a consumer or blocked publisher
                // that has not yet registered still observes the close.
                subscriber.notify.notify_one();
                subscriber.space.notify_one();
            }
            state.subscribers.clear();
        }
        topics.clear();
        info!("pubsub closed");
    }
}

/// Periodic task that logs and resets per-topic drop counters.
pub async fn drop_metrics_loop<T: Clone + Send + 'static>(
    pubsub: Arc<PubSub<T>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }
        for (topic, dropped) in pubsub.reset_dropped_counts() {
            if dropped > 0 {
                debug!(topic = topic.as_str(), dropped, "messages dropped since last report");
            }
        }
    }
}

#[cfg(test)]
#[path = "pubsub_tests.rs"]
mod tests;
