//! In-process message bus with consumer groups and leases.
//!
//! Each topic is an append-only log. Each consumer group keeps a cursor into
//! the log, a table of leased (pending) deliveries and a queue of nacked
//! deliveries. A receive call serves, in order: leases that ran out, nacked
//! deliveries, then new log entries. Leases are measured with
//! `tokio::time::Instant`, so tests running with a paused clock can advance
//! straight past a visibility timeout.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::{BusError, Delivery, MessageBus, Subscription, TaskEvent};
use crate::retry::deadline_after;

#[derive(Debug)]
struct Lease {
    deadline: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: BTreeMap<usize, Lease>,
    nacked: VecDeque<usize>,
}

#[derive(Debug, Default)]
struct TopicState {
    log: Vec<TaskEvent>,
    groups: HashMap<String, GroupState>,
}

/// Thread-safe in-memory [`MessageBus`].
///
/// New consumer groups start at the beginning of the topic, so events
/// published before a worker starts are still processed.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, TopicState>>,
    notify: Notify,
}

impl InMemoryBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event ever published to `topic`.
    pub fn published(&self, topic: &str) -> Vec<TaskEvent> {
        self.topics
            .lock()
            .get(topic)
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }

    /// Returns how many deliveries `group` holds leased or nacked on `topic`.
    pub fn outstanding(&self, topic: &str, group: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .and_then(|state| state.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Leases whatever is available right now. Returns the batch and the
    /// earliest lease deadline still outstanding.
    fn try_lease(&self, sub: &Subscription) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut topics = self.topics.lock();
        let topic = topics.entry(sub.topic.clone()).or_default();
        let TopicState { log, groups } = topic;
        let group = groups.entry(sub.group.clone()).or_default();

        let mut offsets: Vec<usize> = group
            .pending
            .iter()
            .filter(|(offset, lease)| lease.deadline <= now && !group.nacked.contains(*offset))
            .map(|(offset, _)| *offset)
            .take(sub.batch_size)
            .collect();
        while offsets.len() < sub.batch_size {
            match group.nacked.pop_front() {
                Some(offset) => offsets.push(offset),
                None => break,
            }
        }
        while offsets.len() < sub.batch_size && group.cursor < log.len() {
            offsets.push(group.cursor);
            group.cursor += 1;
        }

        let mut batch = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let lease = group.pending.entry(offset).or_insert(Lease {
                deadline: now,
                delivery_count: 0,
            });
            lease.deadline = deadline_after(now, sub.lease);
            lease.delivery_count += 1;
            batch.push(Delivery {
                topic: sub.topic.clone(),
                group: sub.group.clone(),
                delivery_id: offset.to_string(),
                event: log[offset].clone(),
                delivery_count: lease.delivery_count,
            });
        }

        let next_deadline = group
            .pending
            .iter()
            .filter(|(offset, _)| !group.nacked.contains(*offset))
            .map(|(_, lease)| lease.deadline)
            .min();
        (batch, next_deadline)
    }

    fn parse_offset(delivery: &Delivery) -> Result<usize, BusError> {
        delivery
            .delivery_id
            .parse()
            .map_err(|_| BusError::TransientConsume {
                topic: delivery.topic.clone(),
                message: format!("unknown delivery id {}", delivery.delivery_id),
            })
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> Result<String, BusError> {
        let offset = {
            let mut topics = self.topics.lock();
            let state = topics.entry(topic.to_string()).or_default();
            state.log.push(event.clone());
            state.log.len() - 1
        };
        self.notify.notify_waiters();
        tracing::trace!(topic, offset, correlation_id = %event.correlation_id, "event published");
        Ok(offset.to_string())
    }

    async fn receive(&self, subscription: &Subscription) -> Result<Vec<Delivery>, BusError> {
        let give_up = deadline_after(Instant::now(), subscription.wait);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_deadline) = self.try_lease(subscription);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= give_up {
                return Ok(Vec::new());
            }
            let wake_at = next_deadline.map_or(give_up, |deadline| deadline.min(give_up));
            tokio::select! {
                () = &mut notified => {},
                () = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let offset = Self::parse_offset(delivery)?;
        let mut topics = self.topics.lock();
        if let Some(group) = topics
            .get_mut(&delivery.topic)
            .and_then(|state| state.groups.get_mut(&delivery.group))
        {
            group.pending.remove(&offset);
            group.nacked.retain(|o| *o != offset);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let offset = Self::parse_offset(delivery)?;
        {
            let mut topics = self.topics.lock();
            if let Some(group) = topics
                .get_mut(&delivery.topic)
                .and_then(|state| state.groups.get_mut(&delivery.group))
            {
                if group.pending.contains_key(&offset) && !group.nacked.contains(&offset) {
                    group.nacked.push_back(offset);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
