//! Redis Streams message bus.
//!
//! [`RedisStreamBus`] maps the [`MessageBus`] contract onto Redis Streams:
//!
//! | Operation | Redis |
//! |-----------|-------|
//! | publish   | `XADD {topic} * event <json>` |
//! | receive   | `XAUTOCLAIM` for lease-expired entries, then `XREADGROUP ... >` |
//! | ack       | `XACK` |
//! | nack      | `XCLAIM ... IDLE <lease>` so the next `XAUTOCLAIM` picks it up |
//!
//! Consumer groups are created on first use with `XGROUP CREATE ... 0
//! MKSTREAM`, so a group sees events published before it existed.
//!
//! # Usage
//!
//! ```rust,no_run
//! use taskbridge::bus::redis::RedisStreamBus;
//!
//! # async fn example() {
//! let bus = RedisStreamBus::new("redis://127.0.0.1:6379").await.unwrap();
//! # }
//! ```

use std::collections::HashSet;

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamClaimOptions, StreamId,
    StreamReadOptions, StreamReadReply,
};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bus::{BusError, Delivery, MessageBus, Subscription, TaskEvent};

/// Stream entry field holding the JSON-encoded event.
const EVENT_FIELD: &str = "event";

/// Redis Streams [`MessageBus`].
#[derive(Clone)]
pub struct RedisStreamBus {
    conn: MultiplexedConnection,
    groups: std::sync::Arc<Mutex<HashSet<(String, String)>>>,
}

impl std::fmt::Debug for RedisStreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBus").finish_non_exhaustive()
    }
}

impl RedisStreamBus {
    /// Connects to Redis at `url`.
    ///
    /// # Errors
    ///
    /// [`BusError::TransientConsume`] if the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, BusError> {
        let connect_error = |e: ::redis::RedisError| BusError::TransientConsume {
            topic: String::new(),
            message: format!("failed to connect to Redis: {e}"),
        };
        let client = ::redis::Client::open(url).map_err(connect_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connect_error)?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            groups: std::sync::Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BusError> {
        let id = (topic.to_string(), group.to_string());
        if self.groups.lock().contains(&id) {
            return Ok(());
        }
        let created: Result<(), ::redis::RedisError> = self
            .conn
            .clone()
            .xgroup_create_mkstream(topic, group, "0")
            .await;
        match created {
            Ok(()) => {
                tracing::debug!(topic, group, "consumer group created");
            },
            Err(e) if e.code() == Some("BUSYGROUP") => {},
            Err(e) => return Err(consume_error(topic, &e)),
        }
        self.groups.lock().insert(id);
        Ok(())
    }

    /// Decodes stream entries. Entries without a decodable event are acked
    /// and dropped so they cannot wedge the group.
    async fn decode_entries(
        &self,
        sub: &Subscription,
        entries: Vec<StreamId>,
        delivery_count: u32,
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            let decoded = entry
                .get::<String>(EVENT_FIELD)
                .ok_or_else(|| format!("missing '{EVENT_FIELD}' field"))
                .and_then(|raw| TaskEvent::decode(raw.as_bytes()).map_err(|e| e.to_string()));
            match decoded {
                Ok(event) => deliveries.push(Delivery {
                    topic: sub.topic.clone(),
                    group: sub.group.clone(),
                    delivery_id: entry.id,
                    event,
                    delivery_count,
                }),
                Err(reason) => {
                    tracing::warn!(
                        topic = %sub.topic,
                        entry_id = %entry.id,
                        %reason,
                        "dropping malformed stream entry"
                    );
                    let acked: Result<i64, ::redis::RedisError> = self
                        .conn
                        .clone()
                        .xack(&sub.topic, &sub.group, &[&entry.id])
                        .await;
                    if let Err(e) = acked {
                        tracing::debug!(error = %e, "failed to ack malformed entry");
                    }
                },
            }
        }
        deliveries
    }
}

fn consume_error(topic: &str, err: &::redis::RedisError) -> BusError {
    BusError::TransientConsume {
        topic: topic.to_string(),
        message: err.to_string(),
    }
}

fn millis(duration: std::time::Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX)
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> Result<String, BusError> {
        let encoded = String::from_utf8(event.encode()?).map_err(|e| BusError::TransientPublish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
        let id: String = self
            .conn
            .clone()
            .xadd(topic, "*", &[(EVENT_FIELD, encoded)])
            .await
            .map_err(|e| BusError::TransientPublish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        tracing::trace!(topic, entry_id = %id, correlation_id = %event.correlation_id, "event published");
        Ok(id)
    }

    async fn receive(&self, sub: &Subscription) -> Result<Vec<Delivery>, BusError> {
        self.ensure_group(&sub.topic, &sub.group).await?;

        let reclaimed: StreamAutoClaimReply = self
            .conn
            .clone()
            .xautoclaim_options(
                &sub.topic,
                &sub.group,
                &sub.consumer,
                millis(sub.lease),
                "0-0",
                StreamAutoClaimOptions::default().count(sub.batch_size),
            )
            .await
            .map_err(|e| consume_error(&sub.topic, &e))?;
        // XAUTOCLAIM does not report delivery counts; 2 is a lower bound.
        let mut deliveries = self.decode_entries(sub, reclaimed.claimed, 2).await;
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }

        let options = StreamReadOptions::default()
            .group(&sub.group, &sub.consumer)
            .count(sub.batch_size)
            .block(millis(sub.wait));
        let reply: Option<StreamReadReply> = self
            .conn
            .clone()
            .xread_options(&[&sub.topic], &[">"], &options)
            .await
            .map_err(|e| consume_error(&sub.topic, &e))?;

        for key in reply.map(|r| r.keys).unwrap_or_default() {
            deliveries.extend(self.decode_entries(sub, key.ids, 1).await);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let _: i64 = self
            .conn
            .clone()
            .xack(&delivery.topic, &delivery.group, &[&delivery.delivery_id])
            .await
            .map_err(|e| consume_error(&delivery.topic, &e))?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError> {
        // Backdating the idle time past any sane lease makes the entry
        // eligible for the next XAUTOCLAIM immediately.
        let options = StreamClaimOptions::default().idle(millis(std::time::Duration::from_secs(
            365 * 24 * 60 * 60,
        )));
        let _: ::redis::Value = self
            .conn
            .clone()
            .xclaim_options(
                &delivery.topic,
                &delivery.group,
                "nack",
                0,
                &[&delivery.delivery_id],
                options,
            )
            .await
            .map_err(|e| consume_error(&delivery.topic, &e))?;
        Ok(())
    }
}
