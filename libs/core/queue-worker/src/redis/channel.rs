use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{append, classify, dead_letter, promote_due, RedisSettings, StoredEntry};
use crate::channel::{ChannelAdapter, Connector, Delivery, DeliveryTag};
use crate::error::ChannelError;
use crate::job::Resolution;

/// Longest single server-side block; long waits are split into slices
const MAX_BLOCK: Duration = Duration::from_millis(250);

/// Read size when no prefetch window is configured
const UNBOUNDED_BATCH: usize = 16;

type StreamReply = Vec<(String, Vec<(String, Vec<(String, String)>)>)>;

/// Opens [`RedisChannel`]s from one client
#[derive(Clone)]
pub struct RedisConnector {
    client: redis::Client,
    settings: Arc<RedisSettings>,
}

impl RedisConnector {
    pub fn new(settings: RedisSettings) -> Result<Self, ChannelError> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| ChannelError::fatal(format!("invalid Redis URL: {e}")))?;
        Ok(Self {
            client,
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Channel = RedisChannel;

    async fn open_channel(&self, connection: &str) -> Result<RedisChannel, ChannelError> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| ChannelError::fatal(format!("failed to connect to Redis: {e}")))?;
        info!(connection, "Connected to Redis");
        Ok(RedisChannel::new(conn, Arc::clone(&self.settings)))
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    queue: String,
    consumer_tag: String,
    /// Ready streams, highest priority first
    streams: Vec<(String, u8)>,
}

/// A consumer on one Redis queue
pub struct RedisChannel {
    conn: ConnectionManager,
    settings: Arc<RedisSettings>,
    prefetch_count: u16,
    subscription: Option<Subscription>,
    /// Read from the group but not yet handed out
    buffer: VecDeque<Delivery>,
    /// Handed out and not yet settled
    outstanding: HashSet<DeliveryTag>,
    outstanding_deliveries: Vec<Delivery>,
    recovering: bool,
    cancelled: bool,
    closed: bool,
}

impl RedisChannel {
    pub fn new(conn: ConnectionManager, settings: Arc<RedisSettings>) -> Self {
        Self {
            conn,
            settings,
            prefetch_count: 0,
            subscription: None,
            buffer: VecDeque::new(),
            outstanding: HashSet::new(),
            outstanding_deliveries: Vec::new(),
            recovering: false,
            cancelled: false,
            closed: false,
        }
    }

    fn has_capacity(&self) -> bool {
        self.prefetch_count == 0 || self.outstanding.len() < usize::from(self.prefetch_count)
    }

    fn batch_size(&self) -> usize {
        match self.prefetch_count {
            0 => UNBOUNDED_BATCH,
            count => usize::from(count)
                .saturating_sub(self.outstanding.len() + self.buffer.len())
                .max(1),
        }
    }

    fn hand_out(&mut self) -> Option<Delivery> {
        if !self.has_capacity() {
            return None;
        }
        let delivery = self.buffer.pop_front()?;
        self.outstanding.insert(delivery.tag.clone());
        self.outstanding_deliveries.push(delivery.clone());
        Some(delivery)
    }

    async fn ensure_group(&mut self, stream: &str) -> Result<(), ChannelError> {
        // Try to create the group, ignore error if it already exists
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.settings.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream, group = %self.settings.consumer_group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    stream,
                    group = %self.settings.consumer_group,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    /// XREADGROUP over `streams`; `id` is `0` for own pending entries, `>` for new ones
    async fn read_group(
        &mut self,
        subscription: &Subscription,
        streams: &[&str],
        id: &str,
        block: Option<Duration>,
    ) -> Result<Vec<Delivery>, ChannelError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.consumer_group)
            .arg(&subscription.consumer_tag);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("COUNT").arg(self.batch_size()).arg("STREAMS");
        for stream in streams {
            cmd.arg(*stream);
        }
        for _ in streams {
            cmd.arg(id);
        }

        let result: RedisResult<Option<StreamReply>> = cmd.query_async(&mut self.conn).await;
        let reply = match result {
            Ok(reply) => reply.unwrap_or_default(),
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!(
                    queue = %subscription.queue,
                    "Consumer group removed, consumer cancelled by broker"
                );
                self.cancelled = true;
                return Ok(Vec::new());
            }
            Err(e) => return Err(classify(e)),
        };

        let mut deliveries = Vec::new();
        for (stream, entries) in reply {
            for (stream_id, fields) in entries {
                match StoredEntry::from_fields(&fields) {
                    Some(entry) => deliveries.push(Delivery {
                        tag: DeliveryTag {
                            source: stream.clone(),
                            id: stream_id,
                        },
                        job_id: entry.id.clone(),
                        published_at: entry.published_at(),
                        body: entry.job,
                        priority: entry.priority,
                        attempts: entry.attempts + 1,
                        timeout: entry.timeout_ms.map(Duration::from_millis),
                        redelivered: id == "0",
                    }),
                    None => {
                        warn!(
                            stream = %stream,
                            stream_id = %stream_id,
                            fields = ?fields.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                            "Malformed queue entry, moving to dead letters"
                        );
                        self.discard_malformed(subscription, &stream, &stream_id, &fields)
                            .await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn discard_malformed(
        &mut self,
        subscription: &Subscription,
        stream: &str,
        stream_id: &str,
        fields: &[(String, String)],
    ) -> Result<(), ChannelError> {
        if self.settings.dead_letter {
            let raw = fields
                .iter()
                .find(|(key, _)| key == "job")
                .map(|(_, value)| value.clone())
                .unwrap_or_default();
            let entry = StoredEntry::new(raw, 0, None);
            dead_letter(&mut self.conn, &self.settings, &subscription.queue, &entry).await?;
        }
        self.ack_and_delete(stream, stream_id).await
    }

    async fn ack_and_delete(&mut self, stream: &str, stream_id: &str) -> Result<(), ChannelError> {
        let () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(stream)
            .arg(&self.settings.consumer_group)
            .arg(stream_id)
            .ignore()
            .cmd("XDEL")
            .arg(stream)
            .arg(stream_id)
            .ignore()
            .query_async(&mut self.conn)
            .await
            .map_err(classify)?;

        debug!(stream, stream_id, "Acknowledged entry");
        Ok(())
    }

    /// Put a delivery back at the tail of its stream
    async fn requeue(&mut self, delivery: &Delivery, delivered: bool) -> Result<(), ChannelError> {
        let entry = StoredEntry::from_delivery(delivery, delivered);
        append(&mut self.conn, &delivery.tag.source, &entry).await?;
        self.ack_and_delete(&delivery.tag.source, &delivery.tag.id).await
    }

    async fn requeue_unsettled(&mut self, include_outstanding: bool) -> Result<(), ChannelError> {
        let buffered: Vec<Delivery> = self.buffer.drain(..).collect();
        for delivery in &buffered {
            self.requeue(delivery, false).await?;
        }

        if include_outstanding {
            let outstanding = std::mem::take(&mut self.outstanding_deliveries);
            self.outstanding.clear();
            for delivery in &outstanding {
                self.requeue(delivery, true).await?;
            }
            if !outstanding.is_empty() {
                info!(count = outstanding.len(), "Requeued unsettled deliveries");
            }
        }
        Ok(())
    }

    /// Re-append entries a previous run of this consumer left unsettled
    ///
    /// The lost delivery counts as an attempt and is persisted with the entry,
    /// so a job that keeps taking the worker down still runs out of tries.
    async fn recover_pending(
        &mut self,
        subscription: &Subscription,
        streams: &[&str],
    ) -> Result<(), ChannelError> {
        let mut recovered = 0;
        loop {
            let pending = self.read_group(subscription, streams, "0", None).await?;
            if pending.is_empty() {
                break;
            }
            for delivery in &pending {
                self.requeue(delivery, true).await?;
            }
            recovered += pending.len();
        }

        self.recovering = false;
        if recovered > 0 {
            warn!(
                count = recovered,
                consumer_tag = %subscription.consumer_tag,
                "Recovered deliveries left pending by a previous run"
            );
        }
        Ok(())
    }

    /// Fill the buffer with the next batch, returning false when nothing was read
    async fn fill(
        &mut self,
        subscription: &Subscription,
        deadline: Instant,
    ) -> Result<bool, ChannelError> {
        promote_due(&mut self.conn, &self.settings, &subscription.queue).await?;

        let all: Vec<&str> = subscription.streams.iter().map(|(s, _)| s.as_str()).collect();

        if self.recovering {
            self.recover_pending(subscription, &all).await?;
        }

        // Highest priority stream with ready entries wins
        for stream in &all {
            let batch = self.read_group(subscription, &[*stream], ">", None).await?;
            if !batch.is_empty() {
                self.buffer.extend(batch);
                return Ok(true);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || self.cancelled {
            return Ok(false);
        }
        let mut batch = self
            .read_group(subscription, &all, ">", Some(remaining.min(MAX_BLOCK)))
            .await?;
        batch.sort_by(|a, b| b.priority.cmp(&a.priority));
        let filled = !batch.is_empty();
        self.buffer.extend(batch);
        Ok(filled)
    }
}

#[async_trait]
impl ChannelAdapter for RedisChannel {
    async fn set_qos(
        &mut self,
        prefetch_size: u32,
        prefetch_count: u16,
    ) -> Result<(), ChannelError> {
        if prefetch_size > 0 {
            debug!(
                prefetch_size,
                "Byte-based prefetch is not supported by Redis streams, ignoring"
            );
        }
        self.prefetch_count = prefetch_count;
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        priority: Option<u8>,
    ) -> Result<(), ChannelError> {
        if self.subscription.is_some() {
            return Err(ChannelError::transient("channel already carries a consumer"));
        }

        let levels = priority.unwrap_or(0);
        let streams: Vec<(String, u8)> = (0..=levels)
            .rev()
            .map(|level| (self.settings.stream_key(queue, level), level))
            .collect();
        for (stream, _) in &streams {
            self.ensure_group(stream).await?;
        }

        info!(
            queue,
            consumer_tag,
            group = %self.settings.consumer_group,
            streams = streams.len(),
            "Registered Redis consumer"
        );
        self.subscription = Some(Subscription {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            streams,
        });
        self.recovering = true;
        Ok(())
    }

    async fn wait_once(&mut self, timeout: Duration) -> Result<Option<Delivery>, ChannelError> {
        let subscription = self
            .subscription
            .clone()
            .ok_or_else(|| ChannelError::NotConsuming("wait_once before consume".into()))?;
        let deadline = Instant::now() + timeout;

        loop {
            if !self.is_active() {
                return Ok(None);
            }
            if let Some(delivery) = self.hand_out() {
                return Ok(Some(delivery));
            }
            if !self.has_capacity() {
                tokio::time::sleep_until(deadline).await;
                return Ok(None);
            }
            if !self.fill(&subscription, deadline).await? && Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        resolution: &Resolution,
    ) -> Result<(), ChannelError> {
        if !self.outstanding.remove(&delivery.tag) {
            return Err(ChannelError::UnknownDelivery(delivery.tag.to_string()));
        }
        self.outstanding_deliveries.retain(|d| d.tag != delivery.tag);

        let queue = self
            .subscription
            .as_ref()
            .map(|s| s.queue.clone())
            .unwrap_or_default();

        match resolution {
            Resolution::Acknowledged => {}
            Resolution::Deleted => {
                if self.settings.dead_letter {
                    let entry = StoredEntry::from_delivery(delivery, true);
                    dead_letter(&mut self.conn, &self.settings, &queue, &entry).await?;
                }
            }
            Resolution::Released { delay } => {
                let entry = StoredEntry::from_delivery(delivery, true);
                if delay.is_zero() {
                    append(&mut self.conn, &delivery.tag.source, &entry).await?;
                } else {
                    let delayed_key = self.settings.delayed_key(&queue);
                    super::schedule(&mut self.conn, &delayed_key, &entry, *delay).await?;
                }
            }
        }

        self.ack_and_delete(&delivery.tag.source, &delivery.tag.id).await
    }

    async fn cancel_consumer(
        &mut self,
        consumer_tag: &str,
        drain_in_flight: bool,
    ) -> Result<(), ChannelError> {
        match &self.subscription {
            Some(subscription) if subscription.consumer_tag == consumer_tag => {}
            _ => return Err(ChannelError::NotConsuming(consumer_tag.to_string())),
        }

        self.cancelled = true;
        self.requeue_unsettled(!drain_in_flight).await?;
        info!(consumer_tag, drain_in_flight, "Cancelled Redis consumer");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.subscription.is_some() && !self.cancelled && !self.closed
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.requeue_unsettled(true).await?;

        if let Some(subscription) = self.subscription.clone() {
            for (stream, _) in &subscription.streams {
                let result: RedisResult<i64> = redis::cmd("XGROUP")
                    .arg("DELCONSUMER")
                    .arg(stream)
                    .arg(&self.settings.consumer_group)
                    .arg(&subscription.consumer_tag)
                    .query_async(&mut self.conn)
                    .await;
                if let Err(e) = result {
                    debug!(stream = %stream, error = %e, "Failed to remove consumer from group");
                }
            }
        }
        Ok(())
    }
}
