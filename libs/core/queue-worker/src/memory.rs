//! In-memory broker
//!
//! [`MemoryBroker`] implements both sides of a queue inside one process: it is a
//! [`Connector`] for consumers and a [`Producer`] for publishers. Channels honour
//! prefetch, priority routing and delayed release, and put unsettled deliveries
//! back on the queue when cancelled without drain or closed. Every consumer-side
//! broker call is recorded so tests can assert on the exact sequence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::{ChannelAdapter, Connector, Delivery, DeliveryTag};
use crate::error::ChannelError;
use crate::job::Resolution;
use crate::producer::{Producer, PushOptions};

/// A consumer-side call received by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Qos {
        prefetch_size: u32,
        prefetch_count: u16,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        priority: Option<u8>,
    },
    Settle {
        job_id: String,
        resolution: Resolution,
    },
    Cancel {
        consumer_tag: String,
        drain_in_flight: bool,
    },
    Close,
}

#[derive(Debug, Clone)]
struct StoredJob {
    job_id: String,
    body: String,
    priority: u8,
    attempts: u32,
    timeout: Option<Duration>,
    redelivered: bool,
    published_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredJob>>,
    delayed: Vec<(Instant, String, StoredJob)>,
    unacked: HashMap<String, (String, StoredJob)>,
    dead_letters: HashMap<String, Vec<StoredJob>>,
    open_failures: VecDeque<ChannelError>,
    wait_failures: VecDeque<ChannelError>,
    push_failures: VecDeque<ChannelError>,
    calls: Vec<BrokerCall>,
    next_delivery: u64,
    consumers_cancelled: bool,
}

impl BrokerState {
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _, _)| *at <= now);
        self.delayed = pending;
        for (_, queue, job) in due {
            self.queues.entry(queue).or_default().push_back(job);
        }
    }

    fn next_due(&self, queue: &str) -> Option<Instant> {
        self.delayed
            .iter()
            .filter(|(_, q, _)| q == queue)
            .map(|(at, _, _)| *at)
            .min()
    }

    fn requeue(&mut self, delivery_id: &str) {
        if let Some((queue, mut job)) = self.unacked.remove(delivery_id) {
            job.redelivered = true;
            self.queues.entry(queue).or_default().push_front(job);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    arrived: Notify,
}

/// Shared in-process broker; clones refer to the same queues
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a payload with default options, returning the job id
    pub fn publish(&self, queue: &str, body: impl Into<String>) -> String {
        self.publish_with(queue, body, &PushOptions::default())
    }

    /// Publish a payload, returning the job id
    pub fn publish_with(
        &self,
        queue: &str,
        body: impl Into<String>,
        options: &PushOptions,
    ) -> String {
        let job = StoredJob {
            job_id: Uuid::new_v4().to_string(),
            body: body.into(),
            priority: options.priority,
            attempts: 0,
            timeout: options.timeout,
            redelivered: false,
            published_at: Utc::now(),
        };
        let job_id = job.job_id.clone();

        {
            let mut state = self.state();
            match options.delay.filter(|d| !d.is_zero()) {
                Some(delay) => state
                    .delayed
                    .push((Instant::now() + delay, queue.to_string(), job)),
                None => state
                    .queues
                    .entry(queue.to_string())
                    .or_default()
                    .push_back(job),
            }
        }
        self.inner.arrived.notify_one();
        job_id
    }

    /// Jobs ready for delivery on `queue`
    pub fn ready(&self, queue: &str) -> usize {
        let mut state = self.state();
        state.promote_due(Instant::now());
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Jobs waiting out a delay on `queue`
    pub fn delayed(&self, queue: &str) -> usize {
        self.state()
            .delayed
            .iter()
            .filter(|(_, q, _)| q == queue)
            .count()
    }

    /// Deliveries handed out and not yet settled
    pub fn in_flight(&self) -> usize {
        self.state().unacked.len()
    }

    /// Bodies of jobs deleted from `queue`, oldest first
    pub fn dead_letters(&self, queue: &str) -> Vec<String> {
        self.state()
            .dead_letters
            .get(queue)
            .map(|jobs| jobs.iter().map(|job| job.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state().calls.clone()
    }

    /// Make the next `open_channel` fail with `error`
    pub fn fail_next_open(&self, error: ChannelError) {
        self.state().open_failures.push_back(error);
    }

    /// Make the next `wait_once` on any channel fail with `error`
    pub fn fail_next_wait(&self, error: ChannelError) {
        self.state().wait_failures.push_back(error);
        self.inner.arrived.notify_one();
    }

    pub fn fail_next_push(&self, error: ChannelError) {
        self.state().push_failures.push_back(error);
    }

    /// Cancel every consumer from the broker side
    pub fn cancel_consumers(&self) {
        self.state().consumers_cancelled = true;
        self.inner.arrived.notify_one();
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BrokerCall) {
        self.state().calls.push(call);
    }

    fn take(&self, queue: &str, max_priority: Option<u8>) -> Option<Delivery> {
        let mut state = self.state();
        state.promote_due(Instant::now());

        let ready = state.queues.get_mut(queue)?;
        let index = match max_priority {
            // First job with the highest effective priority keeps FIFO within a level
            Some(max) => ready
                .iter()
                .enumerate()
                .rev()
                .max_by_key(|(_, job)| job.priority.min(max))
                .map(|(index, _)| index)?,
            None => 0,
        };
        let mut job = ready.remove(index)?;
        job.attempts += 1;

        state.next_delivery += 1;
        let delivery_id = state.next_delivery.to_string();
        let delivery = Delivery {
            tag: DeliveryTag {
                source: queue.to_string(),
                id: delivery_id.clone(),
            },
            job_id: job.job_id.clone(),
            body: job.body.clone(),
            priority: job.priority,
            attempts: job.attempts,
            timeout: job.timeout,
            redelivered: job.redelivered,
            published_at: Some(job.published_at),
        };
        state.unacked.insert(delivery_id, (queue.to_string(), job));
        Some(delivery)
    }

    fn settle(&self, delivery_id: &str, resolution: &Resolution) -> Result<(), ChannelError> {
        let mut state = self.state();
        let (queue, mut job) = state
            .unacked
            .remove(delivery_id)
            .ok_or_else(|| ChannelError::UnknownDelivery(delivery_id.to_string()))?;
        state.calls.push(BrokerCall::Settle {
            job_id: job.job_id.clone(),
            resolution: resolution.clone(),
        });

        match resolution {
            Resolution::Acknowledged => {}
            Resolution::Deleted => state.dead_letters.entry(queue).or_default().push(job),
            Resolution::Released { delay } => {
                job.redelivered = false;
                if delay.is_zero() {
                    state.queues.entry(queue).or_default().push_back(job);
                } else {
                    state.delayed.push((Instant::now() + *delay, queue, job));
                }
                drop(state);
                self.inner.arrived.notify_one();
            }
        }
        Ok(())
    }

    fn requeue_all(&self, delivery_ids: impl IntoIterator<Item = String>) {
        {
            let mut state = self.state();
            for id in delivery_ids {
                state.requeue(&id);
            }
        }
        self.inner.arrived.notify_one();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self, _connection: &str) -> Result<MemoryChannel, ChannelError> {
        if let Some(error) = self.state().open_failures.pop_front() {
            return Err(error);
        }
        Ok(MemoryChannel::new(self.clone()))
    }
}

#[async_trait]
impl Producer for MemoryBroker {
    async fn push(
        &self,
        queue: &str,
        payload: &str,
        options: PushOptions,
    ) -> Result<String, ChannelError> {
        if let Some(error) = self.state().push_failures.pop_front() {
            return Err(error);
        }
        Ok(self.publish_with(queue, payload, &options))
    }

    async fn ready_now(&self, queue: &str) -> Result<u64, ChannelError> {
        Ok(self.ready(queue) as u64)
    }

    fn connection_name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug)]
struct Subscription {
    queue: String,
    consumer_tag: String,
    max_priority: Option<u8>,
}

/// A channel on a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    subscription: Option<Subscription>,
    prefetch_count: u16,
    outstanding: HashSet<String>,
    cancelled: bool,
    closed: bool,
}

impl MemoryChannel {
    fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            subscription: None,
            prefetch_count: 0,
            outstanding: HashSet::new(),
            cancelled: false,
            closed: false,
        }
    }

    fn has_capacity(&self) -> bool {
        self.prefetch_count == 0 || self.outstanding.len() < usize::from(self.prefetch_count)
    }
}

#[async_trait]
impl ChannelAdapter for MemoryChannel {
    async fn set_qos(
        &mut self,
        prefetch_size: u32,
        prefetch_count: u16,
    ) -> Result<(), ChannelError> {
        self.broker.record(BrokerCall::Qos {
            prefetch_size,
            prefetch_count,
        });
        self.prefetch_count = prefetch_count;
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        priority: Option<u8>,
    ) -> Result<(), ChannelError> {
        if let Some(existing) = &self.subscription {
            return Err(ChannelError::transient(format!(
                "channel already carries consumer '{}'",
                existing.consumer_tag
            )));
        }
        self.broker.record(BrokerCall::Consume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            priority,
        });
        self.subscription = Some(Subscription {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            max_priority: priority,
        });
        Ok(())
    }

    async fn wait_once(&mut self, timeout: Duration) -> Result<Option<Delivery>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(error) = self.broker.state().wait_failures.pop_front() {
                return Err(error);
            }
            if self.closed {
                return Err(ChannelError::connection_lost("channel is closed"));
            }
            let subscription = self
                .subscription
                .as_ref()
                .ok_or_else(|| ChannelError::NotConsuming("wait_once before consume".into()))?;
            if !self.is_active() {
                return Ok(None);
            }

            if self.has_capacity() {
                if let Some(delivery) = self
                    .broker
                    .take(&subscription.queue, subscription.max_priority)
                {
                    self.outstanding.insert(delivery.tag.id.clone());
                    return Ok(Some(delivery));
                }
            }

            let wake_at = match self.broker.state().next_due(&subscription.queue) {
                Some(due) if due < deadline => due,
                _ => deadline,
            };
            let arrived = self.broker.inner.arrived.notified();
            let timed_out = tokio::time::timeout_at(wake_at, arrived).await.is_err();
            if timed_out && Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        resolution: &Resolution,
    ) -> Result<(), ChannelError> {
        if !self.outstanding.remove(&delivery.tag.id) {
            return Err(ChannelError::UnknownDelivery(delivery.tag.to_string()));
        }
        self.broker.settle(&delivery.tag.id, resolution)
    }

    async fn cancel_consumer(
        &mut self,
        consumer_tag: &str,
        drain_in_flight: bool,
    ) -> Result<(), ChannelError> {
        self.broker.record(BrokerCall::Cancel {
            consumer_tag: consumer_tag.to_string(),
            drain_in_flight,
        });
        match &self.subscription {
            Some(subscription) if subscription.consumer_tag == consumer_tag => {}
            _ => return Err(ChannelError::NotConsuming(consumer_tag.to_string())),
        }

        self.cancelled = true;
        if !drain_in_flight {
            self.broker.requeue_all(self.outstanding.drain());
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.subscription.is_some()
            && !self.cancelled
            && !self.closed
            && !self.broker.state().consumers_cancelled
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.broker.record(BrokerCall::Close);
        self.closed = true;
        self.broker.requeue_all(self.outstanding.drain());
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.outstanding.is_empty() {
            self.broker.requeue_all(self.outstanding.drain());
        }
    }
}
