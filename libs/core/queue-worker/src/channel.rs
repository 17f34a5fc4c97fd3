//! Broker channel boundary
//!
//! The consumer loop talks to the broker only through [`ChannelAdapter`]. A
//! [`Connector`] opens one channel per daemon run, bound to a named connection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ChannelError;
use crate::job::Resolution;

/// Broker-side identity of a delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    /// Physical source the message was read from (queue or stream key)
    pub source: String,
    /// Broker-assigned id, unique within `source`
    pub id: String,
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source, self.id)
    }
}

/// A message handed to this consumer and not yet settled
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Producer-assigned job id, stable across redeliveries
    pub job_id: String,
    /// Serialized job payload
    pub body: String,
    pub priority: u8,
    /// Number of times this job has been delivered, including this one
    pub attempts: u32,
    /// Per-job deadline requested by the producer
    pub timeout: Option<Duration>,
    /// The broker delivered this message before without a settlement
    pub redelivered: bool,
    pub published_at: Option<DateTime<Utc>>,
}

/// A broker channel carrying one consumer
///
/// Implementations must never drop a delivery that was handed out but not
/// settled: on cancel without drain, or on close, such deliveries go back to the
/// queue.
#[async_trait]
pub trait ChannelAdapter: Send {
    /// Configure the prefetch window
    async fn set_qos(&mut self, prefetch_size: u32, prefetch_count: u16)
    -> Result<(), ChannelError>;

    /// Register the consumer on `queue`
    ///
    /// `priority` carries the queue's maximum priority when priority routing is
    /// enabled.
    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        priority: Option<u8>,
    ) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for the next delivery
    async fn wait_once(&mut self, timeout: Duration) -> Result<Option<Delivery>, ChannelError>;

    /// Settle a delivery with the handle's resolution
    async fn settle(
        &mut self,
        delivery: &Delivery,
        resolution: &Resolution,
    ) -> Result<(), ChannelError>;

    /// Cancel the consumer; with `drain_in_flight`, unsettled deliveries may
    /// still be settled afterwards
    async fn cancel_consumer(
        &mut self,
        consumer_tag: &str,
        drain_in_flight: bool,
    ) -> Result<(), ChannelError>;

    /// Whether the channel is still delivering to the consumer
    fn is_active(&self) -> bool;

    /// Release the channel
    async fn close(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Opens channels on named broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    type Channel: ChannelAdapter;

    async fn open_channel(&self, connection: &str) -> Result<Self::Channel, ChannelError>;
}
