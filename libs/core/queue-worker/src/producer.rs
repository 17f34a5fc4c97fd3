//! Job producers
//!
//! [`Producer`] enqueues raw payloads. [`InstrumentedProducer`] wraps any producer
//! and reports `pushed` events to the registered hooks.
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_worker::{Hooks, InstrumentedProducer, MetricsListener, Producer, PushOptions};
//!
//! let producer = InstrumentedProducer::new(redis_producer, Hooks::new().with_listener(MetricsListener));
//! let job_id = producer.push("emails", r#"{"to":"a@example.com"}"#, PushOptions::default()).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ChannelError;
use crate::hooks::{Hooks, QueueEvent};

/// Delivery options for a pushed job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Higher runs first; clamped to the queue's maximum priority
    pub priority: u8,
    /// Keep the job invisible for this long
    pub delay: Option<Duration>,
    /// Per-job deadline overriding the worker default
    pub timeout: Option<Duration>,
}

impl PushOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Zero leaves the job without a deadline of its own
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Enqueue a payload, returning the job id
    async fn push(
        &self,
        queue: &str,
        payload: &str,
        options: PushOptions,
    ) -> Result<String, ChannelError>;

    /// Number of jobs ready for delivery right now
    async fn ready_now(&self, queue: &str) -> Result<u64, ChannelError>;

    /// Name of the connection this producer writes to
    fn connection_name(&self) -> &str;
}

/// Producer decorator emitting `pushed` events
pub struct InstrumentedProducer<P> {
    inner: P,
    hooks: Hooks,
}

impl<P: Producer> InstrumentedProducer<P> {
    pub fn new(inner: P, hooks: Hooks) -> Self {
        Self { inner, hooks }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Producer> Producer for InstrumentedProducer<P> {
    async fn push(
        &self,
        queue: &str,
        payload: &str,
        options: PushOptions,
    ) -> Result<String, ChannelError> {
        let job_id = self.inner.push(queue, payload, options).await?;
        debug!(queue, job_id = %job_id, "Job pushed");

        self.hooks.pushed(&QueueEvent {
            connection: self.inner.connection_name().to_string(),
            queue: queue.to_string(),
            job_id: job_id.clone(),
            payload_bytes: payload.len(),
        });
        Ok(job_id)
    }

    async fn ready_now(&self, queue: &str) -> Result<u64, ChannelError> {
        self.inner.ready_now(queue).await
    }

    fn connection_name(&self) -> &str {
        self.inner.connection_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::WorkerListener;
    use crate::memory::MemoryBroker;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        pushed: Mutex<Vec<QueueEvent>>,
    }

    impl WorkerListener for Recorder {
        fn on_pushed(&self, event: &QueueEvent) {
            self.pushed.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_push_emits_event() {
        let recorder = Arc::new(Recorder::default());
        let mut hooks = Hooks::new();
        hooks.push(recorder.clone());

        let broker = MemoryBroker::new();
        let producer = InstrumentedProducer::new(broker.clone(), hooks);

        let job_id = producer
            .push("emails", r#"{"to":"a"}"#, PushOptions::default())
            .await
            .unwrap();

        let events = recorder.pushed.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![QueueEvent {
                connection: "memory".into(),
                queue: "emails".into(),
                job_id,
                payload_bytes: 10,
            }]
        );
        assert_eq!(producer.ready_now("emails").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_push_emits_nothing() {
        let recorder = Arc::new(Recorder::default());
        let mut hooks = Hooks::new();
        hooks.push(recorder.clone());

        let broker = MemoryBroker::new();
        broker.fail_next_push(ChannelError::transient("queue full"));
        let producer = InstrumentedProducer::new(broker, hooks);

        assert!(
            producer
                .push("emails", "{}", PushOptions::default())
                .await
                .is_err()
        );
        assert!(recorder.pushed.lock().unwrap().is_empty());
    }
}
