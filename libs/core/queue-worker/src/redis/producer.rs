use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;

use super::{append, classify, schedule, RedisSettings, StoredEntry};
use crate::error::ChannelError;
use crate::producer::{Producer, PushOptions};

/// Summary form of `XPENDING`: count, lowest id, highest id, per-consumer counts
type PendingSummary = (u64, Option<String>, Option<String>, Option<Vec<(String, String)>>);

/// Enqueues jobs onto Redis queues
///
/// Priorities above the configured maximum are clamped to it.
#[derive(Clone)]
pub struct RedisProducer {
    conn: ConnectionManager,
    settings: Arc<RedisSettings>,
    connection: String,
}

impl RedisProducer {
    pub fn new(
        conn: ConnectionManager,
        settings: RedisSettings,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            settings: Arc::new(settings),
            connection: connection.into(),
        }
    }

    /// Connect using the settings' URL
    pub async fn connect(
        settings: RedisSettings,
        connection: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| ChannelError::fatal(format!("invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;
        Ok(Self::new(conn, settings, connection))
    }

    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }
}

#[async_trait]
impl Producer for RedisProducer {
    async fn push(
        &self,
        queue: &str,
        payload: &str,
        options: PushOptions,
    ) -> Result<String, ChannelError> {
        let mut conn = self.conn.clone();
        let priority = options.priority.min(self.settings.max_priority);
        let entry = StoredEntry::new(payload, priority, options.timeout);

        match options.delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                schedule(&mut conn, &self.settings.delayed_key(queue), &entry, delay).await?;
            }
            None => {
                append(&mut conn, &self.settings.stream_key(queue, priority), &entry).await?;
            }
        }
        Ok(entry.id)
    }

    /// Entries in the ready streams that no consumer holds yet
    async fn ready_now(&self, queue: &str) -> Result<u64, ChannelError> {
        let mut conn = self.conn.clone();
        let mut ready = 0u64;

        for level in 0..=self.settings.max_priority {
            let stream = self.settings.stream_key(queue, level);
            let length: u64 = redis::cmd("XLEN")
                .arg(&stream)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;

            let pending: RedisResult<PendingSummary> = redis::cmd("XPENDING")
                .arg(&stream)
                .arg(&self.settings.consumer_group)
                .query_async(&mut conn)
                .await;
            let pending = match pending {
                Ok((count, _, _, _)) => count,
                Err(e) if e.to_string().contains("NOGROUP") => 0,
                Err(e) => return Err(classify(e)),
            };

            ready += length.saturating_sub(pending);
        }
        Ok(ready)
    }

    fn connection_name(&self) -> &str {
        &self.connection
    }
}
