//! Redis Streams broker
//!
//! Each queue is one stream per priority level, read through a consumer group.
//! A delivery stays in the group's pending list until it is settled; settling
//! acknowledges and deletes the entry, re-adding it first when released.
//! Delayed jobs wait in a sorted set and are moved to their stream once due.

mod channel;
mod producer;
mod restart;
mod settings;

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::Delivery;
use crate::error::ChannelError;

pub use channel::{RedisChannel, RedisConnector};
pub use producer::RedisProducer;
pub use restart::RedisRestartSignal;
pub use settings::RedisSettings;

/// Delayed jobs moved per promotion pass
const PROMOTE_BATCH: usize = 100;

/// A job as stored in a stream entry or delayed-set member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub id: String,
    pub job: String,
    /// Completed deliveries before this one
    pub attempts: u32,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub pushed_at: i64,
}

impl StoredEntry {
    pub fn new(job: impl Into<String>, priority: u8, timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job: job.into(),
            attempts: 0,
            priority,
            timeout_ms: timeout_ms(timeout),
            pushed_at: Utc::now().timestamp_millis(),
        }
    }

    /// Entry to re-publish for a delivery; `attempts` counts this delivery when
    /// `delivered` is set
    pub fn from_delivery(delivery: &Delivery, delivered: bool) -> Self {
        let attempts = if delivered {
            delivery.attempts
        } else {
            delivery.attempts.saturating_sub(1)
        };
        Self {
            id: delivery.job_id.clone(),
            job: delivery.body.clone(),
            attempts,
            priority: delivery.priority,
            timeout_ms: timeout_ms(delivery.timeout),
            pushed_at: delivery
                .published_at
                .map_or_else(|| Utc::now().timestamp_millis(), |at| at.timestamp_millis()),
        }
    }

    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("job", self.job.clone()),
            ("attempts", self.attempts.to_string()),
            ("priority", self.priority.to_string()),
            ("pushed_at", self.pushed_at.to_string()),
        ];
        if let Some(timeout_ms) = self.timeout_ms {
            fields.push(("timeout_ms", timeout_ms.to_string()));
        }
        fields
    }

    pub fn from_fields(fields: &[(String, String)]) -> Option<Self> {
        let field = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };

        Some(Self {
            id: field("id")?.to_string(),
            job: field("job")?.to_string(),
            attempts: field("attempts").and_then(|v| v.parse().ok()).unwrap_or(0),
            priority: field("priority").and_then(|v| v.parse().ok()).unwrap_or(0),
            timeout_ms: field("timeout_ms")
                .and_then(|v| v.parse().ok())
                .filter(|ms| *ms > 0),
            pushed_at: field("pushed_at").and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.pushed_at)
    }
}

fn timeout_ms(timeout: Option<Duration>) -> Option<u64> {
    timeout
        .map(|t| t.as_millis() as u64)
        .filter(|ms| *ms > 0)
}

/// Map a Redis error onto the loop's transport error classes
pub(crate) fn classify(err: redis::RedisError) -> ChannelError {
    if err.is_connection_refusal() {
        ChannelError::fatal(err.to_string())
    } else if err.is_connection_dropped() || err.is_io_error() {
        ChannelError::connection_lost(err.to_string())
    } else {
        ChannelError::transient(err.to_string())
    }
}

/// Append an entry to a ready stream
pub(crate) async fn append(
    conn: &mut ConnectionManager,
    stream: &str,
    entry: &StoredEntry,
) -> Result<String, ChannelError> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream).arg("*");
    for (field, value) in entry.fields() {
        cmd.arg(field).arg(value);
    }

    let stream_id: String = cmd.query_async(conn).await.map_err(classify)?;
    debug!(stream, stream_id = %stream_id, job_id = %entry.id, "Appended job");
    Ok(stream_id)
}

/// Append an entry to a dead-letter stream, trimming it approximately
pub(crate) async fn dead_letter(
    conn: &mut ConnectionManager,
    settings: &RedisSettings,
    queue: &str,
    entry: &StoredEntry,
) -> Result<(), ChannelError> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(settings.dead_letter_key(queue))
        .arg("MAXLEN")
        .arg("~")
        .arg(settings.dead_letter_max_length)
        .arg("*");
    for (field, value) in entry.fields() {
        cmd.arg(field).arg(value);
    }
    cmd.arg("deleted_at").arg(Utc::now().timestamp_millis());

    let _: String = cmd.query_async(conn).await.map_err(classify)?;
    Ok(())
}

/// Park an entry in the delayed set until `delay` has passed
pub(crate) async fn schedule(
    conn: &mut ConnectionManager,
    delayed_key: &str,
    entry: &StoredEntry,
    delay: Duration,
) -> Result<(), ChannelError> {
    let member = serde_json::to_string(entry)
        .map_err(|e| ChannelError::transient(format!("failed to encode delayed job: {e}")))?;
    let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;

    let _: i64 = redis::cmd("ZADD")
        .arg(delayed_key)
        .arg(due_ms)
        .arg(member)
        .query_async(conn)
        .await
        .map_err(classify)?;
    debug!(delayed_key, job_id = %entry.id, delay_ms = delay.as_millis() as u64, "Scheduled job");
    Ok(())
}

/// Move due delayed jobs of `queue` to their ready streams
///
/// ZREM gates each move, so concurrent consumers never publish a member twice.
pub(crate) async fn promote_due(
    conn: &mut ConnectionManager,
    settings: &RedisSettings,
    queue: &str,
) -> Result<usize, ChannelError> {
    let delayed_key = settings.delayed_key(queue);
    let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
        .arg(&delayed_key)
        .arg("-inf")
        .arg(Utc::now().timestamp_millis())
        .arg("LIMIT")
        .arg(0)
        .arg(PROMOTE_BATCH)
        .query_async(conn)
        .await
        .map_err(classify)?;

    let mut promoted = 0;
    for member in due {
        let removed: i64 = redis::cmd("ZREM")
            .arg(&delayed_key)
            .arg(&member)
            .query_async(conn)
            .await
            .map_err(classify)?;
        if removed == 0 {
            continue;
        }

        match serde_json::from_str::<StoredEntry>(&member) {
            Ok(entry) => {
                let priority = entry.priority.min(settings.max_priority);
                append(conn, &settings.stream_key(queue, priority), &entry).await?;
                promoted += 1;
            }
            Err(e) => {
                warn!(
                    delayed_key = %delayed_key,
                    error = %e,
                    "Undecodable delayed job, moving to dead letters"
                );
                if settings.dead_letter {
                    let raw = StoredEntry::new(member, 0, None);
                    dead_letter(conn, settings, queue, &raw).await?;
                }
            }
        }
    }

    if promoted > 0 {
        debug!(queue, promoted, "Promoted delayed jobs");
    }
    Ok(promoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DeliveryTag;

    #[test]
    fn test_entry_fields_roundtrip() {
        let entry = StoredEntry::new(r#"{"to":"a"}"#, 3, Some(Duration::from_secs(30)));
        let fields: Vec<(String, String)> = entry
            .fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(StoredEntry::from_fields(&fields), Some(entry));
    }

    #[test]
    fn test_entry_requires_id_and_job() {
        let fields = vec![("job".to_string(), "{}".to_string())];
        assert_eq!(StoredEntry::from_fields(&fields), None);

        let fields = vec![
            ("id".to_string(), "job-1".to_string()),
            ("job".to_string(), "{}".to_string()),
        ];
        let entry = StoredEntry::from_fields(&fields).unwrap();
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.timeout_ms, None);
    }

    #[test]
    fn test_zero_timeout_is_not_stored() {
        let entry = StoredEntry::new("{}", 0, Some(Duration::ZERO));
        assert_eq!(entry.timeout_ms, None);
        assert!(entry.fields().iter().all(|(key, _)| *key != "timeout_ms"));

        let fields = vec![
            ("id".to_string(), "job-1".to_string()),
            ("job".to_string(), "{}".to_string()),
            ("timeout_ms".to_string(), "0".to_string()),
        ];
        assert_eq!(StoredEntry::from_fields(&fields).unwrap().timeout_ms, None);

        let entry = StoredEntry::new("{}", 0, Some(Duration::from_secs(5)));
        assert_eq!(entry.timeout_ms, Some(5000));
    }

    #[test]
    fn test_entry_from_delivery_counts_attempts() {
        let delivery = Delivery {
            tag: DeliveryTag {
                source: "queues:emails".into(),
                id: "1-0".into(),
            },
            job_id: "job-1".into(),
            body: "{}".into(),
            priority: 2,
            attempts: 3,
            timeout: None,
            redelivered: false,
            published_at: None,
        };

        assert_eq!(StoredEntry::from_delivery(&delivery, true).attempts, 3);
        assert_eq!(StoredEntry::from_delivery(&delivery, false).attempts, 2);
        assert_eq!(StoredEntry::from_delivery(&delivery, true).id, "job-1");
    }
}
