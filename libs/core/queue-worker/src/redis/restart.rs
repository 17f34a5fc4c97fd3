use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{classify, RedisSettings};
use crate::error::ChannelError;
use crate::signals::RestartSignal;

/// Restart broadcast stored under `{prefix}:restart`
#[derive(Clone)]
pub struct RedisRestartSignal {
    conn: ConnectionManager,
    key: String,
}

impl RedisRestartSignal {
    pub fn new(conn: ConnectionManager, settings: &RedisSettings) -> Self {
        Self {
            conn,
            key: settings.restart_key(),
        }
    }

    pub async fn connect(settings: &RedisSettings) -> Result<Self, ChannelError> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| ChannelError::fatal(format!("invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;
        Ok(Self::new(conn, settings))
    }

    /// Ask every running worker to stop after its current job
    pub async fn broadcast(&self) -> Result<i64, ChannelError> {
        let mut conn = self.conn.clone();
        let stamp = Utc::now().timestamp_millis();
        let () = redis::cmd("SET")
            .arg(&self.key)
            .arg(stamp)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        info!(key = %self.key, stamp, "Broadcast queue worker restart");
        Ok(stamp)
    }
}

#[async_trait]
impl RestartSignal for RedisRestartSignal {
    async fn last_restart(&self) -> Result<Option<i64>, ChannelError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(&self.key)
            .query_async::<Option<i64>>(&mut conn)
            .await
            .map_err(classify)
    }
}
