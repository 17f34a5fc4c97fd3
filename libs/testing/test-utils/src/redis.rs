//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that creates a Redis container for testing.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let url = redis.url();
/// // Point a queue connector at `url`
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance
    ///
    /// Uses Redis 8 Alpine image by default.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client = Client::open(connection_string.clone())
            .expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Get a cloned connection for direct inspection
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Connection URL for clients under test
    pub fn url(&self) -> &str {
        &self.connection_string
    }

    /// Number of entries in a stream (0 when missing)
    pub async fn stream_len(&self, key: &str) -> u64 {
        let mut conn = self.connection();
        redis::cmd("XLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .expect("XLEN failed")
    }

    /// Number of members in a sorted set (0 when missing)
    pub async fn zset_len(&self, key: &str) -> u64 {
        let mut conn = self.connection();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .expect("ZCARD failed")
    }
}

// Container is automatically cleaned up when TestRedis is dropped
impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_stream_helpers() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        assert_eq!(redis.stream_len("jobs").await, 0);

        let _: String = redis::cmd("XADD")
            .arg("jobs")
            .arg("*")
            .arg("job")
            .arg("{}")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(redis.stream_len("jobs").await, 1);

        let _: u64 = redis::cmd("ZADD")
            .arg("later")
            .arg(10)
            .arg("a")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(redis.zset_len("later").await, 1);
    }
}
