//! Shared test utilities for queue worker testing
//!
//! This crate provides reusable test infrastructure:
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic queue names, consumer tags and payloads (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let queue = builder.queue("emails");
//!     let stream_len = redis.stream_len(&format!("queues:{queue}")).await;
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Names derived from the same seed are stable across runs, so tests sharing
/// one Redis instance never collide on keys.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_release_with_delay");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic job id
    pub fn job_id(&self, n: u64) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&n.to_le_bytes());
        Uuid::from_bytes(uuid_bytes)
    }

    /// Queue name unique to this builder
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.queue("emails"), "test-emails-7");
    /// ```
    pub fn queue(&self, name: &str) -> String {
        format!("test-{}-{}", name, self.seed)
    }

    /// Consumer tag unique to this builder
    pub fn consumer_tag(&self, worker: &str) -> String {
        format!("worker-{}-{}", worker, self.seed)
    }

    /// Small JSON payload numbered `n`
    pub fn payload(&self, n: u64) -> String {
        format!(r#"{{"seed":{},"n":{}}}"#, self.seed, n)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::fmt::Debug;

    /// Assert that `items` preserve the relative order of `expected`
    pub fn assert_in_order<T: PartialEq + Debug>(items: &[T], expected: &[T], context: &str) {
        let positions: Vec<Option<usize>> = expected
            .iter()
            .map(|want| items.iter().position(|item| item == want))
            .collect();
        assert!(
            positions.iter().all(Option::is_some),
            "{}: expected all of {:?} in {:?}",
            context,
            expected,
            items
        );
        assert!(
            positions.windows(2).all(|pair| pair[0] < pair[1]),
            "{}: expected order {:?}, got {:?}",
            context,
            expected,
            items
        );
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.job_id(1), builder2.job_id(1));
        assert_eq!(builder1.queue("emails"), builder2.queue("emails"));
        assert_eq!(builder1.payload(3), builder2.payload(3));
    }

    #[test]
    fn test_data_builder_from_name() {
        let builder1 = TestDataBuilder::from_test_name("my_test");
        let builder2 = TestDataBuilder::from_test_name("my_test");

        assert_eq!(builder1.consumer_tag("a"), builder2.consumer_tag("a"));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.queue("emails"), builder2.queue("emails"));
        assert_ne!(builder1.job_id(1), builder1.job_id(2));
    }

    #[test]
    fn test_assert_in_order() {
        assertions::assert_in_order(&[1, 5, 2, 9], &[1, 2, 9], "subsequence");
    }

    #[test]
    #[should_panic(expected = "expected order")]
    fn test_assert_in_order_rejects_swaps() {
        assertions::assert_in_order(&[2, 1], &[1, 2], "swapped");
    }
}
