//! Redis Streams broker tests
//!
//! These need Docker for the Redis container:
//!
//! ```bash
//! cargo test -p queue-worker --test redis_channel -- --ignored
//! ```

#![cfg(feature = "redis")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use queue_worker::redis::{RedisConnector, RedisProducer, RedisRestartSignal, RedisSettings};
use queue_worker::{
    CancellationToken, ChannelAdapter, Connector, Consumer, ConsumerIdentity, JobError,
    JobExecutor, JobHandle, Producer, PushOptions, Resolution, RestartSignal, SignalGovernor,
    StopReason, WorkerConfig,
};
use test_utils::{TestDataBuilder, TestRedis};

/// Records bodies and resolves each job the same way
struct Resolve {
    resolution: Resolution,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Resolve {
    fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl JobExecutor for Resolve {
    async fn execute(
        &self,
        job: &mut JobHandle,
        _cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        self.seen.lock().unwrap().push(job.raw_body().to_string());
        match &self.resolution {
            Resolution::Acknowledged => job.ack(),
            Resolution::Released { delay } => job.release(*delay),
            Resolution::Deleted => job.delete(),
        }
    }

    fn name(&self) -> &'static str {
        "resolve"
    }
}

fn settings(redis: &TestRedis, builder: &TestDataBuilder) -> RedisSettings {
    RedisSettings::new(redis.url()).with_key_prefix(builder.queue("prefix"))
}

fn config() -> WorkerConfig {
    WorkerConfig::new()
        .with_sleep(Duration::from_millis(50))
        .with_wait_timeout(Duration::from_millis(500))
        .with_memory_limit_bytes(0)
}

fn consumer<E: JobExecutor>(
    settings: &RedisSettings,
    executor: E,
    builder: &TestDataBuilder,
) -> Consumer<RedisConnector, E> {
    Consumer::new(
        RedisConnector::new(settings.clone()).unwrap(),
        executor,
        ConsumerIdentity::new()
            .with_consumer_tag(builder.consumer_tag("a"))
            .with_max_priority(settings.max_priority),
    )
    .with_governor(SignalGovernor::without_async_signals())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_max_jobs_leaves_rest_ready() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_max_jobs_leaves_rest_ready");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    for n in 0..5 {
        producer
            .push(&queue, &builder.payload(n), PushOptions::default())
            .await
            .unwrap();
    }

    let executor = Resolve::new(Resolution::Acknowledged);
    let seen = executor.seen.clone();
    let reason = consumer(&settings, executor, &builder)
        .daemon("redis", &queue, &config().with_max_jobs(3))
        .await
        .unwrap();

    assert_eq!(reason, StopReason::MaxJobsReached);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![builder.payload(0), builder.payload(1), builder.payload(2)]
    );
    assert_eq!(producer.ready_now(&queue).await.unwrap(), 2);
    assert_eq!(redis.stream_len(&settings.stream_key(&queue, 0)).await, 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stop_when_empty() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_stop_when_empty");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    producer
        .push(&queue, &builder.payload(1), PushOptions::default())
        .await
        .unwrap();

    let reason = consumer(&settings, Resolve::new(Resolution::Acknowledged), &builder)
        .daemon("redis", &queue, &config().with_stop_when_empty(true))
        .await
        .unwrap();

    assert_eq!(reason, StopReason::QueueEmptyAndConfiguredToStop);
    assert_eq!(producer.ready_now(&queue).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_deleted_jobs_land_in_dead_letters() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_deleted_jobs_land_in_dead_letters");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    producer
        .push(&queue, &builder.payload(1), PushOptions::default())
        .await
        .unwrap();

    consumer(&settings, Resolve::new(Resolution::Deleted), &builder)
        .daemon("redis", &queue, &config().with_max_jobs(1))
        .await
        .unwrap();

    assert_eq!(redis.stream_len(&settings.dead_letter_key(&queue)).await, 1);
    assert_eq!(producer.ready_now(&queue).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_release_with_delay_schedules_job() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_release_with_delay_schedules_job");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    producer
        .push(&queue, &builder.payload(1), PushOptions::default())
        .await
        .unwrap();

    consumer(
        &settings,
        Resolve::new(Resolution::Released {
            delay: Duration::from_secs(60),
        }),
        &builder,
    )
    .daemon("redis", &queue, &config().with_max_jobs(1))
    .await
    .unwrap();

    assert_eq!(redis.zset_len(&settings.delayed_key(&queue)).await, 1);
    assert_eq!(producer.ready_now(&queue).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_delayed_release_is_redelivered_with_attempts() {
    let redis = TestRedis::new().await;
    let builder =
        TestDataBuilder::from_test_name("test_delayed_release_is_redelivered_with_attempts");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    producer
        .push(&queue, &builder.payload(1), PushOptions::default())
        .await
        .unwrap();

    let connector = RedisConnector::new(settings.clone()).unwrap();
    let mut channel = connector.open_channel("redis").await.unwrap();
    channel.set_qos(0, 1).await.unwrap();
    channel
        .consume(&queue, &builder.consumer_tag("a"), None)
        .await
        .unwrap();

    let first = channel
        .wait_once(Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.attempts, 1);
    channel
        .settle(
            &first,
            &Resolution::Released {
                delay: Duration::from_millis(200),
            },
        )
        .await
        .unwrap();

    let second = channel
        .wait_once(Duration::from_secs(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.attempts, 2);
    channel.settle(&second, &Resolution::Acknowledged).await.unwrap();
    channel.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_close_requeues_unsettled_delivery() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_close_requeues_unsettled_delivery");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    producer
        .push(&queue, &builder.payload(1), PushOptions::default())
        .await
        .unwrap();

    let connector = RedisConnector::new(settings.clone()).unwrap();
    let mut channel = connector.open_channel("redis").await.unwrap();
    channel.set_qos(0, 1).await.unwrap();
    channel
        .consume(&queue, &builder.consumer_tag("a"), None)
        .await
        .unwrap();
    let delivery = channel.wait_once(Duration::from_secs(2)).await.unwrap();
    assert!(delivery.is_some());
    assert_eq!(producer.ready_now(&queue).await.unwrap(), 0);

    channel.close().await.unwrap();
    assert!(!channel.is_active());
    assert_eq!(producer.ready_now(&queue).await.unwrap(), 1);

    // The interrupted delivery counts as an attempt
    let mut channel = connector.open_channel("redis").await.unwrap();
    channel
        .consume(&queue, &builder.consumer_tag("b"), None)
        .await
        .unwrap();
    let again = channel
        .wait_once(Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.attempts, 2);
    assert_eq!(again.body, builder.payload(1));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_pending_delivery_counts_lost_attempts() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_pending_delivery_counts_lost_attempts");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    producer
        .push(&queue, &builder.payload(1), PushOptions::default())
        .await
        .unwrap();

    // Each channel is dropped without close, as when the worker process dies
    let connector = RedisConnector::new(settings.clone()).unwrap();
    for expected in [1, 2] {
        let mut channel = connector.open_channel("redis").await.unwrap();
        channel.set_qos(0, 1).await.unwrap();
        channel
            .consume(&queue, &builder.consumer_tag("a"), None)
            .await
            .unwrap();
        let delivery = channel
            .wait_once(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.attempts, expected);
        assert_eq!(delivery.body, builder.payload(1));
    }

    // The third delivery is past two tries and goes straight to dead letters
    let executor = Resolve::new(Resolution::Acknowledged);
    let seen = executor.seen.clone();
    consumer(&settings, executor, &builder)
        .daemon("redis", &queue, &config().with_max_jobs(1).with_max_tries(2))
        .await
        .unwrap();

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(redis.stream_len(&settings.dead_letter_key(&queue)).await, 1);
    assert_eq!(producer.ready_now(&queue).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_priority_streams_are_read_highest_first() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_priority_streams_are_read_highest_first");
    let settings = settings(&redis, &builder).with_max_priority(5);
    let queue = builder.queue("emails");

    let producer = RedisProducer::connect(settings.clone(), "redis").await.unwrap();
    for (n, priority) in [(1, 0), (2, 5), (3, 9)] {
        producer
            .push(
                &queue,
                &builder.payload(n),
                PushOptions::default().with_priority(priority),
            )
            .await
            .unwrap();
    }

    let executor = Resolve::new(Resolution::Acknowledged);
    let seen = executor.seen.clone();
    consumer(&settings, executor, &builder)
        .daemon("redis", &queue, &config().with_stop_when_empty(true))
        .await
        .unwrap();

    // Priority 9 was clamped to 5 and keeps its order behind the earlier 5
    assert_eq!(
        *seen.lock().unwrap(),
        vec![builder.payload(2), builder.payload(3), builder.payload(1)]
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_restart_broadcast_stops_worker() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_restart_broadcast_stops_worker");
    let settings = settings(&redis, &builder);
    let queue = builder.queue("emails");

    let restart = RedisRestartSignal::connect(&settings).await.unwrap();
    assert_eq!(restart.last_restart().await.unwrap(), None);

    let worker = consumer(&settings, Resolve::new(Resolution::Acknowledged), &builder)
        .with_restart_signal(Arc::new(restart.clone()));
    let run = tokio::spawn(async move { worker.daemon("redis", &queue, &config()).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stamp = restart.broadcast().await.unwrap();
    assert_eq!(restart.last_restart().await.unwrap(), Some(stamp));

    let reason = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::RestartRequested);
}
