//! 连接缓存（ConnectionCache）
//!
//! 按需创建并复用 broker 句柄：
//! - 每个 hub 至多一个生产者；
//! - 每个 (hub, 消费组) 至多一个消费者。
//!
//! 创建失败不入缓存，下一次请求会重新尝试创建；生产者首次创建后立即探测分区，
//! 探测失败视为创建失败。句柄只在关闭时销毁，关闭后不再交出任何句柄。
//!
use crate::broker::{BrokerClient, ConsumerClient, ProducerClient};
use crate::error::{HubError, HubResult};
use crate::metadata::SubscriptionKey;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

type ProducerCell = Arc<OnceCell<Cached<dyn ProducerClient>>>;
type ConsumerCell = Arc<OnceCell<Cached<dyn ConsumerClient>>>;

// 缓存的句柄；`release` 保证每个句柄只被关闭一次
struct Cached<C: ?Sized> {
    client: Arc<C>,
    released: AtomicBool,
}

impl<C: ?Sized> Cached<C> {
    fn new(client: Arc<C>) -> Self {
        Self {
            client,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}

/// 关闭结果统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub producers_closed: usize,
    pub consumers_closed: usize,
    pub failures: usize,
}

pub struct ConnectionCache {
    broker: Arc<dyn BrokerClient>,
    // 未初始化的 cell 表示创建中或上次创建失败，不视为缓存项
    producers: DashMap<String, ProducerCell>,
    consumers: DashMap<SubscriptionKey, ConsumerCell>,
    closed: AtomicBool,
}

impl ConnectionCache {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            producers: DashMap::new(),
            consumers: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// 取得 hub 的生产者，必要时创建并探测分区
    ///
    /// 创建过程中开始关闭时，新句柄随即关闭并返回 `ShutDown`。
    pub async fn producer_for(&self, hub: &str) -> HubResult<Arc<dyn ProducerClient>> {
        self.ensure_open()?;
        let cell = self.producers.entry(hub.to_string()).or_default().clone();

        let cached = cell
            .get_or_try_init(|| async {
                let producer = self
                    .broker
                    .create_producer(hub)
                    .await
                    .map_err(|e| HubError::connection(hub, e))?;

                match producer.partition_ids().await {
                    Ok(partition_ids) => {
                        info!(hub, ?partition_ids, "connected to event hub");
                        Ok::<_, HubError>(Cached::new(producer))
                    }
                    Err(e) => {
                        error!(hub, error = %e, "failed to connect to event hub");
                        if let Err(close_err) = producer.close().await {
                            warn!(hub, error = %close_err, "failed to release unprobed producer");
                        }
                        Err(HubError::connection(hub, e))
                    }
                }
            })
            .await?;

        if self.closed_after_init() {
            if cached.release() {
                if let Err(e) = cached.client.close().await {
                    warn!(hub, error = %e, "failed to close producer created during shutdown");
                }
            }
            return Err(HubError::ShutDown);
        }
        Ok(cached.client.clone())
    }

    /// 取得 (hub, 消费组) 的消费者
    pub async fn consumer_for(&self, key: &SubscriptionKey) -> HubResult<Arc<dyn ConsumerClient>> {
        self.ensure_open()?;
        let cell = self.consumers.entry(key.clone()).or_default().clone();

        let cached = cell
            .get_or_try_init(|| async {
                let consumer = self
                    .broker
                    .create_consumer(key.hub(), key.consumer_group())
                    .await
                    .map_err(|e| HubError::connection(key.hub(), e))?;
                info!(hub = key.hub(), consumer_group = key.consumer_group(), "consumer created");
                Ok::<_, HubError>(Cached::new(consumer))
            })
            .await?;

        if self.closed_after_init() {
            if cached.release() {
                if let Err(e) = cached.client.close().await {
                    warn!(key = %key, error = %e, "failed to close consumer created during shutdown");
                }
            }
            return Err(HubError::ShutDown);
        }
        Ok(cached.client.clone())
    }

    pub fn has_producer(&self, hub: &str) -> bool {
        self.producers
            .get(hub)
            .is_some_and(|cell| cell.initialized())
    }

    pub fn has_consumer(&self, key: &SubscriptionKey) -> bool {
        self.consumers
            .get(key)
            .is_some_and(|cell| cell.initialized())
    }

    pub fn producer_count(&self) -> usize {
        self.producers.iter().filter(|c| c.initialized()).count()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.iter().filter(|c| c.initialized()).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 关闭全部生产者，再关闭全部消费者
    ///
    /// 仅第一次调用生效；单个句柄关闭失败只记录日志，不影响其余句柄。
    pub async fn close_all(&self) -> CloseReport {
        let mut report = CloseReport::default();
        if self.closed.swap(true, Ordering::SeqCst) {
            return report;
        }

        let producers: Vec<(String, ProducerCell)> = self
            .producers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.producers.clear();

        for (hub, cell) in producers {
            let Some(cached) = cell.get().filter(|c| c.release()) else {
                continue;
            };
            match cached.client.close().await {
                Ok(()) => report.producers_closed += 1,
                Err(e) => {
                    report.failures += 1;
                    let err = HubError::Close {
                        resource: format!("producer {hub}"),
                        source: e,
                    };
                    error!(hub = %hub, error = %err, "failed to close producer");
                }
            }
        }

        let consumers: Vec<(SubscriptionKey, ConsumerCell)> = self
            .consumers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.consumers.clear();

        for (key, cell) in consumers {
            let Some(cached) = cell.get().filter(|c| c.release()) else {
                continue;
            };
            match cached.client.close().await {
                Ok(()) => report.consumers_closed += 1,
                Err(e) => {
                    report.failures += 1;
                    let err = HubError::Close {
                        resource: format!("consumer {key}"),
                        source: e,
                    };
                    error!(key = %key, error = %err, "failed to close consumer");
                }
            }
        }

        report
    }

    // 与 close_all 的 swap 配对：二者至少有一方看到对方的写入
    fn closed_after_init(&self) -> bool {
        fence(Ordering::SeqCst);
        self.is_closed()
    }

    fn ensure_open(&self) -> HubResult<()> {
        if self.is_closed() {
            return Err(HubError::ShutDown);
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::broker::{
        BrokerSubscription, EventData, InMemoryBroker, InMemoryBrokerConfig, SendOptions,
    };
    use crate::error::{BrokerError, BrokerResult};
    use async_trait::async_trait;

    fn cache_with(broker: &InMemoryBroker) -> ConnectionCache {
        ConnectionCache::new(Arc::new(broker.clone()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_producer_per_hub_under_concurrency() {
        let broker = InMemoryBroker::default();
        let cache = Arc::new(cache_with(&broker));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.producer_for("users").await }));
        }
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }
        cache.producer_for("orders").await.unwrap();

        assert_eq!(broker.stats().producers_created, 2);
        assert_eq!(cache.producer_count(), 2);
    }

    #[tokio::test]
    async fn one_consumer_per_hub_and_group() {
        let broker = InMemoryBroker::default();
        let cache = cache_with(&broker);

        let a = SubscriptionKey::new("users", "$Default");
        let b = SubscriptionKey::new("users", "audit");
        cache.consumer_for(&a).await.unwrap();
        cache.consumer_for(&a).await.unwrap();
        cache.consumer_for(&b).await.unwrap();

        assert_eq!(broker.stats().consumers_created, 2);
        assert!(cache.has_consumer(&a));
        assert!(cache.has_consumer(&b));
    }

    #[tokio::test]
    async fn failed_probe_is_not_cached_and_retried() {
        let broker = InMemoryBroker::default();
        let cache = cache_with(&broker);

        broker.set_unreachable(true);
        let err = cache.producer_for("users").await.err().unwrap();
        assert!(matches!(err, HubError::Connection { ref hub, .. } if hub == "users"));
        assert!(!cache.has_producer("users"));
        assert_eq!(cache.producer_count(), 0);

        broker.set_unreachable(false);
        cache.producer_for("users").await.unwrap();
        assert!(cache.has_producer("users"));
        // 第一次失败的句柄已被释放
        assert_eq!(broker.stats().producers_created, 2);
        assert_eq!(broker.stats().producers_closed, 1);
    }

    #[tokio::test]
    async fn invalid_hub_is_connection_error() {
        let broker = InMemoryBroker::default();
        let cache = cache_with(&broker);
        let err = cache.producer_for("not a hub").await.err().unwrap();
        assert!(err.is_caller_visible());
        assert!(matches!(
            err,
            HubError::Connection {
                source: BrokerError::InvalidHub { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn close_all_closes_each_handle_once() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig::default());
        let cache = cache_with(&broker);
        cache.producer_for("users").await.unwrap();
        cache.producer_for("orders").await.unwrap();
        cache
            .consumer_for(&SubscriptionKey::new("users", "$Default"))
            .await
            .unwrap();

        let report = cache.close_all().await;
        assert_eq!(
            report,
            CloseReport {
                producers_closed: 2,
                consumers_closed: 1,
                failures: 0
            }
        );

        let again = cache.close_all().await;
        assert_eq!(again, CloseReport::default());
        assert_eq!(broker.stats().producers_closed, 2);
        assert_eq!(broker.stats().consumers_closed, 1);

        assert!(matches!(
            cache.producer_for("users").await,
            Err(HubError::ShutDown)
        ));
    }

    // 关闭时总是失败的 broker
    struct BrokenCloseBroker {
        inner: InMemoryBroker,
    }

    struct BrokenProducer {
        inner: Arc<dyn ProducerClient>,
        fail: bool,
    }

    #[async_trait]
    impl ProducerClient for BrokenProducer {
        async fn partition_ids(&self) -> BrokerResult<Vec<String>> {
            self.inner.partition_ids().await
        }
        async fn send_batch(&self, events: Vec<EventData>, options: SendOptions) -> BrokerResult<()> {
            self.inner.send_batch(events, options).await
        }
        async fn close(&self) -> BrokerResult<()> {
            if self.fail {
                return Err(BrokerError::Other {
                    reason: "socket reset".into(),
                });
            }
            self.inner.close().await
        }
    }

    struct BrokenConsumer {
        inner: Arc<dyn ConsumerClient>,
    }

    #[async_trait]
    impl ConsumerClient for BrokenConsumer {
        async fn subscribe(&self) -> BrokerResult<BrokerSubscription> {
            self.inner.subscribe().await
        }
        async fn close(&self) -> BrokerResult<()> {
            self.inner.close().await
        }
    }

    #[async_trait]
    impl BrokerClient for BrokenCloseBroker {
        async fn create_producer(&self, hub: &str) -> BrokerResult<Arc<dyn ProducerClient>> {
            Ok(Arc::new(BrokenProducer {
                inner: self.inner.create_producer(hub).await?,
                fail: hub == "broken",
            }))
        }
        async fn create_consumer(
            &self,
            hub: &str,
            consumer_group: &str,
        ) -> BrokerResult<Arc<dyn ConsumerClient>> {
            Ok(Arc::new(BrokenConsumer {
                inner: self.inner.create_consumer(hub, consumer_group).await?,
            }))
        }
    }

    #[tokio::test]
    async fn close_failure_does_not_block_the_rest() {
        let inner = InMemoryBroker::default();
        let cache = ConnectionCache::new(Arc::new(BrokenCloseBroker {
            inner: inner.clone(),
        }));
        cache.producer_for("broken").await.unwrap();
        cache.producer_for("users").await.unwrap();
        cache
            .consumer_for(&SubscriptionKey::new("users", "g"))
            .await
            .unwrap();

        let report = cache.close_all().await;
        assert_eq!(report.failures, 1);
        assert_eq!(report.producers_closed, 1);
        assert_eq!(report.consumers_closed, 1);
        assert_eq!(inner.stats().consumers_closed, 1);
    }

    // 创建句柄时停在闸门处，直到测试放行
    struct GatedBroker {
        inner: InMemoryBroker,
        entered: Arc<tokio::sync::Notify>,
        gate: Arc<tokio::sync::Notify>,
    }

    impl GatedBroker {
        fn new(inner: &InMemoryBroker) -> Self {
            Self {
                inner: inner.clone(),
                entered: Arc::new(tokio::sync::Notify::new()),
                gate: Arc::new(tokio::sync::Notify::new()),
            }
        }
    }

    #[async_trait]
    impl BrokerClient for GatedBroker {
        async fn create_producer(&self, hub: &str) -> BrokerResult<Arc<dyn ProducerClient>> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.create_producer(hub).await
        }
        async fn create_consumer(
            &self,
            hub: &str,
            consumer_group: &str,
        ) -> BrokerResult<Arc<dyn ConsumerClient>> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.create_consumer(hub, consumer_group).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn producer_created_during_close_is_closed_and_refused() {
        let inner = InMemoryBroker::default();
        let broker = GatedBroker::new(&inner);
        let (entered, gate) = (broker.entered.clone(), broker.gate.clone());
        let cache = Arc::new(ConnectionCache::new(Arc::new(broker)));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.producer_for("users").await.map(|_| ()) })
        };
        entered.notified().await;

        let report = cache.close_all().await;
        assert_eq!(report.producers_closed, 0);

        gate.notify_one();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HubError::ShutDown)));

        let stats = inner.stats();
        assert_eq!(stats.producers_created, 1);
        assert_eq!(stats.producers_closed, 1);
        assert!(inner.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consumer_created_during_close_is_closed_and_refused() {
        let inner = InMemoryBroker::default();
        let broker = GatedBroker::new(&inner);
        let (entered, gate) = (broker.entered.clone(), broker.gate.clone());
        let cache = Arc::new(ConnectionCache::new(Arc::new(broker)));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .consumer_for(&SubscriptionKey::new("users", "$Default"))
                    .await
                    .map(|_| ())
            })
        };
        entered.notified().await;

        let report = cache.close_all().await;
        assert_eq!(report.consumers_closed, 0);

        gate.notify_one();
        assert!(matches!(pending.await.unwrap(), Err(HubError::ShutDown)));

        let stats = inner.stats();
        assert_eq!(stats.consumers_created, 1);
        assert_eq!(stats.consumers_closed, 1);
    }
}
