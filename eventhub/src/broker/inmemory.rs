//! 内存版 broker（InMemoryBroker）
//!
//! 进程内实现 `BrokerClient` 全套协议，用于测试、示例与本地开发：
//! - 每个 hub 固定若干分区，分区内为只追加日志，带序号与入队时间；
//! - 带分区键的消息确定性地落到同一分区，否则轮询；
//! - 按 (hub, 消费组, 分区) 保存检查点，新订阅从最后检查点之后继续，
//!   未推进检查点的消息会被重新投递（至少一次）；
//! - 支持故障注入（不可达、探测失败、发送失败、投递错误）与计数统计。
//!
use super::{
    BrokerClient, BrokerSubscription, Checkpointer, ConsumerClient, EventBatch, EventData,
    ProducerClient, ReceivedEvent, SendOptions, SubscriptionHandle,
};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_HUB_NAME_LEN: usize = 256;

/// 内存 broker 配置
#[derive(Clone, Copy, Debug)]
pub struct InMemoryBrokerConfig {
    /// 每个 hub 的分区数
    pub partition_count: usize,
    /// 单个批次的最大消息数
    pub max_batch_size: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            partition_count: 2,
            max_batch_size: 16,
        }
    }
}

/// 已发送消息的记录（用于断言）
#[derive(Clone, Debug, PartialEq)]
pub struct SentEvent {
    pub hub: String,
    pub data: EventData,
    pub partition_key: Option<String>,
    pub partition_id: String,
}

/// 计数快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub producers_created: usize,
    pub consumers_created: usize,
    pub producers_closed: usize,
    pub consumers_closed: usize,
    pub subscriptions_opened: usize,
    pub subscriptions_closed: usize,
    pub checkpoints_updated: usize,
}

#[derive(Default)]
struct Counters {
    producers_created: AtomicUsize,
    consumers_created: AtomicUsize,
    producers_closed: AtomicUsize,
    consumers_closed: AtomicUsize,
    subscriptions_opened: AtomicUsize,
    subscriptions_closed: AtomicUsize,
    checkpoints_updated: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    unreachable: AtomicBool,
    fail_sends: AtomicBool,
    failing_probes: DashMap<String, ()>,
}

struct HubLog {
    name: String,
    partitions: Vec<Mutex<Vec<ReceivedEvent>>>,
    round_robin: AtomicUsize,
    errors: Mutex<Vec<BrokerError>>,
    notify: Notify,
}

impl HubLog {
    fn new(name: &str, partition_count: usize) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partition_count.max(1))
                .map(|_| Mutex::new(Vec::new()))
                .collect(),
            round_robin: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    fn partition_for(&self, partition_key: Option<&str>) -> usize {
        let count = self.partitions.len();
        match partition_key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        }
    }

    fn append(&self, data: EventData, partition_key: Option<&str>) -> ReceivedEvent {
        let partition = self.partition_for(partition_key);
        let received = {
            let mut log = lock(&self.partitions[partition]);
            let received = ReceivedEvent {
                body: data.body,
                properties: data.properties,
                partition_id: partition.to_string(),
                sequence_number: log.len() as i64,
                enqueued_at: Utc::now(),
            };
            log.push(received.clone());
            received
        };
        self.notify.notify_waiters();
        received
    }
}

struct Inner {
    config: InMemoryBrokerConfig,
    hubs: DashMap<String, Arc<HubLog>>,
    // (hub, 消费组, 分区) -> 最后一个已检查点的序号
    checkpoints: DashMap<(String, String, String), i64>,
    sent: Mutex<Vec<SentEvent>>,
    faults: Faults,
    counters: Counters,
    root: CancellationToken,
}

impl Inner {
    fn hub(&self, name: &str) -> BrokerResult<Arc<HubLog>> {
        validate_hub_name(name)?;
        let hub = self
            .hubs
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(HubLog::new(name, self.config.partition_count)))
            .clone();
        Ok(hub)
    }

    fn ensure_reachable(&self) -> BrokerResult<()> {
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::unreachable("in-memory broker marked unreachable"));
        }
        Ok(())
    }
}

/// 内存 broker，克隆后共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                hubs: DashMap::new(),
                checkpoints: DashMap::new(),
                sent: Mutex::new(Vec::new()),
                faults: Faults::default(),
                counters: Counters::default(),
                root: CancellationToken::new(),
            }),
        }
    }

    /// 直接向 hub 追加一条消息（绕过生产者）
    pub fn enqueue(
        &self,
        hub: &str,
        data: EventData,
        partition_key: Option<&str>,
    ) -> BrokerResult<ReceivedEvent> {
        Ok(self.inner.hub(hub)?.append(data, partition_key))
    }

    /// 模拟 broker 不可达：探测、创建消费者与发送都会失败
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner
            .faults
            .unreachable
            .store(unreachable, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.faults.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// 让某个 hub 的分区探测失败
    pub fn fail_probe(&self, hub: &str, fail: bool) {
        if fail {
            self.inner.faults.failing_probes.insert(hub.to_string(), ());
        } else {
            self.inner.faults.failing_probes.remove(hub);
        }
    }

    /// 向该 hub 上所有已打开的订阅注入一次投递错误
    pub fn inject_delivery_error(&self, hub: &str, reason: &str) -> BrokerResult<()> {
        let hub = self.inner.hub(hub)?;
        lock(&hub.errors).push(BrokerError::delivery(reason));
        hub.notify.notify_waiters();
        Ok(())
    }

    pub fn sent(&self) -> Vec<SentEvent> {
        lock(&self.inner.sent).clone()
    }

    pub fn sent_to(&self, hub: &str) -> Vec<SentEvent> {
        lock(&self.inner.sent)
            .iter()
            .filter(|s| s.hub == hub)
            .cloned()
            .collect()
    }

    /// 某分区上的全部消息
    pub fn partition_log(&self, hub: &str, partition_id: &str) -> Vec<ReceivedEvent> {
        let Some(hub) = self.inner.hubs.get(hub).map(|h| h.clone()) else {
            return Vec::new();
        };
        partition_id
            .parse::<usize>()
            .ok()
            .and_then(|p| hub.partitions.get(p))
            .map(|log| lock(log).clone())
            .unwrap_or_default()
    }

    pub fn checkpoint(&self, hub: &str, consumer_group: &str, partition_id: &str) -> Option<i64> {
        self.inner
            .checkpoints
            .get(&(
                hub.to_string(),
                consumer_group.to_string(),
                partition_id.to_string(),
            ))
            .map(|v| *v)
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            producers_created: c.producers_created.load(Ordering::SeqCst),
            consumers_created: c.consumers_created.load(Ordering::SeqCst),
            producers_closed: c.producers_closed.load(Ordering::SeqCst),
            consumers_closed: c.consumers_closed.load(Ordering::SeqCst),
            subscriptions_opened: c.subscriptions_opened.load(Ordering::SeqCst),
            subscriptions_closed: c.subscriptions_closed.load(Ordering::SeqCst),
            checkpoints_updated: c.checkpoints_updated.load(Ordering::SeqCst),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn create_producer(&self, hub: &str) -> BrokerResult<Arc<dyn ProducerClient>> {
        let hub = self.inner.hub(hub)?;
        self.inner
            .counters
            .producers_created
            .fetch_add(1, Ordering::SeqCst);
        debug!(hub = %hub.name, "in-memory producer created");

        Ok(Arc::new(InMemoryProducer {
            broker: self.inner.clone(),
            hub,
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(
        &self,
        hub: &str,
        consumer_group: &str,
    ) -> BrokerResult<Arc<dyn ConsumerClient>> {
        let hub = self.inner.hub(hub)?;
        self.inner.ensure_reachable()?;
        self.inner
            .counters
            .consumers_created
            .fetch_add(1, Ordering::SeqCst);
        debug!(hub = %hub.name, consumer_group, "in-memory consumer created");

        Ok(Arc::new(InMemoryConsumer {
            broker: self.inner.clone(),
            hub,
            consumer_group: consumer_group.to_string(),
            token: self.inner.root.child_token(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryProducer {
    broker: Arc<Inner>,
    hub: Arc<HubLog>,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerClient for InMemoryProducer {
    async fn partition_ids(&self) -> BrokerResult<Vec<String>> {
        self.broker.ensure_reachable()?;
        if self.broker.faults.failing_probes.contains_key(&self.hub.name) {
            return Err(BrokerError::unreachable(format!(
                "partition probe failed for {}",
                self.hub.name
            )));
        }
        Ok((0..self.hub.partitions.len()).map(|p| p.to_string()).collect())
    }

    async fn send_batch(&self, events: Vec<EventData>, options: SendOptions) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.broker.ensure_reachable()?;
        if self.broker.faults.fail_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::send_failed("in-memory send rejected"));
        }

        for data in events {
            let received = self
                .hub
                .append(data.clone(), options.partition_key.as_deref());
            lock(&self.broker.sent).push(SentEvent {
                hub: self.hub.name.clone(),
                data,
                partition_key: options.partition_key.clone(),
                partition_id: received.partition_id,
            });
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.broker
            .counters
            .producers_closed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryConsumer {
    broker: Arc<Inner>,
    hub: Arc<HubLog>,
    consumer_group: String,
    token: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerClient for InMemoryConsumer {
    async fn subscribe(&self) -> BrokerResult<BrokerSubscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.broker.ensure_reachable()?;

        let cursors = (0..self.hub.partitions.len())
            .map(|p| {
                let key = (
                    self.hub.name.clone(),
                    self.consumer_group.clone(),
                    p.to_string(),
                );
                self.broker
                    .checkpoints
                    .get(&key)
                    .map(|seq| *seq + 1)
                    .unwrap_or(0)
            })
            .collect();
        let error_cursor = lock(&self.hub.errors).len();
        let token = self.token.child_token();

        let state = StreamState {
            hub: self.hub.clone(),
            checkpointer: Arc::new(InMemoryCheckpointer {
                broker: self.broker.clone(),
                hub: self.hub.name.clone(),
                consumer_group: self.consumer_group.clone(),
            }),
            cursors,
            error_cursor,
            next_partition: 0,
            max_batch_size: self.broker.config.max_batch_size.max(1),
            token: token.clone(),
        };

        self.broker
            .counters
            .subscriptions_opened
            .fetch_add(1, Ordering::SeqCst);

        Ok(BrokerSubscription {
            events: Box::pin(stream::unfold(state, next_item)),
            handle: Box::new(InMemorySubscriptionHandle {
                broker: self.broker.clone(),
                token,
                closed: AtomicBool::new(false),
            }),
        })
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.token.cancel();
        self.broker
            .counters
            .consumers_closed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemorySubscriptionHandle {
    broker: Arc<Inner>,
    token: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl SubscriptionHandle for InMemorySubscriptionHandle {
    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.token.cancel();
        self.broker
            .counters
            .subscriptions_closed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryCheckpointer {
    broker: Arc<Inner>,
    hub: String,
    consumer_group: String,
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn update_checkpoint(&self, event: &ReceivedEvent) -> BrokerResult<()> {
        let key = (
            self.hub.clone(),
            self.consumer_group.clone(),
            event.partition_id.clone(),
        );
        let mut entry = self.broker.checkpoints.entry(key).or_insert(event.sequence_number);
        if *entry < event.sequence_number {
            *entry = event.sequence_number;
        }
        self.broker
            .counters
            .checkpoints_updated
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StreamState {
    hub: Arc<HubLog>,
    checkpointer: Arc<InMemoryCheckpointer>,
    cursors: Vec<i64>,
    error_cursor: usize,
    next_partition: usize,
    max_batch_size: usize,
    token: CancellationToken,
}

impl StreamState {
    fn take_error(&mut self) -> Option<BrokerError> {
        let errors = lock(&self.hub.errors);
        let err = errors.get(self.error_cursor).cloned()?;
        self.error_cursor += 1;
        Some(err)
    }

    // 分区间轮询，避免单个分区饿死其他分区
    fn take_batch(&mut self) -> Option<EventBatch> {
        let count = self.hub.partitions.len();
        for offset in 0..count {
            let p = (self.next_partition + offset) % count;
            let cursor = self.cursors[p] as usize;
            let events: Vec<ReceivedEvent> = {
                let log = lock(&self.hub.partitions[p]);
                if log.len() <= cursor {
                    continue;
                }
                let end = (cursor + self.max_batch_size).min(log.len());
                log[cursor..end].to_vec()
            };

            self.cursors[p] += events.len() as i64;
            self.next_partition = (p + 1) % count;
            return Some(EventBatch {
                partition_id: p.to_string(),
                events,
                checkpointer: self.checkpointer.clone(),
            });
        }
        None
    }
}

async fn next_item(mut st: StreamState) -> Option<(BrokerResult<EventBatch>, StreamState)> {
    loop {
        if st.token.is_cancelled() {
            return None;
        }

        // 先登记等待，再检查数据，避免错过检查与等待之间的通知
        let hub = st.hub.clone();
        let notified = hub.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(err) = st.take_error() {
            return Some((Err(err), st));
        }
        if let Some(batch) = st.take_batch() {
            return Some((Ok(batch), st));
        }

        tokio::select! {
            _ = st.token.cancelled() => return None,
            _ = &mut notified => {}
        }
    }
}

fn validate_hub_name(name: &str) -> BrokerResult<()> {
    let invalid = || BrokerError::InvalidHub {
        hub: name.to_string(),
    };
    let mut chars = name.chars();
    let first = chars.next().ok_or_else(invalid)?;
    if name.len() > MAX_HUB_NAME_LEN || !first.is_ascii_alphanumeric() {
        return Err(invalid());
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
        return Err(invalid());
    }
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
