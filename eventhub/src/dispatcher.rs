//! 订阅分发器（SubscriptionDispatcher）
//!
//! 每个 (hub, 消费组) 键对应一个状态机：
//! - `Unopened`：发现阶段累积订阅者；
//! - `Open`：启动阶段打开唯一一条 broker 订阅，此后不可逆；
//! - `Closed`：仅在关闭时进入。
//!
//! 投递规则：
//! - 批次内逐条处理；每条消息按注册顺序依次调用匹配的订阅者；
//! - 订阅者的错误与 panic 在调用边界被捕获并记录，不影响后续订阅者；
//! - 该消息的所有匹配订阅者都尝试过之后才推进检查点；
//! - broker 错误通道上的错误只记录日志，订阅保持打开。
//!
use crate::broker::{BrokerSubscription, EventBatch, ReceivedEvent, SubscriptionHandle};
use crate::cache::ConnectionCache;
use crate::error::{BrokerResult, HubError, HubResult};
use crate::metadata::{HubOptions, InstanceId, SubscriptionKey};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 类型擦除后的订阅者调用
pub type SubscriberFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 将异步闭包包装为 `SubscriberFn`
pub fn subscriber_fn<F, Fut>(f: F) -> SubscriberFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |body| f(body).boxed())
}

/// 订阅者条目：(实例, 方法, 注解)，注册后不可变
#[derive(Clone)]
pub struct SubscriberEntry {
    instance: InstanceId,
    method: String,
    options: HubOptions,
    handler: SubscriberFn,
}

impl SubscriberEntry {
    pub fn new(
        instance: InstanceId,
        method: impl Into<String>,
        options: HubOptions,
        handler: SubscriberFn,
    ) -> Self {
        Self {
            instance,
            method: method.into(),
            options,
            handler,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// 无路由键匹配全部；否则要求消息路由键精确相等（区分大小写）
    pub fn matches(&self, routing_key: Option<&str>) -> bool {
        match self.options.routing_key() {
            None => true,
            Some(wanted) => routing_key == Some(wanted),
        }
    }

    async fn invoke(&self, body: Value) -> HubResult<()> {
        let handler = Arc::clone(&self.handler);
        let outcome = AssertUnwindSafe(async move { handler(body).await })
            .catch_unwind()
            .await;

        let reason = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => panic_message(&*panic),
        };
        Err(HubError::SubscriberHandler {
            subscriber: format!("{}::{}", self.instance, self.method),
            reason,
        })
    }
}

impl fmt::Debug for SubscriberEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberEntry")
            .field("instance", &self.instance)
            .field("method", &self.method)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// 某个键打开时冻结的订阅者列表
struct FanOut {
    key: SubscriptionKey,
    subscribers: Arc<[SubscriberEntry]>,
}

impl FanOut {
    async fn dispatch_batch(&self, batch: EventBatch) {
        for event in &batch.events {
            self.dispatch_event(event).await;

            if let Err(e) = batch.checkpointer.update_checkpoint(event).await {
                error!(
                    hub = self.key.hub(),
                    consumer_group = self.key.consumer_group(),
                    partition_id = %batch.partition_id,
                    error = %e,
                    "failed to update checkpoint"
                );
            }
        }
    }

    async fn dispatch_event(&self, event: &ReceivedEvent) {
        let routing_key = event.routing_key();
        for sub in self.subscribers.iter().filter(|s| s.matches(routing_key)) {
            if let Err(e) = sub.invoke(event.body.clone()).await {
                error!(
                    hub = self.key.hub(),
                    consumer_group = self.key.consumer_group(),
                    service = sub.instance.service(),
                    method = %sub.method,
                    routing_key,
                    partition_id = %event.partition_id,
                    error = %e,
                    "error in subscriber handler"
                );
            }
        }
    }
}

async fn run_subscription(
    fan_out: FanOut,
    mut events: BoxStream<'static, BrokerResult<EventBatch>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = events.next() => match next {
                Some(Ok(batch)) => fan_out.dispatch_batch(batch).await,
                Some(Err(source)) => {
                    let err = HubError::BrokerDelivery {
                        key: fan_out.key.to_string(),
                        source,
                    };
                    error!(
                        hub = fan_out.key.hub(),
                        consumer_group = fan_out.key.consumer_group(),
                        error = %err,
                        "error from event hub subscription"
                    );
                }
                None => break,
            }
        }
    }
    debug!(key = %fan_out.key, "subscription loop stopped");
}

struct OpenSubscription {
    handle: Box<dyn SubscriptionHandle>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

enum SlotState {
    Unopened,
    Open(OpenSubscription),
    Closed,
}

struct KeySlot {
    key: SubscriptionKey,
    entries: Vec<SubscriberEntry>,
    state: SlotState,
}

/// 订阅关闭统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionCloseReport {
    pub closed: usize,
    pub failures: usize,
}

/// 订阅分发器
pub struct SubscriptionDispatcher {
    // 按键首次出现的顺序保存
    slots: Vec<KeySlot>,
    root: CancellationToken,
}

impl Default for SubscriptionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionDispatcher {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            root: CancellationToken::new(),
        }
    }

    /// 加入待打开列表
    ///
    /// 同一 (实例, 方法) 重复加入时覆盖旧条目。键已打开或已关闭时不加入并返回 false。
    pub fn add(&mut self, key: SubscriptionKey, entry: SubscriberEntry) -> bool {
        let idx = match self.slots.iter().position(|s| s.key == key) {
            Some(idx) => idx,
            None => {
                self.slots.push(KeySlot {
                    key,
                    entries: Vec::new(),
                    state: SlotState::Unopened,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[idx];

        if !matches!(slot.state, SlotState::Unopened) {
            warn!(
                hub = slot.key.hub(),
                consumer_group = slot.key.consumer_group(),
                service = entry.instance.service(),
                method = %entry.method,
                "subscription already started, late subscriber will not receive messages"
            );
            return false;
        }

        info!(
            hub = slot.key.hub(),
            consumer_group = slot.key.consumer_group(),
            service = entry.instance.service(),
            method = %entry.method,
            routing_key = entry.options.routing_key(),
            "registered subscriber"
        );

        let existing = slot
            .entries
            .iter_mut()
            .find(|e| e.instance == entry.instance && e.method == entry.method);
        match existing {
            Some(e) => *e = entry,
            None => slot.entries.push(entry),
        }
        true
    }

    /// 为每个有订阅者的未打开键打开订阅，返回本次打开的键
    ///
    /// 单个键打开失败只记录日志，该键保持未打开，可再次调用重试。
    pub async fn start(&mut self, cache: &ConnectionCache) -> HubResult<Vec<SubscriptionKey>> {
        let mut opened = Vec::new();

        for slot in self.slots.iter_mut() {
            if !matches!(slot.state, SlotState::Unopened) || slot.entries.is_empty() {
                continue;
            }

            let subscription = match Self::open(cache, &slot.key).await {
                Ok(subscription) => subscription,
                Err(HubError::ShutDown) => return Err(HubError::ShutDown),
                Err(e) => {
                    error!(
                        hub = slot.key.hub(),
                        consumer_group = slot.key.consumer_group(),
                        error = %e,
                        "failed to start subscription"
                    );
                    continue;
                }
            };

            let BrokerSubscription { events, handle } = subscription;
            let token = self.root.child_token();
            let fan_out = FanOut {
                key: slot.key.clone(),
                subscribers: slot.entries.clone().into(),
            };
            let task = tokio::spawn(run_subscription(fan_out, events, token.clone()));

            info!(
                hub = slot.key.hub(),
                consumer_group = slot.key.consumer_group(),
                subscribers = slot.entries.len(),
                "subscription started"
            );
            slot.state = SlotState::Open(OpenSubscription {
                handle,
                token,
                task,
            });
            opened.push(slot.key.clone());
        }

        Ok(opened)
    }

    async fn open(cache: &ConnectionCache, key: &SubscriptionKey) -> HubResult<BrokerSubscription> {
        let consumer = cache.consumer_for(key).await?;
        consumer
            .subscribe()
            .await
            .map_err(|e| HubError::connection(key.hub(), e))
    }

    /// 关闭全部已打开的订阅，并等待正在处理的批次结束
    pub async fn close_all(&mut self) -> SubscriptionCloseReport {
        let mut report = SubscriptionCloseReport::default();

        for slot in self.slots.iter_mut() {
            let state = std::mem::replace(&mut slot.state, SlotState::Closed);
            let SlotState::Open(open) = state else {
                continue;
            };

            match open.handle.close().await {
                Ok(()) => report.closed += 1,
                Err(source) => {
                    report.failures += 1;
                    let err = HubError::Close {
                        resource: format!("subscription {}", slot.key),
                        source,
                    };
                    error!(key = %slot.key, error = %err, "failed to close subscription");
                }
            }

            open.token.cancel();
            if let Err(e) = open.task.await {
                error!(key = %slot.key, error = %e, "subscription task ended abnormally");
            }
        }

        report
    }

    pub fn is_open(&self, key: &SubscriptionKey) -> bool {
        self.slot(key)
            .is_some_and(|s| matches!(s.state, SlotState::Open(_)))
    }

    pub fn open_keys(&self) -> Vec<SubscriptionKey> {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Open(_)))
            .map(|s| s.key.clone())
            .collect()
    }

    pub fn subscribers_of(&self, key: &SubscriptionKey) -> &[SubscriberEntry] {
        self.slot(key).map(|s| s.entries.as_slice()).unwrap_or(&[])
    }

    fn slot(&self, key: &SubscriptionKey) -> Option<&KeySlot> {
        self.slots.iter().find(|s| s.key == *key)
    }
}

impl Drop for SubscriptionDispatcher {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
