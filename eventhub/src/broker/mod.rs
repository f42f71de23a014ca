//! broker 客户端协议
//!
//! 事件中枢只依赖这里定义的抽象，不绑定具体传输实现：
//! - `BrokerClient`：按 hub / 消费组创建生产者与消费者；
//! - `ProducerClient`：分区探测与批量发送；
//! - `ConsumerClient`：打开订阅，得到批次流与关闭句柄；
//! - `Checkpointer`：推进某条消息所在分区的检查点。
//!
//! 订阅流中的 `Err` 项即 broker 的错误通道，与具体消息无关。
//!
pub mod event_data;
#[cfg(feature = "inmemory")]
pub mod inmemory;

pub use event_data::{EventBatch, EventData, ReceivedEvent, SendOptions};
#[cfg(feature = "inmemory")]
pub use inmemory::{InMemoryBroker, InMemoryBrokerConfig, SentEvent};

use crate::error::BrokerResult;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::sync::Arc;

/// broker 客户端工厂
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn create_producer(&self, hub: &str) -> BrokerResult<Arc<dyn ProducerClient>>;

    async fn create_consumer(
        &self,
        hub: &str,
        consumer_group: &str,
    ) -> BrokerResult<Arc<dyn ConsumerClient>>;
}

/// 生产者句柄，可被多个发布方共享
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// 列出分区标识（创建后用于探测连通性）
    async fn partition_ids(&self) -> BrokerResult<Vec<String>>;

    async fn send_batch(&self, events: Vec<EventData>, options: SendOptions) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}

/// 消费者句柄，按 (hub, 消费组) 共享
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    async fn subscribe(&self) -> BrokerResult<BrokerSubscription>;

    async fn close(&self) -> BrokerResult<()>;
}

/// 订阅关闭句柄；关闭后 broker 不再投递新的批次
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    async fn close(&self) -> BrokerResult<()>;
}

/// 检查点推进
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn update_checkpoint(&self, event: &ReceivedEvent) -> BrokerResult<()>;
}

/// 一次打开的订阅：'static 生命周期的批次流，便于在 tokio::spawn 中消费
pub struct BrokerSubscription {
    pub events: BoxStream<'static, BrokerResult<EventBatch>>,
    pub handle: Box<dyn SubscriptionHandle>,
}
