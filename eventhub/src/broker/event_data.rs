//! 消息信封
//!
//! 路由键作为元数据属性随消息传递，订阅方无需反序列化消息体即可过滤。
//!
use super::Checkpointer;
use crate::metadata::ROUTING_KEY_PROPERTY;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 待发送的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub body: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

impl EventData {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 附加路由键（`None` 时不打标）
    pub fn with_routing_key(self, routing_key: Option<&str>) -> Self {
        match routing_key {
            Some(rk) => self.with_property(ROUTING_KEY_PROPERTY, rk),
            None => self,
        }
    }

    pub fn routing_key(&self) -> Option<&str> {
        routing_key_of(&self.properties)
    }
}

/// 发送选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// 分区提示，缺省由 broker 决定
    pub partition_key: Option<String>,
}

impl SendOptions {
    pub fn with_partition_key(partition_key: Option<&str>) -> Self {
        Self {
            partition_key: partition_key.map(str::to_string),
        }
    }
}

/// broker 投递的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedEvent {
    pub body: Value,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub partition_id: String,
    pub sequence_number: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl ReceivedEvent {
    pub fn routing_key(&self) -> Option<&str> {
        routing_key_of(&self.properties)
    }
}

/// 来自同一分区的一批消息，附带该分区的检查点句柄
pub struct EventBatch {
    pub partition_id: String,
    pub events: Vec<ReceivedEvent>,
    pub checkpointer: Arc<dyn Checkpointer>,
}

impl fmt::Debug for EventBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBatch")
            .field("partition_id", &self.partition_id)
            .field("events", &self.events.len())
            .finish()
    }
}

// 非字符串的路由键视为未打标
fn routing_key_of(properties: &BTreeMap<String, Value>) -> Option<&str> {
    properties.get(ROUTING_KEY_PROPERTY).and_then(Value::as_str)
}
