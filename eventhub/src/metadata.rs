//! 元数据注册表（MetadataRegistry）
//!
//! 保存方法上的发布/订阅意图（hub、路由键、消费组、分区键），纯数据、无 I/O。
//! 同一方法最多各有一条 Publish 与 Subscribe 记录，两者互相独立；
//! 以 (实例, 方法, 类型) 为键重复注册时覆盖旧记录。
//!
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 未指定消费组时使用的默认消费组
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// 消息元数据中承载路由键的属性名
pub const ROUTING_KEY_PROPERTY: &str = "routingKey";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnnotationKind {
    Publish,
    Subscribe,
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationKind::Publish => f.write_str("publish"),
            AnnotationKind::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// 方法注解选项
#[derive(Builder, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubOptions {
    /// 缺省时使用配置中的默认 hub
    #[builder(into)]
    hub_name: Option<String>,
    /// 发布方：缺省不打标；订阅方：缺省匹配全部
    #[builder(into)]
    routing_key: Option<String>,
    /// 仅订阅方使用，缺省 `$Default`
    #[builder(into)]
    consumer_group: Option<String>,
    /// 仅发布方使用，将消息固定到某个分区
    #[builder(into)]
    partition_key: Option<String>,
}

impl HubOptions {
    pub fn hub_name(&self) -> Option<&str> {
        self.hub_name.as_deref()
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn consumer_group(&self) -> Option<&str> {
        self.consumer_group.as_deref()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// 消费组，缺省 `$Default`
    pub fn consumer_group_or_default(&self) -> &str {
        self.consumer_group.as_deref().unwrap_or(DEFAULT_CONSUMER_GROUP)
    }
}

/// 注册到方法上的一条记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRecord {
    pub kind: AnnotationKind,
    pub options: HubOptions,
}

impl MethodRecord {
    pub fn publish(options: HubOptions) -> Self {
        Self {
            kind: AnnotationKind::Publish,
            options,
        }
    }

    pub fn subscribe(options: HubOptions) -> Self {
        Self {
            kind: AnnotationKind::Subscribe,
            options,
        }
    }
}

/// 服务实例标识（按对象身份区分同类型的多个实例）
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    service: &'static str,
    addr: usize,
}

impl InstanceId {
    pub fn new(service: &'static str, addr: usize) -> Self {
        Self { service, addr }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.service, self.addr)
    }
}

/// 消费者 / 订阅的缓存键：(hub, 消费组)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    hub: String,
    consumer_group: String,
}

impl SubscriptionKey {
    pub fn new(hub: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            hub: hub.into(),
            consumer_group: consumer_group.into(),
        }
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.hub, self.consumer_group)
    }
}

#[derive(Clone, Debug)]
struct Entry {
    instance: InstanceId,
    method: String,
    record: MethodRecord,
}

/// 元数据注册表
#[derive(Clone, Debug, Default)]
pub struct MetadataRegistry {
    // 保持注册顺序，便于按声明顺序取回
    entries: Vec<Entry>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一条记录；同一 (实例, 方法, 类型) 覆盖旧值并保留原位置
    pub fn register(&mut self, instance: &InstanceId, method: &str, record: MethodRecord) {
        let existing = self.entries.iter_mut().find(|e| {
            e.instance == *instance && e.method == method && e.record.kind == record.kind
        });

        match existing {
            Some(entry) => entry.record = record,
            None => self.entries.push(Entry {
                instance: instance.clone(),
                method: method.to_string(),
                record,
            }),
        }
    }

    pub fn publishers_of(&self, instance: &InstanceId) -> Vec<(&str, &HubOptions)> {
        self.of_kind(instance, AnnotationKind::Publish)
    }

    pub fn subscribers_of(&self, instance: &InstanceId) -> Vec<(&str, &HubOptions)> {
        self.of_kind(instance, AnnotationKind::Subscribe)
    }

    /// 查询单个方法的某类记录
    pub fn get(
        &self,
        instance: &InstanceId,
        method: &str,
        kind: AnnotationKind,
    ) -> Option<&MethodRecord> {
        self.entries
            .iter()
            .find(|e| e.instance == *instance && e.method == method && e.record.kind == kind)
            .map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn of_kind(&self, instance: &InstanceId, kind: AnnotationKind) -> Vec<(&str, &HubOptions)> {
        self.entries
            .iter()
            .filter(|e| e.instance == *instance && e.record.kind == kind)
            .map(|e| (e.method.as_str(), &e.record.options))
            .collect()
    }
}
