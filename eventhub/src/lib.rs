//! 事件中枢（eventhub）
//!
//! 注解驱动的发布/订阅中介层：将普通方法调用转为分区消息中间件上的收发操作，
//! 调用方无需感知 broker 的存在。
//!
//! - `metadata`：方法上的发布/订阅意图与注册表；
//! - `cache`：按 hub、(hub, 消费组) 惰性创建并复用 broker 句柄；
//! - `publisher`：先执行原方法再发送其返回值的拦截器；
//! - `dispatcher`：每个 (hub, 消费组) 一条订阅，按路由键扇出并推进检查点；
//! - `discovery`：两阶段启动与有序关闭的协调者 `EventHub`；
//! - `broker`：broker 客户端协议与内存实现。
//!
//! 服务通常借助 `eventhub-macros` 的 `#[event_hub]` 声明发布/订阅方法。
//!
// 使宏生成的 `::eventhub::...` 路径在本 crate 内部同样可用
extern crate self as eventhub;

pub mod broker;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod metadata;
pub mod publisher;

pub use config::{ConnectionString, HubConfig};
pub use discovery::{
    DiscoveryReport, EventHub, HubService, ServiceManifest, ServiceProvider, ServiceRegistry,
    ShutdownReport,
};
pub use error::{BrokerError, HubError, HubResult};
pub use metadata::{HubOptions, SubscriptionKey};
pub use publisher::{PublisherSlot, PublisherSlots};

// 宏生成代码依赖的 crate，不属于公开 API
#[doc(hidden)]
pub mod __private {
    pub use anyhow;
    pub use serde_json;
}
