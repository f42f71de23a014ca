//! 发现驱动（Discovery Driver）与事件中枢协调者（EventHub）
//!
//! 两阶段启动：
//! 1. 扫描阶段 `discover`：遍历全部服务实例的清单，登记元数据；
//!    发布方法立即安装拦截器，订阅方法加入分发器的待打开列表；
//! 2. 启动阶段 `start`：为每个有订阅者的 (hub, 消费组) 打开订阅。
//!
//! 关闭顺序：订阅 → 生产者 → 消费者；单个关闭失败只记录日志。
//!
use crate::broker::BrokerClient;
use crate::cache::ConnectionCache;
use crate::config::HubConfig;
use crate::dispatcher::{SubscriberEntry, SubscriberFn, SubscriptionDispatcher, subscriber_fn};
use crate::error::{BrokerError, HubError, HubResult};
use crate::metadata::{HubOptions, InstanceId, MetadataRegistry, MethodRecord, SubscriptionKey};
use crate::publisher::{PublishInterceptor, PublisherSlot};
use bon::Builder;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::event_hub_builder::{IsUnset, SetCache, State as BuilderState};

/// 可被事件中枢发现的服务
///
/// 通常由 `#[event_hub]` 宏生成实现。
pub trait HubService: Send + Sync + 'static {
    fn service_name(&self) -> &'static str;

    /// 该实例的发布/订阅清单
    fn manifest(self: Arc<Self>) -> ServiceManifest;
}

struct PublisherDecl {
    method: &'static str,
    options: HubOptions,
    slot: PublisherSlot,
}

struct SubscriberDecl {
    method: &'static str,
    options: HubOptions,
    handler: SubscriberFn,
}

/// 服务显式声明的 (方法, 注解) 清单
#[derive(Default)]
pub struct ServiceManifest {
    publishers: Vec<PublisherDecl>,
    subscribers: Vec<SubscriberDecl>,
}

impl ServiceManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(mut self, method: &'static str, options: HubOptions, slot: PublisherSlot) -> Self {
        self.publishers.push(PublisherDecl {
            method,
            options,
            slot,
        });
        self
    }

    pub fn subscribe<F, Fut>(mut self, method: &'static str, options: HubOptions, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribers.push(SubscriberDecl {
            method,
            options,
            handler: subscriber_fn(handler),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.publishers.len() + self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 服务实例提供者（如依赖注入容器）：列出全部存活实例
pub trait ServiceProvider {
    fn services(&self) -> Vec<Arc<dyn HubService>>;
}

impl ServiceProvider for Vec<Arc<dyn HubService>> {
    fn services(&self) -> Vec<Arc<dyn HubService>> {
        self.clone()
    }
}

impl ServiceProvider for [Arc<dyn HubService>] {
    fn services(&self) -> Vec<Arc<dyn HubService>> {
        self.to_vec()
    }
}

/// 简单的服务容器
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<dyn HubService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: HubService>(mut self, service: Arc<S>) -> Self {
        self.services.push(service);
        self
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ServiceProvider for ServiceRegistry {
    fn services(&self) -> Vec<Arc<dyn HubService>> {
        self.services.clone()
    }
}

/// 扫描阶段统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub services: usize,
    pub publishers: usize,
    pub subscribers: usize,
}

/// 关闭统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub subscriptions_closed: usize,
    pub producers_closed: usize,
    pub consumers_closed: usize,
    pub failures: usize,
}

#[derive(Default)]
struct HubState {
    registry: MetadataRegistry,
    dispatcher: SubscriptionDispatcher,
    shut_down: bool,
}

/// 事件中枢：启动时构造一次，持有全部连接与订阅状态
///
/// 未调用 `shutdown` 即被丢弃时，投递任务会被取消。
#[derive(Builder)]
pub struct EventHub {
    config: HubConfig,
    #[builder(setters(vis = "pub(crate)"))]
    cache: Arc<ConnectionCache>,
    #[builder(skip)]
    state: Mutex<HubState>,
}

impl<S: BuilderState> EventHubBuilder<S> {
    pub fn broker(self, broker: Arc<dyn BrokerClient>) -> EventHubBuilder<SetCache<S>>
    where
        <S as BuilderState>::Cache: IsUnset,
    {
        self.cache(Arc::new(ConnectionCache::new(broker)))
    }
}

impl EventHub {
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// 扫描阶段
    pub async fn discover<P>(&self, provider: &P) -> HubResult<DiscoveryReport>
    where
        P: ServiceProvider + ?Sized,
    {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(HubError::ShutDown);
        }
        let HubState {
            registry,
            dispatcher,
            ..
        } = &mut *state;

        let mut report = DiscoveryReport::default();
        for service in provider.services() {
            report.services += 1;
            let name = service.service_name();
            let instance = InstanceId::new(name, Arc::as_ptr(&service) as *const () as usize);
            let manifest = Arc::clone(&service).manifest();

            for decl in manifest.publishers {
                registry.register(&instance, decl.method, MethodRecord::publish(decl.options.clone()));
                self.install_publisher(name, decl);
                report.publishers += 1;
            }

            for decl in manifest.subscribers {
                registry.register(
                    &instance,
                    decl.method,
                    MethodRecord::subscribe(decl.options.clone()),
                );
                if self.add_subscriber(dispatcher, &instance, decl) {
                    report.subscribers += 1;
                }
            }
        }

        debug!(
            services = report.services,
            publishers = report.publishers,
            subscribers = report.subscribers,
            "discovery finished"
        );
        Ok(report)
    }

    /// 启动阶段：返回本次打开的订阅键；失败的键可再次调用重试
    pub async fn start(&self) -> HubResult<Vec<SubscriptionKey>> {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(HubError::ShutDown);
        }
        state.dispatcher.start(&self.cache).await
    }

    /// 扫描并启动
    pub async fn initialize<P>(&self, provider: &P) -> HubResult<Vec<SubscriptionKey>>
    where
        P: ServiceProvider + ?Sized,
    {
        self.discover(provider).await?;
        self.start().await
    }

    /// 关闭全部订阅、生产者与消费者；重复调用为空操作
    pub async fn shutdown(&self) -> ShutdownReport {
        // 取出分发器后释放锁：订阅者在收尾期间仍可查询中枢状态
        let mut dispatcher = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return ShutdownReport::default();
            }
            state.shut_down = true;
            std::mem::take(&mut state.dispatcher)
        };

        let subscriptions = dispatcher.close_all().await;
        let connections = self.cache.close_all().await;

        let report = ShutdownReport {
            subscriptions_closed: subscriptions.closed,
            producers_closed: connections.producers_closed,
            consumers_closed: connections.consumers_closed,
            failures: subscriptions.failures + connections.failures,
        };
        info!(
            subscriptions = report.subscriptions_closed,
            producers = report.producers_closed,
            consumers = report.consumers_closed,
            failures = report.failures,
            "event hub shut down"
        );
        report
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.lock().await.shut_down
    }

    pub async fn open_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.state.lock().await.dispatcher.open_keys()
    }

    /// 元数据注册表快照
    pub async fn registry(&self) -> MetadataRegistry {
        self.state.lock().await.registry.clone()
    }

    fn install_publisher(&self, service: &'static str, decl: PublisherDecl) {
        let hub = self
            .config
            .resolve_hub(decl.options.hub_name())
            .map(str::to_string);
        let interceptor = PublishInterceptor::new(
            service,
            decl.method,
            decl.options,
            hub,
            Arc::clone(&self.cache),
        );

        if decl.slot.install(Arc::new(interceptor)) {
            let installed = decl.slot.interceptor();
            info!(
                service,
                method = decl.method,
                hub = installed.and_then(|i| i.hub()),
                routing_key = installed.and_then(|i| i.options().routing_key()),
                "set up publisher"
            );
        } else {
            debug!(service, method = decl.method, "publisher already set up");
        }
    }

    fn add_subscriber(
        &self,
        dispatcher: &mut SubscriptionDispatcher,
        instance: &InstanceId,
        decl: SubscriberDecl,
    ) -> bool {
        let Some(hub) = self.config.resolve_hub(decl.options.hub_name()) else {
            let err = HubError::connection(
                "(default)",
                BrokerError::InvalidHub {
                    hub: "no hub name configured".to_string(),
                },
            );
            error!(
                service = instance.service(),
                method = decl.method,
                error = %err,
                "cannot register subscriber"
            );
            return false;
        };

        let consumer_group = decl
            .options
            .consumer_group()
            .unwrap_or(self.config.default_consumer_group());
        let key = SubscriptionKey::new(hub, consumer_group);

        dispatcher.add(
            key,
            SubscriberEntry::new(instance.clone(), decl.method, decl.options, decl.handler),
        )
    }
}
