//! 发布拦截器（PublishInterceptor）
//!
//! 将“原方法逻辑”与“发送到 hub”组合为一个新的可调用对象：
//! 1. 先完整执行原方法得到返回值；
//! 2. 返回值序列化为消息体，附带路由键属性与分区提示后发送；
//! 3. 发送成功则原样返回该值，发送失败则以错误替换返回值（原方法的副作用不回滚）。
//!
//! 服务侧通过 `PublisherSlots` 持有每个方法的安装位，发现阶段为其安装拦截器，
//! 每个方法至多安装一次。
//!
use crate::broker::{EventData, SendOptions};
use crate::cache::ConnectionCache;
use crate::error::{BrokerError, HubError, HubResult};
use crate::metadata::HubOptions;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info};

/// 某个发布方法解析后的发送目标
pub struct PublishInterceptor {
    service: &'static str,
    method: String,
    options: HubOptions,
    // 解析失败（无注解 hub、无默认 hub）时为 None，发送时报连接错误
    hub: Option<String>,
    cache: Arc<ConnectionCache>,
}

impl PublishInterceptor {
    pub fn new(
        service: &'static str,
        method: impl Into<String>,
        options: HubOptions,
        hub: Option<String>,
        cache: Arc<ConnectionCache>,
    ) -> Self {
        Self {
            service,
            method: method.into(),
            options,
            hub,
            cache,
        }
    }

    pub fn hub(&self) -> Option<&str> {
        self.hub.as_deref()
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// 将一个值作为消息发送
    pub async fn publish<T>(&self, value: &T) -> HubResult<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_value(value).map_err(HubError::from);
        self.publish_body(body).await
    }

    /// 发送成功后原样交回返回值
    pub async fn after_return<T>(&self, value: T) -> HubResult<T>
    where
        T: Serialize,
    {
        // 借用只用于序列化，await 期间仅持有 `T` 本身
        let body = serde_json::to_value(&value).map_err(HubError::from);
        self.publish_body(body).await?;
        Ok(value)
    }

    /// 高阶包装：返回“先执行 `original`，再发送其返回值”的新函数
    ///
    /// `original` 返回 `Err` 时不发送，错误原样返回；
    /// 发送失败时返回 `E::from(HubError)`。
    pub fn wrap<I, O, E, F, Fut>(
        self: &Arc<Self>,
        original: F,
    ) -> impl Fn(I) -> BoxFuture<'static, Result<O, E>> + Send + Sync + 'static
    where
        I: Send + 'static,
        O: Serialize + Send + 'static,
        E: From<HubError> + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let interceptor = Arc::clone(self);
        move |input: I| {
            let interceptor = Arc::clone(&interceptor);
            let call = original(input);
            Box::pin(async move {
                let value = call.await?;
                interceptor.after_return(value).await.map_err(E::from)
            })
        }
    }

    async fn publish_body(&self, body: HubResult<Value>) -> HubResult<()> {
        let result = match body {
            Ok(body) => self.send(body).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!(
                service = self.service,
                method = %self.method,
                error = %e,
                "error publishing message"
            );
        }
        result
    }

    async fn send(&self, body: Value) -> HubResult<()> {
        let hub = self.hub.as_deref().ok_or_else(|| {
            HubError::connection(
                "(default)",
                BrokerError::InvalidHub {
                    hub: "no hub name configured".to_string(),
                },
            )
        })?;

        let producer = self.cache.producer_for(hub).await?;

        let data = EventData::new(body).with_routing_key(self.options.routing_key());
        let options = SendOptions::with_partition_key(self.options.partition_key());

        producer
            .send_batch(vec![data], options)
            .await
            .map_err(|e| HubError::publish(hub, e))?;

        info!(
            service = self.service,
            method = %self.method,
            hub,
            routing_key = self.options.routing_key(),
            "successfully published message"
        );
        Ok(())
    }
}

/// 单个发布方法的安装位
#[derive(Clone, Default)]
pub struct PublisherSlot {
    inner: Arc<OnceLock<Arc<PublishInterceptor>>>,
}

impl PublisherSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 安装拦截器；已安装时保留第一次的安装并返回 false
    pub fn install(&self, interceptor: Arc<PublishInterceptor>) -> bool {
        self.inner.set(interceptor).is_ok()
    }

    pub fn is_installed(&self) -> bool {
        self.inner.get().is_some()
    }

    pub fn interceptor(&self) -> Option<&Arc<PublishInterceptor>> {
        self.inner.get()
    }

    /// 对原方法的结果执行发布
    ///
    /// 未安装时（尚未接入 hub）原样返回。
    pub async fn intercept<T, E>(&self, result: Result<T, E>) -> Result<T, E>
    where
        T: Serialize,
        E: From<HubError>,
    {
        let value = result?;
        match self.inner.get() {
            Some(interceptor) => interceptor.after_return(value).await.map_err(E::from),
            None => {
                debug!("publisher not wired to a hub, skipping send");
                Ok(value)
            }
        }
    }
}

/// 服务实例持有的全部发布安装位，按方法名索引
#[derive(Default)]
pub struct PublisherSlots {
    slots: DashMap<&'static str, PublisherSlot>,
}

impl PublisherSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, method: &'static str) -> PublisherSlot {
        self.slots.entry(method).or_default().clone()
    }

    pub async fn intercept<T, E>(&self, method: &'static str, result: Result<T, E>) -> Result<T, E>
    where
        T: Serialize,
        E: From<HubError>,
    {
        self.slot(method).intercept(result).await
    }
}
