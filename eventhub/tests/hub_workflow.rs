#![cfg(feature = "inmemory")]

use eventhub::broker::{EventData, InMemoryBroker};
use eventhub::metadata::DEFAULT_CONSUMER_GROUP;
use eventhub::{
    EventHub, HubConfig, HubError, PublisherSlots, ServiceRegistry, ShutdownReport,
    SubscriptionKey,
};
use eventhub_macros::event_hub;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UserData {
    name: String,
    email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UserEvent {
    message: String,
    data: UserData,
}

#[derive(Debug, Error)]
enum AppError {
    #[error("invalid user: {0}")]
    Invalid(String),
    #[error(transparent)]
    Hub(#[from] HubError),
}

#[derive(Default)]
struct AppService {
    publishers: PublisherSlots,
    created: Mutex<Vec<UserEvent>>,
    everything: Mutex<Vec<UserEvent>>,
}

#[event_hub]
impl AppService {
    #[publish(routing_key = "user.created")]
    async fn create_user(&self, data: UserData) -> Result<UserEvent, AppError> {
        if data.email.is_empty() {
            return Err(AppError::Invalid(data.name));
        }
        Ok(UserEvent {
            message: "User created".into(),
            data,
        })
    }

    #[publish(routing_key = "user.updated", partition_key = "users-partition")]
    async fn update_user(&self, data: UserData) -> Result<UserEvent, AppError> {
        Ok(UserEvent {
            message: "User updated".into(),
            data,
        })
    }

    #[subscribe(routing_key = "user.created")]
    async fn handle_user_created(&self, event: UserEvent) -> anyhow::Result<()> {
        self.created.lock().unwrap().push(event);
        Ok(())
    }

    #[subscribe]
    async fn handle_everything(&self, event: UserEvent) -> anyhow::Result<()> {
        self.everything.lock().unwrap().push(event);
        Ok(())
    }
}

// 同一 hub 上另一个服务，使用独立消费组
#[derive(Default)]
struct AuditService {
    seen: Mutex<Vec<serde_json::Value>>,
}

#[event_hub]
impl AuditService {
    #[subscribe(consumer_group = "audit")]
    fn record(&self, body: serde_json::Value) {
        self.seen.lock().unwrap().push(body);
    }
}

fn config() -> HubConfig {
    HubConfig::from_source(|var| match var {
        "EVENT_HUB_CONNECTION_STRING" => Some(
            "Endpoint=sb://localhost/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=secret"
                .to_string(),
        ),
        "EVENT_HUB_NAME" => Some("users".to_string()),
        _ => None,
    })
    .unwrap()
}

fn event_hub(broker: &InMemoryBroker) -> EventHub {
    EventHub::builder()
        .broker(Arc::new(broker.clone()))
        .config(config())
        .build()
}

fn user(name: &str) -> UserData {
    UserData {
        name: name.into(),
        email: format!("{}@x.com", name.to_lowercase()),
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn publisher_sends_return_value_with_routing_key() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let app = Arc::new(AppService::default());
    hub.discover(&ServiceRegistry::new().register(app.clone()))
        .await
        .unwrap();

    let out = app.create_user(user("A")).await.unwrap();

    let sent = broker.sent_to("users");
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].data.body,
        json!({"message": "User created", "data": {"name": "A", "email": "a@x.com"}})
    );
    assert_eq!(sent[0].data.body, serde_json::to_value(&out).unwrap());
    assert_eq!(sent[0].data.routing_key(), Some("user.created"));
    assert_eq!(sent[0].partition_key, None);

    app.update_user(user("B")).await.unwrap();
    let sent = broker.sent_to("users");
    assert_eq!(sent[1].partition_key.as_deref(), Some("users-partition"));

    hub.shutdown().await;
}

#[tokio::test]
async fn failing_original_sends_nothing() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let app = Arc::new(AppService::default());
    hub.discover(&ServiceRegistry::new().register(app.clone()))
        .await
        .unwrap();

    let err = app
        .create_user(UserData {
            name: "nobody".into(),
            email: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Invalid(_)));
    assert!(broker.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribers_fan_out_by_routing_key() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let app = Arc::new(AppService::default());

    let opened = hub
        .initialize(&ServiceRegistry::new().register(app.clone()))
        .await
        .unwrap();
    assert_eq!(
        opened,
        vec![SubscriptionKey::new("users", DEFAULT_CONSUMER_GROUP)]
    );

    let created = app.create_user(user("A")).await.unwrap();
    let updated = app.update_user(user("B")).await.unwrap();

    wait_until(|| app.everything.lock().unwrap().len() == 2).await;
    assert_eq!(*app.created.lock().unwrap(), vec![created.clone()]);

    let everything = app.everything.lock().unwrap().clone();
    assert!(everything.contains(&created));
    assert!(everything.contains(&updated));

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn one_handle_per_key_across_services() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let first = Arc::new(AppService::default());
    let second = Arc::new(AppService::default());
    let audit = Arc::new(AuditService::default());

    let services = ServiceRegistry::new()
        .register(first.clone())
        .register(second.clone())
        .register(audit.clone());
    let opened = hub.initialize(&services).await.unwrap();
    assert_eq!(opened.len(), 2);

    first.create_user(user("A")).await.unwrap();
    second.create_user(user("B")).await.unwrap();
    first.update_user(user("C")).await.unwrap();

    // 两个实例各自收到全部三条消息；审计消费组独立收到一份
    wait_until(|| {
        first.everything.lock().unwrap().len() == 3
            && second.everything.lock().unwrap().len() == 3
            && audit.seen.lock().unwrap().len() == 3
    })
    .await;

    let stats = broker.stats();
    assert_eq!(stats.producers_created, 1);
    assert_eq!(stats.consumers_created, 2);
    assert_eq!(stats.subscriptions_opened, 2);
    assert_eq!(hub.connections().producer_count(), 1);
    assert_eq!(hub.connections().consumer_count(), 2);

    hub.shutdown().await;
}

#[tokio::test]
async fn unreachable_broker_fails_publish_and_is_retried() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let app = Arc::new(AppService::default());
    hub.discover(&ServiceRegistry::new().register(app.clone()))
        .await
        .unwrap();

    broker.set_unreachable(true);
    let err = app.create_user(user("A")).await.unwrap_err();
    match err {
        AppError::Hub(e) => {
            assert!(matches!(e, HubError::Connection { .. }));
            assert!(e.is_caller_visible());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!hub.connections().has_producer("users"));

    broker.set_unreachable(false);
    app.create_user(user("A")).await.unwrap();
    assert!(hub.connections().has_producer("users"));
    assert_eq!(broker.sent().len(), 1);
}

#[tokio::test]
async fn send_failure_surfaces_publish_error() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let app = Arc::new(AppService::default());
    hub.discover(&ServiceRegistry::new().register(app.clone()))
        .await
        .unwrap();

    broker.set_fail_sends(true);
    let err = app.create_user(user("A")).await.unwrap_err();
    assert!(matches!(err, AppError::Hub(HubError::Publish { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_everything_once() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let app = Arc::new(AppService::default());
    let audit = Arc::new(AuditService::default());
    hub.initialize(
        &ServiceRegistry::new()
            .register(app.clone())
            .register(audit.clone()),
    )
    .await
    .unwrap();
    app.create_user(user("A")).await.unwrap();

    let report = hub.shutdown().await;
    assert_eq!(
        report,
        ShutdownReport {
            subscriptions_closed: 2,
            producers_closed: 1,
            consumers_closed: 2,
            failures: 0,
        }
    );
    assert_eq!(hub.shutdown().await, ShutdownReport::default());

    let stats = broker.stats();
    assert_eq!(stats.subscriptions_closed, 2);
    assert_eq!(stats.producers_closed, 1);
    assert_eq!(stats.consumers_closed, 2);

    assert!(matches!(
        app.create_user(user("B")).await,
        Err(AppError::Hub(HubError::ShutDown))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_resumes_after_checkpoint() {
    let broker = InMemoryBroker::default();

    let first_run = Arc::new(AppService::default());
    {
        let hub = event_hub(&broker);
        hub.initialize(&ServiceRegistry::new().register(first_run.clone()))
            .await
            .unwrap();
        first_run.create_user(user("A")).await.unwrap();
        wait_until(|| first_run.everything.lock().unwrap().len() == 1).await;
        hub.shutdown().await;
    }

    // 离线期间到达的消息在重启后投递，已检查点的消息不会重复投递
    broker
        .enqueue(
            "users",
            EventData::new(json!({"message": "User created", "data": user("B")}))
                .with_routing_key(Some("user.created")),
            None,
        )
        .unwrap();

    let second_run = Arc::new(AppService::default());
    let hub = event_hub(&broker);
    hub.initialize(&ServiceRegistry::new().register(second_run.clone()))
        .await
        .unwrap();

    wait_until(|| second_run.created.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let received = second_run.everything.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data.name, "B");

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn undeserializable_payload_is_logged_not_fatal() {
    let broker = InMemoryBroker::default();
    let hub = event_hub(&broker);
    let app = Arc::new(AppService::default());
    hub.initialize(&ServiceRegistry::new().register(app.clone()))
        .await
        .unwrap();

    broker
        .enqueue("users", EventData::new(json!("not a user event")), None)
        .unwrap();
    app.create_user(user("A")).await.unwrap();

    wait_until(|| app.everything.lock().unwrap().len() == 1).await;
    assert_eq!(app.created.lock().unwrap().len(), 1);

    hub.shutdown().await;
}
