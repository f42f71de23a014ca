use chrono::{DateTime, Utc};
use eventhub::broker::InMemoryBroker;
use eventhub::{ConnectionString, EventHub, HubConfig, HubError, PublisherSlots, ServiceRegistry};
use eventhub_macros::event_hub;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEMO_CONNECTION_STRING: &str =
    "Endpoint=sb://localhost/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=demo";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserData {
    name: String,
    email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdatedUser {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(flatten)]
    data: UserData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserEvent<T> {
    message: String,
    timestamp: DateTime<Utc>,
    data: T,
}

#[derive(Debug, Error)]
enum AppError {
    #[error("user email must not be empty")]
    MissingEmail,
    #[error(transparent)]
    Hub(#[from] HubError),
}

#[derive(Default)]
struct AppService {
    publishers: PublisherSlots,
}

#[event_hub(name = "app-service")]
impl AppService {
    #[publish(routing_key = "user.created")]
    async fn create_user(&self, data: UserData) -> Result<UserEvent<UserData>, AppError> {
        if data.email.is_empty() {
            return Err(AppError::MissingEmail);
        }
        info!(name = %data.name, "creating user");
        Ok(UserEvent {
            message: "User created".into(),
            timestamp: Utc::now(),
            data,
        })
    }

    #[publish(routing_key = "user.updated")]
    async fn update_user(
        &self,
        user_id: String,
        data: UserData,
    ) -> Result<UserEvent<UpdatedUser>, AppError> {
        info!(%user_id, "updating user");
        Ok(UserEvent {
            message: "User updated".into(),
            timestamp: Utc::now(),
            data: UpdatedUser { user_id, data },
        })
    }

    #[subscribe(routing_key = "user.created")]
    async fn handle_user_created(&self, event: UserEvent<UserData>) {
        info!(name = %event.data.name, email = %event.data.email, at = %event.timestamp, "received user created event");
    }

    #[subscribe(routing_key = "user.updated")]
    async fn handle_user_updated(&self, event: UserEvent<UpdatedUser>) {
        info!(user_id = %event.data.user_id, name = %event.data.data.name, "received user updated event");
    }
}

fn load_config() -> anyhow::Result<HubConfig> {
    match HubConfig::from_env() {
        Ok(cfg) => Ok(cfg),
        Err(HubError::ConfigMissing { var }) => {
            warn!(%var, "falling back to local demo configuration");
            Ok(HubConfig::builder()
                .connection(ConnectionString::parse(DEMO_CONNECTION_STRING)?)
                .default_hub("users")
                .build())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let broker = InMemoryBroker::default();
    let hub = EventHub::builder()
        .broker(Arc::new(broker.clone()))
        .config(config)
        .build();

    let app = Arc::new(AppService::default());
    let opened = hub
        .initialize(&ServiceRegistry::new().register(app.clone()))
        .await?;
    info!(subscriptions = opened.len(), "event hub started");

    let created = app
        .create_user(UserData {
            name: "Ada".into(),
            email: "ada@example.com".into(),
        })
        .await?;
    info!(message = %created.message, "create_user returned");

    let updated = app
        .update_user(
            "42".into(),
            UserData {
                name: "Ada Lovelace".into(),
                email: "ada@example.com".into(),
            },
        )
        .await?;
    info!(message = %updated.message, "update_user returned");

    if let Err(err) = app
        .create_user(UserData {
            name: "nobody".into(),
            email: String::new(),
        })
        .await
    {
        warn!(%err, "create_user rejected, nothing published");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = hub.shutdown().await;
    info!(
        subscriptions = report.subscriptions_closed,
        producers = report.producers_closed,
        consumers = report.consumers_closed,
        failures = report.failures,
        sent = broker.sent().len(),
        "event hub stopped"
    );
    Ok(())
}
