use eventhub::{HubError, HubService, PublisherSlots};
use eventhub_macros::event_hub;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserData {
    name: String,
    email: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateUserResponse {
    message: String,
    data: UserData,
}

struct AppService {
    publishers: PublisherSlots,
}

#[event_hub]
impl AppService {
    #[publish(routing_key = "user.created")]
    pub async fn create_user(&self, data: UserData) -> Result<CreateUserResponse, HubError> {
        Ok(CreateUserResponse {
            message: "User created".into(),
            data,
        })
    }

    #[subscribe(routing_key = "user.created")]
    pub async fn handle_user_created(&self, event: CreateUserResponse) -> anyhow::Result<()> {
        let _ = event.data.name;
        Ok(())
    }

    // 未标记的方法保持原样
    pub fn plain(&self) -> usize {
        1
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let svc = Arc::new(AppService {
        publishers: PublisherSlots::new(),
    });
    assert_eq!(svc.service_name(), "AppService");
    assert_eq!(svc.plain(), 1);

    // 未接入 hub 时原样返回
    let out = svc
        .create_user(UserData {
            name: "A".into(),
            email: "a@x.com".into(),
        })
        .await
        .unwrap();
    assert_eq!(out.message, "User created");

    let manifest = svc.clone().manifest();
    assert_eq!(manifest.len(), 2);
}
