use eventhub::{HubError, HubService, PublisherSlots};
use eventhub_macros::event_hub;
use serde_json::Value;
use std::sync::Arc;

struct Relay {
    publishers: PublisherSlots,
}

#[event_hub]
impl Relay {
    // 收到 inbound 的消息后转发到 outbound
    #[subscribe(hub = "inbound")]
    #[publish(hub = "outbound", routing_key = "relayed")]
    async fn forward(&self, body: Value) -> Result<Value, HubError> {
        Ok(body)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let relay = Arc::new(Relay {
        publishers: PublisherSlots::new(),
    });
    let out = relay.forward(Value::from(3)).await.unwrap();
    assert_eq!(out, Value::from(3));
    assert_eq!(relay.clone().manifest().len(), 2);
}
