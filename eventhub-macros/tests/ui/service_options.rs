use eventhub::{HubError, HubService, PublisherSlots};
use eventhub_macros::event_hub;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
enum OrderError {
    Hub(HubError),
}

impl From<HubError> for OrderError {
    fn from(e: HubError) -> Self {
        OrderError::Hub(e)
    }
}

#[derive(Deserialize)]
struct Audit {
    id: u64,
}

struct Orders {
    slots: PublisherSlots,
    audited: AtomicUsize,
}

#[event_hub(name = "order-service", publishers = slots)]
impl Orders {
    /// 按租户固定分区
    #[publish(hub = "orders", routing_key = "order.placed", partition_key = "tenant-1")]
    async fn place(&self, id: u64, (qty, price): (u32, u32)) -> Result<u64, OrderError> {
        Ok(id + (qty * price) as u64)
    }

    #[subscribe(hub = "audit", consumer_group = "auditors")]
    fn audit(&self, event: Audit) {
        self.audited.fetch_add(event.id as usize, Ordering::SeqCst);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let svc = Arc::new(Orders {
        slots: PublisherSlots::new(),
        audited: AtomicUsize::new(0),
    });
    assert_eq!(svc.service_name(), "order-service");

    match svc.place(1, (2, 3)).await {
        Ok(total) => assert_eq!(total, 7),
        Err(OrderError::Hub(e)) => panic!("unexpected hub error: {e}"),
    }

    assert_eq!(svc.clone().manifest().len(), 2);
}
