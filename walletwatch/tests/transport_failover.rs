//! End-to-end transport failover: WebSocket -> polling -> WebSocket.
//!
//! Drives the public API only: a consumer subscribes to balance updates,
//! the WebSocket dies mid-session, polling takes over invisibly, and the
//! consumer keeps receiving the same events until the socket recovers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, U256};
use walletwatch::events::{BalanceUpdate, EventBus};
use walletwatch::live::client::{LiveClient, MockLiveClient};
use walletwatch::live::connection_manager::{ClientFactory, ConnectionManager, ManagerConfig};
use walletwatch::live::poll_manager::{PollConfig, PollManager};
use walletwatch::live::tracker::AddressTracker;
use walletwatch::services::{SubscriptionService, SubscriptionSink};
use walletwatch::{SubscriptionStatus, Transport};

const ADDR: &str = "0x1111111111111111111111111111111111111111";

struct Stack {
    service: SubscriptionService,
    ws: Arc<MockLiveClient>,
    http: Arc<MockLiveClient>,
}

fn tracked() -> Address {
    ADDR.parse().expect("valid address literal")
}

fn stack() -> Stack {
    let bus = Arc::new(EventBus::new());
    let ws = Arc::new(MockLiveClient::new());
    let http = Arc::new(MockLiveClient::new());

    let ws_for_factory = Arc::clone(&ws);
    let ws_factory: ClientFactory =
        Arc::new(move |_| Arc::clone(&ws_for_factory) as Arc<dyn LiveClient>);
    let http_for_factory = Arc::clone(&http);
    let http_factory: ClientFactory =
        Arc::new(move |_| Arc::clone(&http_for_factory) as Arc<dyn LiveClient>);

    let manager = Arc::new(ConnectionManager::new(
        ManagerConfig {
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(1),
        },
        ws_factory,
        http_factory,
        Arc::clone(&bus),
    ));
    let poll = Arc::new(PollManager::new(
        PollConfig {
            poll_interval: Duration::from_secs(5),
            ws_recovery_interval: Duration::from_secs(10),
        },
        Arc::clone(&bus),
        Arc::clone(&manager),
    ));

    Stack {
        service: SubscriptionService::new(bus, manager, poll, Arc::new(AddressTracker::new())),
        ws,
        http,
    }
}

#[tokio::test(start_paused = true)]
async fn consumer_survives_a_websocket_outage() {
    let stack = stack();
    stack.ws.set_balance(tracked(), U256::from(100u64));
    stack.http.set_balance(tracked(), U256::from(100u64));
    stack.http.set_head(1000);

    let received: Arc<Mutex<Vec<(U256, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = SubscriptionSink {
        on_data: Some(Arc::new({
            let received = Arc::clone(&received);
            move |update: BalanceUpdate| {
                received
                    .lock()
                    .expect("sink mutex")
                    .push((update.amount, update.block_number));
            }
        })),
        ..SubscriptionSink::default()
    };

    let handle = stack
        .service
        .subscribe_balances(1, &[ADDR.to_string()], sink)
        .expect("subscribe");
    tokio::task::yield_now().await;
    assert_eq!(handle.transport(), Transport::Websocket);
    assert_eq!(handle.status(), SubscriptionStatus::Active);

    // Phase 1: live data over the socket.
    stack.ws.push_block(7);
    tokio::task::yield_now().await;
    assert_eq!(*received.lock().expect("sink mutex"), vec![(U256::from(100u64), 7)]);

    // Phase 2: the socket dies. The heartbeat notices, the reconnect loop
    // cannot get through, and polling takes over.
    stack.ws.set_ping_fails(true);
    stack.ws.set_connect_fails(true);
    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(handle.transport(), Transport::Polling);

    // A poll tick with an advanced head produces the same event shape.
    stack.http.set_balance(tracked(), U256::from(150u64));
    stack.http.set_head(1001);
    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;
    {
        let received = received.lock().expect("sink mutex");
        assert!(
            received.contains(&(U256::from(150u64), 1001)),
            "polling delivered the update: {received:?}"
        );
    }

    // Phase 3: the socket recovers; either the reconnect loop or the
    // recovery probe rewires the drivers and retires polling.
    stack.ws.set_ping_fails(false);
    stack.ws.set_connect_fails(false);
    for _ in 0..12 {
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
    }
    assert_eq!(handle.transport(), Transport::Websocket);

    // Live data flows over the socket again.
    let before = received.lock().expect("sink mutex").len();
    stack.ws.set_balance(tracked(), U256::from(200u64));
    stack.ws.push_block(8);
    tokio::task::yield_now().await;
    {
        let received = received.lock().expect("sink mutex");
        assert!(received.len() > before, "websocket delivery resumed");
        assert_eq!(received.last(), Some(&(U256::from(200u64), 8)));
    }

    handle.unsubscribe();
    assert_eq!(handle.status(), SubscriptionStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn polling_from_the_start_when_websocket_never_connects() {
    let stack = stack();
    stack.ws.set_connect_fails(true);
    stack.http.set_head(50);
    stack.http.set_balance(tracked(), U256::from(9u64));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = SubscriptionSink {
        on_data: Some(Arc::new({
            let received = Arc::clone(&received);
            move |update: BalanceUpdate| {
                received.lock().expect("sink mutex").push(update.amount);
            }
        })),
        ..SubscriptionSink::default()
    };

    let handle = stack
        .service
        .subscribe_balances(1, &[ADDR.to_string()], sink)
        .expect("subscribe");
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(handle.transport(), Transport::Polling);

    // Baseline tick, then an advance.
    tokio::task::yield_now().await;
    stack.http.set_head(51);
    tokio::time::advance(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;

    assert_eq!(*received.lock().expect("sink mutex"), vec![U256::from(9u64)]);

    stack.service.destroy();
    assert_eq!(handle.status(), SubscriptionStatus::Closed);
}
