//! Realtime core: transports, drivers, and the polling fallback.
//!
//! - [`client`] - The [`LiveClient`](client::LiveClient) contract and mock
//! - [`connection_manager`] - WebSocket lifecycle and transport decision
//! - [`new_heads`] - Per-block balance refresh driver
//! - [`transfer_logs`] - Filtered ERC-20 transfer watcher
//! - [`poll_manager`] - Polling fallback with WebSocket recovery probing
//! - [`tracker`] - Tracked-address registry shared by all of the above

pub mod client;
pub mod connection_manager;
pub mod new_heads;
pub mod poll_manager;
pub mod tracker;
pub mod transfer_logs;

pub use client::{LiveClient, LogFilter, LogRecord, MockLiveClient};
pub use connection_manager::{
    ClientFactory, ConnectionInfo, ConnectionManager, ConnectionStatus, ManagerConfig,
};
pub use new_heads::{DriverCallbacks, NewHeadsDriver};
pub use poll_manager::{PollCallbacks, PollConfig, PollManager};
pub use tracker::AddressTracker;
pub use transfer_logs::{TRANSFER_TOPIC, TransferCallbacks, TransferLogsWatcher};
