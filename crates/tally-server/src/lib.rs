//! # tally-server
//!
//! Live counter streaming over Server-Sent Events.
//!
//! - Stream lifecycle core: subscriber registry, non-blocking broadcaster,
//!   per-session state machine, idle detection, single-path teardown
//! - HTTP endpoints: counter hit/get/create/info/set/reset/update/delete,
//!   event streams, stats, health, Prometheus metrics
//! - Graceful shutdown via `CancellationToken` + `TaskTracker`

#![deny(unsafe_code)]

pub mod config;
pub mod counter;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod stream;

pub use config::{ServerConfig, StreamConfig};
pub use counter::{CounterError, MemoryCounterStore};
pub use server::{AppState, ServerHandle, TallyServer};
pub use shutdown::ShutdownCoordinator;
pub use stream::{LifecycleCoordinator, StreamError};
