//! Streaming connection lifecycle.
//!
//! - [`registry`]: topic -> subscriber index of non-owning handles
//! - [`broadcast`]: non-blocking fan-out with per-subscriber backpressure
//! - [`session`]: per-client state machine and bounded outbound queue
//! - [`liveness`]: idle detection and bounded writes
//! - [`coordinator`]: admission, single-path teardown, shutdown

pub mod broadcast;
pub mod coordinator;
pub mod errors;
pub mod liveness;
pub mod queue;
pub mod registry;
pub mod session;
pub mod transport;
mod worker;

pub use broadcast::{BroadcastStats, Broadcaster, PublishReport};
pub use coordinator::{CloseOutcome, LifecycleCoordinator, ShutdownReport, StreamStats};
pub use errors::{StreamError, TransportError};
pub use registry::{SubscriberHandle, SubscriberRegistry};
pub use session::{CloseReason, Offer, Session, SessionInfo, SessionState};
pub use transport::{ChannelTransport, Transport};
