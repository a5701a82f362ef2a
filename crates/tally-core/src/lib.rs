//! # tally-core
//!
//! Foundation types shared by every Tally crate.
//!
//! - **Topics**: [`Topic`] (namespace + key) with the validation rules the
//!   HTTP layer applies to path segments
//! - **Session IDs**: [`SessionId`] newtype over a UUID v7
//! - **Counter events**: [`CounterEvent`] and its event-stream wire encoding
//! - **Errors**: [`TopicError`] via `thiserror`
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod topic;

pub use errors::TopicError;
pub use events::{CounterEvent, Frame};
pub use ids::SessionId;
pub use topic::{DEFAULT_NAMESPACE, RANDOM_SEGMENT_LEN, Topic};
