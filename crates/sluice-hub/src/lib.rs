//! Replayable job logs and the registry that guarantees one driving
//! execution per idempotency key.

pub mod error;
pub mod hub;
pub mod job;

pub use error::HubError;
pub use hub::{panic_message, Attached, RetentionPolicy, StreamHub, CANCELLED_MESSAGE};
pub use job::{Job, Subscription};
