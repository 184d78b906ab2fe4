//! Core types shared by every Weft crate.
//!
//! # Main types
//!
//! - [`WeftError`] — Unified error enum for all Weft subsystems.
//! - [`WeftResult`] — Convenience alias for `Result<T, WeftError>`.
//! - [`ErrorCategory`] — Failure classification used by recovery.
//! - [`EventBus`] — Typed fire-and-forget publish/subscribe channel.
//! - [`RestartRequest`] — Worker restart request with a reply slot.

/// Error enum, result alias, and failure categories.
pub mod error;
/// Typed publish/subscribe event bus.
pub mod event;
/// Worker restart requests exchanged between recovery and the coordinator.
pub mod restart;

pub use error::{ErrorCategory, WeftError, WeftResult};
pub use event::{EventBus, EventSubscription, DEFAULT_EVENT_CAPACITY};
pub use restart::{RestartReply, RestartRequest};
