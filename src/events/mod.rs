//! Events module - lifecycle event records and dispatch.
//!
//! Provides:
//! - [`Event`] - the records emitted by the lifecycle controller
//! - [`ConnectFailureReason`] / [`TempBanReason`] - server reason codes
//! - [`EventDispatcher`] - the dispatch seam, with [`EventBus`] and
//!   [`ChannelDispatcher`] implementations

mod dispatcher;
mod types;

pub use dispatcher::{ChannelDispatcher, EventBus, EventDispatcher, EventHandler};
pub use types::{ConnectFailureReason, Event, TempBanReason};
