//! Lifecycle module - reactions to server-signalled connection events.
//!
//! Provides:
//! - [`LifecycleController`] - handles stream errors, connect failures,
//!   connect success and inline broadcasts
//! - [`policy`] - the ordered dispatch tables the controller executes
//! - [`SessionState`] - logged-in / expect-disconnect / reconnect counters
//! - Collaborator traits for storage, request waiters, connecting and
//!   server requests

mod collaborators;
mod config;
mod controller;
pub mod policy;
mod state;

pub use collaborators::{
    Connector, CredentialRefresher, RequestWaiters, ServerRequests, SessionStore,
};
pub use config::{LifecycleConfig, DEFAULT_CAT_REFRESH_TIMEOUT_SECS, DEFAULT_MIN_PRE_KEY_COUNT};
pub use controller::{LifecycleController, LifecycleControllerBuilder};
pub use state::{LifecyclePhase, ReconnectDecision, SessionState};
