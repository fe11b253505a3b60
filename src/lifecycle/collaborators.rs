//! Collaborators the lifecycle controller drives.
//!
//! Storage, request/response matching, the physical connect sequence and the
//! server's IQ requests all live outside this crate; the controller reaches
//! them through these traits.

use async_trait::async_trait;

use crate::control::{Jid, Node};
use crate::error::Result;

/// Persistent device/session store.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Linked identity currently held in memory.
    fn lid(&self) -> Option<Jid>;

    /// Replace the in-memory linked identity (persisted by `save`).
    fn set_lid(&self, lid: Option<Jid>);

    /// Primary (phone number) identity.
    fn primary_id(&self) -> Option<Jid>;

    /// Persist the device row.
    async fn save(&self) -> Result<()>;

    /// Delete all persisted session state.
    async fn delete(&self) -> Result<()>;

    /// Number of pre-keys marked as uploaded locally.
    async fn uploaded_pre_key_count(&self) -> Result<u32>;

    /// Write the linked identity ↔ primary identity mapping. Idempotent.
    async fn store_lid_pn_mapping(&self, lid: Option<Jid>, primary: Option<Jid>) -> Result<()>;
}

/// Refreshes the rotating credential (CAT).
#[async_trait]
pub trait CredentialRefresher: Send + Sync + 'static {
    /// Fetch a fresh credential.
    async fn refresh(&self) -> Result<()>;
}

/// In-flight request/response matching.
pub trait RequestWaiters: Send + Sync + 'static {
    /// Fail every pending request with `SessionError::StreamClosed`.
    ///
    /// `node` is the stream error that closed the stream.
    fn clear_all(&self, node: &Node);
}

/// Physical connect / disconnect sequence.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Close the current physical connection, if any.
    async fn disconnect(&self);

    /// Open the socket and run the handshake. Returns once the socket is
    /// ready for the server's success/failure node.
    async fn connect(&self) -> Result<()>;
}

/// Server requests issued around connect success.
#[async_trait]
pub trait ServerRequests: Send + Sync + 'static {
    /// Number of pre-keys the server holds for this device.
    async fn server_pre_key_count(&self) -> Result<u32>;

    /// Generate and upload a fresh batch of pre-keys.
    async fn upload_pre_keys(&self) -> Result<()>;

    /// Tell the server whether this device is passive.
    async fn set_passive(&self, passive: bool) -> Result<()>;
}
