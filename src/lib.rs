//! # wasession
//!
//! Session layer of a multi-device chat client.
//!
//! This crate frames the encrypted socket and reacts to the server's
//! connection-level signals.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`], [`transport`]): one connection header, then
//!   frames with a 3-byte big-endian length prefix
//! - **Writer** ([`writer`]): single task owning the write half, batching
//!   frames under backpressure
//! - **Lifecycle** ([`lifecycle`]): stream errors, connect failures and
//!   connect success, turned into reconnects, credential refreshes, logouts
//!   and [`events::Event`]s
//!
//! ## Example
//!
//! ```ignore
//! use wasession::transport::SocketConfig;
//! use wasession::{FrameSocket, ReconnectDecision};
//!
//! let socket = FrameSocket::new(SocketConfig::default());
//! let mut frames = socket.open(websocket).await?;
//!
//! let mut remote = false;
//! while let Some(frame) = frames.next().await {
//!     let Ok(frame) = frame else {
//!         remote = true;
//!         break;
//!     };
//!     let node = decoder.decode(frame.payload())?;
//!     if !controller.handle_node(&node).await {
//!         router.route(node).await;
//!     }
//! }
//!
//! if controller.handle_disconnect(remote) == ReconnectDecision::AutoReconnect {
//!     scheduler.reconnect().await;
//! }
//! ```

pub mod control;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod protocol;
pub mod transport;
pub mod writer;

pub use error::{Result, SessionError};
pub use events::{Event, EventDispatcher};
pub use lifecycle::{LifecycleController, ReconnectDecision};
pub use transport::FrameSocket;
