//! Control module - server nodes and the lifecycle signals parsed from them.
//!
//! The node decoder is external; nodes arrive here already decoded from
//! frame payloads. [`ControlSignal::from_node`] picks out the four node kinds
//! the lifecycle controller acts on.
//!
//! # Example
//!
//! ```
//! use wasession::control::{ControlSignal, Node};
//!
//! let node = Node::new("stream:error").with_attr("code", "515");
//! let signal = ControlSignal::from_node(&node).unwrap();
//! assert!(matches!(signal, ControlSignal::StreamError(ref error) if error.code == "515"));
//! ```

mod node;
mod signal;

pub use node::{Jid, Node};
pub use signal::{
    BroadcastEntry, ConnectFailureSignal, ConnectSuccessSignal, ControlSignal, StreamErrorSignal,
    TAG_FAILURE, TAG_IB, TAG_STREAM_ERROR, TAG_SUCCESS,
};
