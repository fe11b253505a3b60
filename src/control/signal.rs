//! Control signals parsed from server nodes.
//!
//! | Tag            | Signal                                 |
//! |----------------|----------------------------------------|
//! | `stream:error` | [`ControlSignal::StreamError`]         |
//! | `failure`      | [`ControlSignal::ConnectFailure`]      |
//! | `success`      | [`ControlSignal::ConnectSuccess`]      |
//! | `ib`           | [`ControlSignal::InlineBroadcast`]     |

use std::collections::BTreeMap;

use super::node::{Jid, Node};
use crate::events::ConnectFailureReason;

/// Tag of a stream error node.
pub const TAG_STREAM_ERROR: &str = "stream:error";
/// Tag of a connect failure node.
pub const TAG_FAILURE: &str = "failure";
/// Tag of a connect success node.
pub const TAG_SUCCESS: &str = "success";
/// Tag of an inline broadcast node.
pub const TAG_IB: &str = "ib";

/// One child of an inline broadcast node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEntry {
    /// Child tag, e.g. `offline_preview`.
    pub subtag: String,
    /// Child attributes.
    pub attrs: BTreeMap<String, String>,
}

impl BroadcastEntry {
    /// Integer attribute, `0` when missing or malformed.
    pub fn int(&self, key: &str) -> i64 {
        self.attrs
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

/// Fields of a `stream:error` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorSignal {
    /// The `code` attribute (empty if missing).
    pub code: String,
    /// The `type` of a `conflict` child, if any.
    pub conflict_type: Option<String>,
}

impl StreamErrorSignal {
    /// Read the stream error fields from `node`.
    pub fn from_node(node: &Node) -> Self {
        Self {
            code: node.attr("code").unwrap_or_default().to_string(),
            conflict_type: node
                .child_by_tag("conflict")
                .and_then(|conflict| conflict.attr("type"))
                .map(str::to_string),
        }
    }
}

/// Fields of a connect `failure` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailureSignal {
    /// The `reason` attribute (`0` if missing or out of range).
    pub reason: ConnectFailureReason,
    /// Optional server message.
    pub message: Option<String>,
}

impl ConnectFailureSignal {
    /// Read the connect failure fields from `node`.
    pub fn from_node(node: &Node) -> Self {
        Self {
            reason: ConnectFailureReason(
                node.int_attr("reason")
                    .and_then(|reason| i32::try_from(reason).ok())
                    .unwrap_or(0),
            ),
            message: node.attr("message").map(str::to_string),
        }
    }
}

/// Fields of a connect `success` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSuccessSignal {
    /// Linked identity supplied by the server.
    pub lid: Option<Jid>,
}

impl ConnectSuccessSignal {
    /// Read the connect success fields from `node`.
    pub fn from_node(node: &Node) -> Self {
        Self {
            lid: node.jid_attr("lid"),
        }
    }
}

/// A lifecycle-relevant signal pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Problem with the live stream.
    StreamError(StreamErrorSignal),
    /// Authentication / connection setup failed.
    ConnectFailure(ConnectFailureSignal),
    /// Authentication succeeded.
    ConnectSuccess(ConnectSuccessSignal),
    /// Inline broadcast notices.
    InlineBroadcast {
        /// One entry per child node.
        entries: Vec<BroadcastEntry>,
    },
}

impl ControlSignal {
    /// Parse a node. Returns `None` for nodes that are not control signals.
    pub fn from_node(node: &Node) -> Option<Self> {
        let signal = match node.tag.as_str() {
            TAG_STREAM_ERROR => Self::StreamError(StreamErrorSignal::from_node(node)),
            TAG_FAILURE => Self::ConnectFailure(ConnectFailureSignal::from_node(node)),
            TAG_SUCCESS => Self::ConnectSuccess(ConnectSuccessSignal::from_node(node)),
            TAG_IB => Self::InlineBroadcast {
                entries: node
                    .children
                    .iter()
                    .map(|child| BroadcastEntry {
                        subtag: child.tag.clone(),
                        attrs: child.attrs.clone(),
                    })
                    .collect(),
            },
            _ => return None,
        };
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_error_with_conflict() {
        let node = Node::new(TAG_STREAM_ERROR)
            .with_attr("code", "401")
            .with_child(Node::new("conflict").with_attr("type", "device_removed"));

        assert_eq!(
            ControlSignal::from_node(&node),
            Some(ControlSignal::StreamError(StreamErrorSignal {
                code: "401".to_string(),
                conflict_type: Some("device_removed".to_string()),
            }))
        );
    }

    #[test]
    fn test_parse_stream_error_without_code() {
        let node = Node::new(TAG_STREAM_ERROR).with_child(Node::new("conflict"));

        assert_eq!(
            ControlSignal::from_node(&node),
            Some(ControlSignal::StreamError(StreamErrorSignal {
                code: String::new(),
                conflict_type: None,
            }))
        );
    }

    #[test]
    fn test_parse_failure() {
        let node = Node::new(TAG_FAILURE).with_attr("reason", 402).with_attr("message", "banned");

        assert_eq!(
            ControlSignal::from_node(&node),
            Some(ControlSignal::ConnectFailure(ConnectFailureSignal {
                reason: ConnectFailureReason::TEMP_BANNED,
                message: Some("banned".to_string()),
            }))
        );
    }

    #[test]
    fn test_parse_failure_bad_reason() {
        let node = Node::new(TAG_FAILURE).with_attr("reason", "99999999999");
        assert_eq!(ConnectFailureSignal::from_node(&node).reason, ConnectFailureReason(0));
    }

    #[test]
    fn test_parse_success() {
        let node = Node::new(TAG_SUCCESS).with_attr("lid", "42@lid");
        assert_eq!(
            ControlSignal::from_node(&node),
            Some(ControlSignal::ConnectSuccess(ConnectSuccessSignal {
                lid: Some(Jid::new("42", "lid")),
            }))
        );

        let bare = Node::new(TAG_SUCCESS);
        assert_eq!(
            ControlSignal::from_node(&bare),
            Some(ControlSignal::ConnectSuccess(ConnectSuccessSignal { lid: None }))
        );
    }

    #[test]
    fn test_parse_ib() {
        let node = Node::new(TAG_IB)
            .with_child(Node::new("offline_preview").with_attr("count", 10).with_attr("message", 4))
            .with_child(Node::new("offline").with_attr("count", 10));

        let Some(ControlSignal::InlineBroadcast { entries }) = ControlSignal::from_node(&node) else {
            panic!("expected inline broadcast");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].subtag, "offline_preview");
        assert_eq!(entries[0].int("message"), 4);
        assert_eq!(entries[0].int("receipt"), 0);
        assert_eq!(entries[1].int("count"), 10);
    }

    #[test]
    fn test_other_nodes_ignored() {
        assert!(ControlSignal::from_node(&Node::new("message")).is_none());
    }
}
