//! Decoded protocol nodes and identities.
//!
//! The binary node decoder lives outside this crate; it hands over nodes in
//! this shape. Only the tag, string attributes and children matter to the
//! lifecycle layer.

use std::collections::BTreeMap;
use std::fmt;

/// A decoded protocol node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Node tag, e.g. `success` or `stream:error`.
    pub tag: String,
    /// String attributes.
    pub attrs: BTreeMap<String, String>,
    /// Child nodes.
    pub children: Vec<Node>,
}

impl Node {
    /// Create a node with no attributes or children.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Add an attribute (builder style).
    pub fn with_attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.insert(key.into(), value.to_string());
        self
    }

    /// Add a child node (builder style).
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Get a string attribute.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Get an integer attribute. Missing or malformed values yield `None`.
    pub fn int_attr(&self, key: &str) -> Option<i64> {
        self.attr(key)?.parse().ok()
    }

    /// Get a JID attribute. Missing, malformed or empty values yield `None`.
    pub fn jid_attr(&self, key: &str) -> Option<Jid> {
        self.attr(key)?.parse::<Jid>().ok().filter(|jid| !jid.is_empty())
    }

    /// Find the first child with the given tag.
    pub fn child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.tag == tag)
    }

    /// Render the node as XML for log output.
    pub fn xml_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (key, value) in &self.attrs {
            write!(f, " {key}=\"{value}\"")?;
        }
        if self.children.is_empty() {
            return write!(f, "/>");
        }
        write!(f, ">")?;
        for child in &self.children {
            write!(f, "{child}")?;
        }
        write!(f, "</{}>", self.tag)
    }
}

/// A protocol identity of the form `user@server`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Jid {
    /// User part (may carry an agent/device suffix).
    pub user: String,
    /// Server part, e.g. `s.whatsapp.net` or `lid`.
    pub server: String,
}

impl Jid {
    /// Create a JID from its parts.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    /// An empty JID carries no identity.
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl std::str::FromStr for Jid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((user, server)) if !server.is_empty() && !server.contains('@') => {
                Ok(Self::new(user, server))
            }
            // Bare server JIDs like `s.whatsapp.net`
            None if !s.is_empty() => Ok(Self::new("", s)),
            None => Ok(Self::default()),
            _ => Err(format!("invalid JID: {s}")),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}
