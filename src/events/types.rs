//! Connection lifecycle events and the reason codes they carry.

use std::fmt;
use std::time::Duration;

use crate::control::Node;
use crate::error::SessionError;

/// Reason code of a connect failure (`<failure reason="...">`).
///
/// Unknown codes are carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectFailureReason(pub i32);

impl ConnectFailureReason {
    /// Generic failure.
    pub const GENERIC: Self = Self(400);
    /// Logged out from another device.
    pub const LOGGED_OUT: Self = Self(401);
    /// Account temporarily banned.
    pub const TEMP_BANNED: Self = Self(402);
    /// Primary device was logged out.
    pub const MAIN_DEVICE_GONE: Self = Self(403);
    /// Client is out of date.
    pub const CLIENT_OUTDATED: Self = Self(405);
    /// Logged out for an unknown reason.
    pub const UNKNOWN_LOGOUT: Self = Self(406);
    /// Client user agent was rejected.
    pub const BAD_USER_AGENT: Self = Self(409);
    /// Rotating crypto auth token has expired.
    pub const CAT_EXPIRED: Self = Self(413);
    /// Rotating crypto auth token is invalid.
    pub const CAT_INVALID: Self = Self(414);
    /// Not found.
    pub const NOT_FOUND: Self = Self(415);
    /// Unknown client.
    pub const CLIENT_UNKNOWN: Self = Self(418);
    /// Server returned 500.
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    /// Experimental.
    pub const EXPERIMENTAL: Self = Self(501);
    /// Server returned 503.
    pub const SERVICE_UNAVAILABLE: Self = Self(503);

    /// Numeric code.
    pub fn code(self) -> i32 {
        self.0
    }

    /// Code as it appears in a stream error's `code` attribute.
    pub fn number_string(self) -> String {
        self.0.to_string()
    }

    /// Whether this reason means the session is gone and must be deleted.
    pub fn is_logged_out(self) -> bool {
        self == Self::LOGGED_OUT || self == Self::MAIN_DEVICE_GONE || self == Self::UNKNOWN_LOGOUT
    }

    /// Whether this reason concerns the rotating credential.
    pub fn is_cat_failure(self) -> bool {
        self == Self::CAT_EXPIRED || self == Self::CAT_INVALID
    }

    /// Human-readable description for known codes.
    pub fn description(self) -> Option<&'static str> {
        let message = match self {
            Self::GENERIC => "generic error",
            Self::LOGGED_OUT => "logged out from another device",
            Self::TEMP_BANNED => "account temporarily banned",
            Self::MAIN_DEVICE_GONE => "primary device was logged out",
            Self::CLIENT_OUTDATED => "client is out of date",
            Self::UNKNOWN_LOGOUT => "logged out for unknown reason",
            Self::BAD_USER_AGENT => "client user agent was rejected",
            Self::CAT_EXPIRED => "crypto auth token has expired",
            Self::CAT_INVALID => "crypto auth token is invalid",
            Self::NOT_FOUND => "not found",
            Self::CLIENT_UNKNOWN => "unknown client",
            Self::INTERNAL_SERVER_ERROR => "server returned error 500",
            Self::EXPERIMENTAL => "experimental",
            Self::SERVICE_UNAVAILABLE => "server returned error 503",
            _ => return None,
        };
        Some(message)
    }
}

impl fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(message) => write!(f, "{}: {}", self.0, message),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Ban code carried by a temporary-ban connect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempBanReason(pub i32);

impl TempBanReason {
    /// Sent too many messages to people who don't have you in their contacts.
    pub const SENT_TO_TOO_MANY_PEOPLE: Self = Self(101);
    /// Too many people blocked you.
    pub const BLOCKED_BY_USERS: Self = Self(102);
    /// Created too many groups with people who don't have you in their contacts.
    pub const CREATED_TOO_MANY_GROUPS: Self = Self(103);
    /// Sent the same message to too many people.
    pub const SENT_TOO_MANY_SAME_MESSAGE: Self = Self(104);
    /// Sent too many messages to a broadcast list.
    pub const BROADCAST_LIST: Self = Self(106);

    /// Human-readable description for known codes.
    pub fn description(self) -> Option<&'static str> {
        let message = match self {
            Self::SENT_TO_TOO_MANY_PEOPLE => {
                "you sent too many messages to people who don't have you in their address books"
            }
            Self::BLOCKED_BY_USERS => "too many people blocked you",
            Self::CREATED_TOO_MANY_GROUPS => {
                "you created too many groups with people who don't have you in their address books"
            }
            Self::SENT_TOO_MANY_SAME_MESSAGE => "you sent the same message to too many people",
            Self::BROADCAST_LIST => "you sent too many messages to a broadcast list",
            _ => return None,
        };
        Some(message)
    }
}

impl fmt::Display for TempBanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(message) => write!(f, "{}: {}", self.0, message),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Events emitted by the lifecycle controller.
///
/// Plain records for application code; nothing flows back into the
/// controller.
#[derive(Debug)]
pub enum Event {
    /// Session ended; local session state has been deleted.
    LoggedOut {
        /// `true` if signalled by a connect failure, `false` for a stream error.
        on_connect: bool,
        /// Reason code.
        reason: ConnectFailureReason,
    },
    /// Another client took over this session.
    StreamReplaced,
    /// Account is temporarily banned.
    TemporaryBan {
        /// Ban code.
        code: TempBanReason,
        /// Time until the ban expires.
        expire: Duration,
    },
    /// Server rejected the client version.
    ClientOutdated,
    /// Rotating credential could not be refreshed; no reconnect will follow.
    CatRefreshError {
        /// Refresh failure.
        error: SessionError,
    },
    /// Authenticated and post-connect setup done.
    Connected,
    /// Unrecognized connect failure.
    ConnectFailure {
        /// Reason code.
        reason: ConnectFailureReason,
        /// Optional server message.
        message: Option<String>,
        /// The raw failure node.
        raw: Node,
    },
    /// Unrecognized stream error.
    StreamError {
        /// The `code` attribute.
        code: String,
        /// The raw stream error node.
        raw: Node,
    },
    /// Server asked for a reconnect after login, but auto-reconnect is disabled.
    ManualLoginReconnect,
    /// Server announced the size of the offline backlog.
    OfflineSyncPreview {
        /// Total queued items.
        total: i64,
        /// App state changes.
        app_data_changes: i64,
        /// Messages.
        messages: i64,
        /// Notifications.
        notifications: i64,
        /// Receipts.
        receipts: i64,
    },
    /// Offline backlog fully delivered.
    OfflineSyncCompleted {
        /// Number of items delivered.
        count: i64,
    },
    /// A QR code was scanned by a phone without multidevice support.
    QrScannedWithoutMultidevice,
}

impl Event {
    /// Short event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::LoggedOut { .. } => "LoggedOut",
            Event::StreamReplaced => "StreamReplaced",
            Event::TemporaryBan { .. } => "TemporaryBan",
            Event::ClientOutdated => "ClientOutdated",
            Event::CatRefreshError { .. } => "CATRefreshError",
            Event::Connected => "Connected",
            Event::ConnectFailure { .. } => "ConnectFailure",
            Event::StreamError { .. } => "StreamError",
            Event::ManualLoginReconnect => "ManualLoginReconnect",
            Event::OfflineSyncPreview { .. } => "OfflineSyncPreview",
            Event::OfflineSyncCompleted { .. } => "OfflineSyncCompleted",
            Event::QrScannedWithoutMultidevice => "QRScannedWithoutMultidevice",
        }
    }
}
