//! Dispatch tables for server-signalled failures.
//!
//! Each table is evaluated top to bottom and the first matching row wins;
//! the last row is the mandatory default. Handlers in the controller only
//! execute the chosen action, so precedence lives in one place.

use crate::events::ConnectFailureReason;

/// Stream error code asking the client to reconnect (e.g. after pairing).
pub const CODE_RECONNECT: &str = "515";
/// Stream error code for an unauthorized stream.
pub const CODE_UNAUTHORIZED: &str = "401";
/// Stream error code for a temporarily unavailable server.
pub const CODE_SERVICE_UNAVAILABLE: &str = "503";
/// Conflict type: this device was removed from the account.
pub const CONFLICT_DEVICE_REMOVED: &str = "device_removed";
/// Conflict type: another client took over the stream.
pub const CONFLICT_REPLACED: &str = "replaced";

/// Inputs to the stream error table.
#[derive(Debug, Clone, Copy)]
pub struct StreamErrorInput<'a> {
    /// The `code` attribute.
    pub code: &'a str,
    /// The `type` of a `conflict` child.
    pub conflict_type: Option<&'a str>,
    /// Whether a 515 should reconnect automatically.
    pub login_auto_reconnect: bool,
    /// Whether a credential refresher is configured.
    pub can_refresh_credential: bool,
}

/// What to do about a stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorAction {
    /// 515 with auto-reconnect disabled: tell the application.
    ManualLoginReconnect,
    /// 515: disconnect and reconnect in the background.
    Reconnect,
    /// Device removed: log out and delete the session.
    DeviceRemoved,
    /// Stream replaced by another client.
    Replaced,
    /// 503: the generic disconnect path reconnects.
    AwaitAutoReconnect,
    /// Rotating credential expired/invalid: refresh it.
    RefreshCredential,
    /// Anything else.
    Unknown,
}

/// Pick the action for a stream error.
pub fn classify_stream_error(input: &StreamErrorInput<'_>) -> StreamErrorAction {
    let conflict = input.conflict_type.unwrap_or_default();
    match input.code {
        CODE_RECONNECT if !input.login_auto_reconnect => StreamErrorAction::ManualLoginReconnect,
        CODE_RECONNECT => StreamErrorAction::Reconnect,
        CODE_UNAUTHORIZED if conflict == CONFLICT_DEVICE_REMOVED => StreamErrorAction::DeviceRemoved,
        _ if conflict == CONFLICT_REPLACED => StreamErrorAction::Replaced,
        CODE_SERVICE_UNAVAILABLE => StreamErrorAction::AwaitAutoReconnect,
        code if input.can_refresh_credential && is_cat_code(code) => {
            StreamErrorAction::RefreshCredential
        }
        _ => StreamErrorAction::Unknown,
    }
}

fn is_cat_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| ConnectFailureReason(code).is_cat_failure())
}

/// Reconnect policy applied to every connect failure before its semantic
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Suppress auto-reconnect for the coming disconnect.
    ExpectDisconnect,
    /// Let the generic auto-reconnect path run.
    AutoReconnect,
    /// Auto-reconnect, but only after the credential refresh completes.
    AfterCredentialRefresh,
}

impl ReconnectPolicy {
    /// Policy for a connect failure reason.
    pub fn for_reason(reason: ConnectFailureReason) -> Self {
        match reason {
            ConnectFailureReason::SERVICE_UNAVAILABLE
            | ConnectFailureReason::INTERNAL_SERVER_ERROR => Self::AutoReconnect,
            reason if reason.is_cat_failure() => Self::AfterCredentialRefresh,
            _ => Self::ExpectDisconnect,
        }
    }

    /// Whether a reconnect follows this failure.
    pub fn will_auto_reconnect(self) -> bool {
        !matches!(self, Self::ExpectDisconnect)
    }
}

/// What to do about a connect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureAction {
    /// Log out and delete the session.
    LoggedOut,
    /// Report a temporary ban.
    TemporaryBan,
    /// Report an outdated client.
    ClientOutdated,
    /// Refresh the rotating credential.
    RefreshCredential,
    /// Log only; auto-reconnect handles it.
    AwaitAutoReconnect,
    /// Anything else.
    Unknown,
}

/// Pick the action for a connect failure.
pub fn classify_connect_failure(
    reason: ConnectFailureReason,
    policy: ReconnectPolicy,
) -> ConnectFailureAction {
    match reason {
        reason if reason.is_logged_out() => ConnectFailureAction::LoggedOut,
        ConnectFailureReason::TEMP_BANNED => ConnectFailureAction::TemporaryBan,
        ConnectFailureReason::CLIENT_OUTDATED => ConnectFailureAction::ClientOutdated,
        reason if reason.is_cat_failure() => ConnectFailureAction::RefreshCredential,
        _ if policy.will_auto_reconnect() => ConnectFailureAction::AwaitAutoReconnect,
        _ => ConnectFailureAction::Unknown,
    }
}
