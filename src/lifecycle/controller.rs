//! Connection lifecycle controller.
//!
//! Interprets server control nodes and decides, for each one, whether to
//! carry on, reconnect, refresh the rotating credential first, drop the
//! session for good, or tell the application.
//!
//! # Example
//!
//! ```ignore
//! use wasession::lifecycle::LifecycleController;
//!
//! let controller = LifecycleController::builder()
//!     .store(store)
//!     .dispatcher(event_bus)
//!     .waiters(waiters)
//!     .connector(connector)
//!     .requests(iq_client)
//!     .credential_refresher(cat_refresher)
//!     .build()?;
//!
//! // from the node decoder
//! controller.handle_node(&node).await;
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{watch, RwLock};

use super::collaborators::{
    Connector, CredentialRefresher, RequestWaiters, ServerRequests, SessionStore,
};
use super::config::LifecycleConfig;
use super::policy::{
    classify_connect_failure, classify_stream_error, ConnectFailureAction, ReconnectPolicy,
    StreamErrorAction, StreamErrorInput,
};
use super::state::{LifecyclePhase, ReconnectDecision, SessionState};
use crate::control::{
    BroadcastEntry, ConnectFailureSignal, ConnectSuccessSignal, ControlSignal, Jid, Node,
    StreamErrorSignal,
};
use crate::error::{Result, SessionError};
use crate::events::{ConnectFailureReason, Event, EventDispatcher, TempBanReason};

/// Builder for a [`LifecycleController`].
#[derive(Default)]
pub struct LifecycleControllerBuilder {
    config: LifecycleConfig,
    store: Option<Arc<dyn SessionStore>>,
    dispatcher: Option<Arc<dyn EventDispatcher>>,
    waiters: Option<Arc<dyn RequestWaiters>>,
    connector: Option<Arc<dyn Connector>>,
    requests: Option<Arc<dyn ServerRequests>>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl LifecycleControllerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Don't reconnect automatically after a 515 stream error.
    pub fn disable_login_auto_reconnect(mut self, disable: bool) -> Self {
        self.config.disable_login_auto_reconnect = disable;
        self
    }

    /// Deadline for a rotating credential refresh.
    pub fn cat_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.config.cat_refresh_timeout_secs = timeout.as_secs();
        self
    }

    /// Session store (required).
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Event dispatcher (required).
    pub fn dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Request waiter registry (required).
    pub fn waiters(mut self, waiters: Arc<dyn RequestWaiters>) -> Self {
        self.waiters = Some(waiters);
        self
    }

    /// Physical connector (required).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Server request client (required).
    pub fn requests(mut self, requests: Arc<dyn ServerRequests>) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Rotating credential refresher (optional).
    pub fn credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Build the controller. Fails if a required collaborator is missing.
    pub fn build(self) -> Result<LifecycleController> {
        fn required<T: ?Sized>(value: Option<Arc<T>>, name: &str) -> Result<Arc<T>> {
            value.ok_or_else(|| SessionError::Protocol(format!("missing {name}")))
        }

        let (ready, _) = watch::channel(false);
        Ok(LifecycleController {
            inner: Arc::new(Inner {
                state: SessionState::new(),
                store: required(self.store, "session store")?,
                dispatcher: required(self.dispatcher, "event dispatcher")?,
                waiters: required(self.waiters, "request waiters")?,
                connector: required(self.connector, "connector")?,
                requests: required(self.requests, "server requests")?,
                refresher: self.refresher,
                config: self.config,
                socket_lock: RwLock::new(()),
                ready,
            }),
        })
    }
}

struct Inner {
    config: LifecycleConfig,
    state: SessionState,
    store: Arc<dyn SessionStore>,
    dispatcher: Arc<dyn EventDispatcher>,
    waiters: Arc<dyn RequestWaiters>,
    connector: Arc<dyn Connector>,
    requests: Arc<dyn ServerRequests>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    /// Refresh holds it exclusively, socket opens hold it shared.
    socket_lock: RwLock<()>,
    ready: watch::Sender<bool>,
}

/// Connection lifecycle controller.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    /// Create a new controller builder.
    pub fn builder() -> LifecycleControllerBuilder {
        LifecycleControllerBuilder::new()
    }

    /// Session state.
    pub fn state(&self) -> &SessionState {
        &self.inner.state
    }

    /// Active configuration.
    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// Route a decoded node to its handler.
    ///
    /// Returns `false` if the node is not a control signal.
    pub async fn handle_node(&self, node: &Node) -> bool {
        let Some(signal) = ControlSignal::from_node(node) else {
            return false;
        };
        match signal {
            ControlSignal::StreamError(error) => self.on_stream_error(node, &error).await,
            ControlSignal::ConnectFailure(failure) => self.on_connect_failure(node, &failure).await,
            ControlSignal::ConnectSuccess(success) => self.on_connect_success(success).await,
            ControlSignal::InlineBroadcast { entries } => self.handle_inline_broadcast(&entries),
        }
        true
    }

    /// Handle a `stream:error` node.
    pub async fn handle_stream_error(&self, node: &Node) {
        self.on_stream_error(node, &StreamErrorSignal::from_node(node)).await;
    }

    /// Handle a `failure` node received during connect.
    pub async fn handle_connect_failure(&self, node: &Node) {
        self.on_connect_failure(node, &ConnectFailureSignal::from_node(node)).await;
    }

    /// Handle a `success` node.
    ///
    /// Session bookkeeping happens inline; pre-key reconciliation, the
    /// set-active request and the `Connected` event follow in a background
    /// task whose errors are logged, not propagated.
    pub async fn handle_connect_success(&self, node: &Node) {
        self.on_connect_success(ConnectSuccessSignal::from_node(node)).await;
    }

    async fn on_stream_error(&self, node: &Node, error: &StreamErrorSignal) {
        let inner = &self.inner;
        inner.state.set_logged_in(false);
        inner.state.set_phase(LifecyclePhase::Disconnected);
        inner.ready.send_replace(false);
        inner.waiters.clear_all(node);

        let code = error.code.as_str();
        let action = classify_stream_error(&StreamErrorInput {
            code,
            conflict_type: error.conflict_type.as_deref(),
            login_auto_reconnect: !inner.config.disable_login_auto_reconnect,
            can_refresh_credential: inner.refresher.is_some(),
        });

        match action {
            StreamErrorAction::ManualLoginReconnect => {
                tracing::info!("Got 515 code, but login autoreconnect is disabled, not reconnecting");
                inner.dispatcher.dispatch(Event::ManualLoginReconnect);
            }
            StreamErrorAction::Reconnect => {
                tracing::info!("Got 515 code, reconnecting...");
                let controller = self.clone();
                // The socket drop this causes is local: the read loop reports
                // it with `handle_disconnect(false)`, so no second reconnect.
                tokio::spawn(async move {
                    controller.inner.connector.disconnect().await;
                    if let Err(e) = controller.connect().await {
                        tracing::error!("Failed to reconnect after 515 code: {}", e);
                    }
                });
            }
            StreamErrorAction::DeviceRemoved => {
                inner.state.expect_disconnect();
                tracing::info!(
                    "Got device removed stream error, sending LoggedOut event and deleting session"
                );
                inner.dispatcher.dispatch(Event::LoggedOut {
                    on_connect: false,
                    reason: ConnectFailureReason::LOGGED_OUT,
                });
                if let Err(e) = inner.store.delete().await {
                    tracing::warn!("Failed to delete store after device_removed error: {}", e);
                }
            }
            StreamErrorAction::Replaced => {
                inner.state.expect_disconnect();
                tracing::info!("Got replaced stream error, sending StreamReplaced event");
                inner.dispatcher.dispatch(Event::StreamReplaced);
            }
            StreamErrorAction::AwaitAutoReconnect => {
                tracing::warn!("Got 503 stream error, assuming automatic reconnect will handle it");
            }
            StreamErrorAction::RefreshCredential => {
                tracing::info!("Got {} stream error, refreshing CAT before reconnecting...", code);
                self.refresh_credential_or_give_up().await;
            }
            StreamErrorAction::Unknown => {
                tracing::error!("Unknown stream error: {}", node.xml_string());
                inner.dispatcher.dispatch(Event::StreamError {
                    code: code.to_string(),
                    raw: node.clone(),
                });
            }
        }
    }

    async fn on_connect_failure(&self, node: &Node, failure: &ConnectFailureSignal) {
        let inner = &self.inner;
        let reason = failure.reason;
        let message = failure.message.as_deref().unwrap_or_default();

        let policy = ReconnectPolicy::for_reason(reason);
        if policy == ReconnectPolicy::ExpectDisconnect {
            inner.state.expect_disconnect();
        }

        if reason == ConnectFailureReason::MAIN_DEVICE_GONE {
            tracing::debug!(
                "Message for 403 connect failure: {} / {}",
                node.attr("logout_message_header").unwrap_or_default(),
                node.attr("logout_message_subtext").unwrap_or_default(),
            );
        }

        match classify_connect_failure(reason, policy) {
            ConnectFailureAction::LoggedOut => {
                tracing::info!(
                    "Got {} connect failure, sending LoggedOut event and deleting session",
                    reason
                );
                inner.dispatcher.dispatch(Event::LoggedOut {
                    on_connect: true,
                    reason,
                });
                if let Err(e) = inner.store.delete().await {
                    tracing::warn!("Failed to delete store after {} failure: {}", reason.code(), e);
                }
            }
            ConnectFailureAction::TemporaryBan => {
                tracing::warn!("Temporary ban connect failure: {}", node.xml_string());
                let expire = node.int_attr("expire").unwrap_or(0).max(0);
                inner.dispatcher.dispatch(Event::TemporaryBan {
                    code: TempBanReason(
                        node.int_attr("code")
                            .and_then(|code| i32::try_from(code).ok())
                            .unwrap_or(0),
                    ),
                    expire: Duration::from_secs(expire.unsigned_abs()),
                });
            }
            ConnectFailureAction::ClientOutdated => {
                tracing::error!("Client outdated (405) connect failure");
                inner.dispatcher.dispatch(Event::ClientOutdated);
            }
            ConnectFailureAction::RefreshCredential => {
                tracing::info!(
                    "Got {}/{} connect failure, refreshing CAT before reconnecting...",
                    reason.code(),
                    message
                );
                self.refresh_credential_or_give_up().await;
            }
            ConnectFailureAction::AwaitAutoReconnect => {
                tracing::warn!(
                    "Got {}/{} connect failure, assuming automatic reconnect will handle it",
                    reason.code(),
                    message
                );
            }
            ConnectFailureAction::Unknown => {
                tracing::warn!("Unknown connect failure: {}", node.xml_string());
                inner.dispatcher.dispatch(Event::ConnectFailure {
                    reason,
                    message: failure.message.clone(),
                    raw: node.clone(),
                });
            }
        }
    }

    async fn on_connect_success(&self, success: ConnectSuccessSignal) {
        let inner = &self.inner;
        tracing::info!("Successfully authenticated");
        inner.state.mark_connected(SystemTime::now());

        self.reconcile_lid(success.lid).await;

        // Written on every connect so devices missing the row get it
        let store = &inner.store;
        if let Err(e) = store
            .store_lid_pn_mapping(store.lid(), store.primary_id())
            .await
        {
            tracing::warn!("Failed to store own LID-PN mapping: {}", e);
        }

        self.spawn_post_connect();
    }

    /// Handle an `ib` node.
    pub fn handle_inline_broadcast(&self, entries: &[BroadcastEntry]) {
        let dispatcher = &self.inner.dispatcher;
        for entry in entries {
            match entry.subtag.as_str() {
                "downgrade_webclient" => dispatcher.dispatch(Event::QrScannedWithoutMultidevice),
                "offline_preview" => dispatcher.dispatch(Event::OfflineSyncPreview {
                    total: entry.int("count"),
                    app_data_changes: entry.int("appdata"),
                    messages: entry.int("message"),
                    notifications: entry.int("notification"),
                    receipts: entry.int("receipt"),
                }),
                "offline" => dispatcher.dispatch(Event::OfflineSyncCompleted {
                    count: entry.int("count"),
                }),
                other => tracing::debug!("Ignoring ib child {}", other),
            }
        }
    }

    /// Open the physical connection.
    ///
    /// Waits for any in-progress credential refresh to finish first.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _socket = inner.socket_lock.read().await;

        inner.state.reset_expected_disconnect();
        inner.state.set_phase(LifecyclePhase::Connecting);
        match inner.connector.connect().await {
            Ok(()) => {
                inner.state.set_phase(LifecyclePhase::Authenticating);
                Ok(())
            }
            Err(e) => {
                inner.state.set_phase(LifecyclePhase::Disconnected);
                Err(e)
            }
        }
    }

    /// Record that the physical connection dropped.
    ///
    /// `remote` is `false` when the drop came from a local close (the frame
    /// stream ended with `None`); those never reconnect and leave the
    /// expect-disconnect flag alone. Remote drops consume the flag and tell
    /// the reconnection scheduler whether to reconnect.
    pub fn handle_disconnect(&self, remote: bool) -> ReconnectDecision {
        let state = &self.inner.state;
        state.set_logged_in(false);
        state.set_phase(LifecyclePhase::Disconnected);
        self.inner.ready.send_replace(false);

        if !remote {
            tracing::debug!("Disconnect was initiated locally, not reconnecting");
            ReconnectDecision::Suppressed
        } else if state.take_expected_disconnect() {
            tracing::debug!("Disconnect was expected, not reconnecting");
            ReconnectDecision::Suppressed
        } else {
            ReconnectDecision::AutoReconnect
        }
    }

    /// Count a failed auto-reconnect attempt. Returns the new count.
    pub fn record_reconnect_failure(&self) -> u32 {
        self.inner.state.record_reconnect_failure()
    }

    /// Wait until the post-connect sequence has emitted `Connected`.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // Sender lives as long as `self`, so this cannot fail
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Whether the post-connect sequence has completed.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Refresh the rotating credential while holding the socket lock
    /// exclusively, bounded by the configured deadline.
    pub async fn refresh_credential(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(refresher) = inner.refresher.as_ref() else {
            return Err(SessionError::CredentialRefresh(
                "no credential refresher configured".to_string(),
            ));
        };

        let _socket = inner.socket_lock.write().await;
        match tokio::time::timeout(inner.config.cat_refresh_timeout(), refresher.refresh()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::RefreshTimeout),
        }
    }

    async fn refresh_credential_or_give_up(&self) {
        if let Err(e) = self.refresh_credential().await {
            tracing::error!("Failed to refresh CAT: {}", e);
            self.inner.state.expect_disconnect();
            self.inner.dispatcher.dispatch(Event::CatRefreshError { error: e });
        }
    }

    async fn reconcile_lid(&self, server_lid: Option<Jid>) {
        let store = &self.inner.store;
        let mut local = store.lid();

        if let (Some(stored), Some(received)) = (&local, &server_lid) {
            if stored != received {
                tracing::warn!(
                    "Stored LID doesn't match one in connect success: {} != {}",
                    stored,
                    received
                );
                store.set_lid(None);
                local = None;
            }
        }

        if local.is_none() {
            if let Some(lid) = server_lid {
                store.set_lid(Some(lid.clone()));
                match store.save().await {
                    Ok(()) => tracing::info!("Updated LID to {}", lid),
                    Err(e) => tracing::warn!("Failed to save device after updating LID: {}", e),
                }
            }
        }
    }

    fn spawn_post_connect(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            let inner = &controller.inner;
            controller.reconcile_pre_keys().await;

            if let Err(e) = inner.requests.set_passive(false).await {
                tracing::warn!("Failed to send post-connect passive IQ: {}", e);
            }

            inner.dispatcher.dispatch(Event::Connected);
            inner.ready.send_replace(true);
        });
    }

    async fn reconcile_pre_keys(&self) {
        let inner = &self.inner;
        let min = inner.config.min_pre_key_count;

        let local_count = match inner.store.uploaded_pre_key_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Failed to get number of prekeys in database: {}", e);
                return;
            }
        };
        let server_count = match inner.requests.server_pre_key_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to get number of prekeys on server: {}", e);
                return;
            }
        };

        tracing::debug!(
            "Database has {} prekeys, server says we have {}",
            local_count,
            server_count
        );
        if server_count >= min && local_count >= min {
            return;
        }

        if let Err(e) = inner.requests.upload_pre_keys().await {
            tracing::error!("Failed to upload prekeys: {}", e);
            return;
        }
        match inner.requests.server_pre_key_count().await {
            Ok(count) => tracing::debug!("Prekey count after upload: {}", count),
            Err(e) => tracing::warn!("Failed to get prekey count after upload: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelDispatcher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeStore {
        lid: Mutex<Option<Jid>>,
        primary: Option<Jid>,
        saves: AtomicUsize,
        deletes: AtomicUsize,
        fail_delete: bool,
        uploaded: AtomicU32,
        mappings: Mutex<Vec<(Option<Jid>, Option<Jid>)>>,
    }

    #[async_trait]
    impl SessionStore for FakeStore {
        fn lid(&self) -> Option<Jid> {
            self.lid.lock().unwrap().clone()
        }

        fn set_lid(&self, lid: Option<Jid>) {
            *self.lid.lock().unwrap() = lid;
        }

        fn primary_id(&self) -> Option<Jid> {
            self.primary.clone()
        }

        async fn save(&self) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete {
                return Err(SessionError::Store("disk full".to_string()));
            }
            Ok(())
        }

        async fn uploaded_pre_key_count(&self) -> Result<u32> {
            Ok(self.uploaded.load(Ordering::SeqCst))
        }

        async fn store_lid_pn_mapping(&self, lid: Option<Jid>, primary: Option<Jid>) -> Result<()> {
            self.mappings.lock().unwrap().push((lid, primary));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeWaiters {
        cleared: AtomicUsize,
    }

    impl RequestWaiters for FakeWaiters {
        fn clear_all(&self, _node: &Node) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        calls: mpsc::UnboundedSender<&'static str>,
        fail_connect: bool,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn disconnect(&self) {
            let _ = self.calls.send("disconnect");
        }

        async fn connect(&self) -> Result<()> {
            let _ = self.calls.send("connect");
            if self.fail_connect {
                return Err(SessionError::SocketAlreadyOpen);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRequests {
        server_count: AtomicU32,
        uploads: AtomicUsize,
        passive: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ServerRequests for FakeRequests {
        async fn server_pre_key_count(&self) -> Result<u32> {
            Ok(self.server_count.load(Ordering::SeqCst))
        }

        async fn upload_pre_keys(&self) -> Result<()> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            self.server_count.store(50, Ordering::SeqCst);
            Ok(())
        }

        async fn set_passive(&self, passive: bool) -> Result<()> {
            self.passive.lock().unwrap().push(passive);
            Ok(())
        }
    }

    enum Refresh {
        Succeed,
        Fail,
        Hang,
    }

    struct FakeRefresher {
        mode: Refresh,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialRefresher for FakeRefresher {
        async fn refresh(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Refresh::Succeed => Ok(()),
                Refresh::Fail => Err(SessionError::CredentialRefresh("denied".to_string())),
                Refresh::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    struct Harness {
        controller: LifecycleController,
        store: Arc<FakeStore>,
        waiters: Arc<FakeWaiters>,
        requests: Arc<FakeRequests>,
        events: mpsc::UnboundedReceiver<Event>,
        connector_calls: mpsc::UnboundedReceiver<&'static str>,
    }

    impl Harness {
        fn drain_events(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn harness_with(
        store: FakeStore,
        refresher: Option<Arc<FakeRefresher>>,
        configure: impl FnOnce(LifecycleControllerBuilder) -> LifecycleControllerBuilder,
    ) -> Harness {
        let store = Arc::new(store);
        let waiters = Arc::new(FakeWaiters::default());
        let requests = Arc::new(FakeRequests::default());
        requests.server_count.store(50, Ordering::SeqCst);
        store.uploaded.store(50, Ordering::SeqCst);
        let (dispatcher, events) = ChannelDispatcher::new();
        let (calls, connector_calls) = mpsc::unbounded_channel();

        let mut builder = LifecycleController::builder()
            .store(store.clone())
            .dispatcher(Arc::new(dispatcher))
            .waiters(waiters.clone())
            .connector(Arc::new(FakeConnector {
                calls,
                fail_connect: false,
            }))
            .requests(requests.clone());
        if let Some(refresher) = refresher {
            builder = builder.credential_refresher(refresher);
        }

        Harness {
            controller: configure(builder).build().unwrap(),
            store,
            waiters,
            requests,
            events,
            connector_calls,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeStore::default(), None, |builder| builder)
    }

    fn refresher(mode: Refresh) -> Arc<FakeRefresher> {
        Arc::new(FakeRefresher {
            mode,
            calls: AtomicUsize::new(0),
        })
    }

    fn stream_error(code: &str) -> Node {
        Node::new("stream:error").with_attr("code", code)
    }

    fn stream_conflict(code: &str, conflict: &str) -> Node {
        stream_error(code).with_child(Node::new("conflict").with_attr("type", conflict))
    }

    fn failure(reason: i32) -> Node {
        Node::new("failure").with_attr("reason", reason)
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = LifecycleController::builder().build();
        assert!(matches!(result, Err(SessionError::Protocol(msg)) if msg.contains("session store")));
    }

    #[test]
    fn test_builder_configuration() {
        let h = harness_with(FakeStore::default(), None, |builder| {
            builder
                .disable_login_auto_reconnect(true)
                .cat_refresh_timeout(Duration::from_secs(7))
        });
        assert!(h.controller.config().disable_login_auto_reconnect);
        assert_eq!(h.controller.config().cat_refresh_timeout(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_stream_error_515_reconnects() {
        let mut h = harness();
        h.controller.state().set_logged_in(true);

        h.controller.handle_stream_error(&stream_error("515")).await;

        assert!(!h.controller.state().is_logged_in());
        assert_eq!(h.waiters.cleared.load(Ordering::SeqCst), 1);
        assert_eq!(h.connector_calls.recv().await, Some("disconnect"));
        assert_eq!(h.connector_calls.recv().await, Some("connect"));
        assert!(h.drain_events().is_empty());
        assert!(!h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_515_local_drop_does_not_reconnect_again() {
        let mut h = harness();

        h.controller.handle_stream_error(&stream_error("515")).await;
        assert_eq!(h.connector_calls.recv().await, Some("disconnect"));
        assert_eq!(h.connector_calls.recv().await, Some("connect"));

        // The read loop sees its stream end cleanly after the local close
        assert_eq!(h.controller.handle_disconnect(false), ReconnectDecision::Suppressed);
        assert!(h.connector_calls.try_recv().is_err());

        // A later drop by the server still reconnects
        assert_eq!(h.controller.handle_disconnect(true), ReconnectDecision::AutoReconnect);
    }

    #[tokio::test]
    async fn test_stream_error_515_manual_when_disabled() {
        let mut h = harness_with(FakeStore::default(), None, |b| b.disable_login_auto_reconnect(true));

        h.controller.handle_stream_error(&stream_error("515")).await;

        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::ManualLoginReconnect));
        assert!(h.connector_calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_error_device_removed() {
        let mut h = harness();

        h.controller
            .handle_stream_error(&stream_conflict("401", "device_removed"))
            .await;

        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Event::LoggedOut { on_connect: false, reason } if reason == ConnectFailureReason::LOGGED_OUT
        ));
        assert_eq!(h.store.deletes.load(Ordering::SeqCst), 1);
        assert!(h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_device_removed_delete_failure_still_logs_out() {
        let store = FakeStore {
            fail_delete: true,
            ..FakeStore::default()
        };
        let mut h = harness_with(store, None, |b| b);

        h.controller
            .handle_stream_error(&stream_conflict("401", "device_removed"))
            .await;

        assert!(!h.controller.state().is_logged_in());
        assert!(matches!(h.drain_events()[..], [Event::LoggedOut { .. }]));
    }

    #[tokio::test]
    async fn test_stream_error_replaced() {
        let mut h = harness();

        h.controller.handle_stream_error(&stream_conflict("409", "replaced")).await;

        assert!(matches!(h.drain_events()[..], [Event::StreamReplaced]));
        assert!(h.controller.state().is_disconnect_expected());
        assert_eq!(h.store.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_error_503_is_silent() {
        let mut h = harness();

        h.controller.handle_stream_error(&stream_error("503")).await;

        assert!(h.drain_events().is_empty());
        assert!(!h.controller.state().is_disconnect_expected());
        assert_eq!(h.controller.handle_disconnect(true), ReconnectDecision::AutoReconnect);
    }

    #[tokio::test]
    async fn test_stream_error_cat_refresh_success() {
        let refresher = refresher(Refresh::Succeed);
        let mut h = harness_with(FakeStore::default(), Some(refresher.clone()), |b| b);

        h.controller.handle_stream_error(&stream_error("414")).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(h.drain_events().is_empty());
        assert!(!h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_stream_error_cat_refresh_failure() {
        let refresher = refresher(Refresh::Fail);
        let mut h = harness_with(FakeStore::default(), Some(refresher.clone()), |b| b);

        h.controller.handle_stream_error(&stream_error("413")).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            h.drain_events()[..],
            [Event::CatRefreshError { error: SessionError::CredentialRefresh(_) }]
        ));
        assert!(h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_stream_error_cat_without_refresher_is_unknown() {
        let mut h = harness();

        h.controller.handle_stream_error(&stream_error("413")).await;

        assert!(matches!(
            h.drain_events()[..],
            [Event::StreamError { ref code, .. }] if code == "413"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cat_refresh_deadline() {
        let refresher = refresher(Refresh::Hang);
        let mut h = harness_with(FakeStore::default(), Some(refresher), |b| {
            b.cat_refresh_timeout(Duration::from_secs(5))
        });

        h.controller.handle_stream_error(&stream_error("414")).await;

        assert!(matches!(
            h.drain_events()[..],
            [Event::CatRefreshError { error: SessionError::RefreshTimeout }]
        ));
        assert!(h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_stream_error_unknown() {
        let mut h = harness();

        h.controller.handle_stream_error(&stream_error("999")).await;

        let events = h.drain_events();
        assert!(matches!(
            events[..],
            [Event::StreamError { ref code, ref raw }] if code == "999" && raw.tag == "stream:error"
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_logged_out() {
        let mut h = harness();

        h.controller.handle_connect_failure(&failure(401)).await;

        assert!(matches!(
            h.drain_events()[..],
            [Event::LoggedOut { on_connect: true, reason }] if reason == ConnectFailureReason::LOGGED_OUT
        ));
        assert_eq!(h.store.deletes.load(Ordering::SeqCst), 1);
        assert!(h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_connect_failure_main_device_gone() {
        let mut h = harness();
        let node = failure(403)
            .with_attr("logout_message_header", "Logged out")
            .with_attr("logout_message_subtext", "Phone removed this device");

        h.controller.handle_connect_failure(&node).await;

        assert!(matches!(
            h.drain_events()[..],
            [Event::LoggedOut { on_connect: true, reason }] if reason == ConnectFailureReason::MAIN_DEVICE_GONE
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_temp_ban() {
        let mut h = harness();
        let node = failure(402).with_attr("code", 5).with_attr("expire", 3600);

        h.controller.handle_connect_failure(&node).await;

        let events = h.drain_events();
        let [Event::TemporaryBan { code, expire }] = events[..] else {
            panic!("expected one TemporaryBan, got {events:?}");
        };
        assert_eq!(code, TempBanReason(5));
        assert_eq!(expire, Duration::from_secs(3600));
        assert!(h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_connect_failure_client_outdated() {
        let mut h = harness();
        h.controller.handle_connect_failure(&failure(405)).await;
        assert!(matches!(h.drain_events()[..], [Event::ClientOutdated]));
    }

    #[tokio::test]
    async fn test_connect_failure_service_unavailable_auto_reconnects() {
        let mut h = harness();

        h.controller.handle_connect_failure(&failure(503)).await;
        h.controller.handle_connect_failure(&failure(500)).await;

        assert!(h.drain_events().is_empty());
        assert_eq!(h.controller.handle_disconnect(true), ReconnectDecision::AutoReconnect);
    }

    #[tokio::test]
    async fn test_connect_failure_cat_refresh() {
        let refresher = refresher(Refresh::Succeed);
        let mut h = harness_with(FakeStore::default(), Some(refresher.clone()), |b| b);

        h.controller.handle_connect_failure(&failure(413)).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(h.drain_events().is_empty());
        assert!(!h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_connect_failure_cat_without_refresher() {
        let mut h = harness();

        h.controller.handle_connect_failure(&failure(414)).await;

        assert!(matches!(h.drain_events()[..], [Event::CatRefreshError { .. }]));
        assert!(h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_connect_failure_unknown() {
        let mut h = harness();
        let node = failure(409).with_attr("message", "bad ua");

        h.controller.handle_connect_failure(&node).await;

        let events = h.drain_events();
        assert!(matches!(
            events[..],
            [Event::ConnectFailure { reason, ref message, .. }]
                if reason == ConnectFailureReason::BAD_USER_AGENT && message.as_deref() == Some("bad ua")
        ));
        assert_eq!(h.controller.handle_disconnect(true), ReconnectDecision::Suppressed);
    }

    #[tokio::test]
    async fn test_connect_success_adopts_lid() {
        let store = FakeStore {
            primary: Some(Jid::new("15551234", "s.whatsapp.net")),
            ..FakeStore::default()
        };
        let mut h = harness_with(store, None, |b| b);
        let node = Node::new("success").with_attr("lid", "987@lid");

        h.controller.handle_connect_success(&node).await;
        h.controller.wait_until_ready().await;

        assert!(h.controller.state().is_logged_in());
        assert!(h.controller.state().last_successful_connect().is_some());
        assert_eq!(h.store.lid(), Some(Jid::new("987", "lid")));
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.store.mappings.lock().unwrap(),
            vec![(
                Some(Jid::new("987", "lid")),
                Some(Jid::new("15551234", "s.whatsapp.net"))
            )]
        );
        assert!(matches!(h.drain_events()[..], [Event::Connected]));
    }

    #[tokio::test]
    async fn test_connect_success_keeps_matching_lid() {
        let store = FakeStore {
            lid: Mutex::new(Some(Jid::new("987", "lid"))),
            ..FakeStore::default()
        };
        let h = harness_with(store, None, |b| b);

        h.controller
            .handle_connect_success(&Node::new("success").with_attr("lid", "987@lid"))
            .await;

        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.mappings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_success_mismatched_lid_is_cleared_first() {
        let store = FakeStore {
            lid: Mutex::new(Some(Jid::new("111", "lid"))),
            ..FakeStore::default()
        };
        let h = harness_with(store, None, |b| b);

        h.controller
            .handle_connect_success(&Node::new("success").with_attr("lid", "222@lid"))
            .await;

        // The stale value is never kept
        assert_eq!(h.store.lid(), Some(Jid::new("222", "lid")));
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_success_without_lid_still_writes_mapping() {
        let h = harness();

        h.controller.handle_connect_success(&Node::new("success")).await;

        assert!(h.store.lid().is_none());
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
        assert_eq!(*h.store.mappings.lock().unwrap(), vec![(None, None)]);
    }

    #[tokio::test]
    async fn test_connect_success_uploads_prekeys_before_connected() {
        let mut h = harness();
        h.requests.server_count.store(2, Ordering::SeqCst);
        h.store.uploaded.store(2, Ordering::SeqCst);

        h.controller.handle_connect_success(&Node::new("success")).await;

        assert!(matches!(h.events.recv().await, Some(Event::Connected)));
        assert_eq!(h.requests.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(*h.requests.passive.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_connect_success_skips_upload_with_enough_prekeys() {
        let mut h = harness();

        h.controller.handle_connect_success(&Node::new("success")).await;

        assert!(matches!(h.events.recv().await, Some(Event::Connected)));
        assert_eq!(h.requests.uploads.load(Ordering::SeqCst), 0);
        assert!(h.controller.is_ready());
    }

    #[tokio::test]
    async fn test_inline_broadcast_events() {
        let mut h = harness();
        let node = Node::new("ib")
            .with_child(Node::new("downgrade_webclient"))
            .with_child(
                Node::new("offline_preview")
                    .with_attr("count", 12)
                    .with_attr("appdata", 1)
                    .with_attr("message", 8)
                    .with_attr("notification", 2)
                    .with_attr("receipt", 1),
            )
            .with_child(Node::new("offline").with_attr("count", 12))
            .with_child(Node::new("dirty"));

        assert!(h.controller.handle_node(&node).await);

        let events = h.drain_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Event::QrScannedWithoutMultidevice));
        assert!(matches!(
            events[1],
            Event::OfflineSyncPreview { total: 12, app_data_changes: 1, messages: 8, notifications: 2, receipts: 1 }
        ));
        assert!(matches!(events[2], Event::OfflineSyncCompleted { count: 12 }));
    }

    #[tokio::test]
    async fn test_handle_node_ignores_other_tags() {
        let h = harness();
        assert!(!h.controller.handle_node(&Node::new("message")).await);
    }

    #[tokio::test]
    async fn test_connect_phases() {
        let h = harness();

        h.controller.connect().await.unwrap();
        assert_eq!(h.controller.state().phase(), LifecyclePhase::Authenticating);

        h.controller.handle_connect_success(&Node::new("success")).await;
        assert_eq!(h.controller.state().phase(), LifecyclePhase::Connected);

        h.controller.handle_stream_error(&stream_error("503")).await;
        assert_eq!(h.controller.state().phase(), LifecyclePhase::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_resets_phase() {
        let (calls, _rx) = mpsc::unbounded_channel();
        let (dispatcher, _events) = ChannelDispatcher::new();
        let controller = LifecycleController::builder()
            .store(Arc::new(FakeStore::default()))
            .dispatcher(Arc::new(dispatcher))
            .waiters(Arc::new(FakeWaiters::default()))
            .connector(Arc::new(FakeConnector {
                calls,
                fail_connect: true,
            }))
            .requests(Arc::new(FakeRequests::default()))
            .build()
            .unwrap();

        assert!(controller.connect().await.is_err());
        assert_eq!(controller.state().phase(), LifecyclePhase::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_clears_stale_expect_disconnect() {
        let h = harness();
        h.controller.state().expect_disconnect();

        h.controller.connect().await.unwrap();

        assert!(!h.controller.state().is_disconnect_expected());
    }

    #[tokio::test]
    async fn test_expect_disconnect_consumed_once() {
        let h = harness();
        h.controller.handle_stream_error(&stream_conflict("401", "replaced")).await;

        assert_eq!(h.controller.handle_disconnect(true), ReconnectDecision::Suppressed);
        assert_eq!(h.controller.handle_disconnect(true), ReconnectDecision::AutoReconnect);
    }

    #[tokio::test]
    async fn test_local_disconnect_leaves_expect_flag() {
        let h = harness();
        h.controller.handle_stream_error(&stream_conflict("409", "replaced")).await;

        assert_eq!(h.controller.handle_disconnect(false), ReconnectDecision::Suppressed);
        assert!(h.controller.state().is_disconnect_expected());
        assert!(!h.controller.is_ready());
        assert_eq!(h.controller.state().phase(), LifecyclePhase::Disconnected);
    }

    #[tokio::test]
    async fn test_handle_node_uses_parsed_fields() {
        let mut h = harness();

        assert!(h.controller.handle_node(&stream_conflict("401", "device_removed")).await);
        assert!(h
            .controller
            .handle_node(&failure(499).with_attr("message", "try later"))
            .await);

        let events = h.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::LoggedOut { on_connect: false, .. }));
        match &events[1] {
            Event::ConnectFailure { reason, message, .. } => {
                assert_eq!(*reason, ConnectFailureReason(499));
                assert_eq!(message.as_deref(), Some("try later"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(h
            .controller
            .handle_node(&Node::new("success").with_attr("lid", "9@lid"))
            .await);
        assert_eq!(h.store.lid(), Some(Jid::new("9", "lid")));
    }

    #[tokio::test]
    async fn test_reconnect_failures_counted_and_reset() {
        let h = harness();
        assert_eq!(h.controller.record_reconnect_failure(), 1);
        assert_eq!(h.controller.record_reconnect_failure(), 2);

        h.controller.handle_connect_success(&Node::new("success")).await;

        assert_eq!(h.controller.state().auto_reconnect_errors(), 0);
    }

    #[tokio::test]
    async fn test_refresh_blocks_connect() {
        let h = harness_with(FakeStore::default(), Some(refresher(Refresh::Succeed)), |b| b);

        let guard = h.controller.inner.socket_lock.write().await;
        let controller = h.controller.clone();
        let connect = tokio::spawn(async move { controller.connect().await });

        tokio::task::yield_now().await;
        assert!(!connect.is_finished());

        drop(guard);
        assert!(connect.await.unwrap().is_ok());
    }
}
