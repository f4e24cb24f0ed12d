//! The session lifecycle manager.
//!
//! [`SessionManager`] creates sessions, restores them from stored credentials,
//! routes outbound sends and tears sessions down. Each live session has one
//! worker task (see `worker.rs`) that consumes its connection's events in order.

use std::{sync::Arc, time::Duration};

use {
    dashmap::DashMap,
    futures::future::join_all,
    tokio::sync::{mpsc, oneshot},
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tracing::{debug, info, warn},
    uuid::Uuid,
    wagate_config::{SupersedePolicy, WagateConfig},
    wagate_protocol::{
        Address, AddressRules, Credentials, Presence, ProtocolClient, ProtocolError,
        ProtocolEvent,
    },
};

use crate::{
    credentials::{CredentialStore, validate_session_id},
    directory::{NoopDirectory, TenantDirectory},
    error::SessionError,
    model::{
        BulkItemResult, CreatedSession, OutboundText, SentMessage, Session, SessionStatus,
        StatusReport,
    },
    pairing,
    registry::{Resolution, SessionEntry, SessionRegistry},
    stats::{MessageStatsRecorder, NoopStats},
    telemetry,
    webhook::{NoopDispatcher, WebhookDispatcher},
    worker,
};

/// Bounded exponential backoff for reconnecting a dropped session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(60_000),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt number `attempt + 1`, given `attempt` failures so far.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(20);
        self.initial.saturating_mul(1 << exp).min(self.max)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub address_rules: AddressRules,
    /// When set, outbound sends show a typing indicator for this long first.
    pub typing_delay: Option<Duration>,
    pub bulk_delay: Duration,
    /// How long `create_session` waits for a pairing code. `None` waits forever.
    pub pairing_timeout: Option<Duration>,
    pub supersede: SupersedePolicy,
    pub reconnect: ReconnectPolicy,
    /// Webhook target for instances without their own.
    pub default_webhook: Option<String>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            address_rules: AddressRules::default(),
            typing_delay: None,
            bulk_delay: Duration::from_millis(2_000),
            pairing_timeout: Some(Duration::from_secs(120)),
            supersede: SupersedePolicy::Keep,
            reconnect: ReconnectPolicy::default(),
            default_webhook: None,
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &WagateConfig) -> Self {
        let messaging = &config.messaging;
        let sessions = &config.sessions;
        Self {
            address_rules: AddressRules {
                default_country_code: messaging.default_country_code.clone(),
                suffix: messaging.address_suffix.clone(),
            },
            typing_delay: messaging
                .typing_indicator
                .then(|| Duration::from_millis(messaging.typing_delay_ms)),
            bulk_delay: Duration::from_millis(messaging.bulk_delay_ms),
            pairing_timeout: sessions.pairing_timeout_secs.map(Duration::from_secs),
            supersede: sessions.supersede,
            reconnect: ReconnectPolicy {
                max_attempts: sessions.reconnect.max_attempts,
                initial: Duration::from_millis(sessions.reconnect.initial_backoff_ms),
                max: Duration::from_millis(sessions.reconnect.max_backoff_ms),
            },
            default_webhook: config.webhook.default_url.clone(),
        }
    }
}

/// Outcome of restoring every stored session at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<String>,
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Caller asked for it.
    Explicit,
    /// A newer session replaced it under `close_previous`.
    Superseded,
    /// The network logged the device out or rejected its credentials.
    LoggedOut,
    /// Pairing never completed.
    Abandoned,
    /// Reconnect attempts ran out. Credentials stay for a later restore.
    Exhausted,
    Shutdown,
}

impl Teardown {
    fn deletes_credentials(self) -> bool {
        !matches!(self, Self::Exhausted | Self::Shutdown)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Superseded => "superseded",
            Self::LoggedOut => "logged_out",
            Self::Abandoned => "abandoned",
            Self::Exhausted => "exhausted",
            Self::Shutdown => "shutdown",
        }
    }
}

pub(crate) struct Inner {
    pub(crate) client: Arc<dyn ProtocolClient>,
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) directory: Arc<dyn TenantDirectory>,
    pub(crate) stats: Arc<dyn MessageStatsRecorder>,
    pub(crate) webhooks: Arc<dyn WebhookDispatcher>,
    pub(crate) registry: SessionRegistry,
    /// Instance key → most recent session created for it.
    instance_sessions: DashMap<String, String>,
    pub(crate) options: ManagerOptions,
    pub(crate) tracker: TaskTracker,
    closing: CancellationToken,
}

pub struct SessionManagerBuilder {
    client: Arc<dyn ProtocolClient>,
    store: Arc<dyn CredentialStore>,
    directory: Arc<dyn TenantDirectory>,
    stats: Arc<dyn MessageStatsRecorder>,
    webhooks: Arc<dyn WebhookDispatcher>,
    options: ManagerOptions,
}

impl SessionManagerBuilder {
    pub fn directory(mut self, directory: Arc<dyn TenantDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn stats(mut self, stats: Arc<dyn MessageStatsRecorder>) -> Self {
        self.stats = stats;
        self
    }

    pub fn webhooks(mut self, webhooks: Arc<dyn WebhookDispatcher>) -> Self {
        self.webhooks = webhooks;
        self
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> SessionManager {
        SessionManager {
            inner: Arc::new(Inner {
                client: self.client,
                store: self.store,
                directory: self.directory,
                stats: self.stats,
                webhooks: self.webhooks,
                registry: SessionRegistry::new(),
                instance_sessions: DashMap::new(),
                options: self.options,
                tracker: TaskTracker::new(),
                closing: CancellationToken::new(),
            }),
        }
    }
}

/// Owns every live session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Start building a manager. Directory, stats and webhooks default to no-ops.
    pub fn builder(
        client: Arc<dyn ProtocolClient>,
        store: Arc<dyn CredentialStore>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            client,
            store,
            directory: Arc::new(NoopDirectory),
            stats: Arc::new(NoopStats),
            webhooks: Arc::new(NoopDispatcher),
            options: ManagerOptions::default(),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Start a new session for `owner_id`'s instance and wait until it either
    /// issues a pairing code or connects, whichever comes first.
    pub async fn create_session(
        &self,
        owner_id: &str,
        instance_key: &str,
    ) -> Result<CreatedSession, SessionError> {
        let inner = &self.inner;
        if inner.closing.is_cancelled() {
            return Err(SessionError::CreationFailure("manager is shutting down".into()));
        }

        let binding = inner
            .directory
            .binding_for_instance(instance_key)
            .await
            .map_err(SessionError::Directory)?;
        if let Some(b) = &binding
            && b.owner_id != owner_id
        {
            warn!(owner_id, instance_key, "instance belongs to another owner");
            return Err(SessionError::OwnerMismatch {
                instance_key: instance_key.to_string(),
                owner_id: owner_id.to_string(),
            });
        }
        let webhook_target = binding
            .as_ref()
            .and_then(|b| b.webhook_url.clone())
            .or_else(|| inner.options.default_webhook.clone());

        if inner.options.supersede == SupersedePolicy::ClosePrevious
            && let Some(previous) = binding.as_ref().and_then(|b| b.session_id.as_deref())
        {
            info!(session_id = %previous, owner_id, "closing superseded session");
            inner.close_session(previous, Teardown::Superseded).await?;
        }

        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(SessionEntry::new(
            session_id.clone(),
            Some(owner_id.to_string()),
            Some(instance_key.to_string()),
            webhook_target,
            Some(tx),
        ));

        {
            let _guard = inner.registry.lock(&session_id).await;
            match inner
                .directory
                .bind_session(owner_id, instance_key, &session_id)
                .await
            {
                Ok(true) => {},
                Ok(false) => {
                    warn!(session_id = %session_id, owner_id, instance_key, "no instance record to bind session to")
                },
                Err(e) => warn!(session_id = %session_id, error = %e, "failed to bind session"),
            }

            inner.registry.insert(Arc::clone(&entry));
            let conn = match inner.client.connect(&session_id, Credentials::default()).await {
                Ok(conn) => conn,
                Err(e) => {
                    inner.registry.remove_entry(&entry);
                    entry.cancel();
                    if let Err(err) = inner.store.delete(&session_id).await {
                        warn!(session_id = %session_id, error = %err, "failed to clean up credentials");
                    }
                    warn!(session_id = %session_id, error = %e, "session creation failed");
                    return Err(SessionError::CreationFailure(e.to_string()));
                },
            };
            entry.install_handle(conn.handle);
            inner.spawn_worker(Arc::clone(&entry), conn.events);
            inner
                .instance_sessions
                .insert(instance_key.to_string(), session_id.clone());
        }
        inner.registry.release_lock(&session_id);

        telemetry::session_created();
        telemetry::active_sessions(inner.registry.len());
        info!(session_id = %session_id, owner_id, instance_key, "session created");

        let resolution = match inner.options.pairing_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(res) => res,
                Err(_) => {
                    inner.expire(&entry, Teardown::Abandoned).await;
                    return Err(SessionError::CreationFailure(format!(
                        "no pairing code within {}s",
                        limit.as_secs()
                    )));
                },
            },
            None => rx.await,
        };

        match resolution {
            Ok(Resolution::PairingCode(code)) => {
                let qr_code = pairing::qr_data_url(&code)
                    .inspect_err(|e| warn!(session_id = %session_id, error = %e, "failed to render QR code"))
                    .ok();
                Ok(CreatedSession {
                    session_id,
                    status: entry.status(),
                    pairing_code: Some(code),
                    qr_code,
                })
            },
            Ok(Resolution::Connected) => Ok(CreatedSession {
                session_id,
                status: SessionStatus::Connected,
                pairing_code: None,
                qr_code: None,
            }),
            Err(_) => Err(SessionError::CreationFailure(format!(
                "session {session_id} closed before pairing"
            ))),
        }
    }

    /// Current status of a session, restoring it from stored credentials if it
    /// isn't registered yet.
    pub async fn get_status(&self, session_id: &str) -> Result<StatusReport, SessionError> {
        validate_session_id(session_id)?;
        let entry = match self.inner.registry.get(session_id) {
            Some(entry) => entry,
            None => self.inner.restore(session_id).await?,
        };
        entry.touch();
        let snapshot = entry.snapshot();
        Ok(StatusReport {
            session_id: snapshot.id,
            status: snapshot.status,
            pairing_code: snapshot.pairing_code,
        })
    }

    /// Restore every session with stored credentials. One failure never stops
    /// the rest.
    pub async fn restore_all(&self) -> Result<RestoreReport, SessionError> {
        let ids = self.inner.store.list().await?;
        let pending: Vec<String> = ids
            .into_iter()
            .filter(|id| !self.inner.registry.contains(id))
            .collect();

        let results = join_all(pending.iter().map(|id| self.inner.restore(id))).await;

        let mut report = RestoreReport::default();
        for (id, result) in pending.into_iter().zip(results) {
            match result {
                Ok(_) => report.restored.push(id),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "skipping session that failed to restore");
                    report.failed.push(id);
                },
            }
        }
        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "session restore complete"
        );
        Ok(report)
    }

    /// Send one text message on a connected session.
    pub async fn send_message(
        &self,
        session_id: &str,
        to: &str,
        text: &str,
    ) -> Result<SentMessage, SessionError> {
        let inner = &self.inner;
        let entry = inner
            .registry
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let not_connected = |status| SessionError::NotConnected {
            id: session_id.to_string(),
            status,
        };
        let status = entry.status();
        if status != SessionStatus::Connected {
            return Err(not_connected(status));
        }
        let handle = entry.handle().ok_or_else(|| not_connected(entry.status()))?;
        let to = Address::parse(to, &inner.options.address_rules)?;

        if let Some(delay) = inner.options.typing_delay {
            if let Err(e) = handle.send_presence(&to, Presence::Composing).await {
                debug!(session_id, error = %e, "failed to send typing indicator");
            }
            tokio::time::sleep(delay).await;
        }

        let message_id = handle.send_text(&to, text).await?;

        if inner.options.typing_delay.is_some()
            && let Err(e) = handle.send_presence(&to, Presence::Paused).await
        {
            debug!(session_id, error = %e, "failed to clear typing indicator");
        }

        entry.touch();
        telemetry::message_sent();
        if let (Some(owner), Some(instance)) = (&entry.owner_id, &entry.instance_key)
            && let Err(e) = inner.stats.record_sent(owner, instance).await
        {
            warn!(session_id, error = %e, "failed to record sent message");
        }
        debug!(session_id, to = %to, message_id = %message_id, "message sent");

        Ok(SentMessage {
            message_id,
            to: to.to_string(),
        })
    }

    /// Send several messages in order, pausing between them. Individual
    /// failures are reported per item and never abort the batch.
    pub async fn send_bulk(
        &self,
        session_id: &str,
        messages: Vec<OutboundText>,
    ) -> Result<Vec<BulkItemResult>, SessionError> {
        if !self.inner.registry.contains(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let mut results = Vec::with_capacity(messages.len());
        for (i, item) in messages.into_iter().enumerate() {
            if i > 0 && !self.inner.options.bulk_delay.is_zero() {
                tokio::time::sleep(self.inner.options.bulk_delay).await;
            }
            let result = match self.send_message(session_id, &item.to, &item.message).await {
                Ok(sent) => BulkItemResult {
                    to: item.to,
                    success: true,
                    message_id: Some(sent.message_id),
                    error: None,
                },
                Err(e) => BulkItemResult {
                    to: item.to,
                    success: false,
                    message_id: None,
                    error: Some(e.to_string()),
                },
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Tear down the session serving `instance_key` and delete its credentials.
    ///
    /// Returns whether anything was torn down; repeating the call is a no-op.
    pub async fn disconnect_session(&self, instance_key: &str) -> Result<bool, SessionError> {
        let inner = &self.inner;
        let binding = inner
            .directory
            .binding_for_instance(instance_key)
            .await
            .map_err(SessionError::Directory)?;

        // Instances without a directory record fall back to the last session
        // created for them, which outlives its teardown.
        let session_id = match binding {
            Some(binding) => binding.session_id,
            None => Some(
                inner
                    .instance_sessions
                    .get(instance_key)
                    .map(|id| id.value().clone())
                    .ok_or_else(|| SessionError::NotFound(instance_key.to_string()))?,
            ),
        };
        let Some(session_id) = session_id else {
            return Ok(false);
        };

        inner.close_session(&session_id, Teardown::Explicit).await
    }

    /// Snapshot of every registered session, oldest first.
    pub fn list(&self) -> Vec<Session> {
        self.inner.registry.all()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Stop every session without deleting credentials, then wait for all
    /// session tasks to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closing.cancel();
        let entries = inner.registry.entries();
        info!(sessions = entries.len(), "shutting down sessions");
        join_all(
            entries
                .iter()
                .map(|entry| inner.expire(entry, Teardown::Shutdown)),
        )
        .await;
        inner.tracker.close();
        inner.tracker.wait().await;
        debug!("session manager drained");
    }
}

impl Inner {
    pub(crate) fn spawn_worker(
        self: &Arc<Self>,
        entry: Arc<SessionEntry>,
        events: mpsc::UnboundedReceiver<ProtocolEvent>,
    ) {
        self.tracker
            .spawn(worker::run(Arc::clone(self), entry, events));
    }

    /// Register a session from stored credentials and connect it.
    async fn restore(self: &Arc<Self>, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        let result = self.restore_locked(session_id).await;
        self.registry.release_lock(session_id);
        result
    }

    async fn restore_locked(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<Arc<SessionEntry>, SessionError> {
        let _guard = self.registry.lock(session_id).await;
        if let Some(entry) = self.registry.get(session_id) {
            return Ok(entry);
        }
        if self.closing.is_cancelled() {
            return Err(SessionError::RestoreFailed {
                id: session_id.to_string(),
                reason: "manager is shutting down".into(),
            });
        }

        let credentials = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if credentials.is_empty() {
            info!(session_id, "discarding never-paired credentials");
            self.store.delete(session_id).await?;
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let binding = self
            .directory
            .binding_for_session(session_id)
            .await
            .inspect_err(|e| warn!(session_id, error = %e, "tenant lookup failed during restore"))
            .ok()
            .flatten();
        let webhook_target = binding
            .as_ref()
            .and_then(|b| b.webhook_url.clone())
            .or_else(|| self.options.default_webhook.clone());
        let entry = Arc::new(SessionEntry::new(
            session_id.to_string(),
            binding.as_ref().map(|b| b.owner_id.clone()),
            binding.map(|b| b.instance_key),
            webhook_target,
            None,
        ));

        self.registry.insert(Arc::clone(&entry));
        match self.client.connect(session_id, credentials).await {
            Ok(conn) => {
                entry.install_handle(conn.handle);
                self.spawn_worker(Arc::clone(&entry), conn.events);
                telemetry::active_sessions(self.registry.len());
                info!(session_id, "session restored");
                Ok(entry)
            },
            Err(e) => {
                self.registry.remove_entry(&entry);
                entry.cancel();
                if matches!(e, ProtocolError::InvalidCredentials) {
                    self.store.delete(session_id).await?;
                }
                Err(SessionError::RestoreFailed {
                    id: session_id.to_string(),
                    reason: e.to_string(),
                })
            },
        }
    }

    /// Tear down whatever is registered under `session_id`, and for reasons
    /// that call for it, delete credentials even if nothing was registered.
    pub(crate) async fn close_session(
        &self,
        session_id: &str,
        reason: Teardown,
    ) -> Result<bool, SessionError> {
        validate_session_id(session_id)?;
        let result = self.close_session_locked(session_id, reason).await;
        self.registry.release_lock(session_id);
        result
    }

    async fn close_session_locked(
        &self,
        session_id: &str,
        reason: Teardown,
    ) -> Result<bool, SessionError> {
        let _guard = self.registry.lock(session_id).await;
        let torn_down = match self.registry.get(session_id) {
            Some(entry) => self.teardown_locked(&entry, reason).await,
            None => false,
        };
        if torn_down || !reason.deletes_credentials() {
            return Ok(torn_down);
        }
        let stored = self.store.load(session_id).await?.is_some();
        if stored {
            self.store.delete(session_id).await?;
            info!(session_id, reason = reason.as_str(), "deleted credentials of inactive session");
        }
        Ok(stored)
    }

    /// Tear down `entry` if it is still registered.
    pub(crate) async fn expire(&self, entry: &Arc<SessionEntry>, reason: Teardown) -> bool {
        let torn_down = {
            let _guard = self.registry.lock(&entry.id).await;
            self.teardown_locked(entry, reason).await
        };
        self.registry.release_lock(&entry.id);
        torn_down
    }

    /// Caller holds the session's registry lock.
    async fn teardown_locked(&self, entry: &Arc<SessionEntry>, reason: Teardown) -> bool {
        if !self.registry.remove_entry(entry) {
            return false;
        }
        entry.cancel();
        entry.abandon_waiter();
        entry.set_status(SessionStatus::Expired);
        entry.close_handle().await;

        if reason.deletes_credentials()
            && let Err(e) = self.store.delete(&entry.id).await
        {
            warn!(session_id = %entry.id, error = %e, "failed to delete credentials");
        }
        if let Err(e) = self.directory.set_connected(&entry.id, false).await {
            warn!(session_id = %entry.id, error = %e, "failed to update instance state");
        }

        telemetry::session_expired(reason.as_str());
        telemetry::active_sessions(self.registry.len());
        info!(session_id = %entry.id, reason = reason.as_str(), "session expired");
        true
    }
}
