//! Ownership and health of all upstream sessions.
//!
//! The [`ConnectionManager`] owns the map of upstream id → session
//! state. All mutations funnel through a single writer task; readers
//! get lock-free snapshots of the published map. Connect attempts run
//! in parallel under a fan-out cap, a failing upstream never takes the
//! gateway down, and a periodic health pass probes connected sessions
//! and reconnects broken ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use mcplex::facilitator::BoxFuture;
use mcplex::policy::{PaymentMode, UpstreamPaymentPolicy};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::session::{Capabilities, McpSession, RmcpSession, UpstreamError};
use crate::transport::{TransportDescriptor, TransportFactory, ValidationIssue};

/// Pattern a namespace must match.
static NAMESPACE_PATTERN: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new("^[A-Za-z][A-Za-z0-9_-]*$").expect("static pattern compiles")
});

/// Returns whether `namespace` is a legal namespace label.
#[must_use]
pub fn is_valid_namespace(namespace: &str) -> bool {
    NAMESPACE_PATTERN.is_match(namespace)
}

/// Immutable configuration of one upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSpec {
    /// Unique id across the gateway.
    pub id: String,
    /// Optional namespace prefixed onto exposed capability names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Disabled upstreams are kept in configuration but never connected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How to reach the upstream.
    pub transport: TransportDescriptor,
    /// Time allowed for the connect, including the MCP handshake.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total connect attempts per pass (minimum one).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Pause between attempts (linear, not exponential).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Payment policy for calls dispatched to this upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<UpstreamPaymentPolicy>,
}

fn default_enabled() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl UpstreamSpec {
    /// Per-field validation, run before any connect is attempted.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.id.trim().is_empty() {
            issues.push(ValidationIssue {
                field: "id".to_owned(),
                message: "must not be empty".to_owned(),
            });
        }
        if let Some(namespace) = &self.namespace
            && !is_valid_namespace(namespace)
        {
            issues.push(ValidationIssue {
                field: "namespace".to_owned(),
                message: format!(
                    "{namespace:?} must match [A-Za-z][A-Za-z0-9_-]*"
                ),
            });
        }
        for issue in self.transport.validate() {
            issues.push(ValidationIssue {
                field: format!("transport.{}", issue.field),
                message: issue.message,
            });
        }
        issues
    }

    /// The connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The retry pause as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Lifecycle state of one upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// A connect attempt is in flight.
    Connecting,
    /// The session is live and usable.
    Connected,
    /// The session dropped; the health loop will try to reconnect.
    Disconnected,
    /// Connecting failed terminally (until the next health pass).
    Error,
}

/// Published, immutable record of one upstream's runtime state.
///
/// Records are replaced wholesale by the writer task; holders of an old
/// record simply see stale data, never torn data.
pub struct UpstreamState {
    /// The configuration this session was built from.
    pub spec: Arc<UpstreamSpec>,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Failure message backing an `Error`/`Disconnected` status.
    pub last_error: Option<String>,
    /// When the health loop last examined this session.
    pub last_health_check_at: Option<SystemTime>,
    /// Capability families discovered at connect time.
    pub capabilities: Capabilities,
    /// The live session; `Some` exactly when `status == Connected`.
    pub session: Option<Arc<dyn McpSession>>,
}

impl std::fmt::Debug for UpstreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamState")
            .field("id", &self.spec.id)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl UpstreamState {
    fn connecting(spec: Arc<UpstreamSpec>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            status: SessionStatus::Connecting,
            last_error: None,
            last_health_check_at: None,
            capabilities: Capabilities::default(),
            session: None,
        })
    }

    fn connected(&self, session: Arc<dyn McpSession>, capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            spec: Arc::clone(&self.spec),
            status: SessionStatus::Connected,
            last_error: None,
            last_health_check_at: self.last_health_check_at,
            capabilities,
            session: Some(session),
        })
    }

    fn errored(&self, message: String) -> Arc<Self> {
        Arc::new(Self {
            spec: Arc::clone(&self.spec),
            status: SessionStatus::Error,
            last_error: Some(message),
            last_health_check_at: self.last_health_check_at,
            capabilities: Capabilities::default(),
            session: None,
        })
    }

    fn disconnected(&self, message: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            spec: Arc::clone(&self.spec),
            status: SessionStatus::Disconnected,
            last_error: message.or_else(|| self.last_error.clone()),
            last_health_check_at: self.last_health_check_at,
            capabilities: Capabilities::default(),
            session: None,
        })
    }

    fn health_checked(&self, at: SystemTime) -> Arc<Self> {
        Arc::new(Self {
            spec: Arc::clone(&self.spec),
            status: self.status,
            last_error: self.last_error.clone(),
            last_health_check_at: Some(at),
            capabilities: self.capabilities,
            session: self.session.clone(),
        })
    }
}

/// Read-only view of a connected upstream, handed to the registry and
/// the dispatch path.
///
/// Views are snapshots; callers must not retain them across a
/// subsequent `close_all`.
#[derive(Clone)]
pub struct ConnectedUpstream {
    /// The upstream's configuration.
    pub spec: Arc<UpstreamSpec>,
    /// Capability families discovered at connect time.
    pub capabilities: Capabilities,
    /// The live session.
    pub session: Arc<dyn McpSession>,
}

impl std::fmt::Debug for ConnectedUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedUpstream")
            .field("id", &self.spec.id)
            .finish_non_exhaustive()
    }
}

impl ConnectedUpstream {
    /// The upstream id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// The configured namespace, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.spec.namespace.as_deref()
    }
}

/// Status summary of one configured upstream, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    /// The upstream id.
    pub id: String,
    /// Whether the upstream is enabled at all.
    pub enabled: bool,
    /// Lifecycle state; absent for disabled upstreams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    /// Failure message backing an error state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Establishes sessions from specs; the seam that lets tests drive the
/// manager without real transports.
pub trait Connector: Send + Sync {
    /// Connects one upstream and discovers its capabilities.
    fn connect(
        &self,
        spec: Arc<UpstreamSpec>,
    ) -> BoxFuture<'_, Result<(Arc<dyn McpSession>, Capabilities), UpstreamError>>;
}

/// Production connector backed by the [`TransportFactory`].
#[derive(Debug, Clone, Default)]
pub struct TransportConnector {
    factory: TransportFactory,
}

impl TransportConnector {
    /// Creates a connector around the given factory.
    #[must_use]
    pub fn new(factory: TransportFactory) -> Self {
        Self { factory }
    }
}

impl Connector for TransportConnector {
    fn connect(
        &self,
        spec: Arc<UpstreamSpec>,
    ) -> BoxFuture<'_, Result<(Arc<dyn McpSession>, Capabilities), UpstreamError>> {
        Box::pin(async move {
            if let Some(payment) = &spec.payment
                && matches!(payment.mode, PaymentMode::Markup | PaymentMode::Absorb)
                && !matches!(spec.transport, TransportDescriptor::Http { .. })
            {
                tracing::warn!(
                    id = %spec.id,
                    transport = spec.transport.kind(),
                    "gateway-paid mode configured on a transport without a paying fetcher"
                );
            }
            let service = self
                .factory
                .make(&spec.transport, spec.connect_timeout())
                .await
                .map_err(|err| {
                    if err.is_transient() {
                        UpstreamError::transient(err.to_string())
                    } else {
                        UpstreamError::fatal(err.to_string())
                    }
                })?;
            let session = Arc::new(RmcpSession::new(service));
            let capabilities = session.discover_capabilities().await;
            Ok((session as Arc<dyn McpSession>, capabilities))
        })
    }
}

/// Tunables for the connection manager.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Fan-out cap for parallel connects and probes.
    pub max_concurrent_connections: usize,
    /// Period of the health loop.
    pub health_check_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// Events emitted after manager passes, consumed by the registry
/// refresh machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// All initial connect attempts have resolved.
    Initialized,
    /// A health pass completed.
    HealthCheckCompleted,
}

type SessionMap = HashMap<String, Arc<UpstreamState>>;
type Mutation = Box<dyn FnOnce(&mut SessionMap) + Send>;

struct WriterCommand {
    mutation: Mutation,
    ack: oneshot::Sender<()>,
}

/// Owns all upstream sessions and drives their lifecycle.
///
/// The manager is a cheap handle: clones share the same writer task,
/// published map, and event channel.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ManagerSettings,
    published: Arc<ArcSwap<SessionMap>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    events_tx: broadcast::Sender<ManagerEvent>,
    specs: Arc<std::sync::Mutex<Vec<Arc<UpstreamSpec>>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager and spawns its writer task.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, settings: ManagerSettings) -> Self {
        let published: Arc<ArcSwap<SessionMap>> = Arc::new(ArcSwap::from_pointee(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(64);
        let (events_tx, _) = broadcast::channel(16);

        // The single writer: the only code that ever mutates the map.
        let writer_published = Arc::clone(&published);
        tokio::spawn(async move {
            let mut map: SessionMap = HashMap::new();
            while let Some(command) = writer_rx.recv().await {
                (command.mutation)(&mut map);
                writer_published.store(Arc::new(map.clone()));
                let _ = command.ack.send(());
            }
        });

        Self {
            connector,
            settings,
            published,
            writer_tx,
            events_tx,
            specs: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Applies one mutation through the writer task and waits for it to
    /// be published.
    async fn apply<F>(&self, mutation: F)
    where
        F: FnOnce(&mut SessionMap) + Send + 'static,
    {
        let (ack, done) = oneshot::channel();
        if self
            .writer_tx
            .send(WriterCommand {
                mutation: Box::new(mutation),
                ack,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = done.await;
    }

    /// Subscribes to manager events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Connects every enabled, valid upstream. Individual failures are
    /// logged and parked in `Error`; the gateway continues regardless —
    /// even with zero successful connects.
    pub async fn initialize(&self, specs: Vec<UpstreamSpec>) {
        let mut tasks = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_connections.max(1)));
        let mut kept = Vec::new();

        for spec in specs {
            let issues = spec.validate();
            if !issues.is_empty() {
                let joined = issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                tracing::error!(id = %spec.id, issues = %joined, "skipping invalid upstream");
                continue;
            }
            let spec = Arc::new(spec);
            kept.push(Arc::clone(&spec));
            if !spec.enabled {
                tracing::debug!(id = %spec.id, "upstream disabled, not connecting");
                continue;
            }

            self.apply({
                let spec = Arc::clone(&spec);
                move |map| {
                    map.insert(spec.id.clone(), UpstreamState::connecting(spec));
                }
            })
            .await;

            let manager = self.clone();
            let permit_pool = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = permit_pool.acquire().await;
                manager.connect_with_retries(&spec).await;
            }));
        }

        *self.specs.lock().expect("specs lock poisoned") = kept;
        join_all(tasks).await;
        self.emit(ManagerEvent::Initialized);
    }

    /// Runs a full connect attempt sequence for one upstream and
    /// records the outcome.
    async fn connect_with_retries(&self, spec: &Arc<UpstreamSpec>) {
        let attempts = spec.retry_attempts.max(1);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.connector.connect(Arc::clone(spec)).await {
                Ok(connected) => break Ok(connected),
                Err(err) if err.transient && attempt < attempts => {
                    tracing::warn!(
                        id = %spec.id,
                        attempt,
                        error = %err,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(spec.retry_delay()).await;
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok((session, capabilities)) => {
                tracing::info!(
                    id = %spec.id,
                    tools = capabilities.has_tools,
                    resources = capabilities.has_resources,
                    prompts = capabilities.has_prompts,
                    "upstream connected"
                );
                let id = spec.id.clone();
                self.apply(move |map| {
                    if let Some(state) = map.get(&id) {
                        map.insert(id.clone(), state.connected(session, capabilities));
                    }
                })
                .await;
            }
            Err(err) => {
                tracing::error!(id = %spec.id, error = %err, "upstream failed to connect");
                let id = spec.id.clone();
                let message = err.message;
                self.apply(move |map| {
                    if let Some(state) = map.get(&id) {
                        map.insert(id.clone(), state.errored(message));
                    }
                })
                .await;
            }
        }
    }

    /// One health pass: probe connected sessions, reconnect broken
    /// ones, stamp `last_health_check_at`, emit an event.
    pub async fn health_check(&self) {
        let snapshot = self.published.load_full();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_connections.max(1)));
        let now = SystemTime::now();
        let mut tasks = Vec::new();

        for state in snapshot.values() {
            let manager = self.clone();
            let permit_pool = Arc::clone(&semaphore);
            let state = Arc::clone(state);
            tasks.push(tokio::spawn(async move {
                let _permit = permit_pool.acquire().await;
                manager.health_check_one(&state, now).await;
            }));
        }
        join_all(tasks).await;
        self.emit(ManagerEvent::HealthCheckCompleted);
    }

    async fn health_check_one(&self, state: &Arc<UpstreamState>, now: SystemTime) {
        let id = state.spec.id.clone();
        match state.status {
            SessionStatus::Connected => {
                let probe = match &state.session {
                    Some(session) => session.probe().await,
                    // Connected without a session would violate the state
                    // invariant; treat it as a broken session.
                    None => Err(UpstreamError::fatal("connected state lost its session")),
                };
                match probe {
                    Ok(()) => {
                        self.apply(move |map| {
                            if let Some(current) = map.get(&id) {
                                map.insert(id.clone(), current.health_checked(now));
                            }
                        })
                        .await;
                    }
                    Err(err) => {
                        tracing::warn!(id = %state.spec.id, error = %err, "health probe failed");
                        if let Some(session) = &state.session
                            && let Err(close_err) = session.close().await
                        {
                            tracing::debug!(id = %state.spec.id, error = %close_err, "close after failed probe");
                        }
                        let message = err.message;
                        self.apply(move |map| {
                            if let Some(current) = map.get(&id) {
                                map.insert(
                                    id.clone(),
                                    current.disconnected(Some(message)).health_checked(now),
                                );
                            }
                        })
                        .await;
                    }
                }
            }
            SessionStatus::Disconnected | SessionStatus::Error => {
                self.connect_with_retries(&state.spec).await;
                self.apply(move |map| {
                    if let Some(current) = map.get(&id) {
                        map.insert(id.clone(), current.health_checked(now));
                    }
                })
                .await;
            }
            SessionStatus::Connecting => {}
        }
    }

    /// Spawns the periodic health loop; cancel the token to stop it.
    pub fn start_health_loop(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.health_check_interval);
            // The immediate first tick would duplicate initialize().
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.health_check().await,
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Best-effort parallel close of every session. Errors are logged,
    /// never propagated, and no session references survive the call.
    pub async fn close_all(&self) {
        let snapshot = self.published.load_full();
        let closes = snapshot.values().filter_map(|state| {
            let session = state.session.clone()?;
            let id = state.spec.id.clone();
            Some(async move {
                if let Err(err) = session.close().await {
                    tracing::warn!(id = %id, error = %err, "error closing session");
                }
            })
        });
        join_all(closes).await;
        self.apply(HashMap::clear).await;
    }

    /// Snapshot of sessions currently in `Connected` state.
    #[must_use]
    pub fn get_connected(&self) -> Vec<ConnectedUpstream> {
        let snapshot = self.published.load_full();
        let mut connected: Vec<ConnectedUpstream> = snapshot
            .values()
            .filter(|state| state.status == SessionStatus::Connected)
            .filter_map(|state| {
                Some(ConnectedUpstream {
                    spec: Arc::clone(&state.spec),
                    capabilities: state.capabilities,
                    session: state.session.clone()?,
                })
            })
            .collect();
        // Stable order: config order as recorded at initialize time.
        let specs = self.specs.lock().expect("specs lock poisoned").clone();
        let order: HashMap<&str, usize> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| (spec.id.as_str(), index))
            .collect();
        connected.sort_by_key(|upstream| order.get(upstream.id()).copied().unwrap_or(usize::MAX));
        connected
    }

    /// Looks up a single connected upstream by id.
    #[must_use]
    pub fn get_session(&self, id: &str) -> Option<ConnectedUpstream> {
        let snapshot = self.published.load_full();
        let state = snapshot.get(id)?;
        if state.status != SessionStatus::Connected {
            return None;
        }
        Some(ConnectedUpstream {
            spec: Arc::clone(&state.spec),
            capabilities: state.capabilities,
            session: state.session.clone()?,
        })
    }

    /// Status summaries for every configured upstream, disabled ones
    /// included.
    #[must_use]
    pub fn statuses(&self) -> Vec<UpstreamStatus> {
        let snapshot = self.published.load_full();
        let specs = self.specs.lock().expect("specs lock poisoned").clone();
        specs
            .iter()
            .map(|spec| {
                let state = snapshot.get(&spec.id);
                UpstreamStatus {
                    id: spec.id.clone(),
                    enabled: spec.enabled,
                    status: state.map(|s| s.status),
                    last_error: state.and_then(|s| s.last_error.clone()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::model::{PromptDef, ResourceDef, ToolDef};
    use crate::session::{PromptGet, ResourceRead, ToolCall};

    /// Session stub whose probe outcome is switchable.
    struct FakeSession {
        probe_ok: AtomicBool,
        closed: AtomicBool,
    }

    impl FakeSession {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                probe_ok: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl McpSession for FakeSession {
        fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDef>, UpstreamError>> {
            Box::pin(async { Ok(vec![]) })
        }
        fn list_resources(&self) -> BoxFuture<'_, Result<Vec<ResourceDef>, UpstreamError>> {
            Box::pin(async { Ok(vec![]) })
        }
        fn list_prompts(&self) -> BoxFuture<'_, Result<Vec<PromptDef>, UpstreamError>> {
            Box::pin(async { Ok(vec![]) })
        }
        fn call_tool(
            &self,
            _call: ToolCall,
        ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>> {
            Box::pin(async { Ok(serde_json::json!({})) })
        }
        fn read_resource(
            &self,
            _read: ResourceRead,
        ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>> {
            Box::pin(async { Ok(serde_json::json!({})) })
        }
        fn get_prompt(
            &self,
            _get: PromptGet,
        ) -> BoxFuture<'_, Result<serde_json::Value, UpstreamError>> {
            Box::pin(async { Ok(serde_json::json!({})) })
        }
        fn probe(&self) -> BoxFuture<'_, Result<(), UpstreamError>> {
            let ok = self.probe_ok.load(Ordering::SeqCst);
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(UpstreamError::transient("probe failed"))
                }
            })
        }
        fn close(&self) -> BoxFuture<'_, Result<(), UpstreamError>> {
            self.closed.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    /// Connector with a scripted outcome queue per upstream id.
    #[derive(Default)]
    struct FakeConnector {
        scripts: Mutex<HashMap<String, VecDeque<Result<Arc<FakeSession>, UpstreamError>>>>,
        attempts: AtomicUsize,
    }

    impl FakeConnector {
        fn script(&self, id: &str, outcomes: Vec<Result<Arc<FakeSession>, UpstreamError>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(id.to_owned(), outcomes.into());
        }
    }

    impl Connector for FakeConnector {
        fn connect(
            &self,
            spec: Arc<UpstreamSpec>,
        ) -> BoxFuture<'_, Result<(Arc<dyn McpSession>, Capabilities), UpstreamError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&spec.id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(FakeSession::healthy()));
            Box::pin(async move {
                outcome.map(|session| {
                    (
                        session as Arc<dyn McpSession>,
                        Capabilities {
                            has_tools: true,
                            has_resources: false,
                            has_prompts: false,
                        },
                    )
                })
            })
        }
    }

    fn spec(id: &str) -> UpstreamSpec {
        UpstreamSpec {
            id: id.to_owned(),
            namespace: None,
            enabled: true,
            transport: TransportDescriptor::Stdio {
                command: "echo".to_owned(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            connect_timeout_ms: 1_000,
            retry_attempts: 3,
            retry_delay_ms: 1,
            payment: None,
        }
    }

    fn manager_with(connector: Arc<FakeConnector>) -> ConnectionManager {
        ConnectionManager::new(connector, ManagerSettings::default())
    }

    #[tokio::test]
    async fn initialize_connects_enabled_upstreams() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager_with(Arc::clone(&connector));

        let mut disabled = spec("off");
        disabled.enabled = false;
        manager
            .initialize(vec![spec("a"), spec("b"), disabled])
            .await;

        let connected = manager.get_connected();
        let ids: Vec<&str> = connected.iter().map(ConnectedUpstream::id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(manager.get_session("off").is_none());
    }

    #[tokio::test]
    async fn invalid_specs_are_skipped_not_fatal() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager_with(Arc::clone(&connector));

        let mut bad = spec("bad");
        bad.namespace = Some("9starts-with-digit".to_owned());
        manager.initialize(vec![bad, spec("good")]).await;

        assert!(manager.get_session("bad").is_none());
        assert!(manager.get_session("good").is_some());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_linearly() {
        let connector = Arc::new(FakeConnector::default());
        connector.script(
            "a",
            vec![
                Err(UpstreamError::transient("refused")),
                Ok(FakeSession::healthy()),
            ],
        );
        let manager = manager_with(Arc::clone(&connector));
        manager.initialize(vec![spec("a")]).await;

        assert!(manager.get_session("a").is_some());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let connector = Arc::new(FakeConnector::default());
        connector.script("a", vec![Err(UpstreamError::fatal("bad handshake"))]);
        let manager = manager_with(Arc::clone(&connector));
        manager.initialize(vec![spec("a")]).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        let statuses = manager.statuses();
        assert_eq!(statuses[0].status, Some(SessionStatus::Error));
        assert_eq!(statuses[0].last_error.as_deref(), Some("bad handshake"));
    }

    #[tokio::test]
    async fn exhausted_retries_park_the_session_in_error() {
        let connector = Arc::new(FakeConnector::default());
        connector.script(
            "a",
            vec![
                Err(UpstreamError::transient("refused")),
                Err(UpstreamError::transient("refused")),
                Err(UpstreamError::transient("refused")),
            ],
        );
        let manager = manager_with(Arc::clone(&connector));
        manager.initialize(vec![spec("a")]).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(manager.get_connected().is_empty());
    }

    #[tokio::test]
    async fn health_check_reconnects_errored_sessions() {
        let connector = Arc::new(FakeConnector::default());
        connector.script("a", vec![Err(UpstreamError::fatal("down for deploy"))]);
        let manager = manager_with(Arc::clone(&connector));
        manager.initialize(vec![spec("a")]).await;
        assert!(manager.get_connected().is_empty());

        // Next connect attempt succeeds (empty script defaults to Ok).
        let mut events = manager.subscribe();
        manager.health_check().await;

        assert!(manager.get_session("a").is_some());
        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::HealthCheckCompleted
        );
        let statuses = manager.statuses();
        assert_eq!(statuses[0].status, Some(SessionStatus::Connected));
    }

    #[tokio::test]
    async fn failed_probe_disconnects_the_session() {
        let connector = Arc::new(FakeConnector::default());
        let session = FakeSession::healthy();
        connector.script("a", vec![Ok(Arc::clone(&session))]);
        let manager = manager_with(Arc::clone(&connector));
        manager.initialize(vec![spec("a")]).await;

        session.probe_ok.store(false, Ordering::SeqCst);
        // Refuse the reconnect inside the same pass so the disconnect
        // is observable.
        connector.script(
            "a",
            vec![
                Err(UpstreamError::fatal("still down")),
            ],
        );
        manager.health_check().await;

        assert!(manager.get_session("a").is_none());
        assert!(session.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_all_releases_every_session() {
        let connector = Arc::new(FakeConnector::default());
        let a = FakeSession::healthy();
        let b = FakeSession::healthy();
        connector.script("a", vec![Ok(Arc::clone(&a))]);
        connector.script("b", vec![Ok(Arc::clone(&b))]);
        let manager = manager_with(Arc::clone(&connector));
        manager.initialize(vec![spec("a"), spec("b")]).await;

        manager.close_all().await;

        assert!(a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
        assert!(manager.get_connected().is_empty());
        assert!(manager.get_session("a").is_none());
    }

    #[test]
    fn namespace_pattern_accepts_labels_and_rejects_garbage() {
        assert!(is_valid_namespace("fs"));
        assert!(is_valid_namespace("My_Server-2"));
        assert!(!is_valid_namespace("2fs"));
        assert!(!is_valid_namespace(""));
        assert!(!is_valid_namespace("a b"));
        assert!(!is_valid_namespace("a:b"));
    }
}
