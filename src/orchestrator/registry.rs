//! Service registry: definitions, live handles, and single-flight start.
//!
//! Provides:
//! - Name → definition map, editable at runtime
//! - Name → live handle map, at most one handle per name
//! - `ensure_started`, which memoises the in-flight start so concurrent
//!   first callers share one launch instead of racing to spawn duplicates
//! - Exit/error hooks that drop a dead handle so the next call respawns

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::config::OrchestratorSettings;
use super::dispatcher::{self, PendingRequests};
use super::errors::OrchestratorError;
use super::lifecycle::{self, ProcessGuard};
use super::readiness::{self, ReadinessPolicy};
use super::transport::{BoxedReader, HttpTransport, StdioTransport};
use super::types::{ServiceDefinition, ServiceStatus, TransportKind};

type StartResult = Result<Arc<ServiceHandle>, OrchestratorError>;
type StartFuture = Shared<BoxFuture<'static, StartResult>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── ServiceHandle ───────────────────────────────────────────────────────────

/// How requests reach a live service.
enum ServiceChannel {
    Stdio {
        transport: StdioTransport,
        pending: Arc<PendingRequests>,
        router: JoinHandle<()>,
    },
    Http {
        transport: HttpTransport,
    },
}

/// Runtime state of one started service. Owned by the registry.
pub struct ServiceHandle {
    name: String,
    instance_id: Uuid,
    channel: ServiceChannel,
    process: Option<ProcessGuard>,
    connected: AtomicBool,
    request_count: AtomicU64,
    started_at: DateTime<Utc>,
    last_used_at: StdMutex<DateTime<Utc>>,
    capabilities: BTreeSet<String>,
    request_timeout: Duration,
}

impl ServiceHandle {
    fn new(
        name: &str,
        instance_id: Uuid,
        definition: &ServiceDefinition,
        channel: ServiceChannel,
        process: Option<ProcessGuard>,
        request_timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            instance_id,
            channel,
            process,
            connected: AtomicBool::new(true),
            request_count: AtomicU64::new(0),
            started_at: now,
            last_used_at: StdMutex::new(now),
            capabilities: definition.capabilities.clone(),
            request_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes successive incarnations of the same service name.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self.channel {
            ServiceChannel::Stdio { .. } => TransportKind::Stdio,
            ServiceChannel::Http { .. } => TransportKind::Http,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Whether an owned process has already died on its own.
    fn process_exited(&self) -> bool {
        self.process.as_ref().is_some_and(ProcessGuard::has_exited)
    }

    pub fn base_url(&self) -> Option<&str> {
        match &self.channel {
            ServiceChannel::Http { transport } => Some(transport.base_url()),
            ServiceChannel::Stdio { .. } => None,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        let in_flight = match &self.channel {
            ServiceChannel::Stdio { pending, .. } => pending.in_flight(),
            ServiceChannel::Http { .. } => 0,
        };
        ServiceStatus {
            connected: self.is_connected(),
            transport: self.transport_kind(),
            started_at: self.started_at,
            last_used_at: *lock(&self.last_used_at),
            request_count: self.request_count(),
            in_flight,
            pid: self.process.as_ref().and_then(ProcessGuard::pid),
            capabilities: self.capabilities.clone(),
        }
    }

    /// Send one logical call and wait for its outcome.
    pub async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_used_at) = Utc::now();

        match &self.channel {
            ServiceChannel::Stdio {
                transport, pending, ..
            } => {
                dispatcher::call_stdio(transport, pending, method, params, self.request_timeout)
                    .await
            }
            ServiceChannel::Http { transport } => {
                dispatcher::call_http(transport, &self.name, method, params, self.request_timeout)
                    .await
            }
        }
    }

    /// Stop routing and kill any owned process.
    async fn terminate(&self, grace: Duration) {
        self.connected.store(false, Ordering::Release);
        if let ServiceChannel::Stdio { router, .. } = &self.channel {
            router.abort();
        }
        if let Some(process) = &self.process {
            process.terminate(grace).await;
        }
    }
}

// ─── ServiceRegistry ─────────────────────────────────────────────────────────

struct RegistryInner {
    settings: OrchestratorSettings,
    definitions: RwLock<HashMap<String, ServiceDefinition>>,
    handles: StdMutex<HashMap<String, Arc<ServiceHandle>>>,
    starting: StdMutex<HashMap<String, StartFuture>>,
    /// Bumped by `shutdown_all`; starts from an older generation never publish.
    generation: AtomicU64,
    spawn_count: AtomicU64,
}

/// Shared registry of service definitions and live handles.
///
/// Cloning is cheap and every clone sees the same state.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                definitions: RwLock::new(HashMap::new()),
                handles: StdMutex::new(HashMap::new()),
                starting: StdMutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                spawn_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    // ─── Definitions ─────────────────────────────────────────────────────

    /// Insert or overwrite a definition. A running handle is left untouched.
    pub fn register_definition(
        &self,
        name: &str,
        definition: ServiceDefinition,
    ) -> Result<(), OrchestratorError> {
        definition.validate(name)?;

        let mut definitions = self
            .inner
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.insert(name.to_string(), definition).is_some() {
            tracing::warn!(server = name, "overwriting existing service definition");
        } else {
            tracing::debug!(server = name, "registered service definition");
        }
        Ok(())
    }

    /// Delete a definition. A running handle keeps running until shut down.
    pub fn remove_definition(&self, name: &str) -> bool {
        let removed = self
            .inner
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            tracing::info!(server = name, "removed service definition");
        } else {
            tracing::warn!(server = name, "no definition to remove");
        }
        removed
    }

    pub fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.inner
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All definitions, sorted by name.
    pub fn definitions(&self) -> Vec<(String, ServiceDefinition)> {
        let mut all: Vec<_> = self
            .inner
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, def)| (name.clone(), def.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    // ─── Handles ─────────────────────────────────────────────────────────

    pub fn live_handle(&self, name: &str) -> Option<Arc<ServiceHandle>> {
        lock(&self.inner.handles).get(name).cloned()
    }

    /// All live handles, sorted by name.
    pub fn live_handles(&self) -> Vec<Arc<ServiceHandle>> {
        let mut all: Vec<_> = lock(&self.inner.handles).values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Processes spawned plus connections opened, over the registry's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::Relaxed)
    }

    /// Return the live handle for `name`, starting the service if needed.
    ///
    /// Concurrent callers for the same name share one in-flight start and
    /// all observe its outcome.
    pub async fn ensure_started(&self, name: &str) -> StartResult {
        if let Some(handle) = self.live_handle(name) {
            return Ok(handle);
        }

        let start = {
            let mut starting = lock(&self.inner.starting);
            if let Some(handle) = self.live_handle(name) {
                return Ok(handle);
            }
            match starting.get(name) {
                Some(in_flight) => {
                    tracing::debug!(server = name, "joining in-flight start");
                    in_flight.clone()
                }
                None => {
                    let definition =
                        self.definition(name)
                            .ok_or_else(|| OrchestratorError::UnknownService {
                                name: name.to_string(),
                            })?;
                    let generation = self.inner.generation.load(Ordering::SeqCst);
                    let future = Arc::clone(&self.inner)
                        .start(name.to_string(), definition, generation)
                        .boxed()
                        .shared();
                    starting.insert(name.to_string(), future.clone());
                    future
                }
            }
        };

        start.await
    }

    /// Drop the handle for `name` if it is still the given incarnation.
    ///
    /// Called when the process exits or the connection fails.
    pub fn on_exit_or_error(&self, name: &str, instance_id: Uuid) -> bool {
        self.inner.deregister(name, instance_id)
    }

    /// Stop one service. Its definition stays registered.
    pub async fn shutdown_service(&self, name: &str) -> bool {
        let handle = lock(&self.inner.handles).remove(name);
        match handle {
            Some(handle) => {
                tracing::info!(server = name, "shutting down service");
                handle.terminate(self.inner.settings.shutdown_grace()).await;
                true
            }
            None => false,
        }
    }

    /// Stop every live service and clear the handle map.
    ///
    /// Starts still in flight are abandoned: they fail with
    /// `TransportUnavailable` and kill their process instead of publishing.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<ServiceHandle>> = {
            let mut starting = lock(&self.inner.starting);
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            if !starting.is_empty() {
                tracing::info!(count = starting.len(), "abandoning in-flight starts");
                starting.clear();
            }
            lock(&self.inner.handles).drain().map(|(_, h)| h).collect()
        };
        if drained.is_empty() {
            return;
        }

        tracing::info!(count = drained.len(), "shutting down all services");
        let grace = self.inner.settings.shutdown_grace();
        futures::future::join_all(drained.iter().map(|h| h.terminate(grace))).await;
    }
}

impl RegistryInner {
    /// Body of the shared start future. Publishes the handle on success and
    /// clears the in-flight marker unless a shutdown already did.
    async fn start(
        self: Arc<Self>,
        name: String,
        definition: ServiceDefinition,
        generation: u64,
    ) -> StartResult {
        let launched = self.launch(&name, &definition).await;

        let (result, discarded) = {
            let mut starting = lock(&self.starting);
            let current = self.generation.load(Ordering::SeqCst) == generation;
            if current {
                starting.remove(&name);
            }
            match launched {
                Ok(handle) => match self.publish(&name, &handle, current) {
                    Ok(()) => (Ok(handle), None),
                    Err(e) => (Err(e), Some(handle)),
                },
                Err(e) => (Err(e), None),
            }
        };

        if let Some(handle) = discarded {
            handle.terminate(self.settings.shutdown_grace()).await;
        }
        if let Err(e) = &result {
            tracing::warn!(server = %name, error = %e, "service failed to start");
        }
        result
    }

    /// Insert a started handle unless a shutdown intervened or its process
    /// already died. The caller holds the `starting` lock.
    ///
    /// The exit flag is read under the `handles` lock, so an exit hook that
    /// fires later always finds the inserted handle.
    fn publish(
        &self,
        name: &str,
        handle: &Arc<ServiceHandle>,
        current: bool,
    ) -> Result<(), OrchestratorError> {
        let mut handles = lock(&self.handles);
        let reason = if !current {
            "registry shut down while the service was starting"
        } else if handle.process_exited() {
            "process exited during start-up"
        } else {
            handles.insert(name.to_string(), Arc::clone(handle));
            return Ok(());
        };
        Err(OrchestratorError::TransportUnavailable {
            server: name.to_string(),
            reason: reason.to_string(),
        })
    }

    async fn launch(
        self: &Arc<Self>,
        name: &str,
        definition: &ServiceDefinition,
    ) -> StartResult {
        definition.validate(name)?;

        let policy = ReadinessPolicy::from_settings(
            &self.settings,
            self.settings.readiness_timeout(definition),
        );
        let instance_id = Uuid::new_v4();

        tracing::info!(
            server = name,
            transport = %definition.transport,
            strategy = ?definition.readiness_strategy(),
            instance = %instance_id,
            "starting service"
        );

        let handle = match definition.transport {
            TransportKind::Stdio => self.launch_stdio(name, instance_id, definition, &policy).await?,
            TransportKind::Http => self.launch_http(name, instance_id, definition, &policy).await?,
        };
        Ok(Arc::new(handle))
    }

    async fn launch_stdio(
        self: &Arc<Self>,
        name: &str,
        instance_id: Uuid,
        definition: &ServiceDefinition,
        policy: &ReadinessPolicy,
    ) -> Result<ServiceHandle, OrchestratorError> {
        let mut child = lifecycle::spawn_process(name, definition, true)?;
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        // A child dropped here is killed on drop.
        let stdin = child.stdin.take().ok_or_else(|| OrchestratorError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| OrchestratorError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        let (transport, lines) = StdioTransport::attach(name, stdin, stdout, stderr);
        let pending = Arc::new(PendingRequests::new(name));
        let router = dispatcher::spawn_router(Arc::clone(&pending), lines);
        let process = ProcessGuard::watch(name, child, self.exit_hook(name, instance_id));

        let strategy = definition.readiness_strategy();
        if let Err(e) = readiness::await_stdio_ready(&transport, &pending, strategy, policy).await {
            router.abort();
            process.terminate(self.settings.shutdown_grace()).await;
            return Err(e);
        }

        Ok(ServiceHandle::new(
            name,
            instance_id,
            definition,
            ServiceChannel::Stdio {
                transport,
                pending,
                router,
            },
            Some(process),
            self.settings.request_timeout(definition),
        ))
    }

    async fn launch_http(
        self: &Arc<Self>,
        name: &str,
        instance_id: Uuid,
        definition: &ServiceDefinition,
        policy: &ReadinessPolicy,
    ) -> Result<ServiceHandle, OrchestratorError> {
        let base_url = definition
            .resolved_base_url()
            .ok_or_else(|| OrchestratorError::ConfigError {
                reason: format!("http service '{name}' needs a port or base_url"),
            })?;
        let transport = HttpTransport::new(name, &base_url)?;

        let process = match definition.command {
            Some(_) => {
                let mut child = lifecycle::spawn_process(name, definition, false)?;
                if let Some(stdout) = child.stdout.take() {
                    lifecycle::forward_output(name, "stdout", stdout);
                }
                if let Some(stderr) = child.stderr.take() {
                    lifecycle::forward_output(name, "stderr", stderr);
                }
                Some(ProcessGuard::watch(name, child, self.exit_hook(name, instance_id)))
            }
            None => None,
        };
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        let strategy = definition.readiness_strategy();
        if let Err(e) = readiness::await_http_ready(name, &transport, strategy, policy).await {
            if let Some(process) = &process {
                process.terminate(self.settings.shutdown_grace()).await;
            }
            return Err(e);
        }

        Ok(ServiceHandle::new(
            name,
            instance_id,
            definition,
            ServiceChannel::Http { transport },
            process,
            self.settings.request_timeout(definition),
        ))
    }

    /// Hook run by the process watcher when the process dies on its own.
    fn exit_hook(self: &Arc<Self>, name: &str, instance_id: Uuid) -> impl FnOnce() + Send + 'static {
        let registry: Weak<RegistryInner> = Arc::downgrade(self);
        let name = name.to_string();
        move || {
            if let Some(inner) = registry.upgrade() {
                inner.deregister(&name, instance_id);
            }
        }
    }

    fn deregister(&self, name: &str, instance_id: Uuid) -> bool {
        let mut handles = lock(&self.handles);
        let matches = handles
            .get(name)
            .is_some_and(|h| h.instance_id == instance_id);
        if !matches {
            return false;
        }

        if let Some(handle) = handles.remove(name) {
            handle.connected.store(false, Ordering::Release);
            if let ServiceChannel::Stdio { router, .. } = &handle.channel {
                router.abort();
            }
        }
        tracing::info!(server = name, instance = %instance_id, "service deregistered");
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
