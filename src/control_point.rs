//! The control point orchestrator.
//!
//! Wires the SSDP sockets, the description fetch pool, the event receiver,
//! the subscription manager and the device table together, and owns every
//! worker task. SSDP receive tasks never touch shared state directly; they
//! feed a bounded channel drained here.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::description::{self, DeviceEntry};
use crate::device::{Action, Device, DeviceBuild, Service, ServiceBuild};
use crate::error::{Error, Result};
use crate::event::{EventCallback, EventServer};
use crate::gena::{SubscriptionManager, DEFAULT_SUBSCRIBE_TIMEOUT_SECS};
use crate::interface::Iface;
use crate::soap::SoapClient;
use crate::ssdp::{NotifySocket, SearchSocket, SsdpMessage, SEARCH_TARGET_ALL};

/// Discovery callbacks. For a single device, `on_discover` strictly precedes
/// `on_lost`. Callbacks run synchronously on internal worker tasks and must
/// not call back into the [`ControlPoint`].
pub trait DiscoveryListener: Send + Sync {
    fn on_discover(&self, device: &Arc<Device>);
    fn on_lost(&self, device: &Arc<Device>);
}

/// State-variable change callbacks, one call per property in arrival order.
/// Same reentrancy rule as [`DiscoveryListener`].
pub trait NotifyEventListener: Send + Sync {
    fn on_event(&self, service: &Arc<Service>, seq: u64, variable: &str, value: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
    /// Terminal; a terminated control point cannot be reused.
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ControlPointConfig {
    /// Interfaces to run discovery on; `None` enumerates usable ones.
    pub interfaces: Option<Vec<Iface>>,
    /// Description fetch worker count.
    pub fetch_workers: usize,
    /// Capacity of the SSDP → orchestrator and fetch queues.
    pub channel_capacity: usize,
    /// Connect and read timeout for every HTTP operation.
    pub http_timeout: Duration,
    /// Requested GENA subscription lifetime.
    pub subscribe_timeout_secs: u32,
    pub user_agent: String,
}

impl Default for ControlPointConfig {
    fn default() -> Self {
        Self {
            interfaces: None,
            fetch_workers: 2,
            channel_capacity: 64,
            http_timeout: Duration::from_secs(30),
            subscribe_timeout_secs: DEFAULT_SUBSCRIBE_TIMEOUT_SECS,
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!(
        "{} UPnP/1.1 upnp-client/{}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    )
}

type DeviceTable = Arc<Mutex<HashMap<String, Arc<Device>>>>;
type DiscoveryListeners = Arc<Mutex<Vec<Arc<dyn DiscoveryListener>>>>;
type NotifyListeners = Arc<Mutex<Vec<Arc<dyn NotifyEventListener>>>>;

struct Runtime {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    search_sockets: Vec<Arc<SearchSocket>>,
    event_port: u16,
}

pub struct ControlPoint {
    config: ControlPointConfig,
    http: reqwest::Client,
    soap: SoapClient,
    subscriptions: SubscriptionManager,
    state: Mutex<State>,
    ifaces: Mutex<Vec<Iface>>,
    devices: DeviceTable,
    discovery_listeners: DiscoveryListeners,
    notify_listeners: NotifyListeners,
    runtime: Mutex<Option<Runtime>>,
}

impl ControlPoint {
    pub fn new(config: ControlPointConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.http_timeout)
            .timeout(config.http_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Transport(format!("build http client: {e}")))?;
        let soap = SoapClient::new(http.clone(), config.user_agent.clone());
        let subscriptions = SubscriptionManager::new(
            http.clone(),
            config.user_agent.clone(),
            config.subscribe_timeout_secs,
        );
        Ok(Self {
            config,
            http,
            soap,
            subscriptions,
            state: Mutex::new(State::Uninitialized),
            ifaces: Mutex::new(Vec::new()),
            devices: Arc::new(Mutex::new(HashMap::new())),
            discovery_listeners: Arc::new(Mutex::new(Vec::new())),
            notify_listeners: Arc::new(Mutex::new(Vec::new())),
            runtime: Mutex::new(None),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(ControlPointConfig::default())
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// Picks the interfaces discovery will run on.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != State::Uninitialized {
            return Err(Error::Protocol(format!(
                "cannot initialize from {:?}",
                *state
            )));
        }
        let ifaces = match &self.config.interfaces {
            Some(list) => list.clone(),
            None => Iface::list()?,
        };
        if ifaces.is_empty() {
            return Err(Error::Transport(
                "no usable network interface".to_string(),
            ));
        }
        tracing::info!(interfaces = ifaces.len(), "control point initialized");
        *self.ifaces.lock() = ifaces;
        *state = State::Initialized;
        Ok(())
    }

    /// Opens the discovery sockets and the event receiver and spawns every
    /// worker.
    pub async fn start(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if !matches!(*state, State::Initialized | State::Stopped) {
                return Err(Error::Protocol(format!("cannot start from {:?}", *state)));
            }
        }
        let ifaces = self.ifaces.lock().clone();
        let cancel = CancellationToken::new();
        let (ssdp_tx, ssdp_rx) = mpsc::channel(self.config.channel_capacity);
        let mut tasks = Vec::new();
        let mut search_sockets = Vec::new();

        for iface in &ifaces {
            match NotifySocket::open(iface) {
                Ok(socket) => tasks.push(socket.start(ssdp_tx.clone(), cancel.child_token())),
                Err(e) => tracing::warn!(%iface, "cannot open notify socket: {e}"),
            }
            match SearchSocket::open(iface) {
                Ok(socket) => {
                    tasks.push(socket.start(ssdp_tx.clone(), cancel.child_token()));
                    search_sockets.push(Arc::new(socket));
                }
                Err(e) => tracing::warn!(%iface, "cannot open search socket: {e}"),
            }
        }
        drop(ssdp_tx);
        if search_sockets.is_empty() {
            cancel.cancel();
            return Err(Error::Transport(
                "no discovery socket could be opened".to_string(),
            ));
        }

        let event_server = match EventServer::bind(self.event_callback()).await {
            Ok(server) => server,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        let event_port = event_server.port();
        tasks.push(event_server.start(cancel.child_token()));

        tasks.push(self.subscriptions.spawn_keepalive(cancel.child_token()));

        let (fetch_tx, fetch_rx) = mpsc::channel(self.config.channel_capacity);
        let fetch_rx = Arc::new(tokio::sync::Mutex::new(fetch_rx));
        let ctx = FetchCtx {
            http: self.http.clone(),
            devices: self.devices.clone(),
            discovery_listeners: self.discovery_listeners.clone(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        for worker in 0..self.config.fetch_workers.max(1) {
            tasks.push(spawn_fetch_worker(
                worker,
                ctx.clone(),
                fetch_rx.clone(),
                cancel.child_token(),
            ));
        }

        tasks.push(spawn_orchestrator(
            ssdp_rx,
            fetch_tx,
            ctx,
            self.subscriptions.clone(),
            cancel.child_token(),
        ));
        tasks.push(spawn_expiry_sweep(
            self.devices.clone(),
            self.discovery_listeners.clone(),
            self.subscriptions.clone(),
            cancel.child_token(),
        ));

        *self.runtime.lock() = Some(Runtime {
            cancel,
            tasks,
            search_sockets,
            event_port,
        });
        *self.state.lock() = State::Started;
        tracing::info!("control point started");
        Ok(())
    }

    /// Best-effort unsubscribes everything, quiesces all workers and clears
    /// the device table.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != State::Started {
                return Err(Error::Protocol(format!("cannot stop from {:?}", *state)));
            }
        }
        for service in self.subscriptions.subscribed_services() {
            if let Err(e) = self.subscriptions.unsubscribe(&service).await {
                tracing::debug!(
                    service = service.service_id(),
                    "unsubscribe on stop failed: {e}"
                );
            }
        }
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            for task in runtime.tasks {
                let _ = task.await;
            }
        }
        self.subscriptions.clear();
        let removed: Vec<Arc<Device>> = {
            let mut table = self.devices.lock();
            table.drain().map(|(_, device)| device).collect()
        };
        for device in removed {
            notify_lost(&self.discovery_listeners, &device);
        }
        *self.state.lock() = State::Stopped;
        tracing::info!("control point stopped");
        Ok(())
    }

    /// One-shot teardown. A terminated control point cannot be restarted;
    /// construct a fresh instance instead.
    pub async fn terminate(&self) -> Result<()> {
        if self.state() == State::Started {
            self.stop().await?;
        }
        *self.state.lock() = State::Terminated;
        Ok(())
    }

    /// Multicasts an `M-SEARCH` for all devices.
    pub async fn search(&self) -> Result<()> {
        self.search_target(SEARCH_TARGET_ALL).await
    }

    /// Multicasts an `M-SEARCH` for the given search target.
    pub async fn search_target(&self, st: &str) -> Result<()> {
        let sockets = {
            let runtime = self.runtime.lock();
            let runtime = runtime
                .as_ref()
                .ok_or_else(|| Error::Protocol("control point is not started".to_string()))?;
            runtime.search_sockets.clone()
        };
        let mut sent = false;
        let mut last_error = None;
        for socket in sockets {
            match socket.search(st, &self.config.user_agent).await {
                Ok(()) => sent = true,
                Err(e) => {
                    tracing::warn!("search send failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        match (sent, last_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(Error::Transport("no search socket".to_string())),
        }
    }

    pub fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        self.discovery_listeners.lock().push(listener);
    }

    /// Removal during a dispatch takes effect from the next event on.
    pub fn remove_discovery_listener(&self, listener: &Arc<dyn DiscoveryListener>) {
        self.discovery_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_notify_event_listener(&self, listener: Arc<dyn NotifyEventListener>) {
        self.notify_listeners.lock().push(listener);
    }

    pub fn remove_notify_event_listener(&self, listener: &Arc<dyn NotifyEventListener>) {
        self.notify_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn get_device(&self, udn: &str) -> Option<Arc<Device>> {
        self.devices.lock().get(udn).cloned()
    }

    pub fn device_list(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }

    /// Invokes an action; a fault envelope fails with [`Error::Fault`].
    pub async fn invoke(
        &self,
        service: &Service,
        action: &Action,
        args: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        self.soap.invoke(service, action, args).await
    }

    /// Invokes an action; a fault envelope comes back as the result map.
    pub async fn invoke_keep_fault(
        &self,
        service: &Service,
        action: &Action,
        args: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        self.soap.invoke_keep_fault(service, action, args).await
    }

    /// Subscribes to a service's events. With `keep`, the subscription is
    /// renewed before each expiry until unsubscribed or the device is lost.
    pub async fn subscribe(&self, service: &Arc<Service>, keep: bool) -> Result<()> {
        let callback_url = self.callback_url(service)?;
        self.subscriptions.subscribe(service, &callback_url, keep).await
    }

    pub async fn renew_subscription(&self, service: &Arc<Service>) -> Result<()> {
        self.subscriptions.renew(service).await
    }

    pub async fn unsubscribe(&self, service: &Arc<Service>) -> Result<()> {
        self.subscriptions.unsubscribe(service).await
    }

    fn callback_url(&self, service: &Arc<Service>) -> Result<String> {
        let event_port = {
            let runtime = self.runtime.lock();
            runtime
                .as_ref()
                .ok_or_else(|| Error::Protocol("control point is not started".to_string()))?
                .event_port
        };
        let device = self
            .devices
            .lock()
            .values()
            .find(|d| d.all_services().any(|s| Arc::ptr_eq(s, service)))
            .cloned()
            .ok_or_else(|| {
                Error::Protocol("service does not belong to a known device".to_string())
            })?;
        Ok(format!(
            "http://{}:{event_port}/{}/{}",
            device.iface_addr(),
            service.udn(),
            service.service_id()
        ))
    }

    fn event_callback(&self) -> EventCallback {
        let subscriptions = self.subscriptions.clone();
        let listeners = self.notify_listeners.clone();
        Arc::new(move |sid, seq, properties| {
            let Some(service) = subscriptions.service_by_sid(sid) else {
                tracing::debug!(sid, "notification for unknown SID");
                return false;
            };
            let snapshot: Vec<_> = listeners.lock().clone();
            for (name, value) in &properties {
                for listener in &snapshot {
                    listener.on_event(&service, seq, name, value);
                }
            }
            true
        })
    }
}

#[derive(Clone)]
struct FetchCtx {
    http: reqwest::Client,
    devices: DeviceTable,
    discovery_listeners: DiscoveryListeners,
    /// LOCATION urls queued or being fetched, for de-duplication.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

struct FetchJob {
    location: Url,
    message: SsdpMessage,
}

fn spawn_orchestrator(
    mut rx: mpsc::Receiver<SsdpMessage>,
    fetch_tx: mpsc::Sender<FetchJob>,
    ctx: FetchCtx,
    subscriptions: SubscriptionManager,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            };
            handle_ssdp_message(&ctx, &fetch_tx, &subscriptions, message).await;
        }
        tracing::trace!("ssdp orchestrator done");
    })
}

async fn handle_ssdp_message(
    ctx: &FetchCtx,
    fetch_tx: &mpsc::Sender<FetchJob>,
    subscriptions: &SubscriptionManager,
    message: SsdpMessage,
) {
    let uuid = message.uuid().to_string();
    if message.is_byebye() {
        let removed = ctx.devices.lock().remove(&uuid);
        if let Some(device) = removed {
            tracing::info!(udn = device.udn(), "device said byebye");
            subscriptions.invalidate_device(&device);
            notify_lost(&ctx.discovery_listeners, &device);
        }
        return;
    }

    // alive, update or search response
    let known = ctx.devices.lock().get(&uuid).cloned();
    if let Some(device) = known {
        device.refresh(message);
        return;
    }
    let Some(location) = message.location().map(str::to_string) else {
        return;
    };
    let Ok(location) = Url::parse(&location) else {
        tracing::debug!(%location, "unparsable LOCATION");
        return;
    };
    if !ctx.in_flight.lock().insert(location.to_string()) {
        // a description fetch for this location is already queued
        return;
    }
    if fetch_tx
        .send(FetchJob {
            location: location.clone(),
            message,
        })
        .await
        .is_err()
    {
        ctx.in_flight.lock().remove(location.as_str());
    }
}

fn spawn_fetch_worker(
    index: usize,
    ctx: FetchCtx,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<FetchJob>>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = async { rx.lock().await.recv().await } => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let result = fetch_and_build(&ctx.http, &job).await;
            ctx.in_flight.lock().remove(job.location.as_str());
            match result {
                Ok(device) => insert_device(&ctx, device, &job.message),
                Err(e) => {
                    tracing::debug!(location = %job.location, "description fetch failed: {e}")
                }
            }
        }
        tracing::trace!(worker = index, "description fetcher done");
    })
}

/// GETs the device description plus each service's SCPD and builds the
/// entity graph.
async fn fetch_and_build(http: &reqwest::Client, job: &FetchJob) -> Result<Device> {
    let desc = description::fetch_device_description(http, &job.location).await?;
    let base = match desc.url_base.as_deref() {
        Some(base) => {
            Url::parse(base).map_err(|e| Error::Build(format!("bad URLBase {base:?}: {e}")))?
        }
        None => job.location.clone(),
    };
    let build = fetch_device_build(http, &base, desc.device).await?;
    Device::build(
        job.location.clone(),
        desc.url_base.as_deref(),
        build,
        job.message.clone(),
    )
}

fn fetch_device_build<'a>(
    http: &'a reqwest::Client,
    base: &'a Url,
    mut entry: DeviceEntry,
) -> Pin<Box<dyn Future<Output = Result<DeviceBuild>> + Send + 'a>> {
    Box::pin(async move {
        let service_entries = std::mem::take(&mut entry.services);
        let embedded_entries = std::mem::take(&mut entry.devices);

        let mut services = Vec::with_capacity(service_entries.len());
        for service_entry in service_entries {
            let declared = service_entry
                .scpd_url
                .clone()
                .ok_or_else(|| Error::Build("missing SCPDURL".to_string()))?;
            let scpd_url = base.join(&declared).map_err(|e| {
                Error::Build(format!("cannot resolve {declared:?} against {base}: {e}"))
            })?;
            let scpd = description::fetch_scpd(http, &scpd_url).await?;
            services.push(ServiceBuild {
                entry: service_entry,
                scpd,
            });
        }

        let mut embedded = Vec::with_capacity(embedded_entries.len());
        for embedded_entry in embedded_entries {
            embedded.push(fetch_device_build(http, base, embedded_entry).await?);
        }

        Ok(DeviceBuild {
            entry,
            services,
            embedded,
        })
    })
}

fn insert_device(ctx: &FetchCtx, device: Device, message: &SsdpMessage) {
    let device = Arc::new(device);
    let existing = {
        let mut devices = ctx.devices.lock();
        match devices.get(device.udn()) {
            Some(existing) => Some(existing.clone()),
            None => {
                devices.insert(device.udn().to_string(), device.clone());
                None
            }
        }
    };
    match existing {
        // raced with another fetch or advertisement; keep the known graph
        Some(existing) => existing.refresh(message.clone()),
        None => {
            tracing::info!(
                udn = device.udn(),
                name = device.friendly_name(),
                "discovered device"
            );
            notify_discovered(&ctx.discovery_listeners, &device);
        }
    }
}

fn spawn_expiry_sweep(
    devices: DeviceTable,
    listeners: DiscoveryListeners,
    subscriptions: SubscriptionManager,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let now = Instant::now();
                    let expired: Vec<Arc<Device>> = {
                        let mut table = devices.lock();
                        let udns: Vec<String> = table
                            .iter()
                            .filter(|(_, device)| device.expires_at() <= now)
                            .map(|(udn, _)| udn.clone())
                            .collect();
                        udns.into_iter().filter_map(|udn| table.remove(&udn)).collect()
                    };
                    for device in expired {
                        tracing::info!(udn = device.udn(), "device expired");
                        subscriptions.invalidate_device(&device);
                        notify_lost(&listeners, &device);
                    }
                }
            }
        }
        tracing::trace!("expiry sweep done");
    })
}

fn notify_discovered(listeners: &DiscoveryListeners, device: &Arc<Device>) {
    let snapshot: Vec<_> = listeners.lock().clone();
    for listener in snapshot {
        listener.on_discover(device);
    }
}

fn notify_lost(listeners: &DiscoveryListeners, device: &Arc<Device>) {
    let snapshot: Vec<_> = listeners.lock().clone();
    for listener in snapshot {
        listener.on_lost(device);
    }
}
