use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use discovery::{MissingResolver, ServiceResolver};
use shared::{
    domain::{GUIDER_AGENT, IMAGER_AGENT},
    protocol::ClientRequest,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigStore, MemoryConfigStore, MonitorConfig},
    error::OrchestratorError,
    ingest::{PreviewSlots, ProtocolIngester},
    remote::{MirrorQueue, NoRemoteMirror, RemoteCommand, RemoteCommandKind, RemoteMirror},
    store::PropertyStore,
    transport::{SessionId, SessionTransport, TransportEvent, TransportOutcome, TransportSettings},
    MonitorEvent,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReinitPlan {
    pub disconnect: Vec<String>,
    pub connect_now: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnection {
    Stale,
    Expected { drained: bool },
    /// Lost without being asked to; `remaining` are the servers still live.
    Unexpected { remaining: Vec<String> },
    Unreachable,
}

#[derive(Debug, Default)]
pub struct ConnectionPlan {
    desired: Vec<String>,
    live: HashMap<String, SessionId>,
    pending_disconnect: HashSet<String>,
    next_session: SessionId,
    reinits: u64,
}

impl ConnectionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desired(&self) -> &[String] {
        &self.desired
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.contains_key(name)
    }

    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .desired
            .iter()
            .filter(|name| self.live.contains_key(*name))
            .cloned()
            .collect();
        let mut extra: Vec<String> = self
            .live
            .keys()
            .filter(|name| !self.desired.contains(name))
            .cloned()
            .collect();
        extra.sort();
        names.extend(extra);
        names
    }

    pub fn pending_disconnect(&self) -> Vec<String> {
        let mut pending: Vec<String> = self.pending_disconnect.iter().cloned().collect();
        pending.sort();
        pending
    }

    pub fn reinits(&self) -> u64 {
        self.reinits
    }

    pub fn is_current(&self, name: &str, session: SessionId) -> bool {
        self.live.get(name) == Some(&session)
    }

    pub fn reinit<S: AsRef<str>>(&mut self, servers: &[S]) -> ReinitPlan {
        let mut desired: Vec<String> = Vec::with_capacity(servers.len());
        for name in servers.iter().map(AsRef::as_ref) {
            if !name.is_empty() && !desired.iter().any(|known| known == name) {
                desired.push(name.to_string());
            }
        }
        self.desired = desired;
        self.reinits += 1;

        let disconnect = self.live_names();
        self.pending_disconnect.extend(disconnect.iter().cloned());
        ReinitPlan {
            connect_now: self.pending_disconnect.is_empty(),
            disconnect,
        }
    }

    pub fn connect_candidates(&self) -> Vec<String> {
        if !self.pending_disconnect.is_empty() {
            return Vec::new();
        }
        self.desired
            .iter()
            .filter(|name| !self.live.contains_key(*name))
            .cloned()
            .collect()
    }

    pub fn register(&mut self, name: &str) -> SessionId {
        self.next_session += 1;
        self.live.insert(name.to_string(), self.next_session);
        self.next_session
    }

    /// Classifies a terminal outcome and forgets the session it belongs to.
    pub fn classify(&mut self, name: &str, session: SessionId, outcome: &TransportOutcome) -> Disconnection {
        if !self.is_current(name, session) {
            return Disconnection::Stale;
        }
        self.live.remove(name);

        if self.pending_disconnect.remove(name) {
            return Disconnection::Expected {
                drained: self.pending_disconnect.is_empty(),
            };
        }
        if matches!(outcome, TransportOutcome::Unreachable(_)) {
            return Disconnection::Unreachable;
        }
        Disconnection::Unexpected {
            remaining: self.live_names(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
    pub desired: Vec<String>,
    pub live: Vec<String>,
    pub connected: Vec<String>,
    pub pending_disconnect: Vec<String>,
    pub reinits: u64,
}

pub struct Collaborators {
    pub resolver: Arc<dyn ServiceResolver>,
    pub config_store: Arc<dyn ConfigStore>,
    pub mirror: Arc<dyn RemoteMirror>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            resolver: Arc::new(MissingResolver),
            config_store: Arc::new(MemoryConfigStore::default()),
            mirror: Arc::new(NoRemoteMirror),
        }
    }
}

impl Collaborators {
    pub fn new(resolver: Arc<dyn ServiceResolver>) -> Self {
        Self {
            resolver,
            ..Self::default()
        }
    }

    pub fn with_config_store(mut self, config_store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = config_store;
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn RemoteMirror>) -> Self {
        self.mirror = mirror;
        self
    }
}

enum Command {
    Reinit(Vec<String>),
    ConnectAll,
    DiscoveryUpdated,
    EmergencyStopAll,
    EnableAllPreviews,
    Remote(RemoteCommand),
    SetConfig(MonitorConfig, oneshot::Sender<Result<(), OrchestratorError>>),
    Status(oneshot::Sender<OrchestratorStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ConnectionOrchestrator {
    commands: mpsc::UnboundedSender<Command>,
    store: PropertyStore,
    previews: PreviewSlots,
    events: broadcast::Sender<MonitorEvent>,
}

impl ConnectionOrchestrator {
    pub fn start(config: MonitorConfig, collaborators: Collaborators) -> Self {
        let store = PropertyStore::spawn();
        let previews = PreviewSlots::default();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ingester = Arc::new(ProtocolIngester::new(
            store.clone(),
            previews.clone(),
            MirrorQueue::spawn(collaborators.mirror),
            events.clone(),
            config.ingest_settings(),
        ));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let worker = Orchestrator {
            config,
            plan: ConnectionPlan::new(),
            transports: HashMap::new(),
            store: store.clone(),
            previews: previews.clone(),
            events: events.clone(),
            ingester,
            resolver: collaborators.resolver,
            config_store: collaborators.config_store,
            transport_tx,
            connect_due: None,
        };
        tokio::spawn(worker.run(commands_rx, transport_rx));

        Self {
            commands,
            store,
            previews,
            events,
        }
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn imager_preview(&self) -> watch::Receiver<Option<String>> {
        self.previews.imager()
    }

    pub fn guider_preview(&self) -> watch::Receiver<Option<String>> {
        self.previews.guider()
    }

    pub fn reinit<I, S>(&self, servers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::Reinit(servers.into_iter().map(Into::into).collect()));
    }

    pub fn connect_all(&self) {
        self.send(Command::ConnectAll);
    }

    pub fn discovery_updated(&self) {
        self.send(Command::DiscoveryUpdated);
    }

    /// Runs `discovery_updated` every `every` until the orchestrator stops.
    pub fn spawn_periodic_discovery(&self, every: Duration) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if commands.send(Command::DiscoveryUpdated).is_err() {
                    debug!("orchestrator: periodic discovery finished");
                    break;
                }
            }
        })
    }

    pub fn emergency_stop_all(&self) {
        self.send(Command::EmergencyStopAll);
    }

    pub fn enable_all_previews(&self) {
        self.send(Command::EnableAllPreviews);
    }

    pub fn apply_remote_command(&self, command: RemoteCommand) {
        self.send(Command::Remote(command));
    }

    pub async fn set_config(&self, config: MonitorConfig) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetConfig(config, reply));
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    pub async fn status(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply));
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply));
        let _ = rx.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("orchestrator: task gone, dropping command");
        }
    }
}

struct Orchestrator {
    config: MonitorConfig,
    plan: ConnectionPlan,
    transports: HashMap<String, SessionTransport>,
    store: PropertyStore,
    previews: PreviewSlots,
    events: broadcast::Sender<MonitorEvent>,
    ingester: Arc<ProtocolIngester>,
    resolver: Arc<dyn ServiceResolver>,
    config_store: Arc<dyn ConfigStore>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    connect_due: Option<Instant>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let connect_timer = tokio::time::sleep_until(Instant::now());
        tokio::pin!(connect_timer);
        let mut connect_armed = false;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.stop_all();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop_all();
                        break;
                    }
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                _ = &mut connect_timer, if connect_armed => {
                    connect_armed = false;
                    self.connect_all();
                }
            }

            if let Some(at) = self.connect_due.take() {
                connect_timer.as_mut().reset(at);
                connect_armed = true;
            }
        }
        debug!("orchestrator: stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reinit(servers) => self.reinit(servers),
            Command::ConnectAll => self.connect_all(),
            Command::DiscoveryUpdated => self.discovery_updated(),
            Command::EmergencyStopAll => self.emergency_stop_all(),
            Command::EnableAllPreviews => self.enable_all_previews(),
            Command::Remote(command) => self.apply_remote_command(command),
            Command::SetConfig(config, reply) => {
                let _ = reply.send(self.set_config(config));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn reinit(&mut self, servers: Vec<String>) {
        let plan = self.plan.reinit(&servers);
        self.store.clear();
        self.previews.clear();
        info!(
            servers = ?self.plan.desired(),
            disconnecting = plan.disconnect.len(),
            "orchestrator: reinit"
        );
        let _ = self.events.send(MonitorEvent::StoreReinitialised {
            servers: self.plan.desired().to_vec(),
        });

        if plan.connect_now {
            self.connect_all();
            return;
        }
        for name in &plan.disconnect {
            if let Some(transport) = self.transports.get(name) {
                transport.stop();
            }
        }
    }

    fn connect_all(&mut self) {
        for name in self.plan.connect_candidates() {
            let Some(endpoint) = self.resolver.resolve(&name) else {
                debug!(server = %name, "orchestrator: server not resolvable yet");
                continue;
            };
            let session = self.plan.register(&name);
            let settings = TransportSettings {
                store_epoch: self.store.epoch(),
                ..self.config.transport_settings(&name)
            };
            info!(server = %name, session, endpoint = %endpoint, epoch = settings.store_epoch, "orchestrator: connecting");
            let transport = SessionTransport::start(
                name.clone(),
                session,
                endpoint,
                settings,
                self.ingester.clone(),
                self.transport_tx.clone(),
            );
            self.transports.insert(name, transport);
        }
    }

    fn discovery_updated(&mut self) {
        let configured = self.config.server_names();
        let shrunk = configured
            .iter()
            .any(|name| !self.plan.desired().contains(name));
        if shrunk {
            info!(servers = ?configured, "orchestrator: restoring configured servers");
            self.reinit(configured);
        } else {
            self.connect_all();
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent {
            server,
            session,
            outcome,
        } = event;

        if outcome == TransportOutcome::Ready {
            if self.plan.is_current(&server, session) {
                let _ = self.events.send(MonitorEvent::ServerReady { server });
            }
            return;
        }

        match self.plan.classify(&server, session, &outcome) {
            Disconnection::Stale => {
                debug!(server = %server, session, "orchestrator: ignoring event from superseded session");
            }
            Disconnection::Expected { drained } => {
                info!(server = %server, drained, "orchestrator: session closed for reinit");
                self.forget(&server, session);
                self.lost(server, true, &outcome);
                if drained {
                    self.connect_due = Some(Instant::now() + self.config.reconnect_debounce());
                }
            }
            Disconnection::Unreachable => {
                info!(server = %server, "orchestrator: server unreachable, waiting for discovery");
                self.forget(&server, session);
                self.lost(server, false, &outcome);
            }
            Disconnection::Unexpected { remaining } => {
                warn!(server = %server, remaining = ?remaining, "orchestrator: unexpected disconnection");
                self.forget(&server, session);
                self.lost(server, false, &outcome);
                self.reinit(remaining);
            }
        }
    }

    fn forget(&mut self, server: &str, session: SessionId) {
        if self
            .transports
            .get(server)
            .is_some_and(|transport| transport.session() == session)
        {
            self.transports.remove(server);
        }
    }

    fn lost(&self, server: String, expected: bool, outcome: &TransportOutcome) {
        let reason = match outcome {
            TransportOutcome::Unreachable(reason) | TransportOutcome::Failed(reason) => reason.clone(),
            TransportOutcome::Closed | TransportOutcome::Ready => "closed".to_string(),
        };
        let _ = self.events.send(MonitorEvent::ServerLost {
            server,
            expected,
            reason,
        });
    }

    fn broadcast(&self, requests: &[ClientRequest]) {
        for transport in self.transports.values().filter(|t| t.is_connected()) {
            for request in requests {
                transport.send(request);
            }
        }
    }

    fn emergency_stop_all(&self) {
        warn!(sessions = self.transports.len(), "orchestrator: emergency stop");
        self.broadcast(&[ClientRequest::park_mount(), ClientRequest::cooler_off()]);
    }

    fn enable_all_previews(&self) {
        self.broadcast(&[
            ClientRequest::enable_previews(IMAGER_AGENT),
            ClientRequest::enable_previews(GUIDER_AGENT),
        ]);
    }

    fn apply_remote_command(&self, command: RemoteCommand) {
        if !command.is_fresh(Utc::now()) {
            warn!(kind = ?command.kind, issued_at = %command.issued_at, "orchestrator: discarding stale remote command");
            return;
        }
        info!(kind = ?command.kind, "orchestrator: remote command");
        match command.kind {
            RemoteCommandKind::EmergencyStop => self.emergency_stop_all(),
            RemoteCommandKind::EnablePreviews => self.enable_all_previews(),
        }
    }

    fn set_config(&mut self, config: MonitorConfig) -> Result<(), OrchestratorError> {
        if config == self.config {
            return Ok(());
        }
        self.config_store.save(&config)?;
        let servers_changed = config.server_names() != self.config.server_names();
        self.ingester.update_settings(config.ingest_settings());
        self.config = config;
        if servers_changed {
            self.reinit(self.config.server_names());
        }
        Ok(())
    }

    fn status(&self) -> OrchestratorStatus {
        let live = self.plan.live_names();
        let connected = live
            .iter()
            .filter(|name| {
                self.transports
                    .get(*name)
                    .is_some_and(SessionTransport::is_connected)
            })
            .cloned()
            .collect();
        OrchestratorStatus {
            desired: self.plan.desired().to_vec(),
            live,
            connected,
            pending_disconnect: self.plan.pending_disconnect(),
            reinits: self.plan.reinits(),
        }
    }

    fn stop_all(&self) {
        for transport in self.transports.values() {
            transport.stop();
        }
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
