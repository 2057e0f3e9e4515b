use std::{net::SocketAddr, sync::Arc, time::Duration};

use discovery::Endpoint;
use futures::{SinkExt, StreamExt};
use shared::protocol::ClientRequest;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::TransportError, store::StoreEpoch};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    ProbingRawSocket,
    ResolvingRemoteAddress,
    UpgradingSession,
    Connected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Ready,
    /// Probe or address resolution failed; no session was ever created.
    Unreachable(String),
    Failed(String),
    Closed,
}

impl TransportOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub server: String,
    pub session: SessionId,
    pub outcome: TransportOutcome,
}

pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, text: &str, link: &SessionLink);
}

#[derive(Debug, Clone)]
pub struct SessionLink {
    server: String,
    session: SessionId,
    epoch: StoreEpoch,
    image_base: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl SessionLink {
    pub fn new(
        server: impl Into<String>,
        session: SessionId,
        epoch: StoreEpoch,
        image_base: impl Into<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            server: server.into(),
            session,
            epoch,
            image_base: image_base.into(),
            outbound,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn epoch(&self) -> StoreEpoch {
        self.epoch
    }

    pub fn image_base(&self) -> &str {
        &self.image_base
    }

    pub fn send(&self, request: &ClientRequest) {
        if self.outbound.send(request.to_text()).is_err() {
            debug!(server = %self.server, "transport: session gone, dropping outbound request");
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub secure: bool,
    pub hello_delay: Duration,
    pub store_epoch: StoreEpoch,
}

pub struct SessionTransport {
    server: String,
    session: SessionId,
    state: watch::Receiver<TransportState>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionTransport {
    pub fn start(
        server: impl Into<String>,
        session: SessionId,
        endpoint: Endpoint,
        settings: TransportSettings,
        handler: Arc<dyn MessageHandler>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let server = server.into();
        let (state_tx, state) = watch::channel(TransportState::Idle);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = SessionDriver {
            server: server.clone(),
            session,
            endpoint,
            settings,
            handler,
            events,
            state: state_tx,
            outbound: outbound.clone(),
            outbound_rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            server,
            session,
            state,
            outbound,
            shutdown,
            task,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn send(&self, request: &ClientRequest) {
        if self.state().is_terminal() {
            return;
        }
        let _ = self.outbound.send(request.to_text());
    }

    /// Cancels the session. The terminal event still fires, exactly once.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct SessionDriver {
    server: String,
    session: SessionId,
    endpoint: Endpoint,
    settings: TransportSettings,
    handler: Arc<dyn MessageHandler>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<TransportState>,
    outbound: mpsc::UnboundedSender<String>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl SessionDriver {
    async fn run(mut self) {
        let outcome = match self.drive().await {
            Ok(()) => TransportOutcome::Closed,
            Err(err) if err.is_pre_session() => {
                warn!(server = %self.server, error = %err, "transport: server unreachable");
                TransportOutcome::Unreachable(err.to_string())
            }
            Err(err) => {
                warn!(server = %self.server, error = %err, "transport: session failed");
                TransportOutcome::Failed(err.to_string())
            }
        };

        self.enter(if outcome == TransportOutcome::Closed {
            TransportState::Closed
        } else {
            TransportState::Failed
        });
        self.emit(outcome);
    }

    async fn drive(&mut self) -> Result<(), TransportError> {
        self.enter(TransportState::ProbingRawSocket);
        let probe = tokio::select! {
            _ = self.shutdown.changed() => return Ok(()),
            probe = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)) => probe,
        };
        let probe = probe.map_err(|source| TransportError::Probe {
            endpoint: self.endpoint.to_string(),
            source,
        })?;

        self.enter(TransportState::ResolvingRemoteAddress);
        let remote = resolved_remote(&probe)
            .ok_or_else(|| TransportError::Unresolved(self.endpoint.to_string()))?;
        drop(probe);

        self.enter(TransportState::UpgradingSession);
        let url = session_url(self.settings.secure, remote)?;
        let upgrade = tokio::select! {
            _ = self.shutdown.changed() => return Ok(()),
            upgrade = connect_async(url.as_str()) => upgrade,
        };
        let (mut ws, _) = upgrade.map_err(|source| TransportError::Upgrade {
            url: url.to_string(),
            source: Box::new(source),
        })?;

        self.enter(TransportState::Connected);
        info!(server = %self.server, url = %url, "transport: session connected");
        self.emit(TransportOutcome::Ready);

        let link = SessionLink::new(
            self.server.clone(),
            self.session,
            self.settings.store_epoch,
            image_base(self.settings.secure, remote),
            self.outbound.clone(),
        );
        let hello = tokio::time::sleep(self.settings.hello_delay);
        tokio::pin!(hello);
        let mut hello_sent = false;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    debug!(server = %self.server, "transport: stop requested");
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                _ = &mut hello, if !hello_sent => {
                    hello_sent = true;
                    ws.send(Message::Text(ClientRequest::hello().to_text()))
                        .await
                        .map_err(|err| TransportError::Send(Box::new(err)))?;
                    debug!(server = %self.server, "transport: hello sent");
                }
                Some(text) = self.outbound_rx.recv() => {
                    ws.send(Message::Text(text))
                        .await
                        .map_err(|err| TransportError::Send(Box::new(err)))?;
                }
                inbound = ws.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handler.handle(&text, &link),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(server = %self.server, frame = ?frame, "transport: closed by peer");
                        return Ok(());
                    }
                    // Pings are answered by the websocket layer itself.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(TransportError::Receive(Box::new(err))),
                    None => return Ok(()),
                },
            }
        }
    }

    fn enter(&self, next: TransportState) {
        let previous = self.state.send_replace(next);
        debug!(server = %self.server, session = self.session, from = ?previous, to = ?next, "transport: state");
    }

    fn emit(&self, outcome: TransportOutcome) {
        let _ = self.events.send(TransportEvent {
            server: self.server.clone(),
            session: self.session,
            outcome,
        });
    }
}

fn resolved_remote(probe: &TcpStream) -> Option<SocketAddr> {
    let remote = probe.peer_addr().ok()?;
    if remote.ip().is_unspecified() || remote.port() == 0 {
        return None;
    }
    Some(remote)
}

pub fn session_url(secure: bool, remote: SocketAddr) -> Result<Url, TransportError> {
    let scheme = if secure { "wss" } else { "ws" };
    let raw = format!("{scheme}://{remote}/");
    Url::parse(&raw).map_err(|source| TransportError::InvalidUrl { url: raw, source })
}

pub fn image_base(secure: bool, remote: SocketAddr) -> String {
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{remote}")
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
