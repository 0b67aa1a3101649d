use std::sync::atomic::{AtomicU64, Ordering};

use media_proto::protocol::{
    split_frame, Control, Outgoing, ProtocolError, Request, Response, Role, PROTOCOL_VERSION,
    UNKNOWN_MESSAGE_TYPE,
};
use media_proto::TabId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::core::CoordinatorEvent;
use crate::subscribers::SubscriberId;
use crate::tabs::TabRegistry;

/// Pending pushes per connection before the coordinator starts dropping
/// updates for it.
const OUTBOUND_QUEUE: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn start_server(
    bind_address: String,
    port: u16,
    registry: TabRegistry,
    event_tx: mpsc::Sender<CoordinatorEvent>,
    log_tx: broadcast::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, registry, event_tx, log_tx).await;
    })
}

/// Accept connections on an already bound listener until it fails for good.
pub async fn serve(
    listener: TcpListener,
    registry: TabRegistry,
    event_tx: mpsc::Sender<CoordinatorEvent>,
    log_tx: broadcast::Sender<String>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
                info!("Client {} connected from {}", id, peer);

                let registry = registry.clone();
                let event_tx = event_tx.clone();
                let log_tx = log_tx.clone();
                tokio::spawn(async move {
                    handle_client(stream, id, registry, event_tx, log_tx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Who greeted us on this connection.
enum Peer {
    /// No HELLO yet.  May query, control and ping; its reports carry no tab.
    Anonymous,
    Source { tab_id: Option<TabId> },
    Consumer { subscriber: SubscriberId },
    Browser,
}

enum Flow {
    Continue,
    Close,
}

struct Connection {
    id: u64,
    peer: Peer,
    out_tx: mpsc::Sender<Outgoing>,
    registry: TabRegistry,
    event_tx: mpsc::Sender<CoordinatorEvent>,
    log_tx: broadcast::Sender<String>,
    log_rx: Option<broadcast::Receiver<String>>,
}

async fn handle_client(
    stream: TcpStream,
    id: u64,
    registry: TabRegistry,
    event_tx: mpsc::Sender<CoordinatorEvent>,
    log_tx: broadcast::Sender<String>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(OUTBOUND_QUEUE);
    let mut conn = Connection {
        id,
        peer: Peer::Anonymous,
        out_tx,
        registry,
        event_tx,
        log_tx,
        log_rx: None,
    };

    let mut read_buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    'conn: loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let (body, consumed) = match split_frame(&read_buf) {
                                Ok(Some((body, consumed))) => (body.to_vec(), consumed),
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Client {} sent a bad frame: {}", id, e);
                                    break 'conn;
                                }
                            };
                            read_buf.drain(..consumed);

                            let (response, flow) = conn.handle_frame(&body).await;
                            if !write_message(&mut write_half, &Outgoing::Response(response)).await {
                                break 'conn;
                            }
                            if matches!(flow, Flow::Close) {
                                break 'conn;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", id, e);
                        break;
                    }
                }
            }

            Some(msg) = out_rx.recv() => {
                if !write_message(&mut write_half, &msg).await {
                    break;
                }
            }

            Some(message) = next_log(&mut conn.log_rx) => {
                let _ = write_message(&mut write_half, &Outgoing::Log { message }).await;
            }
        }
    }

    conn.close().await;
}

async fn next_log(rx: &mut Option<broadcast::Receiver<String>>) -> Option<String> {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(message) => return Some(message),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn write_message(write_half: &mut OwnedWriteHalf, msg: &Outgoing) -> bool {
    match msg.encode() {
        Ok(encoded) => write_half.write_all(&encoded).await.is_ok(),
        Err(e) => {
            error!("Failed to encode {:?}: {}", msg, e);
            true
        }
    }
}

impl Connection {
    fn tab_id(&self) -> Option<TabId> {
        match self.peer {
            Peer::Source { tab_id } => tab_id,
            _ => None,
        }
    }

    async fn handle_frame(&mut self, body: &[u8]) -> (Response, Flow) {
        match Request::parse(body) {
            Ok(request) => self.handle_request(request).await,
            Err(ProtocolError::UnknownType) => {
                debug!("Client {} sent an unknown message type", self.id);
                (Response::failure(UNKNOWN_MESSAGE_TYPE), Flow::Continue)
            }
            Err(e) => (Response::failure(e.to_string()), Flow::Continue),
        }
    }

    async fn handle_request(&mut self, request: Request) -> (Response, Flow) {
        match request {
            Request::Hello {
                protocol_version,
                role,
            } => self.hello(protocol_version, role).await,

            Request::MediaDetected { mut data, url, .. } => {
                if data.url.is_none() {
                    data.url = url.map(Some);
                }
                self.report(data).await
            }

            Request::MediaStateChanged { data, event, .. } => {
                debug!("Client {} media event {:?}", self.id, event);
                self.report(data).await
            }

            Request::CurrentState { data } => match data {
                Some(data) => self.report(data).await,
                None => (Response::ok(), Flow::Continue),
            },

            Request::GetMediaState => {
                let (tx, rx) = oneshot::channel();
                if !self.send(CoordinatorEvent::GetState(tx)).await {
                    return coordinator_gone();
                }
                match rx.await {
                    Ok(view) => (Response::state(view), Flow::Continue),
                    Err(_) => coordinator_gone(),
                }
            }

            Request::ListTabs => {
                let (tx, rx) = oneshot::channel();
                if !self.send(CoordinatorEvent::ListTabs(tx)).await {
                    return coordinator_gone();
                }
                match rx.await {
                    Ok(tabs) => (Response::tabs(tabs), Flow::Continue),
                    Err(_) => coordinator_gone(),
                }
            }

            Request::ControlMedia { action, data } => match Control::parse(&action, &data) {
                Ok(control) => {
                    info!("Client {} sent control: {:?}", self.id, control);
                    if self.send(CoordinatorEvent::Control(control)).await {
                        (Response::ok(), Flow::Continue)
                    } else {
                        coordinator_gone()
                    }
                }
                Err(e) => (Response::failure(e.to_string()), Flow::Continue),
            },

            Request::Ping => (Response::pong(), Flow::Continue),

            Request::TabUpdated { .. } | Request::TabRemoved { .. }
                if !matches!(self.peer, Peer::Browser) =>
            {
                warn!(
                    "Client {} sent a tab lifecycle message without the browser role",
                    self.id
                );
                (
                    Response::failure("tab lifecycle messages require the browser role"),
                    Flow::Continue,
                )
            }

            Request::TabUpdated {
                tab_id,
                url,
                complete,
            } => {
                self.registry.tab_updated(tab_id, url.clone()).await;
                let event = CoordinatorEvent::TabNavigated {
                    tab_id,
                    url,
                    complete,
                };
                self.ack(event).await
            }

            Request::TabRemoved { tab_id } => {
                self.registry.tab_removed(tab_id).await;
                self.ack(CoordinatorEvent::TabClosed(tab_id)).await
            }
        }
    }

    async fn hello(&mut self, protocol_version: u32, role: Role) -> (Response, Flow) {
        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Client {} speaks protocol {}, expected {}",
                self.id, protocol_version, PROTOCOL_VERSION
            );
            return (
                Response::failure(format!(
                    "protocol version mismatch: expected {}, got {}",
                    PROTOCOL_VERSION, protocol_version
                )),
                Flow::Close,
            );
        }
        if !matches!(self.peer, Peer::Anonymous) {
            return (Response::failure("already greeted"), Flow::Continue);
        }

        match role {
            Role::Source { tab_id, url } => {
                info!("Client {} is the source for tab {:?}", self.id, tab_id);
                if let Some(tab_id) = tab_id {
                    self.registry
                        .attach_source(tab_id, url, self.out_tx.clone())
                        .await;
                    // seed the record from whatever the source already sees
                    let _ = self.out_tx.try_send(Outgoing::GetCurrentState);
                }
                self.peer = Peer::Source { tab_id };
            }
            Role::Consumer => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let subscribe = CoordinatorEvent::Subscribe {
                    tx: self.out_tx.clone(),
                    reply: reply_tx,
                };
                if !self.send(subscribe).await {
                    return coordinator_gone();
                }
                let Ok(subscriber) = reply_rx.await else {
                    return coordinator_gone();
                };
                info!("Client {} subscribed as {:?}", self.id, subscriber);
                self.peer = Peer::Consumer { subscriber };
                self.log_rx = Some(self.log_tx.subscribe());

                // initial snapshot, like a MEDIA_UPDATE
                let (tx, rx) = oneshot::channel();
                if self.send(CoordinatorEvent::GetState(tx)).await {
                    if let Ok(view) = rx.await {
                        let _ = self.out_tx.try_send(Outgoing::MediaUpdate { data: view });
                    }
                }
            }
            Role::Browser => {
                info!("Client {} is the browser tab feed", self.id);
                self.registry.add_browser(self.id, self.out_tx.clone()).await;
                self.peer = Peer::Browser;
            }
        }
        (Response::welcome(), Flow::Continue)
    }

    async fn report(&mut self, report: media_proto::record::MediaReport) -> (Response, Flow) {
        let event = CoordinatorEvent::Report {
            tab_id: self.tab_id(),
            report,
        };
        self.ack(event).await
    }

    async fn ack(&mut self, event: CoordinatorEvent) -> (Response, Flow) {
        if self.send(event).await {
            (Response::ok(), Flow::Continue)
        } else {
            coordinator_gone()
        }
    }

    async fn send(&self, event: CoordinatorEvent) -> bool {
        if self.event_tx.send(event).await.is_err() {
            warn!("CoordinatorEvent channel closed");
            return false;
        }
        true
    }

    /// Undo whatever HELLO registered.
    async fn close(self) {
        match self.peer {
            Peer::Source {
                tab_id: Some(tab_id),
            } => {
                // the record stays; the staleness sweep drops it once the tab is unknown
                if self.registry.detach_source(tab_id, &self.out_tx).await {
                    debug!("Client {}: tab {} no longer known to the registry", self.id, tab_id);
                }
            }
            Peer::Consumer { subscriber } => {
                let _ = self
                    .event_tx
                    .send(CoordinatorEvent::Unsubscribe(subscriber))
                    .await;
            }
            Peer::Browser => self.registry.remove_browser(self.id).await,
            Peer::Source { tab_id: None } | Peer::Anonymous => {}
        }
    }
}

fn coordinator_gone() -> (Response, Flow) {
    (Response::failure("coordinator unavailable"), Flow::Close)
}
