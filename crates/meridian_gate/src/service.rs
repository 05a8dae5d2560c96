//! The gate service: client listener, per-session tasks, and the dispatcher
//! link pump.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use meridian_proto::{
    read_packet, write_frame, BufferPool, DispatcherLink, ErrorKind, GateId, LinkConfig, Packet,
    SessionId,
};

use crate::fanout::fanout_targets;
use crate::session::SessionManager;

/// The one call a session may issue before it is bound to an entity.
const LOGIN_METHOD: &str = "Login";

/// Errors starting the gate service.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Failed to bind the client listen address.
    #[error("gate i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// This process's stable identity.
    pub gate_id: GateId,
    /// The dispatcher's listen address.
    pub dispatcher_addr: SocketAddr,
    /// Address clients connect to.
    pub client_bind_address: SocketAddr,
}

/// The gate process entry point.
pub struct GateNode;

impl GateNode {
    /// Binds the client listener and starts the dispatcher link.
    pub async fn start(config: GateConfig) -> Result<GateHandle, GateError> {
        let listener = TcpListener::bind(config.client_bind_address).await?;
        let client_addr = listener.local_addr()?;
        info!(gate = %config.gate_id, %client_addr, "gate listening for clients");

        let sessions = Arc::new(SessionManager::new());
        let gate_id = config.gate_id;
        let (link, inbound_rx) = DispatcherLink::start(
            LinkConfig::new(config.dispatcher_addr),
            Arc::new(move || vec![Packet::RegisterGate { gate: gate_id }]),
        );
        let link = Arc::new(link);
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(accept_loop(
            listener,
            gate_id,
            Arc::clone(&sessions),
            Arc::clone(&link),
            shutdown_tx.subscribe(),
        ));
        let pump = tokio::spawn(dispatcher_pump(
            inbound_rx,
            Arc::clone(&sessions),
            Arc::clone(&link),
            shutdown_tx.subscribe(),
        ));

        Ok(GateHandle {
            client_addr,
            sessions,
            shutdown: shutdown_tx,
            pump,
        })
    }
}

/// Handle to a running gate.
pub struct GateHandle {
    client_addr: SocketAddr,
    sessions: Arc<SessionManager>,
    shutdown: broadcast::Sender<()>,
    pump: JoinHandle<()>,
}

impl GateHandle {
    /// The bound client listen address.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops the gate.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.pump.await;
        info!("gate stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    gate: GateId,
    sessions: Arc<SessionManager>,
    link: Arc<DispatcherLink>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(serve_client(
                        stream,
                        addr,
                        gate,
                        Arc::clone(&sessions),
                        Arc::clone(&link),
                    ));
                }
                Err(err) => warn!(%err, "client accept failed"),
            },
        }
    }
}

// One task per client connection: reads framed calls off the socket and a
// writer drains the session's bounded outbound queue. Inbound never drops;
// the read loop simply stops reading while the dispatcher link is congested,
// which backpressures the client through TCP.
async fn serve_client(
    stream: TcpStream,
    addr: SocketAddr,
    gate: GateId,
    sessions: Arc<SessionManager>,
    link: Arc<DispatcherLink>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (session, mut outbound_rx) = sessions.add_session(addr);
    link.send(Packet::ClientConnect { session, gate });

    let writer_task = tokio::spawn(async move {
        let mut payload = bytes::BytesMut::new();
        while let Some(packet) = outbound_rx.recv().await {
            payload.clear();
            packet.encode_payload(&mut payload);
            if write_frame(&mut writer, packet.wire_type(), &payload)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let pool = BufferPool::new();
    loop {
        match read_packet(&mut reader, &pool).await {
            Ok(Packet::ClientCall { method, args, .. }) => {
                // Unbound sessions get exactly one verb.
                if !sessions.is_bound(session) && method != LOGIN_METHOD {
                    debug!(%session, method, "call from unbound session rejected");
                    let _ = sessions.try_deliver(
                        session,
                        Packet::ErrorNotify {
                            kind: ErrorKind::UnknownEntity,
                            about: None,
                            detail: "session is not bound yet".into(),
                        },
                    );
                    continue;
                }
                link.send(Packet::ClientCall {
                    session,
                    method,
                    args,
                });
            }
            Ok(other) => {
                warn!(%session, packet = ?other, "unexpected client packet, dropping connection");
                break;
            }
            Err(err) => {
                if !err.is_connection_error() {
                    warn!(%session, %err, "client protocol error, dropping connection");
                }
                break;
            }
        }
    }

    sessions.remove_session(session);
    link.send(Packet::ClientDisconnect { session });
    writer_task.abort();
}

// Pumps the dispatcher link: bindings and membership maintain the session
// table, deltas fan out to their subscribers, and any session whose queue
// overflows is dropped on the spot.
async fn dispatcher_pump(
    mut inbound: mpsc::Receiver<Packet>,
    sessions: Arc<SessionManager>,
    link: Arc<DispatcherLink>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.recv() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        match &packet {
            Packet::BindClient {
                session, entity, ..
            } => {
                sessions.bind(*session, *entity);
                deliver_or_kick(&sessions, &link, *session, packet.clone());
            }
            Packet::SpaceEntered { entity, space, .. } => {
                sessions.entity_entered_space(*entity, *space);
                for session in sessions.sessions_in_space(*space) {
                    deliver_or_kick(&sessions, &link, session, packet.clone());
                }
            }
            Packet::SpaceLeft { entity, space } => {
                // Tell the leaver and its former cohabitants, then unsubscribe.
                let mut audience = sessions.sessions_in_space(*space);
                if let Some(own) = sessions.session_for(*entity) {
                    if !audience.contains(&own) {
                        audience.push(own);
                    }
                }
                sessions.entity_left_space(*entity, *space);
                for session in audience {
                    deliver_or_kick(&sessions, &link, session, packet.clone());
                }
            }
            Packet::AttrSet { .. }
            | Packet::AttrDel { .. }
            | Packet::ListAppend { .. }
            | Packet::ListPop { .. } => {
                for session in fanout_targets(&sessions, &packet) {
                    deliver_or_kick(&sessions, &link, session, packet.clone());
                }
            }
            Packet::ErrorNotify { kind, detail, .. } => {
                debug!(%kind, detail, "dispatcher error notification");
            }
            other => debug!(packet = ?other, "unexpected packet at gate dropped"),
        }
    }
}

fn deliver_or_kick(
    sessions: &SessionManager,
    link: &DispatcherLink,
    session: SessionId,
    packet: Packet,
) {
    if !sessions.try_deliver(session, packet) {
        sessions.remove_session(session);
        link.send(Packet::ClientDisconnect { session });
    }
}
