//! The dispatcher service: TCP endpoint, peer connections, and the actor
//! that owns the routing table.
//!
//! Servers and gates dial the single listen address and identify themselves
//! with a `RegisterServer`/`RegisterGate` packet before anything else. Each
//! connection gets one reader task (decode, forward to the actor) and one
//! coalescing writer task; the actor is the only task that touches routing
//! state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meridian_proto::{read_packet, run_coalescing_writer, BufferPool, Packet, COALESCE_DELAY};

use crate::routing::{Destination, Outbox, Peer, RoutingTable};

/// Capacity of the actor's inbound command queue. A full queue blocks the
/// connection readers, which backpressures the peers.
pub const PACKET_QUEUE_SIZE: usize = 10_000;

/// How often migration deadlines are checked.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Errors starting or running the dispatcher service.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// Failed to bind or accept on the listen address.
    #[error("dispatcher i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Address all servers and gates dial.
    pub bind_address: SocketAddr,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7100".parse().expect("valid default address"),
        }
    }
}

enum Command {
    Connected {
        peer: Peer,
        writer: mpsc::UnboundedSender<Packet>,
    },
    Disconnected {
        peer: Peer,
    },
    Incoming {
        peer: Peer,
        packet: Packet,
    },
    Sweep,
}

/// The dispatcher process entry point.
pub struct Dispatcher;

impl Dispatcher {
    /// Binds the listen address and starts the routing actor.
    ///
    /// Returns a handle owning the service; dropping it does not stop the
    /// dispatcher; call [`DispatcherHandle::stop`].
    pub async fn start(config: DispatcherConfig) -> Result<DispatcherHandle, DispatcherError> {
        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "dispatcher listening");

        let (command_tx, command_rx) = mpsc::channel(PACKET_QUEUE_SIZE);
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(accept_loop(
            listener,
            command_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(sweep_loop(command_tx, shutdown_tx.subscribe()));
        let actor = tokio::spawn(actor_loop(command_rx, shutdown_tx.subscribe()));

        Ok(DispatcherHandle {
            local_addr,
            shutdown: shutdown_tx,
            actor,
        })
    }
}

/// Handle to a running dispatcher.
pub struct DispatcherHandle {
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    actor: JoinHandle<()>,
}

impl DispatcherHandle {
    /// The bound listen address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the service and waits for the routing actor to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.actor.await;
        info!("dispatcher stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    commands: mpsc::Sender<Command>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "peer connected");
                    tokio::spawn(serve_connection(stream, commands.clone()));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            },
        }
    }
}

async fn sweep_loop(commands: mpsc::Sender<Command>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                // Skip a beat rather than queue sweeps behind a full queue.
                let _ = commands.try_send(Command::Sweep);
            }
        }
    }
}

async fn actor_loop(mut commands: mpsc::Receiver<Command>, mut shutdown: broadcast::Receiver<()>) {
    let mut table = RoutingTable::new();
    let mut conns: HashMap<Peer, mpsc::UnboundedSender<Packet>> = HashMap::new();
    let mut out: Outbox = Vec::new();

    loop {
        let command = tokio::select! {
            _ = shutdown.recv() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Connected { peer, writer } => {
                if conns.insert(peer, writer).is_some() {
                    warn!(?peer, "peer reconnected, replacing stale connection");
                }
                match peer {
                    Peer::Server(server) => table.add_server(server),
                    Peer::Gate(gate) => table.add_gate(gate),
                }
                info!(?peer, "peer registered");
            }
            Command::Disconnected { peer } => {
                conns.remove(&peer);
                match peer {
                    Peer::Server(server) => table.remove_server(server, &mut out),
                    Peer::Gate(gate) => table.remove_gate(gate, &mut out),
                }
                info!(?peer, "peer disconnected");
            }
            Command::Incoming { peer, packet } => {
                table.handle(peer, packet, Instant::now(), &mut out);
            }
            Command::Sweep => {
                table.sweep_deadlines(Instant::now(), &mut out);
            }
        }

        deliver(&table, &conns, &mut out);
    }
}

fn deliver(
    table: &RoutingTable,
    conns: &HashMap<Peer, mpsc::UnboundedSender<Packet>>,
    out: &mut Outbox,
) {
    for (dest, packet) in out.drain(..) {
        match dest {
            Destination::Server(server) => {
                send_to(conns, Peer::Server(server), packet);
            }
            Destination::Gate(gate) => {
                send_to(conns, Peer::Gate(gate), packet);
            }
            Destination::AllGates => {
                for gate in table.gates() {
                    send_to(conns, Peer::Gate(gate), packet.clone());
                }
            }
        }
    }
}

fn send_to(conns: &HashMap<Peer, mpsc::UnboundedSender<Packet>>, peer: Peer, packet: Packet) {
    match conns.get(&peer) {
        Some(writer) => {
            if writer.send(packet).is_err() {
                debug!(?peer, "writer gone, packet dropped");
            }
        }
        None => debug!(?peer, "no connection, packet dropped"),
    }
}

// One reader per connection. The peer must identify itself first; after
// that, every decoded packet is forwarded to the actor in order. A decode
// failure is a peer bug and drops the connection.
async fn serve_connection(stream: TcpStream, commands: mpsc::Sender<Command>) {
    let addr = stream.peer_addr().ok();
    let (mut reader, writer_half) = stream.into_split();
    let pool = BufferPool::new();

    let peer = match read_packet(&mut reader, &pool).await {
        Ok(Packet::RegisterServer { server }) => Peer::Server(server),
        Ok(Packet::RegisterGate { gate }) => Peer::Gate(gate),
        Ok(other) => {
            warn!(?addr, packet = ?other, "peer sent packets before registering, dropping");
            return;
        }
        Err(err) => {
            debug!(?addr, %err, "connection closed before registration");
            return;
        }
    };

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(err) = run_coalescing_writer(writer_half, writer_rx, COALESCE_DELAY).await {
            debug!(%err, "peer writer stopped");
        }
    });

    if commands
        .send(Command::Connected {
            peer,
            writer: writer_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        match read_packet(&mut reader, &pool).await {
            Ok(packet) => {
                // A full actor queue blocks here, backpressuring the peer.
                if commands
                    .send(Command::Incoming { peer, packet })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                if err.is_connection_error() {
                    debug!(?peer, %err, "peer connection closed");
                } else {
                    warn!(?peer, %err, "protocol error, dropping connection");
                }
                break;
            }
        }
    }

    let _ = commands.send(Command::Disconnected { peer }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_proto::{write_frame, EntityId, ServerId, Value};
    use bytes::BytesMut;

    async fn connect_server(addr: SocketAddr, id: u16) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let mut payload = BytesMut::new();
        let packet = Packet::RegisterServer {
            server: ServerId(id),
        };
        packet.encode_payload(&mut payload);
        write_frame(&mut stream, packet.wire_type(), &payload)
            .await
            .expect("register");
        stream
    }

    async fn send(stream: &mut TcpStream, packet: Packet) {
        let mut payload = BytesMut::new();
        packet.encode_payload(&mut payload);
        write_frame(stream, packet.wire_type(), &payload)
            .await
            .expect("send");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn routes_calls_between_registered_servers() {
        let handle = Dispatcher::start(DispatcherConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .expect("start");
        let addr = handle.local_addr();

        let mut server_a = connect_server(addr, 1).await;
        let mut server_b = connect_server(addr, 2).await;
        let pool = BufferPool::new();

        let entity = EntityId::new();
        send(
            &mut server_a,
            Packet::RegisterEntity {
                entity,
                type_name: "Avatar".into(),
                space: None,
                space_kind: None,
            },
        )
        .await;
        send(
            &mut server_b,
            Packet::Call {
                from: None,
                to: entity,
                method: "Foo".into(),
                args: vec![Value::Int(1)],
            },
        )
        .await;

        let routed = read_packet(&mut server_a, &pool).await.expect("routed");
        match routed {
            Packet::Call { to, method, args, .. } => {
                assert_eq!(to, entity);
                assert_eq!(method, "Foo");
                assert_eq!(args, vec![Value::Int(1)]);
            }
            other => panic!("expected call, got {other:?}"),
        }

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_entity_bounces_to_sender() {
        let handle = Dispatcher::start(DispatcherConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .expect("start");
        let addr = handle.local_addr();

        let mut server_a = connect_server(addr, 1).await;
        let pool = BufferPool::new();

        let ghost = EntityId::new();
        send(
            &mut server_a,
            Packet::Call {
                from: None,
                to: ghost,
                method: "Foo".into(),
                args: vec![],
            },
        )
        .await;

        let bounced = read_packet(&mut server_a, &pool).await.expect("bounced");
        assert!(matches!(
            bounced,
            Packet::ErrorNotify {
                kind: meridian_proto::ErrorKind::UnknownEntity,
                about: Some(about),
                ..
            } if about == ghost
        ));

        handle.stop().await;
    }
}
