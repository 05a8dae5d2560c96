//! The resilient dispatcher link used by servers and gates.
//!
//! One persistent TCP connection per process, with ordered asynchronous send
//! and an incoming-packet channel for the host. The writer batches frames for
//! up to [`COALESCE_DELAY`]; the reader decodes into a bounded queue whose
//! fullness backpressures the dispatcher.
//!
//! Two send queues, one policy each (the split a reconnect forces):
//!
//! * **control**: entity-control packets. Held across a disconnect and
//!   resent once the link recovers and the host has re-registered.
//! * **transient**: client-bound attribute deltas. Dropped on disconnect;
//!   a reconnecting client gets fresh state anyway.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{read_packet, COALESCE_DELAY};
use crate::packets::Packet;
use crate::pool::BufferPool;

/// Capacity of the inbound packet queue handed to the host.
pub const PACKET_QUEUE_SIZE: usize = 10_000;

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// The dispatcher's listen address.
    pub dispatcher_addr: SocketAddr,
    /// First reconnect delay; doubles per failure.
    pub initial_reconnect_delay: Duration,
    /// Reconnect delay cap.
    pub max_reconnect_delay: Duration,
}

impl LinkConfig {
    /// A config with default backoff for the given dispatcher address.
    pub fn new(dispatcher_addr: SocketAddr) -> Self {
        Self {
            dispatcher_addr,
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Supplies the identity and re-registration packets sent after every
/// (re)connect: the `RegisterServer`/`RegisterGate` identity first, then the
/// host's owned-entity list so the dispatcher can rebuild routing state.
pub type RegistrationFn = dyn Fn() -> Vec<Packet> + Send + Sync;

#[derive(Default)]
struct SendQueues {
    control: VecDeque<Packet>,
    transient: VecDeque<Packet>,
}

/// Handle to the dispatcher link.
pub struct DispatcherLink {
    queues: Arc<Mutex<SendQueues>>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl DispatcherLink {
    /// Starts the link and returns it with the inbound packet queue.
    ///
    /// `registration` is invoked on every successful connect; its packets are
    /// sent before anything queued.
    pub fn start(
        config: LinkConfig,
        registration: Arc<RegistrationFn>,
    ) -> (Self, mpsc::Receiver<Packet>) {
        let queues = Arc::new(Mutex::new(SendQueues::default()));
        let wake = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_QUEUE_SIZE);

        let task = tokio::spawn(link_task(
            config,
            registration,
            Arc::clone(&queues),
            Arc::clone(&wake),
            Arc::clone(&shutdown),
            inbound_tx,
        ));

        (
            Self {
                queues,
                wake,
                shutdown,
                task,
            },
            inbound_rx,
        )
    }

    /// Queues a packet for ordered send.
    ///
    /// Entity-control packets survive a reconnect; transient deltas are
    /// dropped if the link is down when their turn comes.
    pub fn send(&self, packet: Packet) {
        {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            if packet.is_entity_control() {
                queues.control.push_back(packet);
            } else {
                queues.transient.push_back(packet);
            }
        }
        self.wake.notify_one();
    }

    /// Stops the link task.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }
}

async fn link_task(
    config: LinkConfig,
    registration: Arc<RegistrationFn>,
    queues: Arc<Mutex<SendQueues>>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    inbound_tx: mpsc::Sender<Packet>,
) {
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        let stream = tokio::select! {
            _ = shutdown.notified() => return,
            connected = TcpStream::connect(config.dispatcher_addr) => match connected {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%err, delay = ?reconnect_delay, "dispatcher unreachable, backing off");
                    // Transient deltas do not outlive the disconnect.
                    queues.lock().unwrap_or_else(|e| e.into_inner()).transient.clear();
                    tokio::select! {
                        _ = shutdown.notified() => return,
                        _ = tokio::time::sleep(jittered(reconnect_delay)) => {}
                    }
                    reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
                    continue;
                }
            },
        };

        info!(addr = %config.dispatcher_addr, "dispatcher link up");
        reconnect_delay = config.initial_reconnect_delay;

        // Identity and owned-entity list go ahead of everything queued.
        {
            let mut locked = queues.lock().unwrap_or_else(|e| e.into_inner());
            for packet in registration().into_iter().rev() {
                locked.control.push_front(packet);
            }
        }
        wake.notify_one();

        match run_connection(stream, &queues, &wake, &shutdown, &inbound_tx).await {
            SessionEnd::Shutdown => return,
            SessionEnd::ConnectionLost => {
                warn!("dispatcher link down, reconnecting");
                queues.lock().unwrap_or_else(|e| e.into_inner()).transient.clear();
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    ConnectionLost,
}

// Runs one connected session until the connection fails or shutdown is
// requested.
async fn run_connection(
    stream: TcpStream,
    queues: &Arc<Mutex<SendQueues>>,
    wake: &Arc<Notify>,
    shutdown: &Arc<Notify>,
    inbound_tx: &mpsc::Sender<Packet>,
) -> SessionEnd {
    let (mut read_half, mut write_half) = stream.into_split();
    let inbound = inbound_tx.clone();

    let mut reader = tokio::spawn(async move {
        let pool = BufferPool::new();
        loop {
            match read_packet(&mut read_half, &pool).await {
                // A full host queue blocks here: backpressure to the
                // dispatcher instead of unbounded buffering.
                Ok(packet) => {
                    if inbound.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if !err.is_connection_error() {
                        warn!(%err, "protocol error on dispatcher link");
                    }
                    break;
                }
            }
        }
    });

    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                reader.abort();
                return SessionEnd::Shutdown;
            }
            _ = &mut reader => return SessionEnd::ConnectionLost,
            _ = wake.notified() => {}
        }

        // Coalesce: let the delay window fill the queues before flushing.
        tokio::time::sleep(COALESCE_DELAY).await;
        let batch: Vec<Packet> = {
            let mut locked = queues.lock().unwrap_or_else(|e| e.into_inner());
            let mut items: Vec<Packet> = locked.control.drain(..).collect();
            items.extend(locked.transient.drain(..));
            items
        };
        if batch.is_empty() {
            continue;
        }

        buf.clear();
        let mut encode_failed = false;
        for packet in &batch {
            if let Err(err) = packet.encode_frame(&mut buf) {
                warn!(%err, "dropping unencodable packet");
                encode_failed = true;
            }
        }
        if encode_failed && buf.is_empty() {
            continue;
        }

        if let Err(err) = async {
            write_half.write_all(&buf).await?;
            write_half.flush().await
        }
        .await
        {
            debug!(%err, "dispatcher write failed");
            // Control packets go back to the head for resend after
            // reconnect; transient deltas from this batch are dropped.
            let mut locked = queues.lock().unwrap_or_else(|e| e.into_inner());
            for packet in batch.into_iter().rev().filter(Packet::is_entity_control) {
                locked.control.push_front(packet);
            }
            reader.abort();
            return SessionEnd::ConnectionLost;
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    delay.mul_f64(1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::write_frame;
    use crate::ids::{EntityId, ServerId};
    use tokio::net::TcpListener;

    fn identity(id: u16) -> Arc<RegistrationFn> {
        Arc::new(move || vec![Packet::RegisterServer { server: ServerId(id) }])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sends_identity_then_queued_control_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let (link, _inbound) = DispatcherLink::start(LinkConfig::new(addr), identity(7));
        let entity = EntityId::new();
        link.send(Packet::RegisterEntity {
            entity,
            type_name: "Avatar".into(),
            space: None,
            space_kind: None,
        });

        let (mut peer, _) = listener.accept().await.expect("accept");
        let pool = BufferPool::new();
        let first = read_packet(&mut peer, &pool).await.expect("identity");
        assert_eq!(first, Packet::RegisterServer { server: ServerId(7) });
        let second = read_packet(&mut peer, &pool).await.expect("registration");
        assert!(matches!(second, Packet::RegisterEntity { entity: e, .. } if e == entity));

        link.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbound_packets_reach_the_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let (link, mut inbound) = DispatcherLink::start(LinkConfig::new(addr), identity(1));
        let (mut peer, _) = listener.accept().await.expect("accept");

        let packet = Packet::MigrateAck {
            entity: EntityId::new(),
        };
        let mut payload = BytesMut::new();
        packet.encode_payload(&mut payload);
        write_frame(&mut peer, packet.wire_type(), &payload)
            .await
            .expect("write");

        let received = inbound.recv().await.expect("inbound");
        assert_eq!(received, packet);

        link.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn control_packets_survive_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let mut config = LinkConfig::new(addr);
        config.initial_reconnect_delay = Duration::from_millis(10);
        let (link, _inbound) = DispatcherLink::start(config, identity(3));

        // First connection: read the identity, then drop the socket and give
        // the link time to notice.
        {
            let (mut peer, _) = listener.accept().await.expect("accept");
            let pool = BufferPool::new();
            let _ = read_packet(&mut peer, &pool).await.expect("identity");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Queued across the reconnect: control is retained and resent after
        // the identity; the transient tick may or may not survive.
        let entity = EntityId::new();
        link.send(Packet::StartMigrate {
            entity,
            to: ServerId(2),
            space: None,
        });
        link.send(Packet::Tick);

        let (mut peer, _) = listener.accept().await.expect("reconnect");
        let pool = BufferPool::new();
        let first = read_packet(&mut peer, &pool).await.expect("identity again");
        assert_eq!(first, Packet::RegisterServer { server: ServerId(3) });
        let second = read_packet(&mut peer, &pool).await.expect("resent control");
        assert!(matches!(second, Packet::StartMigrate { entity: e, .. } if e == entity));

        link.stop().await;
    }
}
