//! The server orchestration core.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use meridian_entity::{
    seed_from_blob, spawn_entity, EntityCommand, EntityId, EntityRegistry, EntitySeed,
    EntityTypeRegistry, HostEvent, ServerId, SessionId, TimerWheel, SERVER_TICK_INTERVAL,
};
use meridian_proto::{
    DispatcherLink, ErrorKind, GateId, LinkConfig, Packet, Value,
};
use meridian_storage::{KvStore, StorageError};

use crate::space::EnterSpacePending;

/// How often dirty persistent entities are written out.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(300);

/// Errors surfaced by the server runtime.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A request named an unregistered entity type.
    #[error("unknown entity type {0:?}")]
    UnknownType(String),

    /// The server task has stopped.
    #[error("server is not running")]
    NotRunning,

    /// Network failure while starting.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This process's stable identity.
    pub server_id: ServerId,
    /// The dispatcher's listen address.
    pub dispatcher_addr: SocketAddr,
    /// Entity type created and bound for each fresh client session.
    pub account_entity_type: Option<String>,
    /// Interval between persistence passes over dirty entities.
    pub save_interval: Duration,
}

impl ServerConfig {
    /// A config with defaults for everything but identity and address.
    pub fn new(server_id: ServerId, dispatcher_addr: SocketAddr) -> Self {
        Self {
            server_id,
            dispatcher_addr,
            account_entity_type: None,
            save_interval: SAVE_INTERVAL,
        }
    }
}

/// External requests into the running server.
enum Api {
    CreateEntity {
        type_name: String,
        reply: oneshot::Sender<Result<EntityId, ServerError>>,
    },
    CallEntity {
        entity: EntityId,
        method: String,
        args: Vec<Value>,
    },
    Hosted {
        reply: oneshot::Sender<Vec<(EntityId, String)>>,
    },
}

/// Bookkeeping messages from helper tasks back into the core.
pub(crate) enum Internal {
    Frozen { entity: EntityId, blob: Vec<u8> },
    SaveDeferred { entity: EntityId },
}

/// The server process entry point.
pub struct ServerNode;

impl ServerNode {
    /// Starts the server runtime and its dispatcher link.
    pub fn start(
        config: ServerConfig,
        types: Arc<EntityTypeRegistry>,
        storage: Option<Arc<KvStore>>,
    ) -> ServerHandle {
        let registry = Arc::new(EntityRegistry::new());
        let wheel = Arc::new(TimerWheel::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (api_tx, api_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // The dispatcher rebuilds our routing state from this list on every
        // reconnect.
        let reg_registry = Arc::clone(&registry);
        let reg_types = Arc::clone(&types);
        let server_id = config.server_id;
        let (link, inbound_rx) = DispatcherLink::start(
            LinkConfig::new(config.dispatcher_addr),
            Arc::new(move || {
                let mut packets = vec![Packet::RegisterServer { server: server_id }];
                for (entity, type_name) in reg_registry.hosted() {
                    let space_kind = reg_types
                        .get(&type_name)
                        .and_then(|t| t.space_kind_value());
                    packets.push(Packet::RegisterEntity {
                        entity,
                        type_name,
                        space: reg_registry.space_of(entity),
                        space_kind,
                    });
                }
                packets
            }),
        );

        let core = Core {
            config,
            types,
            storage,
            registry,
            wheel,
            link,
            events_tx,
            internal_tx,
            bound: HashMap::new(),
            dirty: HashSet::new(),
            frozen: HashMap::new(),
            enter_pending: HashMap::new(),
        };
        let join = tokio::spawn(core.run(inbound_rx, events_rx, api_rx, internal_rx, shutdown_rx));

        ServerHandle {
            api: api_tx,
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    api: mpsc::Sender<Api>,
    shutdown: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Creates an entity of a registered type on this server.
    pub async fn create_entity(&self, type_name: &str) -> Result<EntityId, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.api
            .send(Api::CreateEntity {
                type_name: type_name.to_string(),
                reply,
            })
            .await
            .map_err(|_| ServerError::NotRunning)?;
        rx.await.map_err(|_| ServerError::NotRunning)?
    }

    /// Submits a call to an entity (local shortcut or routed via the
    /// dispatcher).
    pub async fn call_entity(
        &self,
        entity: EntityId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), ServerError> {
        self.api
            .send(Api::CallEntity {
                entity,
                method: method.to_string(),
                args,
            })
            .await
            .map_err(|_| ServerError::NotRunning)
    }

    /// Ids and types of entities hosted right now.
    pub async fn hosted_entities(&self) -> Result<Vec<(EntityId, String)>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.api
            .send(Api::Hosted { reply })
            .await
            .map_err(|_| ServerError::NotRunning)?;
        rx.await.map_err(|_| ServerError::NotRunning)
    }

    /// Stops the server runtime.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

pub(crate) struct Core {
    pub(crate) config: ServerConfig,
    pub(crate) types: Arc<EntityTypeRegistry>,
    pub(crate) storage: Option<Arc<KvStore>>,
    pub(crate) registry: Arc<EntityRegistry>,
    pub(crate) wheel: Arc<TimerWheel>,
    pub(crate) link: DispatcherLink,
    pub(crate) events_tx: mpsc::UnboundedSender<HostEvent>,
    pub(crate) internal_tx: mpsc::UnboundedSender<Internal>,
    /// Sessions bound to entities hosted here.
    pub(crate) bound: HashMap<SessionId, EntityId>,
    /// Entities with unsaved persistent changes.
    pub(crate) dirty: HashSet<EntityId>,
    /// Snapshots held from freeze until `MigrateFinish`, for rollback.
    pub(crate) frozen: HashMap<EntityId, Vec<u8>>,
    /// Outstanding enter-space operations awaiting the dispatcher.
    pub(crate) enter_pending: HashMap<EntityId, EnterSpacePending>,
}

impl Core {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Packet>,
        mut events: mpsc::UnboundedReceiver<HostEvent>,
        mut api: mpsc::Receiver<Api>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(server = %self.config.server_id, "server runtime started");
        let mut tick = tokio::time::interval(SERVER_TICK_INTERVAL);
        let mut save_tick = tokio::time::interval(self.config.save_interval);
        save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                // Dispatcher packets are consumed strictly in arrival order.
                packet = inbound.recv() => match packet {
                    Some(packet) => self.handle_packet(packet),
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                message = internal.recv() => {
                    if let Some(message) = message {
                        self.handle_internal(message);
                    }
                }
                request = api.recv() => {
                    if let Some(request) = request {
                        self.handle_api(request);
                    }
                }
                _ = tick.tick() => self.on_tick(),
                _ = save_tick.tick() => self.save_dirty(),
            }
        }

        self.save_dirty();
        self.link.stop().await;
        info!(server = %self.config.server_id, "server runtime stopped");
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Call {
                from,
                to,
                method,
                args,
            } => match self.registry.get(to) {
                Some(handle) => {
                    handle.post(EntityCommand::Call { from, method, args });
                }
                None => warn!(entity = %to, method, "call for entity not hosted here dropped"),
            },
            Packet::ClientConnect { session, gate } => self.on_client_connect(session, gate),
            Packet::ClientDisconnect { session } => {
                if let Some(entity) = self.bound.remove(&session) {
                    if let Some(handle) = self.registry.get(entity) {
                        handle.post(EntityCommand::UnbindClient);
                    }
                }
            }
            Packet::BindClient {
                session,
                gate,
                entity,
            } => {
                if let Some(handle) = self.registry.get(entity) {
                    self.bound.insert(session, entity);
                    handle.post(EntityCommand::BindClient { session, gate });
                    // Confirm so the dispatcher records the binding and the
                    // gate learns of it.
                    self.link.send(Packet::BindClient {
                        session,
                        gate,
                        entity,
                    });
                } else {
                    warn!(%entity, %session, "bind request for entity not hosted here dropped");
                }
            }
            Packet::MigrateAck { entity } => self.on_migrate_ack(entity),
            Packet::MigrateData { entity, blob } => self.on_migrate_in(entity, blob),
            Packet::MigrateFinish { entity } => {
                self.frozen.remove(&entity);
                self.enter_pending.remove(&entity);
                self.dirty.remove(&entity);
                debug!(%entity, "migration finished, local copy discarded");
            }
            Packet::MigrateAbort { entity, reason } => self.on_migrate_abort(entity, reason),
            Packet::LocalEnterSpace { entity, space } => self.on_local_enter_space(entity, space),
            Packet::EnterSpaceResolved {
                entity,
                space,
                server,
            } => {
                debug!(%entity, %space, %server, "space is remote, migrating");
                self.link.send(Packet::StartMigrate {
                    entity,
                    to: server,
                    space: Some(space),
                });
            }
            Packet::EnterSpaceFailed {
                entity,
                space,
                reason,
            } => self.fail_enter_space(entity, space, &reason),
            Packet::CreateEntityRequest { type_name, space } => {
                match self.create_entity(&type_name) {
                    Ok(entity) => {
                        if let Some(space) = space {
                            self.request_enter_space(entity, space);
                        }
                    }
                    Err(err) => warn!(type_name, %err, "dispatcher-requested creation failed"),
                }
            }
            Packet::ErrorNotify {
                kind,
                about,
                detail,
            } => self.on_error_notify(kind, about, detail),
            other => debug!(packet = ?other, "unexpected packet at server dropped"),
        }
    }

    fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Packet(packet) => match packet {
                // Local calls shortcut the dispatcher and keep FIFO through
                // the target's own mailbox.
                Packet::Call {
                    from,
                    to,
                    method,
                    args,
                } if self.registry.contains(to) => {
                    if let Some(handle) = self.registry.get(to) {
                        handle.post(EntityCommand::Call { from, method, args });
                    }
                }
                Packet::SpaceEntered {
                    entity,
                    space,
                    kind,
                } => {
                    self.registry.add_member(space, entity);
                    self.link.send(Packet::SpaceEntered {
                        entity,
                        space,
                        kind,
                    });
                }
                Packet::SpaceLeft { entity, space } => {
                    self.registry.remove_member(space, entity);
                    self.link.send(Packet::SpaceLeft { entity, space });
                }
                other => self.link.send(other),
            },
            HostEvent::Dirty(entity) => {
                self.dirty.insert(entity);
            }
            HostEvent::Destroyed { entity, snapshot } => self.on_destroyed(entity, snapshot),
            HostEvent::CreateEntity { type_name, space, by } => {
                match self.create_entity(&type_name) {
                    Ok(entity) => {
                        if let Some(space) = space {
                            self.request_enter_space(entity, space);
                        }
                    }
                    Err(err) => warn!(type_name, creator = %by, %err, "entity creation failed"),
                }
            }
            HostEvent::EnterSpace { entity, space } => self.request_enter_space(entity, space),
            HostEvent::LeaveSpace { entity } => self.local_leave_space(entity),
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Frozen { entity, blob } => {
                self.frozen.insert(entity, blob.clone());
                self.link.send(Packet::MigrateData { entity, blob });
            }
            Internal::SaveDeferred { entity } => {
                // Retried on the next save pass.
                if self.registry.contains(entity) {
                    self.dirty.insert(entity);
                }
            }
        }
    }

    fn handle_api(&mut self, request: Api) {
        match request {
            Api::CreateEntity { type_name, reply } => {
                let _ = reply.send(self.create_entity(&type_name));
            }
            Api::CallEntity {
                entity,
                method,
                args,
            } => match self.registry.get(entity) {
                Some(handle) => {
                    handle.post(EntityCommand::Call {
                        from: None,
                        method,
                        args,
                    });
                }
                None => self.link.send(Packet::Call {
                    from: None,
                    to: entity,
                    method,
                    args,
                }),
            },
            Api::Hosted { reply } => {
                let _ = reply.send(self.registry.hosted());
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        for (owner, timer) in self.wheel.collect_due(now) {
            if let Some(handle) = self.registry.get(owner) {
                handle.post(EntityCommand::TimerFired { timer });
            }
        }

        let expired: Vec<(EntityId, EntityId)> = self
            .enter_pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(entity, pending)| (*entity, pending.space))
            .collect();
        for (entity, space) in expired {
            self.fail_enter_space(entity, space, "enter-space deadline exceeded");
        }
    }

    pub(crate) fn create_entity(&mut self, type_name: &str) -> Result<EntityId, ServerError> {
        self.create_entity_with_seed(type_name, EntitySeed::empty())
    }

    pub(crate) fn create_entity_with_seed(
        &mut self,
        type_name: &str,
        seed: EntitySeed,
    ) -> Result<EntityId, ServerError> {
        let typ = self
            .types
            .get(type_name)
            .ok_or_else(|| ServerError::UnknownType(type_name.to_string()))?;
        let entity = EntityId::new();
        self.spawn_registered(entity, type_name, typ, seed, true);
        Ok(entity)
    }

    // Spawns and registers an entity locally. `announce` sends the
    // dispatcher a RegisterEntity; migrated-in and abort-restored entities
    // must NOT announce; the dispatcher already routes them, and a second
    // registration from another server reads as a fatal duplicate.
    fn spawn_registered(
        &mut self,
        entity: EntityId,
        type_name: &str,
        typ: Arc<meridian_entity::EntityTypeDef>,
        seed: EntitySeed,
        announce: bool,
    ) {
        let space = seed.space;
        let space_kind = typ.space_kind_value();
        if let Some(client) = seed.client {
            self.bound.insert(client.session, entity);
        }
        let handle = spawn_entity(
            entity,
            typ,
            seed,
            Arc::clone(&self.wheel),
            self.events_tx.clone(),
        );
        if self.registry.insert(handle).is_some() {
            // Two live instances under one id would diverge silently.
            error!(%entity, "duplicate local entity registration, aborting");
            std::process::abort();
        }
        if let Some(kind) = space_kind {
            self.registry.register_space(entity, kind);
        }
        if announce {
            self.link.send(Packet::RegisterEntity {
                entity,
                type_name: type_name.to_string(),
                space,
                space_kind,
            });
        }
        debug!(%entity, type_name, "entity hosted");
    }

    fn on_client_connect(&mut self, session: SessionId, gate: GateId) {
        let Some(account_type) = self.config.account_entity_type.clone() else {
            warn!(%session, "client connected but no account entity type is configured");
            self.link.send(Packet::ErrorNotify {
                kind: ErrorKind::Unavailable,
                about: None,
                detail: "server accepts no clients".into(),
            });
            return;
        };
        match self.create_entity(&account_type) {
            Ok(entity) => {
                self.bound.insert(session, entity);
                if let Some(handle) = self.registry.get(entity) {
                    handle.post(EntityCommand::BindClient { session, gate });
                }
                self.link.send(Packet::BindClient {
                    session,
                    gate,
                    entity,
                });
            }
            Err(err) => warn!(%session, %err, "account entity creation failed"),
        }
    }

    // Source side: the dispatcher paused routing; everything it routed to us
    // beforehand is already in the mailbox ahead of this freeze.
    fn on_migrate_ack(&mut self, entity: EntityId) {
        let Some(handle) = self.registry.remove(entity) else {
            warn!(%entity, "migrate ack for unknown entity");
            return;
        };
        self.dirty.remove(&entity);
        let (reply, blob_rx) = oneshot::channel();
        handle.post(EntityCommand::Freeze { reply });

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            match blob_rx.await {
                Ok(blob) => {
                    let _ = internal.send(Internal::Frozen { entity, blob });
                }
                Err(_) => error!(%entity, "entity vanished during freeze"),
            }
        });
    }

    // Target side: restore, register locally, and report ready so the
    // dispatcher flushes the buffered backlog our way.
    fn on_migrate_in(&mut self, entity: EntityId, blob: Vec<u8>) {
        let (type_name, seed) = match seed_from_blob(&blob) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%entity, %err, "migration blob rejected");
                self.link.send(Packet::MigrateAbort {
                    entity,
                    reason: format!("blob rejected: {err}"),
                });
                return;
            }
        };
        let Some(typ) = self.types.get(&type_name) else {
            warn!(%entity, type_name, "migration for unregistered type rejected");
            self.link.send(Packet::MigrateAbort {
                entity,
                reason: format!("type {type_name} not registered"),
            });
            return;
        };
        self.spawn_registered(entity, &type_name, typ, seed, false);
        self.link.send(Packet::MigrateReady { entity });
        debug!(%entity, type_name, "entity migrated in");
    }

    fn on_migrate_abort(&mut self, entity: EntityId, reason: String) {
        if let Some(blob) = self.frozen.remove(&entity) {
            // We are the source: thaw the frozen copy; routing stayed here.
            warn!(%entity, reason, "migration aborted, restoring local copy");
            match seed_from_blob(&blob) {
                Ok((type_name, seed)) => {
                    if let Some(typ) = self.types.get(&type_name) {
                        self.spawn_registered(entity, &type_name, typ, seed, false);
                    } else {
                        error!(%entity, type_name, "cannot restore aborted migration");
                    }
                }
                Err(err) => error!(%entity, %err, "cannot decode own frozen snapshot"),
            }
            let pending_space = self.enter_pending.get(&entity).map(|p| p.space);
            if let Some(space) = pending_space {
                self.fail_enter_space(entity, space, &reason);
            }
        } else if let Some(handle) = self.registry.remove(entity) {
            // We are the target holding a copy that must not go live: stop
            // the task without running destroy hooks or unregistering.
            warn!(%entity, reason, "discarding migrated-in copy after abort");
            let (reply, _discard) = oneshot::channel();
            handle.post(EntityCommand::Freeze { reply });
        }
    }

    fn on_destroyed(&mut self, entity: EntityId, snapshot: Option<Vec<u8>>) {
        self.registry.remove(entity);
        self.dirty.remove(&entity);
        self.bound.retain(|_, bound| *bound != entity);
        self.link.send(Packet::UnregisterEntity { entity });

        if let (Some(blob), Some(storage)) = (snapshot, self.storage.clone()) {
            let key = entity.to_string();
            tokio::spawn(async move {
                if let Err(err) = storage.put_with_retry(&key, blob).await {
                    error!(entity = %key, %err, "final save failed, state lost");
                }
            });
        }
    }

    fn on_error_notify(&mut self, kind: ErrorKind, about: Option<EntityId>, detail: String) {
        match kind {
            ErrorKind::Fatal => {
                // Routing to a divergent replica is worse than dying.
                error!(?about, detail, "fatal invariant violation reported by dispatcher");
                std::process::abort();
            }
            ErrorKind::EntityLost => {
                error!(?about, detail, "entity lost during migration");
                if let Some(entity) = about {
                    self.frozen.remove(&entity);
                    self.enter_pending.remove(&entity);
                    self.dirty.remove(&entity);
                }
            }
            ErrorKind::Unavailable | ErrorKind::Timeout => {
                if let Some(entity) = about {
                    let pending_space = self.enter_pending.get(&entity).map(|p| p.space);
                    if let Some(space) = pending_space {
                        self.fail_enter_space(entity, space, &detail);
                        return;
                    }
                }
                warn!(%kind, ?about, detail, "operation failed");
            }
            _ => debug!(%kind, ?about, detail, "error notification"),
        }
    }

    fn save_dirty(&mut self) {
        let Some(storage) = self.storage.clone() else {
            self.dirty.clear();
            return;
        };
        for entity in std::mem::take(&mut self.dirty) {
            let Some(handle) = self.registry.get(entity) else {
                continue;
            };
            let (reply, blob_rx) = oneshot::channel();
            handle.post(EntityCommand::Snapshot { reply });

            let storage = Arc::clone(&storage);
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                let Ok(blob) = blob_rx.await else {
                    return;
                };
                match storage.put_with_retry(&entity.to_string(), blob).await {
                    Ok(()) => debug!(%entity, "entity saved"),
                    Err(StorageError::RetriesExhausted { .. }) => {
                        let _ = internal.send(Internal::SaveDeferred { entity });
                    }
                    Err(err) => error!(%entity, %err, "entity save failed"),
                }
            });
        }
    }
}
