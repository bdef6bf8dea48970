use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::SnapshotCache;
use crate::codes::{self, CodeGenerator};
use crate::config::Settings;
use crate::lobby::Lobby;
use crate::peer::{OutboundFrame, Outbox, Peer, random_identity};
use crate::protocol::{
    CLOSE_NORMAL, CLOSE_PROTO_ERROR, Command, Envelope, ProtoError, STR_ALREADY_IN_LOBBY,
    STR_ID_IN_USE,
    STR_INVALID_CMD, STR_INVALID_DEST, STR_LOBBY_DOES_NOT_EXISTS, STR_LOBBY_IS_SEALED,
    STR_NEED_LOBBY, STR_NO_LOBBY, STR_ONLY_HOST_CAN_SAVE, STR_SEAL_COMPLETE, STR_SERVER_ERROR,
    STR_TOO_MANY_LOBBIES, STR_TOO_MANY_PEERS,
};
use crate::store::SnapshotStore;

/// One inbound transport frame, as the transport adapter hands it over.
#[derive(Debug)]
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
}

/// Process-wide registry of connected peers and live lobbies. A single lock
/// guards both maps so join/leave/seal fan-outs never interleave with other
/// handlers; everything sent under the lock is a non-blocking outbox push.
#[derive(Default)]
pub struct Registry {
    pub peers: HashMap<u32, Peer>,
    pub lobbies: HashMap<String, Lobby>,
}

/// The signaling broker: connection lifecycle, message dispatch, lobby
/// bookkeeping and the snapshot layers behind it.
pub struct Broker {
    settings: Settings,
    registry: Mutex<Registry>,
    cache: SnapshotCache,
    codes: Mutex<CodeGenerator>,
    store: Arc<dyn SnapshotStore>,
}

impl Broker {
    pub fn new(
        settings: Settings,
        store: Arc<dyn SnapshotStore>,
        generator: CodeGenerator,
    ) -> Self {
        let cache = SnapshotCache::new(settings.max_save_games, store.clone());
        Self {
            settings,
            registry: Mutex::new(Registry::default()),
            cache,
            codes: Mutex::new(generator),
            store,
        }
    }

    /// Admits a new connection: capacity check, identity draw, join-deadline
    /// arming. Returns the identity the connection is registered under.
    pub async fn register_peer(self: &Arc<Self>, outbox: Outbox) -> Result<u32, ProtoError> {
        let mut reg = self.registry.lock().await;
        if reg.peers.len() >= self.settings.max_peers {
            return Err(ProtoError::protocol(STR_TOO_MANY_PEERS));
        }

        let identity = random_identity();
        if reg.peers.contains_key(&identity) {
            // Astronomically unlikely in a 31-bit space; treated as a failed
            // connect rather than silently re-rolling.
            warn!(peer_id = identity, "random identity collision");
            return Err(ProtoError::protocol(STR_ID_IN_USE));
        }

        let mut peer = Peer::new(identity, outbox);
        let broker = Arc::clone(self);
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(broker.settings.no_lobby_timeout).await;
            broker.expire_join_deadline(identity).await;
        });
        peer.join_deadline = Some(deadline.abort_handle());
        debug!(peer_id = peer.identity, "peer registered");
        reg.peers.insert(identity, peer);

        Ok(identity)
    }

    async fn expire_join_deadline(&self, identity: u32) {
        let reg = self.registry.lock().await;
        if let Some(peer) = reg.peers.get(&identity) {
            if peer.lobby.is_empty() {
                info!(peer_id = identity, "join deadline expired");
                peer.close(CLOSE_PROTO_ERROR, STR_NO_LOBBY);
            }
        }
    }

    /// Handles one inbound frame. An error closes the connection with the
    /// carried `(code, reason)`.
    pub async fn handle_message(
        self: &Arc<Self>,
        identity: u32,
        message: Incoming,
    ) -> Result<(), ProtoError> {
        match message {
            Incoming::Binary(blob) => self.store_game_state(identity, blob).await,
            Incoming::Text(text) => {
                let envelope = Envelope::parse(&text)?;
                if envelope.kind == Command::Join.code() {
                    // JOIN id 0 requests a mesh topology, anything else star.
                    let mesh = envelope.id == 0;
                    return self.join_lobby(identity, &envelope.data, mesh).await;
                }
                self.dispatch_in_lobby(identity, envelope).await
            }
        }
    }

    // Game-state uploads arrive as raw binary frames from the lobby host.
    async fn store_game_state(&self, identity: u32, blob: Vec<u8>) -> Result<(), ProtoError> {
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;

        let peer = reg
            .peers
            .get(&identity)
            .ok_or_else(|| ProtoError::protocol(STR_NEED_LOBBY))?;
        if peer.lobby.is_empty() {
            return Err(ProtoError::protocol(STR_NEED_LOBBY));
        }
        let code = peer.lobby.clone();
        let lobby = reg
            .lobbies
            .get_mut(&code)
            .ok_or_else(|| ProtoError::protocol(STR_SERVER_ERROR))?;
        if lobby.host != identity {
            return Err(ProtoError::protocol(STR_ONLY_HOST_CAN_SAVE));
        }

        debug!(lobby = %code, bytes = blob.len(), "game state updated");
        lobby.update_game_state(blob);
        Ok(())
    }

    async fn dispatch_in_lobby(
        self: &Arc<Self>,
        identity: u32,
        envelope: Envelope,
    ) -> Result<(), ProtoError> {
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;

        let peer = reg
            .peers
            .get(&identity)
            .ok_or_else(|| ProtoError::protocol(STR_NEED_LOBBY))?;
        if peer.lobby.is_empty() {
            return Err(ProtoError::protocol(STR_NEED_LOBBY));
        }
        let code = peer.lobby.clone();
        let lobby = reg
            .lobbies
            .get_mut(&code)
            .ok_or_else(|| ProtoError::protocol(STR_SERVER_ERROR))?;

        match Command::from_code(envelope.kind) {
            Some(Command::Seal) => {
                lobby.seal(identity, &reg.peers)?;
                self.arm_seal_timer(code);
                Ok(())
            }
            Some(Command::Offer | Command::Answer | Command::Candidate) => {
                let destination = lobby.resolve_destination(envelope.id);
                if !lobby.is_member(destination) {
                    return Err(ProtoError::protocol(STR_INVALID_DEST));
                }
                let forwarded = Envelope {
                    kind: envelope.kind,
                    id: lobby.in_lobby_id(identity),
                    data: envelope.data,
                };
                if let Some(target) = reg.peers.get(&destination) {
                    target.send(OutboundFrame::Envelope(forwarded));
                }
                Ok(())
            }
            _ => Err(ProtoError::protocol(STR_INVALID_CMD)),
        }
    }

    /// The join routine: create a fresh lobby, attach to a live one, or
    /// restore a persisted one from the snapshot layers.
    pub async fn join_lobby(
        self: &Arc<Self>,
        identity: u32,
        requested: &str,
        mesh: bool,
    ) -> Result<(), ProtoError> {
        {
            let mut guard = self.registry.lock().await;
            let reg = &mut *guard;

            if requested.is_empty() {
                if reg.lobbies.len() >= self.settings.max_lobbies {
                    return Err(ProtoError::protocol(STR_TOO_MANY_LOBBIES));
                }
                let peer = reg
                    .peers
                    .get(&identity)
                    .ok_or_else(|| ProtoError::protocol(STR_SERVER_ERROR))?;
                if !peer.lobby.is_empty() {
                    return Err(ProtoError::protocol(STR_ALREADY_IN_LOBBY));
                }

                let code = {
                    let mut generator = self.codes.lock().await;
                    generator.next().await.map_err(|e| {
                        error!(error = %e, "failed to allocate lobby code");
                        ProtoError::protocol(STR_SERVER_ERROR)
                    })?
                };

                let mut lobby = Lobby::new(code.clone(), identity, mesh);
                lobby.join(identity, &reg.peers)?;
                reg.lobbies.insert(code.clone(), lobby);
                finish_join(reg, identity, &code);
                info!(lobby = %code, host = identity, mesh, "lobby created");
                return Ok(());
            }

            if let Some(lobby) = reg.lobbies.get_mut(requested) {
                if lobby.sealed {
                    return Err(ProtoError::protocol(STR_LOBBY_IS_SEALED));
                }
                lobby.join(identity, &reg.peers)?;
                finish_join(reg, identity, requested);
                info!(lobby = %requested, peer_id = identity, "peer joined lobby");
                return Ok(());
            }
        }

        // No live lobby under that code; consult the snapshot layers without
        // holding the registry across the store read.
        if !codes::valid(requested) {
            return Err(ProtoError::protocol(STR_LOBBY_DOES_NOT_EXISTS));
        }
        let blob = self
            .cache
            .load(requested)
            .await
            .map_err(|e| {
                warn!(lobby = %requested, error = %e, "snapshot lookup failed");
                ProtoError::protocol(STR_LOBBY_DOES_NOT_EXISTS)
            })?
            .ok_or(ProtoError::protocol(STR_LOBBY_DOES_NOT_EXISTS))?;

        // Re-check under the lock: the lobby may have been created while the
        // store read was in flight; if so this join becomes a plain attach.
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;
        if let Some(lobby) = reg.lobbies.get_mut(requested) {
            if lobby.sealed {
                return Err(ProtoError::protocol(STR_LOBBY_IS_SEALED));
            }
            lobby.join(identity, &reg.peers)?;
            finish_join(reg, identity, requested);
            info!(lobby = %requested, peer_id = identity, "peer joined lobby");
            return Ok(());
        }

        if reg.lobbies.len() >= self.settings.max_lobbies {
            return Err(ProtoError::protocol(STR_TOO_MANY_LOBBIES));
        }
        let mut lobby = Lobby::new(requested.to_string(), identity, mesh);
        lobby.update_game_state(blob.clone());
        lobby.join(identity, &reg.peers)?;
        reg.lobbies.insert(requested.to_string(), lobby);
        finish_join(reg, identity, requested);
        // The restored state goes to the new host as a raw binary frame.
        if let Some(peer) = reg.peers.get(&identity) {
            peer.send(OutboundFrame::Binary(blob));
        }
        info!(lobby = %requested, host = identity, "lobby restored from snapshot");
        Ok(())
    }

    fn arm_seal_timer(self: &Arc<Self>, code: String) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(broker.settings.seal_close_timeout).await;
            broker.close_sealed_lobby(&code).await;
        });
    }

    async fn close_sealed_lobby(&self, code: &str) {
        let reg = self.registry.lock().await;
        let Some(lobby) = reg.lobbies.get(code) else {
            return;
        };
        if !lobby.sealed {
            return;
        }
        info!(lobby = %code, members = lobby.peers.len(), "seal timeout; closing members");
        for member in &lobby.peers {
            if let Some(peer) = reg.peers.get(member) {
                peer.close(CLOSE_NORMAL, STR_SEAL_COMPLETE);
            }
        }
    }

    /// Tears down a departed connection: lobby leave, host migration or
    /// lobby teardown, and the best-effort snapshot flush.
    pub async fn disconnect(&self, identity: u32) {
        let flush = {
            let mut guard = self.registry.lock().await;
            let reg = &mut *guard;

            let Some(mut peer) = reg.peers.remove(&identity) else {
                return;
            };
            peer.cancel_join_deadline();

            if peer.lobby.is_empty() {
                None
            } else if let Some(lobby) = reg.lobbies.get_mut(&peer.lobby) {
                let should_close =
                    lobby.leave(identity, &reg.peers, self.settings.broadcast_host_change);
                if should_close {
                    reg.lobbies.remove(&peer.lobby).and_then(|closed| {
                        info!(lobby = %closed.code, "lobby closed");
                        let code = closed.code;
                        closed.game_state.map(|blob| (code, blob))
                    })
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some((code, blob)) = flush {
            // Keep the final snapshot so the lobby can be resurrected later.
            self.cache.save(&code, blob).await;
        }
    }

    /// Starts the liveness ping and the periodic bulk snapshot flush.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.settings.ping_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broker.ping_all().await;
            }
        });

        if self.settings.save_flush_interval.is_zero() {
            info!("periodic snapshot flush disabled");
            return;
        }
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.settings.save_flush_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broker.flush_snapshots().await;
            }
        });
    }

    async fn ping_all(&self) {
        let reg = self.registry.lock().await;
        for peer in reg.peers.values() {
            peer.send(OutboundFrame::Ping);
        }
    }

    /// Upserts every cached snapshot to the store in one batch.
    pub async fn flush_snapshots(&self) {
        let entries = self.cache.snapshot_all().await;
        if entries.is_empty() {
            return;
        }
        match self.store.upsert_batch(&entries).await {
            Ok(()) => debug!(count = entries.len(), "snapshot cache flushed"),
            Err(e) => warn!(error = %e, "bulk snapshot flush failed"),
        }
    }

    #[cfg(test)]
    async fn lobby_code_of(&self, identity: u32) -> String {
        self.registry
            .lock()
            .await
            .peers
            .get(&identity)
            .map(|p| p.lobby.clone())
            .unwrap_or_default()
    }
}

fn finish_join(reg: &mut Registry, identity: u32, code: &str) {
    if let Some(peer) = reg.peers.get_mut(&identity) {
        peer.lobby = code.to_string();
        peer.cancel_join_deadline();
        peer.send(OutboundFrame::Envelope(Envelope::message(
            Command::Join,
            0,
            code,
        )));
    }
}
