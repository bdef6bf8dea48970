use std::collections::HashMap;

use tracing::info;

use crate::peer::{OutboundFrame, Peer};
use crate::protocol::{
    Command, Envelope, ProtoError, STR_ALREADY_IN_LOBBY, STR_ONLY_HOST_CAN_SEAL,
};

/// The reserved in-lobby address of the host.
pub const HOST_ID: u32 = 1;

/// One live rendezvous session: ordered members, a distinguished host, and
/// optionally the game state the host last uploaded.
pub struct Lobby {
    pub code: String,
    pub host: u32,
    /// Clients should form a full mesh instead of a star around the host.
    pub mesh: bool,
    /// One-way latch; a sealed lobby never reopens.
    pub sealed: bool,
    /// Member identities in join order.
    pub peers: Vec<u32>,
    pub game_state: Option<Vec<u8>>,
}

impl Lobby {
    pub fn new(code: String, host: u32, mesh: bool) -> Self {
        Self {
            code,
            host,
            mesh,
            sealed: false,
            peers: Vec::new(),
            game_state: None,
        }
    }

    /// The identity by which a member is addressed inside this lobby.
    pub fn in_lobby_id(&self, identity: u32) -> u32 {
        if identity == self.host { HOST_ID } else { identity }
    }

    /// Resolves a client-addressed destination to a raw peer identity.
    pub fn resolve_destination(&self, id: u32) -> u32 {
        if id == HOST_ID { self.host } else { id }
    }

    pub fn is_member(&self, identity: u32) -> bool {
        self.peers.contains(&identity)
    }

    /// Appends a member and fans out the introduction frames: the newcomer
    /// gets its in-lobby id (data `"true"` when the lobby is mesh), then
    /// every earlier member learns about the newcomer and vice versa, in
    /// join order. Seal rejection is the caller's responsibility.
    pub fn join(&mut self, identity: u32, peers: &HashMap<u32, Peer>) -> Result<(), ProtoError> {
        if self.is_member(identity) {
            return Err(ProtoError::protocol(STR_ALREADY_IN_LOBBY));
        }

        let assigned = self.in_lobby_id(identity);
        let mesh_data = if self.mesh { "true" } else { "" };
        send_to(
            peers,
            identity,
            Envelope::message(Command::Id, assigned, mesh_data),
        );

        for &member in &self.peers {
            send_to(
                peers,
                member,
                Envelope::message(Command::PeerConnect, assigned, ""),
            );
            send_to(
                peers,
                identity,
                Envelope::message(Command::PeerConnect, self.in_lobby_id(member), ""),
            );
        }

        self.peers.push(identity);
        Ok(())
    }

    /// Removes a member. A departing host hands the role to the first
    /// remaining member; an empty lobby reports that it should be closed.
    /// Non-host departures are broadcast as `PEER_DISCONNECT`.
    pub fn leave(
        &mut self,
        identity: u32,
        peers: &HashMap<u32, Peer>,
        broadcast_host_change: bool,
    ) -> bool {
        let Some(position) = self.peers.iter().position(|&id| id == identity) else {
            return false;
        };
        let assigned = self.in_lobby_id(identity);
        self.peers.remove(position);

        if identity == self.host {
            let Some(&next_host) = self.peers.first() else {
                return true;
            };
            self.host = next_host;
            info!(lobby = %self.code, host = next_host, "host migrated");
            send_to(
                peers,
                next_host,
                Envelope::message(Command::HostChanged, HOST_ID, "You are now the host"),
            );
            if broadcast_host_change {
                for &member in self.peers.iter().skip(1) {
                    send_to(
                        peers,
                        member,
                        Envelope::message(Command::HostChanged, HOST_ID, ""),
                    );
                }
            }
        } else {
            for &member in &self.peers {
                send_to(
                    peers,
                    member,
                    Envelope::message(Command::PeerDisconnect, assigned, ""),
                );
            }
        }

        false
    }

    /// Seals the lobby: host-only, latches `sealed` and broadcasts `SEAL`
    /// to every member. The caller arms the teardown timer.
    pub fn seal(&mut self, identity: u32, peers: &HashMap<u32, Peer>) -> Result<(), ProtoError> {
        if identity != self.host {
            return Err(ProtoError::protocol(STR_ONLY_HOST_CAN_SEAL));
        }
        self.sealed = true;
        for &member in &self.peers {
            send_to(peers, member, Envelope::message(Command::Seal, 0, ""));
        }
        info!(lobby = %self.code, members = self.peers.len(), "lobby sealed");
        Ok(())
    }

    /// Stores the host's game-state upload verbatim. Host-only, enforced at
    /// dispatch.
    pub fn update_game_state(&mut self, blob: Vec<u8>) {
        self.game_state = Some(blob);
    }
}

fn send_to(peers: &HashMap<u32, Peer>, identity: u32, envelope: Envelope) {
    if let Some(peer) = peers.get(&identity) {
        peer.send(OutboundFrame::Envelope(envelope));
    }
}
