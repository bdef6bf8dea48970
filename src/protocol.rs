use serde::{Deserialize, Serialize};

// Close reasons surfaced to clients. The transport close frame carries these
// verbatim, so the wording is part of the protocol.
pub const STR_NO_LOBBY: &str = "Have not joined lobby yet";
pub const STR_ONLY_HOST_CAN_SEAL: &str = "Only host can seal the lobby";
pub const STR_ONLY_HOST_CAN_SAVE: &str = "Only host can save the game state";
pub const STR_SEAL_COMPLETE: &str = "Seal complete";
pub const STR_TOO_MANY_LOBBIES: &str = "Too many lobbies open";
pub const STR_TOO_MANY_PEERS: &str = "Too many peers connected";
pub const STR_ALREADY_IN_LOBBY: &str = "Already in a lobby";
pub const STR_LOBBY_DOES_NOT_EXISTS: &str = "Lobby does not exists";
pub const STR_LOBBY_IS_SEALED: &str = "Lobby is sealed";
pub const STR_INVALID_FORMAT: &str = "Invalid message format";
pub const STR_NEED_LOBBY: &str = "Invalid message when not in a lobby";
pub const STR_SERVER_ERROR: &str = "Server error, lobby not found";
pub const STR_INVALID_DEST: &str = "Invalid destination";
pub const STR_INVALID_CMD: &str = "Invalid command";
pub const STR_ID_IN_USE: &str = "Peer id already in use";

/// Normal close once a sealed lobby finishes tearing down.
pub const CLOSE_NORMAL: u16 = 1000;
/// Protocol violation; the close reason carries the explanation.
pub const CLOSE_PROTO_ERROR: u16 = 4000;

/// Command vocabulary of the control envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Join,
    Id,
    PeerConnect,
    PeerDisconnect,
    Offer,
    Answer,
    Candidate,
    Seal,
    HostChanged,
    GameState,
    SaveGame,
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::Join => 0,
            Command::Id => 1,
            Command::PeerConnect => 2,
            Command::PeerDisconnect => 3,
            Command::Offer => 4,
            Command::Answer => 5,
            Command::Candidate => 6,
            Command::Seal => 7,
            Command::HostChanged => 8,
            Command::GameState => 9,
            Command::SaveGame => 10,
        }
    }

    pub fn from_code(code: u32) -> Option<Command> {
        Some(match code {
            0 => Command::Join,
            1 => Command::Id,
            2 => Command::PeerConnect,
            3 => Command::PeerDisconnect,
            4 => Command::Offer,
            5 => Command::Answer,
            6 => Command::Candidate,
            7 => Command::Seal,
            8 => Command::HostChanged,
            9 => Command::GameState,
            10 => Command::SaveGame,
            _ => return None,
        })
    }
}

// Wire shape of the control envelope. `type` and `id` are mandatory; `data`
// defaults to the empty string.
#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: i64,
    id: i64,
    #[serde(default)]
    data: String,
}

/// One parsed (or outgoing) control frame.
///
/// `kind` stays numeric after parsing: dispatch decides whether an in-range
/// but unroutable command is an error, and the error it maps to depends on
/// the peer's lobby state, not on the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: u32,
    pub id: u32,
    pub data: String,
}

impl Envelope {
    pub fn message(command: Command, id: u32, data: impl Into<String>) -> Envelope {
        Envelope {
            kind: command.code(),
            id,
            data: data.into(),
        }
    }

    /// Parses a textual frame, rejecting absent, negative or non-integer
    /// `type`/`id` fields.
    pub fn parse(text: &str) -> Result<Envelope, ProtoError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|_| ProtoError::protocol(STR_INVALID_FORMAT))?;

        let kind =
            u32::try_from(raw.kind).map_err(|_| ProtoError::protocol(STR_INVALID_FORMAT))?;
        let id = u32::try_from(raw.id).map_err(|_| ProtoError::protocol(STR_INVALID_FORMAT))?;

        Ok(Envelope {
            kind,
            id,
            data: raw.data,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&RawEnvelope {
            kind: i64::from(self.kind),
            id: i64::from(self.id),
            data: self.data.clone(),
        })
    }
}

/// A client-facing failure: the connection is closed with `(code, reason)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoError {
    pub code: u16,
    pub reason: &'static str,
}

impl ProtoError {
    pub fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    pub fn protocol(reason: &'static str) -> Self {
        Self::new(CLOSE_PROTO_ERROR, reason)
    }
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

impl std::error::Error for ProtoError {}
