//! Wire protocol shared between the burrow session server and its clients.
//!
//! One packet per line: a fixed five-character type code, a space, and an
//! optional payload whose fields are joined with the reserved separator
//! [`FIELD_SEPARATOR`]. Decoding validates the payload against the arity and
//! field types of the matching variant and accumulates every problem it finds
//! instead of stopping at the first one, so a status reply can report all of
//! them at once.

use thiserror::Error;

/// Multi-byte field separator, chosen because it does not occur in normal
/// chat text or names.
pub const FIELD_SEPARATOR: &str = "║";

/// Every type code is exactly this many bytes.
pub const CODE_LEN: usize = 5;

/// Upper bound for usernames and lobby names.
pub const MAX_NAME_LEN: usize = 30;

/// Upper bound for a single chat message.
pub const MAX_CHAT_LEN: usize = 100;

/// A lobby overview lists at most this many open lobbies.
pub const MAX_OVERVIEW_LOBBIES: usize = 10;

/// Registry of the five-character type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Login,
    Disconnect,
    GetName,
    SetName,
    GetLobbies,
    CreateLobby,
    JoinLobby,
    GetLobbyInfo,
    LeaveLobby,
    ChatToServer,
    Ping,
    Pong,
    Ready,
    LoginStatus,
    SetNameStatus,
    NameReply,
    CreateLobbyStatus,
    JoinLobbyStatus,
    LeaveLobbyStatus,
    LobbyOverview,
    CurLobbyInfo,
    ChatToClient,
    StartRound,
}

impl PacketKind {
    /// The five-character wire code of this packet kind.
    pub fn code(&self) -> &'static str {
        match self {
            PacketKind::Login => "LOGIN",
            PacketKind::Disconnect => "DISCN",
            PacketKind::GetName => "GETNM",
            PacketKind::SetName => "SETNM",
            PacketKind::GetLobbies => "GTLBS",
            PacketKind::CreateLobby => "CRLBY",
            PacketKind::JoinLobby => "JNLBY",
            PacketKind::GetLobbyInfo => "GTLBI",
            PacketKind::LeaveLobby => "LVLBY",
            PacketKind::ChatToServer => "CHATC",
            PacketKind::Ping => "PING ",
            PacketKind::Pong => "PONG ",
            PacketKind::Ready => "READY",
            PacketKind::LoginStatus => "LOGST",
            PacketKind::SetNameStatus => "SETNS",
            PacketKind::NameReply => "GETNS",
            PacketKind::CreateLobbyStatus => "CRLBS",
            PacketKind::JoinLobbyStatus => "JLBYS",
            PacketKind::LeaveLobbyStatus => "LVLBS",
            PacketKind::LobbyOverview => "LOBOV",
            PacketKind::CurLobbyInfo => "LOBBI",
            PacketKind::ChatToClient => "CHATS",
            PacketKind::StartRound => "STRND",
        }
    }

    /// Looks up a packet kind by its wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "LOGIN" => Some(PacketKind::Login),
            "DISCN" => Some(PacketKind::Disconnect),
            "GETNM" => Some(PacketKind::GetName),
            "SETNM" => Some(PacketKind::SetName),
            "GTLBS" => Some(PacketKind::GetLobbies),
            "CRLBY" => Some(PacketKind::CreateLobby),
            "JNLBY" => Some(PacketKind::JoinLobby),
            "GTLBI" => Some(PacketKind::GetLobbyInfo),
            "LVLBY" => Some(PacketKind::LeaveLobby),
            "CHATC" => Some(PacketKind::ChatToServer),
            "PING " => Some(PacketKind::Ping),
            "PONG " => Some(PacketKind::Pong),
            "READY" => Some(PacketKind::Ready),
            "LOGST" => Some(PacketKind::LoginStatus),
            "SETNS" => Some(PacketKind::SetNameStatus),
            "GETNS" => Some(PacketKind::NameReply),
            "CRLBS" => Some(PacketKind::CreateLobbyStatus),
            "JLBYS" => Some(PacketKind::JoinLobbyStatus),
            "LVLBS" => Some(PacketKind::LeaveLobbyStatus),
            "LOBOV" => Some(PacketKind::LobbyOverview),
            "LOBBI" => Some(PacketKind::CurLobbyInfo),
            "CHATS" => Some(PacketKind::ChatToClient),
            "STRND" => Some(PacketKind::StartRound),
            _ => None,
        }
    }
}

/// One entry of a lobby overview: name, current member count and status text
/// ("open" or "running").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyEntry {
    pub name: String,
    pub member_count: u32,
    pub status: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Client -> server
    Login { username: String },
    Disconnect,
    GetName { player_id: u32 },
    SetName { username: String },
    GetLobbies,
    CreateLobby { name: String },
    JoinLobby { name: String },
    GetLobbyInfo,
    LeaveLobby,
    ChatToServer { message: String },
    Ready,

    // Both directions
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },

    // Server -> client
    LoginStatus { status: String },
    SetNameStatus { status: String },
    NameReply { status: String, username: String },
    CreateLobbyStatus { status: String },
    JoinLobbyStatus { status: String },
    LeaveLobbyStatus { status: String },
    LobbyOverview { status: String, lobbies: Vec<LobbyEntry> },
    CurLobbyInfo { status: String, lobby_name: String, members: Vec<String> },
    ChatToClient { text: String },
    StartRound,
}

/// Why a line could not be decoded into a [`Packet`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The line is shorter than a bare type code. Logged and dropped.
    #[error("message is shorter than the {CODE_LEN}-character type code")]
    TooShort,
    /// The type code is not in the registry. Dropped silently so unknown
    /// protocol extensions never kill a connection.
    #[error("unknown type code `{0}`")]
    UnknownCode(String),
    /// The code matched but the payload failed validation. The packet must
    /// not produce any effect; `errors` holds every accumulated problem.
    #[error("invalid {kind:?} payload: {}", errors.join(" "))]
    Invalid { kind: PacketKind, errors: Vec<String> },
}

impl Packet {
    /// The kind (and therefore wire code) of this packet.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Login { .. } => PacketKind::Login,
            Packet::Disconnect => PacketKind::Disconnect,
            Packet::GetName { .. } => PacketKind::GetName,
            Packet::SetName { .. } => PacketKind::SetName,
            Packet::GetLobbies => PacketKind::GetLobbies,
            Packet::CreateLobby { .. } => PacketKind::CreateLobby,
            Packet::JoinLobby { .. } => PacketKind::JoinLobby,
            Packet::GetLobbyInfo => PacketKind::GetLobbyInfo,
            Packet::LeaveLobby => PacketKind::LeaveLobby,
            Packet::ChatToServer { .. } => PacketKind::ChatToServer,
            Packet::Ping { .. } => PacketKind::Ping,
            Packet::Pong { .. } => PacketKind::Pong,
            Packet::Ready => PacketKind::Ready,
            Packet::LoginStatus { .. } => PacketKind::LoginStatus,
            Packet::SetNameStatus { .. } => PacketKind::SetNameStatus,
            Packet::NameReply { .. } => PacketKind::NameReply,
            Packet::CreateLobbyStatus { .. } => PacketKind::CreateLobbyStatus,
            Packet::JoinLobbyStatus { .. } => PacketKind::JoinLobbyStatus,
            Packet::LeaveLobbyStatus { .. } => PacketKind::LeaveLobbyStatus,
            Packet::LobbyOverview { .. } => PacketKind::LobbyOverview,
            Packet::CurLobbyInfo { .. } => PacketKind::CurLobbyInfo,
            Packet::ChatToClient { .. } => PacketKind::ChatToClient,
            Packet::StartRound => PacketKind::StartRound,
        }
    }

    /// Serializes the packet to its single-line wire form (no trailing
    /// newline).
    pub fn encode(&self) -> String {
        let fields = self.payload_fields();
        if fields.is_empty() {
            self.kind().code().to_string()
        } else {
            format!("{} {}", self.kind().code(), fields.join(FIELD_SEPARATOR))
        }
    }

    fn payload_fields(&self) -> Vec<String> {
        match self {
            Packet::Login { username } | Packet::SetName { username } => vec![username.clone()],
            Packet::Disconnect
            | Packet::GetLobbies
            | Packet::GetLobbyInfo
            | Packet::LeaveLobby
            | Packet::Ready
            | Packet::StartRound => Vec::new(),
            Packet::GetName { player_id } => vec![player_id.to_string()],
            Packet::CreateLobby { name } | Packet::JoinLobby { name } => vec![name.clone()],
            Packet::ChatToServer { message } => vec![message.clone()],
            Packet::Ping { timestamp } | Packet::Pong { timestamp } => {
                vec![timestamp.to_string()]
            }
            Packet::LoginStatus { status }
            | Packet::SetNameStatus { status }
            | Packet::CreateLobbyStatus { status }
            | Packet::JoinLobbyStatus { status }
            | Packet::LeaveLobbyStatus { status } => vec![status.clone()],
            Packet::NameReply { status, username } => vec![status.clone(), username.clone()],
            Packet::LobbyOverview { status, lobbies } => {
                let mut fields = vec![status.clone()];
                for entry in lobbies {
                    fields.push(entry.name.clone());
                    fields.push(entry.member_count.to_string());
                    fields.push(entry.status.clone());
                }
                fields
            }
            Packet::CurLobbyInfo {
                status,
                lobby_name,
                members,
            } => {
                let mut fields = vec![status.clone(), lobby_name.clone()];
                fields.extend(members.iter().cloned());
                fields
            }
            Packet::ChatToClient { text } => vec![text.clone()],
        }
    }

    /// Decodes one line (without its newline) into a packet.
    ///
    /// Byte 5 is treated as the code/payload separator and skipped without
    /// inspection; the payload starts at byte 6.
    pub fn decode(line: &str) -> Result<Packet, DecodeError> {
        if line.len() < CODE_LEN {
            return Err(DecodeError::TooShort);
        }
        let code = line
            .get(..CODE_LEN)
            .ok_or_else(|| DecodeError::UnknownCode(line.chars().take(CODE_LEN).collect()))?;
        let kind =
            PacketKind::from_code(code).ok_or_else(|| DecodeError::UnknownCode(code.to_string()))?;

        let payload = line.get(CODE_LEN + 1..).unwrap_or("");
        let fields: Vec<&str> = if payload.is_empty() {
            Vec::new()
        } else {
            payload.split(FIELD_SEPARATOR).collect()
        };

        let mut errors = Vec::new();
        let packet = build_packet(kind, &fields, &mut errors);
        match packet {
            Some(packet) if errors.is_empty() => Ok(packet),
            _ => Err(DecodeError::Invalid { kind, errors }),
        }
    }
}

fn build_packet(kind: PacketKind, fields: &[&str], errors: &mut Vec<String>) -> Option<Packet> {
    match kind {
        PacketKind::Login => {
            check_arity(fields, 1, errors)?;
            let username = parse_name(fields[0], "Username", errors);
            Some(Packet::Login { username })
        }
        PacketKind::SetName => {
            check_arity(fields, 1, errors)?;
            let username = parse_name(fields[0], "Username", errors);
            Some(Packet::SetName { username })
        }
        PacketKind::GetName => {
            check_arity(fields, 1, errors)?;
            let player_id = parse_u32(fields[0], "player id", errors);
            Some(Packet::GetName { player_id })
        }
        PacketKind::Disconnect => {
            check_arity(fields, 0, errors)?;
            Some(Packet::Disconnect)
        }
        PacketKind::GetLobbies => {
            check_arity(fields, 0, errors)?;
            Some(Packet::GetLobbies)
        }
        PacketKind::CreateLobby => {
            check_arity(fields, 1, errors)?;
            let name = parse_name(fields[0], "Lobby name", errors);
            Some(Packet::CreateLobby { name })
        }
        PacketKind::JoinLobby => {
            check_arity(fields, 1, errors)?;
            let name = parse_name(fields[0], "Lobby name", errors);
            Some(Packet::JoinLobby { name })
        }
        PacketKind::GetLobbyInfo => {
            check_arity(fields, 0, errors)?;
            Some(Packet::GetLobbyInfo)
        }
        PacketKind::LeaveLobby => {
            check_arity(fields, 0, errors)?;
            Some(Packet::LeaveLobby)
        }
        PacketKind::ChatToServer => {
            check_arity(fields, 1, errors)?;
            let message = fields[0].to_string();
            if message.trim().is_empty() {
                errors.push("Chat message must not be empty.".to_string());
            }
            if message.len() > MAX_CHAT_LEN {
                errors.push(format!(
                    "Chat message must not exceed {} bytes.",
                    MAX_CHAT_LEN
                ));
            }
            Some(Packet::ChatToServer { message })
        }
        PacketKind::Ping => {
            check_arity(fields, 1, errors)?;
            let timestamp = parse_u64(fields[0], "ping timestamp", errors);
            Some(Packet::Ping { timestamp })
        }
        PacketKind::Pong => {
            check_arity(fields, 1, errors)?;
            let timestamp = parse_u64(fields[0], "pong timestamp", errors);
            Some(Packet::Pong { timestamp })
        }
        PacketKind::Ready => {
            check_arity(fields, 0, errors)?;
            Some(Packet::Ready)
        }
        PacketKind::LoginStatus => {
            check_arity(fields, 1, errors)?;
            Some(Packet::LoginStatus {
                status: fields[0].to_string(),
            })
        }
        PacketKind::SetNameStatus => {
            check_arity(fields, 1, errors)?;
            Some(Packet::SetNameStatus {
                status: fields[0].to_string(),
            })
        }
        PacketKind::NameReply => {
            check_arity(fields, 2, errors)?;
            Some(Packet::NameReply {
                status: fields[0].to_string(),
                username: fields[1].to_string(),
            })
        }
        PacketKind::CreateLobbyStatus => {
            check_arity(fields, 1, errors)?;
            Some(Packet::CreateLobbyStatus {
                status: fields[0].to_string(),
            })
        }
        PacketKind::JoinLobbyStatus => {
            check_arity(fields, 1, errors)?;
            Some(Packet::JoinLobbyStatus {
                status: fields[0].to_string(),
            })
        }
        PacketKind::LeaveLobbyStatus => {
            check_arity(fields, 1, errors)?;
            Some(Packet::LeaveLobbyStatus {
                status: fields[0].to_string(),
            })
        }
        PacketKind::LobbyOverview => {
            if fields.is_empty() || (fields.len() - 1) % 3 != 0 {
                errors.push(format!(
                    "Lobby overview expects a status plus 3 fields per lobby, got {} fields.",
                    fields.len()
                ));
                return None;
            }
            let status = fields[0].to_string();
            let mut lobbies = Vec::new();
            for chunk in fields[1..].chunks(3) {
                let member_count = parse_u32(chunk[1], "lobby member count", errors);
                lobbies.push(LobbyEntry {
                    name: chunk[0].to_string(),
                    member_count,
                    status: chunk[2].to_string(),
                });
            }
            Some(Packet::LobbyOverview { status, lobbies })
        }
        PacketKind::CurLobbyInfo => {
            if fields.len() < 2 {
                errors.push(format!(
                    "Lobby info expects at least a status and a lobby name, got {} fields.",
                    fields.len()
                ));
                return None;
            }
            Some(Packet::CurLobbyInfo {
                status: fields[0].to_string(),
                lobby_name: fields[1].to_string(),
                members: fields[2..].iter().map(|f| f.to_string()).collect(),
            })
        }
        PacketKind::ChatToClient => {
            check_arity(fields, 1, errors)?;
            Some(Packet::ChatToClient {
                text: fields[0].to_string(),
            })
        }
        PacketKind::StartRound => {
            check_arity(fields, 0, errors)?;
            Some(Packet::StartRound)
        }
    }
}

fn check_arity(fields: &[&str], expected: usize, errors: &mut Vec<String>) -> Option<()> {
    if fields.len() != expected {
        errors.push(format!(
            "Expected {} payload field(s), got {}.",
            expected,
            fields.len()
        ));
        None
    } else {
        Some(())
    }
}

fn parse_name(raw: &str, what: &str, errors: &mut Vec<String>) -> String {
    let name = raw.trim();
    if name.is_empty() {
        errors.push(format!("{} must not be empty.", what));
    }
    if name.len() > MAX_NAME_LEN {
        errors.push(format!("{} must not exceed {} bytes.", what, MAX_NAME_LEN));
    }
    name.to_string()
}

fn parse_u32(raw: &str, what: &str, errors: &mut Vec<String>) -> u32 {
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            errors.push(format!("Invalid {}: `{}`.", what, raw));
            0
        }
    }
}

fn parse_u64(raw: &str, what: &str, errors: &mut Vec<String>) -> u64 {
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            errors.push(format!("Invalid {}: `{}`.", what, raw));
            0
        }
    }
}
