//! Per-connection session: read loop, write task and ping task.
//!
//! Each accepted connection gets three tasks. The read loop parses one packet
//! per line and dispatches it; the write task owns the socket's write half
//! and drains the session channel; the ping task emits a PING once per second
//! until the channel closes. Handlers never touch the socket, they go through
//! [`ConnectionManager`] routing like everyone else.

use crate::network::{ConnectionManager, SessionCommand, SessionHandle};
use crate::ping::{timestamp_millis, PingTracker, PING_INTERVAL};
use log::{debug, info, warn};
use shared::{DecodeError, Packet, PacketKind};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// One live client connection.
pub struct Session {
    client_id: u32,
    manager: Arc<ConnectionManager>,
}

impl Session {
    /// Wires up the session tasks for a freshly accepted connection. Returns
    /// once the session is registered; the tasks outlive the call.
    pub async fn spawn(manager: Arc<ConnectionManager>, client_id: u32, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();

        manager
            .register_session(
                client_id,
                SessionHandle {
                    sender: sender.clone(),
                    ping: Arc::new(Mutex::new(PingTracker::new())),
                },
            )
            .await;

        tokio::spawn(write_loop(client_id, write_half, receiver));
        tokio::spawn(ping_loop(client_id, sender));

        let session = Session { client_id, manager };
        tokio::spawn(async move {
            session.read_loop(read_half).await;
        });
    }

    /// Reads lines until EOF, a read error, or a handler removed this
    /// player. Always ends in `remove_player`, which is idempotent.
    async fn read_loop(&self, read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!("Client {} closed the connection", self.client_id);
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    self.handle_line(trimmed).await;
                    // DISCN (and errors) remove the player mid-line; stop
                    // reading once that happened.
                    if !self.manager.is_connected(self.client_id).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Read error on client {}: {}", self.client_id, e);
                    break;
                }
            }
        }

        self.manager.remove_player(self.client_id).await;
    }

    async fn handle_line(&self, line: &str) {
        match Packet::decode(line) {
            Ok(packet) => self.handle_packet(packet).await,
            Err(DecodeError::TooShort) => {
                warn!(
                    "Client {} sent a message shorter than a type code, dropping it",
                    self.client_id
                );
            }
            Err(DecodeError::UnknownCode(code)) => {
                debug!("Client {} sent unknown type code `{}`", self.client_id, code);
            }
            Err(DecodeError::Invalid { kind, errors }) => {
                debug!(
                    "Client {} sent invalid {:?} packet: {}",
                    self.client_id,
                    kind,
                    errors.join(" ")
                );
                if let Some(reply) = validation_reply(kind, &errors) {
                    self.manager.send_to_client(self.client_id, &reply).await;
                }
            }
        }
    }

    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Login { username } => {
                self.manager.set_username(self.client_id, &username).await;
                info!("Player {} has connected as `{}`", self.client_id, username);
                self.reply(Packet::LoginStatus {
                    status: "OK".to_string(),
                })
                .await;
                let overview = self.manager.overview_packet().await;
                self.reply(overview).await;
            }
            Packet::SetName { username } => {
                let status = if self.manager.username_of(self.client_id).await.is_some() {
                    self.manager.set_username(self.client_id, &username).await;
                    "OK".to_string()
                } else {
                    "You are not logged in.".to_string()
                };
                self.reply(Packet::SetNameStatus { status }).await;
            }
            Packet::GetName { player_id } => {
                let reply = match self.manager.username_of(player_id).await {
                    Some(username) => Packet::NameReply {
                        status: "OK".to_string(),
                        username,
                    },
                    None => Packet::NameReply {
                        status: format!("No logged in player with id {}.", player_id),
                        username: String::new(),
                    },
                };
                self.reply(reply).await;
            }
            Packet::GetLobbies => {
                let overview = self.manager.overview_packet().await;
                self.reply(overview).await;
            }
            Packet::CreateLobby { name } => {
                let result = self.manager.create_lobby(self.client_id, &name).await;
                let status = match &result {
                    Ok(_) => "OK".to_string(),
                    Err(e) => e.to_string(),
                };
                self.reply(Packet::CreateLobbyStatus { status }).await;
                if let Ok(lobby_id) = result {
                    self.manager.push_lobby_updates(lobby_id).await;
                }
            }
            Packet::JoinLobby { name } => {
                let result = self.manager.join_lobby(self.client_id, &name).await;
                let status = match &result {
                    Ok(_) => "OK".to_string(),
                    Err(e) => e.to_string(),
                };
                self.reply(Packet::JoinLobbyStatus { status }).await;
                if let Ok(lobby_id) = result {
                    self.manager.push_lobby_updates(lobby_id).await;
                }
            }
            Packet::GetLobbyInfo => {
                let lobby_id = self.manager.lobby_of(self.client_id).await;
                let reply = if lobby_id != 0 {
                    self.manager.lobby_info_packet(lobby_id).await
                } else {
                    None
                };
                let reply = reply.unwrap_or_else(|| Packet::CurLobbyInfo {
                    status: "You are not in a lobby.".to_string(),
                    lobby_name: String::new(),
                    members: Vec::new(),
                });
                self.reply(reply).await;
            }
            Packet::LeaveLobby => {
                let result = self.manager.leave_lobby(self.client_id).await;
                let status = match &result {
                    Ok(_) => "OK".to_string(),
                    Err(e) => e.to_string(),
                };
                self.reply(Packet::LeaveLobbyStatus { status }).await;
                if let Ok(old_lobby) = result {
                    // Refreshes the remaining members (if any) and pushes a
                    // fresh overview to everyone unlobbied, the leaver
                    // included.
                    self.manager.push_lobby_updates(old_lobby).await;
                }
            }
            Packet::ChatToServer { message } => {
                let username = self.manager.username_of(self.client_id).await;
                let lobby_id = self.manager.lobby_of(self.client_id).await;
                match (username, lobby_id) {
                    (Some(username), lobby_id) if lobby_id != 0 => {
                        let chat = Packet::ChatToClient {
                            text: format!("[{}] {}", username, message),
                        };
                        self.manager.send_to_lobby(lobby_id, &chat).await;
                    }
                    _ => {
                        self.reply(Packet::ChatToClient {
                            text: "[SERVER] Join a lobby to chat.".to_string(),
                        })
                        .await;
                    }
                }
            }
            Packet::Ping { timestamp } => {
                // Echo the payload back so the peer can compute its own rtt.
                self.reply(Packet::Pong { timestamp }).await;
            }
            Packet::Pong { timestamp } => {
                let rtt = timestamp_millis().saturating_sub(timestamp);
                self.manager.record_pong(self.client_id, rtt).await;
            }
            Packet::Ready => match self.manager.start_round(self.client_id).await {
                Ok(lobby_id) => {
                    self.manager.send_to_lobby(lobby_id, &Packet::StartRound).await;
                    let overview = self.manager.overview_packet().await;
                    self.manager.send_to_unlobbied(&overview).await;
                }
                Err(e) => {
                    debug!("Client {} cannot start a round: {}", self.client_id, e);
                }
            },
            Packet::Disconnect => {
                info!("Client {} requested disconnect", self.client_id);
                self.manager.remove_player(self.client_id).await;
            }
            // Server-to-client packets arriving inbound are ignored.
            other => {
                debug!(
                    "Client {} sent server-only packet {:?}, ignoring",
                    self.client_id,
                    other.kind()
                );
            }
        }
    }

    async fn reply(&self, packet: Packet) {
        self.manager.send_to_client(self.client_id, &packet).await;
    }
}

/// Status reply for a packet that failed payload validation, if its kind has
/// a status channel to report through. The joined error text becomes the
/// status message.
fn validation_reply(kind: PacketKind, errors: &[String]) -> Option<Packet> {
    let status = errors.join(" ");
    match kind {
        PacketKind::Login => Some(Packet::LoginStatus { status }),
        PacketKind::SetName => Some(Packet::SetNameStatus { status }),
        PacketKind::GetName => Some(Packet::NameReply {
            status,
            username: String::new(),
        }),
        PacketKind::CreateLobby => Some(Packet::CreateLobbyStatus { status }),
        PacketKind::JoinLobby => Some(Packet::JoinLobbyStatus { status }),
        PacketKind::LeaveLobby => Some(Packet::LeaveLobbyStatus { status }),
        PacketKind::ChatToServer => Some(Packet::ChatToClient {
            text: format!("[SERVER] {}", status),
        }),
        _ => None,
    }
}

/// Drains the session channel into the socket. Owning the write half here
/// means no lock is ever held across a network write.
async fn write_loop(
    client_id: u32,
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<SessionCommand>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            SessionCommand::Line(mut line) => {
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!("Write to client {} failed: {}", client_id, e);
                    break;
                }
            }
            SessionCommand::Close => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

/// Emits a PING once per interval until the session channel closes. Replies
/// are measured by the pong handler; a silent client is only ever detected
/// by the read loop.
async fn ping_loop(client_id: u32, sender: mpsc::UnboundedSender<SessionCommand>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately; skip it so the client gets a full
    // interval to finish its handshake.
    interval.tick().await;
    loop {
        interval.tick().await;
        let ping = Packet::Ping {
            timestamp: timestamp_millis(),
        };
        if sender.send(SessionCommand::Line(ping.encode())).is_err() {
            debug!("Ping task for client {} stopping, session gone", client_id);
            break;
        }
    }
}
