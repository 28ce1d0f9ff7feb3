//! Connection manager: accept loop, session table and packet routing.
//!
//! The manager owns every piece of shared state (player registry, lobby
//! manager, session table) behind `tokio::sync::RwLock` and is handed to all
//! sessions as an `Arc`. Routing never writes to a socket directly: each
//! session exposes an unbounded channel into its write task, so a slow peer
//! can never stall a handler running on another connection and no lock is
//! ever held across a network write.
//!
//! Lock order where both are needed: players before lobbies.

use crate::lobbies::{LobbyError, LobbyManager, LobbyStatus};
use crate::ping::PingTracker;
use crate::players::PlayerRegistry;
use crate::session::Session;
use log::{debug, error, info, warn};
use shared::Packet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Commands accepted by a session's write task.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionCommand {
    /// Write one encoded packet line (newline appended by the write task).
    Line(String),
    /// Shut the socket down and stop the write task.
    Close,
}

/// Routing endpoint of one live session.
pub struct SessionHandle {
    /// Feed of the session's write task.
    pub sender: mpsc::UnboundedSender<SessionCommand>,
    /// Round-trip tracker shared with the pong handler.
    pub ping: Arc<Mutex<PingTracker>>,
}

/// Shared server state plus the accept loop.
pub struct ConnectionManager {
    players: RwLock<PlayerRegistry>,
    lobbies: RwLock<LobbyManager>,
    sessions: RwLock<HashMap<u32, SessionHandle>>,
    next_client_id: AtomicU32,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            players: RwLock::new(PlayerRegistry::new()),
            lobbies: RwLock::new(LobbyManager::new()),
            sessions: RwLock::new(HashMap::new()),
            next_client_id: AtomicU32::new(1),
        })
    }

    /// Next connection id. Ids start at 1 and are never reused for the
    /// lifetime of the process.
    pub fn allocate_client_id(&self) -> u32 {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Binds the listener and runs the accept loop until the process ends.
    pub async fn listen(self: Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        self.accept_loop(listener).await
    }

    /// Accepts connections forever, spawning one session per client without
    /// ever blocking on an individual connection.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let client_id = self.allocate_client_id();
                    info!("Client {} connected from {}", client_id, peer);
                    self.players.write().await.register(client_id);
                    Session::spawn(Arc::clone(&self), client_id, stream).await;
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Installs the routing endpoint for a freshly spawned session.
    pub(crate) async fn register_session(&self, client_id: u32, handle: SessionHandle) {
        self.sessions.write().await.insert(client_id, handle);
    }

    /// True while the session table still holds this connection. The read
    /// loop uses this to notice that a handler removed its own player.
    pub async fn is_connected(&self, client_id: u32) -> bool {
        self.sessions.read().await.contains_key(&client_id)
    }

    /// Sends a packet to one client. Unknown ids are a no-op, not an error:
    /// the target may have disconnected while the sender was deciding.
    pub async fn send_to_client(&self, client_id: u32, packet: &Packet) {
        let sender = {
            let sessions = self.sessions.read().await;
            sessions.get(&client_id).map(|handle| handle.sender.clone())
        };
        if let Some(sender) = sender {
            // A closed channel means the write task is already gone.
            let _ = sender.send(SessionCommand::Line(packet.encode()));
        }
    }

    /// Sends a packet to every member of a lobby. Unknown or empty lobbies
    /// are a no-op.
    pub async fn send_to_lobby(&self, lobby_id: u32, packet: &Packet) {
        let members = {
            let lobbies = self.lobbies.read().await;
            lobbies.member_ids(lobby_id)
        };
        for client_id in members {
            self.send_to_client(client_id, packet).await;
        }
    }

    /// Sends a packet to every player currently outside any lobby.
    pub async fn send_to_unlobbied(&self, packet: &Packet) {
        let ids = {
            let players = self.players.read().await;
            players.unlobbied_ids()
        };
        for client_id in ids {
            self.send_to_client(client_id, packet).await;
        }
    }

    /// Sends a packet to every connected player.
    pub async fn broadcast(&self, packet: &Packet) {
        let ids = {
            let players = self.players.read().await;
            players.all_ids()
        };
        for client_id in ids {
            self.send_to_client(client_id, packet).await;
        }
    }

    /// Removes a player from the server and informs the rest of its lobby.
    ///
    /// Idempotent: the registry entry is the guard, so a second concurrent
    /// call observes nothing to remove and returns. Registry entry and
    /// session table entry go away inside the same call; the write task is
    /// told to shut the socket down.
    pub async fn remove_player(&self, client_id: u32) {
        let Some(player) = self.players.write().await.remove(client_id) else {
            debug!("Client {} already removed", client_id);
            return;
        };

        let display_name = player
            .username
            .clone()
            .unwrap_or_else(|| format!("#{}", client_id));
        info!("Removing client {} ({})", client_id, display_name);

        if let Some(handle) = self.sessions.write().await.remove(&client_id) {
            let _ = handle.sender.send(SessionCommand::Close);
        }

        if player.lobby_id != 0 {
            let deleted = {
                let mut lobbies = self.lobbies.write().await;
                lobbies.remove_member(player.lobby_id, client_id)
            };
            if !deleted {
                let notice = Packet::ChatToClient {
                    text: format!("[SERVER] {} disconnected.", display_name),
                };
                self.send_to_lobby(player.lobby_id, &notice).await;
                if let Some(info) = self.lobby_info_packet(player.lobby_id).await {
                    self.send_to_lobby(player.lobby_id, &info).await;
                }
            }
            let overview = self.overview_packet().await;
            self.send_to_unlobbied(&overview).await;
        }
    }

    /// Creates a lobby with the sender as creator and sole member.
    pub async fn create_lobby(&self, client_id: u32, name: &str) -> Result<u32, LobbyError> {
        let mut players = self.players.write().await;
        let player = players.get(client_id).ok_or(LobbyError::NotConnected)?;
        if !player.is_logged_in() {
            return Err(LobbyError::NotLoggedIn);
        }
        if player.lobby_id != 0 {
            return Err(LobbyError::AlreadyInLobby);
        }

        let mut lobbies = self.lobbies.write().await;
        let lobby_id = lobbies.create(name, client_id)?;
        players.set_lobby(client_id, lobby_id);
        Ok(lobby_id)
    }

    /// Adds the sender to the named lobby.
    pub async fn join_lobby(&self, client_id: u32, name: &str) -> Result<u32, LobbyError> {
        let mut players = self.players.write().await;
        let player = players.get(client_id).ok_or(LobbyError::NotConnected)?;
        if !player.is_logged_in() {
            return Err(LobbyError::NotLoggedIn);
        }
        if player.lobby_id != 0 {
            return Err(LobbyError::AlreadyInLobby);
        }

        let mut lobbies = self.lobbies.write().await;
        let lobby_id = lobbies
            .find_id_by_name(name)
            .ok_or_else(|| LobbyError::UnknownName(name.to_string()))?;
        lobbies.join(lobby_id, client_id)?;
        players.set_lobby(client_id, lobby_id);
        Ok(lobby_id)
    }

    /// Removes the sender from its lobby and returns the lobby id it left.
    /// The lobby is deleted if this emptied it.
    pub async fn leave_lobby(&self, client_id: u32) -> Result<u32, LobbyError> {
        let mut players = self.players.write().await;
        let player = players.get(client_id).ok_or(LobbyError::NotConnected)?;
        let lobby_id = player.lobby_id;
        if lobby_id == 0 {
            return Err(LobbyError::NotInLobby);
        }

        let mut lobbies = self.lobbies.write().await;
        lobbies.remove_member(lobby_id, client_id);
        players.set_lobby(client_id, 0);
        Ok(lobby_id)
    }

    /// Transitions the sender's lobby to running. Only the creator may do
    /// this, and only while the lobby is still open.
    pub async fn start_round(&self, client_id: u32) -> Result<u32, LobbyError> {
        let players = self.players.read().await;
        let player = players.get(client_id).ok_or(LobbyError::NotConnected)?;
        if !player.is_logged_in() {
            return Err(LobbyError::NotLoggedIn);
        }
        let lobby_id = player.lobby_id;
        if lobby_id == 0 {
            return Err(LobbyError::NotInLobby);
        }

        let mut lobbies = self.lobbies.write().await;
        {
            let lobby = lobbies.get(lobby_id).ok_or(LobbyError::NotInLobby)?;
            if lobby.creator_id != client_id {
                return Err(LobbyError::NotCreator);
            }
            if lobby.status == LobbyStatus::Running {
                return Err(LobbyError::AlreadyRunning(lobby.name.clone()));
            }
        }
        lobbies.set_running(lobby_id);
        Ok(lobby_id)
    }

    /// Current lobby id of a player, 0 when unlobbied or unknown.
    pub async fn lobby_of(&self, client_id: u32) -> u32 {
        self.players
            .read()
            .await
            .get(client_id)
            .map(|player| player.lobby_id)
            .unwrap_or(0)
    }

    /// Cloned username of a player, if connected and logged in.
    pub async fn username_of(&self, client_id: u32) -> Option<String> {
        self.players.read().await.username(client_id)
    }

    /// Sets or overwrites a player's username. Returns false on a
    /// disconnect race.
    pub async fn set_username(&self, client_id: u32, username: &str) -> bool {
        self.players.write().await.set_username(client_id, username)
    }

    /// Lobby info packet for the given lobby, None if the lobby is gone.
    /// Member names resolve to `#id` for players that vanished mid-build.
    pub async fn lobby_info_packet(&self, lobby_id: u32) -> Option<Packet> {
        let players = self.players.read().await;
        let lobbies = self.lobbies.read().await;
        let lobby = lobbies.get(lobby_id)?;
        let members = lobby
            .member_ids()
            .iter()
            .map(|id| players.username(*id).unwrap_or_else(|| format!("#{}", id)))
            .collect();
        Some(Packet::CurLobbyInfo {
            status: "OK".to_string(),
            lobby_name: lobby.name.clone(),
            members,
        })
    }

    /// Overview packet of the currently open lobbies.
    pub async fn overview_packet(&self) -> Packet {
        let lobbies = self.lobbies.read().await;
        Packet::LobbyOverview {
            status: "OK".to_string(),
            lobbies: lobbies.overview(),
        }
    }

    /// Pushes the post-mutation notifications after a successful lobby
    /// operation: fresh info to the lobby, fresh overview to everyone
    /// outside a lobby.
    pub async fn push_lobby_updates(&self, lobby_id: u32) {
        if let Some(info) = self.lobby_info_packet(lobby_id).await {
            self.send_to_lobby(lobby_id, &info).await;
        }
        let overview = self.overview_packet().await;
        self.send_to_unlobbied(&overview).await;
    }

    /// Records a round-trip sample echoed back by a client.
    pub async fn record_pong(&self, client_id: u32, rtt_millis: u64) {
        let tracker = {
            let sessions = self.sessions.read().await;
            sessions.get(&client_id).map(|handle| Arc::clone(&handle.ping))
        };
        if let Some(tracker) = tracker {
            let mut tracker = tracker.lock().await;
            tracker.record(rtt_millis);
            debug!(
                "Client {} rtt {} ms (avg {:.1} ms over {} samples)",
                client_id,
                rtt_millis,
                tracker.average(),
                tracker.len()
            );
        } else {
            warn!("Pong from unknown client {}", client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Packet;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Registers a player and installs a channel-backed fake session so
    /// routing can be observed without a socket.
    async fn add_fake_client(
        manager: &ConnectionManager,
        client_id: u32,
    ) -> UnboundedReceiver<SessionCommand> {
        let (sender, receiver) = mpsc::unbounded_channel();
        manager.players.write().await.register(client_id);
        manager
            .register_session(
                client_id,
                SessionHandle {
                    sender,
                    ping: Arc::new(Mutex::new(PingTracker::new())),
                },
            )
            .await;
        receiver
    }

    fn drain_lines(receiver: &mut UnboundedReceiver<SessionCommand>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(cmd) = receiver.try_recv() {
            if let SessionCommand::Line(line) = cmd {
                lines.push(line);
            }
        }
        lines
    }

    #[test]
    fn test_client_ids_are_unique_and_increasing() {
        let manager = ConnectionManager::new();
        let first = manager.allocate_client_id();
        let second = manager.allocate_client_id();
        let third = manager.allocate_client_id();
        assert_eq!(first, 1);
        assert!(second > first);
        assert!(third > second);
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_is_noop() {
        let manager = ConnectionManager::new();
        manager.send_to_client(42, &Packet::StartRound).await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let manager = ConnectionManager::new();
        let mut rx1 = add_fake_client(&manager, 1).await;
        let mut rx2 = add_fake_client(&manager, 2).await;

        manager.broadcast(&Packet::StartRound).await;

        assert_eq!(drain_lines(&mut rx1), vec!["STRND".to_string()]);
        assert_eq!(drain_lines(&mut rx2), vec!["STRND".to_string()]);
    }

    #[tokio::test]
    async fn test_send_to_unlobbied_skips_lobby_members() {
        let manager = ConnectionManager::new();
        let mut rx1 = add_fake_client(&manager, 1).await;
        let mut rx2 = add_fake_client(&manager, 2).await;

        manager.set_username(1, "alice").await;
        manager.set_username(2, "bob").await;
        manager.create_lobby(1, "den").await.unwrap();

        manager
            .send_to_unlobbied(&Packet::ChatToClient {
                text: "hi".to_string(),
            })
            .await;

        assert!(drain_lines(&mut rx1).is_empty());
        assert_eq!(drain_lines(&mut rx2).len(), 1);
    }

    #[tokio::test]
    async fn test_send_to_lobby_reaches_members_only() {
        let manager = ConnectionManager::new();
        let mut rx1 = add_fake_client(&manager, 1).await;
        let mut rx2 = add_fake_client(&manager, 2).await;
        let mut rx3 = add_fake_client(&manager, 3).await;

        for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
            manager.set_username(id, name).await;
        }
        let lobby_id = manager.create_lobby(1, "den").await.unwrap();
        manager.join_lobby(2, "den").await.unwrap();

        manager.send_to_lobby(lobby_id, &Packet::StartRound).await;

        assert_eq!(drain_lines(&mut rx1).len(), 1);
        assert_eq!(drain_lines(&mut rx2).len(), 1);
        assert!(drain_lines(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn test_player_is_in_at_most_one_lobby() {
        let manager = ConnectionManager::new();
        let _rx1 = add_fake_client(&manager, 1).await;
        let _rx2 = add_fake_client(&manager, 2).await;

        manager.set_username(1, "alice").await;
        manager.set_username(2, "bob").await;
        manager.create_lobby(1, "den").await.unwrap();
        manager.create_lobby(2, "pit").await.unwrap();

        assert_eq!(
            manager.join_lobby(1, "pit").await,
            Err(LobbyError::AlreadyInLobby)
        );
        assert_eq!(
            manager.create_lobby(1, "hole").await,
            Err(LobbyError::AlreadyInLobby)
        );
    }

    #[tokio::test]
    async fn test_lobby_requires_login() {
        let manager = ConnectionManager::new();
        let _rx = add_fake_client(&manager, 1).await;

        assert_eq!(
            manager.create_lobby(1, "den").await,
            Err(LobbyError::NotLoggedIn)
        );
        assert_eq!(
            manager.join_lobby(1, "den").await,
            Err(LobbyError::NotLoggedIn)
        );
    }

    #[tokio::test]
    async fn test_leave_deletes_emptied_lobby() {
        let manager = ConnectionManager::new();
        let _rx = add_fake_client(&manager, 1).await;

        manager.set_username(1, "alice").await;
        let lobby_id = manager.create_lobby(1, "den").await.unwrap();

        assert_eq!(manager.leave_lobby(1).await, Ok(lobby_id));
        assert!(manager.lobby_info_packet(lobby_id).await.is_none());
        assert_eq!(manager.lobby_of(1).await, 0);

        // The name is free again
        assert!(manager.create_lobby(1, "den").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_player_is_idempotent() {
        let manager = ConnectionManager::new();
        let mut rx = add_fake_client(&manager, 1).await;

        manager.remove_player(1).await;
        manager.remove_player(1).await;

        assert!(!manager.is_connected(1).await);
        assert_eq!(rx.recv().await, Some(SessionCommand::Close));
        // Channel closed after the session entry was dropped
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_remove_player_notifies_remaining_lobby_members() {
        let manager = ConnectionManager::new();
        let mut rx1 = add_fake_client(&manager, 1).await;
        let mut rx2 = add_fake_client(&manager, 2).await;

        manager.set_username(1, "alice").await;
        manager.set_username(2, "bob").await;
        manager.create_lobby(1, "den").await.unwrap();
        manager.join_lobby(2, "den").await.unwrap();
        drain_lines(&mut rx1);
        drain_lines(&mut rx2);

        manager.remove_player(1).await;

        let lines = drain_lines(&mut rx2);
        let packets: Vec<Packet> = lines
            .iter()
            .map(|line| Packet::decode(line).unwrap())
            .collect();

        assert!(packets.iter().any(|p| matches!(
            p,
            Packet::ChatToClient { text } if text.contains("alice") && text.contains("disconnected")
        )));
        assert!(packets.iter().any(|p| matches!(
            p,
            Packet::CurLobbyInfo { members, .. } if members == &vec!["bob".to_string()]
        )));

        // The removed client got a Close, no chat
        assert_eq!(rx1.recv().await, Some(SessionCommand::Close));
    }

    #[tokio::test]
    async fn test_start_round_is_creator_only() {
        let manager = ConnectionManager::new();
        let _rx1 = add_fake_client(&manager, 1).await;
        let _rx2 = add_fake_client(&manager, 2).await;

        manager.set_username(1, "alice").await;
        manager.set_username(2, "bob").await;
        let lobby_id = manager.create_lobby(1, "den").await.unwrap();
        manager.join_lobby(2, "den").await.unwrap();

        assert_eq!(manager.start_round(2).await, Err(LobbyError::NotCreator));
        assert_eq!(manager.start_round(1).await, Ok(lobby_id));
        assert!(matches!(
            manager.start_round(1).await,
            Err(LobbyError::AlreadyRunning(_))
        ));

        // A running lobby no longer shows up in the overview
        match manager.overview_packet().await {
            Packet::LobbyOverview { lobbies, .. } => assert!(lobbies.is_empty()),
            other => panic!("Expected overview, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_record_pong_updates_tracker() {
        let manager = ConnectionManager::new();
        let _rx = add_fake_client(&manager, 1).await;

        manager.record_pong(1, 30).await;
        manager.record_pong(1, 50).await;

        let tracker = {
            let sessions = manager.sessions.read().await;
            Arc::clone(&sessions.get(&1).unwrap().ping)
        };
        let tracker = tracker.lock().await;
        assert_eq!(tracker.len(), 2);
    }
}
