//! Lobby manager: the authoritative mapping from lobby id to lobby state.
//!
//! Lobby ids are allocated on creation and never reused. A lobby that loses
//! its last member is deleted by the same operation, so an empty lobby is
//! never observable through `get`. Status only ever moves from open to
//! running; there is no way back.

use log::info;
use shared::{LobbyEntry, MAX_OVERVIEW_LOBBIES};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Lifecycle of a lobby. `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyStatus {
    Open,
    Running,
}

impl fmt::Display for LobbyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LobbyStatus::Open => write!(f, "open"),
            LobbyStatus::Running => write!(f, "running"),
        }
    }
}

/// Semantic failures of lobby operations. The display text doubles as the
/// message of the status reply sent to the offending client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LobbyError {
    #[error("A lobby named `{0}` already exists.")]
    DuplicateName(String),
    #[error("No lobby named `{0}` exists.")]
    UnknownName(String),
    #[error("Lobby `{0}` is already running.")]
    AlreadyRunning(String),
    #[error("You are already in a lobby.")]
    AlreadyInLobby,
    #[error("You are not in a lobby.")]
    NotInLobby,
    #[error("You are not logged in.")]
    NotLoggedIn,
    #[error("Not connected.")]
    NotConnected,
    #[error("Only the lobby creator can start the round.")]
    NotCreator,
}

/// One named grouping of players.
#[derive(Debug, Clone)]
pub struct Lobby {
    pub id: u32,
    pub name: String,
    pub creator_id: u32,
    pub status: LobbyStatus,
    members: Vec<u32>,
}

impl Lobby {
    fn new(id: u32, name: &str, creator_id: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            creator_id,
            status: LobbyStatus::Open,
            members: vec![creator_id],
        }
    }

    /// Member ids in join order.
    pub fn member_ids(&self) -> &[u32] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, player_id: u32) -> bool {
        self.members.contains(&player_id)
    }
}

/// All active lobbies, indexed by lobby id.
#[derive(Debug, Default)]
pub struct LobbyManager {
    lobbies: HashMap<u32, Lobby>,
    next_lobby_id: u32,
}

impl LobbyManager {
    pub fn new() -> Self {
        Self {
            lobbies: HashMap::new(),
            next_lobby_id: 1,
        }
    }

    /// Creates a lobby with the creator as its first member and returns the
    /// new lobby id. Names must be unique among active lobbies.
    pub fn create(&mut self, name: &str, creator_id: u32) -> Result<u32, LobbyError> {
        if self.find_id_by_name(name).is_some() {
            return Err(LobbyError::DuplicateName(name.to_string()));
        }

        let lobby_id = self.next_lobby_id;
        self.next_lobby_id += 1;
        self.lobbies
            .insert(lobby_id, Lobby::new(lobby_id, name, creator_id));
        info!(
            "Lobby `{}` (#{}) created by player {}",
            name, lobby_id, creator_id
        );
        Ok(lobby_id)
    }

    pub fn get(&self, lobby_id: u32) -> Option<&Lobby> {
        self.lobbies.get(&lobby_id)
    }

    pub fn find_id_by_name(&self, name: &str) -> Option<u32> {
        self.lobbies
            .values()
            .find(|lobby| lobby.name == name)
            .map(|lobby| lobby.id)
    }

    /// Adds a member to an open lobby. The caller is responsible for
    /// checking that the player is not in another lobby already.
    pub fn join(&mut self, lobby_id: u32, player_id: u32) -> Result<(), LobbyError> {
        let lobby = self
            .lobbies
            .get_mut(&lobby_id)
            .ok_or_else(|| LobbyError::UnknownName(format!("#{}", lobby_id)))?;
        if lobby.status == LobbyStatus::Running {
            return Err(LobbyError::AlreadyRunning(lobby.name.clone()));
        }
        if !lobby.members.contains(&player_id) {
            lobby.members.push(player_id);
        }
        Ok(())
    }

    /// Removes a member; deletes the lobby if it became empty. Returns true
    /// if the lobby was deleted.
    pub fn remove_member(&mut self, lobby_id: u32, player_id: u32) -> bool {
        let Some(lobby) = self.lobbies.get_mut(&lobby_id) else {
            return false;
        };
        lobby.members.retain(|id| *id != player_id);
        if lobby.is_empty() {
            let name = lobby.name.clone();
            self.lobbies.remove(&lobby_id);
            info!("Lobby `{}` (#{}) is empty and was deleted", name, lobby_id);
            true
        } else {
            false
        }
    }

    /// Transitions an open lobby to running. Returns false if the lobby is
    /// gone or already running.
    pub fn set_running(&mut self, lobby_id: u32) -> bool {
        match self.lobbies.get_mut(&lobby_id) {
            Some(lobby) if lobby.status == LobbyStatus::Open => {
                lobby.status = LobbyStatus::Running;
                info!("Lobby `{}` (#{}) is now running", lobby.name, lobby_id);
                true
            }
            _ => false,
        }
    }

    /// Overview of open lobbies for clients outside any lobby, capped at
    /// [`MAX_OVERVIEW_LOBBIES`] entries.
    pub fn overview(&self) -> Vec<LobbyEntry> {
        let mut open: Vec<&Lobby> = self
            .lobbies
            .values()
            .filter(|lobby| lobby.status == LobbyStatus::Open)
            .collect();
        // Stable listing order for clients: oldest lobby first.
        open.sort_by_key(|lobby| lobby.id);
        open.iter()
            .take(MAX_OVERVIEW_LOBBIES)
            .map(|lobby| LobbyEntry {
                name: lobby.name.clone(),
                member_count: lobby.len() as u32,
                status: lobby.status.to_string(),
            })
            .collect()
    }

    /// Member ids of a lobby, empty if the lobby does not exist.
    pub fn member_ids(&self, lobby_id: u32) -> Vec<u32> {
        self.lobbies
            .get(&lobby_id)
            .map(|lobby| lobby.members.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }
}
