//! Player registry: the authoritative mapping from connection id to player
//! state.
//!
//! A player entry is created the moment a connection is accepted, before any
//! login has happened, and removed exactly once on the disconnect path. All
//! other components refer to players by id; a failed lookup means the
//! connection raced with a disconnect and is treated as benign.

use log::info;
use std::collections::HashMap;

/// State of one connected player.
#[derive(Debug, Clone)]
pub struct Player {
    /// Connection id assigned at accept time, doubles as the player id.
    pub id: u32,
    /// Set by the first successful login packet, overwritten by SETNM.
    pub username: Option<String>,
    /// Current lobby id, 0 meaning unlobbied.
    pub lobby_id: u32,
}

impl Player {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            username: None,
            lobby_id: 0,
        }
    }

    /// A player counts as logged in once a username is set.
    pub fn is_logged_in(&self) -> bool {
        self.username.is_some()
    }
}

/// All connected players, indexed by connection id.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: HashMap<u32, Player>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the registry entry for a freshly accepted connection.
    /// Called once per connection, before the read loop starts.
    pub fn register(&mut self, id: u32) {
        self.players.insert(id, Player::new(id));
    }

    /// Sets or overwrites the username. Returns false if the player is gone
    /// (disconnect race).
    pub fn set_username(&mut self, id: u32, username: &str) -> bool {
        if let Some(player) = self.players.get_mut(&id) {
            player.username = Some(username.to_string());
            true
        } else {
            false
        }
    }

    /// Moves the player into the given lobby (0 clears the membership).
    /// Returns false if the player is gone.
    pub fn set_lobby(&mut self, id: u32, lobby_id: u32) -> bool {
        if let Some(player) = self.players.get_mut(&id) {
            player.lobby_id = lobby_id;
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    /// Cloned username of a player, if connected and logged in.
    pub fn username(&self, id: u32) -> Option<String> {
        self.players.get(&id).and_then(|p| p.username.clone())
    }

    /// Deletes the entry on disconnect. Returns the removed player so the
    /// caller can clean up its lobby membership.
    pub fn remove(&mut self, id: u32) -> Option<Player> {
        let removed = self.players.remove(&id);
        if removed.is_some() {
            info!("Player {} removed from registry", id);
        }
        removed
    }

    /// Ids of all players currently not in any lobby.
    pub fn unlobbied_ids(&self) -> Vec<u32> {
        self.players
            .values()
            .filter(|p| p.lobby_id == 0)
            .map(|p| p.id)
            .collect()
    }

    /// Ids of every connected player.
    pub fn all_ids(&self) -> Vec<u32> {
        self.players.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
