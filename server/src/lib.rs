//! # Burrow Session Server
//!
//! TCP session server for a small multiplayer game: players log in with a
//! username, gather in named lobbies, chat, and start rounds together. The
//! protocol is line-oriented with fixed five-character type codes; the wire
//! format lives in the `shared` crate so clients and tests speak the same
//! language.
//!
//! ## Architecture
//!
//! One [`network::ConnectionManager`] holds all shared state (players,
//! lobbies, session table) behind async locks and is passed to every session
//! as an `Arc`. Each accepted connection runs three tasks (see
//! [`session`]): a read loop that parses and dispatches packets, a write
//! task that owns the socket's write half and drains a per-session channel,
//! and a ping task that measures round-trip times. Handlers route replies
//! through the manager, never through the socket directly, so a slow client
//! cannot stall anyone else.

pub mod highscore;
pub mod lobbies;
pub mod network;
pub mod ping;
pub mod players;
pub mod session;
