//! End-to-end tests running the real server over loopback TCP.
//!
//! Each test binds an ephemeral port, runs the accept loop and drives one or
//! more raw line-protocol clients against it, asserting on the decoded
//! packets that come back. Server PING traffic is skipped transparently.

use server::network::ConnectionManager;
use shared::{Packet, PacketKind};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds an ephemeral port and runs the server's accept loop on it.
async fn start_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = ConnectionManager::new();
    tokio::spawn(async move {
        let _ = Arc::clone(&manager).accept_loop(listener).await;
    });
    addr
}

/// One raw protocol client.
struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Reads packets until one of the wanted kind arrives, skipping the
    /// server's periodic pings. Panics on timeout or closed connection.
    async fn expect(&mut self, kind: PacketKind) -> Packet {
        timeout(RECV_TIMEOUT, async {
            loop {
                let mut line = String::new();
                let n = self.reader.read_line(&mut line).await.unwrap();
                assert!(n > 0, "connection closed while waiting for {:?}", kind);
                let trimmed = line.trim_end_matches(['\r', '\n']);
                match Packet::decode(trimmed) {
                    Ok(packet) if packet.kind() == kind => return packet,
                    Ok(Packet::Ping { .. }) => continue,
                    Ok(other) => panic!("expected {:?}, got {:?}", kind, other),
                    Err(e) => panic!("undecodable server line `{}`: {}", trimmed, e),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", kind))
    }

    /// Like `expect`, but tolerates other packet kinds arriving in between
    /// (lobby updates fan out in no particular interleaving).
    async fn expect_eventually(&mut self, kind: PacketKind) -> Packet {
        timeout(RECV_TIMEOUT, async {
            loop {
                let mut line = String::new();
                let n = self.reader.read_line(&mut line).await.unwrap();
                assert!(n > 0, "connection closed while waiting for {:?}", kind);
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if let Ok(packet) = Packet::decode(trimmed) {
                    if packet.kind() == kind {
                        return packet;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", kind))
    }

    /// Logs in and consumes the status reply plus the initial overview.
    async fn login(&mut self, username: &str) {
        self.send(&format!("LOGIN {}", username)).await;
        match self.expect(PacketKind::LoginStatus).await {
            Packet::LoginStatus { status } => assert_eq!(status, "OK"),
            other => panic!("unexpected {:?}", other),
        }
        self.expect(PacketKind::LobbyOverview).await;
    }
}

#[tokio::test]
async fn login_gets_status_and_overview() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    client.send("LOGIN alice").await;
    match client.expect(PacketKind::LoginStatus).await {
        Packet::LoginStatus { status } => assert_eq!(status, "OK"),
        other => panic!("unexpected {:?}", other),
    }
    match client.expect(PacketKind::LobbyOverview).await {
        Packet::LobbyOverview { status, lobbies } => {
            assert_eq!(status, "OK");
            assert!(lobbies.is_empty());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn create_and_join_lobby_fans_out_updates() {
    let addr = start_server().await;
    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    alice.login("alice").await;
    bob.login("bob").await;

    alice.send("CRLBY den").await;
    match alice.expect_eventually(PacketKind::CreateLobbyStatus).await {
        Packet::CreateLobbyStatus { status } => assert_eq!(status, "OK"),
        other => panic!("unexpected {:?}", other),
    }
    match alice.expect_eventually(PacketKind::CurLobbyInfo).await {
        Packet::CurLobbyInfo { lobby_name, members, .. } => {
            assert_eq!(lobby_name, "den");
            assert_eq!(members, vec!["alice".to_string()]);
        }
        other => panic!("unexpected {:?}", other),
    }

    // Bob is unlobbied, so he sees the new lobby in a pushed overview.
    match bob.expect_eventually(PacketKind::LobbyOverview).await {
        Packet::LobbyOverview { lobbies, .. } => {
            assert_eq!(lobbies.len(), 1);
            assert_eq!(lobbies[0].name, "den");
            assert_eq!(lobbies[0].member_count, 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    bob.send("JNLBY den").await;
    match bob.expect_eventually(PacketKind::JoinLobbyStatus).await {
        Packet::JoinLobbyStatus { status } => assert_eq!(status, "OK"),
        other => panic!("unexpected {:?}", other),
    }

    // Both members get the refreshed lobby info.
    for client in [&mut alice, &mut bob] {
        match client.expect_eventually(PacketKind::CurLobbyInfo).await {
            Packet::CurLobbyInfo { members, .. } => {
                assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn duplicate_lobby_name_is_rejected() {
    let addr = start_server().await;
    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    alice.login("alice").await;
    bob.login("bob").await;

    alice.send("CRLBY den").await;
    alice.expect_eventually(PacketKind::CreateLobbyStatus).await;

    bob.send("CRLBY den").await;
    match bob.expect_eventually(PacketKind::CreateLobbyStatus).await {
        Packet::CreateLobbyStatus { status } => {
            assert_ne!(status, "OK");
            assert!(status.contains("den"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn chat_reaches_lobby_members() {
    let addr = start_server().await;
    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    alice.login("alice").await;
    bob.login("bob").await;

    alice.send("CRLBY den").await;
    alice.expect_eventually(PacketKind::CreateLobbyStatus).await;
    bob.send("JNLBY den").await;
    bob.expect_eventually(PacketKind::JoinLobbyStatus).await;

    alice.send("CHATC hello there").await;
    for client in [&mut alice, &mut bob] {
        match client.expect_eventually(PacketKind::ChatToClient).await {
            Packet::ChatToClient { text } => assert_eq!(text, "[alice] hello there"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn leaving_last_member_deletes_the_lobby() {
    let addr = start_server().await;
    let mut alice = TestClient::connect(addr).await;
    alice.login("alice").await;

    alice.send("CRLBY den").await;
    alice.expect_eventually(PacketKind::CreateLobbyStatus).await;

    alice.send("LVLBY").await;
    match alice.expect_eventually(PacketKind::LeaveLobbyStatus).await {
        Packet::LeaveLobbyStatus { status } => assert_eq!(status, "OK"),
        other => panic!("unexpected {:?}", other),
    }

    alice.send("GTLBS").await;
    match alice.expect_eventually(PacketKind::LobbyOverview).await {
        Packet::LobbyOverview { lobbies, .. } => assert!(lobbies.is_empty()),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn abrupt_disconnect_notifies_remaining_members() {
    let addr = start_server().await;
    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    alice.login("alice").await;
    bob.login("bob").await;

    alice.send("CRLBY den").await;
    alice.expect_eventually(PacketKind::CreateLobbyStatus).await;
    bob.send("JNLBY den").await;
    bob.expect_eventually(PacketKind::JoinLobbyStatus).await;
    bob.expect_eventually(PacketKind::CurLobbyInfo).await;

    // Alice's socket vanishes without a DISCN.
    drop(alice);

    match bob.expect_eventually(PacketKind::ChatToClient).await {
        Packet::ChatToClient { text } => {
            assert!(text.contains("alice"));
            assert!(text.contains("disconnected"));
        }
        other => panic!("unexpected {:?}", other),
    }
    match bob.expect_eventually(PacketKind::CurLobbyInfo).await {
        Packet::CurLobbyInfo { members, .. } => {
            assert_eq!(members, vec!["bob".to_string()]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn malformed_lines_do_not_kill_the_connection() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    client.login("alice").await;

    // Too short: dropped. Unknown code: dropped. Invalid payload: status
    // reply. The connection must survive all three.
    client.send("AB").await;
    client.send("XXXXX whatever").await;
    client.send("CRLBY").await;

    match client.expect_eventually(PacketKind::CreateLobbyStatus).await {
        Packet::CreateLobbyStatus { status } => assert_ne!(status, "OK"),
        other => panic!("unexpected {:?}", other),
    }

    // No lobby was created by the invalid packet.
    client.send("GTLBS").await;
    match client.expect_eventually(PacketKind::LobbyOverview).await {
        Packet::LobbyOverview { lobbies, .. } => assert!(lobbies.is_empty()),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn ready_starts_the_round_for_the_creator_only() {
    let addr = start_server().await;
    let mut alice = TestClient::connect(addr).await;
    let mut bob = TestClient::connect(addr).await;
    alice.login("alice").await;
    bob.login("bob").await;

    alice.send("CRLBY den").await;
    alice.expect_eventually(PacketKind::CreateLobbyStatus).await;
    bob.send("JNLBY den").await;
    bob.expect_eventually(PacketKind::JoinLobbyStatus).await;

    // Non-creator READY is ignored; the creator's starts the round for
    // everyone in the lobby.
    bob.send("READY").await;
    alice.send("READY").await;

    alice.expect_eventually(PacketKind::StartRound).await;
    bob.expect_eventually(PacketKind::StartRound).await;
}

#[tokio::test]
async fn disconnect_packet_closes_the_session() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    client.login("alice").await;

    client.send("DISCN").await;

    // The server shuts the socket down; reads drain to EOF.
    let eof = timeout(RECV_TIMEOUT, async {
        loop {
            let mut line = String::new();
            if client.reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
        }
    })
    .await;
    assert!(eof.is_ok(), "server did not close the connection");
}

#[tokio::test]
async fn server_pings_and_accepts_pongs() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    client.login("alice").await;

    // The ping task fires after one interval.
    let ping = client.expect_eventually(PacketKind::Ping).await;
    let Packet::Ping { timestamp } = ping else {
        panic!("expected ping");
    };
    assert!(timestamp > 0);

    // Echo it back; the session must stay healthy.
    client.send(&Packet::Pong { timestamp }.encode()).await;
    client.send("GTLBS").await;
    client.expect_eventually(PacketKind::LobbyOverview).await;
}
