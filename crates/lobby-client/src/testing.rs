//! Fake lobby for unit tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use lobby_core::{encode_line, FramedReader, ServerMessage, DEFAULT_MAX_LINE};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::client::LobbyClient;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A lobby that answers every command with `ok` and records the lines.
pub async fn agreeable_lobby() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut reader = FramedReader::new(r, DEFAULT_MAX_LINE);
        while let Ok(Some(line)) = reader.next_line().await {
            let _ = seen_tx.send(line);
            let reply = encode_line(&ServerMessage::ok("ok")).unwrap();
            if w.write_all(&reply).await.is_err() {
                break;
            }
        }
    });
    (addr, seen_rx)
}

pub async fn logged_in_client(user: &str) -> (LobbyClient, mpsc::UnboundedReceiver<String>) {
    let (addr, seen) = agreeable_lobby().await;
    let (client, _notices) = LobbyClient::connect(addr).await.unwrap();
    client.login(user, "pw").await.unwrap();
    (client, seen)
}
