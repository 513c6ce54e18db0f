//! Peer-to-peer match link.
//!
//! After an invite is accepted the host opens an ephemeral listener and
//! reports its port to the lobby; the guest receives the host's address and
//! connects directly. Match traffic never passes through the lobby.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use lobby_core::{encode_line, decode_line, FramedReader, LobbyError, LobbyResult, DEFAULT_MAX_LINE};

use crate::client::LobbyClient;

/// How long each side waits for the other's `Hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages exchanged directly between the two players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Hello { user: String },
    Roll { round: u32, value: u8 },
    /// The sender is abandoning the match.
    Leave,
}

/// The host's listening side of a handoff.
pub struct HostEndpoint {
    listener: TcpListener,
    port: u16,
}

impl HostEndpoint {
    /// Bind an ephemeral port on `bind_ip`.
    pub async fn open(bind_ip: IpAddr) -> LobbyResult<Self> {
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(port, "match listener open");
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait up to `window` for the guest to connect.
    pub async fn accept(&self, window: Duration) -> LobbyResult<PeerLink> {
        match tokio::time::timeout(window, self.listener.accept()).await {
            Ok(Ok((stream, remote))) => {
                info!(remote = %remote, "guest connected");
                Ok(PeerLink::new(stream, remote))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LobbyError::Timeout),
        }
    }
}

/// A direct connection to the other player.
pub struct PeerLink {
    reader: FramedReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    remote: SocketAddr,
}

impl PeerLink {
    fn new(stream: TcpStream, remote: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        Self {
            reader: FramedReader::new(r, DEFAULT_MAX_LINE),
            writer: w,
            remote,
        }
    }

    /// Guest side: connect to the host's endpoint.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> LobbyResult<Self> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(Self::new(stream, addr)),
            Ok(Err(e)) => Err(LobbyError::Transport(format!("cannot reach host {addr}: {e}"))),
            Err(_) => Err(LobbyError::Timeout),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send(&mut self, msg: &PeerMessage) -> LobbyResult<()> {
        let line = encode_line(msg)?;
        self.writer
            .write_all(&line)
            .await
            .map_err(|_| LobbyError::ConnectionLost)
    }

    /// Next message from the peer. `None` once the peer is gone, whether it
    /// closed cleanly, reset, or sent garbage.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<PeerMessage> {
        match self.reader.next_line().await {
            Ok(Some(line)) => match decode_line(&line) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(remote = %self.remote, error = %e, "peer sent garbage");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(remote = %self.remote, error = %e, "peer link lost");
                None
            }
        }
    }

    /// Exchange `Hello`s; returns the peer's claimed username.
    async fn greet(&mut self, me: &str) -> LobbyResult<String> {
        self.send(&PeerMessage::Hello { user: me.to_string() }).await?;
        match tokio::time::timeout(HELLO_TIMEOUT, self.recv()).await {
            Ok(Some(PeerMessage::Hello { user })) => Ok(user),
            Ok(Some(other)) => Err(LobbyError::InvalidMessage(format!(
                "expected hello from peer, got {other:?}"
            ))),
            Ok(None) => Err(LobbyError::ConnectionLost),
            Err(_) => Err(LobbyError::Timeout),
        }
    }
}

/// Host side of a handoff, run after our invite was ACCEPTED.
///
/// Opens the match listener, reports it to the lobby and waits `window` for
/// the guest. If the guest never shows up, reports `GAME_OVER` so the lobby
/// puts us back ONLINE, and returns `Timeout`.
pub async fn host_handoff(
    client: &LobbyClient,
    guest: &str,
    bind_ip: IpAddr,
    window: Duration,
) -> LobbyResult<PeerLink> {
    let me = client
        .username()
        .ok_or_else(|| LobbyError::InvalidMessage("not logged in".into()))?;
    let endpoint = HostEndpoint::open(bind_ip).await?;
    client.report_port(guest, endpoint.port()).await?;

    let mut link = match endpoint.accept(window).await {
        Ok(link) => link,
        Err(e) => {
            warn!(guest = %guest, error = %e, "guest never connected");
            if let Err(report) = client.game_over().await {
                warn!(error = %report, "could not report cancelled match");
            }
            return Err(e);
        }
    };

    let peer = link.greet(&me).await?;
    if peer != guest {
        warn!(expected = %guest, got = %peer, "peer introduced itself under another name");
    }
    client.game_start(&me, guest).await?;
    Ok(link)
}

/// Guest side of a handoff, run on the lobby's `ConnectTo`.
pub async fn join_handoff(
    client: &LobbyClient,
    host: &str,
    addr: SocketAddr,
    timeout: Duration,
) -> LobbyResult<PeerLink> {
    let me = client
        .username()
        .ok_or_else(|| LobbyError::InvalidMessage("not logged in".into()))?;
    let mut link = PeerLink::connect(addr, timeout).await?;
    link.greet(&me).await?;
    client.game_start(host, &me).await?;
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{logged_in_client, LOCALHOST};

    async fn linked_pair() -> (PeerLink, PeerLink) {
        let endpoint = HostEndpoint::open(LOCALHOST).await.unwrap();
        let addr = SocketAddr::new(LOCALHOST, endpoint.port());
        let (host, guest) = tokio::join!(
            endpoint.accept(Duration::from_secs(5)),
            PeerLink::connect(addr, Duration::from_secs(5))
        );
        (host.unwrap(), guest.unwrap())
    }

    #[tokio::test]
    async fn greet_and_exchange() {
        let (mut host, mut guest) = linked_pair().await;
        let (h, g) = tokio::join!(host.greet("alice"), guest.greet("bob"));
        assert_eq!(h.unwrap(), "bob");
        assert_eq!(g.unwrap(), "alice");

        host.send(&PeerMessage::Roll { round: 1, value: 4 }).await.unwrap();
        assert_eq!(
            guest.recv().await,
            Some(PeerMessage::Roll { round: 1, value: 4 })
        );
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_none() {
        let (mut host, guest) = linked_pair().await;
        drop(guest);
        assert_eq!(host.recv().await, None);
    }

    #[tokio::test]
    async fn accept_window_lapses() {
        let endpoint = HostEndpoint::open(LOCALHOST).await.unwrap();
        assert!(matches!(
            endpoint.accept(Duration::from_millis(50)).await,
            Err(LobbyError::Timeout)
        ));
    }

    #[tokio::test]
    async fn host_handoff_without_guest_reports_game_over() {
        let (client, mut seen) = logged_in_client("alice").await;

        let result = host_handoff(&client, "bob", LOCALHOST, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(LobbyError::Timeout)));

        let _login = seen.recv().await;
        let report = seen.recv().await.unwrap();
        assert!(report.contains("SEND_GUEST_CONN_PORT") && report.contains("bob"));
        assert!(seen.recv().await.unwrap().contains("GAME_OVER"));
    }

    #[tokio::test]
    async fn guest_joins_host_handoff() {
        let (host_client, mut host_seen) = logged_in_client("alice").await;
        let (guest_client, mut guest_seen) = logged_in_client("bob").await;

        let host = host_handoff(&host_client, "bob", LOCALHOST, Duration::from_secs(5));
        let guest = async {
            let _login = host_seen.recv().await;
            let report = host_seen.recv().await.unwrap();
            let port: u16 = report
                .split(|c: char| !c.is_ascii_digit())
                .filter(|s| !s.is_empty())
                .last()
                .and_then(|p| p.parse().ok())
                .expect("port in report");
            join_handoff(
                &guest_client,
                "alice",
                SocketAddr::new(LOCALHOST, port),
                Duration::from_secs(5),
            )
            .await
        };
        let (host, guest) = tokio::join!(host, guest);
        let (mut host, mut guest) = (host.unwrap(), guest.unwrap());

        let _login = guest_seen.recv().await;
        assert!(guest_seen.recv().await.unwrap().contains("GAME_START"));
        host.send(&PeerMessage::Leave).await.unwrap();
        assert_eq!(guest.recv().await, Some(PeerMessage::Leave));
    }

    #[test]
    fn peer_message_wire_form() {
        let json = serde_json::to_string(&PeerMessage::Roll { round: 2, value: 6 }).unwrap();
        assert_eq!(json, r#"{"type":"roll","round":2,"value":6}"#);
    }
}
