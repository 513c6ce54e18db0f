//! The lobby client.
//!
//! `LobbyClient` owns one lobby connection. A reader task sorts incoming
//! server messages into command replies and pushed notices. The server
//! answers commands strictly in order, so replies are matched to a FIFO of
//! waiters; a `GAME_INI` waiter additionally parks the invite's result
//! channel under the token the server assigns.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lobby_core::{
    encode_line, FramedReader, InviteOutcome, InviteToken, LobbyError, LobbyResult, Request,
    ServerMessage, Status, DEFAULT_MAX_LINE,
};

/// Extra time allowed past an invite's deadline for the result to arrive.
const RESULT_MARGIN: Duration = Duration::from_secs(2);

/// An invitation pushed by the lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub token: InviteToken,
    pub host: String,
    /// The invite reached us while we were mid-match.
    pub while_playing: bool,
    pub message: String,
    pub expires_at: Instant,
}

impl Invitation {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Something the lobby told us without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Invitation(Invitation),
    /// An invite we were shown resolved without our answer.
    InviteClosed {
        token: InviteToken,
        outcome: InviteOutcome,
    },
    /// Our accepted invite's host is listening here.
    ConnectTo {
        token: InviteToken,
        host: String,
        addr: SocketAddr,
    },
    HandoffAborted {
        token: InviteToken,
        reason: String,
    },
    StatusChanged(Status),
}

impl Notice {
    fn from_push(msg: ServerMessage) -> Option<Self> {
        let notice = match msg {
            ServerMessage::Invitation {
                token,
                host,
                while_playing,
                expires_in_ms,
                message,
            } => Notice::Invitation(Invitation {
                token,
                host,
                while_playing,
                message,
                expires_at: Instant::now() + Duration::from_millis(expires_in_ms),
            }),
            ServerMessage::InviteClosed { token, outcome } => Notice::InviteClosed { token, outcome },
            ServerMessage::ConnectTo {
                token,
                host,
                addr,
                port,
            } => Notice::ConnectTo {
                token,
                host,
                addr: SocketAddr::new(addr, port),
            },
            ServerMessage::HandoffAborted { token, reason } => {
                Notice::HandoffAborted { token, reason }
            }
            ServerMessage::StatusChanged { status } => Notice::StatusChanged(status),
            _ => return None,
        };
        Some(notice)
    }
}

/// A reply slot in the FIFO.
enum Waiter {
    Reply(oneshot::Sender<LobbyResult<ServerMessage>>),
    /// `GAME_INI`: the reply is `Invited`, the result comes later as a push.
    Invite {
        reply: oneshot::Sender<LobbyResult<ServerMessage>>,
        result: oneshot::Sender<InviteOutcome>,
    },
}

#[derive(Default)]
struct Pending {
    closed: bool,
    replies: VecDeque<Waiter>,
    results: HashMap<InviteToken, oneshot::Sender<InviteOutcome>>,
}

/// An invite we sent, waiting for the guest.
#[derive(Debug)]
pub struct InviteTicket {
    pub token: InviteToken,
    pub guest: String,
    pub expires_in: Duration,
    result: oneshot::Receiver<InviteOutcome>,
}

impl InviteTicket {
    /// Wait for the lobby to report the outcome.
    pub async fn outcome(self) -> LobbyResult<InviteOutcome> {
        match tokio::time::timeout(self.expires_in + RESULT_MARGIN, self.result).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(LobbyError::ConnectionLost),
            Err(_) => Err(LobbyError::Timeout),
        }
    }
}

/// A connection to the lobby server.
pub struct LobbyClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Pending>>,
    connected: Arc<AtomicBool>,
    /// Username once logged in.
    user: RwLock<Option<String>>,
    local_addr: SocketAddr,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl LobbyClient {
    /// Connect to a lobby server. Returns the client and the stream of
    /// pushed notices.
    pub async fn connect(
        addr: impl ToSocketAddrs,
    ) -> LobbyResult<(Self, mpsc::UnboundedReceiver<Notice>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| LobbyError::Transport(format!("cannot reach lobby: {e}")))?;
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(Mutex::new(Pending::default()));
        let connected = Arc::new(AtomicBool::new(true));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let reader_handle = {
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                let reader = FramedReader::new(read_half, DEFAULT_MAX_LINE * 16);
                Self::read_loop(reader, pending, notice_tx).await;
                connected.store(false, Ordering::SeqCst);
            })
        };

        info!(remote = %remote, "connected to lobby");
        let client = Self {
            writer: Mutex::new(write_half),
            pending,
            connected,
            user: RwLock::new(None),
            local_addr,
            reader_handle,
        };
        Ok((client, notice_rx))
    }

    /// Whether the lobby connection is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Logged-in username.
    pub fn username(&self) -> Option<String> {
        self.user.read().ok().and_then(|u| u.clone())
    }

    /// Local address of the lobby connection; the interface peers reach us on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn register(&self, user: &str, password: &str) -> LobbyResult<String> {
        self.expect_ok(Request::Register {
            user: user.into(),
            password: password.into(),
        })
        .await
    }

    pub async fn login(&self, user: &str, password: &str) -> LobbyResult<String> {
        let message = self
            .expect_ok(Request::Login {
                user: user.into(),
                password: password.into(),
            })
            .await?;
        if let Ok(mut current) = self.user.write() {
            *current = Some(user.to_string());
        }
        Ok(message)
    }

    pub async fn logout(&self) -> LobbyResult<String> {
        let message = self.expect_ok(Request::Logout).await?;
        if let Ok(mut current) = self.user.write() {
            *current = None;
        }
        Ok(message)
    }

    /// Online players other than us.
    pub async fn list_online(&self) -> LobbyResult<Vec<String>> {
        let user = self.me()?;
        self.expect_users(Request::ListUsersOnline { user }).await
    }

    pub async fn list_playing(&self) -> LobbyResult<Vec<String>> {
        self.expect_users(Request::ListUsersPlaying).await
    }

    /// Send `GAME_INI` and return once the lobby has created the invite.
    pub async fn send_invite(&self, guest: &str) -> LobbyResult<InviteTicket> {
        let host = self.me()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let request = Request::GameIni {
            host,
            guest: guest.into(),
        };
        let waiter = Waiter::Invite {
            reply: reply_tx,
            result: result_tx,
        };
        match self.round_trip(&request, waiter, reply_rx).await? {
            ServerMessage::Invited {
                token,
                guest,
                expires_in_ms,
            } => Ok(InviteTicket {
                token,
                guest,
                expires_in: Duration::from_millis(expires_in_ms),
                result: result_rx,
            }),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Invite `guest` and wait for the outcome.
    pub async fn invite(&self, guest: &str) -> LobbyResult<InviteOutcome> {
        self.send_invite(guest).await?.outcome().await
    }

    pub async fn accept(&self, token: Option<&InviteToken>) -> LobbyResult<String> {
        self.expect_ok(Request::Accept {
            token: token.cloned(),
        })
        .await
    }

    pub async fn decline(&self, token: Option<&InviteToken>) -> LobbyResult<String> {
        self.expect_ok(Request::Decline {
            token: token.cloned(),
        })
        .await
    }

    /// `SEND_GUEST_CONN_PORT`: tell the lobby where our match listener is.
    pub async fn report_port(&self, guest: &str, port: u16) -> LobbyResult<String> {
        self.expect_ok(Request::SendGuestConnPort {
            guest: guest.into(),
            port,
        })
        .await
    }

    pub async fn game_start(&self, host: &str, guest: &str) -> LobbyResult<String> {
        self.expect_ok(Request::GameStart {
            host: host.into(),
            guest: guest.into(),
        })
        .await
    }

    pub async fn game_over(&self) -> LobbyResult<String> {
        let user = self.me()?;
        self.expect_ok(Request::GameOver { user }).await
    }

    /// Re-arm our notification flag after letting an invite time out.
    pub async fn available(&self) -> LobbyResult<String> {
        let user = self.me()?;
        self.expect_ok(Request::Available { user }).await
    }

    /// Close the write side; the server signs us off.
    pub async fn close(&self) -> LobbyResult<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn me(&self) -> LobbyResult<String> {
        self.username()
            .ok_or_else(|| LobbyError::InvalidMessage("not logged in".into()))
    }

    async fn expect_ok(&self, request: Request) -> LobbyResult<String> {
        match self.request(&request).await? {
            ServerMessage::Ok { message } => Ok(message),
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn expect_users(&self, request: Request) -> LobbyResult<Vec<String>> {
        match self.request(&request).await? {
            ServerMessage::Users { users } => Ok(users),
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn request(&self, request: &Request) -> LobbyResult<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(request, Waiter::Reply(tx), rx).await
    }

    /// Queue the waiter and write the command under the writer lock, so the
    /// FIFO order matches the order on the wire.
    async fn round_trip(
        &self,
        request: &Request,
        waiter: Waiter,
        rx: oneshot::Receiver<LobbyResult<ServerMessage>>,
    ) -> LobbyResult<ServerMessage> {
        let line = encode_line(request)?;
        {
            let mut writer = self.writer.lock().await;
            {
                let mut pending = self.pending.lock().await;
                if pending.closed {
                    return Err(LobbyError::ConnectionLost);
                }
                pending.replies.push_back(waiter);
            }
            if let Err(e) = writer.write_all(&line).await {
                debug!(command = request.name(), error = %e, "lobby write failed");
                return Err(LobbyError::ConnectionLost);
            }
        }

        let reply = rx.await.map_err(|_| LobbyError::ConnectionLost)??;
        match reply {
            ServerMessage::Error { kind, message } => Err(LobbyError::from_wire(kind, message)),
            other => Ok(other),
        }
    }

    async fn read_loop(
        mut reader: FramedReader<OwnedReadHalf>,
        pending: Arc<Mutex<Pending>>,
        notices: mpsc::UnboundedSender<Notice>,
    ) {
        loop {
            let msg = match reader.next::<ServerMessage>().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("lobby closed the connection");
                    break;
                }
                Err(e @ LobbyError::Codec(_)) => {
                    warn!(error = %e, "skipping undecodable lobby message");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "lobby connection lost");
                    break;
                }
            };

            if let ServerMessage::InviteResult { token, outcome } = msg {
                let slot = pending.lock().await.results.remove(&token);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(token = %token, "result for an invite nobody waits on"),
                }
                continue;
            }
            if msg.is_push() {
                if let Some(notice) = Notice::from_push(msg) {
                    let _ = notices.send(notice);
                }
                continue;
            }

            let mut pending = pending.lock().await;
            match pending.replies.pop_front() {
                Some(Waiter::Reply(tx)) => {
                    let _ = tx.send(Ok(msg));
                }
                Some(Waiter::Invite { reply, result }) => {
                    if let ServerMessage::Invited { token, .. } = &msg {
                        pending.results.insert(token.clone(), result);
                    }
                    let _ = reply.send(Ok(msg));
                }
                None => warn!(message = ?msg, "unsolicited lobby message"),
            }
        }

        let mut pending = pending.lock().await;
        pending.closed = true;
        for waiter in pending.replies.drain(..) {
            let tx = match waiter {
                Waiter::Reply(tx) => tx,
                Waiter::Invite { reply, .. } => reply,
            };
            let _ = tx.send(Err(LobbyError::ConnectionLost));
        }
        pending.results.clear();
    }
}

impl Drop for LobbyClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn unexpected(request: &Request, reply: &ServerMessage) -> LobbyError {
    LobbyError::InvalidMessage(format!(
        "unexpected reply to {}: {reply:?}",
        request.name()
    ))
}
