//! Core server: accepts TCP connections and runs one command loop per client.
//!
//! Each connection gets a writer task draining an outbound queue, so replies
//! and pushes from other handlers (invitations, connect targets, status
//! changes) share one ordered stream. The read side is a line-framed
//! command loop that delegates to the presence table, invite broker and
//! handoff coordinator.

use crate::broker::InviteBroker;
use crate::config::ServerConfig;
use crate::events::EventSink;
use crate::handoff::HandoffCoordinator;
use crate::presence::PresenceTable;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::store::UserStore;
use lobby_core::{
    encode_line, is_known_command, Answer, FramedReader, LobbyError, LobbyResult, Request,
    ServerMessage, Status,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

/// How long a closing connection gets to flush its last replies.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Shared lobby state, injected into every connection handler.
pub struct Lobby {
    pub presence: Arc<PresenceTable>,
    pub registry: Arc<SessionRegistry>,
    pub handoffs: Arc<HandoffCoordinator>,
    pub broker: Arc<InviteBroker>,
}

impl Lobby {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn UserStore>,
        events: Arc<dyn EventSink>,
    ) -> LobbyResult<Self> {
        let presence = Arc::new(PresenceTable::load(store, events.clone())?);
        let registry = Arc::new(SessionRegistry::new());
        let handoffs = Arc::new(HandoffCoordinator::new(
            presence.clone(),
            registry.clone(),
            events.clone(),
            config.handoff_timeout,
        ));
        let broker = Arc::new(InviteBroker::new(
            presence.clone(),
            registry.clone(),
            handoffs.clone(),
            events,
            config.invite_timeout,
        ));
        Ok(Self {
            presence,
            registry,
            handoffs,
            broker,
        })
    }
}

/// Per-connection context threaded through the command loop.
struct Connection {
    conn_id: u64,
    remote: SocketAddr,
    /// Authenticated username, once logged in.
    user: Option<String>,
    /// Sender for this connection's writer task.
    tx: mpsc::Sender<ServerMessage>,
    /// Lines that arrived while the handler was waiting on an invite,
    /// malformed ones included so their errors keep their place.
    deferred: VecDeque<LobbyResult<String>>,
}

impl Connection {
    async fn reply(&self, msg: ServerMessage) {
        if self.tx.send(msg).await.is_err() {
            debug!(conn_id = self.conn_id, "writer gone, dropping reply");
        }
    }

    fn require_login(&self) -> LobbyResult<String> {
        self.user
            .clone()
            .ok_or_else(|| LobbyError::InvalidMessage("login required".into()))
    }
}

/// What the command loop does after a command.
enum Flow {
    Continue,
    /// The socket closed while a command was in progress.
    Disconnected,
}

/// The lobby server instance.
pub struct LobbyServer {
    config: ServerConfig,
    lobby: Arc<Lobby>,
    next_conn_id: AtomicU64,
    /// Connection tasks still running.
    open_conns: AtomicUsize,
    /// Signalled when the last connection task finishes.
    drained: Notify,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl LobbyServer {
    /// Create a new server instance.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn UserStore>,
        events: Arc<dyn EventSink>,
    ) -> LobbyResult<Self> {
        let lobby = Arc::new(Lobby::new(&config, store, events)?);
        Ok(Self {
            config,
            lobby,
            next_conn_id: AtomicU64::new(1),
            open_conns: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> LobbyResult<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| LobbyError::Transport(format!("cannot bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> LobbyResult<()> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            invite_timeout_secs = self.config.invite_timeout.as_secs(),
            handoff_timeout_secs = self.config.handoff_timeout.as_secs(),
            "lobby-server ready"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let srv = self.clone();
                            srv.open_conns.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                if let Err(e) = srv.handle_connection(stream, remote).await {
                                    warn!(remote = %remote, error = %e, "connection error");
                                }
                                if srv.open_conns.fetch_sub(1, Ordering::SeqCst) == 1 {
                                    srv.drained.notify_waiters();
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    let sessions = self.lobby.registry.count().await;
                    let pending_invites = self.lobby.broker.pending_count().await;
                    let open_handoffs = self.lobby.handoffs.open_count().await;
                    info!(sessions, pending_invites, open_handoffs, "listener stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Ask the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
    }

    /// Wait up to `grace` for connection tasks to say goodbye and sign off.
    /// Returns how many were still running when the grace period ended.
    pub async fn drain(&self, grace: Duration) -> usize {
        let all_closed = async {
            loop {
                let notified = self.drained.notified();
                if self.open_conns.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(grace, all_closed).await.is_err() {
            let left = self.open_conns.load(Ordering::SeqCst);
            warn!(connections = left, "shutdown grace period ended with connections open");
            return left;
        }
        0
    }

    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) -> LobbyResult<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        info!(conn_id, remote = %remote, "connection opened");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let line = match encode_line(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "failed to encode message");
                        continue;
                    }
                };
                if write_half.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        let mut reader = FramedReader::new(read_half, self.config.max_line_bytes);
        let mut conn = Connection {
            conn_id,
            remote,
            user: None,
            tx,
            deferred: VecDeque::new(),
        };
        let result = self.session_loop(&mut conn, &mut reader).await;

        self.sign_off(&mut conn).await;
        drop(conn);
        if tokio::time::timeout(FLUSH_GRACE, writer).await.is_err() {
            debug!(conn_id, "writer did not drain in time");
        }
        info!(conn_id, remote = %remote, "connection closed");

        match result {
            Err(LobbyError::ConnectionLost) => {
                debug!(conn_id, "connection dropped abruptly");
                Ok(())
            }
            other => other,
        }
    }

    async fn session_loop(
        &self,
        conn: &mut Connection,
        reader: &mut FramedReader<OwnedReadHalf>,
    ) -> LobbyResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let line = match conn.deferred.pop_front() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    conn.reply(ServerMessage::error(&e)).await;
                    continue;
                }
                None => tokio::select! {
                    _ = shutdown_rx.recv() => {
                        conn.reply(ServerMessage::error(&LobbyError::Other(
                            "server shutting down".into(),
                        )))
                        .await;
                        return Ok(());
                    }
                    line = reader.next_line() => match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!(conn_id = conn.conn_id, "peer closed");
                            return Ok(());
                        }
                        Err(e @ LobbyError::InvalidMessage(_)) => {
                            conn.reply(ServerMessage::error(&e)).await;
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                },
            };

            match self.dispatch(conn, reader, &line).await {
                Flow::Continue => {}
                Flow::Disconnected => return Ok(()),
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &mut Connection,
        reader: &mut FramedReader<OwnedReadHalf>,
        line: &str,
    ) -> Flow {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                let msg = if self.answer_garbled(conn, line).await {
                    LobbyError::InvalidMessage("unexpected response, pending invite declined".into())
                } else {
                    e
                };
                conn.reply(ServerMessage::error(&msg)).await;
                return Flow::Continue;
            }
        };

        debug!(conn_id = conn.conn_id, user = ?conn.user, command = request.name(), "command");
        match self.execute(conn, reader, request).await {
            Ok(flow) => flow,
            Err(e) => {
                debug!(conn_id = conn.conn_id, error = %e, "command rejected");
                conn.reply(ServerMessage::error(&e)).await;
                Flow::Continue
            }
        }
    }

    /// An unrecognised line from a guest holding a pending invite counts as
    /// its answer.
    async fn answer_garbled(&self, conn: &Connection, line: &str) -> bool {
        let Some(user) = &conn.user else {
            return false;
        };
        if is_known_command(line) {
            return false;
        }
        self.lobby
            .broker
            .answer(user, None, Answer::Garbled(line.to_string()))
            .await
            .is_ok()
    }

    async fn execute(
        &self,
        conn: &mut Connection,
        reader: &mut FramedReader<OwnedReadHalf>,
        request: Request,
    ) -> LobbyResult<Flow> {
        let lobby = &self.lobby;
        let reply = match request {
            Request::Register { user, password } => {
                lobby.presence.register(&user, &password).await?;
                ServerMessage::ok(format!("registered {user}"))
            }
            Request::Login { user, password } => {
                if let Some(current) = &conn.user {
                    return Err(LobbyError::Conflict(format!(
                        "already logged in as {current}"
                    )));
                }
                lobby.presence.login(&user, &password, conn.remote).await?;
                lobby
                    .registry
                    .put(
                        &user,
                        SessionHandle::new(conn.conn_id, conn.remote, conn.tx.clone()),
                    )
                    .await;
                info!(conn_id = conn.conn_id, user = %user, "logged in");
                conn.user = Some(user.clone());
                ServerMessage::ok(format!("welcome {user}"))
            }
            Request::Logout => {
                conn.require_login()?;
                self.sign_off(conn).await;
                ServerMessage::ok("logged out")
            }
            Request::ListUsersOnline { user } => {
                let me = conn.require_login()?;
                require_self(&me, &user)?;
                ServerMessage::Users {
                    users: lobby.presence.list(Status::Online, Some(&me)).await,
                }
            }
            Request::ListUsersPlaying => {
                conn.require_login()?;
                ServerMessage::Users {
                    users: lobby.presence.list(Status::Playing, None).await,
                }
            }
            Request::GameIni { host, guest } => {
                let me = conn.require_login()?;
                require_self(&me, &host)?;
                return self.run_invite(conn, reader, &me, &guest).await;
            }
            Request::Accept { token } => {
                let me = conn.require_login()?;
                lobby
                    .broker
                    .answer(&me, token.as_ref(), Answer::Accept)
                    .await?;
                ServerMessage::ok("invite accepted, waiting for connect target")
            }
            Request::Decline { token } => {
                let me = conn.require_login()?;
                lobby
                    .broker
                    .answer(&me, token.as_ref(), Answer::Decline)
                    .await?;
                ServerMessage::ok("invite declined")
            }
            Request::SendGuestConnPort { guest, port } => {
                let me = conn.require_login()?;
                lobby.handoffs.report_port(&me, &guest, port).await?;
                ServerMessage::ok(format!("connect target sent to {guest}"))
            }
            Request::GameStart { host, guest } => {
                let me = conn.require_login()?;
                if me != host && me != guest {
                    return Err(LobbyError::Conflict("you can only act as yourself".into()));
                }
                lobby.handoffs.establish(&host, &guest).await?;
                ServerMessage::ok("match started")
            }
            Request::GameOver { user } => {
                let me = conn.require_login()?;
                require_self(&me, &user)?;
                let opponent = lobby.handoffs.opponent(&me).await;
                info!(user = %me, opponent = ?opponent, "match over reported");
                lobby.handoffs.game_over(&me).await;
                ServerMessage::ok("match over")
            }
            Request::Available { user } => {
                let me = conn.require_login()?;
                require_self(&me, &user)?;
                if lobby.broker.involves(&me).await {
                    return Err(LobbyError::Conflict(
                        "an invite is still pending, answer it first".into(),
                    ));
                }
                lobby.presence.set_available(&me).await?;
                ServerMessage::ok("available for invites")
            }
        };
        conn.reply(reply).await;
        Ok(Flow::Continue)
    }

    /// `GAME_INI`: create the invite, then suspend this handler until it
    /// resolves. Commands arriving meanwhile are deferred; a closed socket
    /// aborts the invite.
    async fn run_invite(
        &self,
        conn: &mut Connection,
        reader: &mut FramedReader<OwnedReadHalf>,
        host: &str,
        guest: &str,
    ) -> LobbyResult<Flow> {
        let broker = &self.lobby.broker;
        let pending = broker.initiate(host, guest).await?;
        let token = pending.token.clone();
        conn.reply(ServerMessage::Invited {
            token: token.clone(),
            guest: guest.to_string(),
            expires_in_ms: pending.expires_in().as_millis() as u64,
        })
        .await;

        // Boxed so it can be dropped before aborting: a wait caught inside
        // the expiry path holds the invite table lock.
        let mut wait = Box::pin(broker.wait(pending));
        let outcome = loop {
            tokio::select! {
                outcome = &mut wait => break Some(outcome),
                line = reader.next_line() => match line {
                    Ok(Some(line)) => conn.deferred.push_back(Ok(line)),
                    Err(e @ LobbyError::InvalidMessage(_)) => conn.deferred.push_back(Err(e)),
                    Ok(None) | Err(_) => break None,
                },
            }
        };
        drop(wait);

        let Some(outcome) = outcome else {
            info!(token = %token, host = %host, "host left while waiting");
            broker.abort(&token).await;
            return Ok(Flow::Disconnected);
        };
        conn.reply(ServerMessage::InviteResult { token, outcome }).await;
        Ok(Flow::Continue)
    }

    /// Disconnect/logout cleanup. Idempotent.
    async fn sign_off(&self, conn: &mut Connection) {
        let Some(user) = conn.user.take() else {
            return;
        };
        let lobby = &self.lobby;
        lobby.presence.logout(&user).await;
        let invites = lobby.broker.abort_for(&user).await;
        let handoffs = lobby.handoffs.abort_for(&user).await;
        lobby.registry.remove_if(&user, conn.conn_id).await;
        info!(
            conn_id = conn.conn_id,
            user = %user,
            aborted_invites = invites,
            aborted_handoffs = handoffs,
            "signed off"
        );
    }
}

fn require_self(me: &str, named: &str) -> LobbyResult<()> {
    if me == named {
        Ok(())
    } else {
        Err(LobbyError::Conflict("you can only act as yourself".into()))
    }
}
