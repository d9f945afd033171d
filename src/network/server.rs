//! WebSocket Game Server
//!
//! Async WebSocket server for multiplayer connections.
//! Handles joins, routes client messages into sessions and runs one fixed
//! rate game loop per session.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock, broadcast};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::config::GameConfig;
use crate::game::state::ClientId;
use crate::network::auth::{authenticate_join, AuthConfig};
use crate::network::dispatch::DispatchError;
use crate::network::protocol::{
    self, ClientMessage, ErrorCode, JoinRequest, ServerError, ServerMessage,
};
use crate::network::session::{GameSession, SessionError, SessionId, SessionManager, SessionState};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Clients silent for longer than this are dropped.
    pub idle_timeout: Duration,
    /// Tick rate for game simulation (Hz).
    pub tick_rate: u32,
    /// Clients per session.
    pub max_players: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            tick_rate: crate::TICK_RATE,
            max_players: 8,
            version: crate::VERSION.to_string(),
        }
    }
}

impl ServerConfig {
    /// Read `BIND_ADDR`, `TICK_RATE`, `MAX_CONNECTIONS` and `MAX_PLAYERS`,
    /// keeping defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(addr) = env_parse("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(rate) = env_parse::<u32>("TICK_RATE").filter(|r| *r > 0) {
            config.tick_rate = rate;
        }
        if let Some(max) = env_parse("MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(max) = env_parse::<usize>("MAX_PLAYERS").filter(|m| *m > 0) {
            config.max_players = max;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%name, %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn server_time_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Connected client state.
struct ConnectedClient {
    /// Connection id.
    client: ClientId,
    /// Session joined (if any).
    session_id: Option<SessionId>,
    /// Last activity.
    last_activity: Instant,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// Shared handles passed to connection tasks.
#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    auth: AuthConfig,
    sessions: Arc<SessionManager>,
    clients: Clients,
}

/// The game server.
pub struct GameServer {
    ctx: ServerContext,
    next_client: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server. The game config's tick rate follows the
    /// server's.
    pub fn new(config: ServerConfig, mut game: GameConfig, auth: AuthConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        if game.tick_rate != config.tick_rate {
            info!(from = game.tick_rate, to = config.tick_rate, "game tick rate set from server config");
            game.tick_rate = config.tick_rate;
        }
        let sessions = Arc::new(SessionManager::new(game, config.max_players));

        Self {
            ctx: ServerContext {
                config,
                auth,
                sessions,
                clients: Arc::new(RwLock::new(BTreeMap::new())),
            },
            next_client: Arc::new(AtomicU64::new(1)),
            shutdown_tx,
        }
    }

    /// Run the server until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        info!("Game server listening on {}", self.ctx.config.bind_addr);
        if !self.ctx.auth.is_configured() {
            warn!("auth not configured, accepting anonymous joins");
        }

        let cleanup_ctx = self.ctx.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_ctx).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.ctx.clients.read().await.len();
                            if clients_count >= self.ctx.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(async move {
                                    if let Err(e) = Self::reject_overloaded(stream, addr).await {
                                        debug!("Rejecting {} failed: {}", addr, e);
                                    }
                                });
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Complete the handshake, tell the client the server is full, close.
    async fn reject_overloaded<S>(stream: S, addr: SocketAddr) -> Result<(), GameServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = tokio::time::timeout(Duration::from_secs(5), accept_async(stream)).await;
        let Ok(ws_stream) = handshake else {
            debug!("Handshake with {} timed out", addr);
            return Ok(());
        };
        let mut ws_stream = ws_stream?;

        let error = ServerMessage::Error(ServerError::new(
            ErrorCode::ServerOverloaded,
            "Server is full, try again later",
        ));
        match error.to_json() {
            Ok(text) => ws_stream.send(Message::Text(text)).await?,
            Err(e) => error!("Failed to serialize message: {}", e),
        }
        ws_stream.close(None).await?;
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let client = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(256);

            ctx.clients.write().await.insert(addr, ConnectedClient {
                client,
                session_id: None,
                last_activity: Instant::now(),
            });

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let client_msg = match msg {
                            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    debug!("Invalid message from {}: {}", addr, e);
                                    let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                        ErrorCode::InvalidInput,
                                        "Invalid message format",
                                    ))).await;
                                    continue;
                                }
                            },
                            Some(Ok(Message::Binary(data))) => match protocol::write_from_bytes(&data) {
                                Ok(request) => ClientMessage::WriteRequest(request),
                                Err(e) => {
                                    debug!("Invalid binary frame from {}: {}", addr, e);
                                    continue;
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => continue,
                        };

                        if let Some(c) = ctx.clients.write().await.get_mut(&addr) {
                            c.last_activity = Instant::now();
                        }

                        if !Self::handle_client_message(addr, client, client_msg, &ctx, &msg_tx).await {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            Self::handle_leave(addr, client, &ctx).await;
            ctx.clients.write().await.remove(&addr);

            // let queued messages (return-to-menu, shutdown) drain
            drop(msg_tx);
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("sender task for {} did not finish", addr);
            }
            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message. Returns false when the connection should close.
    async fn handle_client_message(
        addr: SocketAddr,
        client: ClientId,
        msg: ClientMessage,
        ctx: &ServerContext,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> bool {
        match msg {
            ClientMessage::Join(join) => {
                Self::handle_join(addr, client, join, ctx, sender).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender.send(ServerMessage::Pong {
                    timestamp,
                    server_time: server_time_ms(),
                }).await;
            }
            ClientMessage::Leave => return false,
            other => Self::handle_game_message(client, other, ctx, sender).await,
        }
        true
    }

    /// Authenticate and place a client in a session.
    async fn handle_join(
        addr: SocketAddr,
        client: ClientId,
        join: JoinRequest,
        ctx: &ServerContext,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let already = ctx.clients.read().await.get(&addr).and_then(|c| c.session_id).is_some();
        if already {
            let _ = sender.send(ServerMessage::Error(ServerError::new(
                ErrorCode::AlreadyJoined,
                "Already joined",
            ))).await;
            return;
        }

        let claims = match authenticate_join(join.token.as_deref(), &ctx.auth) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(%addr, error = %e, "join rejected");
                let _ = sender.send(ServerMessage::Error(ServerError::new(ErrorCode::AuthFailed, e.to_string()))).await;
                return;
            }
        };
        let name = match &claims {
            Some(claims) => {
                debug!(%client, account = %claims.account_key(), "join authenticated");
                claims.display_name().to_string()
            }
            None => join.name,
        };

        let (session_id, session, created) = ctx.sessions.find_or_create().await;
        let joined = {
            let mut s = session.write().await;
            s.join(client, name, sender.clone()).map(|welcome| (welcome, s.snapshot()))
        };

        let (welcome, snapshot) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                warn!(%client, error = %e, "join failed");
                let _ = sender.send(ServerMessage::Error(ServerError::new(ErrorCode::SessionClosed, e.to_string()))).await;
                return;
            }
        };

        ctx.sessions.register_client(client, session_id).await;
        if let Some(c) = ctx.clients.write().await.get_mut(&addr) {
            c.session_id = Some(session_id);
        }

        let _ = sender.send(ServerMessage::Welcome(welcome)).await;
        let _ = sender.send(snapshot).await;

        if created {
            let sessions = ctx.sessions.clone();
            let tick_rate = ctx.config.tick_rate;
            tokio::spawn(async move {
                Self::run_session_game_loop(session, sessions, tick_rate).await;
            });
        }
    }

    /// Route an in-game message into the client's session.
    async fn handle_game_message(
        client: ClientId,
        msg: ClientMessage,
        ctx: &ServerContext,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(session) = ctx.sessions.get_client_session(client).await else {
            let _ = sender.send(ServerMessage::Error(ServerError::new(ErrorCode::NotJoined, "Join first"))).await;
            return;
        };

        let result = {
            let mut s = session.write().await;
            s.handle_message(client, msg).map(|out| s.deliver(out))
        };
        match result {
            Ok(_) => {}
            // invalid intents get no client-visible error
            Err(DispatchError::Intent(_)) => {}
            Err(e) => {
                let code = match e {
                    DispatchError::NotOwner { .. } => ErrorCode::NotOwner,
                    DispatchError::NotWritable(_) => ErrorCode::NotWritable,
                    _ => ErrorCode::NotJoined,
                };
                let _ = sender.send(ServerMessage::Error(ServerError::new(code, e.to_string()))).await;
            }
        }
    }

    /// Detach a client from its session.
    async fn handle_leave(addr: SocketAddr, client: ClientId, ctx: &ServerContext) {
        if let Some(session_id) = ctx.sessions.unregister_client(client).await {
            if let Some(session) = ctx.sessions.get_session(&session_id).await {
                session.write().await.leave(client);
            }
        }
        if let Some(c) = ctx.clients.write().await.get_mut(&addr) {
            c.session_id = None;
        }
    }

    /// Run the game loop for a session until it ends or empties.
    async fn run_session_game_loop(
        session: Arc<RwLock<GameSession>>,
        sessions: Arc<SessionManager>,
        tick_rate: u32,
    ) {
        let session_id = session.read().await.id;
        let tick_duration = Duration::from_micros(1_000_000 / tick_rate.max(1) as u64);
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Session {} game loop started at {} Hz", hex::encode(&session_id[..4]), tick_rate);

        let final_state = loop {
            tick_interval.tick().await;

            let state = {
                let mut s = session.write().await;
                let out = s.run_tick();
                let dropped = s.deliver(out);
                if dropped > 0 {
                    debug!(dropped, "messages dropped for lagging clients");
                }
                s.get_state()
            };

            if state != SessionState::Open {
                break state;
            }
        };

        if final_state == SessionState::Ended {
            // give clients time to show results before the world goes away
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        session.write().await.close();
        sessions.remove_session(&session_id).await;
        info!("Session {} removed ({:?})", hex::encode(&session_id[..4]), final_state);
    }

    /// Drop idle connections and closed sessions.
    async fn run_cleanup_loop(ctx: ServerContext) {
        let mut interval = interval(Duration::from_secs(60));

        loop {
            interval.tick().await;

            let now = Instant::now();
            let idle: Vec<(SocketAddr, ClientId)> = {
                let clients = ctx.clients.read().await;
                clients.iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > ctx.config.idle_timeout)
                    .map(|(addr, c)| (*addr, c.client))
                    .collect()
            };

            for (addr, client) in idle {
                Self::handle_leave(addr, client, &ctx).await;
                ctx.clients.write().await.remove(&addr);
                info!("Removed idle client {}", addr);
            }

            ctx.sessions.cleanup().await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.ctx.clients.read().await.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.ctx.sessions.session_count().await
    }
}
