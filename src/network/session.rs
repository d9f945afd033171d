//! Game Session Management
//!
//! A session owns one `WorldState` and the channels to its clients. The
//! session manager hands joining clients to an open session, creating one
//! when none has room.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::GameConfig;
use crate::game::state::{ClientId, RoundPhase, WorldState};
use crate::game::tick::tick;
use crate::network::dispatch::{self, DispatchError, Outbound, Recipient};
use crate::network::protocol::{ClientMessage, ServerMessage, WelcomeInfo};

/// Unique session identifier.
pub type SessionId = [u8; 16];

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting clients and running.
    Open,
    /// The game reached its end; no new joins.
    Ended,
    /// Every client left.
    Closed,
}

/// A client attached to a session.
#[derive(Debug)]
pub struct SessionPlayer {
    /// Connection id.
    pub client: ClientId,
    /// Display name.
    pub name: String,
    /// When the client joined.
    pub joined_at: DateTime<Utc>,
    /// Message channel to this client.
    pub sender: mpsc::Sender<ServerMessage>,
    /// The channel filled up and messages were dropped; the next message
    /// is preceded by a full snapshot.
    pub lagging: bool,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Session is at capacity.
    #[error("Session is full")]
    SessionFull,

    /// Session no longer accepts clients.
    #[error("Session has ended")]
    SessionEnded,

    /// Client already joined.
    #[error("Already in session")]
    AlreadyInSession,

    /// Client is not part of this session.
    #[error("Not in session")]
    NotInSession,
}

/// One running game.
pub struct GameSession {
    /// Unique session identifier.
    pub id: SessionId,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    state: SessionState,
    world: WorldState,
    players: BTreeMap<ClientId, SessionPlayer>,
    max_players: usize,
}

impl GameSession {
    /// Create a session with a fresh world.
    pub fn new(id: SessionId, config: GameConfig, max_players: usize) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: SessionState::Open,
            world: WorldState::new(id, config),
            players: BTreeMap::new(),
            max_players,
        }
    }

    /// Attach a client and spawn its player.
    pub fn join(
        &mut self,
        client: ClientId,
        name: String,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<WelcomeInfo, SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::SessionEnded);
        }
        if self.players.contains_key(&client) {
            return Err(SessionError::AlreadyInSession);
        }
        if self.players.len() >= self.max_players {
            return Err(SessionError::SessionFull);
        }

        let entity = self.world.connect(client).ok_or(SessionError::SessionEnded)?;
        info!(session = %hex::encode(&self.id[..4]), %client, %name, %entity, "client joined");

        self.players.insert(client, SessionPlayer {
            client,
            name,
            joined_at: Utc::now(),
            sender,
            lagging: false,
        });

        Ok(WelcomeInfo {
            session_id: hex::encode(self.id),
            client,
            entity,
            tick: self.world.tick,
            tick_rate: self.world.config.tick_rate,
            phase: self.world.phase(),
            created_at: self.created_at.to_rfc3339(),
            server_version: crate::VERSION.to_string(),
        })
    }

    /// Detach a client and despawn what it owns.
    pub fn leave(&mut self, client: ClientId) -> bool {
        let Some(player) = self.players.remove(&client) else {
            return false;
        };
        self.world.disconnect(client);
        let stayed = Utc::now().signed_duration_since(player.joined_at);
        info!(%client, name = %player.name, secs = stayed.num_seconds(), "client left session");

        if self.players.is_empty() {
            self.state = SessionState::Closed;
        }
        true
    }

    /// Handle a game message from a joined client.
    ///
    /// Returns messages to deliver immediately (only snapshots; everything
    /// else reaches clients through the next tick's sync).
    pub fn handle_message(&mut self, client: ClientId, message: ClientMessage) -> Result<Vec<Outbound>, DispatchError> {
        if !self.players.contains_key(&client) {
            return Err(DispatchError::NotJoined(client));
        }
        match message {
            ClientMessage::Intent(intent) => dispatch::handle_intent(&mut self.world, client, intent)?,
            ClientMessage::WriteRequest(request) => dispatch::handle_write(&mut self.world, client, request)?,
            ClientMessage::SyncRequest => {
                return Ok(vec![Outbound::client(client, dispatch::snapshot(&self.world))]);
            }
            other => debug!(%client, ?other, "message not handled by session"),
        }
        Ok(Vec::new())
    }

    /// Full snapshot message for one client.
    pub fn snapshot(&self) -> ServerMessage {
        dispatch::snapshot(&self.world)
    }

    /// Run one simulation tick and route its output.
    pub fn run_tick(&mut self) -> Vec<Outbound> {
        if self.state != SessionState::Open {
            return Vec::new();
        }
        let result = tick(&mut self.world);
        let ended = result.game_ended;
        let out = dispatch::route_tick(&self.world, result);
        if ended {
            self.state = SessionState::Ended;
            info!(session = %hex::encode(&self.id[..4]), tick = self.world.tick, "session ended");
        }
        out
    }

    /// Queue routed messages on client channels without waiting.
    ///
    /// Never blocks, so it is safe under the session lock. Returns the
    /// number of messages dropped because a channel was full or closed.
    pub fn deliver(&mut self, outbound: Vec<Outbound>) -> usize {
        let mut dropped = 0;
        for Outbound { to, message } in outbound {
            match to {
                Recipient::All => dropped += self.broadcast(message),
                Recipient::Client(client) => {
                    if !self.send_to(client, message) {
                        dropped += 1;
                    }
                }
            }
        }
        dropped
    }

    /// Send a message to every client. Returns the number dropped.
    pub fn broadcast(&mut self, message: ServerMessage) -> usize {
        let clients: Vec<ClientId> = self.players.keys().copied().collect();
        clients.into_iter()
            .filter(|client| !self.send_to(*client, message.clone()))
            .count()
    }

    /// Queue a message for one client. Returns false if it was dropped.
    ///
    /// A full channel marks the client lagging. Once it drains, the client
    /// gets a fresh snapshot before anything else, so its replica recovers
    /// from the missed deltas.
    pub fn send_to(&mut self, client: ClientId, message: ServerMessage) -> bool {
        let Some(player) = self.players.get_mut(&client) else {
            warn!(%client, "message for client not in session");
            return false;
        };

        if player.lagging {
            if player.sender.try_send(dispatch::snapshot(&self.world)).is_err() {
                return false;
            }
            player.lagging = false;
            info!(%client, tick = self.world.tick, "lagging client resynced");
        }

        match player.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%client, "client channel full, dropping messages until it drains");
                player.lagging = true;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%client, "channel closed");
                false
            }
        }
    }

    /// Tear the world down.
    pub fn close(&mut self) {
        self.world.teardown();
        self.players.clear();
        self.state = SessionState::Closed;
    }

    /// Session state.
    pub fn get_state(&self) -> SessionState {
        self.state
    }

    /// True if a client could join now.
    pub fn has_room(&self) -> bool {
        self.state == SessionState::Open
            && self.players.len() < self.max_players
            && self.world.phase() != RoundPhase::GameEnd
    }

    /// Current tick.
    pub fn current_tick(&self) -> u64 {
        self.world.tick
    }

    /// Current round phase.
    pub fn phase(&self) -> RoundPhase {
        self.world.phase()
    }

    /// Attached client count.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Read access to the world.
    pub fn world(&self) -> &WorldState {
        &self.world
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Manages all active sessions.
pub struct SessionManager {
    config: GameConfig,
    max_players: usize,
    /// Active sessions.
    sessions: RwLock<BTreeMap<SessionId, Arc<RwLock<GameSession>>>>,
    /// Client to session mapping.
    client_sessions: RwLock<BTreeMap<ClientId, SessionId>>,
}

impl SessionManager {
    /// Create a manager whose sessions use `config`.
    pub fn new(config: GameConfig, max_players: usize) -> Self {
        Self {
            config,
            max_players,
            sessions: RwLock::new(BTreeMap::new()),
            client_sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a new session.
    pub async fn create_session(&self) -> (SessionId, Arc<RwLock<GameSession>>) {
        let id = uuid::Uuid::new_v4().into_bytes();
        let session = Arc::new(RwLock::new(GameSession::new(id, self.config.clone(), self.max_players)));

        let mut sessions = self.sessions.write().await;
        sessions.insert(id, session.clone());
        info!(session = %hex::encode(&id[..4]), "session created");

        (id, session)
    }

    /// An open session with room, or a newly created one.
    ///
    /// The flag is true when the session was created by this call and its
    /// game loop still has to be started.
    pub async fn find_or_create(&self) -> (SessionId, Arc<RwLock<GameSession>>, bool) {
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.read().await.has_room() {
                    return (*id, session.clone(), false);
                }
            }
        }
        let (id, session) = self.create_session().await;
        (id, session, true)
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &SessionId) -> Option<Arc<RwLock<GameSession>>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Get the session a client is in.
    pub async fn get_client_session(&self, client: ClientId) -> Option<Arc<RwLock<GameSession>>> {
        let session_id = self.client_sessions.read().await.get(&client).copied()?;
        self.get_session(&session_id).await
    }

    /// Record which session a client is in.
    pub async fn register_client(&self, client: ClientId, session_id: SessionId) {
        let mut client_sessions = self.client_sessions.write().await;
        client_sessions.insert(client, session_id);
    }

    /// Forget a client's session.
    pub async fn unregister_client(&self, client: ClientId) -> Option<SessionId> {
        let mut client_sessions = self.client_sessions.write().await;
        client_sessions.remove(&client)
    }

    /// Remove a session.
    pub async fn remove_session(&self, id: &SessionId) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id);
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Cleanup closed sessions.
    pub async fn cleanup(&self) {
        let mut sessions = self.sessions.write().await;
        let mut to_remove = Vec::new();

        for (id, session) in sessions.iter() {
            let s = session.read().await;
            if s.get_state() == SessionState::Closed {
                to_remove.push(*id);
            }
        }

        for id in to_remove {
            sessions.remove(&id);
            debug!(session = %hex::encode(&id[..4]), "closed session removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::intent::Intent;

    fn create_test_session() -> GameSession {
        GameSession::new([0; 16], GameConfig::default(), 4)
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let mut session = create_test_session();
        let (tx, _rx) = mpsc::channel(10);

        let welcome = session.join(ClientId(1), "ana".into(), tx).unwrap();
        assert_eq!(welcome.client, ClientId(1));
        assert_eq!(welcome.phase, RoundPhase::WaitingForPlayers);
        assert_eq!(session.player_count(), 1);

        assert!(session.leave(ClientId(1)));
        assert_eq!(session.get_state(), SessionState::Closed);
        assert!(!session.leave(ClientId(1)));
    }

    #[tokio::test]
    async fn test_session_full() {
        let mut session = GameSession::new([0; 16], GameConfig::default(), 1);
        let (tx, _rx) = mpsc::channel(10);
        session.join(ClientId(1), "a".into(), tx.clone()).unwrap();
        assert_eq!(
            session.join(ClientId(2), "b".into(), tx.clone()),
            Err(SessionError::SessionFull)
        );
        assert_eq!(
            session.join(ClientId(1), "a".into(), tx),
            Err(SessionError::AlreadyInSession)
        );
    }

    #[tokio::test]
    async fn test_tick_delivers_sync() {
        let mut session = create_test_session();
        let (tx, mut rx) = mpsc::channel(64);
        session.join(ClientId(1), "ana".into(), tx).unwrap();

        let out = session.run_tick();
        assert_eq!(session.deliver(out), 0);

        let mut got_sync = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, ServerMessage::Sync(_)) {
                got_sync = true;
            }
        }
        assert!(got_sync);
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block_others() {
        let mut session = create_test_session();
        let (slow_tx, mut slow_rx) = mpsc::channel(2);
        let (fast_tx, mut fast_rx) = mpsc::channel(64);
        session.join(ClientId(1), "slow".into(), slow_tx.clone()).unwrap();
        session.join(ClientId(2), "fast".into(), fast_tx).unwrap();

        // the slow client stopped reading
        let pong = ServerMessage::Pong { timestamp: 0, server_time: 0 };
        slow_tx.try_send(pong.clone()).unwrap();
        slow_tx.try_send(pong.clone()).unwrap();

        let out = session.run_tick();
        assert!(session.deliver(out) > 0);
        assert!(session.players[&ClientId(1)].lagging);
        assert!(matches!(fast_rx.try_recv(), Ok(ServerMessage::Sync(_))));

        // once drained, a snapshot goes out ahead of the next message
        while slow_rx.try_recv().is_ok() {}
        assert!(session.send_to(ClientId(1), pong));
        assert!(matches!(slow_rx.try_recv(), Ok(ServerMessage::Snapshot(_))));
        assert!(matches!(slow_rx.try_recv(), Ok(ServerMessage::Pong { .. })));
        assert!(!session.players[&ClientId(1)].lagging);
    }

    #[tokio::test]
    async fn test_sync_request_returns_snapshot() {
        let mut session = create_test_session();
        let (tx, _rx) = mpsc::channel(10);
        session.join(ClientId(1), "ana".into(), tx).unwrap();

        let out = session.handle_message(ClientId(1), ClientMessage::SyncRequest).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, ServerMessage::Snapshot(_)));

        assert_eq!(
            session.handle_message(ClientId(9), ClientMessage::Intent(Intent::UseAbility)).unwrap_err(),
            DispatchError::NotJoined(ClientId(9))
        );
    }

    #[tokio::test]
    async fn test_manager_reuses_open_session() {
        let manager = SessionManager::new(GameConfig::default(), 4);
        let (first, session, created) = manager.find_or_create().await;
        assert!(created);

        let (tx, _rx) = mpsc::channel(10);
        session.write().await.join(ClientId(1), "ana".into(), tx).unwrap();
        manager.register_client(ClientId(1), first).await;

        let (second, _, created) = manager.find_or_create().await;
        assert!(!created);
        assert_eq!(first, second);
        assert!(manager.get_client_session(ClientId(1)).await.is_some());

        session.write().await.leave(ClientId(1));
        manager.cleanup().await;
        assert_eq!(manager.session_count().await, 0);
    }
}
