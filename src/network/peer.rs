//! Peer Replica
//!
//! Client-side mirror of the server's replicated state. Applies snapshots
//! and sync frames to a non-authoritative store, verifies digests, and
//! turns local writes into forwarded write requests.

use tracing::{debug, trace, warn};

use crate::core::vec3::Transform;
use crate::game::events::{EndReason, GameEvent};
use crate::game::state::{ClientId, NetworkId, RoundPhase};
use crate::game::store::{ReplicatedStore, StateKey, StoreError};
use crate::network::protocol::{ClientMessage, ServerMessage, SyncFrame, WelcomeInfo};

/// A client's view of a session.
#[derive(Debug)]
pub struct PeerReplica {
    store: ReplicatedStore,
    welcome: Option<WelcomeInfo>,
    tick: u64,
    events: Vec<GameEvent>,
    ended: Option<EndReason>,
    desynced: bool,
    resync_requested: bool,
}

impl Default for PeerReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerReplica {
    /// Empty replica awaiting a welcome.
    pub fn new() -> Self {
        Self {
            store: ReplicatedStore::peer(),
            welcome: None,
            tick: 0,
            events: Vec::new(),
            ended: None,
            desynced: false,
            resync_requested: false,
        }
    }

    /// Apply one server message.
    pub fn handle(&mut self, message: ServerMessage) -> Result<(), StoreError> {
        match message {
            ServerMessage::Welcome(info) => {
                self.tick = info.tick;
                self.welcome = Some(info);
            }
            ServerMessage::Snapshot(frame) => {
                self.store = ReplicatedStore::peer();
                self.desynced = false;
                self.resync_requested = false;
                self.apply_frame(frame)?;
            }
            ServerMessage::Sync(frame) => self.apply_frame(frame)?,
            ServerMessage::Event(event) => self.events.push(event),
            ServerMessage::ReturnToMenu { reason } => self.ended = Some(reason),
            other => debug!(?other, "message not relevant to replica"),
        }
        Ok(())
    }

    fn apply_frame(&mut self, frame: SyncFrame) -> Result<(), StoreError> {
        self.tick = self.tick.max(frame.tick);
        // frames arrive in order, so nothing older than this frame is still in flight
        let oldest = frame.deltas.iter().map(|d| d.seq).min();
        for delta in frame.deltas {
            self.store.apply_remote(delta)?;
        }
        if let Some(oldest) = oldest {
            let pruned = self.store.prune_tombstones(oldest);
            if pruned > 0 {
                trace!(pruned, "pruned tombstones");
            }
        }
        if let Some(expected) = frame.digest {
            let local = hex::encode(self.store.digest());
            if local != expected {
                warn!(tick = frame.tick, "replica digest mismatch");
                self.desynced = true;
            }
        }
        Ok(())
    }

    /// Request a move for the owned player.
    pub fn move_to(&mut self, transform: Transform) -> bool {
        match self.entity() {
            Some(entity) => {
                self.store.write(StateKey::Transform(entity), transform);
                true
            }
            None => false,
        }
    }

    /// Messages to send to the server: forwarded writes, then a resync
    /// request if the replica diverged.
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        let mut out: Vec<ClientMessage> = self.store.take_forwarded()
            .into_iter()
            .map(ClientMessage::WriteRequest)
            .collect();
        if self.desynced && !self.resync_requested {
            self.resync_requested = true;
            out.push(ClientMessage::SyncRequest);
        }
        out
    }

    /// Replicated store.
    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    /// Assigned client id.
    pub fn client(&self) -> Option<ClientId> {
        self.welcome.as_ref().map(|w| w.client)
    }

    /// Owned player entity.
    pub fn entity(&self) -> Option<NetworkId> {
        self.welcome.as_ref().map(|w| w.entity)
    }

    /// Latest server tick seen.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Replicated round phase.
    pub fn phase(&self) -> Option<RoundPhase> {
        self.store.read(&StateKey::Phase).and_then(|v| v.as_phase())
    }

    /// Drain received events.
    pub fn take_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    /// Set once the server sent the player back to the menu.
    pub fn ended(&self) -> Option<EndReason> {
        self.ended
    }

    /// True if a digest check failed since the last snapshot.
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::core::vec3::Vec3;
    use crate::game::state::WorldState;
    use crate::game::store::StateDelta;
    use crate::game::tick::tick;
    use crate::network::dispatch::{self, route_tick};

    fn welcome(client: ClientId, entity: NetworkId) -> ServerMessage {
        ServerMessage::Welcome(WelcomeInfo {
            session_id: "s".into(),
            client,
            entity,
            tick: 0,
            tick_rate: 30,
            phase: RoundPhase::WaitingForPlayers,
            created_at: String::new(),
            server_version: "test".into(),
        })
    }

    #[test]
    fn test_replica_converges_with_server() {
        let mut state = WorldState::new([4; 16], GameConfig::default());
        let entity = state.connect(ClientId(1)).unwrap();

        let mut replica = PeerReplica::new();
        replica.handle(welcome(ClientId(1), entity)).unwrap();
        replica.handle(dispatch::snapshot(&state)).unwrap();
        state.store.take_outbox();

        for c in 2..=4 {
            state.connect(ClientId(c));
        }
        for _ in 0..40 {
            let result = tick(&mut state);
            for out in route_tick(&state, result) {
                replica.handle(out.message).unwrap();
            }
        }

        assert!(!replica.is_desynced());
        assert_eq!(replica.store().digest(), state.store.digest());
        assert_eq!(replica.phase(), Some(RoundPhase::Preparation));
        assert!(!replica.take_events().is_empty());
    }

    #[test]
    fn test_local_move_is_forwarded_not_applied() {
        let mut replica = PeerReplica::new();
        assert!(!replica.move_to(Transform::ORIGIN));

        replica.handle(welcome(ClientId(1), NetworkId(3))).unwrap();
        assert!(replica.move_to(Transform::at(Vec3::new(1.0, 0.0, 0.0))));

        let out = replica.take_outgoing();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], ClientMessage::WriteRequest(_)));
        assert!(replica.store().read(&StateKey::Transform(NetworkId(3))).is_none());
    }

    #[test]
    fn test_digest_mismatch_requests_resync_once() {
        let mut replica = PeerReplica::new();
        let frame = SyncFrame {
            tick: 5,
            deltas: vec![StateDelta { key: StateKey::Round, value: Some(1i64.into()), seq: 3 }],
            digest: Some("00".into()),
        };
        replica.handle(ServerMessage::Sync(frame)).unwrap();
        assert!(replica.is_desynced());

        let out = replica.take_outgoing();
        assert_eq!(out, vec![ClientMessage::SyncRequest]);
        assert!(replica.take_outgoing().is_empty());
    }

    #[test]
    fn test_tombstones_pruned_by_later_frames() {
        let mut replica = PeerReplica::new();
        let removal = SyncFrame {
            tick: 1,
            deltas: vec![
                StateDelta { key: StateKey::Coins(NetworkId(2)), value: None, seq: 4 },
                StateDelta { key: StateKey::Candy(NetworkId(2)), value: None, seq: 5 },
            ],
            digest: None,
        };
        replica.handle(ServerMessage::Sync(removal)).unwrap();
        assert_eq!(replica.store().tombstone_count(), 2);

        let next = SyncFrame {
            tick: 2,
            deltas: vec![StateDelta { key: StateKey::Round, value: Some(1i64.into()), seq: 6 }],
            digest: None,
        };
        replica.handle(ServerMessage::Sync(next)).unwrap();
        assert_eq!(replica.store().tombstone_count(), 0);
    }

    #[test]
    fn test_return_to_menu_recorded() {
        let mut replica = PeerReplica::new();
        replica.handle(ServerMessage::ReturnToMenu { reason: EndReason::RoundsComplete }).unwrap();
        assert_eq!(replica.ended(), Some(EndReason::RoundsComplete));
    }
}
