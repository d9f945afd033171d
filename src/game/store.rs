//! Replicated State Store
//!
//! Single-writer / multi-reader key-value store. The server instance is
//! authoritative: its writes are sequenced, queued for broadcast and shown to
//! local observers. A peer instance never mutates itself on `write`; the
//! request is queued for forwarding to the server instead, and the peer only
//! changes when a server delta arrives through `apply_remote`.
//!
//! Every delta carries a sequence number taken from one monotonically
//! increasing server counter, so for any single key the sequence only grows.
//! Peers drop deltas that are not newer than what they already hold, which
//! keeps a key from regressing under duplicate or late delivery.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use tracing::{debug, trace};

use crate::core::hash::{StateHash, StateHasher};
use crate::core::vec3::Transform;
use crate::game::state::{ItemId, NetworkId, RoundPhase, Team};
use crate::game::trap::TrapState;

// =============================================================================
// KEYS AND VALUES
// =============================================================================

/// Address of one replicated value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    /// Current round number (1-based, 0 before the first round).
    Round,
    /// Rounds configured for the session.
    TotalRounds,
    /// Current round phase.
    Phase,
    /// Whole seconds left in the current phase.
    PhaseRemaining,
    /// Team of a player entity.
    Team(NetworkId),
    /// World transform of a player or placed object.
    Transform(NetworkId),
    /// Coin balance.
    Coins(NetworkId),
    /// Candy carried by a child.
    Candy(NetworkId),
    /// Whether a child has been caught.
    Caught(NetworkId),
    /// Adult inventory contents.
    Inventory(NetworkId),
    /// Movement lock (stun).
    MovementLocked(NetworkId),
    /// Movement speed multiplier.
    SpeedMultiplier(NetworkId),
    /// Trap activation state.
    TrapState(NetworkId),
    /// Whether a spawner currently offers a candy.
    CandyAvailable(NetworkId),
    /// Door open flag.
    DoorOpen(NetworkId),
}

impl StateKey {
    /// Entity this key belongs to, if any.
    pub fn entity(&self) -> Option<NetworkId> {
        match *self {
            StateKey::Round | StateKey::TotalRounds | StateKey::Phase | StateKey::PhaseRemaining => None,
            StateKey::Team(id)
            | StateKey::Transform(id)
            | StateKey::Coins(id)
            | StateKey::Candy(id)
            | StateKey::Caught(id)
            | StateKey::Inventory(id)
            | StateKey::MovementLocked(id)
            | StateKey::SpeedMultiplier(id)
            | StateKey::TrapState(id)
            | StateKey::CandyAvailable(id)
            | StateKey::DoorOpen(id) => Some(id),
        }
    }

    /// Keys an owning client may submit as a forwarded write.
    ///
    /// Only the transform is owner-driven; everything else is derived by the
    /// server from validated intents.
    pub fn is_owner_writable(&self) -> bool {
        matches!(self, StateKey::Transform(_))
    }

    fn hash_into(&self, hasher: &mut StateHasher) {
        let (tag, id) = match *self {
            StateKey::Round => (0u8, None),
            StateKey::TotalRounds => (1, None),
            StateKey::Phase => (2, None),
            StateKey::PhaseRemaining => (3, None),
            StateKey::Team(id) => (4, Some(id)),
            StateKey::Transform(id) => (5, Some(id)),
            StateKey::Coins(id) => (6, Some(id)),
            StateKey::Candy(id) => (7, Some(id)),
            StateKey::Caught(id) => (8, Some(id)),
            StateKey::Inventory(id) => (9, Some(id)),
            StateKey::MovementLocked(id) => (10, Some(id)),
            StateKey::SpeedMultiplier(id) => (11, Some(id)),
            StateKey::TrapState(id) => (12, Some(id)),
            StateKey::CandyAvailable(id) => (13, Some(id)),
            StateKey::DoorOpen(id) => (14, Some(id)),
        };
        hasher.update_u8(tag);
        if let Some(id) = id {
            hasher.update_u64(id.0);
        }
    }
}

/// A replicated value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    /// Flag.
    Bool(bool),
    /// Counter or balance.
    Int(i64),
    /// Multiplier.
    Float(f32),
    /// Round phase.
    Phase(RoundPhase),
    /// Team.
    Team(Team),
    /// World transform.
    Transform(Transform),
    /// Ordered item list.
    Items(Vec<ItemId>),
    /// Trap state.
    Trap(TrapState),
}

impl StateValue {
    /// Value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Value as integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Value as float.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            StateValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Value as phase.
    pub fn as_phase(&self) -> Option<RoundPhase> {
        match self {
            StateValue::Phase(v) => Some(*v),
            _ => None,
        }
    }

    /// Value as team.
    pub fn as_team(&self) -> Option<Team> {
        match self {
            StateValue::Team(v) => Some(*v),
            _ => None,
        }
    }

    /// Value as transform.
    pub fn as_transform(&self) -> Option<Transform> {
        match self {
            StateValue::Transform(v) => Some(*v),
            _ => None,
        }
    }

    /// Value as item list.
    pub fn as_items(&self) -> Option<&[ItemId]> {
        match self {
            StateValue::Items(v) => Some(v),
            _ => None,
        }
    }

    /// Value as trap state.
    pub fn as_trap(&self) -> Option<TrapState> {
        match self {
            StateValue::Trap(v) => Some(*v),
            _ => None,
        }
    }

    fn hash_into(&self, hasher: &mut StateHasher) {
        match self {
            StateValue::Bool(v) => {
                hasher.update_u8(0);
                hasher.update_bool(*v);
            }
            StateValue::Int(v) => {
                hasher.update_u8(1);
                hasher.update_i64(*v);
            }
            StateValue::Float(v) => {
                hasher.update_u8(2);
                hasher.update_f32(*v);
            }
            StateValue::Phase(v) => {
                hasher.update_u8(3);
                hasher.update_u8(*v as u8);
            }
            StateValue::Team(v) => {
                hasher.update_u8(4);
                hasher.update_u8(*v as u8);
            }
            StateValue::Transform(v) => {
                hasher.update_u8(5);
                hasher.update_transform(v);
            }
            StateValue::Items(items) => {
                hasher.update_u8(6);
                hasher.update_u32(items.len() as u32);
                for item in items {
                    hasher.update_u16(item.0);
                }
            }
            StateValue::Trap(v) => {
                hasher.update_u8(7);
                hasher.update_u8(*v as u8);
            }
        }
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<f32> for StateValue {
    fn from(v: f32) -> Self {
        StateValue::Float(v)
    }
}

impl From<RoundPhase> for StateValue {
    fn from(v: RoundPhase) -> Self {
        StateValue::Phase(v)
    }
}

impl From<Team> for StateValue {
    fn from(v: Team) -> Self {
        StateValue::Team(v)
    }
}

impl From<Transform> for StateValue {
    fn from(v: Transform) -> Self {
        StateValue::Transform(v)
    }
}

impl From<Vec<ItemId>> for StateValue {
    fn from(v: Vec<ItemId>) -> Self {
        StateValue::Items(v)
    }
}

impl From<TrapState> for StateValue {
    fn from(v: TrapState) -> Self {
        StateValue::Trap(v)
    }
}

// =============================================================================
// DELTAS
// =============================================================================

/// One sequenced change broadcast by the server. `value: None` removes the key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Key written.
    pub key: StateKey,
    /// New value, or `None` for removal.
    pub value: Option<StateValue>,
    /// Server sequence number.
    pub seq: u64,
}

/// A write issued on a peer, to be forwarded to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Key to write.
    pub key: StateKey,
    /// Requested value.
    pub value: StateValue,
}

/// Change notification delivered to observers.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    /// Key that changed.
    pub key: StateKey,
    /// Previous value.
    pub old: Option<StateValue>,
    /// New value (`None` when removed).
    pub new: Option<StateValue>,
    /// Sequence of the change.
    pub seq: u64,
}

/// Outcome of `write`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Applied on the server with this sequence.
    Applied(u64),
    /// Same value already held; nothing broadcast.
    Unchanged,
    /// Queued for forwarding to the server.
    Forwarded,
}

/// Which side of the wire a store lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authority {
    /// The authoritative server.
    Server,
    /// A non-authoritative peer.
    Peer,
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The server is the sole source of deltas and never applies remote ones.
    #[error("authoritative store cannot apply remote delta for {0:?}")]
    AuthorityConflict(StateKey),
}

/// Observer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&StateChange) + Send + Sync>;

#[derive(Clone, Debug)]
struct Versioned {
    value: StateValue,
    seq: u64,
}

// =============================================================================
// STORE
// =============================================================================

/// The replicated key-value store.
pub struct ReplicatedStore {
    authority: Authority,
    entries: BTreeMap<StateKey, Versioned>,
    /// Sequence of applied remote removals, so a late delta cannot
    /// resurrect a removed key. Only peers keep these.
    tombstones: BTreeMap<StateKey, u64>,
    next_seq: u64,
    outbox: Vec<StateDelta>,
    forwarded: Vec<WriteRequest>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("authority", &self.authority)
            .field("entries", &self.entries.len())
            .field("next_seq", &self.next_seq)
            .field("outbox", &self.outbox.len())
            .field("forwarded", &self.forwarded.len())
            .finish()
    }
}

impl ReplicatedStore {
    /// Create an empty store.
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            next_seq: 1,
            outbox: Vec::new(),
            forwarded: Vec::new(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Server-side store.
    pub fn server() -> Self {
        Self::new(Authority::Server)
    }

    /// Peer-side store.
    pub fn peer() -> Self {
        Self::new(Authority::Peer)
    }

    /// Is this the authoritative instance.
    pub fn is_authoritative(&self) -> bool {
        self.authority == Authority::Server
    }

    /// Read the last value broadcast for a key.
    pub fn read(&self, key: &StateKey) -> Option<&StateValue> {
        self.entries.get(key).map(|v| &v.value)
    }

    /// Read a bool.
    pub fn read_bool(&self, key: &StateKey) -> Option<bool> {
        self.read(key).and_then(StateValue::as_bool)
    }

    /// Read an integer.
    pub fn read_int(&self, key: &StateKey) -> Option<i64> {
        self.read(key).and_then(StateValue::as_int)
    }

    /// Read a float.
    pub fn read_float(&self, key: &StateKey) -> Option<f32> {
        self.read(key).and_then(StateValue::as_float)
    }

    /// Read a transform.
    pub fn read_transform(&self, key: &StateKey) -> Option<Transform> {
        self.read(key).and_then(StateValue::as_transform)
    }

    /// Read an item list.
    pub fn read_items(&self, key: &StateKey) -> Option<&[ItemId]> {
        self.read(key).and_then(StateValue::as_items)
    }

    /// Sequence of the value currently held for a key.
    pub fn seq_of(&self, key: &StateKey) -> Option<u64> {
        self.entries.get(key).map(|v| v.seq)
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no keys are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write a value.
    ///
    /// On the server this applies and queues a broadcast. On a peer the write
    /// is queued for forwarding and local state is left untouched.
    pub fn write(&mut self, key: StateKey, value: impl Into<StateValue>) -> WriteOutcome {
        let value = value.into();

        if !self.is_authoritative() {
            trace!(?key, "forwarding write to server");
            self.forwarded.push(WriteRequest { key, value });
            return WriteOutcome::Forwarded;
        }

        if self.read(&key) == Some(&value) {
            return WriteOutcome::Unchanged;
        }

        let seq = self.bump_seq();
        let old = self.entries.insert(key, Versioned { value: value.clone(), seq }).map(|v| v.value);
        self.outbox.push(StateDelta { key, value: Some(value.clone()), seq });
        self.notify(StateChange { key, old, new: Some(value), seq });

        WriteOutcome::Applied(seq)
    }

    /// Remove a key (server only). Returns true if it was present.
    pub fn remove(&mut self, key: &StateKey) -> bool {
        if !self.is_authoritative() {
            return false;
        }
        let Some(old) = self.entries.remove(key) else {
            return false;
        };

        let seq = self.bump_seq();
        self.outbox.push(StateDelta { key: *key, value: None, seq });
        self.notify(StateChange { key: *key, old: Some(old.value), new: None, seq });
        true
    }

    /// Remove every key belonging to an entity. Returns the number removed.
    pub fn remove_entity(&mut self, id: NetworkId) -> usize {
        let keys: Vec<StateKey> = self.entries.keys()
            .filter(|k| k.entity() == Some(id))
            .copied()
            .collect();

        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Apply a server delta on a peer.
    ///
    /// Returns `Ok(false)` when the delta is stale (not newer than the held
    /// sequence) and was dropped.
    pub fn apply_remote(&mut self, delta: StateDelta) -> Result<bool, StoreError> {
        if self.is_authoritative() {
            return Err(StoreError::AuthorityConflict(delta.key));
        }

        let held = self.entries.get(&delta.key).map(|v| v.seq)
            .or_else(|| self.tombstones.get(&delta.key).copied());
        if let Some(held) = held {
            if delta.seq <= held {
                debug!(key = ?delta.key, seq = delta.seq, held, "dropping stale delta");
                return Ok(false);
            }
        }

        self.next_seq = self.next_seq.max(delta.seq + 1);

        let old = match delta.value.clone() {
            Some(value) => {
                self.tombstones.remove(&delta.key);
                self.entries.insert(delta.key, Versioned { value, seq: delta.seq }).map(|v| v.value)
            }
            None => {
                self.tombstones.insert(delta.key, delta.seq);
                self.entries.remove(&delta.key).map(|v| v.value)
            }
        };

        self.notify(StateChange {
            key: delta.key,
            old,
            new: delta.value,
            seq: delta.seq,
        });
        Ok(true)
    }

    /// Forget removals older than `before_seq`. Returns the number dropped.
    ///
    /// Call once every delta below `before_seq` has been delivered.
    pub fn prune_tombstones(&mut self, before_seq: u64) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, seq| *seq >= before_seq);
        before - self.tombstones.len()
    }

    /// Number of removals remembered.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Take queued broadcast deltas.
    ///
    /// Several writes to one key between flushes collapse into the last one;
    /// the result is ordered by sequence.
    pub fn take_outbox(&mut self) -> Vec<StateDelta> {
        let mut latest: BTreeMap<StateKey, StateDelta> = BTreeMap::new();
        for delta in self.outbox.drain(..) {
            latest.insert(delta.key, delta);
        }
        let mut deltas: Vec<StateDelta> = latest.into_values().collect();
        deltas.sort_by_key(|d| d.seq);
        deltas
    }

    /// Number of deltas queued for broadcast.
    pub fn pending_broadcasts(&self) -> usize {
        self.outbox.len()
    }

    /// Take writes queued for forwarding (peer side).
    pub fn take_forwarded(&mut self) -> Vec<WriteRequest> {
        std::mem::take(&mut self.forwarded)
    }

    /// Register a change observer.
    pub fn observe<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&StateChange) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove a change observer.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        before != self.observers.len()
    }

    /// Full state as deltas, for joining peers.
    pub fn snapshot(&self) -> Vec<StateDelta> {
        let mut deltas: Vec<StateDelta> = self.entries.iter()
            .map(|(key, v)| StateDelta { key: *key, value: Some(v.value.clone()), seq: v.seq })
            .collect();
        deltas.sort_by_key(|d| d.seq);
        deltas
    }

    /// Digest of keys, values and sequences.
    pub fn digest(&self) -> StateHash {
        let mut hasher = StateHasher::for_store();
        hasher.update_u32(self.entries.len() as u32);
        for (key, v) in &self.entries {
            key.hash_into(&mut hasher);
            v.value.hash_into(&mut hasher);
            hasher.update_u64(v.seq);
        }
        hasher.finalize()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn notify(&mut self, change: StateChange) {
        for (_, observer) in self.observers.iter_mut() {
            observer(&change);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use proptest::prelude::*;

    const P: NetworkId = NetworkId(7);

    fn sync(server: &mut ReplicatedStore, peer: &mut ReplicatedStore) {
        for delta in server.take_outbox() {
            peer.apply_remote(delta).unwrap();
        }
    }

    #[test]
    fn test_server_write_applies_and_queues() {
        let mut store = ReplicatedStore::server();
        let outcome = store.write(StateKey::Coins(P), 40i64);

        assert!(matches!(outcome, WriteOutcome::Applied(_)));
        assert_eq!(store.read_int(&StateKey::Coins(P)), Some(40));
        assert_eq!(store.pending_broadcasts(), 1);
    }

    #[test]
    fn test_same_value_is_not_rebroadcast() {
        let mut store = ReplicatedStore::server();
        store.write(StateKey::Caught(P), true);
        store.take_outbox();

        assert_eq!(store.write(StateKey::Caught(P), true), WriteOutcome::Unchanged);
        assert_eq!(store.pending_broadcasts(), 0);
    }

    #[test]
    fn test_peer_write_is_forwarded_not_applied() {
        let mut peer = ReplicatedStore::peer();
        let outcome = peer.write(StateKey::Coins(P), 999i64);

        assert_eq!(outcome, WriteOutcome::Forwarded);
        assert_eq!(peer.read(&StateKey::Coins(P)), None);

        let forwarded = peer.take_forwarded();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].value, StateValue::Int(999));
    }

    #[test]
    fn test_peer_applies_server_deltas() {
        let mut server = ReplicatedStore::server();
        let mut peer = ReplicatedStore::peer();

        server.write(StateKey::Phase, RoundPhase::Preparation);
        server.write(StateKey::SpeedMultiplier(P), 0.5f32);
        sync(&mut server, &mut peer);

        assert_eq!(peer.read(&StateKey::Phase), Some(&StateValue::Phase(RoundPhase::Preparation)));
        assert_eq!(peer.read_float(&StateKey::SpeedMultiplier(P)), Some(0.5));
        assert_eq!(peer.digest(), server.digest());
    }

    #[test]
    fn test_stale_delta_dropped() {
        let mut peer = ReplicatedStore::peer();
        let newer = StateDelta { key: StateKey::Candy(P), value: Some(StateValue::Int(3)), seq: 10 };
        let older = StateDelta { key: StateKey::Candy(P), value: Some(StateValue::Int(1)), seq: 4 };

        assert_eq!(peer.apply_remote(newer.clone()), Ok(true));
        assert_eq!(peer.apply_remote(older), Ok(false));
        assert_eq!(peer.apply_remote(newer), Ok(false));
        assert_eq!(peer.read_int(&StateKey::Candy(P)), Some(3));
    }

    #[test]
    fn test_removed_key_not_resurrected_by_late_delta() {
        let mut peer = ReplicatedStore::peer();
        peer.apply_remote(StateDelta { key: StateKey::Coins(P), value: None, seq: 9 }).unwrap();
        let late = StateDelta { key: StateKey::Coins(P), value: Some(StateValue::Int(5)), seq: 8 };

        assert_eq!(peer.apply_remote(late), Ok(false));
        assert!(peer.read(&StateKey::Coins(P)).is_none());
    }

    #[test]
    fn test_server_keeps_no_tombstones() {
        let mut server = ReplicatedStore::server();
        for i in 0..50 {
            let id = NetworkId(i);
            server.write(StateKey::Coins(id), 1i64);
            server.write(StateKey::Candy(id), 2i64);
            server.remove_entity(id);
        }
        assert_eq!(server.tombstone_count(), 0);
        assert_eq!(server.take_outbox().iter().filter(|d| d.value.is_none()).count(), 100);
    }

    #[test]
    fn test_prune_tombstones() {
        let mut peer = ReplicatedStore::peer();
        peer.apply_remote(StateDelta { key: StateKey::Coins(P), value: None, seq: 4 }).unwrap();
        peer.apply_remote(StateDelta { key: StateKey::Candy(P), value: None, seq: 9 }).unwrap();
        assert_eq!(peer.tombstone_count(), 2);

        assert_eq!(peer.prune_tombstones(5), 1);
        assert_eq!(peer.tombstone_count(), 1);
        let late = StateDelta { key: StateKey::Candy(P), value: Some(StateValue::Int(5)), seq: 8 };
        assert_eq!(peer.apply_remote(late), Ok(false));
    }

    #[test]
    fn test_server_rejects_remote_delta() {
        let mut server = ReplicatedStore::server();
        let delta = StateDelta { key: StateKey::Round, value: Some(StateValue::Int(1)), seq: 1 };
        assert!(matches!(server.apply_remote(delta), Err(StoreError::AuthorityConflict(StateKey::Round))));
    }

    #[test]
    fn test_outbox_collapses_per_key() {
        let mut store = ReplicatedStore::server();
        store.write(StateKey::Coins(P), 100i64);
        store.write(StateKey::Candy(P), 1i64);
        store.write(StateKey::Coins(P), 50i64);
        store.write(StateKey::Coins(P), 100i64);

        let out = store.take_outbox();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, StateKey::Candy(P));
        assert_eq!(out[1].key, StateKey::Coins(P));
        assert_eq!(out[1].value, Some(StateValue::Int(100)));
        assert!(out[0].seq < out[1].seq);
    }

    #[test]
    fn test_remove_entity_drops_all_keys() {
        let mut server = ReplicatedStore::server();
        let mut peer = ReplicatedStore::peer();
        let other = NetworkId(8);

        server.write(StateKey::Coins(P), 10i64);
        server.write(StateKey::Caught(P), false);
        server.write(StateKey::Coins(other), 3i64);
        server.write(StateKey::Round, 1i64);
        sync(&mut server, &mut peer);

        assert_eq!(server.remove_entity(P), 2);
        sync(&mut server, &mut peer);

        assert!(peer.read(&StateKey::Coins(P)).is_none());
        assert_eq!(peer.read_int(&StateKey::Coins(other)), Some(3));
        assert_eq!(peer.len(), 2);
        assert_eq!(peer.digest(), server.digest());
    }

    #[test]
    fn test_observers_see_local_and_remote_changes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut peer = ReplicatedStore::peer();
        let id = peer.observe(move |change| {
            sink.lock().unwrap().push((change.key, change.new.clone()));
        });

        peer.apply_remote(StateDelta { key: StateKey::Caught(P), value: Some(StateValue::Bool(true)), seq: 1 }).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(peer.unobserve(id));
        peer.apply_remote(StateDelta { key: StateKey::Caught(P), value: Some(StateValue::Bool(false)), seq: 2 }).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_bootstraps_late_peer() {
        let mut server = ReplicatedStore::server();
        server.write(StateKey::Round, 2i64);
        server.write(StateKey::Coins(P), 70i64);
        server.write(StateKey::Coins(P), 80i64);
        server.take_outbox();

        let mut late = ReplicatedStore::peer();
        for delta in server.snapshot() {
            late.apply_remote(delta).unwrap();
        }
        assert_eq!(late.digest(), server.digest());
    }

    proptest! {
        #[test]
        fn prop_peers_converge_on_single_key(values in proptest::collection::vec(-1000i64..1000, 1..40), flush_every in 1usize..5) {
            let mut server = ReplicatedStore::server();
            let mut peer_a = ReplicatedStore::peer();
            let mut peer_b = ReplicatedStore::peer();
            let key = StateKey::Coins(P);

            for (i, v) in values.iter().enumerate() {
                server.write(key, *v);
                if i % flush_every == 0 {
                    let out = server.take_outbox();
                    for delta in out.iter().cloned() {
                        peer_a.apply_remote(delta).unwrap();
                    }
                    // peer_b receives the batch twice (duplicate delivery)
                    for delta in out.iter().cloned().chain(out.iter().cloned()) {
                        peer_b.apply_remote(delta).unwrap();
                    }
                }
            }
            let out = server.take_outbox();
            for delta in out {
                peer_a.apply_remote(delta.clone()).unwrap();
                peer_b.apply_remote(delta).unwrap();
            }

            let last = *values.last().unwrap();
            prop_assert_eq!(server.read_int(&key), Some(last));
            prop_assert_eq!(peer_a.read_int(&key), Some(last));
            prop_assert_eq!(peer_b.read_int(&key), Some(last));
            prop_assert_eq!(peer_a.digest(), server.digest());
            prop_assert_eq!(peer_b.digest(), server.digest());
        }
    }
}
