//! Entity/Ownership Registry
//!
//! Maps network ids to live entities and their owning client. Lookups are
//! O(log n) over sorted maps; a failed lookup is a normal race (an entity
//! despawned between a client sending a message and the server reading it).

use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};
use tracing::warn;

use crate::game::candy::{CandyEntity, CandySpawner};
use crate::game::state::{ClientId, DoorEntity, NetworkId, PlayerEntity};
use crate::game::trap::TrapEntity;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The id is already in use.
    #[error("network id {0} already registered")]
    AlreadyRegistered(NetworkId),
}

/// Discriminant of an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Connected player.
    Player,
    /// Placed or pre-placed trap.
    Trap,
    /// Collectible candy.
    Candy,
    /// Candy spawner.
    Spawner,
    /// Door.
    Door,
}

/// A live entity.
#[derive(Clone, Debug)]
pub enum Entity {
    /// Connected player.
    Player(PlayerEntity),
    /// Trap.
    Trap(TrapEntity),
    /// Collectible candy.
    Candy(CandyEntity),
    /// Candy spawner.
    Spawner(CandySpawner),
    /// Door.
    Door(DoorEntity),
}

impl Entity {
    /// Kind of this entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Player(_) => EntityKind::Player,
            Entity::Trap(_) => EntityKind::Trap,
            Entity::Candy(_) => EntityKind::Candy,
            Entity::Spawner(_) => EntityKind::Spawner,
            Entity::Door(_) => EntityKind::Door,
        }
    }
}

#[derive(Clone, Debug)]
struct Registered {
    entity: Entity,
    owner: Option<ClientId>,
}

/// Registry of live entities.
#[derive(Clone, Debug)]
pub struct EntityRegistry {
    entries: BTreeMap<NetworkId, Registered>,
    owned: BTreeMap<ClientId, BTreeSet<NetworkId>>,
    next_id: u64,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! typed_accessors {
    ($variant:ident, $ty:ty, $get:ident, $get_mut:ident, $iter:ident) => {
        /// Typed lookup.
        pub fn $get(&self, id: NetworkId) -> Option<&$ty> {
            match self.resolve(id) {
                Some(Entity::$variant(e)) => Some(e),
                _ => None,
            }
        }

        /// Typed mutable lookup.
        pub fn $get_mut(&mut self, id: NetworkId) -> Option<&mut $ty> {
            match self.resolve_mut(id) {
                Some(Entity::$variant(e)) => Some(e),
                _ => None,
            }
        }

        /// Iterate entities of this kind in id order.
        pub fn $iter(&self) -> impl Iterator<Item = (NetworkId, &$ty)> + '_ {
            self.entries.iter().filter_map(|(id, r)| match &r.entity {
                Entity::$variant(e) => Some((*id, e)),
                _ => None,
            })
        }
    };
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            owned: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Allocate a fresh network id.
    pub fn allocate_id(&mut self) -> NetworkId {
        let id = NetworkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register an entity under an explicit id.
    ///
    /// A duplicate id is logged and leaves the registry unchanged.
    pub fn register(
        &mut self,
        id: NetworkId,
        entity: Entity,
        owner: Option<ClientId>,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(&id) {
            warn!(entity = %id, kind = ?entity.kind(), "duplicate registration ignored");
            return Err(RegistryError::AlreadyRegistered(id));
        }

        self.next_id = self.next_id.max(id.0 + 1);
        if let Some(owner) = owner {
            self.owned.entry(owner).or_default().insert(id);
        }
        self.entries.insert(id, Registered { entity, owner });
        Ok(())
    }

    /// Allocate an id and register the entity under it.
    pub fn spawn(&mut self, entity: Entity, owner: Option<ClientId>) -> NetworkId {
        let id = self.allocate_id();
        self.entries.insert(id, Registered { entity, owner });
        if let Some(owner) = owner {
            self.owned.entry(owner).or_default().insert(id);
        }
        id
    }

    /// Look up an entity.
    pub fn resolve(&self, id: NetworkId) -> Option<&Entity> {
        self.entries.get(&id).map(|r| &r.entity)
    }

    /// Look up an entity mutably.
    pub fn resolve_mut(&mut self, id: NetworkId) -> Option<&mut Entity> {
        self.entries.get_mut(&id).map(|r| &mut r.entity)
    }

    /// Owning client of an entity (server-owned entities have none).
    pub fn owner_of(&self, id: NetworkId) -> Option<ClientId> {
        self.entries.get(&id).and_then(|r| r.owner)
    }

    /// True if `client` owns `id`.
    pub fn is_owner(&self, id: NetworkId, client: ClientId) -> bool {
        self.owner_of(id) == Some(client)
    }

    /// Remove an entity.
    pub fn unregister(&mut self, id: NetworkId) -> Option<Entity> {
        let registered = self.entries.remove(&id)?;
        if let Some(owner) = registered.owner {
            if let Some(set) = self.owned.get_mut(&owner) {
                set.remove(&id);
                if set.is_empty() {
                    self.owned.remove(&owner);
                }
            }
        }
        Some(registered.entity)
    }

    /// Remove every entity owned by a client, in id order.
    pub fn unregister_owned_by(&mut self, client: ClientId) -> Vec<(NetworkId, Entity)> {
        let ids = self.owned.remove(&client).unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|r| (id, r.entity)))
            .collect()
    }

    /// Player entity owned by a client.
    pub fn player_of(&self, client: ClientId) -> Option<NetworkId> {
        self.owned.get(&client)?
            .iter()
            .copied()
            .find(|id| matches!(self.resolve(*id), Some(Entity::Player(_))))
    }

    /// All ids in order.
    pub fn ids(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.entries.keys().copied()
    }

    /// Number of entities of a kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.entries.values().filter(|r| r.entity.kind() == kind).count()
    }

    /// True if the id is live.
    pub fn contains(&self, id: NetworkId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entity is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    typed_accessors!(Player, PlayerEntity, player, player_mut, players);
    typed_accessors!(Trap, TrapEntity, trap, trap_mut, traps);
    typed_accessors!(Candy, CandyEntity, candy, candy_mut, candies);
    typed_accessors!(Spawner, CandySpawner, spawner, spawner_mut, spawners);
    typed_accessors!(Door, DoorEntity, door, door_mut, doors);
}
