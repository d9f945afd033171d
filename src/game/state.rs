//! Game State Definitions
//!
//! Identifiers, teams and the `WorldState` context every system is threaded
//! through. Replicated values live in the store; entity structs only keep
//! server-side bookkeeping (timer handles, dash progress, move timestamps).
//! Uses BTreeMap everywhere for deterministic iteration order.

use serde::{Serialize, Deserialize};
use tracing::{debug, error, info};

use crate::config::GameConfig;
use crate::core::rng::DeterministicRng;
use crate::core::vec3::Transform;
use crate::game::catch::DashState;
use crate::game::events::{EndReason, GameEvent};
use crate::game::inventory::Inventory;
use crate::game::registry::{Entity, EntityRegistry};
use crate::game::reward::RewardLedger;
use crate::game::round::{self, RoundMachine};
use crate::game::scheduler::{Scheduler, TimerHandle};
use crate::game::store::{ReplicatedStore, StateKey, StateValue};
use crate::game::{map, trap};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Transport-level identifier of a connected client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Network-wide entity identifier, allocated by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u64);

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shop item identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u16);

// =============================================================================
// TEAMS AND PHASES
// =============================================================================

/// Player role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Team {
    /// Hunts the children.
    Adult = 0,
    /// Collects candy, avoids capture.
    Child = 1,
}

/// Round phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RoundPhase {
    /// Lobby; counting connected clients.
    #[default]
    WaitingForPlayers = 0,
    /// Shop open, no catching.
    Preparation = 1,
    /// The chase.
    Game = 2,
    /// Rewards settled; short pause.
    RoundEnd = 3,
    /// Terminal.
    GameEnd = 4,
}

impl RoundPhase {
    /// Phases in which players are in the world and the round clock runs.
    pub fn is_active(self) -> bool {
        matches!(self, RoundPhase::Preparation | RoundPhase::Game | RoundPhase::RoundEnd)
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Server-side bookkeeping for a connected player.
#[derive(Clone, Debug)]
pub struct PlayerEntity {
    /// Owning client.
    pub client: ClientId,
    /// Assigned team (`None` while waiting for players).
    pub team: Option<Team>,
    /// Spawn slot index within the team.
    pub spawn_slot: usize,
    /// Pending timer resetting the speed multiplier.
    pub speed_timer: Option<TimerHandle>,
    /// Pending timer lifting the movement lock.
    pub lock_timer: Option<TimerHandle>,
    /// In-flight dash (adult only).
    pub dash: Option<DashState>,
    /// Earliest tick the next dash may start.
    pub next_dash_tick: u64,
    /// Earliest tick the child ability may be used again.
    pub next_ability_tick: u64,
    /// Tick of the last accepted move.
    pub last_move_tick: u64,
}

impl PlayerEntity {
    /// New unassigned player.
    pub fn new(client: ClientId, tick: u64) -> Self {
        Self {
            client,
            team: None,
            spawn_slot: 0,
            speed_timer: None,
            lock_timer: None,
            dash: None,
            next_dash_tick: 0,
            next_ability_tick: 0,
            last_move_tick: tick,
        }
    }

    /// Is this the adult.
    pub fn is_adult(&self) -> bool {
        self.team == Some(Team::Adult)
    }

    /// Is this a child.
    pub fn is_child(&self) -> bool {
        self.team == Some(Team::Child)
    }
}

/// An interactable door.
#[derive(Clone, Debug)]
pub struct DoorEntity {
    /// Door position.
    pub position: crate::core::vec3::Vec3,
}

// =============================================================================
// WORLD STATE
// =============================================================================

/// Complete server state of one session.
#[derive(Debug)]
pub struct WorldState {
    /// Session identifier.
    pub session_id: [u8; 16],

    /// Current tick.
    pub tick: u64,

    /// Session configuration.
    pub config: GameConfig,

    /// Replicated key-value store.
    pub store: ReplicatedStore,

    /// Entity/ownership registry.
    pub registry: EntityRegistry,

    /// Timed continuations.
    pub scheduler: Scheduler,

    /// Round flow.
    pub round: RoundMachine,

    /// Rounds already rewarded.
    pub rewards: RewardLedger,

    /// Seeded RNG (team policy, spawn shuffling).
    pub rng: DeterministicRng,

    /// Connected clients in connection order.
    pub clients: Vec<ClientId>,

    /// Events generated this tick.
    pending_events: Vec<GameEvent>,
}

impl WorldState {
    /// Create the world for a new session and populate the level.
    pub fn new(session_id: [u8; 16], config: GameConfig) -> Self {
        let rng = DeterministicRng::for_session(&session_id, config.seed);
        let round = RoundMachine::new(&config);

        let mut state = Self {
            session_id,
            tick: 0,
            config,
            store: ReplicatedStore::server(),
            registry: EntityRegistry::new(),
            scheduler: Scheduler::new(),
            round,
            rewards: RewardLedger::default(),
            rng,
            clients: Vec::new(),
            pending_events: Vec::new(),
        };

        state.store.write(StateKey::Round, 0i64);
        state.store.write(StateKey::TotalRounds, state.config.round.total_rounds as i64);
        state.store.write(StateKey::Phase, RoundPhase::WaitingForPlayers);
        state.store.write(
            StateKey::PhaseRemaining,
            state.config.round.wait_timeout_secs.ceil() as i64,
        );

        map::populate(&mut state);
        state
    }

    /// Convert seconds to ticks at the configured rate.
    pub fn secs_to_ticks(&self, secs: f32) -> u64 {
        self.config.secs_to_ticks(secs)
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.round.phase
    }

    // ===== CONNECTIONS =====

    /// Record a new connection and spawn its player.
    ///
    /// Clients joining after teams were assigned spawn as children.
    pub fn connect(&mut self, client: ClientId) -> Option<NetworkId> {
        if let Some(existing) = self.registry.player_of(client) {
            debug!(%client, "client already connected");
            return Some(existing);
        }
        if self.phase() == RoundPhase::GameEnd {
            return None;
        }

        self.clients.push(client);
        let id = self.spawn_player(client);
        info!(%client, entity = %id, phase = ?self.phase(), "client connected");

        if self.phase().is_active() {
            round::join_late(self, id);
        }
        Some(id)
    }

    /// Remove a client and everything it owns.
    ///
    /// Returns the despawned entity ids.
    pub fn disconnect(&mut self, client: ClientId) -> Vec<NetworkId> {
        let Some(pos) = self.clients.iter().position(|c| *c == client) else {
            return Vec::new();
        };
        self.clients.remove(pos);

        let was_adult = self.registry.player_of(client)
            .and_then(|id| self.registry.player(id))
            .is_some_and(PlayerEntity::is_adult);

        let owned = self.registry.unregister_owned_by(client);
        let mut removed = Vec::with_capacity(owned.len());
        for (id, entity) in owned {
            self.cleanup_entity(id, &entity);
            removed.push(id);
        }
        info!(%client, despawned = removed.len(), "client disconnected");

        if self.phase().is_active() {
            if was_adult {
                round::end_game(self, EndReason::AdultLeft);
            } else if self.clients.is_empty() {
                round::end_game(self, EndReason::Abandoned);
            }
        }

        removed
    }

    /// Spawn the player entity for a client.
    pub fn spawn_player(&mut self, client: ClientId) -> NetworkId {
        let id = self.registry.spawn(Entity::Player(PlayerEntity::new(client, self.tick)), Some(client));

        let slot = self.clients.len().saturating_sub(1);
        let transform = self.config.layout.spawn_point(Team::Child, slot);
        self.store.write(StateKey::Transform(id), transform);
        self.store.write(StateKey::Coins(id), 0i64);
        self.store.write(StateKey::Candy(id), 0i64);
        self.store.write(StateKey::Caught(id), false);
        self.store.write(StateKey::MovementLocked(id), false);
        self.store.write(StateKey::SpeedMultiplier(id), 1.0f32);

        self.push_event(GameEvent::player_spawned(self.tick, id, client));
        id
    }

    /// Assign a team. Teams never change once set.
    pub fn assign_team(&mut self, id: NetworkId, team: Team, slot: usize) -> bool {
        let Some(player) = self.registry.player_mut(id) else {
            return false;
        };
        if player.team.is_some() {
            debug!(entity = %id, "team already assigned");
            return false;
        }
        player.team = Some(team);
        player.spawn_slot = slot;

        self.store.write(StateKey::Team(id), team);
        if team == Team::Adult {
            self.store.write(StateKey::Coins(id), self.config.shop.adult_starting_coins);
            self.store.write(StateKey::Inventory(id), Vec::<ItemId>::new());
        }
        true
    }

    /// Remove an entity from the registry and clean up after it.
    pub fn despawn(&mut self, id: NetworkId) -> Option<Entity> {
        let entity = self.registry.unregister(id)?;
        self.cleanup_entity(id, &entity);
        Some(entity)
    }

    fn cleanup_entity(&mut self, id: NetworkId, entity: &Entity) {
        self.scheduler.cancel_for(id);
        self.store.remove_entity(id);
        trap::forget_entity(self, id);
        self.push_event(GameEvent::despawned(self.tick, id, entity.kind()));
    }

    /// Despawn everything and clear pending timers.
    pub fn teardown(&mut self) {
        let ids: Vec<NetworkId> = self.registry.ids().collect();
        for id in ids {
            self.despawn(id);
        }
        self.scheduler.clear();
        self.clients.clear();
    }

    // ===== LOOKUPS =====

    /// Player entity of a client.
    pub fn player_of(&self, client: ClientId) -> Option<NetworkId> {
        self.registry.player_of(client)
    }

    /// Team of a player.
    pub fn team_of(&self, id: NetworkId) -> Option<Team> {
        self.registry.player(id).and_then(|p| p.team)
    }

    /// The adult, if assigned and connected.
    pub fn adult(&self) -> Option<NetworkId> {
        self.registry.players()
            .find(|(_, p)| p.is_adult())
            .map(|(id, _)| id)
    }

    /// Children in id order.
    pub fn children(&self) -> Vec<NetworkId> {
        self.registry.players()
            .filter(|(_, p)| p.is_child())
            .map(|(id, _)| id)
            .collect()
    }

    // ===== REPLICATED VALUES =====

    /// Coin balance.
    pub fn coins(&self, id: NetworkId) -> i64 {
        self.store.read_int(&StateKey::Coins(id)).unwrap_or(0)
    }

    /// Set coin balance (floored at zero).
    pub fn set_coins(&mut self, id: NetworkId, coins: i64) {
        self.store.write(StateKey::Coins(id), coins.max(0));
    }

    /// Add (or subtract) coins; the balance never goes below zero.
    pub fn add_coins(&mut self, id: NetworkId, delta: i64) -> i64 {
        let coins = self.coins(id).saturating_add(delta).max(0);
        self.store.write(StateKey::Coins(id), coins);
        coins
    }

    /// Candy carried.
    pub fn candy(&self, id: NetworkId) -> i64 {
        self.store.read_int(&StateKey::Candy(id)).unwrap_or(0)
    }

    /// Set candy carried.
    pub fn set_candy(&mut self, id: NetworkId, candy: i64) {
        self.store.write(StateKey::Candy(id), candy.max(0));
    }

    /// Caught flag.
    pub fn is_caught(&self, id: NetworkId) -> bool {
        self.store.read_bool(&StateKey::Caught(id)).unwrap_or(false)
    }

    /// Set caught flag.
    pub fn set_caught(&mut self, id: NetworkId, caught: bool) {
        self.store.write(StateKey::Caught(id), caught);
    }

    /// World transform.
    pub fn transform(&self, id: NetworkId) -> Option<Transform> {
        self.store.read_transform(&StateKey::Transform(id))
    }

    /// Set world transform.
    pub fn set_transform(&mut self, id: NetworkId, transform: Transform) {
        self.store.write(StateKey::Transform(id), transform);
    }

    /// Speed multiplier.
    pub fn speed_multiplier(&self, id: NetworkId) -> f32 {
        self.store.read_float(&StateKey::SpeedMultiplier(id)).unwrap_or(1.0)
    }

    /// Movement lock.
    pub fn is_movement_locked(&self, id: NetworkId) -> bool {
        self.store.read_bool(&StateKey::MovementLocked(id)).unwrap_or(false)
    }

    /// Inventory of a player.
    pub fn inventory(&self, id: NetworkId) -> Inventory {
        let items = self.store.read_items(&StateKey::Inventory(id)).unwrap_or(&[]);
        Inventory::from_items(items.to_vec(), self.config.shop.inventory_capacity)
    }

    /// Replace the inventory of a player.
    pub fn set_inventory(&mut self, id: NetworkId, inventory: &Inventory) {
        self.store.write(StateKey::Inventory(id), StateValue::Items(inventory.items().to_vec()));
    }

    /// Move a player to a spawn point for its team slot.
    pub fn teleport_to_spawn(&mut self, id: NetworkId) {
        let Some(player) = self.registry.player(id) else {
            return;
        };
        let Some(team) = player.team else {
            error!(entity = %id, "teleport requested for unassigned player");
            return;
        };
        let slot = player.spawn_slot;
        let transform = self.config.layout.spawn_point(team, slot);
        self.set_transform(id, transform);
    }

    // ===== EVENTS =====

    /// Push an event.
    pub fn push_event(&mut self, event: GameEvent) {
        self.pending_events.push(event);
    }

    /// Take all pending events (sorted by tick, priority, entity).
    pub fn take_events(&mut self) -> Vec<GameEvent> {
        let mut events = std::mem::take(&mut self.pending_events);
        events.sort();
        events
    }
}

// =============================================================================
// TESTS
// =============================================================================
