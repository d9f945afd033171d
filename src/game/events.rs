//! Game Events
//!
//! Notifications generated during a tick and broadcast to clients.

use serde::{Serialize, Deserialize};

use crate::core::vec3::Vec3;
use crate::game::ability::EffectKind;
use crate::game::registry::EntityKind;
use crate::game::state::{ClientId, ItemId, NetworkId, RoundPhase, Team};
use crate::game::trap::TrapKind;

/// Priority for event delivery order.
///
/// Lower value = delivered first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventPriority {
    /// Phase transitions first
    Round = 0,
    /// Then catches and releases
    Catch = 1,
    /// Then trap activity
    Trap = 2,
    /// Then timed effects
    Effect = 3,
    /// Then candy and shop
    Economy = 4,
    /// Lowest priority
    Other = 255,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// All configured rounds were played.
    RoundsComplete,
    /// The adult disconnected.
    AdultLeft,
    /// Every client disconnected.
    Abandoned,
}

/// Game event data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEventData {
    /// Round phase changed
    PhaseChanged {
        round: u32,
        from: RoundPhase,
        to: RoundPhase,
    },

    /// Teams were assigned
    TeamsAssigned {
        adult: NetworkId,
        children: Vec<NetworkId>,
    },

    /// Player entity spawned for a client
    PlayerSpawned {
        entity: NetworkId,
        client: ClientId,
    },

    /// Late joiner received a team
    LateJoin {
        entity: NetworkId,
        team: Team,
    },

    /// Entity removed from the world
    Despawned {
        entity: NetworkId,
        kind: EntityKind,
    },

    /// Trap placed or pre-placed
    TrapPlaced {
        trap: NetworkId,
        kind: TrapKind,
        owner: Option<NetworkId>,
        position: Vec3,
    },

    /// Trap fired on a child
    TrapTriggered {
        trap: NetworkId,
        kind: TrapKind,
        child: NetworkId,
    },

    /// Trap armed again
    TrapRearmed {
        trap: NetworkId,
    },

    /// Timed effect started
    EffectStarted {
        entity: NetworkId,
        effect: EffectKind,
        duration_ticks: u64,
    },

    /// Timed effect expired
    EffectEnded {
        entity: NetworkId,
        effect: EffectKind,
    },

    /// Child caught by a dash or a capture trap
    ChildCaught {
        child: NetworkId,
        adult: Option<NetworkId>,
        trap: Option<NetworkId>,
    },

    /// Captives released from a capture trap
    ChildrenReleased {
        trap: NetworkId,
        rescuer: NetworkId,
        children: Vec<NetworkId>,
    },

    /// Sound alert trap went off
    SoundAlert {
        trap: NetworkId,
        child: NetworkId,
        position: Vec3,
    },

    /// Candy appeared at a spawner
    CandySpawned {
        candy: NetworkId,
        spawner: NetworkId,
        position: Vec3,
    },

    /// Candy picked up
    CandyCollected {
        candy: NetworkId,
        child: NetworkId,
        total: i64,
    },

    /// Shop purchase (sent to the buyer only)
    ItemPurchased {
        adult: NetworkId,
        item: ItemId,
        coins_left: i64,
    },

    /// Adult started a dash
    DashStarted {
        adult: NetworkId,
        target: Vec3,
    },

    /// Child used the speed ability
    AbilityUsed {
        child: NetworkId,
    },

    /// Door opened or closed
    DoorToggled {
        door: NetworkId,
        open: bool,
        by: NetworkId,
    },

    /// Round rewards applied
    RoundRewarded {
        round: u32,
        finished_early: bool,
        adult: Option<(NetworkId, i64)>,
        children: Vec<(NetworkId, i64)>,
    },

    /// Session ended
    GameEnded {
        reason: EndReason,
    },
}

/// A game event with timing and priority.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameEvent {
    /// Tick when event occurred
    pub tick: u64,

    /// Delivery priority
    pub priority: EventPriority,

    /// Entity involved (for tie-breaking)
    pub entity: Option<NetworkId>,

    /// Event data
    pub data: GameEventData,
}

impl GameEvent {
    /// Create a new event.
    pub fn new(tick: u64, priority: EventPriority, data: GameEventData) -> Self {
        let entity = match &data {
            GameEventData::PlayerSpawned { entity, .. }
            | GameEventData::LateJoin { entity, .. }
            | GameEventData::Despawned { entity, .. }
            | GameEventData::EffectStarted { entity, .. }
            | GameEventData::EffectEnded { entity, .. } => Some(*entity),
            GameEventData::TrapPlaced { trap, .. }
            | GameEventData::TrapTriggered { trap, .. }
            | GameEventData::TrapRearmed { trap }
            | GameEventData::ChildrenReleased { trap, .. }
            | GameEventData::SoundAlert { trap, .. } => Some(*trap),
            GameEventData::ChildCaught { child, .. }
            | GameEventData::CandyCollected { child, .. }
            | GameEventData::AbilityUsed { child } => Some(*child),
            GameEventData::CandySpawned { candy, .. } => Some(*candy),
            GameEventData::ItemPurchased { adult, .. }
            | GameEventData::DashStarted { adult, .. } => Some(*adult),
            GameEventData::DoorToggled { door, .. } => Some(*door),
            GameEventData::TeamsAssigned { adult, .. } => Some(*adult),
            _ => None,
        };

        Self {
            tick,
            priority,
            entity,
            data,
        }
    }

    /// Create phase changed event.
    pub fn phase_changed(tick: u64, round: u32, from: RoundPhase, to: RoundPhase) -> Self {
        Self::new(tick, EventPriority::Round, GameEventData::PhaseChanged { round, from, to })
    }

    /// Create teams assigned event.
    pub fn teams_assigned(tick: u64, adult: NetworkId, children: Vec<NetworkId>) -> Self {
        Self::new(tick, EventPriority::Round, GameEventData::TeamsAssigned { adult, children })
    }

    /// Create player spawned event.
    pub fn player_spawned(tick: u64, entity: NetworkId, client: ClientId) -> Self {
        Self::new(tick, EventPriority::Other, GameEventData::PlayerSpawned { entity, client })
    }

    /// Create late join event.
    pub fn late_join(tick: u64, entity: NetworkId, team: Team) -> Self {
        Self::new(tick, EventPriority::Other, GameEventData::LateJoin { entity, team })
    }

    /// Create despawned event.
    pub fn despawned(tick: u64, entity: NetworkId, kind: EntityKind) -> Self {
        Self::new(tick, EventPriority::Other, GameEventData::Despawned { entity, kind })
    }

    /// Create trap placed event.
    pub fn trap_placed(
        tick: u64,
        trap: NetworkId,
        kind: TrapKind,
        owner: Option<NetworkId>,
        position: Vec3,
    ) -> Self {
        Self::new(
            tick,
            EventPriority::Trap,
            GameEventData::TrapPlaced { trap, kind, owner, position },
        )
    }

    /// Create trap triggered event.
    pub fn trap_triggered(tick: u64, trap: NetworkId, kind: TrapKind, child: NetworkId) -> Self {
        Self::new(tick, EventPriority::Trap, GameEventData::TrapTriggered { trap, kind, child })
    }

    /// Create trap rearmed event.
    pub fn trap_rearmed(tick: u64, trap: NetworkId) -> Self {
        Self::new(tick, EventPriority::Trap, GameEventData::TrapRearmed { trap })
    }

    /// Create effect started event.
    pub fn effect_started(tick: u64, entity: NetworkId, effect: EffectKind, duration_ticks: u64) -> Self {
        Self::new(
            tick,
            EventPriority::Effect,
            GameEventData::EffectStarted { entity, effect, duration_ticks },
        )
    }

    /// Create effect ended event.
    pub fn effect_ended(tick: u64, entity: NetworkId, effect: EffectKind) -> Self {
        Self::new(tick, EventPriority::Effect, GameEventData::EffectEnded { entity, effect })
    }

    /// Create child caught event.
    pub fn child_caught(
        tick: u64,
        child: NetworkId,
        adult: Option<NetworkId>,
        trap: Option<NetworkId>,
    ) -> Self {
        Self::new(tick, EventPriority::Catch, GameEventData::ChildCaught { child, adult, trap })
    }

    /// Create children released event.
    pub fn children_released(
        tick: u64,
        trap: NetworkId,
        rescuer: NetworkId,
        children: Vec<NetworkId>,
    ) -> Self {
        Self::new(
            tick,
            EventPriority::Catch,
            GameEventData::ChildrenReleased { trap, rescuer, children },
        )
    }

    /// Create sound alert event.
    pub fn sound_alert(tick: u64, trap: NetworkId, child: NetworkId, position: Vec3) -> Self {
        Self::new(tick, EventPriority::Trap, GameEventData::SoundAlert { trap, child, position })
    }

    /// Create candy spawned event.
    pub fn candy_spawned(tick: u64, candy: NetworkId, spawner: NetworkId, position: Vec3) -> Self {
        Self::new(
            tick,
            EventPriority::Economy,
            GameEventData::CandySpawned { candy, spawner, position },
        )
    }

    /// Create candy collected event.
    pub fn candy_collected(tick: u64, candy: NetworkId, child: NetworkId, total: i64) -> Self {
        Self::new(tick, EventPriority::Economy, GameEventData::CandyCollected { candy, child, total })
    }

    /// Create item purchased event.
    pub fn item_purchased(tick: u64, adult: NetworkId, item: ItemId, coins_left: i64) -> Self {
        Self::new(
            tick,
            EventPriority::Economy,
            GameEventData::ItemPurchased { adult, item, coins_left },
        )
    }

    /// Create dash started event.
    pub fn dash_started(tick: u64, adult: NetworkId, target: Vec3) -> Self {
        Self::new(tick, EventPriority::Other, GameEventData::DashStarted { adult, target })
    }

    /// Create ability used event.
    pub fn ability_used(tick: u64, child: NetworkId) -> Self {
        Self::new(tick, EventPriority::Effect, GameEventData::AbilityUsed { child })
    }

    /// Create door toggled event.
    pub fn door_toggled(tick: u64, door: NetworkId, open: bool, by: NetworkId) -> Self {
        Self::new(tick, EventPriority::Other, GameEventData::DoorToggled { door, open, by })
    }

    /// Create round rewarded event.
    pub fn round_rewarded(
        tick: u64,
        round: u32,
        finished_early: bool,
        adult: Option<(NetworkId, i64)>,
        children: Vec<(NetworkId, i64)>,
    ) -> Self {
        Self::new(
            tick,
            EventPriority::Round,
            GameEventData::RoundRewarded { round, finished_early, adult, children },
        )
    }

    /// Create game ended event.
    pub fn game_ended(tick: u64, reason: EndReason) -> Self {
        Self::new(tick, EventPriority::Round, GameEventData::GameEnded { reason })
    }

    /// Events only the owning player should receive.
    pub fn private_to(&self) -> Option<NetworkId> {
        match self.data {
            GameEventData::ItemPurchased { adult, .. } => Some(adult),
            _ => None,
        }
    }
}

impl PartialEq for GameEvent {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick
            && self.priority == other.priority
            && self.entity == other.entity
    }
}

impl Eq for GameEvent {}

impl PartialOrd for GameEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GameEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Sort by: tick, then priority, then entity
        self.tick
            .cmp(&other.tick)
            .then(self.priority.cmp(&other.priority))
            .then(self.entity.cmp(&other.entity))
    }
}
