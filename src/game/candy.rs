//! Candy Spawning and Collection
//!
//! Each spawner offers at most one candy at a time. The first valid claim
//! wins; the candy is despawned and a respawn is scheduled after the
//! spawner's cooldown. Spawners only run between round start and round end.

use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::vec3::{Transform, Vec3};
use crate::game::collision::in_range;
use crate::game::events::GameEvent;
use crate::game::registry::Entity;
use crate::game::scheduler::{TimerHandle, TimerTask};
use crate::game::state::{NetworkId, WorldState};
use crate::game::store::StateKey;

/// Configuration for candy spawning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandySettings {
    /// Respawn cooldown after pickup.
    pub respawn_secs: f32,
    /// Most candy a child can carry.
    pub max_candies: i64,
}

impl Default for CandySettings {
    fn default() -> Self {
        Self {
            respawn_secs: 10.0,
            max_candies: 5,
        }
    }
}

/// A candy spawner.
#[derive(Clone, Debug)]
pub struct CandySpawner {
    /// Where candy appears.
    pub position: Vec3,
    /// Respawn cooldown.
    pub respawn_ticks: u64,
    /// Spawning enabled for the current round.
    pub enabled: bool,
    /// Candy currently offered.
    pub current: Option<NetworkId>,
    /// Pending respawn.
    pub respawn_timer: Option<TimerHandle>,
}

/// A collectible candy.
#[derive(Clone, Debug)]
pub struct CandyEntity {
    /// Spawner that produced it.
    pub spawner: NetworkId,
    /// World position.
    pub position: Vec3,
}

/// Why a collection attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectRejection {
    /// Candy no longer exists.
    Gone,
    /// Child is too far away.
    OutOfRange,
    /// Caught children cannot collect.
    Caught,
    /// Child already carries the maximum.
    Full,
}

/// Create (disabled) spawners at level positions.
pub fn spawn_spawners(state: &mut WorldState, positions: &[Vec3]) -> Vec<NetworkId> {
    let respawn_ticks = state.secs_to_ticks(state.config.candy.respawn_secs);
    positions.iter()
        .map(|position| {
            let spawner = CandySpawner {
                position: *position,
                respawn_ticks,
                enabled: false,
                current: None,
                respawn_timer: None,
            };
            let id = state.registry.spawn(Entity::Spawner(spawner), None);
            state.store.write(StateKey::CandyAvailable(id), false);
            id
        })
        .collect()
}

/// Enable every spawner and offer a candy at each.
pub fn enable_spawners(state: &mut WorldState) {
    let ids: Vec<NetworkId> = state.registry.spawners().map(|(id, _)| id).collect();
    for id in ids {
        if let Some(spawner) = state.registry.spawner_mut(id) {
            spawner.enabled = true;
        }
        spawn_candy(state, id);
    }
}

/// Disable every spawner, cancel respawns and remove offered candy.
pub fn disable_spawners(state: &mut WorldState) {
    let ids: Vec<NetworkId> = state.registry.spawners().map(|(id, _)| id).collect();
    for id in ids {
        let Some(spawner) = state.registry.spawner_mut(id) else {
            continue;
        };
        spawner.enabled = false;
        let timer = spawner.respawn_timer.take();
        let candy = spawner.current.take();

        if let Some(handle) = timer {
            state.scheduler.cancel(handle);
        }
        if let Some(candy) = candy {
            state.despawn(candy);
        }
        state.store.write(StateKey::CandyAvailable(id), false);
    }
}

/// Offer a candy at a spawner. At most one candy per spawner.
pub fn spawn_candy(state: &mut WorldState, spawner_id: NetworkId) -> Option<NetworkId> {
    let spawner = state.registry.spawner(spawner_id)?;
    if !spawner.enabled || spawner.current.is_some() {
        return None;
    }
    let position = spawner.position;

    let candy = state.registry.spawn(
        Entity::Candy(CandyEntity { spawner: spawner_id, position }),
        None,
    );
    if let Some(spawner) = state.registry.spawner_mut(spawner_id) {
        spawner.current = Some(candy);
        spawner.respawn_timer = None;
    }

    state.store.write(StateKey::Transform(candy), Transform::at(position));
    state.store.write(StateKey::CandyAvailable(spawner_id), true);
    state.push_event(GameEvent::candy_spawned(state.tick, candy, spawner_id, position));
    debug!(spawner = %spawner_id, candy = %candy, "candy spawned");
    Some(candy)
}

/// Timer continuation: respawn after cooldown.
pub fn respawn(state: &mut WorldState, spawner_id: NetworkId, handle: TimerHandle) {
    let fired = state.registry.spawner(spawner_id)
        .is_some_and(|s| s.respawn_timer == Some(handle));
    if fired {
        spawn_candy(state, spawner_id);
    }
}

/// A child claims a candy. Returns the child's new total.
pub fn collect_candy(
    state: &mut WorldState,
    child: NetworkId,
    candy_id: NetworkId,
) -> Result<i64, CollectRejection> {
    let Some(candy) = state.registry.candy(candy_id) else {
        return Err(CollectRejection::Gone);
    };
    let (spawner_id, position) = (candy.spawner, candy.position);

    if state.is_caught(child) {
        return Err(CollectRejection::Caught);
    }
    if !in_range(state, child, position, state.config.interaction_distance) {
        return Err(CollectRejection::OutOfRange);
    }
    let total = state.candy(child) + 1;
    if total > state.config.candy.max_candies {
        return Err(CollectRejection::Full);
    }

    state.set_candy(child, total);
    state.despawn(candy_id);

    let now = state.tick;
    if let Some(spawner) = state.registry.spawner_mut(spawner_id) {
        spawner.current = None;
        let handle = state.scheduler.schedule_after(now, spawner.respawn_ticks, TimerTask::RespawnCandy(spawner_id));
        spawner.respawn_timer = Some(handle);
    }
    state.store.write(StateKey::CandyAvailable(spawner_id), false);

    state.push_event(GameEvent::candy_collected(now, candy_id, child, total));
    info!(child = %child, candy = %candy_id, total, "candy collected");
    Ok(total)
}

/// Add one candy unless full. Returns false when full.
pub fn add_candy(state: &mut WorldState, child: NetworkId) -> bool {
    let current = state.candy(child);
    if current >= state.config.candy.max_candies {
        return false;
    }
    state.set_candy(child, current + 1);
    true
}

/// Remove one candy. Returns false when empty.
pub fn remove_candy(state: &mut WorldState, child: NetworkId) -> bool {
    let current = state.candy(child);
    if current <= 0 {
        return false;
    }
    state.set_candy(child, current - 1);
    true
}
