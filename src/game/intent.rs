//! Player Intents
//!
//! Everything a client can ask the server to do. Intents are validated here
//! against the authoritative state; a rejected intent leaves the state
//! exactly as it was. Ownership of the acting entity is checked earlier, at
//! the dispatch boundary.

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::core::vec3::{Transform, Vec3};
use crate::game::ability;
use crate::game::candy::{self, CollectRejection};
use crate::game::catch;
use crate::game::collision::in_range;
use crate::game::events::GameEvent;
use crate::game::inventory;
use crate::game::registry::Entity;
use crate::game::state::{ItemId, NetworkId, RoundPhase, Team, WorldState};
use crate::game::store::StateKey;
use crate::game::trap::{self, TrapKind};

// =============================================================================
// INTENT TYPES
// =============================================================================

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Report a new transform for the owned player.
    Move {
        /// New transform.
        transform: Transform,
    },
    /// Interact with a candy, capture trap or door.
    Interact {
        /// Target entity.
        target: NetworkId,
    },
    /// Buy a shop item (adult, preparation only).
    Purchase {
        /// Index into the shop catalog.
        item_index: usize,
    },
    /// Dash along a direction (adult, game phase).
    Dash {
        /// Dash direction (flattened and normalized by the server).
        direction: Vec3,
    },
    /// Place an inventory item as a trap (adult).
    PlaceItem {
        /// Inventory slot.
        slot: usize,
        /// Where to place it.
        transform: Transform,
    },
    /// Child speed ability.
    UseAbility,
}

/// Why an intent was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntentError {
    /// Not allowed in the current phase.
    #[error("not allowed during {0:?}")]
    WrongPhase(RoundPhase),

    /// Requires a different team.
    #[error("requires team {0:?}")]
    WrongTeam(Team),

    /// No shop item at this index.
    #[error("no shop item at index {0}")]
    UnknownItem(usize),

    /// Inventory holds an item the catalog does not know.
    #[error("unknown item id {0:?}")]
    UnknownItemId(ItemId),

    /// Not enough coins.
    #[error("item costs {price}, have {coins}")]
    InsufficientCoins {
        /// Item price.
        price: i64,
        /// Current balance.
        coins: i64,
    },

    /// No free inventory slot.
    #[error("inventory full")]
    InventoryFull,

    /// Inventory slot is empty or out of range.
    #[error("inventory slot {0} is empty")]
    EmptySlot(usize),

    /// Transform contains NaN or infinity.
    #[error("invalid transform")]
    InvalidTransform,

    /// Direction is zero or not finite.
    #[error("invalid direction")]
    InvalidDirection,

    /// Player is stunned.
    #[error("movement locked")]
    MovementLocked,

    /// Server is moving the player along a dash.
    #[error("dash in progress")]
    Dashing,

    /// Displacement exceeds what the player's speed allows.
    #[error("moved {distance:.2}, allowed {allowed:.2}")]
    TooFast {
        /// Distance requested.
        distance: f32,
        /// Distance allowed.
        allowed: f32,
    },

    /// Ability or dash on cooldown.
    #[error("on cooldown")]
    OnCooldown,

    /// Target is out of interaction range.
    #[error("target out of range")]
    OutOfRange,

    /// Caught children cannot do this.
    #[error("player is caught")]
    Caught,

    /// Carrying the maximum amount of candy.
    #[error("candy capacity reached")]
    CandyFull,

    /// Target cannot be interacted with.
    #[error("entity {0} is not interactable")]
    NotInteractable(NetworkId),
}

/// Configuration for movement validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementSettings {
    /// Base speed in units per second.
    pub max_speed: f32,
    /// Slack for latency and jitter.
    pub tolerance: f32,
}

impl Default for MovementSettings {
    fn default() -> Self {
        Self {
            max_speed: 5.0,
            tolerance: 1.5,
        }
    }
}

// =============================================================================
// VALIDATION AND APPLICATION
// =============================================================================

/// Validate and apply an intent for `actor`.
///
/// A missing actor or target is a race with a despawn and is not an error.
pub fn apply_intent(state: &mut WorldState, actor: NetworkId, intent: Intent) -> Result<(), IntentError> {
    let Some(team) = state.registry.player(actor).map(|p| p.team) else {
        debug!(entity = %actor, "intent for missing player ignored");
        return Ok(());
    };
    if state.phase() == RoundPhase::GameEnd {
        return Err(IntentError::WrongPhase(RoundPhase::GameEnd));
    }

    match intent {
        Intent::Move { transform } => apply_move(state, actor, transform),
        Intent::Interact { target } => interact(state, actor, team, target),
        Intent::Purchase { item_index } => {
            require_team(team, Team::Adult)?;
            inventory::purchase(state, actor, item_index).map(|_| ())
        }
        Intent::Dash { direction } => {
            require_team(team, Team::Adult)?;
            catch::request_dash(state, actor, direction)
        }
        Intent::PlaceItem { slot, transform } => {
            require_team(team, Team::Adult)?;
            inventory::place_item(state, actor, slot, transform).map(|_| ())
        }
        Intent::UseAbility => {
            require_team(team, Team::Child)?;
            if !matches!(state.phase(), RoundPhase::Preparation | RoundPhase::Game) {
                return Err(IntentError::WrongPhase(state.phase()));
            }
            if state.is_caught(actor) {
                return Err(IntentError::Caught);
            }
            if ability::use_child_ability(state, actor) {
                Ok(())
            } else {
                Err(IntentError::OnCooldown)
            }
        }
    }
}

fn require_team(team: Option<Team>, required: Team) -> Result<(), IntentError> {
    if team == Some(required) {
        Ok(())
    } else {
        Err(IntentError::WrongTeam(required))
    }
}

/// Accept a client-reported transform if the player could have got there.
fn apply_move(state: &mut WorldState, actor: NetworkId, transform: Transform) -> Result<(), IntentError> {
    if !transform.is_finite() {
        return Err(IntentError::InvalidTransform);
    }
    if state.is_caught(actor) {
        return Err(IntentError::Caught);
    }
    if state.is_movement_locked(actor) {
        return Err(IntentError::MovementLocked);
    }

    let now = state.tick;
    let (dashing, last_move_tick) = match state.registry.player(actor) {
        Some(p) => (p.dash.is_some(), p.last_move_tick),
        None => return Ok(()),
    };
    if dashing {
        return Err(IntentError::Dashing);
    }

    if let Some(current) = state.transform(actor) {
        let elapsed_ticks = now.saturating_sub(last_move_tick).max(1);
        let elapsed = elapsed_ticks as f32 / state.config.tick_rate.max(1) as f32;
        let settings = &state.config.movement;
        let allowed = settings.max_speed * state.speed_multiplier(actor) * elapsed * settings.tolerance;
        let distance = current.position.flatten().distance(transform.position.flatten());
        if distance > allowed {
            return Err(IntentError::TooFast { distance, allowed });
        }
    }

    state.set_transform(actor, transform);
    if let Some(player) = state.registry.player_mut(actor) {
        player.last_move_tick = now;
    }
    Ok(())
}

fn interact(
    state: &mut WorldState,
    actor: NetworkId,
    team: Option<Team>,
    target: NetworkId,
) -> Result<(), IntentError> {
    let range = state.config.interaction_distance;

    match state.registry.resolve(target) {
        None => {
            debug!(entity = %actor, target = %target, "interaction target gone");
            Ok(())
        }
        Some(Entity::Candy(_)) => {
            require_team(team, Team::Child)?;
            if !matches!(state.phase(), RoundPhase::Preparation | RoundPhase::Game) {
                return Err(IntentError::WrongPhase(state.phase()));
            }
            match candy::collect_candy(state, actor, target) {
                Ok(_) | Err(CollectRejection::Gone) => Ok(()),
                Err(CollectRejection::OutOfRange) => Err(IntentError::OutOfRange),
                Err(CollectRejection::Caught) => Err(IntentError::Caught),
                Err(CollectRejection::Full) => Err(IntentError::CandyFull),
            }
        }
        Some(Entity::Trap(t)) if t.kind == TrapKind::Capture => {
            let position = t.position;
            require_team(team, Team::Child)?;
            if state.is_caught(actor) {
                return Err(IntentError::Caught);
            }
            if !in_range(state, actor, position, range) {
                return Err(IntentError::OutOfRange);
            }
            trap::release_captives(state, target, actor);
            Ok(())
        }
        Some(Entity::Door(door)) => {
            let position = door.position;
            if !in_range(state, actor, position, range) {
                return Err(IntentError::OutOfRange);
            }
            let open = !state.store.read_bool(&StateKey::DoorOpen(target)).unwrap_or(false);
            state.store.write(StateKey::DoorOpen(target), open);
            state.push_event(GameEvent::door_toggled(state.tick, target, open, actor));
            Ok(())
        }
        Some(_) => Err(IntentError::NotInteractable(target)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::state::ClientId;

    fn world() -> (WorldState, NetworkId, NetworkId) {
        let mut state = WorldState::new([1; 16], GameConfig::default());
        let adult = state.connect(ClientId(1)).unwrap();
        let child = state.connect(ClientId(2)).unwrap();
        state.assign_team(adult, Team::Adult, 0);
        state.assign_team(child, Team::Child, 0);
        state.round.phase = RoundPhase::Game;
        state.set_transform(child, Transform::ORIGIN);
        (state, adult, child)
    }

    #[test]
    fn test_move_within_speed() {
        let (mut state, _, child) = world();
        state.tick = 30;
        let to = Transform::at(Vec3::new(5.0, 0.0, 0.0));
        assert!(apply_intent(&mut state, child, Intent::Move { transform: to }).is_ok());
        assert_eq!(state.transform(child), Some(to));
    }

    #[test]
    fn test_caught_child_is_frozen_until_released() {
        let (mut state, _, child) = world();
        state.tick = 30;
        state.set_caught(child, true);
        let to = Transform::at(Vec3::new(1.0, 0.0, 0.0));

        assert_eq!(apply_intent(&mut state, child, Intent::Move { transform: to }), Err(IntentError::Caught));
        assert_eq!(state.transform(child), Some(Transform::ORIGIN));

        state.set_caught(child, false);
        assert!(apply_intent(&mut state, child, Intent::Move { transform: to }).is_ok());
    }

    #[test]
    fn test_move_too_fast_rejected() {
        let (mut state, _, child) = world();
        state.tick = 1;
        let to = Transform::at(Vec3::new(50.0, 0.0, 0.0));
        assert!(matches!(
            apply_intent(&mut state, child, Intent::Move { transform: to }),
            Err(IntentError::TooFast { .. })
        ));
        assert_eq!(state.transform(child), Some(Transform::ORIGIN));
    }

    #[test]
    fn test_slow_reduces_allowed_distance() {
        let (mut state, _, child) = world();
        state.tick = 30;
        ability::apply_speed_effect(&mut state, child, ability::EffectKind::Slow, 0.5, 150);

        // 5 * 0.5 * 1s * 1.5 = 3.75
        let to = Transform::at(Vec3::new(4.0, 0.0, 0.0));
        assert!(apply_intent(&mut state, child, Intent::Move { transform: to }).is_err());
        let to = Transform::at(Vec3::new(3.5, 0.0, 0.0));
        assert!(apply_intent(&mut state, child, Intent::Move { transform: to }).is_ok());
    }

    #[test]
    fn test_locked_player_cannot_move() {
        let (mut state, _, child) = world();
        ability::apply_movement_lock(&mut state, child, 90);
        state.tick = 30;
        assert_eq!(
            apply_intent(&mut state, child, Intent::Move { transform: Transform::ORIGIN }),
            Err(IntentError::MovementLocked)
        );
    }

    #[test]
    fn test_nan_transform_rejected() {
        let (mut state, _, child) = world();
        let bad = Transform::at(Vec3::new(f32::NAN, 0.0, 0.0));
        assert_eq!(
            apply_intent(&mut state, child, Intent::Move { transform: bad }),
            Err(IntentError::InvalidTransform)
        );
    }

    #[test]
    fn test_team_gates() {
        let (mut state, adult, child) = world();
        assert_eq!(
            apply_intent(&mut state, child, Intent::Purchase { item_index: 0 }),
            Err(IntentError::WrongTeam(Team::Adult))
        );
        assert_eq!(
            apply_intent(&mut state, adult, Intent::UseAbility),
            Err(IntentError::WrongTeam(Team::Child))
        );
        assert!(apply_intent(&mut state, child, Intent::UseAbility).is_ok());
    }

    #[test]
    fn test_missing_actor_is_noop() {
        let (mut state, _, _) = world();
        assert!(apply_intent(&mut state, NetworkId(999), Intent::UseAbility).is_ok());
    }

    #[test]
    fn test_door_toggle() {
        let (mut state, adult, _) = world();
        let (door, position) = state.registry.doors().map(|(id, d)| (id, d.position)).next().unwrap();
        state.set_transform(adult, Transform::at(position));

        apply_intent(&mut state, adult, Intent::Interact { target: door }).unwrap();
        assert_eq!(state.store.read_bool(&StateKey::DoorOpen(door)), Some(true));
        apply_intent(&mut state, adult, Intent::Interact { target: door }).unwrap();
        assert_eq!(state.store.read_bool(&StateKey::DoorOpen(door)), Some(false));
    }

    #[test]
    fn test_release_requires_free_child_in_range() {
        let (mut state, _, child) = world();
        let rescuer = state.connect(ClientId(3)).unwrap();
        state.assign_team(rescuer, Team::Child, 1);
        let cage = trap::spawn_trap(&mut state, TrapKind::Capture, Vec3::new(10.0, 0.0, 0.0), false, None);
        trap::on_enter(&mut state, cage, child);
        assert!(state.is_caught(child));

        state.set_transform(rescuer, Transform::at(Vec3::new(40.0, 0.0, 0.0)));
        assert_eq!(
            apply_intent(&mut state, rescuer, Intent::Interact { target: cage }),
            Err(IntentError::OutOfRange)
        );

        state.set_transform(rescuer, Transform::at(Vec3::new(11.0, 0.0, 0.0)));
        apply_intent(&mut state, rescuer, Intent::Interact { target: cage }).unwrap();
        assert!(!state.is_caught(child));
    }

    #[test]
    fn test_interact_with_spawner_rejected() {
        let (mut state, _, child) = world();
        let spawner = state.registry.spawners().map(|(id, _)| id).next().unwrap();
        assert_eq!(
            apply_intent(&mut state, child, Intent::Interact { target: spawner }),
            Err(IntentError::NotInteractable(spawner))
        );
    }
}
