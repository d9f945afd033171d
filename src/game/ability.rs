//! Timed Effects and the Child Ability
//!
//! Slow and the speed boost share one speed-multiplier slot per player; stun
//! is a separate movement-lock slot. Starting an effect cancels the pending
//! expiry of whatever occupied the slot, so the most recent effect wins and
//! runs for its full duration.

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::game::events::GameEvent;
use crate::game::scheduler::{TimerHandle, TimerTask};
use crate::game::state::{NetworkId, WorldState};
use crate::game::store::StateKey;

/// Kind of timed effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    /// Reduced speed.
    Slow,
    /// Movement lock.
    Stun,
    /// Increased speed (child ability).
    SpeedBoost,
}

/// Configuration for the child speed ability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilitySettings {
    /// Speed multiplier while boosted.
    pub boost_multiplier: f32,
    /// Boost duration in seconds.
    pub boost_secs: f32,
    /// Cooldown between uses in seconds.
    pub cooldown_secs: f32,
}

impl Default for AbilitySettings {
    fn default() -> Self {
        Self {
            boost_multiplier: 1.5,
            boost_secs: 3.0,
            cooldown_secs: 0.0,
        }
    }
}

/// Set a player's speed multiplier for `duration_ticks`, then reset to 1.0.
pub fn apply_speed_effect(
    state: &mut WorldState,
    id: NetworkId,
    effect: EffectKind,
    multiplier: f32,
    duration_ticks: u64,
) -> bool {
    let now = state.tick;
    let Some(player) = state.registry.player_mut(id) else {
        return false;
    };

    if let Some(previous) = player.speed_timer.take() {
        state.scheduler.cancel(previous);
    }
    let handle = state.scheduler.schedule_after(now, duration_ticks, TimerTask::ClearSpeed(id));
    player.speed_timer = Some(handle);

    state.store.write(StateKey::SpeedMultiplier(id), multiplier);
    state.push_event(GameEvent::effect_started(now, id, effect, duration_ticks));
    debug!(entity = %id, ?effect, multiplier, duration_ticks, "speed effect applied");
    true
}

/// Lock a player's movement for `duration_ticks`.
pub fn apply_movement_lock(state: &mut WorldState, id: NetworkId, duration_ticks: u64) -> bool {
    let now = state.tick;
    let Some(player) = state.registry.player_mut(id) else {
        return false;
    };

    if let Some(previous) = player.lock_timer.take() {
        state.scheduler.cancel(previous);
    }
    let handle = state.scheduler.schedule_after(now, duration_ticks, TimerTask::ClearLock(id));
    player.lock_timer = Some(handle);

    state.store.write(StateKey::MovementLocked(id), true);
    state.push_event(GameEvent::effect_started(now, id, EffectKind::Stun, duration_ticks));
    true
}

/// Timer continuation: reset speed to 1.0.
pub fn clear_speed_effect(state: &mut WorldState, id: NetworkId, handle: TimerHandle) {
    let Some(player) = state.registry.player_mut(id) else {
        return;
    };
    if player.speed_timer != Some(handle) {
        return;
    }
    player.speed_timer = None;

    let effect = if state.speed_multiplier(id) > 1.0 {
        EffectKind::SpeedBoost
    } else {
        EffectKind::Slow
    };
    state.store.write(StateKey::SpeedMultiplier(id), 1.0f32);
    state.push_event(GameEvent::effect_ended(state.tick, id, effect));
}

/// Timer continuation: lift the movement lock.
pub fn clear_movement_lock(state: &mut WorldState, id: NetworkId, handle: TimerHandle) {
    let Some(player) = state.registry.player_mut(id) else {
        return;
    };
    if player.lock_timer != Some(handle) {
        return;
    }
    player.lock_timer = None;

    state.store.write(StateKey::MovementLocked(id), false);
    state.push_event(GameEvent::effect_ended(state.tick, id, EffectKind::Stun));
}

/// Cancel every effect on a player and restore defaults (round reset).
pub fn reset_effects(state: &mut WorldState, id: NetworkId) {
    let Some(player) = state.registry.player_mut(id) else {
        return;
    };
    let timers = [player.speed_timer.take(), player.lock_timer.take()];
    player.dash = None;

    for handle in timers.into_iter().flatten() {
        state.scheduler.cancel(handle);
    }
    state.store.write(StateKey::SpeedMultiplier(id), 1.0f32);
    state.store.write(StateKey::MovementLocked(id), false);
}

/// Child ability: temporary speed boost.
///
/// Returns false while on cooldown.
pub fn use_child_ability(state: &mut WorldState, id: NetworkId) -> bool {
    let now = state.tick;
    let settings = state.config.ability.clone();
    let duration = state.secs_to_ticks(settings.boost_secs);
    let cooldown = state.secs_to_ticks(settings.cooldown_secs);

    let Some(player) = state.registry.player_mut(id) else {
        return false;
    };
    if now < player.next_ability_tick {
        return false;
    }
    player.next_ability_tick = now + cooldown;

    apply_speed_effect(state, id, EffectKind::SpeedBoost, settings.boost_multiplier, duration);
    state.push_event(GameEvent::ability_used(now, id));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::state::{ClientId, Team};

    fn world_with_child() -> (WorldState, NetworkId) {
        let mut state = WorldState::new([2; 16], GameConfig::default());
        let id = state.connect(ClientId(1)).unwrap();
        state.assign_team(id, Team::Child, 0);
        (state, id)
    }

    fn advance(state: &mut WorldState, ticks: u64) {
        for _ in 0..ticks {
            state.tick += 1;
            for (handle, task) in state.scheduler.pop_due(state.tick) {
                match task {
                    TimerTask::ClearSpeed(id) => clear_speed_effect(state, id, handle),
                    TimerTask::ClearLock(id) => clear_movement_lock(state, id, handle),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_speed_effect_expires() {
        let (mut state, id) = world_with_child();
        apply_speed_effect(&mut state, id, EffectKind::Slow, 0.5, 10);
        assert_eq!(state.speed_multiplier(id), 0.5);

        advance(&mut state, 9);
        assert_eq!(state.speed_multiplier(id), 0.5);
        advance(&mut state, 1);
        assert_eq!(state.speed_multiplier(id), 1.0);
    }

    #[test]
    fn test_restart_cancels_previous_expiry() {
        let (mut state, id) = world_with_child();
        apply_speed_effect(&mut state, id, EffectKind::Slow, 0.5, 10);
        advance(&mut state, 5);
        apply_speed_effect(&mut state, id, EffectKind::Slow, 0.5, 10);

        advance(&mut state, 5);
        assert_eq!(state.speed_multiplier(id), 0.5);
        advance(&mut state, 5);
        assert_eq!(state.speed_multiplier(id), 1.0);
    }

    #[test]
    fn test_boost_overrides_slow() {
        let (mut state, id) = world_with_child();
        apply_speed_effect(&mut state, id, EffectKind::Slow, 0.5, 150);
        advance(&mut state, 10);

        assert!(use_child_ability(&mut state, id));
        assert_eq!(state.speed_multiplier(id), 1.5);

        advance(&mut state, 90);
        assert_eq!(state.speed_multiplier(id), 1.0);
        advance(&mut state, 100);
        assert_eq!(state.speed_multiplier(id), 1.0);
    }

    #[test]
    fn test_movement_lock() {
        let (mut state, id) = world_with_child();
        apply_movement_lock(&mut state, id, 90);
        assert!(state.is_movement_locked(id));
        advance(&mut state, 90);
        assert!(!state.is_movement_locked(id));
    }

    #[test]
    fn test_reset_effects() {
        let (mut state, id) = world_with_child();
        apply_speed_effect(&mut state, id, EffectKind::Slow, 0.5, 100);
        apply_movement_lock(&mut state, id, 100);

        reset_effects(&mut state, id);
        assert_eq!(state.speed_multiplier(id), 1.0);
        assert!(!state.is_movement_locked(id));
        assert!(state.scheduler.is_empty());
    }

    #[test]
    fn test_ability_cooldown() {
        let (mut state, id) = world_with_child();
        state.config.ability.cooldown_secs = 1.0;

        assert!(use_child_ability(&mut state, id));
        assert!(!use_child_ability(&mut state, id));
        advance(&mut state, 30);
        assert!(use_child_ability(&mut state, id));
    }
}
