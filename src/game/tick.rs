//! Authoritative Simulation Tick
//!
//! One fixed step of the server simulation. Intents are applied between
//! ticks as they arrive; a tick only advances time-driven behavior.

use tracing::trace;

use crate::game::ability;
use crate::game::candy;
use crate::game::catch;
use crate::game::events::{GameEvent, GameEventData};
use crate::game::round;
use crate::game::scheduler::TimerTask;
use crate::game::state::{RoundPhase, WorldState};
use crate::game::store::StateDelta;
use crate::game::trap;

/// Result of a tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Events generated since the previous tick, sorted.
    pub events: Vec<GameEvent>,
    /// Replicated state changes to broadcast, in sequence order.
    pub deltas: Vec<StateDelta>,
    /// The round phase changed during this tick.
    pub phase_changed: bool,
    /// The session reached its terminal phase during this tick.
    pub game_ended: bool,
}

/// Run one simulation tick.
///
/// Order within a tick:
/// 1. Advance the tick counter
/// 2. Fire due timers (effect expiry, trap rearm, candy respawn)
/// 3. Move dashing adults and resolve catches
/// 4. Resolve trap occupancy
/// 5. Advance the round machine
/// 6. Drain events and replicated deltas
pub fn tick(state: &mut WorldState) -> TickResult {
    let phase_before = state.phase();

    state.tick += 1;

    run_timers(state);
    catch::process_dashes(state);
    trap::process_traps(state);
    round::advance(state);

    let events = state.take_events();
    let game_ended = events.iter().any(|e| matches!(e.data, GameEventData::GameEnded { .. }));

    TickResult {
        events,
        deltas: state.store.take_outbox(),
        phase_changed: state.phase() != phase_before,
        game_ended: game_ended && state.phase() == RoundPhase::GameEnd,
    }
}

/// Fire every timer due at the current tick.
fn run_timers(state: &mut WorldState) {
    let due = state.scheduler.pop_due(state.tick);
    for (handle, task) in due {
        trace!(tick = state.tick, ?task, "timer fired");
        match task {
            TimerTask::ClearSpeed(id) => ability::clear_speed_effect(state, id, handle),
            TimerTask::ClearLock(id) => ability::clear_movement_lock(state, id, handle),
            TimerTask::RearmTrap(id) => trap::rearm(state, id, handle),
            TimerTask::RespawnCandy(id) => candy::respawn(state, id, handle),
        }
    }
}

/// Run `ticks` ticks and collect every event. Used by tests and the demo.
pub fn run_ticks(state: &mut WorldState, ticks: u64) -> Vec<GameEvent> {
    let mut events = Vec::new();
    for _ in 0..ticks {
        events.extend(tick(state).events);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::core::vec3::{Transform, Vec3};
    use crate::game::ability::EffectKind;
    use crate::game::state::{ClientId, Team};
    use crate::game::store::StateKey;

    fn lobby(players: u64) -> WorldState {
        let mut state = WorldState::new([3; 16], GameConfig::default());
        for c in 1..=players {
            state.connect(ClientId(c));
        }
        state
    }

    #[test]
    fn test_tick_advances_counter() {
        let mut state = lobby(1);
        tick(&mut state);
        tick(&mut state);
        assert_eq!(state.tick, 2);
    }

    #[test]
    fn test_full_lobby_starts_preparation() {
        let mut state = lobby(4);
        let result = tick(&mut state);

        assert!(result.phase_changed);
        assert_eq!(state.phase(), RoundPhase::Preparation);
        assert!(state.adult().is_some());
        assert_eq!(state.children().len(), 3);
        assert!(result.deltas.iter().any(|d| d.key == StateKey::Phase));
    }

    #[test]
    fn test_timer_expires_effect() {
        let mut state = lobby(4);
        tick(&mut state);
        let child = state.children()[0];

        ability::apply_speed_effect(&mut state, child, EffectKind::Slow, 0.5, 10);
        run_ticks(&mut state, 9);
        assert_eq!(state.speed_multiplier(child), 0.5);
        run_ticks(&mut state, 1);
        assert_eq!(state.speed_multiplier(child), 1.0);
    }

    #[test]
    fn test_catching_everyone_ends_round_early() {
        let mut state = lobby(2);
        state.config.round.expected_players = 2;
        tick(&mut state);
        let adult = state.adult().unwrap();
        let child = state.children()[0];

        // skip preparation
        state.round.phase_ticks_remaining = 1;
        tick(&mut state);
        assert_eq!(state.phase(), RoundPhase::Game);

        catch::catch_child(&mut state, adult, child);
        let result = tick(&mut state);
        assert!(result.phase_changed);
        assert_eq!(state.phase(), RoundPhase::RoundEnd);
        assert!(state.round.finished_early);
        assert!(result.events.iter().any(|e| matches!(e.data, GameEventData::RoundRewarded { .. })));
    }

    #[test]
    fn test_game_end_reported_once() {
        let mut state = lobby(2);
        state.config.round.expected_players = 2;
        state.config.round.total_rounds = 1;
        tick(&mut state);

        let mut ended = 0;
        for _ in 0..20_000 {
            if tick(&mut state).game_ended {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
        assert_eq!(state.phase(), RoundPhase::GameEnd);
    }

    #[test]
    fn test_same_seed_same_digest() {
        let run = || {
            let mut state = lobby(4);
            tick(&mut state);
            let child = state.children()[1];
            let team = state.team_of(child);
            state.set_transform(child, Transform::at(Vec3::new(1.0, 0.0, 2.0)));
            run_ticks(&mut state, 200);
            (state.store.digest(), team)
        };
        assert_eq!(run(), run());
        assert_eq!(run().1, Some(Team::Child));
    }
}
