//! Adult Dash Catch
//!
//! The adult dashes a fixed distance along a direction over a short
//! duration. The server moves the adult each tick of the dash and catches the
//! first uncaught child within the catch radius. One catch per dash.

use serde::{Serialize, Deserialize};
use tracing::info;

use crate::core::vec3::{Transform, Vec3};
use crate::game::collision::nearest_uncaught_child;
use crate::game::events::GameEvent;
use crate::game::intent::IntentError;
use crate::game::state::{NetworkId, RoundPhase, WorldState};

/// Configuration for the dash catch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashSettings {
    /// Distance covered by one dash.
    pub distance: f32,
    /// Dash duration.
    pub duration_secs: f32,
    /// Cooldown between dashes.
    pub cooldown_secs: f32,
    /// Catch radius around the adult.
    pub catch_radius: f32,
    /// Coins the adult earns per catch.
    pub coins_reward: i64,
}

impl Default for DashSettings {
    fn default() -> Self {
        Self {
            distance: 5.0,
            duration_secs: 0.3,
            cooldown_secs: 2.0,
            catch_radius: 1.5,
            coins_reward: 10,
        }
    }
}

/// An in-flight dash.
#[derive(Clone, Debug, PartialEq)]
pub struct DashState {
    /// Position the dash started from.
    pub origin: Vec3,
    /// Position the dash ends at.
    pub target: Vec3,
    /// Tick the dash started.
    pub started_tick: u64,
    /// Dash length in ticks.
    pub duration_ticks: u64,
    /// A child was already caught by this dash.
    pub caught: bool,
}

impl DashState {
    /// Interpolated position at `tick`.
    pub fn position_at(&self, tick: u64) -> Vec3 {
        if self.duration_ticks == 0 {
            return self.target;
        }
        let t = tick.saturating_sub(self.started_tick) as f32 / self.duration_ticks as f32;
        self.origin.lerp(self.target, t)
    }

    /// True once the dash has run its course.
    pub fn is_finished(&self, tick: u64) -> bool {
        tick >= self.started_tick + self.duration_ticks
    }
}

/// Start a dash for the adult.
pub fn request_dash(state: &mut WorldState, adult: NetworkId, direction: Vec3) -> Result<(), IntentError> {
    if state.phase() != RoundPhase::Game {
        return Err(IntentError::WrongPhase(state.phase()));
    }
    if state.is_movement_locked(adult) {
        return Err(IntentError::MovementLocked);
    }
    let direction = direction.flatten().normalize();
    if direction == Vec3::ZERO || !direction.is_finite() {
        return Err(IntentError::InvalidDirection);
    }

    let settings = state.config.dash.clone();
    let duration_ticks = state.secs_to_ticks(settings.duration_secs);
    let cooldown_ticks = state.secs_to_ticks(settings.cooldown_secs);
    let now = state.tick;
    let origin = state.transform(adult).unwrap_or(Transform::ORIGIN);

    let Some(player) = state.registry.player_mut(adult) else {
        return Ok(());
    };
    if player.dash.is_some() || now < player.next_dash_tick {
        return Err(IntentError::OnCooldown);
    }

    let target = origin.position.add(direction.scale(settings.distance));
    player.dash = Some(DashState {
        origin: origin.position,
        target,
        started_tick: now,
        duration_ticks,
        caught: false,
    });
    player.next_dash_tick = now + cooldown_ticks;

    state.push_event(GameEvent::dash_started(now, adult, target));
    Ok(())
}

/// Advance every in-flight dash by one tick.
pub fn process_dashes(state: &mut WorldState) {
    let now = state.tick;
    let dashing: Vec<(NetworkId, DashState)> = state.registry.players()
        .filter_map(|(id, p)| p.dash.clone().map(|d| (id, d)))
        .collect();

    for (adult, mut dash) in dashing {
        let position = dash.position_at(now);
        let yaw = state.transform(adult).map(|t| t.yaw).unwrap_or(0.0);
        state.set_transform(adult, Transform::new(position, yaw));

        if !dash.caught && state.phase() == RoundPhase::Game {
            let radius = state.config.dash.catch_radius;
            if let Some(child) = nearest_uncaught_child(state, position, radius) {
                catch_child(state, adult, child);
                dash.caught = true;
            }
        }

        if let Some(player) = state.registry.player_mut(adult) {
            player.dash = if dash.is_finished(now) { None } else { Some(dash) };
            player.last_move_tick = now;
        }
    }
}

/// Catch a child: caught flag set, carried candy dropped, adult rewarded.
pub fn catch_child(state: &mut WorldState, adult: NetworkId, child: NetworkId) -> bool {
    if state.is_caught(child) {
        return false;
    }
    state.set_caught(child, true);
    state.set_candy(child, 0);
    let reward = state.config.dash.coins_reward;
    let coins = state.add_coins(adult, reward);

    state.push_event(GameEvent::child_caught(state.tick, child, Some(adult), None));
    info!(adult = %adult, child = %child, coins, "child caught");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::state::{ClientId, Team};

    fn world() -> (WorldState, NetworkId, NetworkId) {
        let mut state = WorldState::new([5; 16], GameConfig::default());
        let adult = state.connect(ClientId(1)).unwrap();
        let child = state.connect(ClientId(2)).unwrap();
        state.assign_team(adult, Team::Adult, 0);
        state.assign_team(child, Team::Child, 0);
        state.round.phase = RoundPhase::Game;
        state.set_transform(adult, Transform::ORIGIN);
        (state, adult, child)
    }

    fn run(state: &mut WorldState, ticks: u64) {
        for _ in 0..ticks {
            state.tick += 1;
            process_dashes(state);
        }
    }

    #[test]
    fn test_dash_moves_adult() {
        let (mut state, adult, child) = world();
        state.set_transform(child, Transform::at(Vec3::new(50.0, 0.0, 50.0)));

        request_dash(&mut state, adult, Vec3::new(1.0, 0.0, 0.0)).unwrap();
        run(&mut state, 9);

        let end = state.transform(adult).unwrap().position;
        assert!((end.x - 5.0).abs() < 1e-4);
        assert!(state.registry.player(adult).unwrap().dash.is_none());
    }

    #[test]
    fn test_dash_catches_child_in_path() {
        let (mut state, adult, child) = world();
        state.set_transform(child, Transform::at(Vec3::new(4.0, 0.0, 0.5)));
        state.set_candy(child, 3);

        request_dash(&mut state, adult, Vec3::new(1.0, 0.0, 0.0)).unwrap();
        run(&mut state, 9);

        assert!(state.is_caught(child));
        assert_eq!(state.candy(child), 0);
        assert_eq!(state.coins(adult), 110);
    }

    #[test]
    fn test_one_catch_per_dash() {
        let (mut state, adult, child) = world();
        let other = state.connect(ClientId(3)).unwrap();
        state.assign_team(other, Team::Child, 1);
        state.set_transform(child, Transform::at(Vec3::new(1.0, 0.0, 0.0)));
        state.set_transform(other, Transform::at(Vec3::new(4.5, 0.0, 0.0)));

        request_dash(&mut state, adult, Vec3::new(1.0, 0.0, 0.0)).unwrap();
        run(&mut state, 9);

        assert!(state.is_caught(child));
        assert!(!state.is_caught(other));
    }

    #[test]
    fn test_dash_cooldown() {
        let (mut state, adult, _) = world();
        request_dash(&mut state, adult, Vec3::new(0.0, 0.0, 1.0)).unwrap();
        run(&mut state, 9);

        assert_eq!(
            request_dash(&mut state, adult, Vec3::new(0.0, 0.0, 1.0)),
            Err(IntentError::OnCooldown)
        );
        run(&mut state, 51);
        assert!(request_dash(&mut state, adult, Vec3::new(0.0, 0.0, 1.0)).is_ok());
    }

    #[test]
    fn test_dash_rejected_outside_game() {
        let (mut state, adult, _) = world();
        state.round.phase = RoundPhase::Preparation;
        assert_eq!(
            request_dash(&mut state, adult, Vec3::new(1.0, 0.0, 0.0)),
            Err(IntentError::WrongPhase(RoundPhase::Preparation))
        );
    }

    #[test]
    fn test_zero_direction_rejected() {
        let (mut state, adult, _) = world();
        assert_eq!(request_dash(&mut state, adult, Vec3::ZERO), Err(IntentError::InvalidDirection));
    }

    #[test]
    fn test_catch_is_idempotent() {
        let (mut state, adult, child) = world();
        assert!(catch_child(&mut state, adult, child));
        assert!(!catch_child(&mut state, adult, child));
        assert_eq!(state.coins(adult), 110);
    }
}
