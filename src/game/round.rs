//! Round State Machine
//!
//! WaitingForPlayers → Preparation → Game → RoundEnd → {Preparation | GameEnd}.
//! Advanced once per tick by the game loop. Every phase runs on a tick
//! countdown; the game phase also ends early once every child is caught.

use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::config::GameConfig;
use crate::core::rng::DeterministicRng;
use crate::game::ability;
use crate::game::candy;
use crate::game::events::{EndReason, GameEvent};
use crate::game::reward;
use crate::game::state::{ClientId, NetworkId, RoundPhase, Team, WorldState};
use crate::game::store::StateKey;
use crate::game::trap;

/// How the adult is chosen when teams are assigned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamPolicy {
    /// The most recently connected client.
    #[default]
    LastConnected,
    /// The first client to connect.
    FirstConnected,
    /// A client picked by the session RNG.
    Random,
}

/// Configuration for round flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundSettings {
    /// Start as soon as this many clients are connected.
    pub expected_players: usize,
    /// Never start with fewer than this many.
    pub min_players: usize,
    /// Start anyway after this long (if `min_players` are present).
    pub wait_timeout_secs: f32,
    /// Preparation phase length.
    pub preparation_secs: f32,
    /// Game phase length.
    pub round_secs: f32,
    /// Pause between a round's end and the next preparation.
    pub inter_round_secs: f32,
    /// Rounds per session.
    pub total_rounds: u32,
    /// Adult selection.
    pub team_policy: TeamPolicy,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            expected_players: 4,
            min_players: 1,
            wait_timeout_secs: 30.0,
            preparation_secs: 60.0,
            round_secs: 300.0,
            inter_round_secs: 5.0,
            total_rounds: 3,
            team_policy: TeamPolicy::LastConnected,
        }
    }
}

/// Round flow state.
#[derive(Clone, Debug)]
pub struct RoundMachine {
    /// Current phase.
    pub phase: RoundPhase,
    /// Current round (1-based, 0 before the first).
    pub round: u32,
    /// Ticks left in the current phase.
    pub phase_ticks_remaining: u64,
    /// The current round's game phase ended because every child was caught.
    pub finished_early: bool,
}

impl RoundMachine {
    /// Machine waiting for players.
    pub fn new(config: &GameConfig) -> Self {
        Self {
            phase: RoundPhase::WaitingForPlayers,
            round: 0,
            phase_ticks_remaining: config.secs_to_ticks(config.round.wait_timeout_secs),
            finished_early: false,
        }
    }
}

/// Pick the adult and the children from clients in connection order.
///
/// Returns `None` when no client is connected.
pub fn assign_teams(
    clients: &[ClientId],
    policy: TeamPolicy,
    rng: &mut DeterministicRng,
) -> Option<(ClientId, Vec<ClientId>)> {
    let adult = match policy {
        TeamPolicy::LastConnected => *clients.last()?,
        TeamPolicy::FirstConnected => *clients.first()?,
        TeamPolicy::Random => *rng.choose(clients)?,
    };
    let children = clients.iter().copied().filter(|c| *c != adult).collect();
    Some((adult, children))
}

/// True iff there is at least one child and every child is caught.
pub fn adult_has_won(state: &WorldState) -> bool {
    let children = state.children();
    !children.is_empty() && children.iter().all(|id| state.is_caught(*id))
}

/// Whether the current round's game phase ended early.
pub fn has_finished_early(state: &WorldState) -> bool {
    state.round.finished_early
}

/// Advance the round machine by one tick.
pub fn advance(state: &mut WorldState) {
    let phase = state.round.phase;
    if phase == RoundPhase::GameEnd {
        return;
    }

    if phase == RoundPhase::Game && adult_has_won(state) {
        state.round.finished_early = true;
        info!(round = state.round.round, tick = state.tick, "all children caught");
        end_round(state);
        return;
    }

    state.round.phase_ticks_remaining = state.round.phase_ticks_remaining.saturating_sub(1);
    let expired = state.round.phase_ticks_remaining == 0;

    match phase {
        RoundPhase::WaitingForPlayers => {
            let connected = state.clients.len();
            let settings = &state.config.round;
            let full = connected >= settings.expected_players;
            let timed_out = expired && connected >= settings.min_players.max(1);
            if full || timed_out {
                start_session(state);
                return;
            }
        }
        RoundPhase::Preparation if expired => {
            let secs = state.config.round.round_secs;
            enter_phase(state, RoundPhase::Game, secs);
            return;
        }
        RoundPhase::Game if expired => {
            end_round(state);
            return;
        }
        RoundPhase::RoundEnd if expired => {
            let next = state.round.round + 1;
            if next > state.config.round.total_rounds {
                end_game(state, EndReason::RoundsComplete);
            } else {
                begin_preparation(state, next);
            }
            return;
        }
        _ => {}
    }

    publish_remaining(state);
}

/// Assign teams and start the first round.
fn start_session(state: &mut WorldState) {
    let policy = state.config.round.team_policy;
    let clients = state.clients.clone();
    let Some((adult_client, child_clients)) = assign_teams(&clients, policy, &mut state.rng) else {
        return;
    };

    let mut slots: Vec<usize> = (0..child_clients.len()).collect();
    if state.config.layout.shuffle_spawns {
        state.rng.shuffle(&mut slots);
    }

    let mut adult = None;
    if let Some(id) = state.player_of(adult_client) {
        state.assign_team(id, Team::Adult, 0);
        adult = Some(id);
    }
    let mut children = Vec::with_capacity(child_clients.len());
    for (client, slot) in child_clients.iter().zip(slots) {
        if let Some(id) = state.player_of(*client) {
            state.assign_team(id, Team::Child, slot);
            children.push(id);
        }
    }

    let Some(adult) = adult else {
        warn!(client = %adult_client, "adult client has no player entity");
        return;
    };
    info!(adult = %adult, children = children.len(), ?policy, "teams assigned");
    state.push_event(GameEvent::teams_assigned(state.tick, adult, children));

    begin_preparation(state, 1);
}

/// Reset round state and open the shop.
fn begin_preparation(state: &mut WorldState, round: u32) {
    state.round.round = round;
    state.round.finished_early = false;
    state.store.write(StateKey::Round, round as i64);

    let players: Vec<NetworkId> = state.registry.players().map(|(id, _)| id).collect();
    for id in players {
        ability::reset_effects(state, id);
        state.set_caught(id, false);
        state.set_candy(id, 0);
        state.teleport_to_spawn(id);
    }
    trap::reset_traps(state);
    candy::disable_spawners(state);
    candy::enable_spawners(state);

    let secs = state.config.round.preparation_secs;
    enter_phase(state, RoundPhase::Preparation, secs);
}

/// Settle rewards and pause before the next round.
fn end_round(state: &mut WorldState) {
    reward::settle_round(state);
    candy::disable_spawners(state);
    let secs = state.config.round.inter_round_secs;
    enter_phase(state, RoundPhase::RoundEnd, secs);
}

/// Enter the terminal phase. Idempotent.
pub fn end_game(state: &mut WorldState, reason: EndReason) {
    if state.round.phase == RoundPhase::GameEnd {
        return;
    }
    candy::disable_spawners(state);
    enter_phase(state, RoundPhase::GameEnd, 0.0);
    state.push_event(GameEvent::game_ended(state.tick, reason));
    info!(?reason, round = state.round.round, "game ended");
}

/// Give a client that joined mid-session its team and spawn.
pub fn join_late(state: &mut WorldState, id: NetworkId) {
    let slot = state.children().len();
    if state.assign_team(id, Team::Child, slot) {
        state.teleport_to_spawn(id);
        state.push_event(GameEvent::late_join(state.tick, id, Team::Child));
    }
}

fn enter_phase(state: &mut WorldState, phase: RoundPhase, secs: f32) {
    let from = state.round.phase;
    state.round.phase = phase;
    state.round.phase_ticks_remaining = state.secs_to_ticks(secs);

    state.store.write(StateKey::Phase, phase);
    publish_remaining(state);
    state.push_event(GameEvent::phase_changed(state.tick, state.round.round, from, phase));
    info!(round = state.round.round, ?from, to = ?phase, secs, "phase changed");
}

/// Write the whole seconds left; the store skips unchanged values.
fn publish_remaining(state: &mut WorldState) {
    let rate = state.config.tick_rate.max(1) as u64;
    let secs = state.round.phase_ticks_remaining.div_ceil(rate);
    state.store.write(StateKey::PhaseRemaining, secs as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec3::{Transform, Vec3};

    fn world() -> WorldState {
        WorldState::new([7; 16], GameConfig::default())
    }

    fn step(state: &mut WorldState, ticks: u64) {
        for _ in 0..ticks {
            state.tick += 1;
            advance(state);
        }
    }

    #[test]
    fn test_assign_teams_policies() {
        let clients = [ClientId(1), ClientId(2), ClientId(3)];
        let mut rng = DeterministicRng::new(1);

        let (adult, children) = assign_teams(&clients, TeamPolicy::LastConnected, &mut rng).unwrap();
        assert_eq!(adult, ClientId(3));
        assert_eq!(children, vec![ClientId(1), ClientId(2)]);

        let (adult, _) = assign_teams(&clients, TeamPolicy::FirstConnected, &mut rng).unwrap();
        assert_eq!(adult, ClientId(1));

        let (adult, children) = assign_teams(&clients, TeamPolicy::Random, &mut rng).unwrap();
        assert!(clients.contains(&adult));
        assert_eq!(children.len(), 2);

        assert!(assign_teams(&[], TeamPolicy::LastConnected, &mut rng).is_none());
    }

    #[test]
    fn test_random_policy_is_seeded() {
        let clients: Vec<ClientId> = (1..=8).map(ClientId).collect();
        let pick = |seed| {
            let mut rng = DeterministicRng::new(seed);
            assign_teams(&clients, TeamPolicy::Random, &mut rng).map(|(a, _)| a)
        };
        assert_eq!(pick(77), pick(77));
    }

    #[test]
    fn test_adult_has_won_requires_children() {
        let mut state = world();
        assert!(!adult_has_won(&state));

        let adult = state.connect(ClientId(1)).unwrap();
        state.assign_team(adult, Team::Adult, 0);
        assert!(!adult_has_won(&state));

        let kid = state.connect(ClientId(2)).unwrap();
        state.assign_team(kid, Team::Child, 0);
        assert!(!adult_has_won(&state));
        state.set_caught(kid, true);
        assert!(adult_has_won(&state));
    }

    #[test]
    fn test_starts_when_expected_players_connect() {
        let mut state = world();
        for c in 1..=4 {
            state.connect(ClientId(c));
        }
        step(&mut state, 1);

        assert_eq!(state.phase(), RoundPhase::Preparation);
        assert_eq!(state.round.round, 1);
        assert_eq!(state.children().len(), 3);
        assert_eq!(state.player_of(ClientId(4)), state.adult());
    }

    #[test]
    fn test_waits_without_players() {
        let mut state = world();
        step(&mut state, 2000);
        assert_eq!(state.phase(), RoundPhase::WaitingForPlayers);

        // joins after the timeout start the session on the next tick
        state.connect(ClientId(1));
        step(&mut state, 1);
        assert_eq!(state.phase(), RoundPhase::Preparation);
    }

    #[test]
    fn test_full_phase_cycle() {
        let mut config = GameConfig::default();
        config.round.total_rounds = 2;
        let mut state = WorldState::new([7; 16], config);
        state.connect(ClientId(1));
        state.connect(ClientId(2));

        step(&mut state, 900);
        assert_eq!(state.phase(), RoundPhase::Preparation);

        step(&mut state, 1800);
        assert_eq!(state.phase(), RoundPhase::Game);

        step(&mut state, 9000);
        assert_eq!(state.phase(), RoundPhase::RoundEnd);
        assert!(!has_finished_early(&state));
        assert!(state.rewards.is_settled(1));

        step(&mut state, 150);
        assert_eq!(state.phase(), RoundPhase::Preparation);
        assert_eq!(state.round.round, 2);
        assert_eq!(state.store.read_int(&StateKey::Round), Some(2));

        step(&mut state, 1800 + 9000 + 150);
        assert_eq!(state.phase(), RoundPhase::GameEnd);
    }

    #[test]
    fn test_phase_remaining_published() {
        let mut state = world();
        state.connect(ClientId(1));
        step(&mut state, 30);
        assert_eq!(state.store.read_int(&StateKey::PhaseRemaining), Some(29));
        step(&mut state, 1);
        assert_eq!(state.store.read_int(&StateKey::PhaseRemaining), Some(29));
    }

    #[test]
    fn test_preparation_resets_round_state() {
        let mut state = world();
        for c in 1..=4 {
            state.connect(ClientId(c));
        }
        step(&mut state, 1);
        let kid = state.children()[0];

        state.set_caught(kid, true);
        state.set_candy(kid, 4);
        state.set_transform(kid, Transform::at(Vec3::new(99.0, 0.0, 99.0)));

        begin_preparation(&mut state, 2);
        assert!(!state.is_caught(kid));
        assert_eq!(state.candy(kid), 0);
        assert_ne!(state.transform(kid).map(|t| t.position), Some(Vec3::new(99.0, 0.0, 99.0)));
    }

    #[test]
    fn test_late_joiner_is_child() {
        let mut state = world();
        for c in 1..=4 {
            state.connect(ClientId(c));
        }
        step(&mut state, 1);

        let late = state.connect(ClientId(5)).unwrap();
        assert_eq!(state.team_of(late), Some(Team::Child));
    }

    #[test]
    fn test_adult_leaving_ends_game() {
        let mut state = world();
        for c in 1..=4 {
            state.connect(ClientId(c));
        }
        step(&mut state, 1);

        state.disconnect(ClientId(4));
        assert_eq!(state.phase(), RoundPhase::GameEnd);

        // idempotent
        end_game(&mut state, EndReason::Abandoned);
        let ended = state.take_events().into_iter()
            .filter(|e| matches!(e.data, crate::game::events::GameEventData::GameEnded { .. }))
            .count();
        assert_eq!(ended, 1);
    }
}
