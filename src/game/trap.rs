//! Trap Mechanics
//!
//! Trap spawning, volume enter/exit, effect application and rearming.
//! A trap cycles Armed → Triggered → (optional) Rearming → Armed. Only
//! children trigger traps, and only an Armed trap reacts to one.

use std::collections::BTreeSet;
use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::vec3::{Transform, Vec3};
use crate::game::ability::{self, EffectKind};
use crate::game::collision::children_in_volume;
use crate::game::events::GameEvent;
use crate::game::registry::Entity;
use crate::game::scheduler::{TimerHandle, TimerTask};
use crate::game::state::{NetworkId, RoundPhase, Team, WorldState};
use crate::game::store::StateKey;

/// Trap kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    /// Halves the child's speed for a while.
    Slow,
    /// Paralyses the child for a while.
    Stun,
    /// Sends the child to the holding point.
    Capture,
    /// Alerts everyone where the child is.
    SoundAlert,
}

/// Trap activation state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TrapState {
    /// Waiting for a child.
    #[default]
    Armed = 0,
    /// Fired; ignores further entries.
    Triggered = 1,
    /// Counting down to Armed.
    Rearming = 2,
}

/// Configuration for trap mechanics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrapSettings {
    /// Radius of the trigger volume.
    pub trigger_radius: f32,
    /// Delay between the triggering child leaving and the trap re-arming.
    pub rearm_delay_secs: f32,
    /// Whether traps placed by the adult rearm.
    pub placed_traps_rearm: bool,
    /// Speed multiplier of the slow trap.
    pub slow_multiplier: f32,
    /// Slow duration.
    pub slow_secs: f32,
    /// Paralysis duration.
    pub stun_secs: f32,
    /// Sound alert traps fire once and never rearm.
    pub sound_play_once: bool,
}

impl Default for TrapSettings {
    fn default() -> Self {
        Self {
            trigger_radius: 1.5,
            rearm_delay_secs: 5.0,
            placed_traps_rearm: true,
            slow_multiplier: 0.5,
            slow_secs: 5.0,
            stun_secs: 3.0,
            sound_play_once: false,
        }
    }
}

/// A placed or pre-placed trap.
#[derive(Clone, Debug)]
pub struct TrapEntity {
    /// Trap kind.
    pub kind: TrapKind,
    /// Center of the trigger volume.
    pub position: Vec3,
    /// Trigger radius.
    pub trigger_radius: f32,
    /// Rearms once the triggering child leaves.
    pub can_rearm: bool,
    /// Never rearms after the first trigger.
    pub play_once: bool,
    /// Delay before re-arming.
    pub rearm_delay_ticks: u64,
    /// Activation state.
    pub state: TrapState,
    /// Adult that placed it (`None` for level traps).
    pub placed_by: Option<NetworkId>,
    /// Child that triggered it.
    pub triggered_by: Option<NetworkId>,
    /// Children currently inside the volume.
    pub occupants: BTreeSet<NetworkId>,
    /// Children held by a capture trap.
    pub captives: BTreeSet<NetworkId>,
    /// Pending rearm.
    pub rearm_timer: Option<TimerHandle>,
}

/// Spawn a trap. Adult-placed traps are owned by the adult's client.
pub fn spawn_trap(
    state: &mut WorldState,
    kind: TrapKind,
    position: Vec3,
    can_rearm: bool,
    placed_by: Option<NetworkId>,
) -> NetworkId {
    let settings = state.config.traps.clone();
    let trap = TrapEntity {
        kind,
        position,
        trigger_radius: settings.trigger_radius,
        can_rearm,
        play_once: kind == TrapKind::SoundAlert && settings.sound_play_once,
        rearm_delay_ticks: state.secs_to_ticks(settings.rearm_delay_secs),
        state: TrapState::Armed,
        placed_by,
        triggered_by: None,
        occupants: BTreeSet::new(),
        captives: BTreeSet::new(),
        rearm_timer: None,
    };

    let owner = placed_by.and_then(|adult| state.registry.owner_of(adult));
    let id = state.registry.spawn(Entity::Trap(trap), owner);
    state.store.write(StateKey::TrapState(id), TrapState::Armed);
    state.store.write(StateKey::Transform(id), Transform::at(position));
    state.push_event(GameEvent::trap_placed(state.tick, id, kind, placed_by, position));
    info!(trap = %id, ?kind, ?placed_by, "trap spawned");
    id
}

/// An entity entered a trap volume. Returns true if the trap fired.
pub fn on_enter(state: &mut WorldState, trap_id: NetworkId, entity: NetworkId) -> bool {
    let is_child = state.team_of(entity) == Some(Team::Child);
    let Some(trap) = state.registry.trap_mut(trap_id) else {
        return false;
    };
    trap.occupants.insert(entity);

    if !is_child || trap.state != TrapState::Armed {
        return false;
    }

    trap.state = TrapState::Triggered;
    trap.triggered_by = Some(entity);
    let kind = trap.kind;

    state.store.write(StateKey::TrapState(trap_id), TrapState::Triggered);
    state.push_event(GameEvent::trap_triggered(state.tick, trap_id, kind, entity));
    debug!(trap = %trap_id, child = %entity, ?kind, "trap triggered");

    apply_effect(state, trap_id, kind, entity);
    true
}

/// An entity left a trap volume. Starts rearming when the triggering child
/// leaves a rearmable trap.
pub fn on_exit(state: &mut WorldState, trap_id: NetworkId, entity: NetworkId) {
    let now = state.tick;
    let Some(trap) = state.registry.trap_mut(trap_id) else {
        return;
    };
    trap.occupants.remove(&entity);

    let rearms = trap.state == TrapState::Triggered
        && trap.triggered_by == Some(entity)
        && trap.can_rearm
        && !trap.play_once;
    if !rearms {
        return;
    }

    trap.state = TrapState::Rearming;
    let handle = state.scheduler.schedule_after(now, trap.rearm_delay_ticks, TimerTask::RearmTrap(trap_id));
    trap.rearm_timer = Some(handle);
    state.store.write(StateKey::TrapState(trap_id), TrapState::Rearming);
}

/// Timer continuation: Rearming → Armed.
pub fn rearm(state: &mut WorldState, trap_id: NetworkId, handle: TimerHandle) {
    let Some(trap) = state.registry.trap_mut(trap_id) else {
        return;
    };
    if trap.rearm_timer != Some(handle) || trap.state != TrapState::Rearming {
        return;
    }
    trap.rearm_timer = None;
    trap.triggered_by = None;
    trap.state = TrapState::Armed;

    state.store.write(StateKey::TrapState(trap_id), TrapState::Armed);
    state.push_event(GameEvent::trap_rearmed(state.tick, trap_id));
}

/// Trap action to apply after the volume scan.
enum TrapAction {
    Enter { trap: NetworkId, child: NetworkId },
    Exit { trap: NetworkId, child: NetworkId },
}

/// Derive enter/exit from child positions and apply them.
///
/// Traps only react during the game phase.
pub fn process_traps(state: &mut WorldState) {
    if state.phase() != RoundPhase::Game {
        return;
    }

    // Step 1: scan volumes
    let mut actions = Vec::new();
    for (trap_id, trap) in state.registry.traps() {
        let inside: BTreeSet<NetworkId> = children_in_volume(state, trap.position, trap.trigger_radius)
            .into_iter()
            .collect();

        for child in trap.occupants.difference(&inside) {
            actions.push(TrapAction::Exit { trap: trap_id, child: *child });
        }
        // caught children stay frozen and set nothing off
        for child in inside.difference(&trap.occupants).filter(|c| !state.is_caught(**c)) {
            actions.push(TrapAction::Enter { trap: trap_id, child: *child });
        }
    }

    // Step 2: apply, exits first so a child hopping between traps is handled in order
    actions.sort_by_key(|a| match a {
        TrapAction::Exit { .. } => 0,
        TrapAction::Enter { .. } => 1,
    });
    for action in actions {
        match action {
            TrapAction::Exit { trap, child } => on_exit(state, trap, child),
            TrapAction::Enter { trap, child } => {
                on_enter(state, trap, child);
            }
        }
    }
}

fn apply_effect(state: &mut WorldState, trap_id: NetworkId, kind: TrapKind, child: NetworkId) {
    let settings = state.config.traps.clone();
    match kind {
        TrapKind::Slow => {
            let ticks = state.secs_to_ticks(settings.slow_secs);
            ability::apply_speed_effect(state, child, EffectKind::Slow, settings.slow_multiplier, ticks);
        }
        TrapKind::Stun => {
            let ticks = state.secs_to_ticks(settings.stun_secs);
            ability::apply_movement_lock(state, child, ticks);
        }
        TrapKind::Capture => {
            let holding = state.config.layout.holding_point();
            if let Some(trap) = state.registry.trap_mut(trap_id) {
                if !trap.captives.insert(child) {
                    return;
                }
            }
            state.set_transform(child, holding);
            state.set_caught(child, true);
            state.push_event(GameEvent::child_caught(state.tick, child, None, Some(trap_id)));
            info!(trap = %trap_id, child = %child, "child captured");
        }
        TrapKind::SoundAlert => {
            let position = state.transform(child).map(|t| t.position).unwrap_or(Vec3::ZERO);
            state.push_event(GameEvent::sound_alert(state.tick, trap_id, child, position));
        }
    }
}

/// Release every captive of a capture trap to the release point.
pub fn release_captives(state: &mut WorldState, trap_id: NetworkId, rescuer: NetworkId) -> Vec<NetworkId> {
    let Some(trap) = state.registry.trap_mut(trap_id) else {
        return Vec::new();
    };
    let captives: Vec<NetworkId> = std::mem::take(&mut trap.captives).into_iter().collect();
    if captives.is_empty() {
        return captives;
    }

    let release = state.config.layout.release_point();
    for child in &captives {
        state.set_transform(*child, release);
        state.set_caught(*child, false);
    }
    state.push_event(GameEvent::children_released(state.tick, trap_id, rescuer, captives.clone()));
    info!(trap = %trap_id, rescuer = %rescuer, count = captives.len(), "captives released");
    captives
}

/// Return every trap to Armed for a new round and remove adult-placed ones.
pub fn reset_traps(state: &mut WorldState) {
    let ids: Vec<(NetworkId, bool)> = state.registry.traps()
        .map(|(id, t)| (id, t.placed_by.is_some()))
        .collect();

    for (id, placed) in ids {
        if placed {
            state.despawn(id);
            continue;
        }
        if let Some(trap) = state.registry.trap_mut(id) {
            if let Some(handle) = trap.rearm_timer.take() {
                state.scheduler.cancel(handle);
            }
            trap.state = TrapState::Armed;
            trap.triggered_by = None;
            trap.occupants.clear();
            trap.captives.clear();
        }
        state.store.write(StateKey::TrapState(id), TrapState::Armed);
    }
}

/// Drop a despawned entity from every trap. A triggering child that
/// disappears counts as leaving the volume.
pub fn forget_entity(state: &mut WorldState, id: NetworkId) {
    let touched: Vec<NetworkId> = state.registry.traps()
        .filter(|(_, t)| t.occupants.contains(&id) || t.captives.contains(&id))
        .map(|(trap_id, _)| trap_id)
        .collect();

    for trap_id in touched {
        on_exit(state, trap_id, id);
        if let Some(trap) = state.registry.trap_mut(trap_id) {
            trap.captives.remove(&id);
        }
    }
}

/// Current state of a trap.
pub fn trap_state(state: &WorldState, trap_id: NetworkId) -> Option<TrapState> {
    state.registry.trap(trap_id).map(|t| t.state)
}
