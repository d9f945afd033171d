//! Level Layout
//!
//! Static level content: spawn points, candy spawners, pre-placed traps,
//! the capture holding and release points, and doors. Loaded from config or
//! the built-in default.

use serde::{Serialize, Deserialize};
use tracing::error;

use crate::core::vec3::{Transform, Vec3};
use crate::game::registry::Entity;
use crate::game::state::{DoorEntity, Team, WorldState};
use crate::game::store::StateKey;
use crate::game::trap::{self, TrapKind};
use crate::game::candy;

/// A trap that exists from the start of the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrapPlacement {
    /// Trap kind.
    pub kind: TrapKind,
    /// World position.
    pub position: Vec3,
    /// Whether the trap rearms after the triggering child leaves.
    #[serde(default = "default_true")]
    pub can_rearm: bool,
}

fn default_true() -> bool {
    true
}

/// Static level content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelLayout {
    /// Adult spawn point.
    pub adult_spawn: Option<Transform>,
    /// Child spawn points, used cyclically.
    pub child_spawns: Vec<Transform>,
    /// Shuffle the child spawn order at team assignment.
    pub shuffle_spawns: bool,
    /// Candy spawner positions.
    pub candy_spawners: Vec<Vec3>,
    /// Traps present from the start.
    pub traps: Vec<TrapPlacement>,
    /// Where captured children are held.
    pub holding_point: Option<Transform>,
    /// Where released children reappear.
    pub release_point: Option<Transform>,
    /// Door positions.
    pub doors: Vec<Vec3>,
}

impl Default for LevelLayout {
    fn default() -> Self {
        Self {
            adult_spawn: Some(Transform::new(Vec3::new(0.0, 0.0, -20.0), 0.0)),
            child_spawns: vec![
                Transform::new(Vec3::new(-15.0, 0.0, 15.0), 180.0),
                Transform::new(Vec3::new(-5.0, 0.0, 18.0), 180.0),
                Transform::new(Vec3::new(5.0, 0.0, 18.0), 180.0),
                Transform::new(Vec3::new(15.0, 0.0, 15.0), 180.0),
            ],
            shuffle_spawns: true,
            candy_spawners: vec![
                Vec3::new(-20.0, 0.0, 0.0),
                Vec3::new(20.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 8.0),
                Vec3::new(-10.0, 0.0, -10.0),
                Vec3::new(10.0, 0.0, -10.0),
            ],
            traps: Vec::new(),
            holding_point: Some(Transform::at(Vec3::new(0.0, 0.0, -40.0))),
            release_point: Some(Transform::at(Vec3::new(0.0, 0.0, -34.0))),
            doors: vec![Vec3::new(0.0, 0.0, -30.0)],
        }
    }
}

impl LevelLayout {
    /// Spawn point for a team slot.
    ///
    /// Child slots wrap around the configured points. A missing point logs an
    /// error and falls back to the origin.
    pub fn spawn_point(&self, team: Team, slot: usize) -> Transform {
        let point = match team {
            Team::Adult => self.adult_spawn,
            Team::Child if self.child_spawns.is_empty() => None,
            Team::Child => Some(self.child_spawns[slot % self.child_spawns.len()]),
        };
        point.unwrap_or_else(|| {
            error!(?team, slot, "no spawn point configured, using origin");
            Transform::ORIGIN
        })
    }

    /// Capture holding point (origin with an error if unset).
    pub fn holding_point(&self) -> Transform {
        self.holding_point.unwrap_or_else(|| {
            error!("no holding point configured, using origin");
            Transform::ORIGIN
        })
    }

    /// Capture release point (origin with an error if unset).
    pub fn release_point(&self) -> Transform {
        self.release_point.unwrap_or_else(|| {
            error!("no release point configured, using origin");
            Transform::ORIGIN
        })
    }
}

/// Create spawners, doors and pre-placed traps for a new session.
pub fn populate(state: &mut WorldState) {
    let layout = state.config.layout.clone();

    candy::spawn_spawners(state, &layout.candy_spawners);

    for position in &layout.doors {
        let id = state.registry.spawn(Entity::Door(DoorEntity { position: *position }), None);
        state.store.write(StateKey::DoorOpen(id), false);
    }

    for placement in &layout.traps {
        trap::spawn_trap(state, placement.kind, placement.position, placement.can_rearm, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::registry::EntityKind;

    #[test]
    fn test_child_spawns_wrap() {
        let layout = LevelLayout::default();
        assert_eq!(layout.spawn_point(Team::Child, 0), layout.spawn_point(Team::Child, 4));
        assert_ne!(layout.spawn_point(Team::Child, 0), layout.spawn_point(Team::Child, 1));
    }

    #[test]
    fn test_missing_points_fall_back_to_origin() {
        let layout = LevelLayout {
            adult_spawn: None,
            child_spawns: Vec::new(),
            holding_point: None,
            ..LevelLayout::default()
        };
        assert_eq!(layout.spawn_point(Team::Adult, 0), Transform::ORIGIN);
        assert_eq!(layout.spawn_point(Team::Child, 3), Transform::ORIGIN);
        assert_eq!(layout.holding_point(), Transform::ORIGIN);
    }

    #[test]
    fn test_populate_default_layout() {
        let state = WorldState::new([0; 16], GameConfig::default());
        assert_eq!(state.registry.count(EntityKind::Spawner), 5);
        assert_eq!(state.registry.count(EntityKind::Door), 1);
        assert_eq!(state.registry.count(EntityKind::Trap), 0);
    }

    #[test]
    fn test_layout_deserializes_with_defaults() {
        let json = r#"{ "traps": [ { "kind": "stun", "position": { "x": 1.0, "y": 0.0, "z": 2.0 } } ] }"#;
        let layout: LevelLayout = serde_json::from_str(json).unwrap();
        assert_eq!(layout.traps.len(), 1);
        assert!(layout.traps[0].can_rearm);
        assert_eq!(layout.candy_spawners.len(), 5);
    }
}
