//! Proximity Queries
//!
//! Distance checks for trap volumes, interaction range and catches. Queries
//! iterate players in id order so ties always resolve the same way.

use crate::core::vec3::Vec3;
use crate::game::state::{NetworkId, WorldState};

/// Check if two points are within `radius` of each other.
#[inline]
pub fn within_radius(a: Vec3, b: Vec3, radius: f32) -> bool {
    a.distance_squared(b) <= radius * radius
}

/// Children whose position lies inside a spherical volume.
pub fn children_in_volume(state: &WorldState, center: Vec3, radius: f32) -> Vec<NetworkId> {
    state.children()
        .into_iter()
        .filter(|id| {
            state.transform(*id)
                .is_some_and(|t| within_radius(t.position, center, radius))
        })
        .collect()
}

/// Closest uncaught child within `radius` on the floor plane.
///
/// Equal distances resolve to the lower id.
pub fn nearest_uncaught_child(state: &WorldState, center: Vec3, radius: f32) -> Option<NetworkId> {
    let center = center.flatten();
    let mut best: Option<(NetworkId, f32)> = None;

    for id in state.children() {
        if state.is_caught(id) {
            continue;
        }
        let Some(transform) = state.transform(id) else {
            continue;
        };
        let d2 = transform.position.flatten().distance_squared(center);
        if d2 > radius * radius {
            continue;
        }
        match best {
            Some((_, best_d2)) if best_d2 <= d2 => {}
            _ => best = Some((id, d2)),
        }
    }

    best.map(|(id, _)| id)
}

/// True if the entity's transform is within `range` of `point`.
pub fn in_range(state: &WorldState, id: NetworkId, point: Vec3, range: f32) -> bool {
    state.transform(id)
        .is_some_and(|t| within_radius(t.position, point, range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::core::vec3::Transform;
    use crate::game::state::{ClientId, Team};

    fn world_with_children(positions: &[Vec3]) -> (WorldState, Vec<NetworkId>) {
        let mut state = WorldState::new([1; 16], GameConfig::default());
        let mut ids = Vec::new();
        for (i, pos) in positions.iter().enumerate() {
            let id = state.connect(ClientId(i as u64 + 1)).unwrap();
            state.assign_team(id, Team::Child, i);
            state.set_transform(id, Transform::at(*pos));
            ids.push(id);
        }
        (state, ids)
    }

    #[test]
    fn test_within_radius_inclusive() {
        assert!(within_radius(Vec3::ZERO, Vec3::new(1.5, 0.0, 0.0), 1.5));
        assert!(!within_radius(Vec3::ZERO, Vec3::new(1.6, 0.0, 0.0), 1.5));
    }

    #[test]
    fn test_children_in_volume() {
        let (state, ids) = world_with_children(&[Vec3::new(0.5, 0.0, 0.0), Vec3::new(9.0, 0.0, 0.0)]);
        assert_eq!(children_in_volume(&state, Vec3::ZERO, 1.0), vec![ids[0]]);
    }

    #[test]
    fn test_nearest_skips_caught() {
        let (mut state, ids) = world_with_children(&[Vec3::new(0.2, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)]);
        assert_eq!(nearest_uncaught_child(&state, Vec3::ZERO, 1.5), Some(ids[0]));

        state.set_caught(ids[0], true);
        assert_eq!(nearest_uncaught_child(&state, Vec3::ZERO, 1.5), Some(ids[1]));

        state.set_caught(ids[1], true);
        assert_eq!(nearest_uncaught_child(&state, Vec3::ZERO, 1.5), None);
    }

    #[test]
    fn test_nearest_ignores_height() {
        let (state, ids) = world_with_children(&[Vec3::new(1.0, 3.0, 0.0)]);
        assert_eq!(nearest_uncaught_child(&state, Vec3::ZERO, 1.5), Some(ids[0]));
    }
}
