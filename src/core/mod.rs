//! Core primitives.
//!
//! World-space math, the seeded session RNG and state digests.
//! Nothing in here knows about players, traps or rounds.

pub mod vec3;
pub mod rng;
pub mod hash;

// Re-export core types
pub use vec3::{Vec3, Transform};
pub use rng::DeterministicRng;
pub use hash::{StateHash, StateHasher};
