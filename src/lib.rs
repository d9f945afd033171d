//! # Candy Chase Game Server
//!
//! Authoritative server for Candy Chase, a party game where one Adult hunts
//! the Children while they collect candy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CANDY CHASE SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - GameConfig (serde, env file)              │
//! │                                                              │
//! │  core/           - Primitives                                │
//! │  ├── vec3.rs     - World-space vectors and transforms        │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  └── hash.rs     - Replicated state digests                  │
//! │                                                              │
//! │  game/           - Authoritative simulation                  │
//! │  ├── store.rs    - Replicated key/value state                │
//! │  ├── registry.rs - Entity ids and ownership                  │
//! │  ├── scheduler.rs- Tick timers                               │
//! │  ├── round.rs    - Round phase machine                       │
//! │  ├── intent.rs   - Client intent validation                  │
//! │  ├── trap.rs     - Trap activation                           │
//! │  ├── candy.rs, inventory.rs, catch.rs, ability.rs            │
//! │  ├── reward.rs   - Round rewards                             │
//! │  └── tick.rs     - Fixed-step loop                           │
//! │                                                              │
//! │  network/        - Transport                                 │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── dispatch.rs - Ownership checks and routing              │
//! │  ├── peer.rs     - Client-side replica                       │
//! │  ├── session.rs  - Session management                        │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Replication
//!
//! The server is the only writer. Every change to replicated state gets a
//! sequence number; peers drop anything not newer than what they hold, so
//! replicas converge under ordered delivery. Game logic uses BTreeMap
//! everywhere, so a session replays identically from its seed.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::GameConfig;
pub use core::rng::DeterministicRng;
pub use core::vec3::{Transform, Vec3};
pub use game::state::{ClientId, NetworkId, Team, RoundPhase, WorldState};
pub use game::store::ReplicatedStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation tick rate (Hz)
pub const TICK_RATE: u32 = 30;
