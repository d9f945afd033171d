//! Game Logic Module
//!
//! The authoritative simulation. Nothing in here touches the network or the
//! wall clock; time advances only through `tick`.
//!
//! ## Module Structure
//!
//! - `store`: Replicated key/value state with per-key sequence numbers
//! - `registry`: Networked entity ids and ownership
//! - `scheduler`: Tick-based timers
//! - `state`: World state and player helpers
//! - `round`: Round phase machine and team assignment
//! - `intent`: Client intents and their validation
//! - `trap`, `candy`, `inventory`, `catch`, `ability`: Gameplay systems
//! - `reward`: End-of-round coin rewards
//! - `tick`: Fixed-step simulation loop
//! - `events`: Game events for clients and logs

pub mod store;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod map;
pub mod collision;
pub mod round;
pub mod intent;
pub mod trap;
pub mod candy;
pub mod inventory;
pub mod catch;
pub mod ability;
pub mod reward;
pub mod tick;
pub mod events;

// Re-export key types
pub use events::{GameEvent, GameEventData};
pub use intent::{Intent, IntentError};
pub use registry::{Entity, EntityKind, EntityRegistry};
pub use state::{ClientId, NetworkId, ItemId, Team, RoundPhase, WorldState};
pub use store::{ReplicatedStore, StateDelta, StateKey, StateValue};
pub use tick::TickResult;
