//! Game Configuration
//!
//! Every tunable of a session in one serde tree. Each section lives next to
//! the system it configures and defaults to the stock game; a JSON file only
//! needs the fields it overrides.

use std::path::Path;

use serde::{Serialize, Deserialize};
use tracing::{error, info};

use crate::game::ability::AbilitySettings;
use crate::game::candy::CandySettings;
use crate::game::catch::DashSettings;
use crate::game::intent::MovementSettings;
use crate::game::inventory::{ItemCatalog, ShopSettings};
use crate::game::map::LevelLayout;
use crate::game::reward::RewardParams;
use crate::game::round::RoundSettings;
use crate::game::trap::TrapSettings;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "CANDY_CONFIG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for `GameConfig`.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values are out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Session configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Simulation rate in Hz.
    pub tick_rate: u32,
    /// Salt mixed into the session RNG seed.
    pub seed: u64,
    /// Max distance for interactions (candy, doors, capture release).
    pub interaction_distance: f32,
    /// Round flow.
    pub round: RoundSettings,
    /// Trap behavior.
    pub traps: TrapSettings,
    /// Candy spawners.
    pub candy: CandySettings,
    /// Adult dash.
    pub dash: DashSettings,
    /// Child ability.
    pub ability: AbilitySettings,
    /// Movement validation.
    pub movement: MovementSettings,
    /// Round rewards.
    pub rewards: RewardParams,
    /// Economy.
    pub shop: ShopSettings,
    /// Shop items.
    pub catalog: ItemCatalog,
    /// Level content.
    pub layout: LevelLayout,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: crate::TICK_RATE,
            seed: 0,
            interaction_distance: 3.0,
            round: RoundSettings::default(),
            traps: TrapSettings::default(),
            candy: CandySettings::default(),
            dash: DashSettings::default(),
            ability: AbilitySettings::default(),
            movement: MovementSettings::default(),
            rewards: RewardParams::default(),
            shop: ShopSettings::default(),
            catalog: ItemCatalog::default(),
            layout: LevelLayout::default(),
        }
    }
}

impl GameConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Parse and validate JSON.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: GameConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Config from the file named by `CANDY_CONFIG`, or the defaults.
    ///
    /// An unreadable or invalid file is logged and the defaults are used.
    pub fn from_env() -> Self {
        let Ok(path) = std::env::var(CONFIG_ENV) else {
            return Self::default();
        };
        match Self::load(&path) {
            Ok(config) => {
                info!(%path, "loaded game config");
                config
            }
            Err(e) => {
                error!(%path, error = %e, "bad game config, using defaults");
                Self::default()
            }
        }
    }

    /// Reject values the simulation cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be positive".into()));
        }
        if self.round.total_rounds == 0 {
            return Err(ConfigError::Invalid("total_rounds must be positive".into()));
        }
        if self.round.min_players > self.round.expected_players {
            return Err(ConfigError::Invalid(format!(
                "min_players {} exceeds expected_players {}",
                self.round.min_players, self.round.expected_players
            )));
        }
        if self.shop.inventory_capacity == 0 {
            return Err(ConfigError::Invalid("inventory_capacity must be positive".into()));
        }
        if self.layout.child_spawns.is_empty() {
            return Err(ConfigError::Invalid("layout needs at least one child spawn".into()));
        }
        let durations = [
            self.round.wait_timeout_secs,
            self.round.preparation_secs,
            self.round.round_secs,
            self.round.inter_round_secs,
            self.traps.rearm_delay_secs,
            self.candy.respawn_secs,
            self.dash.duration_secs,
        ];
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(ConfigError::Invalid("durations must be finite and non-negative".into()));
        }
        Ok(())
    }

    /// Convert seconds to whole ticks at this config's rate.
    pub fn secs_to_ticks(&self, secs: f32) -> u64 {
        (secs.max(0.0) * self.tick_rate as f32).round() as u64
    }
}
