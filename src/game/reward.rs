//! Round Rewards
//!
//! Pure reward computation plus a ledger that applies each round's rewards
//! exactly once. Constants are configurable.

use std::collections::BTreeSet;
use serde::{Serialize, Deserialize};
use tracing::info;

use crate::game::events::GameEvent;
use crate::game::state::{NetworkId, WorldState};

/// Reward constants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardParams {
    /// Adult coins per configured round.
    pub adult_per_round: i64,
    /// Adult penalty per candy held by children.
    pub candy_penalty: i64,
    /// Adult bonus per caught child.
    pub catch_bonus: i64,
    /// Adult bonus for catching everyone before the clock ran out.
    pub early_finish_bonus: i64,
    /// Child coins per configured round.
    pub child_per_round: i64,
    /// Child coins per candy held.
    pub child_per_candy: i64,
}

impl Default for RewardParams {
    fn default() -> Self {
        Self {
            adult_per_round: 100,
            candy_penalty: 10,
            catch_bonus: 50,
            early_finish_bonus: 100,
            child_per_round: 50,
            child_per_candy: 20,
        }
    }
}

/// A child's state at round end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildOutcome {
    /// Child entity.
    pub id: NetworkId,
    /// Candy carried.
    pub candy: i64,
    /// Caught at round end.
    pub caught: bool,
}

/// Inputs to reward computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Rounds the session is configured to play.
    pub rounds_configured: i64,
    /// The adult caught everyone early.
    pub finished_early: bool,
    /// Children in id order.
    pub children: Vec<ChildOutcome>,
}

/// Computed coin deltas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundRewards {
    /// Adult delta (may be negative).
    pub adult: i64,
    /// Per-child deltas in input order.
    pub children: Vec<(NetworkId, i64)>,
}

/// Compute reward deltas. Pure and deterministic.
pub fn compute_rewards(outcome: &RoundOutcome, params: &RewardParams) -> RoundRewards {
    let total_candy: i64 = outcome.children.iter().map(|c| c.candy).sum();
    let total_caught = outcome.children.iter().filter(|c| c.caught).count() as i64;

    let mut adult = outcome.rounds_configured * params.adult_per_round
        - total_candy * params.candy_penalty
        + total_caught * params.catch_bonus;
    if outcome.finished_early {
        adult += params.early_finish_bonus;
    }

    let children = outcome.children.iter()
        .map(|c| {
            let mut delta = outcome.rounds_configured * params.child_per_round + c.candy * params.child_per_candy;
            if outcome.finished_early {
                delta /= 2;
            }
            (c.id, delta)
        })
        .collect();

    RoundRewards { adult, children }
}

/// Rounds whose rewards have been applied.
#[derive(Clone, Debug, Default)]
pub struct RewardLedger {
    settled: BTreeSet<u32>,
}

impl RewardLedger {
    /// True if the round was already rewarded.
    pub fn is_settled(&self, round: u32) -> bool {
        self.settled.contains(&round)
    }

    fn mark(&mut self, round: u32) -> bool {
        self.settled.insert(round)
    }
}

/// Gather the current round's outcome from the world.
pub fn collect_outcome(state: &WorldState) -> RoundOutcome {
    RoundOutcome {
        rounds_configured: state.config.round.total_rounds as i64,
        finished_early: state.round.finished_early,
        children: state.children()
            .into_iter()
            .map(|id| ChildOutcome {
                id,
                candy: state.candy(id),
                caught: state.is_caught(id),
            })
            .collect(),
    }
}

/// Apply the current round's rewards once. Returns `None` if already settled.
pub fn settle_round(state: &mut WorldState) -> Option<RoundRewards> {
    let round = state.round.round;
    if !state.rewards.mark(round) {
        return None;
    }

    let outcome = collect_outcome(state);
    let rewards = compute_rewards(&outcome, &state.config.rewards);

    let adult = state.adult();
    if let Some(adult) = adult {
        state.add_coins(adult, rewards.adult);
    }
    for (child, delta) in &rewards.children {
        state.add_coins(*child, *delta);
    }

    state.push_event(GameEvent::round_rewarded(
        state.tick,
        round,
        outcome.finished_early,
        adult.map(|a| (a, rewards.adult)),
        rewards.children.clone(),
    ));
    info!(round, adult_delta = rewards.adult, children = rewards.children.len(), "round rewards applied");
    Some(rewards)
}
