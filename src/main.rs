//! Candy Chase Server
//!
//! Authoritative game server for Candy Chase.
//! `candy-chase-server demo` runs an offline scripted session instead.

use anyhow::Context;
use tracing::{debug, info, warn};

use candy_chase::{
    TICK_RATE, VERSION,
    config::GameConfig,
    core::vec3::{Transform, Vec3},
    game::{
        events::GameEventData,
        intent::{apply_intent, Intent},
        state::{ClientId, NetworkId, RoundPhase, WorldState},
        tick::tick,
    },
    network::{AuthConfig, GameServer, ServerConfig},
};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env locally; safe to ignore when not present.
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Candy Chase Server v{}", VERSION);

    let game = GameConfig::from_env();
    game.validate().context("invalid game config")?;

    if std::env::args().nth(1).as_deref() == Some("demo") {
        demo_session(game);
        return Ok(());
    }

    let config = ServerConfig::from_env();
    info!("Tick Rate: {} Hz (default {})", config.tick_rate, TICK_RATE);
    let server = std::sync::Arc::new(GameServer::new(config, game, AuthConfig::from_env()));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await.context("server failed")?;
    info!("Server stopped");
    Ok(())
}

/// Offline session with four scripted clients, run twice to check that the
/// same seed and script give the same final state.
fn demo_session(mut config: GameConfig) {
    info!("=== Starting Demo Session ===");
    config.round.preparation_secs = config.round.preparation_secs.min(5.0);
    config.round.round_secs = config.round.round_secs.min(60.0);
    config.round.total_rounds = config.round.total_rounds.min(2);

    let session_id = [1u8; 16];
    info!("Session ID: {}", hex::encode(session_id));

    let (digest, ticks) = run_demo(session_id, config.clone(), true);
    info!("Final digest: {} after {} ticks", hex::encode(digest), ticks);

    let (replay, _) = run_demo(session_id, config, false);
    if digest == replay {
        info!("Replay digest matches");
    } else {
        warn!("Replay digest differs: {}", hex::encode(replay));
    }
}

fn run_demo(session_id: [u8; 16], config: GameConfig, log: bool) -> ([u8; 32], u64) {
    let limit = config.secs_to_ticks(1800.0);
    let mut state = WorldState::new(session_id, config);
    for c in 1..=4 {
        state.connect(ClientId(c));
    }

    while state.phase() != RoundPhase::GameEnd && state.tick < limit {
        if state.tick % 15 == 0 {
            script_step(&mut state);
        }
        let result = tick(&mut state);
        if !log {
            continue;
        }
        for event in &result.events {
            match &event.data {
                GameEventData::PhaseChanged { round, to, .. } => info!("Round {}: {:?}", round, to),
                GameEventData::ChildCaught { child, .. } => info!("Child {} caught", child),
                GameEventData::CandyCollected { child, total, .. } => info!("Child {} has {} candy", child, total),
                GameEventData::RoundRewarded { adult, children, .. } => {
                    info!("Rewards: adult {:?}, children {:?}", adult, children)
                }
                GameEventData::GameEnded { reason } => info!("Game ended: {:?}", reason),
                _ => {}
            }
        }
    }
    (state.store.digest(), state.tick)
}

/// Children walk to the nearest candy; the adult buys a trap, then chases.
fn script_step(state: &mut WorldState) {
    let candies: Vec<(NetworkId, Vec3)> = state.registry.candies().map(|(id, c)| (id, c.position)).collect();

    for child in state.children() {
        let Some(here) = state.transform(child).map(|t| t.position) else { continue };
        let nearest = candies.iter()
            .min_by(|a, b| here.distance_squared(a.1).total_cmp(&here.distance_squared(b.1)));
        if let Some((candy, target)) = nearest {
            step_towards(state, child, here, *target);
            scripted(state, child, Intent::Interact { target: *candy });
        }
    }

    let Some(adult) = state.adult() else { return };
    let Some(here) = state.transform(adult).map(|t| t.position) else { return };
    match state.phase() {
        RoundPhase::Preparation => {
            if scripted(state, adult, Intent::Purchase { item_index: 0 }) {
                scripted(state, adult, Intent::PlaceItem { slot: 0, transform: Transform::at(here) });
            }
        }
        RoundPhase::Game => {
            let prey = state.children().into_iter()
                .filter(|c| !state.is_caught(*c))
                .filter_map(|c| state.transform(c).map(|t| t.position))
                .min_by(|a, b| here.distance_squared(*a).total_cmp(&here.distance_squared(*b)));
            if let Some(target) = prey {
                if !scripted(state, adult, Intent::Dash { direction: target.sub(here) }) {
                    step_towards(state, adult, here, target);
                }
            }
        }
        _ => {}
    }
}

fn step_towards(state: &mut WorldState, id: NetworkId, from: Vec3, to: Vec3) {
    let offset = to.sub(from).flatten();
    let step = offset.length().min(2.0);
    if step <= f32::EPSILON {
        return;
    }
    let next = from.add(offset.normalize().scale(step));
    scripted(state, id, Intent::Move { transform: Transform::at(next) });
}

/// Apply a scripted intent, logging why it was refused.
fn scripted(state: &mut WorldState, id: NetworkId, intent: Intent) -> bool {
    match apply_intent(state, id, intent) {
        Ok(()) => true,
        Err(e) => {
            debug!(tick = state.tick, entity = %id, error = %e, "scripted intent rejected");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reports_rejection() {
        let mut state = WorldState::new([3; 16], GameConfig::default());
        let id = state.connect(ClientId(1)).unwrap();
        let coins = state.coins(id);
        let digest = state.store.digest();

        assert!(!scripted(&mut state, id, Intent::Purchase { item_index: 0 }));
        assert_eq!(state.coins(id), coins);
        assert_eq!(state.store.digest(), digest);
    }

    #[test]
    fn test_demo_replays_identically() {
        let mut config = GameConfig::default();
        config.round.preparation_secs = 1.0;
        config.round.round_secs = 5.0;
        config.round.total_rounds = 1;

        let (a, ticks) = run_demo([1; 16], config.clone(), false);
        let (b, _) = run_demo([1; 16], config, false);
        assert_eq!(a, b);
        assert!(ticks > 0);
    }
}
