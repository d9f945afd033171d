//! Message Dispatch
//!
//! The boundary between transport messages and game logic. Inbound messages
//! are checked for authority and ownership before they reach the world;
//! tick output is turned into addressed outbound messages.

use tracing::{debug, warn};

use crate::core::hash::short_hex;
use crate::game::events::GameEventData;
use crate::game::intent::{apply_intent, Intent, IntentError};
use crate::game::state::{ClientId, NetworkId, WorldState};
use crate::game::store::{StateKey, StateValue, WriteRequest};
use crate::game::tick::TickResult;
use crate::network::protocol::{ServerMessage, SyncFrame};

/// Dispatch errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Client has no player entity.
    #[error("{0} has not joined")]
    NotJoined(ClientId),

    /// Client does not own the target entity.
    #[error("{client} does not own {entity}")]
    NotOwner {
        /// Sender.
        client: ClientId,
        /// Entity written.
        entity: NetworkId,
    },

    /// Key is server-derived.
    #[error("{0:?} is not client-writable")]
    NotWritable(StateKey),

    /// Intent failed validation.
    #[error("intent rejected: {0}")]
    Intent(#[from] IntentError),
}

/// Who an outbound message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// Every connected client.
    All,
    /// One client.
    Client(ClientId),
}

/// An addressed server message.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Recipient.
    pub to: Recipient,
    /// Message.
    pub message: ServerMessage,
}

impl Outbound {
    /// Message for everyone.
    pub fn all(message: ServerMessage) -> Self {
        Self { to: Recipient::All, message }
    }

    /// Message for one client.
    pub fn client(client: ClientId, message: ServerMessage) -> Self {
        Self { to: Recipient::Client(client), message }
    }
}

/// Apply an intent from `client` to the player it owns.
pub fn handle_intent(state: &mut WorldState, client: ClientId, intent: Intent) -> Result<(), DispatchError> {
    let actor = state.player_of(client).ok_or(DispatchError::NotJoined(client))?;
    if let Err(e) = apply_intent(state, actor, intent) {
        debug!(%client, entity = %actor, error = %e, "intent rejected");
        return Err(e.into());
    }
    Ok(())
}

/// Apply a forwarded store write.
///
/// Only owner-writable keys are accepted, and only from the owner. A
/// transform write is validated exactly like a move intent.
pub fn handle_write(state: &mut WorldState, client: ClientId, request: WriteRequest) -> Result<(), DispatchError> {
    let key = request.key;
    if !key.is_owner_writable() {
        warn!(%client, ?key, "write to server-owned key");
        return Err(DispatchError::NotWritable(key));
    }
    let Some(entity) = key.entity() else {
        return Err(DispatchError::NotWritable(key));
    };
    if !state.registry.contains(entity) {
        debug!(%client, %entity, "write for missing entity ignored");
        return Ok(());
    }
    if !state.registry.is_owner(entity, client) {
        warn!(%client, %entity, "write to entity owned by another client");
        return Err(DispatchError::NotOwner { client, entity });
    }

    match (key, request.value) {
        (StateKey::Transform(_), StateValue::Transform(transform)) => {
            apply_intent(state, entity, Intent::Move { transform })?;
            Ok(())
        }
        _ => Err(DispatchError::NotWritable(key)),
    }
}

/// Full snapshot for a joining or resyncing client.
pub fn snapshot(state: &WorldState) -> ServerMessage {
    ServerMessage::Snapshot(SyncFrame {
        tick: state.tick,
        deltas: state.store.snapshot(),
        digest: Some(hex::encode(state.store.digest())),
    })
}

/// Turn one tick's output into addressed messages.
///
/// Deltas go to everyone as a single sync frame. Events go to everyone
/// unless they are private to one entity's owner. A session end adds a
/// final return-to-menu.
pub fn route_tick(state: &WorldState, result: TickResult) -> Vec<Outbound> {
    let mut out = Vec::with_capacity(result.events.len() + 2);

    if !result.deltas.is_empty() {
        let digest = state.store.digest();
        debug!(tick = state.tick, deltas = result.deltas.len(), digest = %short_hex(&digest), "sync");
        #[cfg(feature = "debug-tracing")]
        for delta in &result.deltas {
            tracing::trace!(tick = state.tick, key = ?delta.key, seq = delta.seq, removed = delta.value.is_none(), "sync delta");
        }
        out.push(Outbound::all(ServerMessage::Sync(SyncFrame {
            tick: state.tick,
            deltas: result.deltas,
            digest: Some(hex::encode(digest)),
        })));
    }

    let mut end_reason = None;
    for event in result.events {
        if let GameEventData::GameEnded { reason } = event.data {
            end_reason = Some(reason);
        }
        match event.private_to() {
            Some(entity) => match state.registry.owner_of(entity) {
                Some(client) => out.push(Outbound::client(client, ServerMessage::Event(event))),
                None => debug!(%entity, "private event for unowned entity dropped"),
            },
            None => out.push(Outbound::all(ServerMessage::Event(event))),
        }
    }

    if let (true, Some(reason)) = (result.game_ended, end_reason) {
        out.push(Outbound::all(ServerMessage::ReturnToMenu { reason }));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::core::vec3::{Transform, Vec3};
    use crate::game::state::{RoundPhase, Team};
    use crate::game::tick::tick;

    fn world() -> (WorldState, NetworkId, NetworkId) {
        let mut state = WorldState::new([2; 16], GameConfig::default());
        let adult = state.connect(ClientId(1)).unwrap();
        let child = state.connect(ClientId(2)).unwrap();
        state.assign_team(adult, Team::Adult, 0);
        state.assign_team(child, Team::Child, 0);
        state.round.phase = RoundPhase::Preparation;
        (state, adult, child)
    }

    #[test]
    fn test_unjoined_client_rejected() {
        let (mut state, _, _) = world();
        assert_eq!(
            handle_intent(&mut state, ClientId(99), Intent::UseAbility),
            Err(DispatchError::NotJoined(ClientId(99)))
        );
    }

    #[test]
    fn test_write_requires_ownership() {
        let (mut state, adult, _) = world();
        let request = WriteRequest {
            key: StateKey::Transform(adult),
            value: StateValue::Transform(Transform::ORIGIN),
        };
        assert_eq!(
            handle_write(&mut state, ClientId(2), request),
            Err(DispatchError::NotOwner { client: ClientId(2), entity: adult })
        );
    }

    #[test]
    fn test_write_to_derived_key_rejected() {
        let (mut state, _, child) = world();
        let request = WriteRequest { key: StateKey::Candy(child), value: StateValue::Int(99) };
        assert_eq!(
            handle_write(&mut state, ClientId(2), request),
            Err(DispatchError::NotWritable(StateKey::Candy(child)))
        );
        assert_eq!(state.candy(child), 0);
    }

    #[test]
    fn test_owner_transform_write_applies() {
        let (mut state, _, child) = world();
        state.tick = 30;
        let to = Transform::at(state.transform(child).unwrap().position.add(Vec3::new(1.0, 0.0, 0.0)));
        let request = WriteRequest { key: StateKey::Transform(child), value: StateValue::Transform(to) };
        handle_write(&mut state, ClientId(2), request).unwrap();
        assert_eq!(state.transform(child), Some(to));
    }

    #[test]
    fn test_purchase_event_is_private() {
        let (mut state, adult, _) = world();
        handle_intent(&mut state, ClientId(1), Intent::Purchase { item_index: 0 }).unwrap();

        let result = tick(&mut state);
        let out = route_tick(&state, result);

        let private: Vec<&Outbound> = out.iter()
            .filter(|o| matches!(&o.message, ServerMessage::Event(e) if e.private_to() == Some(adult)))
            .collect();
        assert_eq!(private.len(), 1);
        assert_eq!(private[0].to, Recipient::Client(ClientId(1)));
        assert!(out.iter().any(|o| matches!(o.message, ServerMessage::Sync(_)) && o.to == Recipient::All));
    }

    #[test]
    fn test_sync_frame_carries_writes_and_removals() {
        let (mut state, _, child) = world();
        state.store.take_outbox();
        state.set_candy(child, 2);
        state.store.remove(&StateKey::Coins(child));
        let deltas = state.store.take_outbox();

        let out = route_tick(&state, TickResult { events: Vec::new(), deltas, phase_changed: false, game_ended: false });
        assert_eq!(out.len(), 1);
        match &out[0].message {
            ServerMessage::Sync(frame) => {
                assert_eq!(frame.deltas.len(), 2);
                assert_eq!(frame.deltas[0].value, Some(StateValue::Int(2)));
                assert!(frame.deltas[1].value.is_none());
                assert_eq!(frame.digest, Some(hex::encode(state.store.digest())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_carries_digest() {
        let (state, _, _) = world();
        match snapshot(&state) {
            ServerMessage::Snapshot(frame) => {
                assert!(!frame.deltas.is_empty());
                assert_eq!(frame.digest, Some(hex::encode(state.store.digest())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
