//! Shop and Inventory
//!
//! The adult buys trap items during preparation and places them during
//! preparation or the chase. The inventory is a bounded, ordered list;
//! removing by index compacts it, and a stale index is simply a no-op.

use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::core::vec3::Transform;
use crate::game::events::GameEvent;
use crate::game::intent::IntentError;
use crate::game::state::{ItemId, NetworkId, RoundPhase, WorldState};
use crate::game::trap::{self, TrapKind};

/// Economy configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShopSettings {
    /// Coins the adult starts the session with.
    pub adult_starting_coins: i64,
    /// Inventory slots.
    pub inventory_capacity: usize,
}

impl Default for ShopSettings {
    fn default() -> Self {
        Self {
            adult_starting_coins: 100,
            inventory_capacity: 5,
        }
    }
}

/// One purchasable item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShopItem {
    /// Item id stored in inventories.
    pub id: ItemId,
    /// Display name.
    pub name: String,
    /// Price in coins.
    pub price: i64,
    /// Trap spawned when the item is placed.
    pub places: TrapKind,
}

/// The shop's item list, addressed by index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemCatalog {
    items: Vec<ShopItem>,
}

impl Default for ItemCatalog {
    fn default() -> Self {
        let item = |id: u16, name: &str, price: i64, places: TrapKind| ShopItem {
            id: ItemId(id),
            name: name.to_string(),
            price,
            places,
        };
        Self {
            items: vec![
                item(1, "Slow Trap", 30, TrapKind::Slow),
                item(2, "Paralysis Trap", 40, TrapKind::Stun),
                item(3, "Capture Trap", 60, TrapKind::Capture),
                item(4, "Sound Detector", 20, TrapKind::SoundAlert),
            ],
        }
    }
}

impl ItemCatalog {
    /// Catalog from an explicit item list.
    pub fn new(items: Vec<ShopItem>) -> Self {
        Self { items }
    }

    /// Item at a shop index.
    pub fn get(&self, index: usize) -> Option<&ShopItem> {
        self.items.get(index)
    }

    /// Item by id.
    pub fn by_id(&self, id: ItemId) -> Option<&ShopItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// All items.
    pub fn items(&self) -> &[ShopItem] {
        &self.items
    }
}

/// Bounded ordered item list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inventory {
    items: Vec<ItemId>,
    capacity: usize,
}

impl Inventory {
    /// Empty inventory.
    pub fn new(capacity: usize) -> Self {
        Self { items: Vec::new(), capacity }
    }

    /// Inventory holding `items` (truncated to capacity).
    pub fn from_items(mut items: Vec<ItemId>, capacity: usize) -> Self {
        items.truncate(capacity);
        Self { items, capacity }
    }

    /// Append an item. Returns false when full.
    pub fn add(&mut self, item: ItemId) -> bool {
        if self.is_full() {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Remove the item at `index`, shifting later items down.
    ///
    /// An out-of-range index returns `None` and leaves the list unchanged.
    pub fn remove_at(&mut self, index: usize) -> Option<ItemId> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    /// Item at `index`.
    pub fn get(&self, index: usize) -> Option<ItemId> {
        self.items.get(index).copied()
    }

    /// True when no slot is free.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Items in slot order.
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    /// Number of items held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Buy the item at `index` for the adult.
///
/// Coins are deducted before the item is added; if the add fails the coins
/// are refunded so the state is unchanged.
pub fn purchase(state: &mut WorldState, adult: NetworkId, index: usize) -> Result<ItemId, IntentError> {
    if state.phase() != RoundPhase::Preparation {
        return Err(IntentError::WrongPhase(state.phase()));
    }
    let item = state.config.catalog.get(index)
        .cloned()
        .ok_or(IntentError::UnknownItem(index))?;

    let coins = state.coins(adult);
    if coins < item.price {
        return Err(IntentError::InsufficientCoins { price: item.price, coins });
    }

    state.set_coins(adult, coins - item.price);

    let mut inventory = state.inventory(adult);
    if !inventory.add(item.id) {
        state.set_coins(adult, coins);
        warn!(entity = %adult, item = ?item.id, "inventory full, purchase refunded");
        return Err(IntentError::InventoryFull);
    }
    state.set_inventory(adult, &inventory);

    let coins_left = coins - item.price;
    state.push_event(GameEvent::item_purchased(state.tick, adult, item.id, coins_left));
    info!(entity = %adult, item = %item.name, coins_left, "item purchased");
    Ok(item.id)
}

/// Place the item in inventory slot `slot` as a trap at `transform`.
pub fn place_item(
    state: &mut WorldState,
    adult: NetworkId,
    slot: usize,
    transform: Transform,
) -> Result<NetworkId, IntentError> {
    if !matches!(state.phase(), RoundPhase::Preparation | RoundPhase::Game) {
        return Err(IntentError::WrongPhase(state.phase()));
    }
    if !transform.is_finite() {
        return Err(IntentError::InvalidTransform);
    }

    let mut inventory = state.inventory(adult);
    let item_id = inventory.get(slot).ok_or(IntentError::EmptySlot(slot))?;
    let kind = state.config.catalog.by_id(item_id)
        .map(|item| item.places)
        .ok_or(IntentError::UnknownItemId(item_id))?;

    inventory.remove_at(slot);
    state.set_inventory(adult, &inventory);

    let can_rearm = state.config.traps.placed_traps_rearm;
    Ok(trap::spawn_trap(state, kind, transform.position, can_rearm, Some(adult)))
}
