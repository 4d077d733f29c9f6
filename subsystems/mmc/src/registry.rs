//! # Card Registry
//!
//! Cards currently known on one bus, keyed by relative card address.
//!
//! Only the bus manager creates, updates or removes entries; consumers
//! read through [`CardHandle`]s, which carry the generation of the entry
//! they were issued for and go stale when that entry is replaced.

use crate::card::{Card, CardHandle};
use crate::timing::TimingCaps;
use crate::{MmcError, MmcResult};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::RwLock;

/// Registered card entry
#[derive(Debug)]
struct Slot {
    card: Card,
    generation: u32,
}

/// Card registry
#[derive(Debug)]
pub struct CardRegistry {
    /// Cards by RCA
    cards: RwLock<BTreeMap<u16, Slot>>,
    /// Next generation to hand out
    next_generation: AtomicU32,
}

impl CardRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            cards: RwLock::new(BTreeMap::new()),
            next_generation: AtomicU32::new(1),
        }
    }

    /// Number of live cards
    pub fn len(&self) -> usize {
        self.cards.read().len()
    }

    /// Whether no card is registered
    pub fn is_empty(&self) -> bool {
        self.cards.read().is_empty()
    }

    /// Handles for every card, in RCA order
    pub fn handles(&self) -> Vec<CardHandle> {
        self.cards
            .read()
            .iter()
            .map(|(&rca, slot)| CardHandle::new(rca, slot.generation))
            .collect()
    }

    /// RCAs of every card, in order
    pub fn rcas(&self) -> Vec<u16> {
        self.cards.read().keys().copied().collect()
    }

    /// Run `f` on the card behind `handle`
    pub fn with_card<R>(&self, handle: CardHandle, f: impl FnOnce(&Card) -> R) -> MmcResult<R> {
        let cards = self.cards.read();
        let slot = cards.get(&handle.rca()).ok_or(MmcError::CardNotFound)?;
        if slot.generation != handle.generation() {
            return Err(MmcError::StaleHandle);
        }
        Ok(f(&slot.card))
    }

    /// Run `f` on the card at `rca`
    pub fn with_rca<R>(&self, rca: u16, f: impl FnOnce(&Card) -> R) -> Option<R> {
        self.cards.read().get(&rca).map(|slot| f(&slot.card))
    }

    /// Current handle for `rca`
    pub fn handle(&self, rca: u16) -> Option<CardHandle> {
        self.cards.read().get(&rca).map(|slot| CardHandle::new(rca, slot.generation))
    }

    /// RCA of the card whose raw CID matches
    pub(crate) fn find_by_cid(&self, raw_cid: &[u32; 4]) -> Option<u16> {
        self.cards
            .read()
            .iter()
            .find(|(_, slot)| slot.card.raw_cid() == raw_cid)
            .map(|(&rca, _)| rca)
    }

    /// Timing capabilities of every card
    pub(crate) fn timing_caps(&self) -> Vec<TimingCaps> {
        self.cards.read().values().map(|slot| *slot.card.timing_caps()).collect()
    }

    fn evict_collision(cards: &mut BTreeMap<u16, Slot>, rca: u16, raw_cid: &[u32; 4]) {
        if let Some(stale) = cards.get(&rca) {
            if stale.card.raw_cid() != raw_cid {
                log::debug!("mmc: relative address {} reassigned, dropping stale card", rca);
                cards.remove(&rca);
            }
        }
    }

    /// Register a newly discovered card
    pub(crate) fn insert(&self, card: Card) -> CardHandle {
        let rca = card.rca();
        debug_assert_ne!(rca, 0, "RCA 0 is reserved");
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut cards = self.cards.write();
        Self::evict_collision(&mut cards, rca, card.raw_cid());
        cards.insert(rca, Slot { card, generation });
        CardHandle::new(rca, generation)
    }

    /// Fold a rediscovered card into the entry at `old_rca`
    pub(crate) fn refresh(&self, old_rca: u16, fresh: &Card) -> Option<CardHandle> {
        let mut cards = self.cards.write();
        let mut slot = cards.remove(&old_rca)?;
        slot.card.adopt(fresh);

        let rca = slot.card.rca();
        Self::evict_collision(&mut cards, rca, slot.card.raw_cid());
        let handle = CardHandle::new(rca, slot.generation);
        cards.insert(rca, slot);
        Some(handle)
    }

    /// Drop the card at `rca`
    pub(crate) fn remove(&self, rca: u16) -> Option<Card> {
        self.cards.write().remove(&rca).map(|slot| slot.card)
    }

    /// Drop every card, returning how many there were
    pub(crate) fn clear(&self) -> usize {
        let mut cards = self.cards.write();
        let count = cards.len();
        cards.clear();
        count
    }
}

impl Default for CardRegistry {
    fn default() -> Self {
        Self::new()
    }
}
