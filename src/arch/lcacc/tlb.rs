use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Simulated cycle counter.
pub type Tick = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlbError {
  #[error("tlb needs at least one entry")]
  NoEntries,
  #[error("{entries} entries cannot be split across {sets} sets")]
  BadGeometry { entries: usize, sets: usize },
  #[error("page size {0} is not a power of two")]
  BadPageSize(u64),
}

/// One slot of the set-associative pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlbEntry {
  pub vp_base: u64,
  pub pp_base: u64,
  pub occupied: bool,
  pub mru_tick: Tick,
}

/// Storage behind the DMA controller's translation cache.
///
/// Addresses handed to these methods are already page aligned.
pub trait TlbMemory {
  /// Returns the physical page for `vp_base`; with `set_mru` a hit also
  /// refreshes the recency stamp to `now`.
  fn lookup(&mut self, vp_base: u64, now: Tick, set_mru: bool) -> Option<u64>;
  fn insert(&mut self, vp_base: u64, pp_base: u64, now: Tick);
  fn flush_all(&mut self);
  fn occupied(&self) -> usize;
}

/// Fixed pool of `sets * ways` entries with per-set LRU replacement.
#[derive(Debug, Clone)]
pub struct SetAssocTlb {
  sets: usize,
  ways: usize,
  page_shift: u32,
  entries: Vec<TlbEntry>,
}

impl SetAssocTlb {
  pub fn new(sets: usize, ways: usize, page_size: u64) -> Result<Self, TlbError> {
    if sets == 0 || ways == 0 {
      return Err(TlbError::NoEntries);
    }
    if !page_size.is_power_of_two() {
      return Err(TlbError::BadPageSize(page_size));
    }
    Ok(Self {
      sets,
      ways,
      page_shift: page_size.trailing_zeros(),
      entries: vec![TlbEntry::default(); sets * ways],
    })
  }

  /// Builds the cache from a total entry count and a set count. Zero sets
  /// means one set per entry (direct-mapped); the ways are whatever is left.
  pub fn with_capacity(entries: usize, associativity: usize, page_size: u64) -> Result<Self, TlbError> {
    if entries == 0 {
      return Err(TlbError::NoEntries);
    }
    let sets = if associativity == 0 { entries } else { associativity };
    if entries % sets != 0 {
      return Err(TlbError::BadGeometry { entries, sets });
    }
    Self::new(sets, entries / sets, page_size)
  }

  pub fn sets(&self) -> usize {
    self.sets
  }

  pub fn ways(&self) -> usize {
    self.ways
  }

  pub fn set_index(&self, vp_base: u64) -> usize {
    ((vp_base >> self.page_shift) % self.sets as u64) as usize
  }

  pub fn set_entries(&self, set: usize) -> &[TlbEntry] {
    &self.entries[set * self.ways..(set + 1) * self.ways]
  }

  fn set_entries_mut(&mut self, set: usize) -> &mut [TlbEntry] {
    let ways = self.ways;
    &mut self.entries[set * ways..(set + 1) * ways]
  }
}

impl TlbMemory for SetAssocTlb {
  fn lookup(&mut self, vp_base: u64, now: Tick, set_mru: bool) -> Option<u64> {
    let set = self.set_index(vp_base);
    let entry = self
      .set_entries_mut(set)
      .iter_mut()
      .find(|e| e.occupied && e.vp_base == vp_base)?;
    if set_mru {
      entry.mru_tick = now;
    }
    Some(entry.pp_base)
  }

  fn insert(&mut self, vp_base: u64, pp_base: u64, now: Tick) {
    let set = self.set_index(vp_base);
    let slots = self.set_entries_mut(set);

    let victim = slots
      .iter()
      .position(|e| e.occupied && e.vp_base == vp_base)
      .or_else(|| slots.iter().position(|e| !e.occupied))
      .unwrap_or_else(|| {
        // min_by_key keeps the first minimum, so ties go to the lowest way
        slots
          .iter()
          .enumerate()
          .min_by_key(|(_, e)| e.mru_tick)
          .map(|(way, _)| way)
          .unwrap_or(0)
      });

    let slot = &mut slots[victim];
    if slot.occupied && slot.vp_base != vp_base {
      log::debug!(
        "tlb evict set={} way={} vp={:#x} (mru={})",
        set,
        victim,
        slot.vp_base,
        slot.mru_tick
      );
    }
    *slot = TlbEntry {
      vp_base,
      pp_base,
      occupied: true,
      mru_tick: now,
    };
  }

  fn flush_all(&mut self) {
    for entry in self.entries.iter_mut() {
      entry.occupied = false;
      entry.mru_tick = 0;
    }
  }

  fn occupied(&self) -> usize {
    self.entries.iter().filter(|e| e.occupied).count()
  }
}

/// Idealized translation store.
///
/// `insert` deliberately does not retain anything: only the mappings the
/// store was seeded with ever hit. Whether this was meant as a stub is an
/// open question, so the behavior is kept as observed.
#[derive(Debug, Clone, Default)]
pub struct InfiniteTlb {
  entries: HashMap<u64, u64>,
}

impl InfiniteTlb {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_entries<I>(entries: I) -> Self
  where
    I: IntoIterator<Item = (u64, u64)>,
  {
    Self {
      entries: entries.into_iter().collect(),
    }
  }
}

impl TlbMemory for InfiniteTlb {
  fn lookup(&mut self, vp_base: u64, _now: Tick, _set_mru: bool) -> Option<u64> {
    self.entries.get(&vp_base).copied()
  }

  fn insert(&mut self, _vp_base: u64, _pp_base: u64, _now: Tick) {}

  fn flush_all(&mut self) {}

  fn occupied(&self) -> usize {
    self.entries.len()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlbKind {
  SetAssoc,
  Infinite,
}

#[cfg(test)]
mod tests {
  use super::*;

  const PAGE: u64 = 4096;

  fn page(n: u64) -> u64 {
    n * PAGE
  }

  #[test]
  fn geometry_is_validated() {
    assert_eq!(SetAssocTlb::with_capacity(0, 2, PAGE).unwrap_err(), TlbError::NoEntries);
    assert_eq!(
      SetAssocTlb::with_capacity(6, 4, PAGE).unwrap_err(),
      TlbError::BadGeometry { entries: 6, sets: 4 }
    );
    assert_eq!(SetAssocTlb::new(2, 2, 3000).unwrap_err(), TlbError::BadPageSize(3000));
  }

  #[test]
  fn associativity_counts_sets() {
    let split = SetAssocTlb::with_capacity(64, 4, PAGE).unwrap();
    assert_eq!((split.sets(), split.ways()), (4, 16));

    let direct = SetAssocTlb::with_capacity(4, 0, PAGE).unwrap();
    assert_eq!((direct.sets(), direct.ways()), (4, 1));
  }

  #[test]
  fn direct_mapped_conflicts_replace() {
    let mut tlb = SetAssocTlb::with_capacity(4, 0, PAGE).unwrap();
    // pages 1 and 5 share set 1, page 2 has its own
    tlb.insert(page(1), 0x10_0000, 1);
    tlb.insert(page(2), 0x20_0000, 2);
    tlb.insert(page(5), 0x50_0000, 3);

    assert_eq!(tlb.lookup(page(1), 4, false), None);
    assert_eq!(tlb.lookup(page(5), 4, false), Some(0x50_0000));
    assert_eq!(tlb.lookup(page(2), 4, false), Some(0x20_0000));
  }

  #[test]
  fn evicts_oldest_in_set() {
    // 4 entries, 2 sets, 2 ways: even page numbers land in set 0
    let mut tlb = SetAssocTlb::new(2, 2, PAGE).unwrap();
    let (a, b, c) = (page(0), page(2), page(4));
    tlb.insert(a, 0x10_0000, 1);
    tlb.insert(b, 0x20_0000, 2);
    tlb.insert(c, 0x30_0000, 3);

    assert_eq!(tlb.lookup(a, 4, true), None);
    assert_eq!(tlb.lookup(b, 4, true), Some(0x20_0000));
    assert_eq!(tlb.lookup(c, 4, true), Some(0x30_0000));
  }

  #[test]
  fn mru_refresh_protects_entry() {
    let mut tlb = SetAssocTlb::new(2, 2, PAGE).unwrap();
    let (a, b, c) = (page(0), page(2), page(4));
    tlb.insert(a, 1, 1);
    tlb.insert(b, 2, 2);
    assert_eq!(tlb.lookup(a, 3, true), Some(1));
    tlb.insert(c, 3, 4);

    assert_eq!(tlb.lookup(a, 5, false), Some(1));
    assert_eq!(tlb.lookup(b, 5, false), None);
  }

  #[test]
  fn lookup_without_mru_keeps_stamp() {
    let mut tlb = SetAssocTlb::new(1, 2, PAGE).unwrap();
    tlb.insert(page(1), 1, 1);
    tlb.insert(page(2), 2, 2);
    assert_eq!(tlb.lookup(page(1), 10, false), Some(1));
    tlb.insert(page(3), 3, 11);
    assert_eq!(tlb.lookup(page(1), 12, false), None);
  }

  #[test]
  fn other_sets_are_untouched() {
    let mut tlb = SetAssocTlb::new(2, 2, PAGE).unwrap();
    tlb.insert(page(1), 1, 1);
    for n in 0..10 {
      tlb.insert(page(n * 2), n, 2 + n);
    }
    assert_eq!(tlb.lookup(page(1), 20, false), Some(1));
  }

  #[test]
  fn sets_never_overflow() {
    let mut tlb = SetAssocTlb::new(4, 2, PAGE).unwrap();
    let mut now = 0;
    for n in [3u64, 7, 11, 3, 15, 19, 2, 6, 10, 14, 7, 7, 1, 5, 9, 13, 17, 4, 8, 12] {
      now += 1;
      tlb.insert(page(n), n, now);
      for set in 0..tlb.sets() {
        assert!(tlb.set_entries(set).iter().filter(|e| e.occupied).count() <= tlb.ways());
      }
    }
    assert_eq!(tlb.occupied(), 8);
  }

  #[test]
  fn reinsert_updates_in_place() {
    let mut tlb = SetAssocTlb::new(1, 2, PAGE).unwrap();
    tlb.insert(page(1), 1, 1);
    tlb.insert(page(1), 9, 2);
    assert_eq!(tlb.occupied(), 1);
    assert_eq!(tlb.lookup(page(1), 3, false), Some(9));
  }

  #[test]
  fn flush_all_invalidates_everything() {
    let mut tlb = SetAssocTlb::new(2, 2, PAGE).unwrap();
    for n in 0..4 {
      tlb.insert(page(n), n, n + 1);
    }
    tlb.flush_all();
    assert_eq!(tlb.occupied(), 0);
    for n in 0..4 {
      assert_eq!(tlb.lookup(page(n), 10, true), None);
    }
    assert!(tlb.set_entries(0).iter().all(|e| e.mru_tick == 0));
  }

  #[test]
  fn infinite_insert_is_inert() {
    let mut tlb = InfiniteTlb::new();
    tlb.insert(page(5), page(50), 1);
    assert_eq!(tlb.lookup(page(5), 2, true), None);

    let mut seeded = InfiniteTlb::with_entries([(page(5), page(50))]);
    assert_eq!(seeded.lookup(page(5), 2, true), Some(page(50)));
    seeded.flush_all();
    assert_eq!(seeded.lookup(page(5), 3, true), Some(page(50)));
  }
}
