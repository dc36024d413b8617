use std::collections::{BTreeMap, VecDeque};

use super::tlb::Tick;
use super::transfer::TransferId;

/// Outstanding resolution for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MshrEntry {
  /// Transfer whose miss issued the resolution request
  pub owner: TransferId,
  /// Transfers that missed on the same page afterwards, in arrival order
  pub waiters: VecDeque<TransferId>,
  pub issued_at: Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MshrOutcome {
  /// No resolution was outstanding; the caller must issue one
  Allocated,
  /// Joined an outstanding resolution
  Coalesced,
}

/// Miss status holding registers keyed by page address.
///
/// A page has an entry exactly while its resolution is in flight.
#[derive(Debug, Clone, Default)]
pub struct MshrTable {
  entries: BTreeMap<u64, MshrEntry>,
}

impl MshrTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, page: u64, transfer: TransferId, now: Tick) -> MshrOutcome {
    match self.entries.get_mut(&page) {
      Some(entry) => {
        entry.waiters.push_back(transfer);
        MshrOutcome::Coalesced
      },
      None => {
        self.entries.insert(
          page,
          MshrEntry {
            owner: transfer,
            waiters: VecDeque::new(),
            issued_at: now,
          },
        );
        MshrOutcome::Allocated
      },
    }
  }

  /// Removes the entry for `page`, handing back everyone waiting on it.
  pub fn complete(&mut self, page: u64) -> Option<MshrEntry> {
    self.entries.remove(&page)
  }

  pub fn contains(&self, page: u64) -> bool {
    self.entries.contains_key(&page)
  }

  pub fn get(&self, page: u64) -> Option<&MshrEntry> {
    self.entries.get(&page)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Issue tick of the oldest resolution still in flight.
  pub fn oldest_issue(&self) -> Option<Tick> {
    self.entries.values().map(|e| e.issued_at).min()
  }

  pub fn pages(&self) -> impl Iterator<Item = u64> + '_ {
    self.entries.keys().copied()
  }
}

impl MshrEntry {
  /// Owner first, then waiters in the order they arrived.
  pub fn into_resume_order(self) -> impl Iterator<Item = TransferId> {
    std::iter::once(self.owner).chain(self.waiters)
  }
}
