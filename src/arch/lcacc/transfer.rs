use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Node id the microprogram encoder writes for host memory.
pub const HOST_MEMORY_NODE: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
  /// Host memory, addressed virtually and translated page by page
  Memory,
  /// Accelerator-local scratchpad, addressed directly
  Scratchpad(u32),
}

impl Endpoint {
  pub fn from_node(node: u32) -> Self {
    if node == HOST_MEMORY_NODE {
      Endpoint::Memory
    } else {
      Endpoint::Scratchpad(node)
    }
  }

  pub fn needs_translation(&self) -> bool {
    matches!(self, Endpoint::Memory)
  }
}

/// Access type attached to single-element transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
  Read,
  Write,
  ReadLock,
  WriteLock,
  WriteUnlock,
  Unlock,
}

impl AccessType {
  /// Lock-class ops are also announced to the other lock holders, so their
  /// notification can show up through both signal paths.
  pub fn is_lock_op(&self) -> bool {
    !matches!(self, AccessType::Read | AccessType::Write)
  }

  /// Reads pull from host memory into the scratchpad, everything else
  /// targets a host memory word.
  pub fn reads_memory(&self) -> bool {
    matches!(self, AccessType::Read | AccessType::ReadLock)
  }
}

/// N-dimensional strided access: element `(i0, i1, ..)` lives at
/// `base + sum(i_k * strides[k]) * element_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StridedRegion {
  pub base: u64,
  pub sizes: Vec<u32>,
  pub strides: Vec<i32>,
}

impl StridedRegion {
  pub fn new(base: u64, sizes: Vec<u32>, strides: Vec<i32>) -> Self {
    Self { base, sizes, strides }
  }

  /// A single contiguous element at `base`.
  pub fn scalar(base: u64) -> Self {
    Self::new(base, Vec::new(), Vec::new())
  }

  pub fn is_well_formed(&self) -> bool {
    self.sizes.len() == self.strides.len()
  }

  pub fn element_count(&self) -> u64 {
    self.sizes.iter().map(|&s| s as u64).product()
  }

  /// Start address of every element, dimension 0 varying fastest.
  pub fn element_addrs(&self, element_size: u32) -> ElementAddrs<'_> {
    ElementAddrs {
      region: self,
      element_size: element_size as u64,
      index: vec![0; self.sizes.len()],
      done: self.sizes.iter().any(|&s| s == 0),
    }
  }

  /// Byte offset of the element at `index`. Address arithmetic wraps.
  fn byte_offset(&self, index: &[u32], element_size: u64) -> u64 {
    index
      .iter()
      .zip(&self.strides)
      .fold(0u64, |acc, (&i, &stride)| {
        acc.wrapping_add((i as u64).wrapping_mul(stride as i64 as u64))
      })
      .wrapping_mul(element_size)
  }

  /// Every page base touched by the region, ascending.
  ///
  /// Rows along dimension 0 whose gaps are shorter than a page are taken
  /// as one span, so the walk is per row rather than per element.
  pub fn pages(&self, element_size: u32, page_size: u64) -> BTreeSet<u64> {
    let mut pages = BTreeSet::new();
    if self.sizes.iter().any(|&s| s == 0) {
      return pages;
    }

    let width = element_size.max(1) as u64;
    let (row_len, row_stride) = match (self.sizes.first(), self.strides.first()) {
      (Some(&len), Some(&stride)) => (len as u64, stride as i64),
      _ => (1, 0),
    };
    let step = row_stride.unsigned_abs().saturating_mul(element_size as u64);
    let dense = step.saturating_sub(width) < page_size;
    let rows = StridedRegion::new(
      self.base,
      self.sizes.iter().skip(1).copied().collect(),
      self.strides.iter().skip(1).copied().collect(),
    );

    for row_start in rows.element_addrs(element_size) {
      if dense {
        let reach = (row_len - 1).wrapping_mul(step);
        let low = if row_stride < 0 {
          row_start.wrapping_sub(reach)
        } else {
          row_start
        };
        let len = (row_len - 1).saturating_mul(step).saturating_add(width);
        insert_span(&mut pages, low, len, page_size);
      } else {
        let delta = (row_stride as u64).wrapping_mul(element_size as u64);
        let mut addr = row_start;
        for _ in 0..row_len {
          insert_span(&mut pages, addr, width, page_size);
          addr = addr.wrapping_add(delta);
        }
      }
    }
    pages
  }
}

fn insert_span(pages: &mut BTreeSet<u64>, start: u64, len: u64, page_size: u64) {
  let mask = !(page_size - 1);
  let last = start.saturating_add(len - 1) & mask;
  let mut page = start & mask;
  loop {
    pages.insert(page);
    if page == last {
      break;
    }
    page = page.wrapping_add(page_size);
  }
}

pub struct ElementAddrs<'a> {
  region: &'a StridedRegion,
  element_size: u64,
  index: Vec<u32>,
  done: bool,
}

impl Iterator for ElementAddrs<'_> {
  type Item = u64;

  fn next(&mut self) -> Option<u64> {
    if self.done {
      return None;
    }
    let offset = self.region.byte_offset(&self.index, self.element_size);
    let addr = self.region.base.wrapping_add(offset);

    // odometer step
    self.done = true;
    for (dim, i) in self.index.iter_mut().enumerate() {
      *i += 1;
      if *i < self.region.sizes[dim] {
        self.done = false;
        break;
      }
      *i = 0;
    }
    Some(addr)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMapping {
  pub vpage: u64,
  pub ppage: u64,
}

/// Handle into an [`Arena`]. Stale handles never alias a newer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId {
  index: u32,
  generation: u32,
}

impl fmt::Display for TransferId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "t{}.{}", self.index, self.generation)
  }
}

#[derive(Debug, Clone)]
struct Slot<T> {
  generation: u32,
  value: Option<T>,
}

/// Generational slab owning in-flight transfer descriptors.
#[derive(Debug, Clone)]
pub struct Arena<T> {
  slots: Vec<Slot<T>>,
  free: Vec<u32>,
  live: usize,
}

impl<T> Default for Arena<T> {
  fn default() -> Self {
    Self {
      slots: Vec::new(),
      free: Vec::new(),
      live: 0,
    }
  }
}

impl<T> Arena<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, value: T) -> TransferId {
    self.live += 1;
    match self.free.pop() {
      Some(index) => {
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.value = Some(value);
        TransferId {
          index,
          generation: slot.generation,
        }
      },
      None => {
        self.slots.push(Slot {
          generation: 0,
          value: Some(value),
        });
        TransferId {
          index: (self.slots.len() - 1) as u32,
          generation: 0,
        }
      },
    }
  }

  pub fn get(&self, id: TransferId) -> Option<&T> {
    self
      .slots
      .get(id.index as usize)
      .filter(|s| s.generation == id.generation)
      .and_then(|s| s.value.as_ref())
  }

  pub fn get_mut(&mut self, id: TransferId) -> Option<&mut T> {
    self
      .slots
      .get_mut(id.index as usize)
      .filter(|s| s.generation == id.generation)
      .and_then(|s| s.value.as_mut())
  }

  pub fn remove(&mut self, id: TransferId) -> Option<T> {
    let slot = self.slots.get_mut(id.index as usize)?;
    if slot.generation != id.generation {
      return None;
    }
    let value = slot.value.take()?;
    self.free.push(id.index);
    self.live -= 1;
    Some(value)
  }

  pub fn contains(&self, id: TransferId) -> bool {
    self.get(id).is_some()
  }

  pub fn len(&self) -> usize {
    self.live
  }

  pub fn is_empty(&self) -> bool {
    self.live == 0
  }
}

pub type OnFinish = Box<dyn FnOnce()>;

/// What a transfer does once its pages are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKind {
  Block {
    src: Endpoint,
    src_region: StridedRegion,
    dst: Endpoint,
    dst_region: StridedRegion,
    element_size: u32,
  },
  Single {
    spm: u32,
    src: u64,
    dst: u64,
    size: u32,
    access: AccessType,
  },
  Prefetch {
    region: StridedRegion,
    element_size: u32,
  },
}

/// Descriptor of a transfer travelling through translation.
pub struct TransferData {
  pub kind: TransferKind,
  pub priority: i32,
  /// Arrival order, used to break priority ties
  pub seq: u64,
  /// Pages that still wait for a translation
  pub pending: BTreeSet<u64>,
  pub translations: BTreeMap<u64, u64>,
  pub buffer: u32,
  pub on_finish: Option<OnFinish>,
}

impl TransferData {
  pub fn new(kind: TransferKind, priority: i32, seq: u64, buffer: u32, on_finish: Option<OnFinish>) -> Self {
    Self {
      kind,
      priority,
      seq,
      pending: BTreeSet::new(),
      translations: BTreeMap::new(),
      buffer,
      on_finish,
    }
  }

  pub fn is_resolved(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn resolve(&mut self, vpage: u64, ppage: u64) {
    self.pending.remove(&vpage);
    self.translations.insert(vpage, ppage);
  }

  pub fn page_mappings(&self, pages: &BTreeSet<u64>) -> Vec<PageMapping> {
    pages
      .iter()
      .filter_map(|vpage| {
        self.translations.get(vpage).map(|&ppage| PageMapping {
          vpage: *vpage,
          ppage,
        })
      })
      .collect()
  }
}

impl fmt::Debug for TransferData {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TransferData")
      .field("kind", &self.kind)
      .field("priority", &self.priority)
      .field("seq", &self.seq)
      .field("pending", &self.pending)
      .field("translations", &self.translations)
      .field("buffer", &self.buffer)
      .field("on_finish", &self.on_finish.is_some())
      .finish()
  }
}
