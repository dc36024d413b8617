use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::rc::Rc;

use super::error::DmaError;
use super::mshr::{MshrOutcome, MshrTable};
use super::net::{NetMsg, NetworkInterface};
use super::signal::{SignalEntry, SignalKey, SignalLedger, SignalOutcome, SignalPath};
use super::spm::{CopyRequest, ResolvedEndpoint, SingleElementRequest, SpmInterface};
use super::tlb::{Tick, TlbMemory};
use super::transfer::{
  AccessType, Arena, Endpoint, OnFinish, StridedRegion, TransferData, TransferId, TransferKind,
};

pub type FaultCallback = Box<dyn FnMut(u64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
  Running,
  TlbWait,
}

/// Where a TLB miss goes to get resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Resolution {
  /// Translation request sent to a resolver node
  Network { resolver_port: u32 },
  /// Raised through the controller's `on_tlb_miss` callback
  Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaConfig {
  pub page_size: u64,
  pub resolution: Resolution,
  /// Cycles a TLB hit costs before the copy is handed off
  pub hit_latency: Tick,
}

impl Default for DmaConfig {
  fn default() -> Self {
    Self {
      page_size: 4096,
      resolution: Resolution::Local,
      hit_latency: 0,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaStats {
  pub hits: u64,
  pub mshr_hits: u64,
  pub misses: u64,
  pub flushes: u64,
  /// Cycles spent between issuing a resolution and its answer
  pub tlb_cycles: u64,
  pub violations: u64,
  pub abandoned: u64,
  pub copies: u64,
  pub single_elements: u64,
  pub prefetches: u64,
}

/// A multi-dimensional block transfer as the caller describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransfer {
  pub src: Endpoint,
  pub src_addr: u64,
  pub src_sizes: Vec<u32>,
  pub src_strides: Vec<i32>,
  pub dst: Endpoint,
  pub dst_addr: u64,
  pub dst_sizes: Vec<u32>,
  pub dst_strides: Vec<i32>,
  pub element_size: u32,
  #[serde(default)]
  pub priority: i32,
}

impl BlockTransfer {
  fn src_region(&self) -> StridedRegion {
    StridedRegion::new(self.src_addr, self.src_sizes.clone(), self.src_strides.clone())
  }

  fn dst_region(&self) -> StridedRegion {
    StridedRegion::new(self.dst_addr, self.dst_sizes.clone(), self.dst_strides.clone())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyTransfer {
  priority: i32,
  seq: u64,
  id: TransferId,
}

// max-heap: higher priority first, then earlier arrival
impl Ord for ReadyTransfer {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for ReadyTransfer {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

fn check_region(side: &'static str, region: &StridedRegion) -> Result<(), DmaError> {
  if region.is_well_formed() {
    Ok(())
  } else {
    Err(DmaError::DimensionMismatch {
      side,
      sizes: region.sizes.len(),
      strides: region.strides.len(),
    })
  }
}

/// DMA engine front end: translates the host pages a transfer touches,
/// coalesces misses on the same page, and hands fully resolved transfers to
/// the copy engine in priority order.
///
/// Callbacks handed in here run synchronously and must not call back into
/// the controller.
pub struct DmaController {
  config: DmaConfig,
  tlb: Box<dyn TlbMemory>,
  mshr: MshrTable,
  transfers: Arena<TransferData>,
  ready: BinaryHeap<ReadyTransfer>,
  signals: SignalLedger,
  network: Rc<RefCell<dyn NetworkInterface>>,
  spm: Rc<RefCell<dyn SpmInterface>>,
  on_tlb_miss: FaultCallback,
  on_access_violation: FaultCallback,
  buffer: u32,
  hooked: Option<String>,
  next_seq: u64,
  next_signal: u64,
  status: TransferStatus,
  wait_since: Option<Tick>,
  stats: DmaStats,
}

impl DmaController {
  pub fn new(
    config: DmaConfig,
    tlb: Box<dyn TlbMemory>,
    network: Rc<RefCell<dyn NetworkInterface>>,
    spm: Rc<RefCell<dyn SpmInterface>>,
    on_tlb_miss: FaultCallback,
    on_access_violation: FaultCallback,
  ) -> Result<Self, DmaError> {
    if !config.page_size.is_power_of_two() {
      return Err(DmaError::BadPageSize(config.page_size));
    }
    Ok(Self {
      config,
      tlb,
      mshr: MshrTable::new(),
      transfers: Arena::new(),
      ready: BinaryHeap::new(),
      signals: SignalLedger::new(),
      network,
      spm,
      on_tlb_miss,
      on_access_violation,
      buffer: 0,
      hooked: None,
      next_seq: 0,
      next_signal: 0,
      status: TransferStatus::Running,
      wait_since: None,
      stats: DmaStats::default(),
    })
  }

  pub fn network_port(&self) -> u32 {
    self.network.borrow().network_port()
  }

  pub fn device_name(&self) -> String {
    format!("dma{:02}", self.network_port())
  }

  pub fn page_addr(&self, addr: u64) -> u64 {
    addr & !(self.config.page_size - 1)
  }

  pub fn config(&self) -> &DmaConfig {
    &self.config
  }

  pub fn begin_transfer(&mut self, now: Tick, req: BlockTransfer, on_finish: OnFinish) -> Result<TransferId, DmaError> {
    let src_region = req.src_region();
    let dst_region = req.dst_region();
    check_region("source", &src_region)?;
    check_region("destination", &dst_region)?;
    if req.element_size == 0 {
      return Err(DmaError::ZeroElementSize);
    }

    let mut pages = BTreeSet::new();
    if req.src.needs_translation() {
      pages.extend(src_region.pages(req.element_size, self.config.page_size));
    }
    if req.dst.needs_translation() {
      pages.extend(dst_region.pages(req.element_size, self.config.page_size));
    }

    let kind = TransferKind::Block {
      src: req.src,
      src_region,
      dst: req.dst,
      dst_region,
      element_size: req.element_size,
    };
    let id = self.admit(now, kind, req.priority, pages, Some(on_finish));
    log::debug!("{} begin transfer {} prio {}", self.device_name(), id, req.priority);
    Ok(id)
  }

  pub fn begin_transfer_with_priority(
    &mut self,
    now: Tick,
    mut req: BlockTransfer,
    priority: i32,
    on_finish: OnFinish,
  ) -> Result<TransferId, DmaError> {
    req.priority = priority;
    self.begin_transfer(now, req, on_finish)
  }

  /// Moves one `size`-byte word between scratchpad `spm` and host memory.
  /// Completion is reported through the signal paths, not at hand-off.
  pub fn begin_single_element_transfer(
    &mut self,
    now: Tick,
    spm: u32,
    src: u64,
    dst: u64,
    size: u32,
    access: AccessType,
    on_finish: OnFinish,
  ) -> Result<TransferId, DmaError> {
    if size == 0 {
      return Err(DmaError::ZeroElementSize);
    }
    let memory_addr = if access.reads_memory() { src } else { dst };
    let pages = StridedRegion::scalar(memory_addr).pages(size, self.config.page_size);
    let kind = TransferKind::Single {
      spm,
      src,
      dst,
      size,
      access,
    };
    let id = self.admit(now, kind, 0, pages, Some(on_finish));
    log::debug!("{} single element {:?} {:#x} -> {:#x} as {}", self.device_name(), access, src, dst, id);
    Ok(id)
  }

  /// Warms the TLB for every page of `region` without moving data.
  pub fn prefetch_memory(&mut self, now: Tick, region: StridedRegion, element_size: u32) -> Result<TransferId, DmaError> {
    check_region("prefetch", &region)?;
    if element_size == 0 {
      return Err(DmaError::ZeroElementSize);
    }
    let pages = region.pages(element_size, self.config.page_size);
    let kind = TransferKind::Prefetch { region, element_size };
    Ok(self.admit(now, kind, 0, pages, None))
  }

  /// Tags subsequent copies with a scratchpad buffer index.
  pub fn set_buffer(&mut self, buffer: u32) {
    self.buffer = buffer;
  }

  pub fn buffer(&self) -> u32 {
    self.buffer
  }

  /// Invalidates every cached translation. In-flight resolutions still land.
  pub fn flush_tlb(&mut self) {
    self.tlb.flush_all();
    self.stats.flushes += 1;
    log::info!("{} tlb flushed", self.device_name());
  }

  /// Installs a translation pushed by an outside party. Transfers waiting on
  /// that page are released as if the resolver had answered.
  pub fn add_tlb_entry(&mut self, now: Tick, vaddr: u64, paddr: u64) {
    let vpage = self.page_addr(vaddr);
    let ppage = self.page_addr(paddr);
    if self.mshr.contains(vpage) {
      self.finish_translation(now, vpage, ppage);
    } else {
      self.tlb.insert(vpage, ppage, now);
      log::debug!("{} tlb fill {:#x} -> {:#x}", self.device_name(), vpage, ppage);
    }
  }

  pub fn hook_to_memory_controller(&mut self, device: &str) -> Result<(), DmaError> {
    if let Some(existing) = &self.hooked {
      return Err(DmaError::AlreadyHooked(existing.clone()));
    }
    let name = self.device_name();
    self.spm.borrow_mut().hook(&name, device);
    self.hooked = Some(device.to_string());
    log::info!("{} hooked to {}", name, device);
    Ok(())
  }

  pub fn hooked_device(&self) -> Option<&str> {
    self.hooked.as_deref()
  }

  /// Resolution for `vpage` arrived: fill the TLB and resume everyone who
  /// waited on it, owner first.
  pub fn finish_translation(&mut self, now: Tick, vpage: u64, ppage: u64) {
    let vpage = self.page_addr(vpage);
    let ppage = self.page_addr(ppage);
    self.tlb.insert(vpage, ppage, now);

    let Some(entry) = self.mshr.complete(vpage) else {
      log::debug!("{} translation {:#x} without outstanding miss", self.device_name(), vpage);
      return;
    };
    self.stats.tlb_cycles += now.saturating_sub(entry.issued_at);

    // a live owner retries against the fresh fill
    if self.transfers.contains(entry.owner) && self.tlb.lookup(vpage, now, true).is_some() {
      self.stats.hits += 1;
    }
    for id in entry.into_resume_order() {
      self.resume(id, vpage, ppage);
    }
    self.update_status();
    self.drain_ready();
  }

  /// The resolver refused `vaddr`. Every transfer waiting on its page is
  /// dropped without completing.
  pub fn on_access_error(&mut self, vaddr: u64) {
    let vpage = self.page_addr(vaddr);
    self.stats.violations += 1;
    log::warn!("{} access violation at {:#x}", self.device_name(), vaddr);
    (self.on_access_violation)(vaddr);

    if let Some(entry) = self.mshr.complete(vpage) {
      for id in entry.into_resume_order() {
        if self.transfers.remove(id).is_some() {
          self.stats.abandoned += 1;
        }
      }
    }
    self.update_status();
  }

  pub fn on_network_msg(&mut self, now: Tick, src: u32, msg: &NetMsg) {
    match *msg {
      NetMsg::TranslationResponse { vpage, ppage } => self.finish_translation(now, vpage, ppage),
      NetMsg::AccessViolation { vaddr } => self.on_access_error(vaddr),
      NetMsg::Signal(key) => {
        self.on_signal(SignalPath::Remote, key);
      },
      NetMsg::TlbFill { vaddr, paddr } => self.add_tlb_entry(now, vaddr, paddr),
      NetMsg::TlbFlush => self.flush_tlb(),
      NetMsg::TranslationRequest { vpage, .. } => {
        log::warn!("{} ignoring translation request for {:#x} from {}", self.device_name(), vpage, src);
      },
    }
  }

  pub fn on_signal(&mut self, path: SignalPath, key: SignalKey) -> SignalOutcome {
    let outcome = self.signals.observe(path, key);
    match outcome {
      SignalOutcome::Unexpected => log::warn!("{} unexpected {:?} signal {:?}", self.device_name(), path, key),
      _ => log::trace!("{} {:?} signal {} {:?}", self.device_name(), path, key.id, outcome),
    }
    outcome
  }

  /// Looks up `vaddr` without touching recency or stats.
  pub fn probe(&mut self, now: Tick, vaddr: u64) -> Option<u64> {
    let vpage = self.page_addr(vaddr);
    self
      .tlb
      .lookup(vpage, now, false)
      .map(|ppage| ppage | (vaddr - vpage))
  }

  pub fn status(&self) -> TransferStatus {
    self.status
  }

  /// Issue tick of the oldest unanswered miss while waiting.
  pub fn wait_since(&self) -> Option<Tick> {
    self.wait_since
  }

  pub fn stats(&self) -> DmaStats {
    self.stats
  }

  pub fn tlb_hits(&self) -> u64 {
    self.stats.hits + self.stats.mshr_hits
  }

  pub fn tlb_misses(&self) -> u64 {
    self.stats.misses
  }

  pub fn tlb_flushes(&self) -> u64 {
    self.stats.flushes
  }

  pub fn tlb_cycles(&self) -> u64 {
    self.stats.tlb_cycles
  }

  pub fn outstanding_misses(&self) -> usize {
    self.mshr.len()
  }

  pub fn waiting_pages(&self) -> Vec<u64> {
    self.mshr.pages().collect()
  }

  pub fn in_flight(&self) -> usize {
    self.transfers.len()
  }

  pub fn pending_signals(&self) -> usize {
    self.signals.waiting()
  }

  pub fn is_idle(&self) -> bool {
    self.transfers.is_empty() && self.mshr.is_empty() && self.signals.waiting() == 0
  }

  fn admit(
    &mut self,
    now: Tick,
    kind: TransferKind,
    priority: i32,
    pages: BTreeSet<u64>,
    on_finish: Option<OnFinish>,
  ) -> TransferId {
    let seq = self.next_seq;
    self.next_seq += 1;
    let id = self
      .transfers
      .insert(TransferData::new(kind, priority, seq, self.buffer, on_finish));

    for page in pages {
      self.translate(now, id, page);
    }
    if self.transfers.get(id).is_some_and(|t| t.is_resolved()) {
      self.ready.push(ReadyTransfer { priority, seq, id });
    }
    self.drain_ready();
    id
  }

  fn translate(&mut self, now: Tick, id: TransferId, vpage: u64) {
    if let Some(ppage) = self.tlb.lookup(vpage, now, true) {
      self.stats.hits += 1;
      if let Some(t) = self.transfers.get_mut(id) {
        t.resolve(vpage, ppage);
      }
      return;
    }

    if let Some(t) = self.transfers.get_mut(id) {
      t.pending.insert(vpage);
    }
    match self.mshr.register(vpage, id, now) {
      MshrOutcome::Coalesced => {
        self.stats.mshr_hits += 1;
        log::trace!("{} {} joins miss on {:#x}", self.device_name(), id, vpage);
      },
      MshrOutcome::Allocated => {
        self.stats.misses += 1;
        if self.status == TransferStatus::Running {
          self.status = TransferStatus::TlbWait;
          self.wait_since = Some(now);
        }
        self.request_translation(vpage);
      },
    }
  }

  fn request_translation(&mut self, vpage: u64) {
    match self.config.resolution {
      Resolution::Network { resolver_port } => {
        let requester = self.network.borrow().network_port();
        log::debug!("dma{:02} tlb miss {:#x}, asking node {}", requester, vpage, resolver_port);
        self
          .network
          .borrow_mut()
          .send(resolver_port, NetMsg::TranslationRequest { vpage, requester });
      },
      Resolution::Local => {
        log::debug!("{} tlb miss {:#x}", self.device_name(), vpage);
        (self.on_tlb_miss)(vpage);
      },
    }
  }

  fn resume(&mut self, id: TransferId, vpage: u64, ppage: u64) {
    let Some(t) = self.transfers.get_mut(id) else {
      log::trace!("skip abandoned transfer {}", id);
      return;
    };
    t.resolve(vpage, ppage);
    if t.is_resolved() {
      self.ready.push(ReadyTransfer {
        priority: t.priority,
        seq: t.seq,
        id,
      });
    }
  }

  fn update_status(&mut self) {
    self.wait_since = self.mshr.oldest_issue();
    if self.wait_since.is_none() {
      self.status = TransferStatus::Running;
    }
  }

  fn drain_ready(&mut self) {
    while let Some(ReadyTransfer { id, .. }) = self.ready.pop() {
      if let Some(transfer) = self.transfers.remove(id) {
        self.delegate(id, transfer);
      }
    }
  }

  fn delegate(&mut self, id: TransferId, mut transfer: TransferData) {
    let page_size = self.config.page_size;
    match &transfer.kind {
      TransferKind::Block {
        src,
        src_region,
        dst,
        dst_region,
        element_size,
      } => {
        let resolve = |endpoint: Endpoint, region: &StridedRegion| {
          let pages = if endpoint.needs_translation() {
            transfer.page_mappings(&region.pages(*element_size, page_size))
          } else {
            Vec::new()
          };
          ResolvedEndpoint {
            endpoint,
            region: region.clone(),
            pages,
          }
        };
        let req = CopyRequest {
          id,
          buffer: transfer.buffer,
          src: resolve(*src, src_region),
          dst: resolve(*dst, dst_region),
          element_size: *element_size,
          priority: transfer.priority,
        };
        self.stats.copies += 1;
        self.spm.borrow_mut().begin_copy(req);
        if let Some(on_finish) = transfer.on_finish.take() {
          on_finish();
        }
      },
      TransferKind::Single {
        spm,
        src,
        dst,
        size,
        access,
      } => {
        let memory_addr = if access.reads_memory() { *src } else { *dst };
        let vpage = memory_addr & !(page_size - 1);
        let ppage = transfer.translations.get(&vpage).copied().unwrap_or(vpage);
        let key = SignalKey {
          id: self.next_signal,
          dst_addr: *dst,
          requested_addr: memory_addr,
          size: *size,
        };
        self.next_signal += 1;
        self.signals.register(SignalEntry {
          key,
          mirrored: access.is_lock_op(),
          on_finish: transfer.on_finish.take(),
        });
        let req = SingleElementRequest {
          signal: key,
          spm: *spm,
          access: *access,
          src: *src,
          dst: *dst,
          size: *size,
          phys_addr: ppage | (memory_addr - vpage),
          buffer: transfer.buffer,
        };
        self.stats.single_elements += 1;
        self.spm.borrow_mut().begin_single_element(req);
      },
      TransferKind::Prefetch { .. } => {
        self.stats.prefetches += 1;
        log::trace!("{} prefetch {} resolved", self.device_name(), id);
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::lcacc::tlb::{InfiniteTlb, SetAssocTlb};
  use std::cell::Cell;

  const PAGE: u64 = 4096;
  const PORT: u32 = 3;
  const RESOLVER: u32 = 9;

  #[derive(Default)]
  struct RecordingNet {
    sent: Vec<(u32, NetMsg)>,
  }

  impl NetworkInterface for RecordingNet {
    fn network_port(&self) -> u32 {
      PORT
    }

    fn send(&mut self, dst: u32, msg: NetMsg) {
      self.sent.push((dst, msg));
    }
  }

  #[derive(Default)]
  struct RecordingSpm {
    copies: Vec<CopyRequest>,
    singles: Vec<SingleElementRequest>,
    hooks: Vec<(String, String)>,
  }

  impl SpmInterface for RecordingSpm {
    fn begin_copy(&mut self, req: CopyRequest) {
      self.copies.push(req);
    }

    fn begin_single_element(&mut self, req: SingleElementRequest) {
      self.singles.push(req);
    }

    fn hook(&mut self, dma_device: &str, memory_controller: &str) {
      self.hooks.push((dma_device.to_string(), memory_controller.to_string()));
    }
  }

  struct Rig {
    dma: DmaController,
    net: Rc<RefCell<RecordingNet>>,
    spm: Rc<RefCell<RecordingSpm>>,
    violations: Rc<RefCell<Vec<u64>>>,
    misses: Rc<RefCell<Vec<u64>>>,
  }

  fn rig_with(tlb: Box<dyn TlbMemory>, resolution: Resolution) -> Rig {
    let net = Rc::new(RefCell::new(RecordingNet::default()));
    let spm = Rc::new(RefCell::new(RecordingSpm::default()));
    let violations = Rc::new(RefCell::new(Vec::new()));
    let misses = Rc::new(RefCell::new(Vec::new()));
    let v = Rc::clone(&violations);
    let m = Rc::clone(&misses);
    let dma = DmaController::new(
      DmaConfig {
        page_size: PAGE,
        resolution,
        hit_latency: 0,
      },
      tlb,
      net.clone(),
      spm.clone(),
      Box::new(move |vpage| m.borrow_mut().push(vpage)),
      Box::new(move |vaddr| v.borrow_mut().push(vaddr)),
    )
    .unwrap();
    Rig {
      dma,
      net,
      spm,
      violations,
      misses,
    }
  }

  fn rig() -> Rig {
    rig_with(
      Box::new(SetAssocTlb::with_capacity(16, 4, PAGE).unwrap()),
      Resolution::Network {
        resolver_port: RESOLVER,
      },
    )
  }

  /// `count` contiguous 4-byte words from host `addr` into scratchpad 1.
  fn load(addr: u64, count: u32) -> BlockTransfer {
    BlockTransfer {
      src: Endpoint::Memory,
      src_addr: addr,
      src_sizes: vec![count],
      src_strides: vec![1],
      dst: Endpoint::Scratchpad(1),
      dst_addr: 0,
      dst_sizes: vec![count],
      dst_strides: vec![1],
      element_size: 4,
      priority: 0,
    }
  }

  fn tracker(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> OnFinish {
    let log = Rc::clone(log);
    Box::new(move || log.borrow_mut().push(name))
  }

  #[test]
  fn misses_on_same_page_coalesce() {
    let mut r = rig();
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, load(0x5000, 4), tracker(&done, "a")).unwrap();
    r.dma.begin_transfer(1, load(0x5100, 4), tracker(&done, "b")).unwrap();

    assert_eq!(r.net.borrow().sent.len(), 1);
    assert_eq!(r.dma.status(), TransferStatus::TlbWait);
    assert_eq!(r.dma.waiting_pages(), vec![0x5000]);

    r.dma.finish_translation(10, 0x5000, 0x9000);
    assert_eq!(*done.borrow(), vec!["a", "b"]);
    assert_eq!(r.dma.tlb_hits(), 2);
    assert_eq!(r.dma.tlb_misses(), 1);
    assert_eq!(r.dma.tlb_cycles(), 10);
    assert_eq!(r.dma.status(), TransferStatus::Running);
    assert_eq!(r.dma.probe(11, 0x5010), Some(0x9010));

    let copies = &r.spm.borrow().copies;
    assert_eq!(copies.len(), 2);
    assert_eq!(copies[0].src.pages[0].ppage, 0x9000);
    assert!(copies[0].dst.pages.is_empty());
  }

  #[test]
  fn request_names_requester_and_page() {
    let mut r = rig();
    r.dma.begin_transfer(0, load(0x7004, 1), Box::new(|| {})).unwrap();
    assert_eq!(
      r.net.borrow().sent[0],
      (
        RESOLVER,
        NetMsg::TranslationRequest {
          vpage: 0x7000,
          requester: PORT
        }
      )
    );
  }

  #[test]
  fn many_overlapping_requests_share_one_resolution() {
    let mut r = rig();
    let count = Rc::new(Cell::new(0));
    for i in 0..8 {
      let count = Rc::clone(&count);
      r.dma
        .begin_transfer(i, load(0x3000 + i * 16, 2), Box::new(move || count.set(count.get() + 1)))
        .unwrap();
    }
    assert_eq!(r.net.borrow().sent.len(), 1);
    assert_eq!(r.dma.outstanding_misses(), 1);

    r.dma.finish_translation(20, 0x3000, 0x1000);
    assert_eq!(count.get(), 8);
    assert_eq!(r.dma.stats().mshr_hits, 7);
    assert!(r.dma.is_idle());
  }

  #[test]
  fn transfer_spanning_pages_waits_for_all() {
    let mut r = rig();
    let done = Rc::new(RefCell::new(Vec::new()));
    // 4 words straddling 0x1000/0x2000
    r.dma.begin_transfer(0, load(0x1ff8, 4), tracker(&done, "span")).unwrap();
    assert_eq!(r.dma.waiting_pages(), vec![0x1000, 0x2000]);

    r.dma.finish_translation(5, 0x2000, 0xb000);
    assert!(done.borrow().is_empty());
    assert_eq!(r.dma.status(), TransferStatus::TlbWait);

    r.dma.finish_translation(6, 0x1000, 0xa000);
    assert_eq!(*done.borrow(), vec!["span"]);
    let pages = &r.spm.borrow().copies[0].src.pages;
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[1].ppage, 0xb000);
  }

  #[test]
  fn added_entry_hits_without_network() {
    let mut r = rig();
    r.dma.add_tlb_entry(0, 0x8123, 0x4000);
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(1, load(0x8000, 4), tracker(&done, "hit")).unwrap();

    assert!(r.net.borrow().sent.is_empty());
    assert_eq!(*done.borrow(), vec!["hit"]);
    assert_eq!(r.dma.tlb_hits(), 1);
    assert_eq!(r.dma.tlb_misses(), 0);
  }

  #[test]
  fn added_entry_evicts_least_recent_in_set() {
    // 2 sets of 2 ways: 0x2000, 0x4000 and 0x6000 all map to set 0
    let mut r = rig_with(
      Box::new(SetAssocTlb::new(2, 2, PAGE).unwrap()),
      Resolution::Network {
        resolver_port: RESOLVER,
      },
    );
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.add_tlb_entry(0, 0x2000, 0xa000);
    r.dma.add_tlb_entry(1, 0x4000, 0xb000);
    r.dma.begin_transfer(2, load(0x2000, 1), tracker(&done, "old")).unwrap();

    r.dma.add_tlb_entry(3, 0x6000, 0xc000);
    assert_eq!(r.dma.probe(3, 0x4000), None);
    assert_eq!(r.dma.probe(3, 0x2000), Some(0xa000));

    r.dma.begin_transfer(4, load(0x6010, 1), tracker(&done, "new")).unwrap();
    assert_eq!(*done.borrow(), vec!["old", "new"]);
    assert!(r.net.borrow().sent.is_empty());
    assert_eq!(r.dma.tlb_hits(), 2);
    assert_eq!(r.spm.borrow().copies[1].src.pages[0].ppage, 0xc000);

    r.dma.begin_transfer(5, load(0x4000, 1), Box::new(|| {})).unwrap();
    assert_eq!(r.net.borrow().sent.len(), 1);
    assert_eq!(r.dma.tlb_misses(), 1);
  }

  #[test]
  fn added_entry_releases_waiters() {
    let mut r = rig();
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, load(0x6000, 1), tracker(&done, "w")).unwrap();
    r.dma.add_tlb_entry(4, 0x6000, 0x2000);
    assert_eq!(*done.borrow(), vec!["w"]);
    assert_eq!(r.dma.outstanding_misses(), 0);
  }

  #[test]
  fn flush_forces_new_resolution() {
    let mut r = rig();
    r.dma.add_tlb_entry(0, 0x8000, 0x4000);
    r.dma.flush_tlb();
    assert_eq!(r.dma.tlb_flushes(), 1);
    assert_eq!(r.dma.probe(1, 0x8000), None);

    r.dma.begin_transfer(2, load(0x8000, 1), Box::new(|| {})).unwrap();
    assert_eq!(r.net.borrow().sent.len(), 1);
    assert_eq!(r.dma.tlb_misses(), 1);
  }

  #[test]
  fn violation_drops_waiting_transfers() {
    let mut r = rig();
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, load(0xd000, 1), tracker(&done, "a")).unwrap();
    r.dma.begin_transfer(0, load(0xd040, 1), tracker(&done, "b")).unwrap();

    r.dma.on_network_msg(3, RESOLVER, &NetMsg::AccessViolation { vaddr: 0xd040 });
    assert_eq!(*r.violations.borrow(), vec![0xd040]);
    assert_eq!(r.dma.stats().abandoned, 2);
    assert!(r.dma.is_idle());
    assert_eq!(r.dma.status(), TransferStatus::Running);

    // a late answer finds nobody to resume
    r.dma.finish_translation(4, 0xd000, 0x1000);
    assert!(done.borrow().is_empty());
    assert!(r.spm.borrow().copies.is_empty());
  }

  #[test]
  fn abandoned_transfer_is_skipped_on_other_pages() {
    let mut r = rig();
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, load(0x1ff8, 4), tracker(&done, "span")).unwrap();
    r.dma.begin_transfer(0, load(0x2010, 1), tracker(&done, "tail")).unwrap();

    r.dma.on_access_error(0x1000);
    r.dma.finish_translation(2, 0x2000, 0x3000);
    assert_eq!(*done.borrow(), vec!["tail"]);
  }

  #[test]
  fn dropped_owner_does_not_count_a_hit() {
    let mut r = rig();
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, load(0x1ff8, 4), tracker(&done, "span")).unwrap();

    r.dma.on_access_error(0x1000);
    r.dma.finish_translation(2, 0x2000, 0x3000);
    let stats = r.dma.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.copies, 0);
    assert_eq!(stats.abandoned, 1);
    assert!(done.borrow().is_empty());
    // the fill itself is still kept
    assert_eq!(r.dma.probe(3, 0x2000), Some(0x3000));
  }

  #[test]
  fn higher_priority_is_handed_off_first() {
    let mut r = rig();
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, load(0x4000, 1), tracker(&done, "low")).unwrap();
    r.dma
      .begin_transfer_with_priority(0, load(0x4010, 1), 5, tracker(&done, "high"))
      .unwrap();
    r.dma.begin_transfer(0, load(0x4020, 1), tracker(&done, "low2")).unwrap();

    r.dma.finish_translation(1, 0x4000, 0x0);
    assert_eq!(*done.borrow(), vec!["high", "low", "low2"]);
    let prios: Vec<i32> = r.spm.borrow().copies.iter().map(|c| c.priority).collect();
    assert_eq!(prios, vec![5, 0, 0]);
  }

  #[test]
  fn mismatched_dimensions_are_refused() {
    let mut r = rig();
    let mut bad = load(0, 4);
    bad.dst_strides.push(4);
    let err = r.dma.begin_transfer(0, bad, Box::new(|| {})).unwrap_err();
    assert_eq!(
      err,
      DmaError::DimensionMismatch {
        side: "destination",
        sizes: 1,
        strides: 2
      }
    );
    let mut zero = load(0, 4);
    zero.element_size = 0;
    assert_eq!(
      r.dma.begin_transfer(0, zero, Box::new(|| {})).unwrap_err(),
      DmaError::ZeroElementSize
    );
    assert!(r.dma.is_idle());
  }

  #[test]
  fn scratchpad_only_transfer_needs_no_translation() {
    let mut r = rig();
    let mut local = load(0, 4);
    local.src = Endpoint::Scratchpad(2);
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, local, tracker(&done, "local")).unwrap();
    assert_eq!(*done.borrow(), vec!["local"]);
    assert_eq!(r.dma.tlb_hits() + r.dma.tlb_misses(), 0);
  }

  #[test]
  fn lock_signal_completes_once_across_paths() {
    let mut r = rig();
    r.dma.add_tlb_entry(0, 0x9000, 0x1000);
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma
      .begin_single_element_transfer(1, 1, 0x10, 0x9008, 8, AccessType::WriteLock, tracker(&done, "lock"))
      .unwrap();

    let req = r.spm.borrow().singles[0].clone();
    assert_eq!(req.phys_addr, 0x1008);
    assert_eq!(req.memory_addr(), 0x9008);
    assert!(done.borrow().is_empty());

    assert_eq!(r.dma.on_signal(SignalPath::Local, req.signal), SignalOutcome::Fired);
    r.dma.on_network_msg(2, 7, &NetMsg::Signal(req.signal));
    assert_eq!(*done.borrow(), vec!["lock"]);
    assert!(r.dma.is_idle());
  }

  #[test]
  fn prefetch_only_warms_the_tlb() {
    let mut r = rig();
    r.dma
      .prefetch_memory(0, StridedRegion::new(0x10000, vec![2], vec![1024]), 4)
      .unwrap();
    assert_eq!(r.dma.outstanding_misses(), 2);
    r.dma.finish_translation(1, 0x10000, 0x20000);
    r.dma.finish_translation(1, 0x11000, 0x21000);
    assert!(r.spm.borrow().copies.is_empty());
    assert_eq!(r.dma.stats().prefetches, 1);
    assert_eq!(r.dma.probe(2, 0x11004), Some(0x21004));
  }

  #[test]
  fn buffer_tags_later_copies() {
    let mut r = rig();
    let mut local = load(0, 1);
    local.src = Endpoint::Scratchpad(0);
    r.dma.set_buffer(2);
    r.dma.begin_transfer(0, local, Box::new(|| {})).unwrap();
    assert_eq!(r.spm.borrow().copies[0].buffer, 2);
  }

  #[test]
  fn hook_once() {
    let mut r = rig();
    assert_eq!(r.dma.device_name(), "dma03");
    r.dma.hook_to_memory_controller("mc0").unwrap();
    assert_eq!(
      r.dma.hook_to_memory_controller("mc1").unwrap_err(),
      DmaError::AlreadyHooked("mc0".into())
    );
    assert_eq!(r.spm.borrow().hooks, vec![("dma03".to_string(), "mc0".to_string())]);
  }

  #[test]
  fn local_resolution_raises_callback() {
    let mut r = rig_with(Box::new(SetAssocTlb::with_capacity(4, 0, PAGE).unwrap()), Resolution::Local);
    r.dma.begin_transfer(0, load(0x2000, 1), Box::new(|| {})).unwrap();
    assert_eq!(*r.misses.borrow(), vec![0x2000]);
    assert!(r.net.borrow().sent.is_empty());
  }

  #[test]
  fn infinite_tlb_still_completes() {
    let tlb = InfiniteTlb::with_entries([(0x1000, 0x8000)]);
    let mut r = rig_with(
      Box::new(tlb),
      Resolution::Network {
        resolver_port: RESOLVER,
      },
    );
    let done = Rc::new(RefCell::new(Vec::new()));
    r.dma.begin_transfer(0, load(0x1000, 1), tracker(&done, "pre")).unwrap();
    r.dma.begin_transfer(0, load(0x5000, 1), tracker(&done, "miss")).unwrap();
    r.dma.finish_translation(3, 0x5000, 0x6000);
    assert_eq!(*done.borrow(), vec!["pre", "miss"]);
    // inert insert: the fill is never retained
    assert_eq!(r.dma.probe(4, 0x5000), None);
    assert_eq!(r.spm.borrow().copies[1].src.pages[0].ppage, 0x6000);
  }
}
