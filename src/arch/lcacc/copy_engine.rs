use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{ModelMessage, ModelRecord};
use sim::simulator::Services;
use sim::utils::errors::SimulationError;
use std::collections::{BTreeMap, VecDeque};

use super::delay::DelayLine;
use super::dma_model::EngineCmd;
use super::net::{NetEnvelope, NetMsg};
use super::spm::SingleElementRequest;
use super::transfer::AccessType;
use crate::model_record;

#[derive(Debug, Clone, Default)]
struct LockState {
  readers: u32,
  writer: bool,
  waiting: VecDeque<SingleElementRequest>,
}

impl LockState {
  fn is_free(&self) -> bool {
    self.readers == 0 && !self.writer && self.waiting.is_empty()
  }

  fn try_take(&mut self, access: AccessType) -> bool {
    match access {
      AccessType::ReadLock if !self.writer => {
        self.readers += 1;
        true
      },
      AccessType::WriteLock if !self.writer && self.readers == 0 => {
        self.writer = true;
        true
      },
      _ => false,
    }
  }

  fn release(&mut self, access: AccessType) {
    match access {
      AccessType::WriteUnlock => self.writer = false,
      _ if self.writer => self.writer = false,
      _ => self.readers = self.readers.saturating_sub(1),
    }
  }
}

/// Reader/writer locks on host memory words, keyed by physical address.
/// Blocked lock requests are granted strictly in arrival order.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
  locks: BTreeMap<u64, LockState>,
}

impl LockTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns every request that may proceed now: `req` itself unless it has
  /// to wait, plus whoever an unlock lets through.
  pub fn admit(&mut self, req: SingleElementRequest) -> Vec<SingleElementRequest> {
    let addr = req.phys_addr;
    let access = req.access;
    match access {
      AccessType::Read | AccessType::Write => vec![req],
      AccessType::ReadLock | AccessType::WriteLock => {
        let state = self.locks.entry(addr).or_default();
        if state.waiting.is_empty() && state.try_take(access) {
          vec![req]
        } else {
          state.waiting.push_back(req);
          Vec::new()
        }
      },
      AccessType::WriteUnlock | AccessType::Unlock => {
        let mut granted = vec![req];
        if let Some(state) = self.locks.get_mut(&addr) {
          state.release(access);
          while let Some(next) = state.waiting.front().map(|r| r.access) {
            if !state.try_take(next) {
              break;
            }
            granted.extend(state.waiting.pop_front());
          }
          if state.is_free() {
            self.locks.remove(&addr);
          }
        }
        granted
      },
    }
  }

  pub fn blocked(&self) -> usize {
    self.locks.values().map(|s| s.waiting.len()).sum()
  }

  pub fn held(&self, addr: u64) -> (u32, bool) {
    self.locks.get(&addr).map_or((0, false), |s| (s.readers, s.writer))
  }
}

/// Scratchpad/memory copy engine. Block copies are tallied on arrival;
/// single-element ops go through the lock table and report back through the
/// local signal port after `element_cycles`, lock-class ops also over the
/// network.
#[derive(Debug, Clone)]
pub struct CopyEngineModel {
  request_port: String,
  signal_local_port: String,
  net_out_port: String,

  network_port: u32,
  dma_port: u32,
  element_cycles: f64,
  locks: LockTable,
  outputs: DelayLine,
  bytes_copied: u64,
  memory_controller: Option<String>,

  until_next_event: f64,
  records: Vec<ModelRecord>,
}

impl CopyEngineModel {
  pub fn new(
    request_port: String,
    signal_local_port: String,
    net_out_port: String,
    network_port: u32,
    dma_port: u32,
    element_cycles: f64,
  ) -> Self {
    Self {
      request_port,
      signal_local_port,
      net_out_port,
      network_port,
      dma_port,
      element_cycles,
      locks: LockTable::new(),
      outputs: DelayLine::new(),
      bytes_copied: 0,
      memory_controller: None,
      until_next_event: f64::INFINITY,
      records: Vec::new(),
    }
  }

  fn finish_single(&mut self, due: f64, req: &SingleElementRequest) -> Result<(), SimulationError> {
    let key = serde_json::to_string(&req.signal).map_err(|_| SimulationError::InvalidModelState)?;
    self.outputs.push(due, &self.signal_local_port, key);
    if req.access.is_lock_op() {
      let env = NetEnvelope {
        src: self.network_port,
        dst: self.dma_port,
        msg: NetMsg::Signal(req.signal),
      };
      let content = serde_json::to_string(&env).map_err(|_| SimulationError::InvalidModelState)?;
      self.outputs.push(due, &self.net_out_port, content);
    }
    Ok(())
  }
}

impl DevsModel for CopyEngineModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    if incoming_message.port_name != self.request_port {
      return Err(SimulationError::InvalidModelState);
    }
    let now = services.global_time();
    let cmd: EngineCmd =
      serde_json::from_str(&incoming_message.content).map_err(|_| SimulationError::InvalidModelState)?;

    match cmd {
      EngineCmd::Copy(req) => {
        let elements = req.src.region.element_count().max(req.dst.region.element_count());
        self.bytes_copied += req.bytes();
        model_record!(
          self,
          services,
          "copy",
          format!("{} buffer={} elements={}", req.id, req.buffer, elements)
        );
      },
      EngineCmd::Single(req) => {
        let due = now + self.element_cycles.max(1.0);
        let addr = req.phys_addr;
        let granted = self.locks.admit(req);
        if granted.is_empty() {
          model_record!(self, services, "lock_wait", format!("{:#x}", addr));
        }
        for r in &granted {
          self.bytes_copied += r.size as u64;
          self.finish_single(due, r)?;
          model_record!(self, services, "single", format!("{:?} {:#x}", r.access, r.phys_addr));
        }
      },
      EngineCmd::Hook { dma, memory_controller } => {
        model_record!(self, services, "hook", format!("{} -> {}", dma, memory_controller));
        self.memory_controller = Some(memory_controller);
      },
    }

    self.until_next_event = self.outputs.until_next(now);
    Ok(())
  }

  fn events_int(&mut self, services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    let now = services.global_time();
    let messages = self.outputs.pop_due(now);
    self.until_next_event = self.outputs.until_next(now);
    Ok(messages)
  }

  fn time_advance(&mut self, time_delta: f64) {
    self.until_next_event -= time_delta;
  }

  fn until_next_event(&self) -> f64 {
    self.until_next_event
  }
}

impl Reportable for CopyEngineModel {
  fn status(&self) -> String {
    format!(
      "bytes={}, blocked={}, mc={}",
      self.bytes_copied,
      self.locks.blocked(),
      self.memory_controller.as_deref().unwrap_or("-")
    )
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for CopyEngineModel {}

impl SerializableModel for CopyEngineModel {
  fn get_type(&self) -> &'static str {
    "CopyEngineModel"
  }
}
