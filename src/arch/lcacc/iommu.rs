use serde::{Deserialize, Serialize};
use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{ModelMessage, ModelRecord};
use sim::simulator::Services;
use sim::utils::errors::SimulationError;
use std::collections::BTreeMap;

use super::delay::DelayLine;
use super::dma_model::{Fault, TlbFillCmd};
use super::net::{NetEnvelope, NetMsg};
use crate::model_record;

/// Half-open virtual address range the resolver refuses to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrRange {
  pub start: u64,
  pub end: u64,
}

impl AddrRange {
  pub fn contains(&self, addr: u64) -> bool {
    self.start <= addr && addr < self.end
  }
}

/// Resolver-side view of the host address space.
#[derive(Debug, Clone)]
pub struct PageTable {
  page_size: u64,
  mappings: BTreeMap<u64, u64>,
  /// Pages without an explicit mapping resolve to `vpage + offset`
  identity_offset: Option<u64>,
  protected: Vec<AddrRange>,
}

impl PageTable {
  pub fn new(page_size: u64, identity_offset: Option<u64>, protected: Vec<AddrRange>) -> Self {
    Self {
      page_size,
      mappings: BTreeMap::new(),
      identity_offset,
      protected,
    }
  }

  pub fn map(&mut self, vaddr: u64, paddr: u64) {
    let mask = !(self.page_size - 1);
    self.mappings.insert(vaddr & mask, paddr & mask);
  }

  /// Physical page for `vpage`, or `None` for an access violation.
  pub fn resolve(&self, vpage: u64) -> Option<u64> {
    if self.protected.iter().any(|r| r.contains(vpage)) {
      return None;
    }
    self
      .mappings
      .get(&vpage)
      .copied()
      .or_else(|| self.identity_offset.map(|off| vpage.wrapping_add(off)))
  }
}

/// Translation service node. Answers network translation requests after
/// `latency` cycles, and services locally raised misses with a TLB fill.
#[derive(Debug, Clone)]
pub struct IommuModel {
  request_port: String,
  miss_port: String,
  response_port: String,
  fill_port: String,

  network_port: u32,
  latency: f64,
  table: PageTable,
  outputs: DelayLine,
  served: u64,
  refused: u64,

  until_next_event: f64,
  records: Vec<ModelRecord>,
}

impl IommuModel {
  pub fn new(
    request_port: String,
    miss_port: String,
    response_port: String,
    fill_port: String,
    network_port: u32,
    latency: f64,
    table: PageTable,
  ) -> Self {
    Self {
      request_port,
      miss_port,
      response_port,
      fill_port,
      network_port,
      latency,
      table,
      outputs: DelayLine::new(),
      served: 0,
      refused: 0,
      until_next_event: f64::INFINITY,
      records: Vec::new(),
    }
  }

  fn reply(&mut self, now: f64, requester: u32, msg: NetMsg) -> Result<(), SimulationError> {
    let env = NetEnvelope {
      src: self.network_port,
      dst: requester,
      msg,
    };
    let content = serde_json::to_string(&env).map_err(|_| SimulationError::InvalidModelState)?;
    self.outputs.push(now + self.latency, &self.response_port, content);
    Ok(())
  }
}

impl DevsModel for IommuModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    let now = services.global_time();

    if incoming_message.port_name == self.request_port {
      let env: NetEnvelope =
        serde_json::from_str(&incoming_message.content).map_err(|_| SimulationError::InvalidModelState)?;
      let NetMsg::TranslationRequest { vpage, requester } = env.msg else {
        log::warn!("iommu ignoring {:?} from node {}", env.msg, env.src);
        return Ok(());
      };
      match self.table.resolve(vpage) {
        Some(ppage) => {
          self.served += 1;
          self.reply(now, requester, NetMsg::TranslationResponse { vpage, ppage })?;
          model_record!(self, services, "translate", format!("{:#x} -> {:#x}", vpage, ppage));
        },
        None => {
          self.refused += 1;
          self.reply(now, requester, NetMsg::AccessViolation { vaddr: vpage })?;
          model_record!(self, services, "violation", format!("{:#x}", vpage));
        },
      }
    } else if incoming_message.port_name == self.miss_port {
      let fault: Fault =
        serde_json::from_str(&incoming_message.content).map_err(|_| SimulationError::InvalidModelState)?;
      match fault {
        Fault::TlbMiss { vpage, requester } => match self.table.resolve(vpage) {
          Some(ppage) => {
            self.served += 1;
            let fill = TlbFillCmd {
              vaddr: vpage,
              paddr: ppage,
            };
            let content = serde_json::to_string(&fill).map_err(|_| SimulationError::InvalidModelState)?;
            self.outputs.push(now + self.latency, &self.fill_port, content);
            model_record!(self, services, "tlb_service", format!("{:#x} -> {:#x}", vpage, ppage));
          },
          None => {
            self.refused += 1;
            self.reply(now, requester, NetMsg::AccessViolation { vaddr: vpage })?;
            model_record!(self, services, "violation", format!("{:#x}", vpage));
          },
        },
        Fault::AccessViolation { vaddr } => {
          model_record!(self, services, "violation_reported", format!("{:#x}", vaddr));
        },
      }
    } else {
      return Err(SimulationError::InvalidModelState);
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

impl Reportable for IommuModel {
  fn status(&self) -> String {
    format!("served={}, refused={}", self.served, self.refused)
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for IommuModel {}

impl SerializableModel for IommuModel {
  fn get_type(&self) -> &'static str {
    "IommuModel"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn explicit_mapping_wins_over_identity() {
    let mut table = PageTable::new(4096, Some(0x1_0000_0000), vec![AddrRange { start: 0xf000, end: 0x10000 }]);
    table.map(0x2abc, 0x9000);
    assert_eq!(table.resolve(0x2000), Some(0x9000));
    assert_eq!(table.resolve(0x3000), Some(0x1_0000_3000));
    assert_eq!(table.resolve(0xf000), None);
  }

  #[test]
  fn unmapped_without_identity_is_refused() {
    let table = PageTable::new(4096, None, Vec::new());
    assert_eq!(table.resolve(0x1000), None);
  }
}
