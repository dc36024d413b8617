use serde::{Deserialize, Serialize};

use super::signal::SignalKey;
use super::transfer::{AccessType, Endpoint, PageMapping, StridedRegion, TransferId};

/// One side of a copy with every host page already translated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
  pub endpoint: Endpoint,
  pub region: StridedRegion,
  /// Empty for scratchpad endpoints
  pub pages: Vec<PageMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
  pub id: TransferId,
  pub buffer: u32,
  pub src: ResolvedEndpoint,
  pub dst: ResolvedEndpoint,
  pub element_size: u32,
  pub priority: i32,
}

impl CopyRequest {
  pub fn bytes(&self) -> u64 {
    self.src.region.element_count() * self.element_size as u64
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleElementRequest {
  /// Identity the copy engine reports back on completion / lock grant
  pub signal: SignalKey,
  pub spm: u32,
  pub access: AccessType,
  pub src: u64,
  pub dst: u64,
  pub size: u32,
  /// Physical address of the host memory word
  pub phys_addr: u64,
  pub buffer: u32,
}

impl SingleElementRequest {
  /// Host memory address the access targets, before translation.
  pub fn memory_addr(&self) -> u64 {
    if self.access.reads_memory() {
      self.src
    } else {
      self.dst
    }
  }
}

/// Scratchpad / memory copy engine the controller delegates the byte moves to.
pub trait SpmInterface {
  fn begin_copy(&mut self, req: CopyRequest);
  fn begin_single_element(&mut self, req: SingleElementRequest);
  /// Routes this DMA engine's memory traffic through a named memory controller.
  fn hook(&mut self, dma_device: &str, memory_controller: &str);
}
