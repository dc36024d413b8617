use serde::{Deserialize, Serialize};

use super::signal::SignalKey;

/// Messages exchanged between the DMA controller and the rest of the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetMsg {
  TranslationRequest { vpage: u64, requester: u32 },
  TranslationResponse { vpage: u64, ppage: u64 },
  AccessViolation { vaddr: u64 },
  /// Lock / completion notification relayed by a remote party
  Signal(SignalKey),
  TlbFill { vaddr: u64, paddr: u64 },
  TlbFlush,
}

/// A routed network message, as carried on simulation ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetEnvelope {
  pub src: u32,
  pub dst: u32,
  pub msg: NetMsg,
}

/// Network transport the controller sends through.
///
/// Inbound traffic is handed to `DmaController::on_network_msg` by whoever
/// owns the receive side.
pub trait NetworkInterface {
  fn network_port(&self) -> u32;
  fn send(&mut self, dst: u32, msg: NetMsg);
}
