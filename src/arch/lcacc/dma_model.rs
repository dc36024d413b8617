use serde::{Deserialize, Serialize};
use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{ModelMessage, ModelRecord};
use sim::simulator::Services;
use sim::utils::errors::SimulationError;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::f64::INFINITY;
use std::rc::Rc;

use super::dma_ctrl::{BlockTransfer, DmaController};
use super::net::{NetEnvelope, NetMsg, NetworkInterface};
use super::signal::{SignalKey, SignalPath};
use super::spm::{CopyRequest, SingleElementRequest, SpmInterface};
use super::tlb::Tick;
use super::transfer::{AccessType, StridedRegion};
use crate::model_record;

/// Requests accepted on the `transfer_req` port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DmaCommand {
  Transfer {
    tag: u64,
    transfer: BlockTransfer,
  },
  Single {
    tag: u64,
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
  SetBuffer {
    buffer: u32,
  },
  Hook {
    device: String,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlbFillCmd {
  pub vaddr: u64,
  pub paddr: u64,
}

/// Emitted on `fault` for whoever services misses and violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
  TlbMiss { vpage: u64, requester: u32 },
  AccessViolation { vaddr: u64 },
}

/// Emitted on `done` once a submitted transfer's callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
  pub tag: u64,
}

/// Everything the copy engine is asked to do, as carried on `copy_req`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EngineCmd {
  Copy(CopyRequest),
  Single(SingleElementRequest),
  Hook { dma: String, memory_controller: String },
}

/// Side effects the controller produced since the last internal event.
#[derive(Debug, Default)]
pub struct Outbox {
  pub net: VecDeque<NetEnvelope>,
  pub engine: VecDeque<EngineCmd>,
  pub done: VecDeque<Completion>,
  pub faults: VecDeque<Fault>,
}

impl Outbox {
  pub fn is_empty(&self) -> bool {
    self.net.is_empty() && self.engine.is_empty() && self.done.is_empty() && self.faults.is_empty()
  }
}

pub type SharedOutbox = Rc<RefCell<Outbox>>;

/// Network side of the controller inside the simulation: sends are parked in
/// the outbox and leave through `net_out`.
pub struct PortNetwork {
  port: u32,
  outbox: SharedOutbox,
}

impl PortNetwork {
  pub fn new(port: u32, outbox: SharedOutbox) -> Self {
    Self { port, outbox }
  }
}

impl NetworkInterface for PortNetwork {
  fn network_port(&self) -> u32 {
    self.port
  }

  fn send(&mut self, dst: u32, msg: NetMsg) {
    self.outbox.borrow_mut().net.push_back(NetEnvelope {
      src: self.port,
      dst,
      msg,
    });
  }
}

pub struct PortSpm {
  outbox: SharedOutbox,
}

impl PortSpm {
  pub fn new(outbox: SharedOutbox) -> Self {
    Self { outbox }
  }
}

impl SpmInterface for PortSpm {
  fn begin_copy(&mut self, req: CopyRequest) {
    self.outbox.borrow_mut().engine.push_back(EngineCmd::Copy(req));
  }

  fn begin_single_element(&mut self, req: SingleElementRequest) {
    self.outbox.borrow_mut().engine.push_back(EngineCmd::Single(req));
  }

  fn hook(&mut self, dma_device: &str, memory_controller: &str) {
    self.outbox.borrow_mut().engine.push_back(EngineCmd::Hook {
      dma: dma_device.to_string(),
      memory_controller: memory_controller.to_string(),
    });
  }
}

#[derive(Debug, Clone)]
pub struct DmaPorts {
  pub transfer_req: String,
  pub net_in: String,
  pub signal_local: String,
  pub tlb_fill: String,
  pub tlb_flush: String,
  pub net_out: String,
  pub copy_req: String,
  pub done: String,
  pub fault: String,
}

impl Default for DmaPorts {
  fn default() -> Self {
    Self {
      transfer_req: String::from("transfer_req"),
      net_in: String::from("net_in"),
      signal_local: String::from("signal_local"),
      tlb_fill: String::from("tlb_fill"),
      tlb_flush: String::from("tlb_flush"),
      net_out: String::from("net_out"),
      copy_req: String::from("copy_req"),
      done: String::from("done"),
      fault: String::from("fault"),
    }
  }
}

fn parse<'a, T: Deserialize<'a>>(content: &'a str) -> Result<T, SimulationError> {
  serde_json::from_str(content).map_err(|_| SimulationError::InvalidModelState)
}

fn encode<T: Serialize>(value: &T) -> Result<String, SimulationError> {
  serde_json::to_string(value).map_err(|_| SimulationError::InvalidModelState)
}

/// Wraps a [`DmaController`] as a DEVS model. Everything the controller
/// hands to its collaborators leaves through the output ports after
/// `latency` cycles.
#[derive(Clone)]
pub struct DmaModel {
  ports: DmaPorts,
  ctrl: Rc<RefCell<DmaController>>,
  outbox: SharedOutbox,
  latency: f64,
  until_next_event: f64,
  records: Vec<ModelRecord>,
}

impl DmaModel {
  pub fn new(ports: DmaPorts, ctrl: Rc<RefCell<DmaController>>, outbox: SharedOutbox) -> Self {
    let latency = ctrl.borrow().config().hit_latency.max(1) as f64;
    Self {
      ports,
      ctrl,
      outbox,
      latency,
      until_next_event: INFINITY,
      records: Vec::new(),
    }
  }

  fn completion(&self, tag: u64) -> Box<dyn FnOnce()> {
    let outbox = Rc::clone(&self.outbox);
    Box::new(move || outbox.borrow_mut().done.push_back(Completion { tag }))
  }

  fn run_command(&mut self, now: Tick, cmd: DmaCommand, services: &Services) -> Result<(), SimulationError> {
    let result = match cmd {
      DmaCommand::Transfer { tag, transfer } => {
        let on_finish = self.completion(tag);
        model_record!(self, services, "begin_transfer", format!("tag={}", tag));
        self.ctrl.borrow_mut().begin_transfer(now, transfer, on_finish).map(|_| ())
      },
      DmaCommand::Single {
        tag,
        spm,
        src,
        dst,
        size,
        access,
      } => {
        let on_finish = self.completion(tag);
        model_record!(self, services, "begin_single", format!("tag={}, access={:?}", tag, access));
        self
          .ctrl
          .borrow_mut()
          .begin_single_element_transfer(now, spm, src, dst, size, access, on_finish)
          .map(|_| ())
      },
      DmaCommand::Prefetch { region, element_size } => {
        model_record!(self, services, "prefetch", format!("base={:#x}", region.base));
        self.ctrl.borrow_mut().prefetch_memory(now, region, element_size).map(|_| ())
      },
      DmaCommand::SetBuffer { buffer } => {
        self.ctrl.borrow_mut().set_buffer(buffer);
        Ok(())
      },
      DmaCommand::Hook { device } => self.ctrl.borrow_mut().hook_to_memory_controller(&device),
    };

    if let Err(e) = result {
      log::error!("rejected dma command: {}", e);
      model_record!(self, services, "reject", e);
    }
    Ok(())
  }
}

impl DevsModel for DmaModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    let now = services.global_time() as Tick;
    let port = incoming_message.port_name.as_str();

    if port == self.ports.transfer_req {
      let cmd: DmaCommand = parse(&incoming_message.content)?;
      self.run_command(now, cmd, services)?;
    } else if port == self.ports.net_in {
      let env: NetEnvelope = parse(&incoming_message.content)?;
      let local = self.ctrl.borrow().network_port();
      if env.dst != local {
        log::debug!("dma{:02} dropping message for node {}", local, env.dst);
        return Ok(());
      }
      self.ctrl.borrow_mut().on_network_msg(now, env.src, &env.msg);
      model_record!(self, services, "net_in", format!("from={}", env.src));
    } else if port == self.ports.signal_local {
      let key: SignalKey = parse(&incoming_message.content)?;
      let outcome = self.ctrl.borrow_mut().on_signal(SignalPath::Local, key);
      model_record!(self, services, "signal_local", format!("id={}, {:?}", key.id, outcome));
    } else if port == self.ports.tlb_fill {
      let fill: TlbFillCmd = parse(&incoming_message.content)?;
      self.ctrl.borrow_mut().add_tlb_entry(now, fill.vaddr, fill.paddr);
      model_record!(self, services, "tlb_fill", format!("{:#x} -> {:#x}", fill.vaddr, fill.paddr));
    } else if port == self.ports.tlb_flush {
      self.ctrl.borrow_mut().flush_tlb();
      model_record!(self, services, "tlb_flush", "");
    } else {
      return Err(SimulationError::InvalidModelState);
    }

    if !self.outbox.borrow().is_empty() && self.until_next_event == INFINITY {
      self.until_next_event = self.latency;
    }
    Ok(())
  }

  fn events_int(&mut self, services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    let mut messages = Vec::new();
    let mut outbox = self.outbox.borrow_mut();

    while let Some(env) = outbox.net.pop_front() {
      messages.push(ModelMessage {
        content: encode(&env)?,
        port_name: self.ports.net_out.clone(),
      });
    }
    while let Some(cmd) = outbox.engine.pop_front() {
      messages.push(ModelMessage {
        content: encode(&cmd)?,
        port_name: self.ports.copy_req.clone(),
      });
    }
    while let Some(done) = outbox.done.pop_front() {
      messages.push(ModelMessage {
        content: encode(&done)?,
        port_name: self.ports.done.clone(),
      });
      self.records.push(ModelRecord {
        time: services.global_time(),
        action: "done".to_string(),
        subject: format!("tag={}", done.tag),
      });
    }
    while let Some(fault) = outbox.faults.pop_front() {
      messages.push(ModelMessage {
        content: encode(&fault)?,
        port_name: self.ports.fault.clone(),
      });
    }

    self.until_next_event = INFINITY;
    Ok(messages)
  }

  fn time_advance(&mut self, time_delta: f64) {
    self.until_next_event -= time_delta;
  }

  fn until_next_event(&self) -> f64 {
    self.until_next_event
  }
}

impl Reportable for DmaModel {
  fn status(&self) -> String {
    let ctrl = self.ctrl.borrow();
    format!(
      "{:?}, in_flight={}, outstanding={}",
      ctrl.status(),
      ctrl.in_flight(),
      ctrl.outstanding_misses()
    )
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for DmaModel {}

impl SerializableModel for DmaModel {
  fn get_type(&self) -> &'static str {
    "DmaModel"
  }
}
