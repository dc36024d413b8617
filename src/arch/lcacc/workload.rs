use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{ModelMessage, ModelRecord};
use sim::simulator::Services;
use sim::utils::errors::SimulationError;
use std::cell::RefCell;
use std::f64::INFINITY;
use std::fs;
use std::io;
use std::rc::Rc;

use super::dma_model::{Completion, DmaCommand};
use super::program;
use super::transfer::StridedRegion;
use crate::model_record;
use crate::simulator::config::config::WorkloadSection;

const EPS: f64 = 1e-9;

/// Completed transfer tags with the time their `done` message arrived.
pub type CompletionLog = Rc<RefCell<Vec<(f64, u64)>>>;

/// One timed message the workload sends into the DMA controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
  pub at: f64,
  pub port: WorkloadPort,
  pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPort {
  Request,
  Flush,
}

fn command(at: f64, cmd: &DmaCommand) -> io::Result<Injection> {
  let content = serde_json::to_string(cmd).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
  Ok(Injection {
    at,
    port: WorkloadPort::Request,
    content,
  })
}

/// Turns the workload section into a time-ordered injection list. Tags are
/// handed out in order: microprogram transfers, configured block transfers,
/// then single-element accesses.
pub fn build_injections(workload: &WorkloadSection, memory_controller: &str) -> io::Result<Vec<Injection>> {
  let mut injections = Vec::new();
  let mut tag = 0u64;

  if !memory_controller.is_empty() {
    injections.push(command(
      0.0,
      &DmaCommand::Hook {
        device: memory_controller.to_string(),
      },
    )?);
  }

  if !workload.program.is_empty() {
    let buf = fs::read(&workload.program)
      .map_err(|e| io::Error::new(e.kind(), format!("cannot read program {}: {}", workload.program, e)))?;
    let prog = program::decode(&buf, workload.header)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", workload.program, e)))?;
    log::info!(
      "loaded {}: {} transfers, {} computes, {} tasks",
      workload.program,
      prog.transfers.len(),
      prog.computes.len(),
      prog.header.num_tasks()
    );
    for transfer in prog.block_transfers() {
      injections.push(command(0.0, &DmaCommand::Transfer { tag, transfer })?);
      tag += 1;
    }
  }

  for t in &workload.transfers {
    injections.push(command(
      t.at,
      &DmaCommand::Transfer {
        tag,
        transfer: t.transfer.clone(),
      },
    )?);
    tag += 1;
  }

  for s in &workload.single_elements {
    injections.push(command(
      s.at,
      &DmaCommand::Single {
        tag,
        spm: s.spm,
        src: s.src,
        dst: s.dst,
        size: s.size,
        access: s.access,
      },
    )?);
    tag += 1;
  }

  for p in &workload.prefetches {
    injections.push(command(
      p.at,
      &DmaCommand::Prefetch {
        region: StridedRegion::new(p.base, p.sizes.clone(), p.strides.clone()),
        element_size: p.element_size,
      },
    )?);
  }

  for at in &workload.flush_at {
    injections.push(Injection {
      at: *at,
      port: WorkloadPort::Flush,
      content: String::from("flush"),
    });
  }

  // stable, so same-time injections keep the order above
  injections.sort_by(|a, b| a.at.total_cmp(&b.at));
  Ok(injections)
}

/// Replays a fixed injection list into the DMA controller and logs every
/// completion it gets back.
#[derive(Debug, Clone)]
pub struct WorkloadModel {
  request_port: String,
  flush_port: String,
  done_port: String,

  pending: Vec<Injection>,
  next: usize,
  completions: CompletionLog,

  until_next_event: f64,
  records: Vec<ModelRecord>,
}

impl WorkloadModel {
  pub fn new(
    request_port: String,
    flush_port: String,
    done_port: String,
    injections: Vec<Injection>,
    completions: CompletionLog,
  ) -> Self {
    let until_next_event = injections.first().map_or(INFINITY, |i| i.at.max(0.0));
    Self {
      request_port,
      flush_port,
      done_port,
      pending: injections,
      next: 0,
      completions,
      until_next_event,
      records: Vec::new(),
    }
  }

  pub fn remaining(&self) -> usize {
    self.pending.len() - self.next
  }

  fn schedule(&mut self, now: f64) {
    self.until_next_event = self
      .pending
      .get(self.next)
      .map_or(INFINITY, |i| (i.at - now).max(0.0));
  }
}

impl DevsModel for WorkloadModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    if incoming_message.port_name != self.done_port {
      return Err(SimulationError::InvalidModelState);
    }
    let done: Completion =
      serde_json::from_str(&incoming_message.content).map_err(|_| SimulationError::InvalidModelState)?;
    self.completions.borrow_mut().push((services.global_time(), done.tag));
    model_record!(self, services, "done", format!("tag={}", done.tag));
    Ok(())
  }

  fn events_int(&mut self, services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    let now = services.global_time();
    let mut messages = Vec::new();

    while let Some(inj) = self.pending.get(self.next) {
      if inj.at > now + EPS {
        break;
      }
      let port_name = match inj.port {
        WorkloadPort::Request => self.request_port.clone(),
        WorkloadPort::Flush => self.flush_port.clone(),
      };
      messages.push(ModelMessage {
        content: inj.content.clone(),
        port_name,
      });
      self.next += 1;
    }
    model_record!(self, services, "inject", format!("{} messages", messages.len()));

    self.schedule(now);
    Ok(messages)
  }

  fn time_advance(&mut self, time_delta: f64) {
    self.until_next_event -= time_delta;
  }

  fn until_next_event(&self) -> f64 {
    self.until_next_event
  }
}

impl Reportable for WorkloadModel {
  fn status(&self) -> String {
    format!(
      "remaining={}, completed={}",
      self.remaining(),
      self.completions.borrow().len()
    )
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for WorkloadModel {}

impl SerializableModel for WorkloadModel {
  fn get_type(&self) -> &'static str {
    "WorkloadModel"
  }
}
