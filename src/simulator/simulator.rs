use sim::simulator::Simulation;
use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Result};
use std::rc::Rc;

use super::config::config::AppConfig;
use super::sim::mode::{SimConfig, StepMode};
use super::sim::model::{model_step, StepResult};
use super::sim::shell::{Command, Shell};
use super::utils::log::set_quiet;
use super::utils::report::{print_dma_stats, print_simulation_records};
use crate::arch::lcacc::{create_simulation, DmaController, DmaStats, SimHandles};

/// Why a run came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  Idle,
  TimeLimit,
  Quit,
}

pub struct Simulator {
  config: SimConfig,
  simulation: Simulation,
  handles: SimHandles,
  trace_writer: Option<BufWriter<File>>,
  steps: u64,
}

impl Simulator {
  pub fn new(config: SimConfig, app_config: &AppConfig) -> Result<Self> {
    let (simulation, handles) = create_simulation(app_config)?;
    let trace_writer = match &config.trace_file {
      Some(path) if !path.is_empty() => Some(BufWriter::new(File::create(path)?)),
      _ => None,
    };
    Ok(Self {
      config,
      simulation,
      handles,
      trace_writer,
      steps: 0,
    })
  }

  pub fn from_app_config(app_config: &AppConfig) -> Result<Self> {
    let sim = &app_config.simulation;
    let config = SimConfig {
      quiet: sim.quiet,
      step_mode: if sim.step_mode {
        StepMode::Step
      } else {
        StepMode::Continuous
      },
      trace_file: if sim.trace_file.is_empty() {
        None
      } else {
        Some(sim.trace_file.clone())
      },
      max_time: sim.max_time,
    };
    Self::new(config, app_config)
  }

  pub fn run(&mut self) -> Result<StopReason> {
    set_quiet(self.config.quiet);
    let reason = match self.config.step_mode {
      StepMode::Continuous => self.run_continuous()?,
      StepMode::Step => self.run_step_mode()?,
    };
    log::info!(
      "stopped ({:?}) at t={:.1} after {} steps",
      reason,
      self.simulation.get_global_time(),
      self.steps
    );
    Ok(reason)
  }

  fn run_continuous(&mut self) -> Result<StopReason> {
    loop {
      if let Some(reason) = self.step()? {
        return Ok(reason);
      }
    }
  }

  fn run_step_mode(&mut self) -> Result<StopReason> {
    let mut shell = Shell::new()?;
    println!("Step mode - {}", Shell::help());
    loop {
      match shell.read_command()? {
        Command::Step(n) => {
          for _ in 0..n {
            if let Some(reason) = self.step()? {
              return Ok(reason);
            }
          }
          println!("t={:.1} {}", self.simulation.get_global_time(), self.status_line());
        },
        Command::Stats => print_dma_stats(&self.stats()),
        Command::Probe(vaddr) => {
          let now = self.simulation.get_global_time() as u64;
          match self.handles.dma.borrow_mut().probe(now, vaddr) {
            Some(paddr) => println!("{:#x} -> {:#x}", vaddr, paddr),
            None => println!("{:#x} not cached", vaddr),
          }
        },
        Command::Continue => return self.run_continuous(),
        Command::Quit => return Ok(StopReason::Quit),
      }
    }
  }

  /// Advances one event time. `Some` once the run is over.
  pub fn step(&mut self) -> Result<Option<StopReason>> {
    match model_step(&mut self.simulation, &mut self.trace_writer, self.config.max_time)? {
      StepResult::Advanced => {
        self.steps += 1;
      },
      StepResult::Idle => return Ok(Some(StopReason::Idle)),
      StepResult::Horizon => {
        log::warn!("time limit {:.1} reached with work outstanding", self.config.max_time);
        return Ok(Some(StopReason::TimeLimit));
      },
    }
    Ok(None)
  }

  fn status_line(&self) -> String {
    let dma = self.handles.dma.borrow();
    format!(
      "{:?} in_flight={} outstanding={} completed={}",
      dma.status(),
      dma.in_flight(),
      dma.outstanding_misses(),
      self.handles.completions.borrow().len()
    )
  }

  pub fn report(&mut self) {
    print_simulation_records(&mut self.simulation);
    print_dma_stats(&self.stats());
  }

  pub fn stats(&self) -> DmaStats {
    self.handles.dma.borrow().stats()
  }

  pub fn dma(&self) -> Rc<RefCell<DmaController>> {
    Rc::clone(&self.handles.dma)
  }

  /// `(time, tag)` for every transfer that has completed so far.
  pub fn completions(&self) -> Vec<(f64, u64)> {
    self.handles.completions.borrow().clone()
  }

  pub fn global_time(&self) -> f64 {
    self.simulation.get_global_time()
  }
}
