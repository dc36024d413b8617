use sim::models::Model;
use sim::simulator::{Connector, Simulation};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use super::copy_engine::CopyEngineModel;
use super::dma_ctrl::{DmaConfig, DmaController, Resolution};
use super::dma_model::{DmaModel, DmaPorts, Fault, Outbox, PortNetwork, PortSpm, SharedOutbox};
use super::error::DmaError;
use super::iommu::{IommuModel, PageTable};
use super::net::NetworkInterface;
use super::spm::SpmInterface;
use super::tlb::{InfiniteTlb, SetAssocTlb, TlbKind, TlbMemory};
use super::workload::{build_injections, CompletionLog, WorkloadModel};
use crate::simulator::config::config::{AppConfig, ResolutionKind, TlbSection};

/// Shared views into the running simulation.
#[derive(Clone)]
pub struct SimHandles {
  pub dma: Rc<RefCell<DmaController>>,
  pub completions: CompletionLog,
}

pub fn build_tlb(section: &TlbSection) -> Result<Box<dyn TlbMemory>, DmaError> {
  if !section.page_size.is_power_of_two() {
    return Err(DmaError::BadPageSize(section.page_size));
  }
  let mask = !(section.page_size - 1);
  let preload = section.preload.iter().map(|m| (m.vaddr & mask, m.paddr & mask));
  match section.kind {
    TlbKind::SetAssoc => {
      let mut tlb = SetAssocTlb::with_capacity(section.entries, section.associativity, section.page_size)?;
      for (vp, pp) in preload {
        tlb.insert(vp, pp, 0);
      }
      Ok(Box::new(tlb))
    },
    TlbKind::Infinite => Ok(Box::new(InfiniteTlb::with_entries(preload))),
  }
}

fn to_io(e: DmaError) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

fn build_controller(config: &AppConfig, outbox: &SharedOutbox) -> io::Result<DmaController> {
  let tlb = build_tlb(&config.tlb).map_err(to_io)?;
  let resolution = match config.dma.resolution {
    ResolutionKind::Network => Resolution::Network {
      resolver_port: config.iommu.network_port,
    },
    ResolutionKind::Local => Resolution::Local,
  };
  let dma_config = DmaConfig {
    page_size: config.tlb.page_size,
    resolution,
    hit_latency: config.tlb.hit_latency,
  };

  let port = config.dma.network_port;
  let network: Rc<RefCell<dyn NetworkInterface>> = Rc::new(RefCell::new(PortNetwork::new(port, Rc::clone(outbox))));
  let spm: Rc<RefCell<dyn SpmInterface>> = Rc::new(RefCell::new(PortSpm::new(Rc::clone(outbox))));

  let miss_outbox = Rc::clone(outbox);
  let on_tlb_miss = Box::new(move |vpage: u64| {
    miss_outbox
      .borrow_mut()
      .faults
      .push_back(Fault::TlbMiss { vpage, requester: port });
  });
  let violation_outbox = Rc::clone(outbox);
  let on_access_violation = Box::new(move |vaddr: u64| {
    violation_outbox
      .borrow_mut()
      .faults
      .push_back(Fault::AccessViolation { vaddr });
  });

  DmaController::new(dma_config, tlb, network, spm, on_tlb_miss, on_access_violation).map_err(to_io)
}

pub fn create_simulation(config: &AppConfig) -> io::Result<(Simulation, SimHandles)> {
  let outbox: SharedOutbox = Rc::new(RefCell::new(Outbox::default()));
  let dma = Rc::new(RefCell::new(build_controller(config, &outbox)?));
  let completions: CompletionLog = Rc::new(RefCell::new(Vec::new()));
  let injections = build_injections(&config.workload, &config.dma.memory_controller)?;

  let mut table = PageTable::new(
    config.tlb.page_size,
    config.iommu.identity_offset,
    config.iommu.protected.clone(),
  );
  for m in &config.iommu.mappings {
    table.map(m.vaddr, m.paddr);
  }

  let models = vec![
    Model::new(
      String::from("workload"),
      Box::new(WorkloadModel::new(
        String::from("transfer_req"),
        String::from("tlb_flush"),
        String::from("done"),
        injections,
        Rc::clone(&completions),
      )),
    ),
    Model::new(
      String::from("dma"),
      Box::new(DmaModel::new(DmaPorts::default(), Rc::clone(&dma), outbox)),
    ),
    Model::new(
      String::from("iommu"),
      Box::new(IommuModel::new(
        String::from("request"),
        String::from("miss"),
        String::from("response"),
        String::from("fill"),
        config.iommu.network_port,
        config.iommu.latency,
        table,
      )),
    ),
    Model::new(
      String::from("copy_engine"),
      Box::new(CopyEngineModel::new(
        String::from("request"),
        String::from("signal_local"),
        String::from("net_out"),
        config.copy_engine.network_port,
        config.dma.network_port,
        config.copy_engine.element_cycles,
      )),
    ),
  ];

  // id, source model, target model, source port, target port
  let link = |id: &str, src: &str, dst: &str, src_port: &str, dst_port: &str| {
    Connector::new(
      id.to_string(),
      src.to_string(),
      dst.to_string(),
      src_port.to_string(),
      dst_port.to_string(),
    )
  };
  let connectors = vec![
    link("workload_dma_req", "workload", "dma", "transfer_req", "transfer_req"),
    link("workload_dma_flush", "workload", "dma", "tlb_flush", "tlb_flush"),
    link("dma_workload_done", "dma", "workload", "done", "done"),
    link("dma_iommu_req", "dma", "iommu", "net_out", "request"),
    link("iommu_dma_resp", "iommu", "dma", "response", "net_in"),
    link("iommu_dma_fill", "iommu", "dma", "fill", "tlb_fill"),
    link("dma_iommu_fault", "dma", "iommu", "fault", "miss"),
    link("dma_engine_req", "dma", "copy_engine", "copy_req", "request"),
    link("engine_dma_signal", "copy_engine", "dma", "signal_local", "signal_local"),
    link("engine_dma_net", "copy_engine", "dma", "net_out", "net_in"),
  ];

  Ok((Simulation::post(models, connectors), SimHandles { dma, completions }))
}
