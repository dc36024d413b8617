use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::arch::lcacc::dma_ctrl::BlockTransfer;
use crate::arch::lcacc::iommu::AddrRange;
use crate::arch::lcacc::program::HeaderKind;
use crate::arch::lcacc::tlb::TlbKind;
use crate::arch::lcacc::transfer::AccessType;

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MappingEntry {
  pub vaddr: u64,
  pub paddr: u64,
}

/// Translation cache section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlbSection {
  #[serde(default = "default_tlb_kind")]
  pub kind: TlbKind,
  #[serde(default = "default_entries")]
  pub entries: usize,
  /// Number of sets; 0 gives one set per entry (direct-mapped)
  #[serde(default = "default_associativity")]
  pub associativity: usize,
  #[serde(default = "default_page_size")]
  pub page_size: u64,
  #[serde(default)]
  pub hit_latency: u64,
  #[serde(default)]
  pub preload: Vec<MappingEntry>,
}

fn default_tlb_kind() -> TlbKind {
  TlbKind::SetAssoc
}

fn default_entries() -> usize {
  64
}

fn default_associativity() -> usize {
  4
}

fn default_page_size() -> u64 {
  4096
}

impl Default for TlbSection {
  fn default() -> Self {
    Self {
      kind: default_tlb_kind(),
      entries: default_entries(),
      associativity: default_associativity(),
      page_size: default_page_size(),
      hit_latency: 0,
      preload: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
  Network,
  Local,
}

/// DMA controller section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DmaSection {
  #[serde(default = "default_dma_port")]
  pub network_port: u32,
  #[serde(default = "default_resolution")]
  pub resolution: ResolutionKind,
  /// Memory controller device to hook at start-up, empty for none
  #[serde(default)]
  pub memory_controller: String,
}

fn default_dma_port() -> u32 {
  1
}

fn default_resolution() -> ResolutionKind {
  ResolutionKind::Network
}

impl Default for DmaSection {
  fn default() -> Self {
    Self {
      network_port: default_dma_port(),
      resolution: default_resolution(),
      memory_controller: String::new(),
    }
  }
}

/// Translation service section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IommuSection {
  #[serde(default = "default_iommu_port")]
  pub network_port: u32,
  #[serde(default = "default_iommu_latency")]
  pub latency: f64,
  #[serde(default)]
  pub mappings: Vec<MappingEntry>,
  /// Unmapped pages resolve to `vpage + offset`; absent means refuse them
  #[serde(default)]
  pub identity_offset: Option<u64>,
  #[serde(default)]
  pub protected: Vec<AddrRange>,
}

fn default_iommu_port() -> u32 {
  0
}

fn default_iommu_latency() -> f64 {
  20.0
}

impl Default for IommuSection {
  fn default() -> Self {
    Self {
      network_port: default_iommu_port(),
      latency: default_iommu_latency(),
      mappings: Vec::new(),
      identity_offset: None,
      protected: Vec::new(),
    }
  }
}

/// Copy engine section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CopyEngineSection {
  #[serde(default = "default_engine_port")]
  pub network_port: u32,
  #[serde(default = "default_element_cycles")]
  pub element_cycles: f64,
}

fn default_engine_port() -> u32 {
  2
}

fn default_element_cycles() -> f64 {
  1.0
}

impl Default for CopyEngineSection {
  fn default() -> Self {
    Self {
      network_port: default_engine_port(),
      element_cycles: default_element_cycles(),
    }
  }
}

/// Simulation section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulationSection {
  #[serde(default)]
  pub quiet: bool,
  #[serde(default = "default_step_mode")]
  pub step_mode: bool,
  #[serde(default)]
  pub trace_file: String,
  #[serde(default = "default_max_time")]
  pub max_time: f64,
}

fn default_step_mode() -> bool {
  false
}

fn default_max_time() -> f64 {
  1_000_000.0
}

impl Default for SimulationSection {
  fn default() -> Self {
    Self {
      quiet: false,
      step_mode: default_step_mode(),
      trace_file: String::new(),
      max_time: default_max_time(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimedTransfer {
  #[serde(default)]
  pub at: f64,
  #[serde(flatten)]
  pub transfer: BlockTransfer,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimedSingleElement {
  #[serde(default)]
  pub at: f64,
  pub spm: u32,
  pub src: u64,
  pub dst: u64,
  pub size: u32,
  pub access: AccessType,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimedPrefetch {
  #[serde(default)]
  pub at: f64,
  pub base: u64,
  pub sizes: Vec<u32>,
  pub strides: Vec<i32>,
  pub element_size: u32,
}

/// Work fed to the DMA controller
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkloadSection {
  /// Wire-format microprogram, empty for none
  #[serde(default)]
  pub program: String,
  #[serde(default = "default_header")]
  pub header: HeaderKind,
  #[serde(default)]
  pub transfers: Vec<TimedTransfer>,
  #[serde(default)]
  pub single_elements: Vec<TimedSingleElement>,
  #[serde(default)]
  pub prefetches: Vec<TimedPrefetch>,
  #[serde(default)]
  pub flush_at: Vec<f64>,
}

fn default_header() -> HeaderKind {
  HeaderKind::Program
}

impl Default for WorkloadSection {
  fn default() -> Self {
    Self {
      program: String::new(),
      header: default_header(),
      transfers: Vec::new(),
      single_elements: Vec::new(),
      prefetches: Vec::new(),
      flush_at: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
  #[serde(default)]
  pub tlb: TlbSection,
  #[serde(default)]
  pub dma: DmaSection,
  #[serde(default)]
  pub iommu: IommuSection,
  #[serde(default)]
  pub copy_engine: CopyEngineSection,
  #[serde(default)]
  pub simulation: SimulationSection,
  #[serde(default)]
  pub workload: WorkloadSection,
}

/// Parses the bundled default.toml
pub fn load_default_config() -> io::Result<AppConfig> {
  parse_config(DEFAULT_CONFIG)
}

pub fn parse_config(content: &str) -> io::Result<AppConfig> {
  toml::from_str::<AppConfig>(content)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("failed to parse TOML config: {}", e)))
}

pub fn load_config_file(path: &Path) -> io::Result<AppConfig> {
  let content = fs::read_to_string(path)
    .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("cannot read config file {:?}: {}", path, e)))?;
  parse_config(&content)
}

/// Merges two configs field by field. A field of `override_config` wins
/// when it was set to something other than its default; lists win when
/// non-empty.
pub fn merge_config(mut base: AppConfig, override_config: AppConfig) -> AppConfig {
  let tlb = override_config.tlb;
  if tlb.kind != default_tlb_kind() {
    base.tlb.kind = tlb.kind;
  }
  if tlb.entries != default_entries() {
    base.tlb.entries = tlb.entries;
  }
  if tlb.associativity != default_associativity() {
    base.tlb.associativity = tlb.associativity;
  }
  if tlb.page_size != default_page_size() {
    base.tlb.page_size = tlb.page_size;
  }
  if tlb.hit_latency != 0 {
    base.tlb.hit_latency = tlb.hit_latency;
  }
  if !tlb.preload.is_empty() {
    base.tlb.preload = tlb.preload;
  }

  let dma = override_config.dma;
  if dma.network_port != default_dma_port() {
    base.dma.network_port = dma.network_port;
  }
  if dma.resolution != default_resolution() {
    base.dma.resolution = dma.resolution;
  }
  if !dma.memory_controller.is_empty() {
    base.dma.memory_controller = dma.memory_controller;
  }

  let iommu = override_config.iommu;
  if iommu.network_port != default_iommu_port() {
    base.iommu.network_port = iommu.network_port;
  }
  if iommu.latency != default_iommu_latency() {
    base.iommu.latency = iommu.latency;
  }
  if !iommu.mappings.is_empty() {
    base.iommu.mappings = iommu.mappings;
  }
  if iommu.identity_offset.is_some() {
    base.iommu.identity_offset = iommu.identity_offset;
  }
  if !iommu.protected.is_empty() {
    base.iommu.protected = iommu.protected;
  }

  let engine = override_config.copy_engine;
  if engine.network_port != default_engine_port() {
    base.copy_engine.network_port = engine.network_port;
  }
  if engine.element_cycles != default_element_cycles() {
    base.copy_engine.element_cycles = engine.element_cycles;
  }

  let simulation = override_config.simulation;
  if simulation.quiet {
    base.simulation.quiet = true;
  }
  if simulation.step_mode {
    base.simulation.step_mode = true;
  }
  if !simulation.trace_file.is_empty() {
    base.simulation.trace_file = simulation.trace_file;
  }
  if simulation.max_time != default_max_time() {
    base.simulation.max_time = simulation.max_time;
  }

  let workload = override_config.workload;
  if !workload.program.is_empty() {
    base.workload.program = workload.program;
  }
  if workload.header != default_header() {
    base.workload.header = workload.header;
  }
  if !workload.transfers.is_empty() {
    base.workload.transfers = workload.transfers;
  }
  if !workload.single_elements.is_empty() {
    base.workload.single_elements = workload.single_elements;
  }
  if !workload.prefetches.is_empty() {
    base.workload.prefetches = workload.prefetches;
  }
  if !workload.flush_at.is_empty() {
    base.workload.flush_at = workload.flush_at;
  }

  base
}

pub fn apply_cli_overrides(
  config: &mut AppConfig,
  quiet: bool,
  step: bool,
  trace_file: Option<&str>,
  tlb_kind: Option<TlbKind>,
  program: Option<&str>,
  max_time: Option<f64>,
) {
  if quiet {
    config.simulation.quiet = true;
  }
  if step {
    config.simulation.step_mode = true;
  }
  if let Some(file) = trace_file {
    config.simulation.trace_file = file.to_string();
  }
  if let Some(kind) = tlb_kind {
    config.tlb.kind = kind;
  }
  if let Some(path) = program {
    config.workload.program = path.to_string();
  }
  if let Some(t) = max_time {
    config.simulation.max_time = t;
  }
}

fn invalid(msg: String) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub fn validate_config(config: &AppConfig) -> io::Result<()> {
  let tlb = &config.tlb;
  if !tlb.page_size.is_power_of_two() {
    return Err(invalid(format!("page_size {} is not a power of two", tlb.page_size)));
  }
  if tlb.kind == TlbKind::SetAssoc {
    if tlb.entries == 0 {
      return Err(invalid("tlb entries must be greater than 0".to_string()));
    }
    if tlb.associativity != 0 && tlb.entries % tlb.associativity != 0 {
      return Err(invalid(format!(
        "{} tlb entries cannot be split across {} sets",
        tlb.entries, tlb.associativity
      )));
    }
  }

  let ports = [
    config.dma.network_port,
    config.iommu.network_port,
    config.copy_engine.network_port,
  ];
  if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
    return Err(invalid(format!("network ports must be distinct, got {:?}", ports)));
  }

  if config.iommu.latency < 0.0 || config.copy_engine.element_cycles < 0.0 {
    return Err(invalid("latencies cannot be negative".to_string()));
  }
  if config.simulation.max_time <= 0.0 {
    return Err(invalid("max_time must be positive".to_string()));
  }
  if let Some(r) = config.iommu.protected.iter().find(|r| r.start >= r.end) {
    return Err(invalid(format!("empty protected range {:#x}..{:#x}", r.start, r.end)));
  }

  Ok(())
}

/// Makes relative workload and trace paths relative to `root`
pub fn resolve_paths(config: &mut AppConfig, root: &Path) {
  config.workload.program = resolve_single_path(&config.workload.program, root);
  config.simulation.trace_file = resolve_single_path(&config.simulation.trace_file, root);
}

fn resolve_single_path(path_str: &str, root: &Path) -> String {
  let path = Path::new(path_str);
  if path_str.is_empty() || path.is_absolute() {
    return path_str.to_string();
  }
  root.join(path).to_string_lossy().to_string()
}

/// Loads and merges configuration.
///
/// 1. bundled defaults
/// 2. custom config file, if given
/// 3. CLI overrides
/// 4. relative paths resolved against `root`
/// 5. validation
pub fn load_and_merge_configs(
  custom_config_path: Option<&str>,
  root: &Path,
  quiet: bool,
  step: bool,
  trace_file: Option<&str>,
  tlb_kind: Option<TlbKind>,
  program: Option<&str>,
  max_time: Option<f64>,
) -> io::Result<AppConfig> {
  let mut config = load_default_config()?;

  if let Some(custom_path) = custom_config_path {
    let custom_path_buf = PathBuf::from(custom_path);
    let custom_path_abs = if custom_path_buf.is_absolute() {
      custom_path_buf
    } else {
      root.join(&custom_path_buf)
    };
    let custom_config = load_config_file(&custom_path_abs)?;
    config = merge_config(config, custom_config);
  }

  apply_cli_overrides(&mut config, quiet, step, trace_file, tlb_kind, program, max_time);
  resolve_paths(&mut config, root);
  validate_config(&config)?;

  Ok(config)
}
