use clap::{Parser, ValueEnum};
use dmaxlat::arch::lcacc::tlb::TlbKind;
use dmaxlat::simulator::config::config::load_and_merge_configs;
use dmaxlat::simulator::utils::log::init_log;
use dmaxlat::simulator::Simulator;
use std::env;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TlbArg {
  SetAssoc,
  Infinite,
}

impl From<TlbArg> for TlbKind {
  fn from(arg: TlbArg) -> Self {
    match arg {
      TlbArg::SetAssoc => TlbKind::SetAssoc,
      TlbArg::Infinite => TlbKind::Infinite,
    }
  }
}

/// dmaxlat - DMA address translation simulator
#[derive(Parser, Debug)]
#[command(name = "dmaxlat")]
#[command(version = "0.1.0")]
#[command(about = "Simulates an accelerator DMA controller with its TLB, miss coalescing and copy engine", long_about = None)]
struct Args {
  /// Custom TOML config, merged over the bundled defaults
  #[arg(short, long, value_name = "FILE")]
  config: Option<String>,

  /// Enable step mode (interactive stepping)
  #[arg(short, long)]
  step: bool,

  /// Quiet mode (suppress log messages)
  #[arg(short, long)]
  quiet: bool,

  /// Output trace file path
  #[arg(long, value_name = "FILE")]
  trace_file: Option<String>,

  /// TLB organization
  #[arg(long, value_enum)]
  tlb_kind: Option<TlbArg>,

  /// Wire-format microprogram to replay
  #[arg(short, long, value_name = "FILE")]
  program: Option<String>,

  /// Stop once simulated time passes this point
  #[arg(long)]
  max_time: Option<f64>,

  /// Print per-model records after the run
  #[arg(long)]
  records: bool,
}

fn main() -> std::io::Result<()> {
  init_log();

  let args = Args::parse();
  let root = env::current_dir()?;

  let app_config = load_and_merge_configs(
    args.config.as_deref(),
    &root,
    args.quiet,
    args.step,
    args.trace_file.as_deref(),
    args.tlb_kind.map(TlbKind::from),
    args.program.as_deref(),
    args.max_time,
  )?;

  let mut simulator = Simulator::from_app_config(&app_config)?;
  simulator.run()?;

  if args.records {
    simulator.report();
  } else {
    dmaxlat::simulator::utils::report::print_dma_stats(&simulator.stats());
  }
  println!("{} transfers completed", simulator.completions().len());

  Ok(())
}
