use sim::models::{Model, Reportable};
use sim::simulator::Simulation;

use crate::arch::lcacc::DmaStats;

pub fn print_simulation_records(simulation: &mut Simulation) {
  println!("\n--- Simulation Records ---");

  for model in simulation.models().iter() {
    print_model_records(model);
  }

  println!("--- End Records ---\n");
}

fn print_model_records(model: &Model) {
  let records = model.records();
  if records.is_empty() {
    return;
  }
  println!("\n[{}] {}", model.id(), model.status());
  for record in records {
    println!("  Time {:.1}: {} {}", record.time, record.action, record.subject);
  }
}

/// One line per counter, in the order a run summary reads best.
pub fn format_stats(stats: &DmaStats) -> Vec<String> {
  vec![
    format!("tlb hits        {} ({} coalesced)", stats.hits + stats.mshr_hits, stats.mshr_hits),
    format!("tlb misses      {}", stats.misses),
    format!("tlb flushes     {}", stats.flushes),
    format!("tlb cycles      {}", stats.tlb_cycles),
    format!("violations      {} ({} transfers dropped)", stats.violations, stats.abandoned),
    format!("copies          {}", stats.copies),
    format!("single elements {}", stats.single_elements),
    format!("prefetches      {}", stats.prefetches),
  ]
}

pub fn print_dma_stats(stats: &DmaStats) {
  println!("--- DMA Statistics ---");
  for line in format_stats(stats) {
    println!("  {}", line);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hits_include_coalesced_misses() {
    let stats = DmaStats {
      hits: 3,
      mshr_hits: 2,
      misses: 4,
      ..DmaStats::default()
    };
    let lines = format_stats(&stats);
    assert_eq!(lines[0], "tlb hits        5 (2 coalesced)");
    assert_eq!(lines[1], "tlb misses      4");
  }
}
