use serde_json;
use sim::models::model_trait::DevsModel;
use sim::simulator::{Message, Simulation};
use std::fs::File;
use std::io::{self, BufWriter, Result, Write};

/// Time until the earliest scheduled internal event over all models.
pub fn next_event_in(simulation: &mut Simulation) -> f64 {
  simulation
    .models()
    .iter()
    .fold(f64::INFINITY, |min, model| f64::min(min, model.until_next_event()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
  /// Time moved forward
  Advanced,
  /// No messages in flight and nothing scheduled
  Idle,
  /// The next event lies beyond the horizon
  Horizon,
}

fn trace_messages(messages: &[Message], trace_writer: &mut Option<BufWriter<File>>) -> Result<()> {
  for msg in messages {
    log::debug!(
      "[MSG] t={:.1} {}:{} -> {}:{} | {}",
      msg.time(),
      msg.source_id(),
      msg.source_port(),
      msg.target_id(),
      msg.target_port(),
      msg.content()
    );
  }

  if let Some(writer) = trace_writer {
    for msg in messages {
      let trace_entry = serde_json::json!({
        "time": msg.time(),
        "source": msg.source_id(),
        "source_port": msg.source_port(),
        "target": msg.target_id(),
        "target_port": msg.target_port(),
        "content": msg.content()
      });
      writeln!(writer, "{}", trace_entry)?;
    }
    writer.flush()?;
  }
  Ok(())
}

/// Delivers everything due at the current time, then advances to the next
/// scheduled event unless that lies past `horizon`.
pub fn model_step(
  simulation: &mut Simulation,
  trace_writer: &mut Option<BufWriter<File>>,
  horizon: f64,
) -> Result<StepResult> {
  loop {
    if simulation.get_messages().is_empty() {
      let next = next_event_in(simulation);
      if next == f64::INFINITY {
        return Ok(StepResult::Idle);
      }
      if simulation.get_global_time() + next > horizon {
        return Ok(StepResult::Horizon);
      }
    }

    let messages = simulation.get_messages().to_vec();
    trace_messages(&messages, trace_writer)?;

    let time0 = simulation.get_global_time();
    if let Err(e) = simulation.step() {
      log::error!("simulation step failed at t={:.1}: {:?}", time0, e);
      return Err(io::Error::new(io::ErrorKind::Other, format!("Simulation error: {:?}", e)));
    }
    if simulation.get_global_time() > time0 {
      return Ok(StepResult::Advanced);
    }
  }
}
