use sim::models::ModelMessage;
use std::f64::INFINITY;

const EPS: f64 = 1e-9;

/// Output messages parked until their due time.
#[derive(Debug, Clone, Default)]
pub struct DelayLine {
  items: Vec<(f64, String, String)>,
}

impl DelayLine {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, due: f64, port_name: &str, content: String) {
    self.items.push((due, port_name.to_string(), content));
  }

  /// Removes everything due by `now`, oldest deadline first.
  pub fn pop_due(&mut self, now: f64) -> Vec<ModelMessage> {
    let (mut due, rest): (Vec<_>, Vec<_>) = self.items.drain(..).partition(|(t, _, _)| *t <= now + EPS);
    self.items = rest;
    due.sort_by(|a, b| a.0.total_cmp(&b.0));
    due
      .into_iter()
      .map(|(_, port_name, content)| ModelMessage { content, port_name })
      .collect()
  }

  /// Time left until the earliest deadline.
  pub fn until_next(&self, now: f64) -> f64 {
    self
      .items
      .iter()
      .map(|(t, _, _)| (t - now).max(0.0))
      .fold(INFINITY, f64::min)
  }
}
