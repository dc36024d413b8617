use serde::{Deserialize, Serialize};

use super::transfer::OnFinish;

/// Scalar identity of a completion / lock notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalKey {
  pub id: u64,
  pub dst_addr: u64,
  pub requested_addr: u64,
  pub size: u32,
}

pub struct SignalEntry {
  pub key: SignalKey,
  /// The notification may arrive through both paths
  pub mirrored: bool,
  pub on_finish: Option<OnFinish>,
}

impl SignalEntry {
  pub fn matches(&self, key: &SignalKey) -> bool {
    self.key == *key
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPath {
  Local,
  Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
  /// First sighting; the callback ran
  Fired,
  /// Second sighting of an already fired event through the other path
  Duplicate,
  /// Nobody registered this notification
  Unexpected,
}

/// Deduplicates notifications that can reach the controller twice, once
/// from the copy engine directly and once relayed over the network.
///
/// `local` and `remote` hold keys already fired through that path whose
/// twin from the other path has not shown up yet.
#[derive(Default)]
pub struct SignalLedger {
  waiting: Vec<SignalEntry>,
  local: Vec<SignalKey>,
  remote: Vec<SignalKey>,
}

impl SignalLedger {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, entry: SignalEntry) {
    self.waiting.push(entry);
  }

  pub fn observe(&mut self, path: SignalPath, key: SignalKey) -> SignalOutcome {
    let (seen_here, seen_other) = match path {
      SignalPath::Local => (&mut self.local, &mut self.remote),
      SignalPath::Remote => (&mut self.remote, &mut self.local),
    };

    if let Some(pos) = seen_other.iter().position(|k| *k == key) {
      seen_other.swap_remove(pos);
      return SignalOutcome::Duplicate;
    }

    let Some(pos) = self.waiting.iter().position(|e| e.matches(&key)) else {
      return SignalOutcome::Unexpected;
    };
    let mut entry = self.waiting.remove(pos);
    if entry.mirrored {
      seen_here.push(key);
    }
    if let Some(on_finish) = entry.on_finish.take() {
      on_finish();
    }
    SignalOutcome::Fired
  }

  pub fn waiting(&self) -> usize {
    self.waiting.len()
  }
}
