use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Submission ids a live request is currently sending or queuing.
///
/// The retry coordinator skips these so a replay never races a live write
/// of the same record.
#[derive(Default)]
pub struct InFlight {
  // id -> number of live requests holding it
  live: Mutex<HashMap<String, usize>>,
}

impl InFlight {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
    self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Mark `id` live until the returned guard is dropped.
  pub fn claim(self: &Arc<Self>, id: &str) -> LiveGuard {
    *self.lock().entry(id.to_string()).or_insert(0) += 1;
    LiveGuard {
      owner: Arc::clone(self),
      id: id.to_string(),
    }
  }

  pub fn is_live(&self, id: &str) -> bool {
    self.lock().contains_key(id)
  }
}

pub struct LiveGuard {
  owner: Arc<InFlight>,
  id: String,
}

impl Drop for LiveGuard {
  fn drop(&mut self) {
    let mut live = self.owner.lock();
    if let Some(count) = live.get_mut(&self.id) {
      *count -= 1;
      if *count == 0 {
        live.remove(&self.id);
      }
    }
  }
}
