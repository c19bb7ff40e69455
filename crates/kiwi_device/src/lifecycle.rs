//! Process-wide init/teardown of native subsystems.
//!
//! Every manager holds a [`BackendLease`] per subsystem it uses. The first
//! lease of a subsystem runs its initialization, the last release runs its
//! termination. Counts live in one mutex-guarded map keyed by subsystem id.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::{BackendError, DeviceError};

static LIVE_MANAGERS: Mutex<BTreeMap<String, usize>> = Mutex::new(BTreeMap::new());

/// A native subsystem with one-time process-wide setup.
pub trait BackendSubsystem {
  /// Stable identity used as the registry key.
  fn subsystem_id(&self) -> String;

  fn initialize(&self) -> Result<(), BackendError> {
    Ok(())
  }

  fn terminate(&self) {}
}

/// Proof that a subsystem is initialized for as long as the lease lives.
#[derive(Debug)]
pub struct BackendLease {
  subsystem: String,
}

impl BackendLease {
  pub fn acquire<S: BackendSubsystem + ?Sized>(subsystem: &S) -> Result<Self, DeviceError> {
    let id = subsystem.subsystem_id();
    let mut live = LIVE_MANAGERS.lock();
    let count = live.get(&id).copied().unwrap_or(0);

    if count == 0 {
      if let Err(err) = subsystem.initialize() {
        tracing::error!("Audio subsystem {} failed to initialize: {}", id, err);
        return Err(DeviceError::BackendInit {
          subsystem: id,
          reason: err.to_string(),
        });
      }
      tracing::debug!("Audio subsystem {} initialized", id);
    }

    live.insert(id.clone(), count + 1);
    Ok(Self { subsystem: id })
  }

  /// Give the lease back, terminating the subsystem if this was the last one.
  pub fn release<S: BackendSubsystem + ?Sized>(self, subsystem: &S) {
    let mut live = LIVE_MANAGERS.lock();
    let remaining = match live.get_mut(&self.subsystem) {
      Some(count) => {
        *count = count.saturating_sub(1);
        *count
      }
      None => 0,
    };

    if remaining == 0 {
      live.remove(&self.subsystem);
      subsystem.terminate();
      tracing::debug!("Audio subsystem {} terminated", self.subsystem);
    }
  }

  pub fn subsystem(&self) -> &str {
    &self.subsystem
  }
}

/// Number of live leases on a subsystem.
pub fn live_managers(subsystem: &str) -> usize {
  LIVE_MANAGERS.lock().get(subsystem).copied().unwrap_or(0)
}
