//! Native backends.

use std::sync::atomic::{AtomicBool, Ordering};

pub mod cpal;
#[cfg(feature = "jack")]
pub mod jack;
pub mod simulated;

/// Tracks whether a stream callback may run and whether one is running.
///
/// The callback brackets its work with [`enter`](Self::enter) and
/// [`leave`](Self::leave); the control thread clears `running` and polls
/// [`is_stopped`](Self::is_stopped).
#[derive(Debug, Default)]
pub(crate) struct StreamGate {
  running: AtomicBool,
  in_callback: AtomicBool,
}

impl StreamGate {
  #[inline(always)]
  pub(crate) fn enter(&self) -> bool {
    self.in_callback.store(true, Ordering::SeqCst);
    if self.running.load(Ordering::SeqCst) {
      true
    } else {
      self.in_callback.store(false, Ordering::SeqCst);
      false
    }
  }

  #[inline(always)]
  pub(crate) fn leave(&self) {
    self.in_callback.store(false, Ordering::SeqCst);
  }

  pub(crate) fn open(&self) {
    self.running.store(true, Ordering::SeqCst);
  }

  pub(crate) fn close(&self) {
    self.running.store(false, Ordering::SeqCst);
  }

  /// Forget a callback that will never return (its stream was torn down).
  pub(crate) fn reset(&self) {
    self.running.store(false, Ordering::SeqCst);
    self.in_callback.store(false, Ordering::SeqCst);
  }

  pub(crate) fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  pub(crate) fn is_stopped(&self) -> bool {
    !self.running.load(Ordering::SeqCst) && !self.in_callback.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn gate_refuses_entry_until_opened() {
    let gate = StreamGate::default();
    assert!(gate.is_stopped());
    assert!(!gate.enter());
    assert!(gate.is_stopped());

    gate.open();
    assert!(gate.enter());
    gate.close();
    assert!(!gate.is_stopped());
    gate.leave();
    assert!(gate.is_stopped());
  }

  #[test]
  fn reset_clears_a_stuck_callback() {
    let gate = StreamGate::default();
    gate.open();
    assert!(gate.enter());

    gate.reset();

    assert!(gate.is_stopped());
    assert!(!gate.is_running());
  }
}
