//! The device manager contract shared by both native models.

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;

use crate::callback::{CallbackStats, ProcessShared, TickFault};
use crate::config::{DeviceDescriptor, DriverDescriptor, StreamConfiguration};
use crate::graph::DspGraph;
use crate::sample::Sample;

/// Read access to one matrix input channel. The audio thread outputs silence
/// for as long as any guard is held.
pub type InputSamples<'a> = MappedRwLockReadGuard<'a, [Sample]>;

/// Write access to one matrix output channel.
pub type OutputSamples<'a> = MappedRwLockWriteGuard<'a, [Sample]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
  Closed,
  Opening,
  Running,
}

impl std::fmt::Display for SessionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SessionState::Closed => write!(f, "closed"),
      SessionState::Opening => write!(f, "opening"),
      SessionState::Running => write!(f, "running"),
    }
  }
}

/// Discovery, negotiation and sample access for one audio session.
///
/// Setters return `true` when the configuration changed and the stream was
/// re-opened. They return `false` for the active value or for a value missing
/// from the matching enumeration. A failed re-open is logged and leaves the
/// session [`Closed`](SessionState::Closed).
pub trait DeviceManager {
  fn available_drivers(&self) -> Vec<String>;

  fn drivers(&self) -> Vec<DriverDescriptor> {
    self
      .available_drivers()
      .into_iter()
      .map(|name| DriverDescriptor { name })
      .collect()
  }

  fn available_input_devices(&mut self) -> Vec<String>;

  fn available_output_devices(&mut self) -> Vec<String>;

  /// Rescan and describe every device of the current driver.
  fn devices(&mut self) -> Vec<DeviceDescriptor>;

  fn available_sample_rates(&self) -> Vec<u32>;

  fn available_vector_sizes(&self) -> Vec<usize>;

  fn is_driver_available(&self, name: &str) -> bool {
    self.available_drivers().iter().any(|d| d == name)
  }

  fn is_input_device_available(&mut self, name: &str) -> bool {
    self.available_input_devices().iter().any(|d| d == name)
  }

  fn is_output_device_available(&mut self, name: &str) -> bool {
    self.available_output_devices().iter().any(|d| d == name)
  }

  fn is_sample_rate_available(&self, rate: u32) -> bool {
    self.available_sample_rates().contains(&rate)
  }

  fn is_vector_size_available(&self, size: usize) -> bool {
    self.available_vector_sizes().contains(&size)
  }

  fn configuration(&self) -> &StreamConfiguration;

  fn driver_name(&self) -> Option<&str> {
    self.configuration().driver.as_deref()
  }

  fn input_device_name(&self) -> Option<&str> {
    self.configuration().input_device.as_deref()
  }

  fn output_device_name(&self) -> Option<&str> {
    self.configuration().output_device.as_deref()
  }

  fn number_of_inputs(&self) -> usize {
    self.configuration().input_channels
  }

  fn number_of_outputs(&self) -> usize {
    self.configuration().output_channels
  }

  fn sample_rate(&self) -> u32 {
    self.configuration().sample_rate
  }

  fn vector_size(&self) -> usize {
    self.configuration().vector_size
  }

  fn state(&self) -> SessionState;

  /// Number of re-open attempts since construction.
  fn generation(&self) -> u64;

  fn set_driver(&mut self, name: &str) -> bool;

  fn set_input_device(&mut self, name: &str) -> bool;

  fn set_output_device(&mut self, name: &str) -> bool;

  fn set_sample_rate(&mut self, rate: u32) -> bool;

  fn set_vector_size(&mut self, size: usize) -> bool;

  fn input_samples(&self, channel: usize) -> Option<InputSamples<'_>>;

  fn output_samples(&self, channel: usize) -> Option<OutputSamples<'_>>;

  fn drain_faults(&mut self) -> Vec<TickFault>;

  fn callback_stats(&self) -> CallbackStats;

  /// Swap the DSP graph without re-opening. The graph is prepared for the
  /// live configuration first.
  fn replace_graph(&mut self, graph: Box<dyn DspGraph>);
}

pub(crate) fn input_guard(shared: &ProcessShared, channel: usize) -> Option<InputSamples<'_>> {
  RwLockReadGuard::try_map(shared.buffers.read(), |b| b.matrix.input(channel)).ok()
}

pub(crate) fn output_guard(shared: &ProcessShared, channel: usize) -> Option<OutputSamples<'_>> {
  RwLockWriteGuard::try_map(shared.buffers.write(), |b| b.matrix.output_mut(channel)).ok()
}

pub(crate) fn drain(faults: &mut rtrb::Consumer<TickFault>) -> Vec<TickFault> {
  let mut drained = Vec::with_capacity(faults.slots());
  while let Ok(fault) = faults.pop() {
    drained.push(fault);
  }
  drained
}
