//! Native traits for interleaved backends: one f32 buffer per direction per
//! period, separate input and output stream parameters.

use crate::error::BackendError;
use crate::lifecycle::BackendSubsystem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
  pub name: String,
  pub max_input_channels: usize,
  pub max_output_channels: usize,
  pub default_buffer_size: Option<usize>,
}

/// One direction of a stream to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParameters {
  pub device: String,
  pub channel_count: usize,
}

/// `(input, output, frames)`: `input` holds `frames` frames of the stream's
/// input width and `output` `frames` frames of its output width.
pub type InterleavedCallback = Box<dyn FnMut(&[f32], &mut [f32], usize) + Send>;

pub trait InterleavedStream {
  fn input_channels(&self) -> usize;

  fn output_channels(&self) -> usize;

  fn start(&mut self) -> Result<(), BackendError>;

  /// Request the stream to stop after the current callback.
  fn stop(&mut self) -> Result<(), BackendError>;

  /// Stop without waiting for pending callbacks.
  fn abort(&mut self);

  fn is_active(&self) -> bool;

  /// True once the callback is neither running nor scheduled to run.
  fn is_stopped(&self) -> bool;
}

pub trait InterleavedHost: BackendSubsystem {
  /// Names of the host APIs (drivers) this backend can drive.
  fn host_names(&self) -> Vec<String>;

  fn default_host(&self) -> Option<String>;

  /// Name of the default capture device of `host`, if it has one.
  fn default_input_device(&self, host: &str) -> Option<String>;

  fn default_output_device(&self, host: &str) -> Option<String>;

  /// Rescan and list the devices of `host`. Unknown hosts list nothing.
  fn devices(&mut self, host: &str) -> Vec<HostDevice>;

  fn is_format_supported(
    &self,
    host: &str,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    sample_rate: u32,
  ) -> bool;

  fn is_buffer_size_supported(
    &self,
    host: &str,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    frames: usize,
  ) -> bool;

  fn open_stream(
    &mut self,
    host: &str,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    sample_rate: u32,
    vector_size: usize,
    callback: InterleavedCallback,
  ) -> Result<Box<dyn InterleavedStream>, BackendError>;
}
