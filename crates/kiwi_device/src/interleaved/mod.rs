//! Device session over interleaved hosts.

pub mod host;

use std::sync::Arc;

use crate::callback::{CallbackAdapter, CallbackStats, ProcessShared, TickFault};
use crate::config::{DeviceDescriptor, Direction, ManagerOptions, StreamConfiguration};
use crate::error::{BackendError, DeviceError};
use crate::graph::{DspGraph, Silence};
use crate::lifecycle::BackendLease;
use crate::manager::{self, DeviceManager, InputSamples, OutputSamples, SessionState};
use crate::session::{negotiate, resolve_device, wait_until_stopped};

use self::host::{HostDevice, InterleavedHost, InterleavedStream, StreamParameters};

const SAMPLE_RATE_BASES: [u32; 3] = [11_025, 12_000, 16_000];
const SAMPLE_RATE_MULTIPLIERS: std::ops::RangeInclusive<u32> = 1..=5;
const MAX_VECTOR_SIZE_EXPONENT: u32 = 13;

/// Sample rates probed against the host, ascending.
pub fn candidate_sample_rates() -> Vec<u32> {
  let mut rates: Vec<u32> = SAMPLE_RATE_BASES
    .iter()
    .flat_map(|base| SAMPLE_RATE_MULTIPLIERS.map(move |i| base * i))
    .collect();
  rates.sort_unstable();
  rates.dedup();
  rates
}

/// Powers of two from 1 to 8192.
pub fn candidate_vector_sizes() -> Vec<usize> {
  (0..=MAX_VECTOR_SIZE_EXPONENT).map(|exp| 1usize << exp).collect()
}

/// A [`DeviceManager`] driving an [`InterleavedHost`].
pub struct InterleavedDeviceManager<H: InterleavedHost> {
  host: H,
  lease: Option<BackendLease>,
  options: ManagerOptions,
  config: StreamConfiguration,
  devices: Vec<HostDevice>,
  stream: Option<Box<dyn InterleavedStream>>,
  shared: Arc<ProcessShared>,
  faults: rtrb::Consumer<TickFault>,
  state: SessionState,
  generation: u64,
}

impl<H: InterleavedHost> InterleavedDeviceManager<H> {
  pub fn new(host: H, options: ManagerOptions) -> Result<Self, DeviceError> {
    Self::with_graph(host, options, Box::new(Silence))
  }

  /// Acquire the host, select a driver and open the default stream.
  pub fn with_graph(host: H, options: ManagerOptions, graph: Box<dyn DspGraph>) -> Result<Self, DeviceError> {
    options.validate()?;
    let lease = BackendLease::acquire(&host)?;

    let drivers = host.host_names();
    let driver = match options.driver.as_deref() {
      Some(name) if drivers.iter().any(|d| d == name) => Some(name.to_string()),
      preferred => {
        if let Some(name) = preferred {
          tracing::warn!("Driver {} is not available, using the default host", name);
        }
        host.default_host().or_else(|| drivers.first().cloned())
      }
    };
    tracing::info!("Selected audio driver: {}", driver.as_deref().unwrap_or("none"));

    let (producer, faults) = rtrb::RingBuffer::new(options.fault_queue_capacity);
    let config = StreamConfiguration {
      driver,
      input_device: options.input_device.clone(),
      output_device: options.output_device.clone(),
      sample_rate: options.sample_rate,
      vector_size: options.vector_size,
      input_channels: 0,
      output_channels: 0,
    };

    let mut manager = Self {
      host,
      lease: Some(lease),
      options,
      config,
      devices: Vec::new(),
      stream: None,
      shared: ProcessShared::new(graph, producer),
      faults,
      state: SessionState::Closed,
      generation: 0,
    };
    manager.reopen();
    Ok(manager)
  }

  pub fn host(&self) -> &H {
    &self.host
  }

  pub fn options(&self) -> &ManagerOptions {
    &self.options
  }

  fn rescan(&mut self) {
    self.devices = match self.config.driver.as_deref() {
      Some(driver) => self.host.devices(driver),
      None => Vec::new(),
    };
    tracing::debug!(
      "Scanned {} devices on {}",
      self.devices.len(),
      self.config.driver.as_deref().unwrap_or("no driver")
    );
  }

  fn device_names(&self, direction: Direction) -> Vec<String> {
    self
      .devices
      .iter()
      .filter(|d| match direction {
        Direction::Input => d.max_input_channels > 0,
        Direction::Output => d.max_output_channels > 0,
      })
      .map(|d| d.name.clone())
      .collect()
  }

  fn find_device(&self, name: &str) -> Option<&HostDevice> {
    self.devices.iter().find(|d| d.name == name)
  }

  /// Stream parameters for a device, with the requested channel count capped
  /// by what the device offers. `None` when no channel remains.
  fn parameters(&self, device: Option<&str>, direction: Direction) -> Option<StreamParameters> {
    let device = self.find_device(device?)?;
    let channel_count = match direction {
      Direction::Input => self.options.input_channels.min(device.max_input_channels),
      Direction::Output => self.options.output_channels.min(device.max_output_channels),
    };
    (channel_count > 0).then(|| StreamParameters {
      device: device.name.clone(),
      channel_count,
    })
  }

  fn current_parameters(&self) -> (Option<StreamParameters>, Option<StreamParameters>) {
    (
      self.parameters(self.config.input_device.as_deref(), Direction::Input),
      self.parameters(self.config.output_device.as_deref(), Direction::Output),
    )
  }

  fn supported_rates(&self, driver: &str, input: Option<&StreamParameters>, output: Option<&StreamParameters>) -> Vec<u32> {
    if input.is_none() && output.is_none() {
      return Vec::new();
    }
    candidate_sample_rates()
      .into_iter()
      .filter(|rate| self.host.is_format_supported(driver, input, output, *rate))
      .collect()
  }

  fn supported_sizes(&self, driver: &str, input: Option<&StreamParameters>, output: Option<&StreamParameters>) -> Vec<usize> {
    if input.is_none() && output.is_none() {
      return Vec::new();
    }
    candidate_vector_sizes()
      .into_iter()
      .filter(|size| self.host.is_buffer_size_supported(driver, input, output, *size))
      .collect()
  }

  /// Stop, close and re-open the stream with the live configuration.
  fn reopen(&mut self) {
    self.generation += 1;
    self.close_stream();
    self.state = SessionState::Opening;

    match self.open_stream() {
      Ok(()) => {
        self.state = SessionState::Running;
        tracing::info!(
          "Opened stream on {}: in={:?} ({} ch) out={:?} ({} ch) {} Hz, vector {}",
          self.config.driver.as_deref().unwrap_or("none"),
          self.config.input_device,
          self.config.input_channels,
          self.config.output_device,
          self.config.output_channels,
          self.config.sample_rate,
          self.config.vector_size
        );
      }
      Err(err) => {
        tracing::error!("Failed to open audio stream: {}", err);
        self.close_stream();
      }
    }
  }

  fn open_stream(&mut self) -> Result<(), BackendError> {
    let driver = self.config.driver.clone().ok_or_else(|| BackendError::DriverNotFound {
      name: "none".into(),
    })?;
    self.rescan();

    let default_input = self.host.default_input_device(&driver);
    let default_output = self.host.default_output_device(&driver);
    self.config.input_device = resolve_device(
      self.config.input_device.as_deref(),
      default_input.as_deref(),
      &self.device_names(Direction::Input),
    );
    self.config.output_device = resolve_device(
      self.config.output_device.as_deref(),
      default_output.as_deref(),
      &self.device_names(Direction::Output),
    );
    let (input, output) = self.current_parameters();
    if input.is_none() && output.is_none() {
      return Err(BackendError::DeviceNotFound {
        name: "no input or output device".into(),
      });
    }

    let rates = self.supported_rates(&driver, input.as_ref(), output.as_ref());
    let sample_rate = negotiate(self.config.sample_rate, &rates, None).ok_or_else(|| BackendError::UnsupportedConfig {
      message: "no supported sample rate".into(),
    })?;
    if sample_rate != self.config.sample_rate {
      tracing::warn!("Sample rate {} unsupported, using {}", self.config.sample_rate, sample_rate);
    }

    let default_size = output
      .as_ref()
      .or(input.as_ref())
      .and_then(|p| self.find_device(&p.device))
      .and_then(|d| d.default_buffer_size);
    let sizes = self.supported_sizes(&driver, input.as_ref(), output.as_ref());
    let vector_size = negotiate(self.config.vector_size, &sizes, default_size).ok_or_else(|| BackendError::UnsupportedConfig {
      message: "no supported vector size".into(),
    })?;
    if vector_size != self.config.vector_size {
      tracing::warn!("Vector size {} unsupported, using {}", self.config.vector_size, vector_size);
    }

    let adapter = CallbackAdapter::new(self.shared.clone());
    let stream = self.host.open_stream(
      &driver,
      input.as_ref(),
      output.as_ref(),
      sample_rate,
      vector_size,
      Box::new(move |input: &[f32], output: &mut [f32], frames: usize| adapter.process_interleaved(input, output, frames)),
    )?;

    self.config.sample_rate = sample_rate;
    self.config.vector_size = vector_size;
    self.config.input_channels = stream.input_channels();
    self.config.output_channels = stream.output_channels();
    self
      .shared
      .install(&self.config, self.config.input_channels, self.config.output_channels);

    let stream = self.stream.insert(stream);
    stream.start()
  }

  /// Stop and close the stream, then free the matrix.
  fn close_stream(&mut self) {
    if let Some(mut stream) = self.stream.take() {
      if stream.is_active() {
        if let Err(err) = stream.stop() {
          tracing::warn!("{}", err);
        }
      }
      if !wait_until_stopped(|| stream.is_stopped(), self.options.stop_timeout()) {
        tracing::warn!("Stream did not stop in time, aborting");
        stream.abort();
      }
      drop(stream);
      tracing::info!("Closed audio stream");
    }

    self.shared.release();
    self.config.input_channels = 0;
    self.config.output_channels = 0;
    self.state = SessionState::Closed;
  }
}

impl<H: InterleavedHost> DeviceManager for InterleavedDeviceManager<H> {
  fn available_drivers(&self) -> Vec<String> {
    self.host.host_names()
  }

  fn available_input_devices(&mut self) -> Vec<String> {
    self.rescan();
    self.device_names(Direction::Input)
  }

  fn available_output_devices(&mut self) -> Vec<String> {
    self.rescan();
    self.device_names(Direction::Output)
  }

  fn devices(&mut self) -> Vec<DeviceDescriptor> {
    self.rescan();
    let mut descriptors = Vec::new();
    for device in &self.devices {
      if device.max_input_channels > 0 {
        descriptors.push(DeviceDescriptor {
          name: device.name.clone(),
          direction: Direction::Input,
          max_channels: device.max_input_channels,
        });
      }
      if device.max_output_channels > 0 {
        descriptors.push(DeviceDescriptor {
          name: device.name.clone(),
          direction: Direction::Output,
          max_channels: device.max_output_channels,
        });
      }
    }
    descriptors
  }

  fn available_sample_rates(&self) -> Vec<u32> {
    let Some(driver) = self.config.driver.as_deref() else {
      return Vec::new();
    };
    let (input, output) = self.current_parameters();
    self.supported_rates(driver, input.as_ref(), output.as_ref())
  }

  fn available_vector_sizes(&self) -> Vec<usize> {
    let Some(driver) = self.config.driver.as_deref() else {
      return Vec::new();
    };
    let (input, output) = self.current_parameters();
    self.supported_sizes(driver, input.as_ref(), output.as_ref())
  }

  fn configuration(&self) -> &StreamConfiguration {
    &self.config
  }

  fn state(&self) -> SessionState {
    self.state
  }

  fn generation(&self) -> u64 {
    self.generation
  }

  fn set_driver(&mut self, name: &str) -> bool {
    if self.config.driver.as_deref() == Some(name) || !self.is_driver_available(name) {
      tracing::debug!("set_driver({}) ignored", name);
      return false;
    }
    tracing::info!("Selected audio driver: {}", name);
    self.config.driver = Some(name.to_string());
    self.config.input_device = None;
    self.config.output_device = None;
    self.reopen();
    true
  }

  fn set_input_device(&mut self, name: &str) -> bool {
    if self.config.input_device.as_deref() == Some(name) || !self.is_input_device_available(name) {
      tracing::debug!("set_input_device({}) ignored", name);
      return false;
    }
    self.config.input_device = Some(name.to_string());
    self.reopen();
    true
  }

  fn set_output_device(&mut self, name: &str) -> bool {
    if self.config.output_device.as_deref() == Some(name) || !self.is_output_device_available(name) {
      tracing::debug!("set_output_device({}) ignored", name);
      return false;
    }
    self.config.output_device = Some(name.to_string());
    self.reopen();
    true
  }

  fn set_sample_rate(&mut self, rate: u32) -> bool {
    if self.config.sample_rate == rate || !self.is_sample_rate_available(rate) {
      tracing::debug!("set_sample_rate({}) ignored", rate);
      return false;
    }
    self.config.sample_rate = rate;
    self.reopen();
    true
  }

  fn set_vector_size(&mut self, size: usize) -> bool {
    if self.config.vector_size == size || !self.is_vector_size_available(size) {
      tracing::debug!("set_vector_size({}) ignored", size);
      return false;
    }
    self.config.vector_size = size;
    self.reopen();
    true
  }

  fn input_samples(&self, channel: usize) -> Option<InputSamples<'_>> {
    if self.state != SessionState::Running {
      return None;
    }
    manager::input_guard(&self.shared, channel)
  }

  fn output_samples(&self, channel: usize) -> Option<OutputSamples<'_>> {
    if self.state != SessionState::Running {
      return None;
    }
    manager::output_guard(&self.shared, channel)
  }

  fn drain_faults(&mut self) -> Vec<TickFault> {
    manager::drain(&mut self.faults)
  }

  fn callback_stats(&self) -> CallbackStats {
    self.shared.meter.snapshot()
  }

  fn replace_graph(&mut self, graph: Box<dyn DspGraph>) {
    let live = (self.state == SessionState::Running).then_some(&self.config);
    self.shared.replace_graph(graph, live);
  }
}

impl<H: InterleavedHost> Drop for InterleavedDeviceManager<H> {
  fn drop(&mut self) {
    self.close_stream();
    if let Some(lease) = self.lease.take() {
      lease.release(&self.host);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn candidate_rates_are_sorted_and_unique() {
    let rates = candidate_sample_rates();
    assert_eq!(rates.first(), Some(&11_025));
    assert_eq!(rates.last(), Some(&80_000));
    assert!(rates.contains(&44_100));
    assert_eq!(rates.iter().filter(|r| **r == 48_000).count(), 1);
    assert!(rates.windows(2).all(|w| w[0] < w[1]));
  }

  #[test]
  fn candidate_vector_sizes_are_powers_of_two() {
    let sizes = candidate_vector_sizes();
    assert_eq!(sizes.len(), 14);
    assert_eq!(sizes[0], 1);
    assert_eq!(sizes[13], 8192);
    assert!(sizes.iter().all(|s| s.is_power_of_two()));
  }
}
