//! Device session over planar device types.

pub mod device;

use std::sync::Arc;

use crate::callback::{CallbackAdapter, CallbackStats, ProcessShared, TickFault};
use crate::config::{DeviceDescriptor, Direction, ManagerOptions, StreamConfiguration};
use crate::error::{BackendError, DeviceError};
use crate::graph::{DspGraph, Silence};
use crate::lifecycle::BackendLease;
use crate::manager::{self, DeviceManager, InputSamples, OutputSamples, SessionState};
use crate::session::{negotiate, resolve_device, wait_until_stopped};

use self::device::{ChannelMask, DeviceSetup, DeviceType, IoDevice, PlanarIo};

/// A [`DeviceManager`] driving one of several planar [`DeviceType`]s.
///
/// Drivers are device type names. Each device type is leased for the whole
/// lifetime of the manager.
pub struct PlanarDeviceManager {
  types: Vec<Box<dyn DeviceType>>,
  leases: Vec<BackendLease>,
  options: ManagerOptions,
  config: StreamConfiguration,
  device: Option<Box<dyn IoDevice>>,
  shared: Arc<ProcessShared>,
  faults: rtrb::Consumer<TickFault>,
  state: SessionState,
  generation: u64,
}

impl PlanarDeviceManager {
  pub fn new(types: Vec<Box<dyn DeviceType>>, options: ManagerOptions) -> Result<Self, DeviceError> {
    Self::with_graph(types, options, Box::new(Silence))
  }

  pub fn with_graph(
    mut types: Vec<Box<dyn DeviceType>>,
    options: ManagerOptions,
    graph: Box<dyn DspGraph>,
  ) -> Result<Self, DeviceError> {
    options.validate()?;

    let mut leases = Vec::with_capacity(types.len());
    for device_type in &types {
      match BackendLease::acquire(device_type.as_ref()) {
        Ok(lease) => leases.push(lease),
        Err(err) => {
          for (lease, acquired) in leases.into_iter().zip(&types) {
            lease.release(acquired.as_ref());
          }
          return Err(err);
        }
      }
    }

    for device_type in &mut types {
      device_type.scan_for_devices();
    }

    let names: Vec<String> = types.iter().map(|t| t.type_name().to_string()).collect();
    let driver = match options.driver.as_deref() {
      Some(name) if names.iter().any(|n| n == name) => Some(name.to_string()),
      preferred => {
        if let Some(name) = preferred {
          tracing::warn!("Device type {} is not available, using the first one", name);
        }
        names.first().cloned()
      }
    };
    tracing::info!("Selected audio device type: {}", driver.as_deref().unwrap_or("none"));

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
      types,
      leases,
      options,
      config,
      device: None,
      shared: ProcessShared::new(graph, producer),
      faults,
      state: SessionState::Closed,
      generation: 0,
    };
    manager.reopen();
    Ok(manager)
  }

  pub fn options(&self) -> &ManagerOptions {
    &self.options
  }

  /// The open device, if any.
  pub fn current_device(&self) -> Option<&dyn IoDevice> {
    self.device.as_deref()
  }

  fn current_type(&self) -> Option<&dyn DeviceType> {
    let name = self.config.driver.as_deref()?;
    self.types.iter().find(|t| t.type_name() == name).map(|t| t.as_ref())
  }

  fn rescan(&mut self) {
    let Some(name) = self.config.driver.as_deref() else {
      return;
    };
    if let Some(device_type) = self.types.iter_mut().find(|t| t.type_name() == name) {
      device_type.scan_for_devices();
    }
  }

  fn device_names(&self, direction: Direction) -> Vec<String> {
    self.current_type().map(|t| t.device_names(direction)).unwrap_or_default()
  }

  fn reopen(&mut self) {
    self.generation += 1;
    self.close_device();
    self.state = SessionState::Opening;

    match self.open_device() {
      Ok(()) => {
        self.state = SessionState::Running;
        tracing::info!(
          "Opened {} device: in={:?} ({} ch) out={:?} ({} ch) {} Hz, vector {}",
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
        tracing::error!("Failed to open audio device: {}", err);
        self.close_device();
      }
    }
  }

  fn open_device(&mut self) -> Result<(), BackendError> {
    self.rescan();
    let device_type = self.current_type().ok_or_else(|| BackendError::DriverNotFound {
      name: self.config.driver.clone().unwrap_or_else(|| "none".into()),
    })?;

    let input_device = resolve_device(
      self.config.input_device.as_deref(),
      None,
      &device_type.device_names(Direction::Input),
    );
    let output_device = resolve_device(
      self.config.output_device.as_deref(),
      None,
      &device_type.device_names(Direction::Output),
    );
    if input_device.is_none() && output_device.is_none() {
      return Err(BackendError::DeviceNotFound {
        name: "no input or output device".into(),
      });
    }

    let mut device = device_type.create_device(output_device.as_deref(), input_device.as_deref())?;

    let rates = device.available_sample_rates();
    let sample_rate = negotiate(self.config.sample_rate, &rates, None).ok_or_else(|| BackendError::UnsupportedConfig {
      message: format!("{} reports no sample rates", device.name()),
    })?;
    if sample_rate != self.config.sample_rate {
      tracing::warn!("Sample rate {} unsupported, using {}", self.config.sample_rate, sample_rate);
    }

    let buffer_size = if device.available_buffer_sizes().contains(&self.config.vector_size) {
      self.config.vector_size
    } else {
      let default = device.default_buffer_size();
      tracing::warn!("Vector size {} unsupported, using {}", self.config.vector_size, default);
      default
    };

    let input_mask = match input_device {
      Some(_) => ChannelMask::first(self.options.input_channels.min(device.input_channel_names().len())),
      None => ChannelMask::empty(),
    };
    let output_mask = match output_device {
      Some(_) => ChannelMask::first(self.options.output_channels.min(device.output_channel_names().len())),
      None => ChannelMask::empty(),
    };

    device.open(&DeviceSetup {
      output_device: output_device.clone(),
      input_device: input_device.clone(),
      sample_rate,
      buffer_size,
      input_channels: input_mask,
      output_channels: output_mask,
    })?;

    self.config.input_device = input_device;
    self.config.output_device = output_device;
    self.config.sample_rate = device.current_sample_rate();
    self.config.vector_size = device.current_buffer_size();
    self.config.input_channels = device.active_input_channels().active_count();
    self.config.output_channels = device.active_output_channels().active_count();
    self
      .shared
      .install(&self.config, self.config.input_channels, self.config.output_channels);

    let adapter = CallbackAdapter::new(self.shared.clone());
    let device = self.device.insert(device);
    device.start(Box::new(move |io: &mut dyn PlanarIo| adapter.process_planar(io)))
  }

  fn close_device(&mut self) {
    if let Some(mut device) = self.device.take() {
      if device.is_playing() {
        device.stop();
      }
      if !wait_until_stopped(|| device.is_stopped(), self.options.stop_timeout()) {
        tracing::warn!("Device {} did not stop in time, aborting", device.name());
        device.abort();
      }
      device.close();
      tracing::info!("Closed audio device {}", device.name());
    }

    self.shared.release();
    self.config.input_channels = 0;
    self.config.output_channels = 0;
    self.state = SessionState::Closed;
  }
}

impl DeviceManager for PlanarDeviceManager {
  fn available_drivers(&self) -> Vec<String> {
    self.types.iter().map(|t| t.type_name().to_string()).collect()
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
    self.current_type().map(|t| t.devices()).unwrap_or_default()
  }

  fn available_sample_rates(&self) -> Vec<u32> {
    self.device.as_ref().map(|d| d.available_sample_rates()).unwrap_or_default()
  }

  fn available_vector_sizes(&self) -> Vec<usize> {
    self.device.as_ref().map(|d| d.available_buffer_sizes()).unwrap_or_default()
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
    tracing::info!("Selected audio device type: {}", name);
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

impl Drop for PlanarDeviceManager {
  fn drop(&mut self) {
    self.close_device();
    let leases = std::mem::take(&mut self.leases);
    for (lease, device_type) in leases.into_iter().zip(&self.types) {
      lease.release(device_type.as_ref());
    }
  }
}
