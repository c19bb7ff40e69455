//! An in-process audio subsystem implementing both native models.
//!
//! Nothing runs on its own: the owner of a [`SimulatedHardware`] handle plays
//! the hardware thread and calls [`SimulatedHardware::run_period`] for every
//! period it wants processed. Devices can be added and removed at any time to
//! simulate hot-plugging.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{DeviceDescriptor, Direction};
use crate::error::BackendError;
use crate::interleaved::host::{HostDevice, InterleavedCallback, InterleavedHost, InterleavedStream, StreamParameters};
use crate::lifecycle::BackendSubsystem;
use crate::planar::device::{ChannelMask, DeviceSetup, DeviceType, IoDevice, PlanarCallback, PlanarIo};

use super::StreamGate;

/// One simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDevice {
  pub name: String,
  pub input_channels: usize,
  pub output_channels: usize,
  pub sample_rates: Vec<u32>,
  pub buffer_sizes: Vec<usize>,
  pub default_buffer_size: usize,
  /// Frames per period the hardware delivers regardless of the negotiated
  /// buffer size
  pub hardware_period: Option<usize>,
  /// Every open attempt fails
  pub fail_open: bool,
  /// A stopped stream keeps reporting a pending callback until aborted
  pub never_stops: bool,
}

impl SimulatedDevice {
  /// A stereo duplex device at 44.1/48 kHz with power-of-two buffers from
  /// 32 to 1024 frames.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      input_channels: 2,
      output_channels: 2,
      sample_rates: vec![44_100, 48_000],
      buffer_sizes: vec![32, 64, 128, 256, 512, 1024],
      default_buffer_size: 256,
      hardware_period: None,
      fail_open: false,
      never_stops: false,
    }
  }

  pub fn with_channels(mut self, inputs: usize, outputs: usize) -> Self {
    self.input_channels = inputs;
    self.output_channels = outputs;
    self
  }

  pub fn with_sample_rates(mut self, rates: impl Into<Vec<u32>>) -> Self {
    self.sample_rates = rates.into();
    self
  }

  pub fn with_buffer_sizes(mut self, sizes: impl Into<Vec<usize>>, default: usize) -> Self {
    self.buffer_sizes = sizes.into();
    self.default_buffer_size = default;
    self
  }

  pub fn with_hardware_period(mut self, frames: usize) -> Self {
    self.hardware_period = Some(frames);
    self
  }

  pub fn failing_open(mut self) -> Self {
    self.fail_open = true;
    self
  }

  pub fn never_stops(mut self) -> Self {
    self.never_stops = true;
    self
  }

  fn channels(&self, direction: Direction) -> usize {
    match direction {
      Direction::Input => self.input_channels,
      Direction::Output => self.output_channels,
    }
  }
}

#[derive(Debug, Clone)]
struct SimulatedDriver {
  name: String,
  devices: Vec<SimulatedDevice>,
  default_input: Option<String>,
  default_output: Option<String>,
}

impl SimulatedDriver {
  fn new(name: impl Into<String>, devices: Vec<SimulatedDevice>) -> Self {
    Self {
      name: name.into(),
      devices,
      default_input: None,
      default_output: None,
    }
  }
}

enum StreamCallback {
  Interleaved(InterleavedCallback),
  Planar(PlanarCallback),
  Detached,
}

/// One open native stream.
struct StreamCore {
  id: u64,
  gate: StreamGate,
  input_channels: usize,
  output_channels: usize,
  period: usize,
  sample_rate: u32,
  callback: Mutex<StreamCallback>,
  never_stops: bool,
  /// Set by a stop on a `never_stops` stream, cleared by abort
  wedged: AtomicBool,
}

impl StreamCore {
  fn stop(&self) {
    self.gate.close();
    if self.never_stops {
      self.wedged.store(true, Ordering::SeqCst);
    }
  }

  fn abort(&self) {
    self.gate.reset();
    self.wedged.store(false, Ordering::SeqCst);
  }

  fn is_stopped(&self) -> bool {
    self.gate.is_stopped() && !self.wedged.load(Ordering::SeqCst)
  }
}

struct HardwareInner {
  id: String,
  drivers: Mutex<Vec<SimulatedDriver>>,
  streams: Mutex<Vec<Arc<StreamCore>>>,
  next_stream_id: AtomicU64,
  fail_initialize: AtomicBool,
  initializations: AtomicUsize,
  terminations: AtomicUsize,
}

/// Handle to a simulated subsystem. Clones share the same hardware.
#[derive(Clone)]
pub struct SimulatedHardware {
  inner: Arc<HardwareInner>,
}

impl SimulatedHardware {
  /// An empty subsystem. `id` keys the process-wide init/teardown registry,
  /// so independent simulations need distinct ids.
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      inner: Arc::new(HardwareInner {
        id: id.into(),
        drivers: Mutex::new(Vec::new()),
        streams: Mutex::new(Vec::new()),
        next_stream_id: AtomicU64::new(1),
        fail_initialize: AtomicBool::new(false),
        initializations: AtomicUsize::new(0),
        terminations: AtomicUsize::new(0),
      }),
    }
  }

  /// Two drivers with a handful of typical devices.
  pub fn stock(id: impl Into<String>) -> Self {
    Self::new(id)
      .with_driver(
        "Simulated",
        vec![
          SimulatedDevice::new("Built-in Duplex"),
          SimulatedDevice::new("Built-in Microphone").with_channels(1, 0),
          SimulatedDevice::new("Built-in Speakers").with_channels(0, 2),
        ],
      )
      .with_driver(
        "Simulated Pro",
        vec![
          SimulatedDevice::new("Studio Interface")
            .with_channels(8, 8)
            .with_sample_rates([44_100, 48_000, 88_200, 96_000])
            .with_buffer_sizes([16, 32, 64, 128, 256], 128),
        ],
      )
  }

  pub fn with_driver(self, name: impl Into<String>, devices: Vec<SimulatedDevice>) -> Self {
    self.inner.drivers.lock().push(SimulatedDriver::new(name, devices));
    self
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  /// Replace the device list of a driver, creating the driver if needed.
  pub fn set_devices(&self, driver: &str, devices: Vec<SimulatedDevice>) {
    let mut drivers = self.inner.drivers.lock();
    match drivers.iter_mut().find(|d| d.name == driver) {
      Some(existing) => existing.devices = devices,
      None => drivers.push(SimulatedDriver::new(driver, devices)),
    }
  }

  /// Name the devices the driver reports as its defaults. Without one the
  /// driver has no default for that direction.
  pub fn set_default_devices(&self, driver: &str, input: Option<&str>, output: Option<&str>) {
    let mut drivers = self.inner.drivers.lock();
    if let Some(existing) = drivers.iter_mut().find(|d| d.name == driver) {
      existing.default_input = input.map(str::to_string);
      existing.default_output = output.map(str::to_string);
    }
  }

  pub fn add_device(&self, driver: &str, device: SimulatedDevice) {
    let mut drivers = self.inner.drivers.lock();
    if let Some(existing) = drivers.iter_mut().find(|d| d.name == driver) {
      existing.devices.push(device);
    }
  }

  pub fn remove_device(&self, driver: &str, name: &str) {
    let mut drivers = self.inner.drivers.lock();
    if let Some(existing) = drivers.iter_mut().find(|d| d.name == driver) {
      existing.devices.retain(|d| d.name != name);
    }
  }

  pub fn set_fail_initialize(&self, fail: bool) {
    self.inner.fail_initialize.store(fail, Ordering::SeqCst);
  }

  pub fn initializations(&self) -> usize {
    self.inner.initializations.load(Ordering::SeqCst)
  }

  pub fn terminations(&self) -> usize {
    self.inner.terminations.load(Ordering::SeqCst)
  }

  /// Native streams currently open, started or not.
  pub fn open_streams(&self) -> usize {
    self.inner.streams.lock().len()
  }

  /// One device type per driver, for a planar manager.
  pub fn device_types(&self) -> Vec<Box<dyn DeviceType>> {
    self
      .driver_names()
      .into_iter()
      .map(|driver| {
        Box::new(SimulatedDeviceType {
          hardware: self.clone(),
          driver,
          scanned: Vec::new(),
        }) as Box<dyn DeviceType>
      })
      .collect()
  }

  /// Frames per period and sample rate of the running stream.
  pub fn running_format(&self) -> Option<(usize, u32)> {
    self.running_stream().map(|s| (s.period, s.sample_rate))
  }

  /// Drive one period of the most recently started stream.
  ///
  /// `inputs` holds one buffer per input channel; missing channels and short
  /// buffers read as silence. Returns one buffer per output channel, or
  /// `None` when no stream is running.
  pub fn run_period(&self, inputs: &[Vec<f32>]) -> Option<Vec<Vec<f32>>> {
    let stream = self.running_stream()?;
    if !stream.gate.enter() {
      return None;
    }

    let frames = stream.period;
    let mut outputs = vec![vec![0.0f32; frames]; stream.output_channels];
    {
      let mut callback = stream.callback.lock();
      match &mut *callback {
        StreamCallback::Interleaved(callback) => {
          let mut input = vec![0.0f32; frames * stream.input_channels];
          interleave_frames(inputs, &mut input, stream.input_channels);
          let mut output = vec![0.0f32; frames * stream.output_channels];
          callback(&input, &mut output, frames);
          deinterleave_frames(&output, stream.output_channels, &mut outputs);
        }
        StreamCallback::Planar(callback) => {
          let mut io = SimulatedIo {
            frames,
            inputs: (0..stream.input_channels)
              .map(|ch| {
                let mut buffer = vec![0.0f32; frames];
                if let Some(src) = inputs.get(ch) {
                  let n = src.len().min(frames);
                  buffer[..n].copy_from_slice(&src[..n]);
                }
                buffer
              })
              .collect(),
            outputs,
          };
          callback(&mut io);
          outputs = io.outputs;
        }
        StreamCallback::Detached => {}
      }
    }

    stream.gate.leave();
    Some(outputs)
  }

  /// Real-time duration of one period of the running stream.
  pub fn period_duration(&self) -> Option<Duration> {
    let (frames, rate) = self.running_format()?;
    (rate > 0).then(|| Duration::from_secs_f64(frames as f64 / rate as f64))
  }

  fn running_stream(&self) -> Option<Arc<StreamCore>> {
    self.inner.streams.lock().iter().rev().find(|s| s.gate.is_running()).cloned()
  }

  fn driver_names(&self) -> Vec<String> {
    self.inner.drivers.lock().iter().map(|d| d.name.clone()).collect()
  }

  fn driver_devices(&self, driver: &str) -> Vec<SimulatedDevice> {
    self
      .inner
      .drivers
      .lock()
      .iter()
      .find(|d| d.name == driver)
      .map(|d| d.devices.clone())
      .unwrap_or_default()
  }

  fn driver_default(&self, driver: &str, direction: Direction) -> Option<String> {
    let drivers = self.inner.drivers.lock();
    let driver = drivers.iter().find(|d| d.name == driver)?;
    match direction {
      Direction::Input => driver.default_input.clone(),
      Direction::Output => driver.default_output.clone(),
    }
  }

  fn find_device(&self, driver: &str, name: &str) -> Option<SimulatedDevice> {
    self.driver_devices(driver).into_iter().find(|d| d.name == name)
  }

  fn register(&self, channels: [usize; 2], period: usize, sample_rate: u32, never_stops: bool) -> Arc<StreamCore> {
    let core = Arc::new(StreamCore {
      id: self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed),
      gate: StreamGate::default(),
      input_channels: channels[0],
      output_channels: channels[1],
      period,
      sample_rate,
      callback: Mutex::new(StreamCallback::Detached),
      never_stops,
      wedged: AtomicBool::new(false),
    });
    self.inner.streams.lock().push(core.clone());
    core
  }

  fn unregister(&self, core: &StreamCore) {
    core.gate.close();
    *core.callback.lock() = StreamCallback::Detached;
    self.inner.streams.lock().retain(|s| s.id != core.id);
  }

  fn registry_id(&self) -> String {
    format!("simulated:{}", self.inner.id)
  }

  fn start_subsystem(&self) -> Result<(), BackendError> {
    self.inner.initializations.fetch_add(1, Ordering::SeqCst);
    if self.inner.fail_initialize.load(Ordering::SeqCst) {
      return Err(BackendError::Init {
        reason: format!("simulated subsystem {} refused to start", self.inner.id),
      });
    }
    Ok(())
  }

  fn stop_subsystem(&self) {
    self.inner.terminations.fetch_add(1, Ordering::SeqCst);
  }
}

/// Planar buffers to interleaved frames; missing samples read as silence.
fn interleave_frames(src: &[Vec<f32>], dst: &mut [f32], channels: usize) {
  if channels == 0 {
    return;
  }
  for (frame_index, frame) in dst.chunks_exact_mut(channels).enumerate() {
    for (ch, out) in frame.iter_mut().enumerate() {
      *out = src.get(ch).and_then(|b| b.get(frame_index)).copied().unwrap_or(0.0);
    }
  }
}

fn deinterleave_frames(src: &[f32], channels: usize, dst: &mut [Vec<f32>]) {
  if channels == 0 {
    return;
  }
  for (frame_index, frame) in src.chunks_exact(channels).enumerate() {
    for (ch, sample) in frame.iter().enumerate() {
      if let Some(out) = dst.get_mut(ch).and_then(|b| b.get_mut(frame_index)) {
        *out = *sample;
      }
    }
  }
}

struct SimulatedIo {
  frames: usize,
  inputs: Vec<Vec<f32>>,
  outputs: Vec<Vec<f32>>,
}

impl PlanarIo for SimulatedIo {
  fn frames(&self) -> usize {
    self.frames
  }

  fn input_channels(&self) -> usize {
    self.inputs.len()
  }

  fn input(&self, channel: usize) -> &[f32] {
    &self.inputs[channel]
  }

  fn output_channels(&self) -> usize {
    self.outputs.len()
  }

  fn output(&mut self, channel: usize) -> &mut [f32] {
    &mut self.outputs[channel]
  }
}

// ============================================================================
// Interleaved model
// ============================================================================

impl BackendSubsystem for SimulatedHardware {
  fn subsystem_id(&self) -> String {
    self.registry_id()
  }

  fn initialize(&self) -> Result<(), BackendError> {
    self.start_subsystem()
  }

  fn terminate(&self) {
    self.stop_subsystem()
  }
}

impl SimulatedHardware {
  fn supports(&self, driver: &str, params: Option<&StreamParameters>, direction: Direction, check: impl Fn(&SimulatedDevice) -> bool) -> bool {
    params.is_none_or(|p| {
      self
        .find_device(driver, &p.device)
        .is_some_and(|d| p.channel_count <= d.channels(direction) && check(&d))
    })
  }
}

impl InterleavedHost for SimulatedHardware {
  fn host_names(&self) -> Vec<String> {
    self.driver_names()
  }

  fn default_host(&self) -> Option<String> {
    self.driver_names().into_iter().next()
  }

  fn default_input_device(&self, host: &str) -> Option<String> {
    self.driver_default(host, Direction::Input)
  }

  fn default_output_device(&self, host: &str) -> Option<String> {
    self.driver_default(host, Direction::Output)
  }

  fn devices(&mut self, host: &str) -> Vec<HostDevice> {
    self
      .driver_devices(host)
      .into_iter()
      .map(|d| HostDevice {
        name: d.name,
        max_input_channels: d.input_channels,
        max_output_channels: d.output_channels,
        default_buffer_size: Some(d.default_buffer_size),
      })
      .collect()
  }

  fn is_format_supported(
    &self,
    host: &str,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    sample_rate: u32,
  ) -> bool {
    let check = |d: &SimulatedDevice| d.sample_rates.contains(&sample_rate);
    self.supports(host, input, Direction::Input, check) && self.supports(host, output, Direction::Output, check)
  }

  fn is_buffer_size_supported(
    &self,
    host: &str,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    frames: usize,
  ) -> bool {
    let check = |d: &SimulatedDevice| d.buffer_sizes.contains(&frames);
    self.supports(host, input, Direction::Input, check) && self.supports(host, output, Direction::Output, check)
  }

  fn open_stream(
    &mut self,
    host: &str,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    sample_rate: u32,
    vector_size: usize,
    callback: InterleavedCallback,
  ) -> Result<Box<dyn InterleavedStream>, BackendError> {
    let mut channels = [0usize; 2];
    let mut period = None;
    let mut never_stops = false;
    for (slot, (params, direction)) in [(input, Direction::Input), (output, Direction::Output)].into_iter().enumerate() {
      let Some(params) = params else {
        continue;
      };
      let device = self
        .find_device(host, &params.device)
        .ok_or_else(|| BackendError::DeviceNotFound {
          name: params.device.clone(),
        })?;
      if device.fail_open {
        return Err(BackendError::StreamOpen {
          message: format!("{} refused to open", device.name),
        });
      }
      if !device.sample_rates.contains(&sample_rate) || !device.buffer_sizes.contains(&vector_size) {
        return Err(BackendError::UnsupportedConfig {
          message: format!("{}: {} Hz / {} frames", device.name, sample_rate, vector_size),
        });
      }
      channels[slot] = params.channel_count.min(device.channels(direction));
      period = period.or(device.hardware_period);
      never_stops |= device.never_stops;
    }

    if channels == [0, 0] {
      return Err(BackendError::StreamOpen {
        message: "a stream needs an input or an output".into(),
      });
    }

    let core = self.register(channels, period.unwrap_or(vector_size), sample_rate, never_stops);
    *core.callback.lock() = StreamCallback::Interleaved(callback);
    tracing::debug!("Simulated stream {} opened", core.id);
    Ok(Box::new(SimulatedStream {
      hardware: self.clone(),
      core,
    }))
  }
}

/// An interleaved stream on simulated hardware.
pub struct SimulatedStream {
  hardware: SimulatedHardware,
  core: Arc<StreamCore>,
}

impl InterleavedStream for SimulatedStream {
  fn input_channels(&self) -> usize {
    self.core.input_channels
  }

  fn output_channels(&self) -> usize {
    self.core.output_channels
  }

  fn start(&mut self) -> Result<(), BackendError> {
    self.core.gate.open();
    Ok(())
  }

  fn stop(&mut self) -> Result<(), BackendError> {
    self.core.stop();
    Ok(())
  }

  fn abort(&mut self) {
    self.core.abort();
  }

  fn is_active(&self) -> bool {
    self.core.gate.is_running()
  }

  fn is_stopped(&self) -> bool {
    self.core.is_stopped()
  }
}

impl Drop for SimulatedStream {
  fn drop(&mut self) {
    self.hardware.unregister(&self.core);
  }
}

// ============================================================================
// Planar model
// ============================================================================

/// One driver of the simulated hardware seen as a planar device type.
pub struct SimulatedDeviceType {
  hardware: SimulatedHardware,
  driver: String,
  scanned: Vec<SimulatedDevice>,
}

impl BackendSubsystem for SimulatedDeviceType {
  fn subsystem_id(&self) -> String {
    self.hardware.registry_id()
  }

  fn initialize(&self) -> Result<(), BackendError> {
    self.hardware.start_subsystem()
  }

  fn terminate(&self) {
    self.hardware.stop_subsystem()
  }
}

impl DeviceType for SimulatedDeviceType {
  fn type_name(&self) -> &str {
    &self.driver
  }

  fn scan_for_devices(&mut self) {
    self.scanned = self.hardware.driver_devices(&self.driver);
  }

  fn devices(&self) -> Vec<DeviceDescriptor> {
    let mut descriptors = Vec::new();
    for direction in [Direction::Input, Direction::Output] {
      for device in &self.scanned {
        let max_channels = device.channels(direction);
        if max_channels > 0 {
          descriptors.push(DeviceDescriptor {
            name: device.name.clone(),
            direction,
            max_channels,
          });
        }
      }
    }
    descriptors
  }

  fn create_device(&self, output: Option<&str>, input: Option<&str>) -> Result<Box<dyn IoDevice>, BackendError> {
    let lookup = |name: Option<&str>| -> Result<Option<SimulatedDevice>, BackendError> {
      match name {
        Some(name) => self
          .scanned
          .iter()
          .find(|d| d.name == name)
          .cloned()
          .map(Some)
          .ok_or_else(|| BackendError::DeviceNotFound { name: name.to_string() }),
        None => Ok(None),
      }
    };
    let output = lookup(output)?;
    let input = lookup(input)?;
    let name = output
      .as_ref()
      .or(input.as_ref())
      .map(|d| d.name.clone())
      .ok_or_else(|| BackendError::DeviceNotFound {
        name: "no input or output device".into(),
      })?;

    Ok(Box::new(SimulatedIoDevice {
      hardware: self.hardware.clone(),
      name,
      input,
      output,
      open: None,
    }))
  }
}

struct OpenDevice {
  core: Arc<StreamCore>,
  sample_rate: u32,
  buffer_size: usize,
  input_mask: ChannelMask,
  output_mask: ChannelMask,
}

/// A combined input/output device on simulated hardware.
pub struct SimulatedIoDevice {
  hardware: SimulatedHardware,
  name: String,
  input: Option<SimulatedDevice>,
  output: Option<SimulatedDevice>,
  open: Option<OpenDevice>,
}

impl SimulatedIoDevice {
  fn parts(&self) -> impl Iterator<Item = &SimulatedDevice> {
    self.output.iter().chain(self.input.iter())
  }

  fn channel_names(device: Option<&SimulatedDevice>, direction: Direction) -> Vec<String> {
    let count = device.map_or(0, |d| d.channels(direction));
    let label = match direction {
      Direction::Input => "in",
      Direction::Output => "out",
    };
    (1..=count).map(|i| format!("{} {}", label, i)).collect()
  }
}

impl IoDevice for SimulatedIoDevice {
  fn name(&self) -> &str {
    &self.name
  }

  fn input_channel_names(&self) -> Vec<String> {
    Self::channel_names(self.input.as_ref(), Direction::Input)
  }

  fn output_channel_names(&self) -> Vec<String> {
    Self::channel_names(self.output.as_ref(), Direction::Output)
  }

  /// Rates every part of the device supports.
  fn available_sample_rates(&self) -> Vec<u32> {
    let mut parts = self.parts();
    let Some(first) = parts.next() else {
      return Vec::new();
    };
    let rest: Vec<&SimulatedDevice> = parts.collect();
    first
      .sample_rates
      .iter()
      .copied()
      .filter(|r| rest.iter().all(|d| d.sample_rates.contains(r)))
      .collect()
  }

  fn available_buffer_sizes(&self) -> Vec<usize> {
    let mut parts = self.parts();
    let Some(first) = parts.next() else {
      return Vec::new();
    };
    let rest: Vec<&SimulatedDevice> = parts.collect();
    first
      .buffer_sizes
      .iter()
      .copied()
      .filter(|s| rest.iter().all(|d| d.buffer_sizes.contains(s)))
      .collect()
  }

  fn default_buffer_size(&self) -> usize {
    self.parts().next().map_or(crate::DEFAULT_VECTOR_SIZE, |d| d.default_buffer_size)
  }

  fn open(&mut self, setup: &DeviceSetup) -> Result<(), BackendError> {
    self.close();

    if let Some(device) = self.parts().find(|d| d.fail_open) {
      return Err(BackendError::StreamOpen {
        message: format!("{} refused to open", device.name),
      });
    }
    if !self.available_sample_rates().contains(&setup.sample_rate) {
      return Err(BackendError::UnsupportedConfig {
        message: format!("{}: {} Hz", self.name, setup.sample_rate),
      });
    }
    if !self.available_buffer_sizes().contains(&setup.buffer_size) {
      return Err(BackendError::UnsupportedConfig {
        message: format!("{}: {} frames", self.name, setup.buffer_size),
      });
    }

    let input_mask = setup
      .input_channels
      .intersect(ChannelMask::first(self.input.as_ref().map_or(0, |d| d.input_channels)));
    let output_mask = setup
      .output_channels
      .intersect(ChannelMask::first(self.output.as_ref().map_or(0, |d| d.output_channels)));
    let period = self.parts().find_map(|d| d.hardware_period).unwrap_or(setup.buffer_size);

    let never_stops = self.parts().any(|d| d.never_stops);
    let core = self.hardware.register(
      [input_mask.active_count(), output_mask.active_count()],
      period,
      setup.sample_rate,
      never_stops,
    );
    tracing::debug!("Simulated device {} opened as stream {}", self.name, core.id);
    self.open = Some(OpenDevice {
      core,
      sample_rate: setup.sample_rate,
      buffer_size: setup.buffer_size,
      input_mask,
      output_mask,
    });
    Ok(())
  }

  fn close(&mut self) {
    if let Some(open) = self.open.take() {
      self.hardware.unregister(&open.core);
    }
  }

  fn is_open(&self) -> bool {
    self.open.is_some()
  }

  fn start(&mut self, callback: PlanarCallback) -> Result<(), BackendError> {
    let Some(open) = self.open.as_ref() else {
      return Err(BackendError::StreamStart {
        message: format!("{} is not open", self.name),
      });
    };
    *open.core.callback.lock() = StreamCallback::Planar(callback);
    open.core.gate.open();
    Ok(())
  }

  fn stop(&mut self) {
    if let Some(open) = self.open.as_ref() {
      open.core.stop();
    }
  }

  fn is_stopped(&self) -> bool {
    self.open.as_ref().is_none_or(|open| open.core.is_stopped())
  }

  fn abort(&mut self) {
    if let Some(open) = self.open.as_ref() {
      open.core.abort();
    }
    self.close();
  }

  fn is_playing(&self) -> bool {
    self.open.as_ref().is_some_and(|open| open.core.gate.is_running())
  }

  fn current_sample_rate(&self) -> u32 {
    self.open.as_ref().map_or(0, |open| open.sample_rate)
  }

  fn current_buffer_size(&self) -> usize {
    self.open.as_ref().map_or(0, |open| open.buffer_size)
  }

  fn active_input_channels(&self) -> ChannelMask {
    self.open.as_ref().map_or(ChannelMask::empty(), |open| open.input_mask)
  }

  fn active_output_channels(&self) -> ChannelMask {
    self.open.as_ref().map_or(ChannelMask::empty(), |open| open.output_mask)
  }
}

impl Drop for SimulatedIoDevice {
  fn drop(&mut self) {
    self.close();
  }
}
