//! Interleaved backend over cpal hosts (ALSA, JACK, CoreAudio, WASAPI, ...).
//!
//! cpal has no duplex streams. When both directions are open, the input
//! stream pushes into a ring buffer and the output stream drives the
//! callback, reading one period of input from the ring.

use std::sync::Arc;

use ::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ::cpal::{FromSample, Sample, SizedSample};
use ringbuf::{
  HeapRb,
  traits::{Consumer, Producer, Split},
};

use crate::error::BackendError;
use crate::interleaved::host::{HostDevice, InterleavedCallback, InterleavedHost, InterleavedStream, StreamParameters};
use crate::lifecycle::BackendSubsystem;

use super::StreamGate;

/// Periods of input buffered between the input and output streams.
const INPUT_RING_PERIODS: usize = 8;

/// Upper bound on frames handed to the callback at once when the host
/// delivers more than the negotiated buffer size.
const MAX_CALLBACK_FRAMES: usize = 8192;

/// All cpal hosts compiled into this build.
pub struct CpalHost {
  hosts: Vec<::cpal::Host>,
}

impl CpalHost {
  pub fn new() -> Self {
    let hosts = ::cpal::available_hosts()
      .into_iter()
      .filter_map(|id| match ::cpal::host_from_id(id) {
        Ok(host) => Some(host),
        Err(err) => {
          tracing::debug!("cpal host {} unavailable: {}", id.name(), err);
          None
        }
      })
      .collect();
    Self { hosts }
  }

  fn host(&self, name: &str) -> Option<&::cpal::Host> {
    self.hosts.iter().find(|h| h.id().name() == name)
  }

  fn find_device(&self, host: &str, name: &str) -> Option<::cpal::Device> {
    self
      .host(host)?
      .devices()
      .ok()?
      .find(|d| device_name(d).as_deref() == Some(name))
  }
}

impl Default for CpalHost {
  fn default() -> Self {
    Self::new()
  }
}

fn device_name(device: &::cpal::Device) -> Option<String> {
  device.description().ok().map(|d| d.name().to_owned())
}

fn max_channels(configs: impl Iterator<Item = ::cpal::SupportedStreamConfigRange>) -> usize {
  configs.map(|c| c.channels() as usize).max().unwrap_or(0)
}

fn input_configs(device: &::cpal::Device) -> Vec<::cpal::SupportedStreamConfigRange> {
  device.supported_input_configs().map(|c| c.collect()).unwrap_or_default()
}

fn output_configs(device: &::cpal::Device) -> Vec<::cpal::SupportedStreamConfigRange> {
  device.supported_output_configs().map(|c| c.collect()).unwrap_or_default()
}

fn supports_rate(configs: &[::cpal::SupportedStreamConfigRange], channels: usize, rate: u32) -> bool {
  configs
    .iter()
    .any(|c| c.channels() as usize >= channels && c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
}

fn supports_buffer_size(configs: &[::cpal::SupportedStreamConfigRange], channels: usize, frames: usize) -> bool {
  configs.iter().any(|c| {
    c.channels() as usize >= channels
      && match c.buffer_size() {
        ::cpal::SupportedBufferSize::Range { min, max } => (*min as usize..=*max as usize).contains(&frames),
        ::cpal::SupportedBufferSize::Unknown => true,
      }
  })
}

/// The narrowest supported config with at least `channels` channels at `rate`.
fn pick_config(
  configs: Vec<::cpal::SupportedStreamConfigRange>,
  channels: usize,
  rate: u32,
) -> Option<::cpal::SupportedStreamConfigRange> {
  configs
    .into_iter()
    .filter(|c| c.channels() as usize >= channels && c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
    .min_by_key(|c| c.channels())
}

impl BackendSubsystem for CpalHost {
  fn subsystem_id(&self) -> String {
    "cpal".to_string()
  }

  fn initialize(&self) -> Result<(), BackendError> {
    if self.hosts.is_empty() {
      return Err(BackendError::Init {
        reason: "no cpal host is available".into(),
      });
    }
    Ok(())
  }
}

impl InterleavedHost for CpalHost {
  fn host_names(&self) -> Vec<String> {
    self.hosts.iter().map(|h| h.id().name().to_string()).collect()
  }

  fn default_host(&self) -> Option<String> {
    let default = ::cpal::default_host().id().name();
    self.host(default).map(|_| default.to_string())
  }

  fn default_input_device(&self, host: &str) -> Option<String> {
    self.host(host)?.default_input_device().as_ref().and_then(device_name)
  }

  fn default_output_device(&self, host: &str) -> Option<String> {
    self.host(host)?.default_output_device().as_ref().and_then(device_name)
  }

  fn devices(&mut self, host: &str) -> Vec<HostDevice> {
    let Some(devices) = self.host(host).and_then(|h| h.devices().ok()) else {
      return Vec::new();
    };
    devices
      .filter_map(|device| {
        let name = device_name(&device)?;
        Some(HostDevice {
          name,
          max_input_channels: device.supported_input_configs().map(max_channels).unwrap_or(0),
          max_output_channels: device.supported_output_configs().map(max_channels).unwrap_or(0),
          default_buffer_size: None,
        })
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
    let input_ok = input.is_none_or(|p| {
      self
        .find_device(host, &p.device)
        .is_some_and(|d| supports_rate(&input_configs(&d), p.channel_count, sample_rate))
    });
    let output_ok = output.is_none_or(|p| {
      self
        .find_device(host, &p.device)
        .is_some_and(|d| supports_rate(&output_configs(&d), p.channel_count, sample_rate))
    });
    input_ok && output_ok
  }

  fn is_buffer_size_supported(
    &self,
    host: &str,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    frames: usize,
  ) -> bool {
    let input_ok = input.is_none_or(|p| {
      self
        .find_device(host, &p.device)
        .is_some_and(|d| supports_buffer_size(&input_configs(&d), p.channel_count, frames))
    });
    let output_ok = output.is_none_or(|p| {
      self
        .find_device(host, &p.device)
        .is_some_and(|d| supports_buffer_size(&output_configs(&d), p.channel_count, frames))
    });
    input_ok && output_ok
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
    let gate = Arc::new(StreamGate::default());
    let resolve = |p: &StreamParameters| {
      self.find_device(host, &p.device).ok_or_else(|| BackendError::DeviceNotFound {
        name: p.device.clone(),
      })
    };

    let input = match input {
      Some(p) => {
        let device = resolve(p)?;
        let range = pick_config(input_configs(&device), p.channel_count, sample_rate).ok_or_else(|| {
          BackendError::UnsupportedConfig {
            message: format!("{}: {} input channels at {} Hz", p.device, p.channel_count, sample_rate),
          }
        })?;
        Some((device, range))
      }
      None => None,
    };
    let output = match output {
      Some(p) => {
        let device = resolve(p)?;
        let range = pick_config(output_configs(&device), p.channel_count, sample_rate).ok_or_else(|| {
          BackendError::UnsupportedConfig {
            message: format!("{}: {} output channels at {} Hz", p.device, p.channel_count, sample_rate),
          }
        })?;
        Some((device, range))
      }
      None => None,
    };

    let stream_config = |range: &::cpal::SupportedStreamConfigRange| ::cpal::StreamConfig {
      channels: range.channels(),
      sample_rate,
      buffer_size: ::cpal::BufferSize::Fixed(vector_size as u32),
    };

    let input_channels = input.as_ref().map_or(0, |(_, r)| r.channels() as usize);
    let output_channels = output.as_ref().map_or(0, |(_, r)| r.channels() as usize);

    let (input_stream, output_stream) = match (input, output) {
      (Some((in_device, in_range)), Some((out_device, out_range))) => {
        let ring = HeapRb::<f32>::new((vector_size * input_channels * INPUT_RING_PERIODS).max(1));
        let (producer, consumer) = ring.split();
        let input_stream = build_input_writer(&in_device, &stream_config(&in_range), in_range.sample_format(), producer)?;
        let output_stream = build_output_driver(
          &out_device,
          &stream_config(&out_range),
          out_range.sample_format(),
          OutputDriver {
            callback,
            gate: gate.clone(),
            input: Some(consumer),
            input_channels,
            output_channels,
            scratch_in: vec![0.0; MAX_CALLBACK_FRAMES * input_channels],
            scratch_out: vec![0.0; MAX_CALLBACK_FRAMES * output_channels],
          },
        )?;
        (Some(input_stream), Some(output_stream))
      }
      (None, Some((out_device, out_range))) => {
        let output_stream = build_output_driver(
          &out_device,
          &stream_config(&out_range),
          out_range.sample_format(),
          OutputDriver {
            callback,
            gate: gate.clone(),
            input: None,
            input_channels: 0,
            output_channels,
            scratch_in: Vec::new(),
            scratch_out: vec![0.0; MAX_CALLBACK_FRAMES * output_channels],
          },
        )?;
        (None, Some(output_stream))
      }
      (Some((in_device, in_range)), None) => {
        let input_stream = build_input_driver(
          &in_device,
          &stream_config(&in_range),
          in_range.sample_format(),
          InputDriver {
            callback,
            gate: gate.clone(),
            input_channels,
            scratch_in: vec![0.0; MAX_CALLBACK_FRAMES * input_channels],
          },
        )?;
        (Some(input_stream), None)
      }
      (None, None) => {
        return Err(BackendError::StreamOpen {
          message: "a stream needs an input or an output".into(),
        });
      }
    };

    Ok(Box::new(CpalStream {
      input: input_stream,
      output: output_stream,
      input_channels,
      output_channels,
      gate,
    }))
  }
}

struct OutputDriver {
  callback: InterleavedCallback,
  gate: Arc<StreamGate>,
  input: Option<ringbuf::HeapCons<f32>>,
  input_channels: usize,
  output_channels: usize,
  scratch_in: Vec<f32>,
  scratch_out: Vec<f32>,
}

impl OutputDriver {
  fn process<T>(&mut self, data: &mut [T])
  where
    T: SizedSample + FromSample<f32>,
  {
    profiling::scope!("cpal_output_callback");
    if self.output_channels == 0 || !self.gate.enter() {
      data.fill(<T as ::cpal::Sample>::EQUILIBRIUM);
      return;
    }

    for chunk in data.chunks_mut(MAX_CALLBACK_FRAMES * self.output_channels) {
      let frames = chunk.len() / self.output_channels;
      let input = &mut self.scratch_in[..frames * self.input_channels];
      match self.input.as_mut() {
        Some(ring) => {
          for s in input.iter_mut() {
            *s = ring.try_pop().unwrap_or(0.0);
          }
        }
        None => input.fill(0.0),
      }

      let output = &mut self.scratch_out[..frames * self.output_channels];
      (self.callback)(input, output, frames);

      for (d, s) in chunk.iter_mut().zip(output.iter()) {
        *d = T::from_sample(*s);
      }
    }

    self.gate.leave();
  }
}

struct InputDriver {
  callback: InterleavedCallback,
  gate: Arc<StreamGate>,
  input_channels: usize,
  scratch_in: Vec<f32>,
}

impl InputDriver {
  fn process<T>(&mut self, data: &[T])
  where
    T: SizedSample,
    f32: FromSample<T>,
  {
    profiling::scope!("cpal_input_callback");
    if self.input_channels == 0 || !self.gate.enter() {
      return;
    }

    for chunk in data.chunks(MAX_CALLBACK_FRAMES * self.input_channels) {
      let frames = chunk.len() / self.input_channels;
      let input = &mut self.scratch_in[..frames * self.input_channels];
      for (d, s) in input.iter_mut().zip(chunk) {
        *d = f32::from_sample(*s);
      }
      (self.callback)(input, &mut [], frames);
    }

    self.gate.leave();
  }
}

fn stream_error(err: ::cpal::StreamError) {
  tracing::error!("Audio stream error: {}", err);
}

fn build_failed(err: ::cpal::BuildStreamError) -> BackendError {
  BackendError::StreamOpen {
    message: err.to_string(),
  }
}

fn make_output_stream<T>(
  device: &::cpal::Device,
  config: &::cpal::StreamConfig,
  mut driver: OutputDriver,
) -> Result<::cpal::Stream, BackendError>
where
  T: SizedSample + FromSample<f32>,
{
  device
    .build_output_stream(
      config,
      move |data: &mut [T], _info: &::cpal::OutputCallbackInfo| driver.process(data),
      stream_error,
      None,
    )
    .map_err(build_failed)
}

fn make_input_stream<T>(
  device: &::cpal::Device,
  config: &::cpal::StreamConfig,
  mut driver: InputDriver,
) -> Result<::cpal::Stream, BackendError>
where
  T: SizedSample,
  f32: FromSample<T>,
{
  device
    .build_input_stream(
      config,
      move |data: &[T], _info: &::cpal::InputCallbackInfo| driver.process(data),
      stream_error,
      None,
    )
    .map_err(build_failed)
}

/// Input half of a duplex stream: converts and pushes into the ring.
fn make_input_writer<T>(
  device: &::cpal::Device,
  config: &::cpal::StreamConfig,
  mut producer: ringbuf::HeapProd<f32>,
) -> Result<::cpal::Stream, BackendError>
where
  T: SizedSample,
  f32: FromSample<T>,
{
  device
    .build_input_stream(
      config,
      move |data: &[T], _info: &::cpal::InputCallbackInfo| {
        profiling::scope!("cpal_input_writer");
        for &s in data {
          // Drop samples if the ring is full
          let _ = producer.try_push(f32::from_sample(s));
        }
      },
      stream_error,
      None,
    )
    .map_err(build_failed)
}

fn unsupported_format(format: ::cpal::SampleFormat) -> BackendError {
  BackendError::UnsupportedConfig {
    message: format!("sample format {:?}", format),
  }
}

fn build_output_driver(
  device: &::cpal::Device,
  config: &::cpal::StreamConfig,
  format: ::cpal::SampleFormat,
  driver: OutputDriver,
) -> Result<::cpal::Stream, BackendError> {
  match format {
    ::cpal::SampleFormat::I8 => make_output_stream::<i8>(device, config, driver),
    ::cpal::SampleFormat::I16 => make_output_stream::<i16>(device, config, driver),
    ::cpal::SampleFormat::I32 => make_output_stream::<i32>(device, config, driver),
    ::cpal::SampleFormat::U16 => make_output_stream::<u16>(device, config, driver),
    ::cpal::SampleFormat::F32 => make_output_stream::<f32>(device, config, driver),
    _ => Err(unsupported_format(format)),
  }
}

fn build_input_driver(
  device: &::cpal::Device,
  config: &::cpal::StreamConfig,
  format: ::cpal::SampleFormat,
  driver: InputDriver,
) -> Result<::cpal::Stream, BackendError> {
  match format {
    ::cpal::SampleFormat::I8 => make_input_stream::<i8>(device, config, driver),
    ::cpal::SampleFormat::I16 => make_input_stream::<i16>(device, config, driver),
    ::cpal::SampleFormat::I32 => make_input_stream::<i32>(device, config, driver),
    ::cpal::SampleFormat::U16 => make_input_stream::<u16>(device, config, driver),
    ::cpal::SampleFormat::F32 => make_input_stream::<f32>(device, config, driver),
    _ => Err(unsupported_format(format)),
  }
}

fn build_input_writer(
  device: &::cpal::Device,
  config: &::cpal::StreamConfig,
  format: ::cpal::SampleFormat,
  producer: ringbuf::HeapProd<f32>,
) -> Result<::cpal::Stream, BackendError> {
  match format {
    ::cpal::SampleFormat::I8 => make_input_writer::<i8>(device, config, producer),
    ::cpal::SampleFormat::I16 => make_input_writer::<i16>(device, config, producer),
    ::cpal::SampleFormat::I32 => make_input_writer::<i32>(device, config, producer),
    ::cpal::SampleFormat::U16 => make_input_writer::<u16>(device, config, producer),
    ::cpal::SampleFormat::F32 => make_input_writer::<f32>(device, config, producer),
    _ => Err(unsupported_format(format)),
  }
}

/// One or two cpal streams acting as a single interleaved stream.
pub struct CpalStream {
  input: Option<::cpal::Stream>,
  output: Option<::cpal::Stream>,
  input_channels: usize,
  output_channels: usize,
  gate: Arc<StreamGate>,
}

impl CpalStream {
  fn pause_all(&self) -> Result<(), BackendError> {
    for stream in self.output.iter().chain(self.input.iter()) {
      stream.pause().map_err(|e| BackendError::StreamStop { message: e.to_string() })?;
    }
    Ok(())
  }
}

impl InterleavedStream for CpalStream {
  fn input_channels(&self) -> usize {
    self.input_channels
  }

  fn output_channels(&self) -> usize {
    self.output_channels
  }

  fn start(&mut self) -> Result<(), BackendError> {
    self.gate.open();
    // Input first so the ring has data when the output asks for it
    for stream in self.input.iter().chain(self.output.iter()) {
      if let Err(err) = stream.play() {
        self.gate.close();
        return Err(BackendError::StreamStart { message: err.to_string() });
      }
    }
    Ok(())
  }

  fn stop(&mut self) -> Result<(), BackendError> {
    self.gate.close();
    self.pause_all()
  }

  fn abort(&mut self) {
    self.gate.close();
    // Dropping a cpal stream tears it down synchronously
    self.output = None;
    self.input = None;
    self.gate.reset();
  }

  fn is_active(&self) -> bool {
    self.gate.is_running()
  }

  fn is_stopped(&self) -> bool {
    self.gate.is_stopped()
  }
}
