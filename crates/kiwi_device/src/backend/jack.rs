//! Planar backend over a JACK server.
//!
//! One device type named "JACK". Devices are the clients owning physical
//! ports (usually `system`): clients with capture ports are input devices,
//! clients with playback ports are output devices. Sample rate and buffer
//! size are whatever the server runs at.

use ::jack::{
  AsyncClient, AudioIn, AudioOut, Client, ClientOptions, Control, NotificationHandler, Port, PortFlags, ProcessHandler,
  ProcessScope,
};

use crate::config::{DeviceDescriptor, Direction};
use crate::error::BackendError;
use crate::lifecycle::BackendSubsystem;
use crate::planar::device::{ChannelMask, DeviceSetup, DeviceType, IoDevice, PlanarCallback, PlanarIo};

const AUDIO_PORT_TYPE: &str = "32 bit float mono audio";
const DEFAULT_CLIENT_NAME: &str = "kiwi";

fn open_client(name: &str) -> Result<Client, BackendError> {
  Client::new(name, ClientOptions::NO_START_SERVER)
    .map(|(client, _status)| client)
    .map_err(|e| BackendError::Init {
      reason: format!("Failed to create JACK client '{name}': {e}"),
    })
}

/// Physical port names grouped by owning client, in server order.
fn physical_ports(client: &Client, flags: PortFlags) -> Vec<(String, Vec<String>)> {
  let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
  for port in client.ports(None, Some(AUDIO_PORT_TYPE), PortFlags::IS_PHYSICAL | flags) {
    let owner = port.split(':').next().unwrap_or_default().to_string();
    match grouped.iter_mut().find(|(name, _)| *name == owner) {
      Some((_, ports)) => ports.push(port),
      None => grouped.push((owner, vec![port])),
    }
  }
  grouped
}

/// Capture ports are JACK outputs and playback ports are JACK inputs.
fn port_flags(direction: Direction) -> PortFlags {
  match direction {
    Direction::Input => PortFlags::IS_OUTPUT,
    Direction::Output => PortFlags::IS_INPUT,
  }
}

pub struct JackDeviceType {
  client_name: String,
  scanned: Vec<DeviceDescriptor>,
}

impl JackDeviceType {
  pub fn new() -> Self {
    Self::with_client_name(DEFAULT_CLIENT_NAME)
  }

  pub fn with_client_name(name: impl Into<String>) -> Self {
    Self {
      client_name: name.into(),
      scanned: Vec::new(),
    }
  }
}

impl Default for JackDeviceType {
  fn default() -> Self {
    Self::new()
  }
}

impl BackendSubsystem for JackDeviceType {
  fn subsystem_id(&self) -> String {
    "jack".to_string()
  }

  fn initialize(&self) -> Result<(), BackendError> {
    open_client(&self.client_name).map(drop)
  }
}

impl DeviceType for JackDeviceType {
  fn type_name(&self) -> &str {
    "JACK"
  }

  fn scan_for_devices(&mut self) {
    let client = match open_client(&self.client_name) {
      Ok(client) => client,
      Err(err) => {
        tracing::debug!("{}", err);
        self.scanned.clear();
        return;
      }
    };

    let mut scanned = Vec::new();
    for direction in [Direction::Input, Direction::Output] {
      for (name, ports) in physical_ports(&client, port_flags(direction)) {
        scanned.push(DeviceDescriptor {
          name,
          direction,
          max_channels: ports.len(),
        });
      }
    }
    self.scanned = scanned;
  }

  fn devices(&self) -> Vec<DeviceDescriptor> {
    self.scanned.clone()
  }

  fn create_device(&self, output: Option<&str>, input: Option<&str>) -> Result<Box<dyn IoDevice>, BackendError> {
    let client = open_client(&self.client_name)?;
    let find = |name: Option<&str>, direction: Direction| -> Vec<String> {
      let Some(name) = name else {
        return Vec::new();
      };
      physical_ports(&client, port_flags(direction))
        .into_iter()
        .find(|(owner, _)| owner == name)
        .map(|(_, ports)| ports)
        .unwrap_or_default()
    };
    let capture = find(input, Direction::Input);
    let playback = find(output, Direction::Output);
    let name = output.or(input).unwrap_or("JACK").to_string();

    Ok(Box::new(JackIoDevice {
      name,
      capture,
      playback,
      state: JackState::Closed(client),
      input_mask: ChannelMask::empty(),
      output_mask: ChannelMask::empty(),
    }))
  }
}

struct Notifications;

impl NotificationHandler for Notifications {}

struct JackProcess {
  inputs: Vec<Port<AudioIn>>,
  outputs: Vec<Port<AudioOut>>,
  callback: PlanarCallback,
}

impl ProcessHandler for JackProcess {
  fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
    profiling::scope!("jack_process");
    let mut io = JackIo {
      scope: ps,
      inputs: &self.inputs,
      outputs: &mut self.outputs,
    };
    (self.callback)(&mut io);
    Control::Continue
  }
}

struct JackIo<'a> {
  scope: &'a ProcessScope,
  inputs: &'a [Port<AudioIn>],
  outputs: &'a mut [Port<AudioOut>],
}

impl PlanarIo for JackIo<'_> {
  fn frames(&self) -> usize {
    self.scope.n_frames() as usize
  }

  fn input_channels(&self) -> usize {
    self.inputs.len()
  }

  fn input(&self, channel: usize) -> &[f32] {
    self.inputs[channel].as_slice(self.scope)
  }

  fn output_channels(&self) -> usize {
    self.outputs.len()
  }

  fn output(&mut self, channel: usize) -> &mut [f32] {
    self.outputs[channel].as_mut_slice(self.scope)
  }
}

enum JackState {
  Closed(Client),
  Open {
    client: Client,
    inputs: Vec<Port<AudioIn>>,
    outputs: Vec<Port<AudioOut>>,
  },
  Running(AsyncClient<Notifications, JackProcess>),
  /// Transient while moving between states, or after a failed deactivation
  Broken,
}

pub struct JackIoDevice {
  name: String,
  capture: Vec<String>,
  playback: Vec<String>,
  state: JackState,
  input_mask: ChannelMask,
  output_mask: ChannelMask,
}

impl JackIoDevice {
  fn client(&self) -> Option<&Client> {
    match &self.state {
      JackState::Closed(client) | JackState::Open { client, .. } => Some(client),
      JackState::Running(active) => Some(active.as_client()),
      JackState::Broken => None,
    }
  }

  fn connect(active: &AsyncClient<Notifications, JackProcess>, capture: &[String], playback: &[String]) {
    let client = active.as_client();
    let own = client.name().to_string();
    for (i, source) in capture.iter().enumerate() {
      let destination = format!("{}:in_{}", own, i + 1);
      if client.port_by_name(&destination).is_none() {
        break;
      }
      if let Err(err) = client.connect_ports_by_name(source, &destination) {
        tracing::warn!("Failed to connect {} to {}: {}", source, destination, err);
      }
    }
    for (i, destination) in playback.iter().enumerate() {
      let source = format!("{}:out_{}", own, i + 1);
      if client.port_by_name(&source).is_none() {
        break;
      }
      if let Err(err) = client.connect_ports_by_name(&source, destination) {
        tracing::warn!("Failed to connect {} to {}: {}", source, destination, err);
      }
    }
  }
}

impl IoDevice for JackIoDevice {
  fn name(&self) -> &str {
    &self.name
  }

  fn input_channel_names(&self) -> Vec<String> {
    self.capture.clone()
  }

  fn output_channel_names(&self) -> Vec<String> {
    self.playback.clone()
  }

  fn available_sample_rates(&self) -> Vec<u32> {
    self.client().map(|c| vec![c.sample_rate() as u32]).unwrap_or_default()
  }

  fn available_buffer_sizes(&self) -> Vec<usize> {
    self.client().map(|c| vec![c.buffer_size() as usize]).unwrap_or_default()
  }

  fn default_buffer_size(&self) -> usize {
    self.client().map_or(crate::DEFAULT_VECTOR_SIZE, |c| c.buffer_size() as usize)
  }

  fn open(&mut self, setup: &DeviceSetup) -> Result<(), BackendError> {
    self.close();
    let JackState::Closed(client) = std::mem::replace(&mut self.state, JackState::Broken) else {
      return Err(BackendError::StreamOpen {
        message: format!("{} has no JACK client", self.name),
      });
    };

    let input_count = setup.input_channels.intersect(ChannelMask::first(self.capture.len())).active_count();
    let output_count = setup.output_channels.intersect(ChannelMask::first(self.playback.len())).active_count();

    let mut inputs = Vec::with_capacity(input_count);
    let mut outputs = Vec::with_capacity(output_count);
    let registered = (|| -> Result<(), ::jack::Error> {
      for i in 0..input_count {
        inputs.push(client.register_port(&format!("in_{}", i + 1), AudioIn::default())?);
      }
      for i in 0..output_count {
        outputs.push(client.register_port(&format!("out_{}", i + 1), AudioOut::default())?);
      }
      Ok(())
    })();

    if let Err(err) = registered {
      for port in inputs {
        let _ = client.unregister_port(port);
      }
      for port in outputs {
        let _ = client.unregister_port(port);
      }
      self.state = JackState::Closed(client);
      return Err(BackendError::StreamOpen {
        message: format!("Failed to register JACK port: {err}"),
      });
    }

    self.input_mask = ChannelMask::first(input_count);
    self.output_mask = ChannelMask::first(output_count);
    self.state = JackState::Open {
      client,
      inputs,
      outputs,
    };
    Ok(())
  }

  fn close(&mut self) {
    self.stop();
    self.state = match std::mem::replace(&mut self.state, JackState::Broken) {
      JackState::Open {
        client,
        inputs,
        outputs,
      } => {
        for port in inputs {
          let _ = client.unregister_port(port);
        }
        for port in outputs {
          let _ = client.unregister_port(port);
        }
        JackState::Closed(client)
      }
      other => other,
    };
    self.input_mask = ChannelMask::empty();
    self.output_mask = ChannelMask::empty();
  }

  fn is_open(&self) -> bool {
    matches!(self.state, JackState::Open { .. } | JackState::Running(_))
  }

  fn start(&mut self, callback: PlanarCallback) -> Result<(), BackendError> {
    let JackState::Open {
      client,
      inputs,
      outputs,
    } = std::mem::replace(&mut self.state, JackState::Broken)
    else {
      return Err(BackendError::StreamStart {
        message: format!("{} is not open", self.name),
      });
    };

    let process = JackProcess {
      inputs,
      outputs,
      callback,
    };
    let active = client
      .activate_async(Notifications, process)
      .map_err(|e| BackendError::StreamStart {
        message: format!("Failed to activate JACK client: {e}"),
      })?;
    Self::connect(&active, &self.capture, &self.playback);
    self.state = JackState::Running(active);
    Ok(())
  }

  /// Deactivation is synchronous: the process callback has returned for
  /// good once this does.
  fn stop(&mut self) {
    if !matches!(self.state, JackState::Running(_)) {
      return;
    }
    let JackState::Running(active) = std::mem::replace(&mut self.state, JackState::Broken) else {
      return;
    };
    match active.deactivate() {
      Ok((client, _notifications, process)) => {
        self.state = JackState::Open {
          client,
          inputs: process.inputs,
          outputs: process.outputs,
        };
      }
      Err(err) => tracing::error!("Failed to deactivate JACK client: {}", err),
    }
  }

  fn is_stopped(&self) -> bool {
    !matches!(self.state, JackState::Running(_))
  }

  fn is_playing(&self) -> bool {
    matches!(self.state, JackState::Running(_))
  }

  fn current_sample_rate(&self) -> u32 {
    if self.is_open() {
      self.client().map_or(0, |c| c.sample_rate() as u32)
    } else {
      0
    }
  }

  fn current_buffer_size(&self) -> usize {
    if self.is_open() {
      self.client().map_or(0, |c| c.buffer_size() as usize)
    } else {
      0
    }
  }

  fn active_input_channels(&self) -> ChannelMask {
    self.input_mask
  }

  fn active_output_channels(&self) -> ChannelMask {
    self.output_mask
  }
}
