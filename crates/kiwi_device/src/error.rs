//! Error types for the device layer.

use std::path::PathBuf;

/// Fatal errors returned from manager construction.
#[derive(Debug)]
pub enum DeviceError {
  /// A native subsystem failed its one-time initialization
  BackendInit { subsystem: String, reason: String },

  /// Construction was given options that fail validation
  InvalidOptions(OptionsError),
}

impl std::fmt::Display for DeviceError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      DeviceError::BackendInit { subsystem, reason } => {
        write!(f, "Failed to initialize audio subsystem {}: {}", subsystem, reason)
      }
      DeviceError::InvalidOptions(err) => write!(f, "Invalid manager options: {}", err),
    }
  }
}

impl std::error::Error for DeviceError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      DeviceError::InvalidOptions(err) => Some(err),
      DeviceError::BackendInit { .. } => None,
    }
  }
}

impl From<OptionsError> for DeviceError {
  fn from(err: OptionsError) -> Self {
    DeviceError::InvalidOptions(err)
  }
}

/// Errors reported by a native backend. These never leave a manager: they
/// close the session and are logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
  /// Subsystem initialization failed
  Init { reason: String },

  /// The named driver or device type does not exist
  DriverNotFound { name: String },

  /// The named device does not exist on the current driver
  DeviceNotFound { name: String },

  /// The device rejected the requested parameters
  UnsupportedConfig { message: String },

  /// The native stream could not be opened
  StreamOpen { message: String },

  /// The native stream opened but could not be started
  StreamStart { message: String },

  /// The native stream reported an error while stopping
  StreamStop { message: String },
}

impl std::fmt::Display for BackendError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BackendError::Init { reason } => write!(f, "Backend initialization failed: {}", reason),
      BackendError::DriverNotFound { name } => write!(f, "Driver not found: {}", name),
      BackendError::DeviceNotFound { name } => write!(f, "Device not found: {}", name),
      BackendError::UnsupportedConfig { message } => {
        write!(f, "Unsupported configuration: {}", message)
      }
      BackendError::StreamOpen { message } => write!(f, "Failed to open stream: {}", message),
      BackendError::StreamStart { message } => write!(f, "Failed to start stream: {}", message),
      BackendError::StreamStop { message } => write!(f, "Failed to stop stream: {}", message),
    }
  }
}

impl std::error::Error for BackendError {}

/// Errors returned by a DSP graph tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickError {
  Failed { message: String },
}

impl TickError {
  pub fn failed(message: impl Into<String>) -> Self {
    TickError::Failed {
      message: message.into(),
    }
  }
}

impl std::fmt::Display for TickError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TickError::Failed { message } => write!(f, "Tick failed: {}", message),
    }
  }
}

impl std::error::Error for TickError {}

/// Errors loading or validating [`ManagerOptions`](crate::ManagerOptions).
#[derive(Debug)]
pub enum OptionsError {
  Io { path: PathBuf, source: std::io::Error },
  Parse(serde_json::Error),
  Invalid { field: &'static str, message: String },
}

impl std::fmt::Display for OptionsError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      OptionsError::Io { path, source } => {
        write!(f, "Failed to read {}: {}", path.display(), source)
      }
      OptionsError::Parse(err) => write!(f, "Failed to parse options: {}", err),
      OptionsError::Invalid { field, message } => write!(f, "{}: {}", field, message),
    }
  }
}

impl std::error::Error for OptionsError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      OptionsError::Io { source, .. } => Some(source),
      OptionsError::Parse(err) => Some(err),
      OptionsError::Invalid { .. } => None,
    }
  }
}

impl From<serde_json::Error> for OptionsError {
  fn from(err: serde_json::Error) -> Self {
    OptionsError::Parse(err)
  }
}
