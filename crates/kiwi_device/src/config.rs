//! Descriptors, the live stream configuration and construction options.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OptionsError;
use crate::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, DEFAULT_VECTOR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Input,
  Output,
}

impl std::fmt::Display for Direction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Direction::Input => write!(f, "input"),
      Direction::Output => write!(f, "output"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
  pub name: String,
  pub direction: Direction,
  pub max_channels: usize,
}

/// The live configuration of a session.
///
/// Channel counts are the effective counts reported by the opened stream,
/// not the requested ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfiguration {
  pub driver: Option<String>,
  pub input_device: Option<String>,
  pub output_device: Option<String>,
  pub sample_rate: u32,
  pub vector_size: usize,
  pub input_channels: usize,
  pub output_channels: usize,
}

impl Default for StreamConfiguration {
  fn default() -> Self {
    Self {
      driver: None,
      input_device: None,
      output_device: None,
      sample_rate: DEFAULT_SAMPLE_RATE,
      vector_size: DEFAULT_VECTOR_SIZE,
      input_channels: 0,
      output_channels: 0,
    }
  }
}

/// Preferences applied when a manager is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerOptions {
  /// Preferred driver; the backend default when absent or unknown
  pub driver: Option<String>,
  pub input_device: Option<String>,
  pub output_device: Option<String>,
  pub sample_rate: u32,
  pub vector_size: usize,
  /// Requested input channels, capped by the device
  pub input_channels: usize,
  /// Requested output channels, capped by the device
  pub output_channels: usize,
  /// How long a stop waits for the native layer before aborting.
  /// `None` waits indefinitely.
  pub stop_timeout_ms: Option<u64>,
  /// Capacity of the audio thread fault queue
  pub fault_queue_capacity: usize,
}

impl Default for ManagerOptions {
  fn default() -> Self {
    Self {
      driver: None,
      input_device: None,
      output_device: None,
      sample_rate: DEFAULT_SAMPLE_RATE,
      vector_size: DEFAULT_VECTOR_SIZE,
      input_channels: DEFAULT_CHANNELS,
      output_channels: DEFAULT_CHANNELS,
      stop_timeout_ms: Some(2000),
      fault_queue_capacity: 256,
    }
  }
}

impl ManagerOptions {
  pub fn from_json_str(json: &str) -> Result<Self, OptionsError> {
    let options: Self = serde_json::from_str(json)?;
    options.validate()?;
    Ok(options)
  }

  /// Read options from a JSON file. Missing fields take their defaults.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| OptionsError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&text)
  }

  pub fn validate(&self) -> Result<(), OptionsError> {
    if self.sample_rate == 0 {
      return Err(OptionsError::Invalid {
        field: "sampleRate",
        message: "must be positive".into(),
      });
    }
    if self.vector_size == 0 {
      return Err(OptionsError::Invalid {
        field: "vectorSize",
        message: "must be positive".into(),
      });
    }
    if self.fault_queue_capacity == 0 {
      return Err(OptionsError::Invalid {
        field: "faultQueueCapacity",
        message: "must be non-zero".into(),
      });
    }
    Ok(())
  }

  pub(crate) fn stop_timeout(&self) -> Option<std::time::Duration> {
    self.stop_timeout_ms.map(std::time::Duration::from_millis)
  }
}
