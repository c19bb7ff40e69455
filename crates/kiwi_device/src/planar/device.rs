//! Native traits for planar backends: one buffer per channel, one combined
//! input/output device.

use crate::config::{DeviceDescriptor, Direction};
use crate::error::BackendError;
use crate::lifecycle::BackendSubsystem;

/// Bit set of active channels on a planar device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChannelMask(u64);

impl ChannelMask {
  pub const MAX_CHANNELS: usize = 64;

  pub const fn empty() -> Self {
    Self(0)
  }

  pub const fn from_bits(bits: u64) -> Self {
    Self(bits)
  }

  /// Channels `0..count`, capped at [`MAX_CHANNELS`](Self::MAX_CHANNELS).
  pub fn first(count: usize) -> Self {
    match count {
      0 => Self(0),
      n if n >= Self::MAX_CHANNELS => Self(u64::MAX),
      n => Self((1u64 << n) - 1),
    }
  }

  pub const fn bits(&self) -> u64 {
    self.0
  }

  pub fn contains(&self, channel: usize) -> bool {
    channel < Self::MAX_CHANNELS && self.0 & (1 << channel) != 0
  }

  pub fn insert(&mut self, channel: usize) {
    if channel < Self::MAX_CHANNELS {
      self.0 |= 1 << channel;
    }
  }

  pub fn intersect(self, other: ChannelMask) -> Self {
    Self(self.0 & other.0)
  }

  pub fn highest_bit(&self) -> Option<usize> {
    if self.0 == 0 {
      None
    } else {
      Some(63 - self.0.leading_zeros() as usize)
    }
  }

  /// Buffers needed to address every active channel: `highest_bit + 1`.
  pub fn active_count(&self) -> usize {
    self.highest_bit().map_or(0, |bit| bit + 1)
  }
}

/// Everything a planar device needs to open, in one struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSetup {
  pub output_device: Option<String>,
  pub input_device: Option<String>,
  pub sample_rate: u32,
  pub buffer_size: usize,
  pub input_channels: ChannelMask,
  pub output_channels: ChannelMask,
}

/// One period of planar native audio as seen by the callback.
pub trait PlanarIo {
  fn frames(&self) -> usize;

  fn input_channels(&self) -> usize;

  fn input(&self, channel: usize) -> &[f32];

  fn output_channels(&self) -> usize;

  fn output(&mut self, channel: usize) -> &mut [f32];
}

pub type PlanarCallback = Box<dyn FnMut(&mut dyn PlanarIo) + Send>;

/// An opened (or openable) planar device.
pub trait IoDevice {
  fn name(&self) -> &str;

  fn input_channel_names(&self) -> Vec<String>;

  fn output_channel_names(&self) -> Vec<String>;

  fn available_sample_rates(&self) -> Vec<u32>;

  fn available_buffer_sizes(&self) -> Vec<usize>;

  fn default_buffer_size(&self) -> usize;

  fn open(&mut self, setup: &DeviceSetup) -> Result<(), BackendError>;

  fn close(&mut self);

  fn is_open(&self) -> bool;

  fn start(&mut self, callback: PlanarCallback) -> Result<(), BackendError>;

  /// Request the callback to stop. Completion is observed through
  /// [`is_stopped`](Self::is_stopped).
  fn stop(&mut self);

  fn is_stopped(&self) -> bool;

  /// Tear the stream down without waiting for the callback.
  fn abort(&mut self) {
    self.close();
  }

  fn is_playing(&self) -> bool;

  fn current_sample_rate(&self) -> u32;

  fn current_buffer_size(&self) -> usize;

  fn active_input_channels(&self) -> ChannelMask;

  fn active_output_channels(&self) -> ChannelMask;
}

/// A family of planar devices (one native API).
pub trait DeviceType: BackendSubsystem {
  fn type_name(&self) -> &str;

  fn scan_for_devices(&mut self);

  /// Descriptors from the last scan.
  fn devices(&self) -> Vec<DeviceDescriptor>;

  fn device_names(&self, direction: Direction) -> Vec<String> {
    self
      .devices()
      .into_iter()
      .filter(|d| d.direction == direction)
      .map(|d| d.name)
      .collect()
  }

  fn create_device(&self, output: Option<&str>, input: Option<&str>) -> Result<Box<dyn IoDevice>, BackendError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn active_count_is_highest_bit_plus_one() {
    assert_eq!(ChannelMask::empty().active_count(), 0);
    assert_eq!(ChannelMask::first(2).active_count(), 2);
    assert_eq!(ChannelMask::from_bits(0b1001).active_count(), 4);
    assert_eq!(ChannelMask::first(64).active_count(), 64);
  }

  #[test]
  fn first_builds_a_contiguous_mask() {
    let mask = ChannelMask::first(3);
    assert!(mask.contains(0) && mask.contains(2));
    assert!(!mask.contains(3));
    assert_eq!(mask.intersect(ChannelMask::first(2)), ChannelMask::first(2));
  }

  #[test]
  fn insert_ignores_out_of_range_channels() {
    let mut mask = ChannelMask::empty();
    mask.insert(5);
    mask.insert(64);
    assert_eq!(mask.bits(), 1 << 5);
    assert_eq!(mask.highest_bit(), Some(5));
  }
}
