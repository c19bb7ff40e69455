//! Planar sample buffers exchanged between the hardware and the DSP graph.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sample::Sample;

static LIVE_CHANNEL_BUFFERS: AtomicUsize = AtomicUsize::new(0);

/// Number of channel buffers currently allocated in this process.
pub fn live_channel_buffers() -> usize {
  LIVE_CHANNEL_BUFFERS.load(Ordering::Acquire)
}

/// One channel worth of samples, exactly `vector_size` long.
#[derive(Debug)]
pub struct ChannelBuffer(Box<[Sample]>);

impl ChannelBuffer {
  fn zeroed(len: usize) -> Self {
    LIVE_CHANNEL_BUFFERS.fetch_add(1, Ordering::AcqRel);
    Self(vec![0.0; len].into_boxed_slice())
  }
}

impl Drop for ChannelBuffer {
  fn drop(&mut self) {
    LIVE_CHANNEL_BUFFERS.fetch_sub(1, Ordering::AcqRel);
  }
}

impl Deref for ChannelBuffer {
  type Target = [Sample];

  fn deref(&self) -> &[Sample] {
    &self.0
  }
}

impl DerefMut for ChannelBuffer {
  fn deref_mut(&mut self) -> &mut [Sample] {
    &mut self.0
  }
}

impl AsRef<[Sample]> for ChannelBuffer {
  fn as_ref(&self) -> &[Sample] {
    &self.0
  }
}

impl AsMut<[Sample]> for ChannelBuffer {
  fn as_mut(&mut self) -> &mut [Sample] {
    &mut self.0
  }
}

/// Input and output channel buffers for one open stream.
///
/// The buffer count in each direction equals the active channel count, and
/// every buffer holds exactly [`vector_size`](Self::vector_size) samples. A
/// released matrix has no buffers and a vector size of zero.
#[derive(Debug, Default)]
pub struct SampleBufferMatrix {
  vector_size: usize,
  inputs: Vec<ChannelBuffer>,
  outputs: Vec<ChannelBuffer>,
}

impl SampleBufferMatrix {
  /// Allocate zero-filled buffers for `inputs` + `outputs` channels.
  pub fn new(inputs: usize, outputs: usize, vector_size: usize) -> Self {
    Self {
      vector_size,
      inputs: (0..inputs).map(|_| ChannelBuffer::zeroed(vector_size)).collect(),
      outputs: (0..outputs).map(|_| ChannelBuffer::zeroed(vector_size)).collect(),
    }
  }

  pub fn empty() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.inputs.is_empty() && self.outputs.is_empty()
  }

  pub fn vector_size(&self) -> usize {
    self.vector_size
  }

  pub fn input_count(&self) -> usize {
    self.inputs.len()
  }

  pub fn output_count(&self) -> usize {
    self.outputs.len()
  }

  pub fn input(&self, channel: usize) -> Option<&[Sample]> {
    self.inputs.get(channel).map(|b| &b[..])
  }

  pub fn input_mut(&mut self, channel: usize) -> Option<&mut [Sample]> {
    self.inputs.get_mut(channel).map(|b| &mut b[..])
  }

  pub fn output(&self, channel: usize) -> Option<&[Sample]> {
    self.outputs.get(channel).map(|b| &b[..])
  }

  pub fn output_mut(&mut self, channel: usize) -> Option<&mut [Sample]> {
    self.outputs.get_mut(channel).map(|b| &mut b[..])
  }

  pub fn inputs(&self) -> &[ChannelBuffer] {
    &self.inputs
  }

  pub fn inputs_mut(&mut self) -> &mut [ChannelBuffer] {
    &mut self.inputs
  }

  pub fn outputs(&self) -> &[ChannelBuffer] {
    &self.outputs
  }

  pub fn outputs_mut(&mut self) -> &mut [ChannelBuffer] {
    &mut self.outputs
  }

  /// Borrow inputs for reading and outputs for writing at the same time.
  pub fn split_mut(&mut self) -> (&[ChannelBuffer], &mut [ChannelBuffer]) {
    (&self.inputs, &mut self.outputs)
  }

  pub fn clear_inputs(&mut self) {
    for buffer in &mut self.inputs {
      buffer.fill(0.0);
    }
  }

  pub fn clear_outputs(&mut self) {
    for buffer in &mut self.outputs {
      buffer.fill(0.0);
    }
  }

  /// Free every channel buffer, then the channel arrays themselves.
  pub fn release(&mut self) {
    self.inputs.clear();
    self.outputs.clear();
    self.inputs = Vec::new();
    self.outputs = Vec::new();
    self.vector_size = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_matrix_matches_requested_shape() {
    let matrix = SampleBufferMatrix::new(2, 3, 64);

    assert_eq!(matrix.input_count(), 2);
    assert_eq!(matrix.output_count(), 3);
    assert_eq!(matrix.vector_size(), 64);
    for ch in 0..3 {
      let out = matrix.output(ch).unwrap();
      assert_eq!(out.len(), 64);
      assert!(out.iter().all(|s| *s == 0.0));
    }
    assert!(matrix.output(3).is_none());
    assert!(matrix.input(2).is_none());
  }

  #[test]
  fn clear_outputs_leaves_inputs_alone() {
    let mut matrix = SampleBufferMatrix::new(1, 1, 4);
    matrix.input_mut(0).unwrap().fill(0.5);
    matrix.output_mut(0).unwrap().fill(0.5);

    matrix.clear_outputs();

    assert!(matrix.input(0).unwrap().iter().all(|s| *s == 0.5));
    assert!(matrix.output(0).unwrap().iter().all(|s| *s == 0.0));
  }

  #[test]
  fn release_empties_the_matrix() {
    let mut matrix = SampleBufferMatrix::new(2, 2, 16);
    assert!(!matrix.is_empty());

    matrix.release();

    assert!(matrix.is_empty());
    assert_eq!(matrix.vector_size(), 0);
    assert!(matrix.output(0).is_none());
  }

  #[test]
  fn split_mut_allows_copying_inputs_to_outputs() {
    let mut matrix = SampleBufferMatrix::new(1, 1, 3);
    matrix.input_mut(0).unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);

    let (inputs, outputs) = matrix.split_mut();
    outputs[0].copy_from_slice(&inputs[0]);

    assert_eq!(matrix.output(0).unwrap(), &[1.0, 2.0, 3.0]);
  }

  #[test]
  fn zero_sized_matrix_is_empty() {
    let matrix = SampleBufferMatrix::new(0, 0, 64);
    assert!(matrix.is_empty());
    assert_eq!(matrix.vector_size(), 64);
  }
}
