//! The DSP graph contract and a few built-in graphs.

use std::f64::consts::TAU;

use crate::config::StreamConfiguration;
use crate::error::TickError;
use crate::matrix::SampleBufferMatrix;
use crate::sample::Sample;

/// Computation driven once per vector by the audio thread.
///
/// `tick` runs on the real-time thread: it must not block, allocate or
/// perform I/O. Output buffers are already cleared when it is called.
pub trait DspGraph: Send {
  /// Called on the control thread with the negotiated configuration, before
  /// the stream starts.
  fn prepare(&mut self, _config: &StreamConfiguration) {}

  fn tick(&mut self, matrix: &mut SampleBufferMatrix) -> Result<(), TickError>;
}

impl<F> DspGraph for F
where
  F: FnMut(&mut SampleBufferMatrix) + Send,
{
  fn tick(&mut self, matrix: &mut SampleBufferMatrix) -> Result<(), TickError> {
    self(matrix);
    Ok(())
  }
}

/// Leaves the cleared outputs untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silence;

impl DspGraph for Silence {
  fn tick(&mut self, _matrix: &mut SampleBufferMatrix) -> Result<(), TickError> {
    Ok(())
  }
}

/// Copies input channel `c` to output channel `c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl DspGraph for Passthrough {
  fn tick(&mut self, matrix: &mut SampleBufferMatrix) -> Result<(), TickError> {
    let (inputs, outputs) = matrix.split_mut();
    for (out, input) in outputs.iter_mut().zip(inputs) {
      out.copy_from_slice(input);
    }
    Ok(())
  }
}

/// A sine test tone on every output channel.
#[derive(Debug, Clone)]
pub struct SineTone {
  frequency: f64,
  amplitude: f64,
  phase: f64,
  increment: f64,
}

impl SineTone {
  pub fn new(frequency: f64, amplitude: f64) -> Self {
    Self {
      frequency,
      amplitude,
      phase: 0.0,
      increment: frequency / crate::DEFAULT_SAMPLE_RATE as f64,
    }
  }

  pub fn frequency(&self) -> f64 {
    self.frequency
  }
}

impl Default for SineTone {
  fn default() -> Self {
    Self::new(440.0, 0.25)
  }
}

impl DspGraph for SineTone {
  fn prepare(&mut self, config: &StreamConfiguration) {
    self.increment = self.frequency / config.sample_rate.max(1) as f64;
    self.phase = 0.0;
  }

  fn tick(&mut self, matrix: &mut SampleBufferMatrix) -> Result<(), TickError> {
    let frames = matrix.vector_size();
    let start = self.phase;
    for out in matrix.outputs_mut() {
      let mut phase = start;
      for s in out.iter_mut() {
        *s = (self.amplitude * (phase * TAU).sin()) as Sample;
        phase = (phase + self.increment).fract();
      }
    }
    self.phase = (start + self.increment * frames as f64).fract();
    Ok(())
  }
}
