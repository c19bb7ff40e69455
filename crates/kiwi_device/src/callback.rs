//! The real-time callback adapter.
//!
//! Native backends call into a [`CallbackAdapter`] once per hardware period.
//! The adapter copies native input into the [`SampleBufferMatrix`], runs one
//! graph tick per vector and copies the matrix outputs back out. It reaches
//! the shared process block with `try_*` locks only: when the control thread
//! holds the block (re-open, sample access, graph swap) the period is
//! silenced and counted as contended.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::StreamConfiguration;
use crate::graph::DspGraph;
use crate::matrix::SampleBufferMatrix;
use crate::planar::device::PlanarIo;
use crate::sample::{copy_from_native, copy_to_native, deinterleave, interleave};

/// A tick that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickFault {
  /// Index of the faulting tick since the manager was created
  pub period: u64,
  pub kind: TickFaultKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum TickFaultKind {
  Error(String),
  Panic(String),
}

impl std::fmt::Display for TickFault {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.kind {
      TickFaultKind::Error(message) => write!(f, "tick {} failed: {}", self.period, message),
      TickFaultKind::Panic(message) => write!(f, "tick {} panicked: {}", self.period, message),
    }
  }
}

/// Snapshot of the callback meter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackStats {
  /// Native callback invocations
  pub callbacks: u64,
  /// Graph ticks run
  pub ticks: u64,
  /// Ticks that returned an error or panicked
  pub faults: u64,
  /// Periods silenced because the control thread held the process block
  pub contended: u64,
  pub avg_tick_ns: f64,
  pub peak_tick_ns: u64,
  /// Average tick time over the vector budget (`vector_size / sample_rate`)
  pub avg_usage: f64,
  pub peak_usage: f64,
}

/// Lock-free counters written by the audio thread.
#[derive(Debug, Default)]
pub(crate) struct CallbackMeter {
  callbacks: AtomicU64,
  ticks: AtomicU64,
  faults: AtomicU64,
  contended: AtomicU64,
  total_tick_ns: AtomicU64,
  peak_tick_ns: AtomicU64,
  budget_ns: AtomicU64,
}

impl CallbackMeter {
  #[inline(always)]
  fn record_callback(&self) {
    self.callbacks.fetch_add(1, Ordering::Relaxed);
  }

  #[inline(always)]
  fn record_contended(&self) {
    self.contended.fetch_add(1, Ordering::Relaxed);
  }

  #[inline(always)]
  fn record_fault(&self) {
    self.faults.fetch_add(1, Ordering::Relaxed);
  }

  /// Returns the index of the recorded tick.
  #[inline(always)]
  fn record_tick(&self, time_ns: u64) -> u64 {
    let period = self.ticks.fetch_add(1, Ordering::Relaxed);
    self.total_tick_ns.fetch_add(time_ns, Ordering::Relaxed);

    let mut prev = self.peak_tick_ns.load(Ordering::Relaxed);
    while time_ns > prev {
      match self.peak_tick_ns.compare_exchange_weak(prev, time_ns, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(_) => break,
        Err(v) => prev = v,
      }
    }
    period
  }

  fn set_budget(&self, vector_size: usize, sample_rate: u32) {
    let budget = if sample_rate == 0 {
      0
    } else {
      (vector_size as u64).saturating_mul(1_000_000_000) / sample_rate as u64
    };
    self.budget_ns.store(budget, Ordering::Relaxed);
  }

  /// Call from the control thread.
  pub(crate) fn snapshot(&self) -> CallbackStats {
    let ticks = self.ticks.load(Ordering::Relaxed);
    let total = self.total_tick_ns.load(Ordering::Relaxed);
    let peak = self.peak_tick_ns.load(Ordering::Relaxed);
    let budget = self.budget_ns.load(Ordering::Relaxed) as f64;

    let avg_tick_ns = if ticks > 0 { total as f64 / ticks as f64 } else { 0.0 };
    let usage = |ns: f64| if budget > 0.0 { ns / budget } else { 0.0 };

    CallbackStats {
      callbacks: self.callbacks.load(Ordering::Relaxed),
      ticks,
      faults: self.faults.load(Ordering::Relaxed),
      contended: self.contended.load(Ordering::Relaxed),
      avg_tick_ns,
      peak_tick_ns: peak,
      avg_usage: usage(avg_tick_ns),
      peak_usage: usage(peak as f64),
    }
  }
}

/// Matrix plus the re-blocking FIFOs, all sized at re-open.
///
/// Interleaved sessions stage frames interleaved at the native widths.
/// Planar sessions stage one `vector_size` run per matrix channel.
pub(crate) struct ProcessBuffers {
  pub(crate) matrix: SampleBufferMatrix,
  native_inputs: usize,
  native_outputs: usize,
  staging_in: Vec<f32>,
  staging_out: Vec<f32>,
  fill: usize,
  reblocking: bool,
}

impl ProcessBuffers {
  fn empty() -> Self {
    Self {
      matrix: SampleBufferMatrix::empty(),
      native_inputs: 0,
      native_outputs: 0,
      staging_in: Vec::new(),
      staging_out: Vec::new(),
      fill: 0,
      reblocking: false,
    }
  }
}

struct ProcessEngine {
  graph: Box<dyn DspGraph>,
  faults: rtrb::Producer<TickFault>,
}

/// State shared between a manager and its callback adapter.
pub(crate) struct ProcessShared {
  pub(crate) buffers: RwLock<ProcessBuffers>,
  engine: Mutex<ProcessEngine>,
  pub(crate) meter: CallbackMeter,
}

impl ProcessShared {
  pub(crate) fn new(graph: Box<dyn DspGraph>, faults: rtrb::Producer<TickFault>) -> Arc<Self> {
    Arc::new(Self {
      buffers: RwLock::new(ProcessBuffers::empty()),
      engine: Mutex::new(ProcessEngine { graph, faults }),
      meter: CallbackMeter::default(),
    })
  }

  /// Allocate the matrix for a freshly opened stream and prepare the graph.
  ///
  /// `native_inputs`/`native_outputs` are the interleaved frame widths the
  /// stream delivers; planar streams pass the matrix counts.
  pub(crate) fn install(&self, config: &StreamConfiguration, native_inputs: usize, native_outputs: usize) {
    let vector = config.vector_size;
    {
      let mut buffers = self.buffers.write();
      buffers.matrix.release();
      buffers.matrix = SampleBufferMatrix::new(config.input_channels, config.output_channels, vector);
      buffers.native_inputs = native_inputs;
      buffers.native_outputs = native_outputs;
      buffers.staging_in = vec![0.0; vector * native_inputs];
      buffers.staging_out = vec![0.0; vector * native_outputs];
      buffers.fill = 0;
      buffers.reblocking = false;
    }
    self.engine.lock().graph.prepare(config);
    self.meter.set_budget(vector, config.sample_rate);
  }

  /// Free every buffer. The stream must already be stopped.
  pub(crate) fn release(&self) {
    let mut buffers = self.buffers.write();
    buffers.matrix.release();
    buffers.staging_in = Vec::new();
    buffers.staging_out = Vec::new();
    buffers.native_inputs = 0;
    buffers.native_outputs = 0;
    buffers.fill = 0;
  }

  /// Swap the graph, preparing the new one first. The old graph is dropped
  /// on the calling thread.
  pub(crate) fn replace_graph(&self, mut graph: Box<dyn DspGraph>, config: Option<&StreamConfiguration>) {
    if let Some(config) = config {
      graph.prepare(config);
    }
    let old = std::mem::replace(&mut self.engine.lock().graph, graph);
    drop(old);
  }
}

/// The audio-thread side of a session.
#[derive(Clone)]
pub struct CallbackAdapter {
  shared: Arc<ProcessShared>,
}

impl CallbackAdapter {
  pub(crate) fn new(shared: Arc<ProcessShared>) -> Self {
    Self { shared }
  }

  /// Process one period of interleaved native audio.
  ///
  /// `input` holds `frames` frames of the stream's input width and `output`
  /// `frames` frames of its output width. When `frames` differs from the
  /// vector size the period is re-blocked through the staging FIFOs, adding
  /// one vector of latency.
  pub fn process_interleaved(&self, input: &[f32], output: &mut [f32], frames: usize) {
    profiling::scope!("process_interleaved");
    let meter = &self.shared.meter;
    meter.record_callback();

    let Some(mut buffers) = self.shared.buffers.try_write() else {
      meter.record_contended();
      output.fill(0.0);
      return;
    };
    let Some(mut engine) = self.shared.engine.try_lock() else {
      meter.record_contended();
      output.fill(0.0);
      return;
    };

    let buffers = &mut *buffers;
    let vector = buffers.matrix.vector_size();
    if vector == 0 {
      output.fill(0.0);
      return;
    }
    let (n_in, n_out) = (buffers.native_inputs, buffers.native_outputs);

    if frames == vector && !buffers.reblocking {
      match input.get(..frames * n_in) {
        Some(src) => deinterleave(src, n_in, buffers.matrix.inputs_mut()),
        None => buffers.matrix.clear_inputs(),
      }
      run_tick(&mut buffers.matrix, &mut engine, meter);
      interleave(buffers.matrix.outputs(), output, n_out);
      return;
    }

    buffers.reblocking = true;
    let mut done = 0;
    while done < frames {
      let n = (vector - buffers.fill).min(frames - done);
      copy_frames(input, done, &mut buffers.staging_in, buffers.fill, n, n_in);
      copy_frames(&buffers.staging_out, buffers.fill, output, done, n, n_out);
      buffers.fill += n;
      done += n;

      if buffers.fill == vector {
        deinterleave(&buffers.staging_in, n_in, buffers.matrix.inputs_mut());
        run_tick(&mut buffers.matrix, &mut engine, meter);
        interleave(buffers.matrix.outputs(), &mut buffers.staging_out, n_out);
        buffers.fill = 0;
      }
    }
  }

  /// Process one period of planar native audio.
  ///
  /// Periods that are a whole number of vectors are ticked in place. Any
  /// other period length switches the session to re-blocking through the
  /// per-channel staging FIFOs, adding one vector of latency, so that every
  /// tick still covers `vector_size` contiguous frames.
  pub fn process_planar(&self, io: &mut dyn PlanarIo) {
    profiling::scope!("process_planar");
    let meter = &self.shared.meter;
    meter.record_callback();

    let Some(mut buffers) = self.shared.buffers.try_write() else {
      meter.record_contended();
      silence_planar(io);
      return;
    };
    let Some(mut engine) = self.shared.engine.try_lock() else {
      meter.record_contended();
      silence_planar(io);
      return;
    };

    let ProcessBuffers {
      matrix,
      staging_in,
      staging_out,
      fill,
      reblocking,
      ..
    } = &mut *buffers;
    let vector = matrix.vector_size();
    if vector == 0 {
      silence_planar(io);
      return;
    }

    let frames = io.frames();
    if frames % vector == 0 && !*reblocking {
      for offset in (0..frames).step_by(vector) {
        for (ch, buffer) in matrix.inputs_mut().iter_mut().enumerate() {
          let src = if ch < io.input_channels() {
            io.input(ch).get(offset..offset + vector)
          } else {
            None
          };
          match src {
            Some(src) => copy_from_native(src, buffer),
            None => buffer.fill(0.0),
          }
        }

        run_tick(matrix, &mut engine, meter);

        for ch in 0..io.output_channels() {
          let Some(dst) = io.output(ch).get_mut(offset..offset + vector) else {
            continue;
          };
          match matrix.output(ch) {
            Some(src) => copy_to_native(src, dst),
            None => dst.fill(0.0),
          }
        }
      }
      return;
    }

    *reblocking = true;
    let (n_in, n_out) = (matrix.input_count(), matrix.output_count());
    let mut done = 0;
    while done < frames {
      let n = (vector - *fill).min(frames - done);

      for ch in 0..n_in {
        let start = ch * vector + *fill;
        let Some(dst) = staging_in.get_mut(start..start + n) else {
          continue;
        };
        let src = if ch < io.input_channels() {
          io.input(ch).get(done..done + n)
        } else {
          None
        };
        match src {
          Some(src) => dst.copy_from_slice(src),
          None => dst.fill(0.0),
        }
      }
      for ch in 0..io.output_channels() {
        let Some(dst) = io.output(ch).get_mut(done..done + n) else {
          continue;
        };
        let start = ch * vector + *fill;
        let src = if ch < n_out { staging_out.get(start..start + n) } else { None };
        match src {
          Some(src) => dst.copy_from_slice(src),
          None => dst.fill(0.0),
        }
      }
      *fill += n;
      done += n;

      if *fill == vector {
        for (ch, buffer) in matrix.inputs_mut().iter_mut().enumerate() {
          match staging_in.get(ch * vector..(ch + 1) * vector) {
            Some(src) => copy_from_native(src, buffer),
            None => buffer.fill(0.0),
          }
        }
        run_tick(matrix, &mut engine, meter);
        for (ch, src) in matrix.outputs().iter().enumerate() {
          if let Some(dst) = staging_out.get_mut(ch * vector..(ch + 1) * vector) {
            copy_to_native(src, dst);
          }
        }
        *fill = 0;
      }
    }
  }
}

fn run_tick(matrix: &mut SampleBufferMatrix, engine: &mut ProcessEngine, meter: &CallbackMeter) {
  profiling::scope!("tick");
  matrix.clear_outputs();

  let started = Instant::now();
  let graph = &mut engine.graph;
  let result = catch_unwind(AssertUnwindSafe(|| graph.tick(matrix)));
  let period = meter.record_tick(started.elapsed().as_nanos() as u64);

  let kind = match result {
    Ok(Ok(())) => return,
    Ok(Err(err)) => TickFaultKind::Error(err.to_string()),
    Err(payload) => TickFaultKind::Panic(panic_message(payload)),
  };

  matrix.clear_outputs();
  meter.record_fault();
  // A full queue drops the report; the fault is still counted.
  let _ = engine.faults.push(TickFault { period, kind });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
  match payload.downcast::<String>() {
    Ok(message) => *message,
    Err(payload) => match payload.downcast::<&'static str>() {
      Ok(message) => (*message).to_string(),
      Err(_) => "unknown panic".to_string(),
    },
  }
}

/// Copy `frames` interleaved frames between two buffers of the same width.
/// A short source yields silence; a short destination is skipped.
#[inline]
fn copy_frames(src: &[f32], src_frame: usize, dst: &mut [f32], dst_frame: usize, frames: usize, channels: usize) {
  let Some(dst) = dst.get_mut(dst_frame * channels..(dst_frame + frames) * channels) else {
    return;
  };
  match src.get(src_frame * channels..(src_frame + frames) * channels) {
    Some(src) => dst.copy_from_slice(src),
    None => dst.fill(0.0),
  }
}

fn silence_planar(io: &mut dyn PlanarIo) {
  for ch in 0..io.output_channels() {
    io.output(ch).fill(0.0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::TickError;
  use crate::graph::{Passthrough, Silence};

  fn shared_with(graph: Box<dyn DspGraph>) -> (Arc<ProcessShared>, rtrb::Consumer<TickFault>) {
    let (producer, consumer) = rtrb::RingBuffer::new(16);
    (ProcessShared::new(graph, producer), consumer)
  }

  fn config(inputs: usize, outputs: usize, vector_size: usize) -> StreamConfiguration {
    StreamConfiguration {
      sample_rate: 48_000,
      vector_size,
      input_channels: inputs,
      output_channels: outputs,
      ..Default::default()
    }
  }

  struct VecIo {
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
  }

  impl PlanarIo for VecIo {
    fn frames(&self) -> usize {
      self.outputs.first().or(self.inputs.first()).map_or(0, Vec::len)
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

  #[test]
  fn interleaved_passthrough_is_identity_when_sizes_match() {
    let (shared, _faults) = shared_with(Box::new(Passthrough));
    shared.install(&config(2, 2, 4), 2, 2);
    let adapter = CallbackAdapter::new(shared.clone());

    let input: Vec<f32> = (0..8).map(|i| i as f32 / 8.0).collect();
    let mut output = vec![0.0; 8];
    adapter.process_interleaved(&input, &mut output, 4);

    assert_eq!(output, input);
    assert_eq!(shared.meter.snapshot().ticks, 1);
  }

  #[test]
  fn extra_native_output_channels_are_zeroed() {
    let (shared, _faults) = shared_with(Box::new(|m: &mut SampleBufferMatrix| {
      m.output_mut(0).unwrap().fill(1.0);
    }));
    shared.install(&config(0, 1, 2), 0, 3);
    let adapter = CallbackAdapter::new(shared);

    let mut output = vec![9.0; 6];
    adapter.process_interleaved(&[], &mut output, 2);

    assert_eq!(output, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
  }

  #[test]
  fn reblocking_adds_one_vector_of_latency() {
    let (shared, _faults) = shared_with(Box::new(Passthrough));
    shared.install(&config(1, 1, 4), 1, 1);
    let adapter = CallbackAdapter::new(shared.clone());

    let input: Vec<f32> = (1..=12).map(|i| i as f32).collect();
    let mut output = Vec::new();
    for chunk in input.chunks(3) {
      let mut out = vec![0.0; 3];
      adapter.process_interleaved(chunk, &mut out, 3);
      output.extend(out);
    }

    assert_eq!(&output[..4], &[0.0; 4]);
    assert_eq!(&output[4..], &input[..8]);
    assert_eq!(shared.meter.snapshot().ticks, 3);
  }

  #[test]
  fn contended_period_outputs_silence() {
    let (shared, _faults) = shared_with(Box::new(|m: &mut SampleBufferMatrix| {
      m.output_mut(0).unwrap().fill(1.0);
    }));
    shared.install(&config(0, 1, 2), 0, 1);
    let adapter = CallbackAdapter::new(shared.clone());

    let guard = shared.buffers.read();
    let mut output = vec![5.0; 2];
    adapter.process_interleaved(&[], &mut output, 2);
    drop(guard);

    assert_eq!(output, vec![0.0, 0.0]);
    let stats = shared.meter.snapshot();
    assert_eq!(stats.contended, 1);
    assert_eq!(stats.ticks, 0);
  }

  #[test]
  fn tick_error_is_silenced_and_reported() {
    struct Failing;
    impl DspGraph for Failing {
      fn tick(&mut self, m: &mut SampleBufferMatrix) -> Result<(), TickError> {
        m.output_mut(0).unwrap().fill(1.0);
        Err(TickError::failed("boom"))
      }
    }

    let (shared, mut faults) = shared_with(Box::new(Failing));
    shared.install(&config(0, 1, 2), 0, 1);
    let adapter = CallbackAdapter::new(shared.clone());

    let mut output = vec![5.0; 2];
    adapter.process_interleaved(&[], &mut output, 2);

    assert_eq!(output, vec![0.0, 0.0]);
    let fault = faults.pop().unwrap();
    assert_eq!(fault.period, 0);
    assert_eq!(fault.kind, TickFaultKind::Error("Tick failed: boom".into()));
    assert_eq!(shared.meter.snapshot().faults, 1);
  }

  #[test]
  fn tick_panic_is_contained() {
    let (shared, mut faults) = shared_with(Box::new(|m: &mut SampleBufferMatrix| {
      m.output_mut(0).unwrap().fill(1.0);
      panic!("graph exploded");
    }));
    shared.install(&config(0, 1, 2), 0, 1);
    let adapter = CallbackAdapter::new(shared);

    let mut output = vec![5.0; 2];
    adapter.process_interleaved(&[], &mut output, 2);

    assert_eq!(output, vec![0.0, 0.0]);
    assert_eq!(faults.pop().unwrap().kind, TickFaultKind::Panic("graph exploded".into()));
  }

  #[test]
  fn planar_periods_are_chunked_by_vector() {
    let (shared, _faults) = shared_with(Box::new(Passthrough));
    shared.install(&config(2, 2, 4), 2, 2);
    let adapter = CallbackAdapter::new(shared.clone());

    let mut io = VecIo {
      inputs: vec![(0..12).map(|i| i as f32).collect(), (0..12).map(|i| -(i as f32)).collect()],
      outputs: vec![vec![0.0; 12]; 2],
    };
    adapter.process_planar(&mut io);

    assert_eq!(io.outputs, io.inputs);
    assert_eq!(shared.meter.snapshot().ticks, 3);
  }

  #[test]
  fn planar_odd_periods_keep_the_graph_timeline_contiguous() {
    let mut next = 0.0f64;
    let (shared, _faults) = shared_with(Box::new(move |m: &mut SampleBufferMatrix| {
      for (i, s) in m.output_mut(0).unwrap().iter_mut().enumerate() {
        *s = (next + i as f64) as _;
      }
      next += 4.0;
    }));
    shared.install(&config(0, 1, 4), 0, 1);
    let adapter = CallbackAdapter::new(shared.clone());

    let mut received = Vec::new();
    for frames in [6, 4, 6] {
      let mut io = VecIo {
        inputs: Vec::new(),
        outputs: vec![vec![9.0; frames]],
      };
      adapter.process_planar(&mut io);
      received.extend(io.outputs.remove(0));
    }

    let expected: Vec<f32> = (0..12).map(|i| i as f32).collect();
    assert_eq!(&received[..4], &[0.0; 4]);
    assert_eq!(&received[4..], &expected[..]);
    assert_eq!(shared.meter.snapshot().ticks, 4);
  }

  #[test]
  fn released_buffers_produce_silence() {
    let (shared, _faults) = shared_with(Box::new(Silence));
    shared.install(&config(1, 1, 4), 1, 1);
    shared.release();
    let adapter = CallbackAdapter::new(shared.clone());

    let mut output = vec![3.0; 4];
    adapter.process_interleaved(&[1.0; 4], &mut output, 4);

    assert_eq!(output, vec![0.0; 4]);
    assert_eq!(shared.meter.snapshot().ticks, 0);
  }

  #[test]
  fn usage_is_relative_to_the_vector_budget() {
    let meter = CallbackMeter::default();
    meter.set_budget(48, 48_000);
    meter.record_tick(500_000);
    meter.record_tick(250_000);

    let stats = meter.snapshot();
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.peak_tick_ns, 500_000);
    assert!((stats.avg_usage - 0.375).abs() < 1e-9);
    assert!((stats.peak_usage - 0.5).abs() < 1e-9);
  }
}
