#![deny(clippy::all)]
//! Audio device negotiation and the real-time I/O pipeline.
//!
//! A [`DeviceManager`] discovers drivers and devices, negotiates sample rate,
//! vector size and channel counts, owns the [`SampleBufferMatrix`] exchanged
//! with the hardware and runs one [`DspGraph`] tick per hardware period.
//!
//! Two native models sit behind the same trait:
//!
//! - [`InterleavedDeviceManager`] drives hosts that deliver one interleaved
//!   f32 buffer per period (cpal, or the simulated subsystem).
//! - [`PlanarDeviceManager`] drives device types that deliver one buffer per
//!   channel (JACK with the `jack` feature, or the simulated subsystem).

pub mod backend;
pub mod callback;
pub mod config;
pub mod error;
pub mod graph;
pub mod interleaved;
pub mod lifecycle;
pub mod manager;
pub mod matrix;
pub mod planar;
pub mod sample;
mod session;

pub use callback::{CallbackStats, TickFault, TickFaultKind};
pub use config::{DeviceDescriptor, Direction, DriverDescriptor, ManagerOptions, StreamConfiguration};
pub use error::{BackendError, DeviceError, OptionsError, TickError};
pub use graph::{DspGraph, Passthrough, SineTone, Silence};
pub use interleaved::InterleavedDeviceManager;
pub use manager::{DeviceManager, InputSamples, OutputSamples, SessionState};
pub use matrix::SampleBufferMatrix;
pub use planar::PlanarDeviceManager;
pub use sample::Sample;

/// Sample rate a new session asks for.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Vector size a new session asks for.
pub const DEFAULT_VECTOR_SIZE: usize = 64;

/// Channel count requested in each direction by a new session.
pub const DEFAULT_CHANNELS: usize = 2;
