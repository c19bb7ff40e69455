//! Integration tests for both device managers against the simulated subsystem.
//!
//! Every test builds its own `SimulatedHardware` with a unique id, so the
//! process-wide init/teardown registry is never shared between tests. The
//! test thread plays the hardware by calling `run_period`.

use kiwi_device::backend::simulated::{SimulatedDevice, SimulatedHardware};
use kiwi_device::{
    DeviceError, DeviceManager, DspGraph, InterleavedDeviceManager, ManagerOptions, Passthrough, PlanarDeviceManager,
    SampleBufferMatrix, SessionState, TickError, TickFaultKind,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn interleaved(hardware: &SimulatedHardware, graph: Box<dyn DspGraph>) -> InterleavedDeviceManager<SimulatedHardware> {
    match InterleavedDeviceManager::with_graph(hardware.clone(), ManagerOptions::default(), graph) {
        Ok(manager) => manager,
        Err(err) => panic!("interleaved manager failed: {err}"),
    }
}

fn planar(hardware: &SimulatedHardware, graph: Box<dyn DspGraph>) -> PlanarDeviceManager {
    match PlanarDeviceManager::with_graph(hardware.device_types(), ManagerOptions::default(), graph) {
        Ok(manager) => manager,
        Err(err) => panic!("planar manager failed: {err}"),
    }
}

/// One ramp per channel, distinct per channel.
fn ramps(channels: usize, frames: usize, offset: usize) -> Vec<Vec<f32>> {
    (0..channels)
        .map(|ch| {
            (0..frames)
                .map(|i| ((offset + i) as f32 + 1.0) / 1024.0 * if ch == 0 { 1.0 } else { -1.0 })
                .collect()
        })
        .collect()
}

/// Fails on the second tick, panics on the fourth.
struct Flaky {
    ticks: usize,
}

impl DspGraph for Flaky {
    fn tick(&mut self, matrix: &mut SampleBufferMatrix) -> Result<(), TickError> {
        self.ticks += 1;
        for buffer in matrix.outputs_mut() {
            buffer.fill(0.5 as _);
        }
        match self.ticks {
            2 => Err(TickError::failed("denormal storm")),
            4 => panic!("graph exploded"),
            _ => Ok(()),
        }
    }
}

/// Writes the running frame count to every output channel.
struct Counter {
    next: f64,
}

impl DspGraph for Counter {
    fn tick(&mut self, matrix: &mut SampleBufferMatrix) -> Result<(), TickError> {
        let vector = matrix.vector_size();
        for buffer in matrix.outputs_mut() {
            for (i, sample) in buffer.iter_mut().enumerate() {
                *sample = (self.next + i as f64) as _;
            }
        }
        self.next += vector as f64;
        Ok(())
    }
}

/// Drive `periods` periods and collect the first output channel.
fn first_output(hardware: &SimulatedHardware, periods: usize) -> Vec<f32> {
    let mut received = Vec::new();
    for _ in 0..periods {
        let mut output = hardware.run_period(&[]).expect("stream running");
        received.append(&mut output[0]);
    }
    received
}

// ─── Facade contract ──────────────────────────────────────────────────────────

fn check_contract(manager: &mut dyn DeviceManager) {
    assert_eq!(manager.state(), SessionState::Running);
    assert_eq!(manager.driver_name(), Some("Simulated"));
    assert_eq!(manager.sample_rate(), 44_100);
    assert_eq!(manager.vector_size(), 64);
    assert_eq!(manager.number_of_inputs(), 2);
    assert_eq!(manager.number_of_outputs(), 2);
    assert_eq!(manager.input_device_name(), Some("Built-in Duplex"));
    assert_eq!(manager.output_device_name(), Some("Built-in Duplex"));

    assert_eq!(manager.available_drivers(), vec!["Simulated", "Simulated Pro"]);
    assert_eq!(
        manager.available_input_devices(),
        vec!["Built-in Duplex", "Built-in Microphone"]
    );
    assert_eq!(
        manager.available_output_devices(),
        vec!["Built-in Duplex", "Built-in Speakers"]
    );
    assert!(manager.is_sample_rate_available(48_000));
    assert!(manager.is_vector_size_available(256));
    assert!(!manager.is_vector_size_available(48));

    for channel in 0..manager.number_of_outputs() {
        let samples = manager.output_samples(channel).expect("output channel");
        assert_eq!(samples.len(), manager.vector_size());
    }
    for channel in 0..manager.number_of_inputs() {
        let samples = manager.input_samples(channel).expect("input channel");
        assert_eq!(samples.len(), manager.vector_size());
    }
    assert!(manager.output_samples(2).is_none());
    assert!(manager.input_samples(2).is_none());

    let devices = manager.devices();
    assert_eq!(devices.len(), 4);
    assert!(devices.iter().any(|d| d.name == "Built-in Speakers" && d.max_channels == 2));
}

#[test]
fn interleaved_manager_honours_the_contract() {
    let hardware = SimulatedHardware::stock("it-contract-interleaved");
    let mut manager = interleaved(&hardware, Box::new(Passthrough));
    check_contract(&mut manager);
}

#[test]
fn planar_manager_honours_the_contract() {
    let hardware = SimulatedHardware::stock("it-contract-planar");
    let mut manager = planar(&hardware, Box::new(Passthrough));
    check_contract(&mut manager);
}

#[test]
fn switching_driver_selects_its_devices() {
    let hardware = SimulatedHardware::stock("it-switch-driver");
    let mut manager = interleaved(&hardware, Box::new(Passthrough));

    assert!(manager.set_driver("Simulated Pro"));
    assert_eq!(manager.state(), SessionState::Running);
    assert_eq!(manager.output_device_name(), Some("Studio Interface"));
    assert_eq!(manager.number_of_inputs(), 2);
    assert_eq!(manager.number_of_outputs(), 2);
    assert!(manager.is_sample_rate_available(96_000));

    assert!(!manager.set_driver("ASIO"));
    assert_eq!(manager.driver_name(), Some("Simulated Pro"));
}

#[test]
fn closed_session_exposes_no_samples() {
    let hardware = SimulatedHardware::new("it-closed").with_driver(
        "Simulated",
        vec![SimulatedDevice::new("Broken").failing_open()],
    );
    let manager = interleaved(&hardware, Box::new(Passthrough));

    assert_eq!(manager.state(), SessionState::Closed);
    assert_eq!(manager.number_of_outputs(), 0);
    assert!(manager.output_samples(0).is_none());
    assert!(manager.input_samples(0).is_none());
    assert_eq!(hardware.open_streams(), 0);
}

// ─── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn interleaved_identity_round_trip() {
    let hardware = SimulatedHardware::stock("it-roundtrip-interleaved");
    let manager = interleaved(&hardware, Box::new(Passthrough));

    let input = ramps(2, 64, 0);
    let output = hardware.run_period(&input).expect("stream running");
    assert_eq!(output, input);

    let matrix_out = manager.output_samples(1).expect("output channel");
    assert_eq!(matrix_out[10] as f32, input[1][10]);
}

#[test]
fn planar_identity_round_trip() {
    let hardware = SimulatedHardware::stock("it-roundtrip-planar");
    let _manager = planar(&hardware, Box::new(Passthrough));

    for period in 0..4 {
        let input = ramps(2, 64, period * 64);
        let output = hardware.run_period(&input).expect("stream running");
        assert_eq!(output, input);
    }
}

// ─── Negotiation and fallback ─────────────────────────────────────────────────

#[test]
fn unsupported_sample_rate_is_rejected() {
    let hardware = SimulatedHardware::stock("it-bad-rate");
    let mut manager = interleaved(&hardware, Box::new(Passthrough));
    let generation = manager.generation();

    assert!(!manager.set_sample_rate(999_999));
    assert_eq!(manager.sample_rate(), 44_100);
    assert_eq!(manager.generation(), generation);
    assert_eq!(manager.state(), SessionState::Running);
}

#[test]
fn setting_the_active_value_does_not_reopen() {
    let hardware = SimulatedHardware::stock("it-idempotent");
    let mut manager = planar(&hardware, Box::new(Passthrough));
    let generation = manager.generation();

    assert!(!manager.set_sample_rate(44_100));
    assert!(!manager.set_vector_size(64));
    assert!(!manager.set_driver("Simulated"));
    assert!(!manager.set_output_device("Built-in Duplex"));
    assert_eq!(manager.generation(), generation);

    assert!(manager.set_sample_rate(48_000));
    assert_eq!(manager.generation(), generation + 1);
    assert_eq!(manager.sample_rate(), 48_000);
    assert_eq!(hardware.running_format(), Some((64, 48_000)));
}

fn odd_sized_hardware(id: &str) -> SimulatedHardware {
    SimulatedHardware::new(id).with_driver(
        "Simulated",
        vec![SimulatedDevice::new("Coarse").with_buffer_sizes([128, 256, 512], 256)],
    )
}

#[test]
fn interleaved_adopts_default_buffer_size_on_open() {
    let hardware = odd_sized_hardware("it-fallback-interleaved");
    let manager = interleaved(&hardware, Box::new(Passthrough));

    assert_eq!(manager.state(), SessionState::Running);
    assert_eq!(manager.vector_size(), 256);
    assert_eq!(manager.output_samples(0).map(|s| s.len()), Some(256));
    assert_eq!(hardware.running_format(), Some((256, 44_100)));
}

#[test]
fn planar_adopts_default_buffer_size_on_open() {
    let hardware = odd_sized_hardware("it-fallback-planar");
    let manager = planar(&hardware, Box::new(Passthrough));

    assert_eq!(manager.state(), SessionState::Running);
    assert_eq!(manager.vector_size(), 256);
    assert_eq!(manager.input_samples(1).map(|s| s.len()), Some(256));
}

#[test]
fn channel_counts_follow_the_opened_stream() {
    let hardware = SimulatedHardware::stock("it-channels");
    let mut manager = interleaved(&hardware, Box::new(Passthrough));

    assert!(manager.set_input_device("Built-in Microphone"));
    assert_eq!(manager.number_of_inputs(), 1);
    assert_eq!(manager.number_of_outputs(), 2);
    assert!(manager.input_samples(0).is_some());
    assert!(manager.input_samples(1).is_none());

    let output = hardware.run_period(&ramps(2, 64, 0)).expect("stream running");
    assert_eq!(output[0], ramps(1, 64, 0)[0]);
    assert!(output[1].iter().all(|s| *s == 0.0));
}

fn with_usb_defaults(id: &str) -> SimulatedHardware {
    let hardware = SimulatedHardware::new(id).with_driver(
        "Simulated",
        vec![
            SimulatedDevice::new("Built-in Duplex"),
            SimulatedDevice::new("USB Interface").with_channels(4, 4),
        ],
    );
    hardware.set_default_devices("Simulated", Some("USB Interface"), Some("USB Interface"));
    hardware
}

#[test]
fn backend_default_devices_are_opened_first() {
    let hardware = with_usb_defaults("it-default-devices");
    let manager = interleaved(&hardware, Box::new(Passthrough));

    assert_eq!(manager.input_device_name(), Some("USB Interface"));
    assert_eq!(manager.output_device_name(), Some("USB Interface"));
    assert_eq!(manager.number_of_outputs(), 2);
}

#[test]
fn configured_device_wins_over_the_backend_default() {
    let hardware = with_usb_defaults("it-default-override");
    let options = ManagerOptions {
        output_device: Some("Built-in Duplex".into()),
        ..ManagerOptions::default()
    };
    let manager = match InterleavedDeviceManager::with_graph(hardware.clone(), options, Box::new(Passthrough)) {
        Ok(manager) => manager,
        Err(err) => panic!("interleaved manager failed: {err}"),
    };

    assert_eq!(manager.output_device_name(), Some("Built-in Duplex"));
    assert_eq!(manager.input_device_name(), Some("USB Interface"));
}

#[test]
fn unplugged_device_falls_back_to_the_first_one() {
    let hardware = SimulatedHardware::stock("it-hot-plug");
    hardware.add_device("Simulated", SimulatedDevice::new("USB Headset").with_channels(0, 2));
    let mut manager = interleaved(&hardware, Box::new(Passthrough));

    assert!(manager.set_output_device("USB Headset"));
    assert_eq!(manager.output_device_name(), Some("USB Headset"));

    hardware.remove_device("Simulated", "USB Headset");
    assert!(!manager.is_output_device_available("USB Headset"));
    assert!(manager.set_vector_size(128));
    assert_eq!(manager.state(), SessionState::Running);
    assert_eq!(manager.output_device_name(), Some("Built-in Duplex"));
}

// ─── Re-blocking ──────────────────────────────────────────────────────────────

#[test]
fn interleaved_reblocks_odd_hardware_periods() {
    let hardware = SimulatedHardware::new("it-reblock-interleaved").with_driver(
        "Simulated",
        vec![SimulatedDevice::new("Odd").with_hardware_period(48)],
    );
    let manager = interleaved(&hardware, Box::new(Passthrough));
    assert_eq!(manager.vector_size(), 64);

    let mut sent = Vec::new();
    let mut received = Vec::new();
    for period in 0..8 {
        let input = ramps(1, 48, period * 48);
        sent.extend_from_slice(&input[0]);
        let output = hardware.run_period(&input).expect("stream running");
        received.extend_from_slice(&output[0]);
    }

    assert!(received[..64].iter().all(|s| *s == 0.0));
    assert_eq!(&received[64..], &sent[..sent.len() - 64]);
    assert_eq!(manager.callback_stats().ticks, 6);
}

#[test]
fn planar_splits_long_periods_into_vectors() {
    let hardware = SimulatedHardware::new("it-split-planar").with_driver(
        "Simulated",
        vec![SimulatedDevice::new("Wide").with_hardware_period(128)],
    );
    let manager = planar(&hardware, Box::new(Passthrough));

    let input = ramps(2, 128, 0);
    let output = hardware.run_period(&input).expect("stream running");
    assert_eq!(output, input);

    let stats = manager.callback_stats();
    assert_eq!(stats.callbacks, 1);
    assert_eq!(stats.ticks, 2);
}

#[test]
fn odd_hardware_periods_keep_the_graph_timeline_contiguous() {
    let expected: Vec<f32> = (0..320).map(|i| i as f32).collect();
    let odd = |id: &str| {
        SimulatedHardware::new(id).with_driver(
            "Simulated",
            vec![SimulatedDevice::new("Odd").with_hardware_period(96)],
        )
    };

    let hardware = odd("it-timeline-planar");
    let manager = planar(&hardware, Box::new(Counter { next: 0.0 }));
    assert_eq!(manager.vector_size(), 64);
    let received = first_output(&hardware, 4);
    assert!(received[..64].iter().all(|s| *s == 0.0));
    assert_eq!(&received[64..], &expected[..]);
    assert_eq!(manager.callback_stats().ticks, 6);

    let hardware = odd("it-timeline-interleaved");
    let manager = interleaved(&hardware, Box::new(Counter { next: 0.0 }));
    let received = first_output(&hardware, 4);
    assert!(received[..64].iter().all(|s| *s == 0.0));
    assert_eq!(&received[64..], &expected[..]);
    assert_eq!(manager.callback_stats().ticks, 6);
}

// ─── Faults ───────────────────────────────────────────────────────────────────

#[test]
fn tick_faults_are_contained_and_reported() {
    let hardware = SimulatedHardware::stock("it-faults");
    let mut manager = interleaved(&hardware, Box::new(Flaky { ticks: 0 }));

    let mut outputs = Vec::new();
    for _ in 0..5 {
        outputs.push(hardware.run_period(&[]).expect("stream running"));
    }

    assert!(outputs[0][0].iter().all(|s| *s == 0.5));
    assert!(outputs[1][0].iter().all(|s| *s == 0.0));
    assert!(outputs[2][0].iter().all(|s| *s == 0.5));
    assert!(outputs[3][0].iter().all(|s| *s == 0.0));
    assert!(outputs[4][0].iter().all(|s| *s == 0.5));

    let faults = manager.drain_faults();
    assert_eq!(faults.len(), 2);
    assert_eq!(faults[0].kind, TickFaultKind::Error("Tick failed: denormal storm".into()));
    assert_eq!(faults[1].kind, TickFaultKind::Panic("graph exploded".into()));
    assert!(faults[0].period < faults[1].period);
    assert!(manager.drain_faults().is_empty());

    let stats = manager.callback_stats();
    assert_eq!(stats.ticks, 5);
    assert_eq!(stats.faults, 2);
    assert_eq!(manager.state(), SessionState::Running);
}

#[test]
fn held_sample_guard_silences_the_period() {
    let hardware = SimulatedHardware::stock("it-contended");
    let manager = interleaved(&hardware, Box::new(Passthrough));

    let guard = manager.output_samples(0).expect("output channel");
    let output = hardware.run_period(&ramps(2, 64, 0)).expect("stream running");
    drop(guard);

    assert!(output.iter().flatten().all(|s| *s == 0.0));
    assert_eq!(manager.callback_stats().contended, 1);
}

#[test]
fn replaced_graph_takes_over_the_next_period() {
    let hardware = SimulatedHardware::stock("it-replace-graph");
    let mut manager = planar(&hardware, Box::new(Passthrough));

    let input = ramps(2, 64, 0);
    assert_eq!(hardware.run_period(&input), Some(input.clone()));

    manager.replace_graph(Box::new(|matrix: &mut SampleBufferMatrix| {
        for buffer in matrix.outputs_mut() {
            buffer.fill(0.25 as _);
        }
    }));
    let output = hardware.run_period(&input).expect("stream running");
    assert!(output.iter().flatten().all(|s| *s == 0.25));
}

// ─── Concurrency ──────────────────────────────────────────────────────────────

#[test]
fn vector_size_changes_while_the_audio_thread_runs() {
    let hardware = SimulatedHardware::stock("it-concurrency");
    let mut manager = interleaved(&hardware, Box::new(Passthrough));

    let stop = Arc::new(AtomicBool::new(false));
    let pump = {
        let hardware = hardware.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut periods = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let Some((frames, _)) = hardware.running_format() else {
                    thread::yield_now();
                    continue;
                };
                if let Some(output) = hardware.run_period(&ramps(2, frames, 0)) {
                    for channel in &output {
                        assert!(matches!(channel.len(), 32 | 64 | 128 | 256));
                    }
                    periods += 1;
                }
            }
            periods
        })
    };

    for size in [128, 32, 256, 64, 128] {
        assert!(manager.set_vector_size(size));
        assert_eq!(manager.vector_size(), size);
        thread::sleep(std::time::Duration::from_millis(2));
    }

    stop.store(true, Ordering::Relaxed);
    let periods = pump.join().expect("pump thread");
    assert!(periods > 0 || manager.callback_stats().callbacks == 0);

    let output = hardware.run_period(&ramps(2, 128, 0)).expect("stream running");
    assert!(output.iter().all(|channel| channel.len() == 128));
    assert_eq!(manager.output_samples(0).map(|s| s.len()), Some(128));
    assert_eq!(hardware.open_streams(), 1);
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

fn stuck_hardware(id: &str) -> (SimulatedHardware, ManagerOptions) {
    let hardware = SimulatedHardware::new(id).with_driver("Simulated", vec![SimulatedDevice::new("Stuck").never_stops()]);
    let options = ManagerOptions {
        stop_timeout_ms: Some(5),
        ..ManagerOptions::default()
    };
    (hardware, options)
}

fn check_forced_abort(hardware: &SimulatedHardware, manager: &mut dyn DeviceManager) {
    assert_eq!(manager.state(), SessionState::Running);
    assert_eq!(hardware.open_streams(), 1);

    assert!(manager.set_vector_size(128));
    assert_eq!(manager.state(), SessionState::Running);
    assert_eq!(manager.vector_size(), 128);
    assert_eq!(hardware.open_streams(), 1);

    let output = hardware.run_period(&ramps(2, 128, 0)).expect("stream running");
    assert_eq!(output, ramps(2, 128, 0));
    assert_eq!(manager.output_samples(0).map(|s| s.len()), Some(128));
}

#[test]
fn stream_that_never_stops_is_aborted_after_the_timeout() {
    let (hardware, options) = stuck_hardware("it-stuck-interleaved");
    let mut manager = match InterleavedDeviceManager::with_graph(hardware.clone(), options, Box::new(Passthrough)) {
        Ok(manager) => manager,
        Err(err) => panic!("interleaved manager failed: {err}"),
    };
    check_forced_abort(&hardware, &mut manager);

    drop(manager);
    assert_eq!(hardware.open_streams(), 0);
    assert_eq!(hardware.terminations(), 1);
}

#[test]
fn device_that_never_stops_is_aborted_after_the_timeout() {
    let (hardware, options) = stuck_hardware("it-stuck-planar");
    let mut manager = match PlanarDeviceManager::with_graph(hardware.device_types(), options, Box::new(Passthrough)) {
        Ok(manager) => manager,
        Err(err) => panic!("planar manager failed: {err}"),
    };
    check_forced_abort(&hardware, &mut manager);

    drop(manager);
    assert_eq!(hardware.open_streams(), 0);
    assert_eq!(hardware.terminations(), 1);
}

#[test]
fn backend_init_failure_is_fatal() {
    let hardware = SimulatedHardware::stock("it-init-failure");
    hardware.set_fail_initialize(true);

    let result = InterleavedDeviceManager::new(hardware.clone(), ManagerOptions::default());
    assert!(matches!(result, Err(DeviceError::BackendInit { .. })));
    let result = PlanarDeviceManager::new(hardware.device_types(), ManagerOptions::default());
    assert!(matches!(result, Err(DeviceError::BackendInit { .. })));
    assert_eq!(hardware.terminations(), 0);
    assert_eq!(hardware.open_streams(), 0);

    hardware.set_fail_initialize(false);
    let manager = interleaved(&hardware, Box::new(Passthrough));
    assert_eq!(manager.state(), SessionState::Running);
}

#[test]
fn subsystem_is_initialized_once_for_concurrent_managers() {
    let hardware = SimulatedHardware::stock("it-shared-init");

    let first = interleaved(&hardware, Box::new(Passthrough));
    let second = planar(&hardware, Box::new(Passthrough));
    assert_eq!(hardware.initializations(), 1);
    assert_eq!(hardware.open_streams(), 2);

    drop(first);
    assert_eq!(hardware.terminations(), 0);
    drop(second);
    assert_eq!(hardware.terminations(), 1);
    assert_eq!(hardware.open_streams(), 0);

    let _third = interleaved(&hardware, Box::new(Passthrough));
    assert_eq!(hardware.initializations(), 2);
}

#[test]
fn invalid_options_are_rejected_before_init() {
    let hardware = SimulatedHardware::stock("it-invalid-options");
    let options = ManagerOptions {
        vector_size: 0,
        ..ManagerOptions::default()
    };

    let result = InterleavedDeviceManager::new(hardware.clone(), options);
    assert!(matches!(result, Err(DeviceError::InvalidOptions(_))));
    assert_eq!(hardware.initializations(), 0);
}
