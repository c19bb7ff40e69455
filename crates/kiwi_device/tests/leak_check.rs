//! Resource check for repeated session open/close.
//!
//! Lives in its own test binary: the live channel buffer counter is
//! process-wide and would see buffers from tests running in parallel.

use kiwi_device::backend::simulated::{SimulatedDevice, SimulatedHardware};
use kiwi_device::matrix::live_channel_buffers;
use kiwi_device::{DeviceManager, InterleavedDeviceManager, ManagerOptions, Passthrough, PlanarDeviceManager, SessionState};

const CYCLES: usize = 1000;

#[test]
fn open_close_cycles_release_every_buffer_and_stream() {
    let hardware = SimulatedHardware::stock("leak-check");

    for cycle in 0..CYCLES {
        let manager: Box<dyn DeviceManager> = if cycle % 2 == 0 {
            Box::new(
                InterleavedDeviceManager::with_graph(hardware.clone(), ManagerOptions::default(), Box::new(Passthrough))
                    .unwrap_or_else(|e| panic!("cycle {cycle}: {e}")),
            )
        } else {
            Box::new(
                PlanarDeviceManager::with_graph(hardware.device_types(), ManagerOptions::default(), Box::new(Passthrough))
                    .unwrap_or_else(|e| panic!("cycle {cycle}: {e}")),
            )
        };

        assert_eq!(manager.state(), SessionState::Running);
        assert_eq!(live_channel_buffers(), 4);
        assert_eq!(hardware.open_streams(), 1);
        assert!(hardware.run_period(&[]).is_some());

        drop(manager);
        assert_eq!(live_channel_buffers(), 0, "cycle {cycle} leaked channel buffers");
        assert_eq!(hardware.open_streams(), 0, "cycle {cycle} leaked a native stream");
    }

    assert_eq!(hardware.initializations(), CYCLES);
    assert_eq!(hardware.terminations(), CYCLES);

    // A stream that has to be aborted releases its buffers all the same.
    let stuck = SimulatedHardware::new("leak-check-stuck")
        .with_driver("Simulated", vec![SimulatedDevice::new("Stuck").never_stops()]);
    let options = ManagerOptions {
        stop_timeout_ms: Some(5),
        ..ManagerOptions::default()
    };
    let mut manager = InterleavedDeviceManager::with_graph(stuck.clone(), options, Box::new(Passthrough))
        .unwrap_or_else(|e| panic!("stuck device: {e}"));
    assert!(manager.set_vector_size(128));
    assert_eq!(live_channel_buffers(), 4);
    assert_eq!(stuck.open_streams(), 1);

    drop(manager);
    assert_eq!(live_channel_buffers(), 0);
    assert_eq!(stuck.open_streams(), 0);
}
