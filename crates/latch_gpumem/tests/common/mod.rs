//! Helpers shared by the integration tests.
#![allow(dead_code)]

use latch_gpumem::{init, Consumers, GpuMemConfig, Handle, HostBackend, Producer, Read, KIB, MIB};

/// 1 MiB chunks of 256 KiB blocks: small enough to fill in a few calls.
pub fn small_config() -> GpuMemConfig {
    GpuMemConfig {
        chunk_size: MIB,
        block_size: 256 * KIB,
        ..Default::default()
    }
}

pub fn setup(config: GpuMemConfig) -> (Producer<HostBackend>, Consumers<HostBackend>) {
    init(config, HostBackend::new()).expect("valid config")
}

pub fn setup_with(
    config: GpuMemConfig,
    backend: HostBackend,
) -> (Producer<HostBackend>, Consumers<HostBackend>) {
    init(config, backend).expect("valid config")
}

/// `len` bytes that differ per `seed` and per position.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

/// Read a handle through a fresh reader on the current frame and submit it.
pub fn read_now(consumers: &Consumers<HostBackend>, handle: Handle) -> Option<Vec<u8>> {
    let mut reader = consumers.reader();
    let read = reader.try_read(handle);
    let frame = reader.finish();
    consumers.submit_frame(frame);
    match read {
        Read::Ready(view) => consumers.backend().read_bytes(view.address, view.size),
        Read::Skip(_) => None,
    }
}

/// Run frames until `done` holds or `limit` frames have passed.
pub fn run_frames_until(
    producer: &mut Producer<HostBackend>,
    limit: usize,
    mut done: impl FnMut(&Producer<HostBackend>) -> bool,
) -> Option<usize> {
    for frame in 1..=limit {
        producer.end_frame();
        if done(producer) {
            return Some(frame);
        }
    }
    None
}
