//! Random operation sequences checked against a byte-level model.

mod common;

use common::{pattern, setup, small_config};
use latch_gpumem::{GpuMemConfig, Handle, Read, ResourceKind, Residency, SkipReason, KIB};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create { kind: ResourceKind, len: usize, seed: u8, long_lived: bool },
    Update { pick: usize, len: usize, seed: u8 },
    Resize { pick: usize, len: usize },
    Discard { pick: usize },
    EndFrame,
}

fn kind() -> impl Strategy<Value = ResourceKind> {
    prop_oneof![
        Just(ResourceKind::Vertex),
        Just(ResourceKind::Index),
        Just(ResourceKind::Other),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    let len = 1usize..(96 * KIB as usize);
    prop_oneof![
        4 => (kind(), len.clone(), any::<u8>(), prop::bool::weighted(0.2)).prop_map(
            |(kind, len, seed, long_lived)| Op::Create { kind, len, seed, long_lived }
        ),
        2 => (any::<usize>(), len.clone(), any::<u8>()).prop_map(|(pick, len, seed)| Op::Update { pick, len, seed }),
        2 => (any::<usize>(), len).prop_map(|(pick, len)| Op::Resize { pick, len }),
        3 => any::<usize>().prop_map(|pick| Op::Discard { pick }),
        3 => Just(Op::EndFrame),
    ]
}

/// Expected contents of one live handle. Only the first `known` bytes are
/// defined after a resize grew it.
struct Expected {
    handle: Handle,
    bytes: Vec<u8>,
    known: usize,
}

fn config() -> GpuMemConfig {
    GpuMemConfig {
        max_chunks: Some(6),
        ..small_config()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_workloads_keep_contents_and_invariants(ops in prop::collection::vec(op(), 1..60)) {
        let (mut producer, consumers) = setup(config());
        let mut live: Vec<Expected> = Vec::new();

        for op in ops {
            match op {
                Op::Create { kind, len, seed, long_lived } => {
                    let residency = if long_lived { Residency::LongLived } else { Residency::Transient };
                    let bytes = pattern(seed, len);
                    if let Ok(handle) = producer.create_with(kind, &bytes, residency) {
                        live.push(Expected { handle, bytes, known: len });
                    }
                }
                Op::Update { pick, len, seed } if !live.is_empty() => {
                    let idx = pick % live.len();
                    let expected = &mut live[idx];
                    let bytes = pattern(seed, len);
                    if producer.update(expected.handle, &bytes).is_ok() {
                        expected.known = len;
                        expected.bytes = bytes;
                    }
                }
                Op::Resize { pick, len } if !live.is_empty() => {
                    let idx = pick % live.len();
                    let expected = &mut live[idx];
                    if producer.resize(expected.handle, len as u64).is_ok() {
                        expected.known = expected.known.min(len);
                        expected.bytes.resize(len, 0);
                    }
                }
                Op::Discard { pick } if !live.is_empty() => {
                    let expected = live.swap_remove(pick % live.len());
                    prop_assert!(producer.discard(expected.handle).is_ok());
                    prop_assert!(producer.discard(expected.handle).is_err());
                }
                Op::EndFrame => {
                    let report = producer.end_frame();
                    prop_assert!(report.commit.is_committed());
                    prop_assert!(report.defrag.relocations <= producer.config().max_relocations_per_frame);
                    prop_assert_eq!(report.stats.handles, live.len());

                    let mut reader = consumers.reader();
                    for expected in &live {
                        match reader.try_read(expected.handle) {
                            Read::Ready(view) => {
                                prop_assert_eq!(view.size, expected.bytes.len() as u64);
                                let bytes = consumers.backend().read_bytes(view.address, view.size).unwrap();
                                prop_assert_eq!(&bytes[..expected.known], &expected.bytes[..expected.known]);
                            }
                            Read::Skip(reason) => prop_assert_eq!(reason, SkipReason::Invalid),
                        }
                    }
                    let frame = reader.finish();
                    consumers.submit_frame(frame);
                }
                _ => {}
            }

            producer.check_invariants().map_err(TestCaseError::fail)?;
            for expected in &live {
                let entry = producer.get(expected.handle).unwrap();
                prop_assert_eq!(entry.len, expected.bytes.len() as u64);
                let address = producer.address_of(expected.handle).unwrap();
                let bytes = producer.backend().read_bytes(address, expected.known as u64).unwrap();
                prop_assert_eq!(&bytes[..], &expected.bytes[..expected.known]);
            }
        }

        // Dropping everything and idling returns the pool to its floor.
        for expected in live.drain(..) {
            producer.discard(expected.handle).unwrap();
        }
        for _ in 0..8 {
            producer.end_frame();
        }
        let stats = producer.stats();
        prop_assert_eq!(stats.blocks, 0);
        prop_assert_eq!(stats.pending_retirements, 0);
        prop_assert!(stats.chunks <= producer.config().min_resident_chunks);
        prop_assert_eq!(producer.backend().live_chunks(), stats.chunks);
    }
}
