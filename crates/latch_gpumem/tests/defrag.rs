mod common;

use common::{pattern, read_now, run_frames_until, setup, small_config};
use latch_gpumem::block::BlockState;
use latch_gpumem::{GpuMemConfig, Read, ResourceKind, SkipReason, KIB, MIB};

fn compaction_config() -> GpuMemConfig {
    GpuMemConfig {
        chunk_size: MIB,
        block_size: 64 * KIB,
        ..Default::default()
    }
}

#[test]
fn compaction_packs_a_block_and_preserves_content() {
    let (mut producer, consumers) = setup(compaction_config());
    let handles: Vec<_> = (0..8u8)
        .map(|seed| producer.create(ResourceKind::Vertex, &pattern(seed, 4096)).unwrap())
        .collect();
    producer.end_frame();
    let block = producer.get(handles[0]).unwrap().block;
    assert!(handles.iter().all(|h| producer.get(*h).unwrap().block == block));

    for handle in handles.iter().step_by(2) {
        producer.discard(*handle).unwrap();
    }
    // Holes are freed once the discard is committed; the block is then
    // invalidated for compaction.
    let report = producer.end_frame();
    assert_eq!(report.defrag.compactions_started, 1);
    assert!(matches!(
        producer.allocator().block(block).unwrap().state(),
        BlockState::Compacting { .. }
    ));

    // Consumers skip the block while it is invalid.
    let report = producer.end_frame();
    let mut reader = consumers.reader();
    assert_eq!(reader.try_read(handles[1]), Read::Skip(SkipReason::Invalid));
    let frame = reader.finish();
    consumers.submit_frame(frame);
    assert_eq!(report.defrag.compactions_finished, 1);
    assert_eq!(report.defrag.sub_moves, 4);

    producer.end_frame();
    let tracker = producer.allocator().block(block).unwrap().tracker();
    assert!(tracker.is_compact());
    assert_eq!(tracker.occupied_bytes(), 4 * 4096);
    for (i, handle) in handles.iter().enumerate().skip(1).step_by(2) {
        assert_eq!(read_now(&consumers, *handle).unwrap(), pattern(i as u8, 4096));
        assert_eq!(producer.get(*handle).unwrap().offset, (i as u64 / 2) * 4096);
    }
    producer.check_invariants().unwrap();
}

#[test]
fn compaction_waits_for_readers_of_older_frames() {
    let (mut producer, consumers) = setup(compaction_config());
    let handles: Vec<_> = (0..4u8)
        .map(|seed| producer.create(ResourceKind::Vertex, &pattern(seed, 4096)).unwrap())
        .collect();
    producer.end_frame();
    producer.discard(handles[0]).unwrap();
    producer.discard(handles[2]).unwrap();
    let report = producer.end_frame();
    assert_eq!(report.defrag.compactions_started, 1);

    // A reader pinned on the last frame that saw the block valid keeps the
    // old layout alive.
    let mut reader = consumers.reader();
    assert_eq!(reader.frame(), producer.committed_frame());
    let view = reader.try_read(handles[3]).ready().unwrap();
    for _ in 0..4 {
        assert_eq!(producer.end_frame().defrag.compactions_finished, 0);
    }
    assert_eq!(consumers.backend().read_bytes(view.address, view.size).unwrap(), pattern(3, 4096));

    let frame = reader.finish();
    consumers.submit_frame(frame);
    let finished = run_frames_until(&mut producer, 4, |p| {
        let block = p.get(handles[3]).unwrap().block;
        p.allocator().block(block).unwrap().state() == BlockState::Active
    });
    assert_eq!(finished, Some(1));
    producer.end_frame();
    assert_eq!(read_now(&consumers, handles[3]).unwrap(), pattern(3, 4096));
    assert_eq!(read_now(&consumers, handles[1]).unwrap(), pattern(1, 4096));
    assert_eq!(producer.get(handles[3]).unwrap().offset, 4096);
}

#[test]
fn long_lived_blocks_are_never_compacted() {
    let (mut producer, _consumers) = setup(compaction_config());
    let handles: Vec<_> = (0..8u8)
        .map(|seed| producer.create_long_lived(ResourceKind::Vertex, &pattern(seed, 4096)).unwrap())
        .collect();
    producer.end_frame();
    for handle in handles.iter().step_by(2) {
        producer.discard(*handle).unwrap();
    }
    for _ in 0..4 {
        assert_eq!(producer.end_frame().defrag.compactions_started, 0);
    }
}

#[test]
fn failed_compaction_copy_is_retried_later() {
    let (mut producer, consumers) = setup(compaction_config());
    let handles: Vec<_> = (0..8u8)
        .map(|seed| producer.create(ResourceKind::Vertex, &pattern(seed, 4096)).unwrap())
        .collect();
    producer.end_frame();
    for handle in handles.iter().step_by(2) {
        producer.discard(*handle).unwrap();
    }
    producer.end_frame();

    producer.backend().fail_next_copies(1);
    let report = producer.end_frame();
    assert_eq!(report.defrag.failed_copies, 1);
    assert_eq!(report.defrag.compactions_finished, 1);
    assert_eq!(report.stats.deferred_retries, 1);
    producer.check_invariants().unwrap();
    for (i, handle) in handles.iter().enumerate().skip(1).step_by(2) {
        let address = producer.address_of(*handle).unwrap();
        assert_eq!(producer.backend().read_bytes(address, 4096).unwrap(), pattern(i as u8, 4096));
    }

    // The block is still fragmented, so a later pass compacts it.
    let block = producer.get(handles[1]).unwrap().block;
    let compacted = run_frames_until(&mut producer, 8, |p| {
        let block = p.allocator().block(block).unwrap();
        block.state() == BlockState::Active && block.tracker().is_compact()
    });
    assert!(compacted.is_some());
    producer.end_frame();
    for (i, handle) in handles.iter().enumerate().skip(1).step_by(2) {
        assert_eq!(read_now(&consumers, *handle).unwrap(), pattern(i as u8, 4096));
    }
    assert_eq!(producer.stats().deferred_retries, 1);
}

/// Two full chunks of 64 KiB resources in 256 KiB blocks.
fn two_full_chunks(
    producer: &mut latch_gpumem::Producer<latch_gpumem::HostBackend>,
) -> Vec<latch_gpumem::Handle> {
    let handles: Vec<_> = (0..32u8)
        .map(|seed| producer.create(ResourceKind::Vertex, &pattern(seed, (64 * KIB) as usize)).unwrap())
        .collect();
    assert_eq!(producer.stats().chunks, 2);
    handles
}

#[test]
fn underused_chunk_is_consolidated_and_released() {
    let (mut producer, consumers) = setup(small_config());
    let handles = two_full_chunks(&mut producer);
    producer.end_frame();
    let first_chunk = producer.allocator().block(producer.get(handles[0]).unwrap().block).unwrap().chunk();
    let second_chunk = producer.allocator().block(producer.get(handles[16]).unwrap().block).unwrap().chunk();
    assert_ne!(first_chunk, second_chunk);

    // Empty two whole blocks of the first chunk and all but one resource of
    // the second, leaving it at ~6% utilization.
    for handle in handles[..8].iter().chain(&handles[17..]) {
        producer.discard(*handle).unwrap();
    }

    let budget = producer.config().max_relocations_per_frame;
    let mut relocations = 0;
    let mut frames = 0;
    while producer.allocator().pool().get(second_chunk).is_some() {
        let report = producer.end_frame();
        assert!(report.defrag.relocations <= budget);
        relocations += report.defrag.relocations;
        frames += 1;
        assert!(frames <= 10, "consolidation did not finish");
    }
    assert_eq!(relocations, 1);
    assert_eq!(producer.stats().chunks, 1);
    assert_eq!(producer.backend().live_chunks(), 1);
    assert_eq!(producer.defragmenter().consolidating(), None);

    producer.end_frame();
    let moved = producer.get(handles[16]).unwrap().block;
    assert_eq!(producer.allocator().block(moved).unwrap().chunk(), first_chunk);
    assert_eq!(read_now(&consumers, handles[16]).unwrap(), pattern(16, (64 * KIB) as usize));
    for (i, handle) in handles.iter().enumerate().take(16).skip(8) {
        assert_eq!(read_now(&consumers, *handle).unwrap(), pattern(i as u8, (64 * KIB) as usize));
    }
    producer.check_invariants().unwrap();
}

#[test]
fn consolidation_is_spread_over_frames_by_the_relocation_budget() {
    let config = GpuMemConfig {
        max_relocations_per_frame: 1,
        ..small_config()
    };
    let (mut producer, consumers) = setup(config);
    let handles = two_full_chunks(&mut producer);
    producer.end_frame();
    let first_chunk = producer.allocator().block(producer.get(handles[0]).unwrap().block).unwrap().chunk();
    let second_chunk = producer.allocator().block(producer.get(handles[16]).unwrap().block).unwrap().chunk();

    // One survivor in each of three blocks of the second chunk, under 20%.
    let survivors = [16usize, 20, 24];
    for (i, handle) in handles.iter().enumerate() {
        if i < 8 || (i > 16 && !survivors.contains(&i)) {
            producer.discard(*handle).unwrap();
        }
    }

    let mut per_frame = Vec::new();
    while producer.allocator().pool().get(second_chunk).is_some() {
        let report = producer.end_frame();
        assert!(report.defrag.relocations <= 1);
        per_frame.push(report.defrag.relocations);
        assert!(per_frame.len() <= 12, "consolidation did not finish: {per_frame:?}");
    }
    assert_eq!(per_frame.iter().sum::<usize>(), survivors.len());
    assert_eq!(per_frame.iter().filter(|&&n| n == 1).count(), survivors.len());
    assert_eq!(producer.stats().chunks, 1);
    assert_eq!(producer.defragmenter().consolidating(), None);

    producer.end_frame();
    for i in survivors {
        let block = producer.get(handles[i]).unwrap().block;
        assert_eq!(producer.allocator().block(block).unwrap().chunk(), first_chunk);
        assert_eq!(read_now(&consumers, handles[i]).unwrap(), pattern(i as u8, (64 * KIB) as usize));
    }
    for (i, handle) in handles.iter().enumerate().take(16).skip(8) {
        assert_eq!(read_now(&consumers, *handle).unwrap(), pattern(i as u8, (64 * KIB) as usize));
    }
    producer.check_invariants().unwrap();
}

#[test]
fn consolidation_needs_room_elsewhere() {
    let (mut producer, _consumers) = setup(small_config());
    let handles = two_full_chunks(&mut producer);
    producer.end_frame();
    // The second chunk is nearly empty but the first has no room.
    for handle in &handles[17..] {
        producer.discard(*handle).unwrap();
    }
    for _ in 0..6 {
        let report = producer.end_frame();
        assert_eq!(report.defrag.relocations, 0);
    }
    assert_eq!(producer.stats().chunks, 2);
    assert_eq!(producer.defragmenter().consolidating(), None);
}

#[test]
fn resident_minimum_is_kept() {
    let config = GpuMemConfig {
        min_resident_chunks: 2,
        ..small_config()
    };
    let (mut producer, _consumers) = setup(config);
    let handles = two_full_chunks(&mut producer);
    producer.end_frame();
    for handle in &handles {
        producer.discard(*handle).unwrap();
    }
    for _ in 0..6 {
        producer.end_frame();
    }
    let stats = producer.stats();
    assert_eq!(stats.blocks, 0);
    assert_eq!(stats.chunks, 2);
    assert_eq!(producer.backend().live_chunks(), 2);
}

#[test]
fn empty_chunks_above_the_minimum_are_released() {
    let (mut producer, _consumers) = setup(small_config());
    let handles = two_full_chunks(&mut producer);
    producer.end_frame();
    for handle in &handles[16..] {
        producer.discard(*handle).unwrap();
    }
    let released = run_frames_until(&mut producer, 6, |p| p.stats().chunks == 1);
    assert!(released.is_some());
    assert_eq!(producer.backend().live_chunks(), 1);
}
