//! Frame fencing and reference-count leases.
//!
//! Every frame a consumer reads is tracked here until the GPU is done with
//! it: first while readers are open, then while its fence is pending. The
//! block uses recorded by a frame's readers stay counted until that fence
//! signals. The producer asks this layer two questions: may frame `N` be
//! committed yet, and which is the oldest frame anyone may still observe.

use crate::backend::GpuBackend;
use crate::ids::FrameId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Proof that a frame may be committed. Only [`FrameSync`] mints these.
#[derive(Debug)]
pub struct FenceToken {
    frame: FrameId,
}

impl FenceToken {
    #[inline]
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    #[cfg(test)]
    pub(crate) fn for_tests(frame: FrameId) -> Self {
        Self { frame }
    }
}

#[derive(Debug, Default)]
struct InFlightFrame {
    open_readers: usize,
    leases: Vec<Arc<AtomicU32>>,
    submitted: bool,
}

impl InFlightFrame {
    fn release_leases(&mut self) -> usize {
        let released = self.leases.len();
        for usage in self.leases.drain(..) {
            usage.fetch_sub(1, Ordering::AcqRel);
        }
        released
    }
}

/// In-flight frame table shared by the producer and every consumer.
#[derive(Debug)]
pub struct FrameSync {
    max_frames_in_flight: u64,
    frames: Mutex<BTreeMap<FrameId, InFlightFrame>>,
}

impl FrameSync {
    pub fn new(max_frames_in_flight: u64) -> Self {
        Self {
            max_frames_in_flight,
            frames: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a reader for the frame chosen by `pin`.
    ///
    /// `pin` runs under the table lock, so the producer can never decide a
    /// frame is idle between a reader picking it and being counted.
    pub fn open_reader<T>(&self, pin: impl FnOnce() -> (T, FrameId)) -> (T, FrameId) {
        let mut frames = self.lock();
        let (pinned, frame) = pin();
        let entry = frames.entry(frame).or_default();
        entry.open_readers += 1;
        // New commands for this frame need a fresh submission.
        entry.submitted = false;
        (pinned, frame)
    }

    /// Hand a finished reader's leases to its frame.
    pub fn close_reader(&self, frame: FrameId, leases: Vec<Arc<AtomicU32>>) {
        let mut frames = self.lock();
        let entry = frames.entry(frame).or_default();
        entry.open_readers = entry.open_readers.saturating_sub(1);
        entry.leases.extend(leases);
    }

    /// Signal `frame`'s fence once its command lists have been submitted.
    pub fn submit(&self, frame: FrameId, backend: &dyn GpuBackend) {
        let mut frames = self.lock();
        backend.signal_fence(frame);
        let entry = frames.entry(frame).or_default();
        entry.submitted = true;
        trace!(frame, open_readers = entry.open_readers, "submitted frame");
    }

    /// Retire frames whose fences have signaled, oldest first, releasing
    /// their leases. Stops at the first frame that is still busy.
    pub fn poll(&self, backend: &dyn GpuBackend) -> usize {
        let mut frames = self.lock();
        Self::poll_locked(&mut frames, backend)
    }

    /// Oldest frame anyone may still observe, given that `committed` is the
    /// current frame.
    pub fn oldest_busy(&self, committed: FrameId) -> FrameId {
        let frames = self.lock();
        frames
            .keys()
            .next()
            .map_or(committed, |&oldest| oldest.min(committed))
    }

    /// A token for committing `frame`, or the still-pending frame that
    /// blocks it.
    ///
    /// Only submitted frames at least `max_frames_in_flight` behind `frame`
    /// gate the commit, not the frame that was current just before it. Open
    /// or unsubmitted frames never block here; the write lock taken by
    /// publish and [`oldest_busy`](Self::oldest_busy) keep their data safe.
    pub fn ready_to_commit(
        &self,
        frame: FrameId,
        backend: &dyn GpuBackend,
    ) -> Result<FenceToken, FrameId> {
        let mut frames = self.lock();
        Self::poll_locked(&mut frames, backend);
        let limit = frame.saturating_sub(self.max_frames_in_flight);
        match frames
            .iter()
            .find(|(&f, entry)| f <= limit && entry.submitted)
        {
            Some((&blocking, _)) => {
                debug!(frame, blocking, "commit waits on fence");
                Err(blocking)
            }
            None => Ok(FenceToken { frame }),
        }
    }

    /// Frames with open readers or unsignaled fences.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn poll_locked(frames: &mut BTreeMap<FrameId, InFlightFrame>, backend: &dyn GpuBackend) -> usize {
        let mut retired = 0;
        while let Some(mut entry) = frames.first_entry() {
            let frame = *entry.key();
            let done = {
                let f = entry.get();
                f.submitted && f.open_readers == 0 && backend.wait_fence(frame)
            };
            if !done {
                break;
            }
            let released = entry.get_mut().release_leases();
            entry.remove();
            retired += 1;
            trace!(frame, released, "frame retired");
        }
        retired
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<FrameId, InFlightFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FenceMode, HostBackend};

    #[test]
    fn leases_are_released_when_the_fence_signals() {
        let backend = HostBackend::new().with_fence_mode(FenceMode::Manual);
        let sync = FrameSync::new(2);
        let usage = Arc::new(AtomicU32::new(0));

        let ((), frame) = sync.open_reader(|| ((), 3));
        usage.fetch_add(1, Ordering::AcqRel);
        sync.close_reader(frame, vec![Arc::clone(&usage)]);
        assert_eq!(sync.oldest_busy(5), 3);

        sync.submit(frame, &backend);
        assert_eq!(sync.poll(&backend), 0);
        assert_eq!(usage.load(Ordering::Acquire), 1);

        backend.complete_fences_through(3);
        assert_eq!(sync.poll(&backend), 1);
        assert_eq!(usage.load(Ordering::Acquire), 0);
        assert_eq!(sync.oldest_busy(5), 5);
    }

    #[test]
    fn unsubmitted_frames_stay_busy() {
        let backend = HostBackend::new();
        let sync = FrameSync::new(2);
        let ((), frame) = sync.open_reader(|| ((), 1));
        sync.close_reader(frame, Vec::new());
        assert_eq!(sync.poll(&backend), 0);
        assert_eq!(sync.oldest_busy(4), 1);
    }

    #[test]
    fn open_readers_block_retirement() {
        let backend = HostBackend::new();
        let sync = FrameSync::new(2);
        let ((), frame) = sync.open_reader(|| ((), 1));
        sync.submit(frame, &backend);
        assert_eq!(sync.poll(&backend), 0);
        sync.close_reader(frame, Vec::new());
        assert_eq!(sync.poll(&backend), 1);
        assert_eq!(sync.in_flight(), 0);
    }

    #[test]
    fn commit_is_gated_by_frames_in_flight() {
        let backend = HostBackend::new().with_fence_mode(FenceMode::Manual);
        let sync = FrameSync::new(2);
        for frame in 1..=2 {
            let ((), f) = sync.open_reader(|| ((), frame));
            sync.close_reader(f, Vec::new());
            sync.submit(f, &backend);
        }
        assert_eq!(sync.ready_to_commit(3, &backend).unwrap_err(), 1);
        backend.complete_fences_through(1);
        assert_eq!(sync.ready_to_commit(3, &backend).unwrap().frame(), 3);
        assert_eq!(sync.ready_to_commit(4, &backend).unwrap_err(), 2);
    }

    #[test]
    fn unsubmitted_frames_do_not_gate_commits() {
        let backend = HostBackend::new().with_fence_mode(FenceMode::Manual);
        let sync = FrameSync::new(2);
        let ((), f) = sync.open_reader(|| ((), 1));
        sync.close_reader(f, Vec::new());
        assert_eq!(sync.ready_to_commit(5, &backend).unwrap().frame(), 5);
        assert_eq!(sync.oldest_busy(4), 1);
    }

    #[test]
    fn reopening_a_submitted_frame_requires_resubmission() {
        let backend = HostBackend::new().with_fence_mode(FenceMode::Manual);
        let sync = FrameSync::new(2);
        let ((), f) = sync.open_reader(|| ((), 1));
        sync.close_reader(f, Vec::new());
        sync.submit(f, &backend);
        let ((), f) = sync.open_reader(|| ((), 1));
        sync.close_reader(f, Vec::new());
        backend.complete_fences_through(1);
        assert_eq!(sync.poll(&backend), 0);
        sync.submit(f, &backend);
        backend.complete_fences_through(1);
        assert_eq!(sync.poll(&backend), 1);
    }
}
