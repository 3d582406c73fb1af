use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Range, RangeInclusive};

use tokio::sync::oneshot;

use crate::frame::FrameHandle;

/// The frames one fill pass still needs from a chunk.
pub(crate) struct PendingChunkRequest {
    pub chunk_index: usize,
    pub frame_range: RangeInclusive<usize>,
    pub requested_frames: BTreeSet<usize>,
    /// Frames that resolved but are not committed to the buffer yet.
    pub resolved_frames: BTreeMap<usize, FrameHandle>,
    /// Fill passes parked on this chunk. Sending on one cancels that pass.
    pub waiters: Vec<oneshot::Sender<()>>,
    pub completed: bool,
}

impl PendingChunkRequest {
    pub fn new(chunk_index: usize, frame_range: RangeInclusive<usize>) -> Self {
        Self {
            chunk_index,
            frame_range,
            requested_frames: BTreeSet::new(),
            resolved_frames: BTreeMap::new(),
            waiters: Vec::new(),
            completed: false,
        }
    }

    pub fn cancel(&mut self) {
        if !self.completed && !self.waiters.is_empty() {
            log::debug!(
                "cancelling fill of chunk {} (frames {:?})",
                self.chunk_index,
                self.frame_range
            );
        }

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[derive(Default)]
pub(crate) struct BufferState {
    pub frames: BTreeMap<usize, FrameHandle>,
    pub requested_chunks: BTreeMap<usize, PendingChunkRequest>,
    /// The frames `require` currently wants to keep. Unbounded until the
    /// first `require`.
    pub window: Option<Range<usize>>,
    pub active_fill: bool,
    /// Bumped on every clear. Fill passes from an older generation commit nothing.
    pub generation: u64,
}

impl BufferState {
    pub fn free_size(&self, capacity: usize) -> usize {
        let requested: usize = self
            .requested_chunks
            .values()
            .map(|request| request.requested_frames.len())
            .sum();

        capacity
            .saturating_sub(self.frames.len())
            .saturating_sub(requested)
    }

    /// Drop every frame outside of `[required, required + span)`.
    pub fn evict_outside(&mut self, required: usize, span: usize) {
        let window = required..required.saturating_add(span);
        self.frames.retain(|frame, _| window.contains(frame));
        self.window = Some(window);
    }

    pub fn in_window(&self, frame: usize) -> bool {
        self.window
            .as_ref()
            .map_or(true, |window| window.contains(&frame))
    }

    pub fn clear(&mut self) {
        for request in self.requested_chunks.values_mut() {
            request.cancel();
        }

        self.requested_chunks.clear();
        self.frames.clear();
        self.active_fill = false;
        self.generation += 1;
    }
}

/// Split the frames `start, start + step, ...` into chunks.
///
/// At most `count` frames are planned and none past `stop_frame`.
pub(crate) fn partition_frames(
    start: usize,
    step: usize,
    count: usize,
    stop_frame: usize,
    chunk_size: usize,
) -> BTreeMap<usize, Vec<usize>> {
    let end = start
        .saturating_add(count.saturating_mul(step))
        .min(stop_frame.saturating_add(1));

    let mut chunks: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for frame in (start..end).step_by(step) {
        chunks.entry(frame / chunk_size).or_default().push(frame);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_splits_by_chunk() {
        let chunks = partition_frames(0, 1, 180, 99, 36);

        assert_eq!(chunks.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(chunks[&0].len(), 36);
        assert_eq!(chunks[&1].len(), 36);
        assert_eq!(chunks[&2].len(), 28);
        assert_eq!(chunks[&2].last(), Some(&99));
    }

    #[test]
    fn partition_steps_and_counts() {
        let chunks = partition_frames(30, 5, 4, 1000, 36);

        assert_eq!(chunks[&0], vec![30, 35]);
        assert_eq!(chunks[&1], vec![40, 45]);
        assert!(partition_frames(10, 1, 0, 99, 36).is_empty());
        assert!(partition_frames(100, 1, 10, 99, 36).is_empty());
    }

    #[test]
    fn free_size_counts_pending_frames() {
        let mut state = BufferState::default();
        let mut request = PendingChunkRequest::new(0, 0..=35);
        request.requested_frames.extend(0..20);
        state.requested_chunks.insert(0, request);

        assert_eq!(state.free_size(180), 160);
        assert_eq!(state.free_size(10), 0);
    }

    #[test]
    fn eviction_keeps_the_window() {
        let mut state = BufferState::default();
        assert!(state.in_window(1000));

        state.evict_outside(10, 5);

        assert!(state.in_window(10));
        assert!(state.in_window(14));
        assert!(!state.in_window(15));
        assert!(!state.in_window(9));
    }

    #[test]
    fn clear_cancels_waiters() {
        let mut state = BufferState::default();
        let (tx, mut rx) = oneshot::channel();
        let mut request = PendingChunkRequest::new(1, 36..=71);
        request.waiters.push(tx);
        state.requested_chunks.insert(1, request);

        state.clear();

        assert!(rx.try_recv().is_ok());
        assert!(state.requested_chunks.is_empty());
        assert_eq!(state.generation, 1);
    }
}
