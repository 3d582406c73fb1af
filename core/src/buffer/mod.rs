use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

mod data;

use data::{partition_frames, BufferState, PendingChunkRequest};

use crate::error::FrameError;
use crate::fetch::PipelineClient;
use crate::frame::FrameHandle;
use crate::meta::{TaskMeta, TaskParams};

/// Everything needed to build a [`FrameHandle`] for a task.
pub(crate) struct FrameSource {
    pub task_id: u64,
    pub params: TaskParams,
    pub meta: TaskMeta,
    pub pipeline: PipelineClient,
}

impl FrameSource {
    pub fn handle(&self, frame: usize, decode_forward: bool) -> Result<FrameHandle, FrameError> {
        let meta = self.params.frame_meta(&self.meta, frame)?;

        Ok(FrameHandle::new(
            self.task_id,
            &self.params,
            frame,
            meta,
            decode_forward,
            self.pipeline.clone(),
        ))
    }
}

struct Shared {
    state: Mutex<BufferState>,
    source: FrameSource,
    capacity: usize,
    refill_threshold: f32,
}

/// A bounded cache of decoded frames ahead of the playhead.
///
/// Cloning is cheap and every clone refers to the same buffer.
#[derive(Clone)]
pub struct LookaheadBuffer {
    shared: Arc<Shared>,
}

enum Lookup {
    Buffered {
        handle: FrameHandle,
        refill_from: Option<usize>,
    },
    Missing,
}

impl LookaheadBuffer {
    pub(crate) fn new(source: FrameSource, capacity: usize, refill_threshold: f32) -> Self {
        assert_ne!(capacity, 0);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BufferState::default()),
                source,
                capacity,
                refill_threshold,
            }),
        }
    }

    pub(crate) fn source(&self) -> &FrameSource {
        &self.shared.source
    }

    /// Return a handle to `frame_number`, serving it from the buffer when possible.
    ///
    /// * `fill_buffer` - Playback is running. A missing frame fills the buffer
    ///   before returning, and a buffered one may start a background refill.
    /// * `step` - The distance between consecutive frames during playback.
    pub async fn require(
        &self,
        frame_number: usize,
        fill_buffer: bool,
        step: usize,
    ) -> Result<FrameHandle, FrameError> {
        let step = step.max(1);
        let fresh = self.shared.source.handle(frame_number, !fill_buffer)?;

        let lookup = {
            let mut state = self.lock();
            state.evict_outside(frame_number, self.shared.capacity.saturating_mul(step));

            match state.frames.remove(&frame_number) {
                Some(handle) => {
                    let refill_from = if fill_buffer {
                        self.refill_start(&state, frame_number, step)
                    } else {
                        None
                    };

                    Lookup::Buffered {
                        handle,
                        refill_from,
                    }
                }
                None => Lookup::Missing,
            }
        };

        match lookup {
            Lookup::Buffered {
                handle,
                refill_from,
            } => {
                if let Some(start) = refill_from {
                    self.spawn_fill(start, step);
                }
                Ok(handle)
            }
            Lookup::Missing if fill_buffer => {
                self.clear();

                match self.make_fill_request(frame_number, step, None).await {
                    Ok(_) => {}
                    Err(e) if e.is_cancelled() => {
                        log::debug!("fill from frame {} was superseded", frame_number);
                    }
                    Err(e) => return Err(e),
                }

                let buffered = self.lock().frames.remove(&frame_number);
                Ok(buffered.unwrap_or(fresh))
            }
            Lookup::Missing => {
                self.clear();
                Ok(fresh)
            }
        }
    }

    /// Where a background refill should start, if one is due.
    fn refill_start(&self, state: &BufferState, frame_number: usize, step: usize) -> Option<usize> {
        let capacity = self.shared.capacity;
        let params = &self.shared.source.params;

        if state.active_fill
            || params.chunk_size >= capacity
            || state.frames.len() as f32 >= capacity as f32 * self.shared.refill_threshold
        {
            return None;
        }

        let max_frame = state
            .frames
            .keys()
            .next_back()
            .copied()
            .unwrap_or(frame_number);
        let start = max_frame + step;

        (start <= params.stop_frame).then_some(start)
    }

    fn spawn_fill(&self, start: usize, step: usize) {
        let buffer = self.clone();

        tokio::spawn(async move {
            match buffer.make_fill_request(start, step, None).await {
                Ok(frames) => log::debug!("prefetched {} frames from {}", frames.len(), start),
                Err(e) if e.is_cancelled() => {}
                Err(e) => log::warn!("prefetch from frame {} failed: {}", start, e),
            }
        });
    }

    /// Run a fill unless another one is already in flight.
    async fn make_fill_request(
        &self,
        start: usize,
        step: usize,
        count: Option<usize>,
    ) -> Result<BTreeSet<usize>, FrameError> {
        let generation = {
            let mut state = self.lock();
            if state.active_fill {
                return Ok(BTreeSet::new());
            }
            state.active_fill = true;
            state.generation
        };

        let res = self.fill(generation, start, step, count).await;

        let mut state = self.lock();
        if state.generation == generation {
            state.active_fill = false;
        }

        res
    }

    /// Decode frames starting at `start` and add them to the buffer.
    ///
    /// Requests `count` frames, or as many as there is room for, and returns
    /// the frames that were buffered. Nothing becomes visible in the buffer
    /// until every chunk of the fill has resolved. If a chunk fails, the chunks
    /// before it are still buffered and the error is returned.
    pub async fn fill_buffer(
        &self,
        start: usize,
        step: usize,
        count: Option<usize>,
    ) -> Result<BTreeSet<usize>, FrameError> {
        let generation = self.lock().generation;
        self.fill(generation, start, step.max(1), count).await
    }

    async fn fill(
        &self,
        generation: u64,
        start: usize,
        step: usize,
        count: Option<usize>,
    ) -> Result<BTreeSet<usize>, FrameError> {
        let params = &self.shared.source.params;

        let plan = {
            let mut state = self.lock();
            if state.generation != generation {
                return Err(FrameError::Cancelled);
            }

            let count = count.unwrap_or_else(|| state.free_size(self.shared.capacity));
            let chunks = partition_frames(start, step, count, params.stop_frame, params.chunk_size);

            let mut plan = Vec::with_capacity(chunks.len());
            for (chunk_index, frames) in chunks {
                let (cancel_tx, cancel_rx) = oneshot::channel();

                let request = state
                    .requested_chunks
                    .entry(chunk_index)
                    .or_insert_with(|| {
                        let first = chunk_index * params.chunk_size;
                        let last = (first + params.chunk_size - 1).min(params.stop_frame);
                        PendingChunkRequest::new(chunk_index, first..=last)
                    });
                request.requested_frames.extend(frames.iter().copied());
                request.waiters.push(cancel_tx);

                plan.push((chunk_index, frames, cancel_rx));
            }

            plan
        };

        log::debug!(
            "filling buffer from frame {} with chunks {:?}",
            start,
            plan.iter().map(|(chunk, _, _)| *chunk).collect::<Vec<_>>()
        );

        let chunk_indices: Vec<usize> = plan.iter().map(|(chunk, _, _)| *chunk).collect();
        let mut failure = None;

        // One chunk at a time, so the fetch pipeline sees them in order.
        for (chunk_index, frames, cancel_rx) in plan {
            match self.request_chunk(&frames, cancel_rx).await {
                Ok(handles) => {
                    let mut state = self.lock();
                    if state.generation != generation {
                        return Err(FrameError::Cancelled);
                    }

                    if let Some(request) = state.requested_chunks.get_mut(&chunk_index) {
                        request
                            .resolved_frames
                            .extend(handles.into_iter().map(|h| (h.frame_number, h)));
                        request.completed = request
                            .requested_frames
                            .iter()
                            .all(|frame| request.resolved_frames.contains_key(frame));
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let buffered = self.commit(generation, &chunk_indices);

        match (failure, buffered) {
            (Some(e), _) => Err(e),
            (None, Some(buffered)) => Ok(buffered),
            (None, None) => Err(FrameError::Cancelled),
        }
    }

    /// Wait for every frame of one chunk, or until the fill is cancelled.
    async fn request_chunk(
        &self,
        frames: &[usize],
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<Vec<FrameHandle>, FrameError> {
        let fetch = futures::future::try_join_all(frames.iter().map(|&frame| async move {
            let handle = self.shared.source.handle(frame, false)?;
            handle.decode().await?;
            Ok::<_, FrameError>(handle)
        }));
        tokio::pin!(fetch);

        tokio::select! {
            res = &mut fetch => res,
            Ok(()) = &mut cancel_rx => Err(FrameError::Cancelled),
        }
    }

    /// Merge the staged frames of a fill into the buffer in one step.
    ///
    /// The pending requests of the fill are removed whether they completed or
    /// not. Returns `None` if the buffer was cleared since the fill started.
    fn commit(&self, generation: u64, chunk_indices: &[usize]) -> Option<BTreeSet<usize>> {
        let mut state = self.lock();
        if state.generation != generation {
            return None;
        }

        let capacity = self.shared.capacity;
        let mut buffered = BTreeSet::new();

        for chunk_index in chunk_indices {
            let Some(request) = state.requested_chunks.remove(chunk_index) else {
                continue;
            };

            for (frame, handle) in request.resolved_frames {
                if !state.in_window(frame) {
                    continue;
                }
                if state.frames.len() >= capacity && !state.frames.contains_key(&frame) {
                    break;
                }

                state.frames.insert(frame, handle);
                buffered.insert(frame);
            }
        }

        Some(buffered)
    }

    /// Drop every buffered frame and cancel every pending fill.
    pub fn clear(&self) {
        self.lock().clear();
        self.shared.source.pipeline.drop_queued();
    }

    /// The buffered frame numbers, in order.
    pub fn buffered_frames(&self) -> Vec<usize> {
        self.lock().frames.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The number of chunks with a fill pending.
    pub fn pending_chunks(&self) -> usize {
        self.lock().requested_chunks.len()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
