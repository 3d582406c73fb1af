use arrayvec::ArrayVec;
use tokio::sync::oneshot;

use crate::error::FrameError;
use crate::frame::ImageData;

/// The number of chunk fetches a task may hold: one active, one queued.
pub(crate) const MAX_FETCH_SLOTS: usize = 2;

/// A caller parked on the decoded data of one frame.
pub(crate) struct Waiter {
    pub frame: usize,
    pub decode_forward: bool,
    /// Set once the decode server reported that the next chunk is worth
    /// reading ahead when this frame resolves.
    pub read_ahead: bool,
    reply: oneshot::Sender<Result<ImageData, FrameError>>,
}

impl Waiter {
    pub fn new(
        frame: usize,
        decode_forward: bool,
        reply: oneshot::Sender<Result<ImageData, FrameError>>,
    ) -> Self {
        Self {
            frame,
            decode_forward,
            read_ahead: false,
            reply,
        }
    }

    /// The caller stopped waiting for this frame.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub fn resolve(self, image: ImageData) {
        // The caller may have stopped waiting, which is fine.
        let _ = self.reply.send(Ok(image));
    }

    pub fn reject(self, error: FrameError) {
        let _ = self.reply.send(Err(error));
    }
}

/// A network fetch of one chunk, and everyone waiting on it.
pub(crate) struct ChunkFetch {
    pub chunk_index: usize,
    pub waiters: Vec<Waiter>,
}

impl ChunkFetch {
    pub fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            waiters: Vec::new(),
        }
    }

    pub fn with_waiter(chunk_index: usize, waiter: Waiter) -> Self {
        Self {
            chunk_index,
            waiters: vec![waiter],
        }
    }

    pub fn reject(self, error: FrameError) {
        for waiter in self.waiters {
            waiter.reject(error.clone());
        }
    }
}

/// The active fetch (index 0) and the fetch queued behind it (index 1).
#[derive(Default)]
pub(crate) struct FetchSlots {
    slots: ArrayVec<ChunkFetch, MAX_FETCH_SLOTS>,
}

impl FetchSlots {
    pub fn active(&self) -> Option<&ChunkFetch> {
        self.slots.first()
    }

    pub fn queued(&self) -> Option<&ChunkFetch> {
        self.slots.get(1)
    }

    /// The active or queued fetch of the given chunk.
    pub fn find_mut(&mut self, chunk_index: usize) -> Option<&mut ChunkFetch> {
        self.slots
            .iter_mut()
            .find(|fetch| fetch.chunk_index == chunk_index)
    }

    pub fn contains(&self, chunk_index: usize) -> bool {
        self.slots.iter().any(|fetch| fetch.chunk_index == chunk_index)
    }

    /// Make `fetch` the active fetch. There must be no active fetch.
    pub fn activate(&mut self, fetch: ChunkFetch) {
        debug_assert!(self.slots.is_empty());
        self.slots.clear();
        self.slots.push(fetch);
    }

    /// Queue `fetch` behind the active one, returning the fetch it replaced.
    ///
    /// There must be an active fetch.
    pub fn enqueue(&mut self, fetch: ChunkFetch) -> Option<ChunkFetch> {
        debug_assert!(!self.slots.is_empty());
        let evicted = self.take_queued();
        self.slots.push(fetch);
        evicted
    }

    pub fn take_queued(&mut self) -> Option<ChunkFetch> {
        if self.slots.len() == MAX_FETCH_SLOTS {
            self.slots.pop()
        } else {
            None
        }
    }

    /// Remove the active fetch. The queued fetch, if any, becomes active.
    pub fn finish_active(&mut self) -> Option<ChunkFetch> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.slots.remove(0))
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ChunkFetch> + '_ {
        self.slots.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_of_one_evicts_previous() {
        let mut slots = FetchSlots::default();
        slots.activate(ChunkFetch::new(0));
        assert!(slots.enqueue(ChunkFetch::new(1)).is_none());

        let (tx, mut rx) = oneshot::channel();
        slots
            .find_mut(1)
            .unwrap()
            .waiters
            .push(Waiter::new(50, false, tx));

        let evicted = slots.enqueue(ChunkFetch::new(2)).unwrap();
        assert_eq!(evicted.chunk_index, 1);
        evicted.reject(FrameError::Cancelled);
        assert!(rx.try_recv().unwrap().unwrap_err().is_cancelled());

        assert_eq!(slots.active().unwrap().chunk_index, 0);
        assert_eq!(slots.queued().unwrap().chunk_index, 2);
    }

    #[test]
    fn finishing_promotes_queued() {
        let mut slots = FetchSlots::default();
        slots.activate(ChunkFetch::new(3));
        slots.enqueue(ChunkFetch::new(7));

        assert_eq!(slots.finish_active().unwrap().chunk_index, 3);
        assert_eq!(slots.active().unwrap().chunk_index, 7);
        assert!(slots.queued().is_none());
        assert!(slots.take_queued().is_none());

        assert_eq!(slots.finish_active().unwrap().chunk_index, 7);
        assert!(slots.finish_active().is_none());
    }
}
