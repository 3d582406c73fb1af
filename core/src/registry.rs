use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::cache::{CacheOptions, FrameFilter, Ranges, TaskFrameCache};
use crate::error::FrameError;
use crate::fetch::DecodeProvider;
use crate::frame::FrameHandle;
use crate::meta::TaskParams;
use crate::proxy::ServerProxy;

type CacheSlot = Arc<OnceCell<Arc<TaskFrameCache>>>;

/// The frame caches of every open task.
///
/// A task's cache is opened on first use and lives until the task is
/// cleared.
pub struct FrameCacheRegistry<P: DecodeProvider, S: ServerProxy> {
    proxy: Arc<S>,
    opts: CacheOptions<P>,
    caches: Mutex<HashMap<u64, CacheSlot>>,
}

impl<P: DecodeProvider, S: ServerProxy> FrameCacheRegistry<P, S> {
    pub fn new(proxy: Arc<S>, opts: CacheOptions<P>) -> Self {
        Self {
            proxy,
            opts,
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn proxy(&self) -> &Arc<S> {
        &self.proxy
    }

    /// Return the cache of a task, opening it if needed.
    ///
    /// Concurrent calls for the same task share one open. If opening fails,
    /// the next call tries again. If the task is closed while it is being
    /// opened, the new cache is closed too and this returns
    /// [`FrameError::Cancelled`].
    pub async fn open(
        &self,
        task_id: u64,
        params: &TaskParams,
    ) -> Result<Arc<TaskFrameCache>, FrameError> {
        let slot = Arc::clone(self.lock().entry(task_id).or_default());

        let cache = slot
            .get_or_try_init(|| async {
                TaskFrameCache::open::<P, S>(
                    Arc::clone(&self.proxy),
                    task_id,
                    params.clone(),
                    self.opts.clone(),
                )
                .await
                .map(Arc::new)
            })
            .await?;

        let registered = self
            .lock()
            .get(&task_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !registered {
            log::debug!("task {} was closed while its cache was opening", task_id);
            cache.close();
            return Err(FrameError::Cancelled);
        }

        Ok(Arc::clone(cache))
    }

    /// The cache of a task, if it is open.
    pub fn get(&self, task_id: u64) -> Option<Arc<TaskFrameCache>> {
        self.lock()
            .get(&task_id)
            .and_then(|slot| slot.get())
            .cloned()
    }

    /// Close the cache of a task and forget it.
    ///
    /// Returns false if the task had no open cache.
    pub fn close(&self, task_id: u64) -> bool {
        let slot = self.lock().remove(&task_id);

        match slot.as_ref().and_then(|slot| slot.get()) {
            Some(cache) => {
                log::debug!("closing the frame cache of task {}", task_id);
                cache.close();
                true
            }
            None => false,
        }
    }

    /// Drop every buffered frame of a task and cancel everything pending.
    ///
    /// The next request for the task opens a fresh cache.
    pub fn clear(&self, task_id: u64) {
        self.close(task_id);
    }

    /// Return a handle to a frame of a task.
    ///
    /// * `is_playing` - Playback is running, so the lookahead buffer is
    ///   filled and kept filled.
    /// * `step` - The distance between consecutive frames during playback.
    pub async fn get_frame(
        &self,
        task_id: u64,
        params: &TaskParams,
        frame: usize,
        is_playing: bool,
        step: usize,
    ) -> Result<FrameHandle, FrameError> {
        if frame < params.start_frame || frame > params.stop_frame {
            return Err(FrameError::FrameOutOfRange {
                frame,
                start: params.start_frame,
                stop: params.stop_frame,
            });
        }

        let cache = self.open(task_id, params).await?;
        cache.require(frame, is_playing, step).await
    }

    /// The decoded and buffered frames of a task. Empty if the task is not
    /// open.
    pub async fn get_ranges(&self, task_id: u64) -> Result<Ranges, FrameError> {
        match self.get(task_id) {
            Some(cache) => cache.ranges().await,
            None => Ok(Ranges::default()),
        }
    }

    pub async fn find_frame(
        &self,
        task_id: u64,
        params: &TaskParams,
        from: usize,
        to: usize,
        filter: FrameFilter,
    ) -> Result<Option<usize>, FrameError> {
        let cache = self.open(task_id, params).await?;
        cache.find_frame(from, to, filter)
    }

    pub async fn get_context_image(
        &self,
        task_id: u64,
        job_id: Option<u64>,
        frame: usize,
    ) -> Result<Bytes, FrameError> {
        self.proxy
            .get_context_image(task_id, job_id, frame)
            .await
            .map_err(|e| FrameError::Server(Arc::new(e)))
    }

    pub async fn get_preview(
        &self,
        task_id: u64,
        job_id: Option<u64>,
    ) -> Result<Bytes, FrameError> {
        self.proxy
            .get_preview(task_id, job_id)
            .await
            .map_err(|e| FrameError::Server(Arc::new(e)))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, CacheSlot>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    fn registry(proxy: &Arc<MockProxy>) -> FrameCacheRegistry<MockProvider, MockProxy> {
        FrameCacheRegistry::new(Arc::clone(proxy), CacheOptions::default())
    }

    #[tokio::test]
    async fn get_frame_checks_the_range() {
        let proxy = MockProxy::new(task_meta(100));
        let registry = registry(&proxy);
        let mut params = task_params(36, 99);
        params.start_frame = 10;

        assert!(matches!(
            registry.get_frame(1, &params, 9, false, 1).await,
            Err(FrameError::FrameOutOfRange {
                frame: 9,
                start: 10,
                stop: 99
            })
        ));
        assert!(matches!(
            registry.get_frame(1, &params, 100, false, 1).await,
            Err(FrameError::FrameOutOfRange { frame: 100, .. })
        ));
        assert!(registry.get(1).is_none());
    }

    #[tokio::test]
    async fn every_frame_number_round_trips() {
        let proxy = MockProxy::new(task_meta(100));
        let registry = registry(&proxy);
        let params = task_params(36, 99);

        for frame in [0, 1, 35, 36, 71, 72, 99] {
            let handle = registry.get_frame(1, &params, frame, false, 1).await.unwrap();
            assert_eq!(handle.frame_number, frame);
            assert_eq!(handle.stop_frame, 99);
            assert_eq!(handle.job_id, Some(7));
        }

        // One cache for the task.
        assert_eq!(proxy.meta_fetches(), 1);
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_cache() {
        let proxy = MockProxy::new(task_meta(100));
        let registry = registry(&proxy);
        let params = task_params(36, 99);

        let (a, b) = tokio::join!(registry.open(3, &params), registry.open(3, &params));

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(proxy.meta_fetches(), 1);
    }

    #[tokio::test]
    async fn clear_discards_the_task() {
        let proxy = MockProxy::new(task_meta(100));
        let registry = registry(&proxy);
        let params = task_params(36, 99);

        let handle = registry.get_frame(1, &params, 0, true, 1).await.unwrap();
        assert_eq!(decoded_frame(handle.image_data().unwrap()), 0);

        let ranges = registry.get_ranges(1).await.unwrap();
        assert_eq!(ranges.decoded_spans(), vec![0..=99]);
        assert_eq!(ranges.buffered_spans(), vec![1..=99]);

        registry.clear(1);

        assert!(registry.get(1).is_none());
        assert_eq!(registry.get_ranges(1).await.unwrap(), Ranges::default());

        registry.get_frame(1, &params, 0, false, 1).await.unwrap();
        assert_eq!(proxy.meta_fetches(), 2);
    }

    #[tokio::test]
    async fn close_during_open_discards_the_cache() {
        let proxy = MockProxy::new(task_meta(100));
        let registry = registry(&proxy);
        let params = task_params(36, 99);
        proxy.hold_meta();

        let close = async {
            wait_for(|| proxy.meta_fetches() == 1).await;
            // Nothing is open yet.
            assert!(!registry.close(3));
            proxy.release_meta();
        };
        let (res, ()) = tokio::join!(registry.open(3, &params), close);

        assert!(matches!(res, Err(FrameError::Cancelled)));
        assert!(registry.get(3).is_none());

        // The next request opens a fresh cache.
        let cache = registry.open(3, &params).await.unwrap();
        assert!(!cache.is_closed());
        assert_eq!(proxy.meta_fetches(), 2);
    }

    #[tokio::test]
    async fn zero_chunk_size_is_rejected() {
        let proxy = MockProxy::new(task_meta(100));
        let registry = registry(&proxy);

        assert!(matches!(
            registry.get_frame(1, &task_params(0, 99), 5, true, 1).await,
            Err(FrameError::InvalidParams(_))
        ));
        assert!(registry.get(1).is_none());
    }

    #[tokio::test]
    async fn pass_through_requests() {
        let proxy = MockProxy::new(task_meta(100));
        let registry = registry(&proxy);

        assert_eq!(
            registry.get_context_image(4, None, 12).await.unwrap(),
            Bytes::from_static(b"context 4 12")
        );
        assert_eq!(
            registry.get_preview(4, None).await.unwrap(),
            Bytes::from_static(b"preview 4")
        );
    }
}
