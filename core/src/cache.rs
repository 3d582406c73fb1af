use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{FrameSource, LookaheadBuffer};
use crate::error::FrameError;
use crate::fetch::{open_pipeline, DecodeProvider, FetchStatus, PipelineConfig, ProviderOpts};
use crate::frame::FrameHandle;
use crate::meta::{FrameMeta, TaskMeta, TaskParams};
use crate::proxy::ServerProxy;

/// Options for the frame cache of a task.
pub struct CacheOptions<P: DecodeProvider> {
    /// Any additional provider-specific options.
    pub additional_opts: P::AdditionalOpts,

    /// The maximum number of frames the lookahead buffer holds.
    ///
    /// The buffer may be smaller if the memory budget does not allow for
    /// this many decoded frames.
    pub max_buffer_size: usize,

    /// The memory (in bytes) the decoded chunks of a task may occupy.
    pub memory_budget: u64,

    /// How far into its chunk (as a fraction of the chunk size) a frame played
    /// forward has to be before the next chunk is read ahead.
    pub read_ahead_threshold: f32,

    /// A background refill starts once the buffer holds less than this
    /// fraction of its capacity.
    pub refill_threshold: f32,

    /// The size of the message channels to and from the decode server. Set
    /// this to `None` to derive it from the buffer and chunk sizes.
    pub server_msg_channel_size: Option<usize>,

    /// How often the decode server and the fetch pipeline poll for new
    /// messages. Set this to `None` to use the provider's default.
    pub decoder_poll_interval: Option<Duration>,
}

impl<P: DecodeProvider> Default for CacheOptions<P> {
    fn default() -> Self {
        CacheOptions {
            additional_opts: Default::default(),
            max_buffer_size: 180,
            memory_budget: 2_147_483_648,
            read_ahead_threshold: 0.25,
            refill_threshold: 0.75,
            server_msg_channel_size: None,
            decoder_poll_interval: None,
        }
    }
}

impl<P: DecodeProvider> Clone for CacheOptions<P> {
    fn clone(&self) -> Self {
        CacheOptions {
            additional_opts: self.additional_opts.clone(),
            max_buffer_size: self.max_buffer_size,
            memory_budget: self.memory_budget,
            read_ahead_threshold: self.read_ahead_threshold,
            refill_threshold: self.refill_threshold,
            server_msg_channel_size: self.server_msg_channel_size,
            decoder_poll_interval: self.decoder_poll_interval,
        }
    }
}

impl<P: DecodeProvider> std::fmt::Debug for CacheOptions<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("additional_opts", &self.additional_opts)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("memory_budget", &self.memory_budget)
            .field("read_ahead_threshold", &self.read_ahead_threshold)
            .field("refill_threshold", &self.refill_threshold)
            .field("server_msg_channel_size", &self.server_msg_channel_size)
            .field("decoder_poll_interval", &self.decoder_poll_interval)
            .finish()
    }
}

/// Which frames [`TaskFrameCache::find_frame`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFilter {
    /// Return the n-th accepted frame. Must not be zero.
    pub offset: usize,
    /// Skip deleted frames.
    pub not_deleted: bool,
}

impl Default for FrameFilter {
    fn default() -> Self {
        FrameFilter {
            offset: 1,
            not_deleted: false,
        }
    }
}

/// The decoded and the buffered frames of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ranges {
    /// Frames the decode provider holds.
    pub decoded: Vec<usize>,
    /// Frames in the lookahead buffer.
    pub buffered: Vec<usize>,
}

impl Ranges {
    pub fn decoded_spans(&self) -> Vec<RangeInclusive<usize>> {
        spans(&self.decoded)
    }

    pub fn buffered_spans(&self) -> Vec<RangeInclusive<usize>> {
        spans(&self.buffered)
    }
}

/// Fold a sorted list of frames into contiguous spans.
pub fn spans(frames: &[usize]) -> Vec<RangeInclusive<usize>> {
    let mut spans: Vec<RangeInclusive<usize>> = Vec::new();

    for &frame in frames {
        match spans.last_mut() {
            Some(span) if span.end().checked_add(1) == Some(frame) => {
                *span = *span.start()..=frame;
            }
            _ => spans.push(frame..=frame),
        }
    }

    spans
}

/// The frame cache of a single task.
///
/// Binds the task metadata, the fetch pipeline (and with it the decode
/// provider) and the lookahead buffer together.
pub struct TaskFrameCache {
    buffer: LookaheadBuffer,
    blocks_cache_size: usize,
}

impl TaskFrameCache {
    /// Fetch the metadata of a task and open its decode provider.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// This will panic if `max_buffer_size` or `server_msg_channel_size` is 0.
    pub async fn open<P: DecodeProvider, S: ServerProxy>(
        proxy: Arc<S>,
        task_id: u64,
        params: TaskParams,
        opts: CacheOptions<P>,
    ) -> Result<Self, FrameError> {
        if params.chunk_size == 0 {
            return Err(FrameError::InvalidParams("chunk size must be at least 1"));
        }
        assert_ne!(opts.max_buffer_size, 0);
        assert_ne!(opts.server_msg_channel_size, Some(0));

        let meta = proxy
            .get_task_meta(task_id)
            .await
            .map_err(|e| FrameError::Meta(Arc::new(e)))?;

        let chunk_size = params.chunk_size;
        let blocks_cache_size = meta.decoded_blocks_cache_size(opts.memory_budget, chunk_size);
        let capacity = opts
            .max_buffer_size
            .min(blocks_cache_size.saturating_mul(chunk_size));

        // Reserve ample space for the message channels.
        let msg_channel_size = opts
            .server_msg_channel_size
            .unwrap_or((capacity + chunk_size) * 2 + 8);

        let read_ahead_offset = (chunk_size as f32 * opts.read_ahead_threshold) as usize;

        log::debug!(
            "opening task {}: {} decoded chunks of {} frames, buffer of {} frames",
            task_id,
            blocks_cache_size,
            chunk_size,
            capacity
        );

        let provider_opts = ProviderOpts {
            chunk_size,
            chunk_kind: params.chunk_kind,
            dimension: params.dimension,
            start_frame: params.start_frame,
            stop_frame: params.stop_frame,
            blocks_cache_size,
            additional_opts: opts.additional_opts,
        };

        let pipeline = open_pipeline::<P, S>(
            proxy,
            provider_opts,
            PipelineConfig {
                task_id,
                job_id: params.job_id,
                read_ahead_offset,
                msg_channel_size,
                poll_interval: opts.decoder_poll_interval,
            },
        )
        .await?;

        let source = FrameSource {
            task_id,
            params,
            meta,
            pipeline,
        };

        Ok(Self {
            buffer: LookaheadBuffer::new(source, capacity, opts.refill_threshold),
            blocks_cache_size,
        })
    }

    pub fn task_id(&self) -> u64 {
        self.buffer.source().task_id
    }

    pub fn params(&self) -> &TaskParams {
        &self.buffer.source().params
    }

    pub fn meta(&self) -> &TaskMeta {
        &self.buffer.source().meta
    }

    /// The number of decoded chunks the provider was allowed to keep.
    pub fn decoded_blocks_cache_size(&self) -> usize {
        self.blocks_cache_size
    }

    pub fn buffer(&self) -> &LookaheadBuffer {
        &self.buffer
    }

    pub fn frame_meta(&self, frame: usize) -> Result<FrameMeta, FrameError> {
        let source = self.buffer.source();
        Ok(source.params.frame_meta(&source.meta, frame)?)
    }

    pub fn deleted_frames(&self) -> &BTreeSet<usize> {
        &self.meta().deleted_frames
    }

    /// Return a handle to a frame. See [`LookaheadBuffer::require`].
    pub async fn require(
        &self,
        frame: usize,
        fill_buffer: bool,
        step: usize,
    ) -> Result<FrameHandle, FrameError> {
        self.buffer.require(frame, fill_buffer, step).await
    }

    pub async fn ranges(&self) -> Result<Ranges, FrameError> {
        let decoded = self.buffer.source().pipeline.cached_frames().await?;

        Ok(Ranges {
            decoded: decoded.into_iter().collect(),
            buffered: self.buffer.buffered_frames(),
        })
    }

    pub async fn status(&self) -> Result<FetchStatus, FrameError> {
        self.buffer.source().pipeline.status().await
    }

    /// Walk from `from` towards `to` (both inclusive) and return the
    /// `filter.offset`-th frame the filter accepts.
    ///
    /// If fewer frames are accepted, the last accepted one is returned.
    pub fn find_frame(
        &self,
        from: usize,
        to: usize,
        filter: FrameFilter,
    ) -> Result<Option<usize>, FrameError> {
        if filter.offset == 0 {
            return Err(FrameError::InvalidFilter("offset must be at least 1"));
        }

        let deleted = self.deleted_frames();
        let accepts = |frame: &usize| !(filter.not_deleted && deleted.contains(frame));

        let found = if from <= to {
            (from..=to).filter(accepts).take(filter.offset).last()
        } else {
            (to..=from).rev().filter(accepts).take(filter.offset).last()
        };

        Ok(found)
    }

    /// Cancel every pending fill and stop the fetch pipeline.
    ///
    /// Everyone waiting on a frame of this task is rejected with
    /// [`FrameError::Cancelled`].
    pub fn close(&self) {
        self.buffer.clear();
        self.buffer.source().pipeline.close();
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.source().pipeline.is_closed()
    }
}

impl Drop for TaskFrameCache {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[test]
    fn spans_fold_contiguous_frames() {
        assert_eq!(spans(&[]), vec![]);
        assert_eq!(spans(&[0, 1, 2, 5, 7, 8]), vec![0..=2, 5..=5, 7..=8]);
        assert_eq!(spans(&[4]), vec![4..=4]);
    }

    #[tokio::test]
    async fn open_sizes_the_buffer() {
        let proxy = MockProxy::new(task_meta(100));
        let cache = open_cache(&proxy, task_params(36, 99), CacheOptions::default()).await;

        assert_eq!(cache.buffer().capacity(), 180);
        assert_eq!(proxy.meta_fetches(), 1);

        let opts = CacheOptions {
            memory_budget: 4 * 36 * 2,
            ..Default::default()
        };
        let cache = open_cache(&proxy, task_params(36, 99), opts).await;

        assert_eq!(cache.decoded_blocks_cache_size(), 2);
        assert_eq!(cache.buffer().capacity(), 72);
    }

    #[tokio::test]
    async fn open_rejects_empty_chunks() {
        let proxy = MockProxy::new(task_meta(100));

        let res = TaskFrameCache::open::<MockProvider, _>(
            Arc::clone(&proxy),
            1,
            task_params(0, 99),
            CacheOptions::default(),
        )
        .await;

        assert!(matches!(res, Err(FrameError::InvalidParams(_))));
        assert_eq!(proxy.meta_fetches(), 0);
    }

    #[tokio::test]
    async fn find_frame_skips_deleted() {
        let mut meta = task_meta(20);
        meta.deleted_frames.extend([3, 4, 6]);
        let proxy = MockProxy::new(meta);
        let cache = open_cache(&proxy, task_params(10, 19), CacheOptions::default()).await;

        let not_deleted = FrameFilter {
            offset: 1,
            not_deleted: true,
        };
        assert_eq!(cache.find_frame(3, 10, not_deleted).unwrap(), Some(5));
        assert_eq!(cache.find_frame(6, 0, not_deleted).unwrap(), Some(5));
        assert_eq!(cache.find_frame(3, 4, not_deleted).unwrap(), None);

        let second = FrameFilter {
            offset: 2,
            not_deleted: true,
        };
        assert_eq!(cache.find_frame(3, 10, second).unwrap(), Some(7));
        // Fewer matches than the offset yields the last match.
        assert_eq!(cache.find_frame(4, 5, second).unwrap(), Some(5));

        assert_eq!(
            cache.find_frame(3, 10, FrameFilter::default()).unwrap(),
            Some(3)
        );
        assert!(matches!(
            cache.find_frame(
                0,
                10,
                FrameFilter {
                    offset: 0,
                    not_deleted: false
                }
            ),
            Err(FrameError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn close_stops_the_pipeline() {
        let proxy = MockProxy::new(task_meta(100));
        let cache = open_cache(&proxy, task_params(36, 99), CacheOptions::default()).await;

        cache.close();
        wait_for(|| cache.is_closed()).await;

        assert!(matches!(
            cache.status().await,
            Err(FrameError::PipelineClosed)
        ));
    }
}
