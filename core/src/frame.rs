use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::error::FrameError;
use crate::fetch::PipelineClient;
use crate::meta::{FrameMeta, TaskParams};

/// Decoded pixel data of one frame.
///
/// Cloning only bumps a reference count, so every clone points at the same
/// pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    /// Packed RGBA8 pixels, row by row.
    pub pixels: Bytes,
}

impl ImageData {
    pub fn new(width: u32, height: u32, pixels: Bytes) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// A lazily resolved frame.
///
/// The pixel data is fetched and decoded the first time [`FrameHandle::decode`]
/// is called, unless the handle was served from the lookahead buffer in which
/// case it is already resolved. Clones share the same pixel slot.
#[derive(Clone)]
pub struct FrameHandle {
    pub task_id: u64,
    pub job_id: Option<u64>,
    pub frame_number: usize,
    pub start_frame: usize,
    pub stop_frame: usize,
    pub width: u32,
    pub height: u32,
    pub has_related_context: bool,
    /// Whether playback is expected to move forward from this frame, which
    /// allows the next chunk to be read ahead.
    pub decode_forward: bool,

    image: Arc<OnceCell<ImageData>>,
    pipeline: PipelineClient,
}

impl FrameHandle {
    pub(crate) fn new(
        task_id: u64,
        params: &TaskParams,
        frame_number: usize,
        meta: FrameMeta,
        decode_forward: bool,
        pipeline: PipelineClient,
    ) -> Self {
        Self {
            task_id,
            job_id: params.job_id,
            frame_number,
            start_frame: params.start_frame,
            stop_frame: params.stop_frame,
            width: meta.width,
            height: meta.height,
            has_related_context: meta.related_files > 0,
            decode_forward,
            image: Arc::new(OnceCell::new()),
            pipeline,
        }
    }

    /// Return the pixel data of this frame, fetching and decoding it if needed.
    ///
    /// Only the first successful call does any work. If the request was
    /// superseded, [`FrameError::Cancelled`] is returned and the frame can be
    /// decoded again later.
    pub async fn decode(&self) -> Result<ImageData, FrameError> {
        self.image
            .get_or_try_init(|| {
                self.pipeline
                    .request_frame(self.frame_number, self.decode_forward)
            })
            .await
            .cloned()
    }

    /// The pixel data, if this frame has already been decoded.
    pub fn image_data(&self) -> Option<&ImageData> {
        self.image.get()
    }

    pub fn is_decoded(&self) -> bool {
        self.image.initialized()
    }
}

impl std::fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle")
            .field("task_id", &self.task_id)
            .field("job_id", &self.job_id)
            .field("frame_number", &self.frame_number)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("decode_forward", &self.decode_forward)
            .field("decoded", &self.is_decoded())
            .finish()
    }
}
