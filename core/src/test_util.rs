use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::*;

pub const CORRUPT: &[u8] = b"corrupt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockError(pub String);

impl std::error::Error for MockError {}

impl std::fmt::Display for MockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An in-memory server. Chunk fetches are logged and can be held back until
/// released.
#[derive(Default)]
pub struct MockProxy {
    meta: TaskMeta,
    fetches: Mutex<Vec<usize>>,
    meta_fetches: Mutex<usize>,
    gates: Mutex<HashMap<usize, Arc<Notify>>>,
    meta_gate: Mutex<Option<Arc<Notify>>>,
    failing: Mutex<HashSet<usize>>,
    corrupt: Mutex<HashSet<usize>>,
}

impl MockProxy {
    pub fn new(meta: TaskMeta) -> Arc<Self> {
        Arc::new(Self {
            meta,
            ..Default::default()
        })
    }

    /// Make the next fetch of `chunk_index` wait for [`MockProxy::release`].
    pub fn hold(&self, chunk_index: usize) {
        self.gates
            .lock()
            .unwrap()
            .insert(chunk_index, Arc::new(Notify::new()));
    }

    pub fn release(&self, chunk_index: usize) {
        if let Some(gate) = self.gates.lock().unwrap().remove(&chunk_index) {
            gate.notify_one();
        }
    }

    /// Make the next fetch of the task meta wait for
    /// [`MockProxy::release_meta`].
    pub fn hold_meta(&self) {
        *self.meta_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release_meta(&self) {
        if let Some(gate) = self.meta_gate.lock().unwrap().take() {
            gate.notify_one();
        }
    }

    pub fn fail(&self, chunk_index: usize) {
        self.failing.lock().unwrap().insert(chunk_index);
    }

    /// Serve a chunk again after [`MockProxy::fail`].
    pub fn recover(&self, chunk_index: usize) {
        self.failing.lock().unwrap().remove(&chunk_index);
    }

    /// Serve bytes the provider cannot decode.
    pub fn corrupt(&self, chunk_index: usize) {
        self.corrupt.lock().unwrap().insert(chunk_index);
    }

    pub fn fetches(&self) -> Vec<usize> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn meta_fetches(&self) -> usize {
        *self.meta_fetches.lock().unwrap()
    }
}

impl ServerProxy for MockProxy {
    type Error = MockError;

    async fn get_chunk(
        &self,
        _task_id: u64,
        _job_id: Option<u64>,
        chunk_index: usize,
    ) -> Result<Bytes, MockError> {
        self.fetches.lock().unwrap().push(chunk_index);

        let gate = self.gates.lock().unwrap().get(&chunk_index).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().unwrap().contains(&chunk_index) {
            return Err(MockError(format!("chunk {} is not available", chunk_index)));
        }
        if self.corrupt.lock().unwrap().contains(&chunk_index) {
            return Ok(Bytes::from_static(CORRUPT));
        }

        Ok(Bytes::from(format!("chunk {}", chunk_index)))
    }

    async fn get_task_meta(&self, _task_id: u64) -> Result<TaskMeta, MockError> {
        *self.meta_fetches.lock().unwrap() += 1;

        let gate = self.meta_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        Ok(self.meta.clone())
    }

    async fn get_context_image(
        &self,
        task_id: u64,
        _job_id: Option<u64>,
        frame: usize,
    ) -> Result<Bytes, MockError> {
        Ok(Bytes::from(format!("context {} {}", task_id, frame)))
    }

    async fn get_preview(&self, task_id: u64, _job_id: Option<u64>) -> Result<Bytes, MockError> {
        Ok(Bytes::from(format!("preview {}", task_id)))
    }
}

/// Decodes every frame into a 1x1 image whose pixel is the frame number.
pub struct MockProvider {
    frames: BTreeMap<usize, ImageData>,
    loading: BTreeSet<usize>,
    chunk_size: usize,
}

impl DecodeProvider for MockProvider {
    type AdditionalOpts = ();
    type OpenError = MockError;
    type FatalError = MockError;

    const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    fn new(opts: ProviderOpts<()>) -> Result<Self, MockError> {
        Ok(Self {
            frames: BTreeMap::new(),
            loading: BTreeSet::new(),
            chunk_size: opts.chunk_size,
        })
    }

    fn frame(&mut self, frame: usize) -> Option<ImageData> {
        self.frames.get(&frame).cloned()
    }

    fn is_chunk_cached(&self, start: usize, stop: usize) -> bool {
        (start..=stop).all(|frame| self.frames.contains_key(&frame))
    }

    fn decode_block(&mut self, bytes: Bytes, start: usize, stop: usize) -> Result<(), MockError> {
        self.loading.remove(&(start / self.chunk_size));

        if bytes.as_ref() == CORRUPT {
            return Err(MockError(format!("cannot decode frames {}..={}", start, stop)));
        }

        for frame in start..=stop {
            let pixels = Bytes::copy_from_slice(&(frame as u32).to_le_bytes());
            self.frames.insert(frame, ImageData::new(1, 1, pixels));
        }

        Ok(())
    }

    fn is_next_chunk_exists(&self, frame: usize) -> bool {
        let next = frame / self.chunk_size + 1;
        self.loading.contains(&next) || self.frames.contains_key(&(next * self.chunk_size))
    }

    fn set_ready_to_loading(&mut self, chunk_index: usize) {
        self.loading.insert(chunk_index);
    }

    fn set_loading_failed(&mut self, chunk_index: usize) {
        self.loading.remove(&chunk_index);
    }

    fn cached_frames(&self) -> BTreeSet<usize> {
        self.frames.keys().copied().collect()
    }
}

pub fn task_meta(size: usize) -> TaskMeta {
    TaskMeta {
        frames: vec![FrameMeta::new(1, 1)],
        size,
        deleted_frames: BTreeSet::new(),
    }
}

pub fn task_params(chunk_size: usize, stop_frame: usize) -> TaskParams {
    TaskParams {
        job_id: Some(7),
        chunk_size,
        chunk_kind: ChunkKind::Video,
        mode: TaskMode::Interpolation,
        start_frame: 0,
        stop_frame,
        dimension: Dimension::D2,
    }
}

/// Returns the frame number stored in the pixel of a [`MockProvider`] image.
pub fn decoded_frame(image: &ImageData) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&image.pixels[..4]);
    u32::from_le_bytes(bytes)
}

pub async fn open_cache(
    proxy: &Arc<MockProxy>,
    params: TaskParams,
    opts: CacheOptions<MockProvider>,
) -> TaskFrameCache {
    TaskFrameCache::open(Arc::clone(proxy), 1, params, opts)
        .await
        .unwrap()
}

/// Wait until `check` passes, polling the pipeline state.
pub async fn wait_for<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition was not met in time");
}
