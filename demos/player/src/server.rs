use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use framestream::{encode_chunk, FrameMeta, ImageData, ServerProxy, TaskMeta};

#[derive(Debug)]
pub enum ServerError {
    NoSuchChunk(usize),
}

impl std::error::Error for ServerError {}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::NoSuchChunk(i) => write!(f, "No chunk {} on the server", i),
        }
    }
}

/// Serves a task of generated frames, each chunk after a fixed delay.
pub struct SyntheticServer {
    pub num_frames: usize,
    pub chunk_size: usize,
    pub width: u32,
    pub height: u32,
    pub latency: Duration,
    pub deleted_frames: BTreeSet<usize>,
}

impl SyntheticServer {
    fn frame(&self, frame: usize) -> ImageData {
        // Every frame is a solid gray level so playback can be checked by eye in the log.
        let gray = (frame % 256) as u8;
        let mut pixels = Vec::with_capacity((self.width * self.height * 4) as usize);
        for _ in 0..self.width * self.height {
            pixels.extend_from_slice(&[gray, gray, gray, 255]);
        }

        ImageData::new(self.width, self.height, Bytes::from(pixels))
    }
}

impl ServerProxy for SyntheticServer {
    type Error = ServerError;

    async fn get_chunk(
        &self,
        task_id: u64,
        _job_id: Option<u64>,
        chunk_index: usize,
    ) -> Result<Bytes, ServerError> {
        let start = chunk_index * self.chunk_size;
        if start >= self.num_frames {
            return Err(ServerError::NoSuchChunk(chunk_index));
        }
        let stop = (start + self.chunk_size).min(self.num_frames);

        log::info!("task {}: serving chunk {}", task_id, chunk_index);
        tokio::time::sleep(self.latency).await;

        let frames: Vec<ImageData> = (start..stop).map(|frame| self.frame(frame)).collect();
        Ok(encode_chunk(&frames))
    }

    async fn get_task_meta(&self, _task_id: u64) -> Result<TaskMeta, ServerError> {
        Ok(TaskMeta {
            frames: vec![FrameMeta::new(self.width, self.height)],
            size: self.num_frames,
            deleted_frames: self.deleted_frames.clone(),
        })
    }

    async fn get_context_image(
        &self,
        _task_id: u64,
        _job_id: Option<u64>,
        frame: usize,
    ) -> Result<Bytes, ServerError> {
        Ok(self.frame(frame).pixels)
    }

    async fn get_preview(&self, _task_id: u64, _job_id: Option<u64>) -> Result<Bytes, ServerError> {
        Ok(self.frame(0).pixels)
    }
}
