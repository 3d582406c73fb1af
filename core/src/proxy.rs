use std::error::Error;
use std::future::Future;

use bytes::Bytes;

use crate::meta::TaskMeta;

/// The server that holds the raw chunk data and the metadata of each task.
///
/// Implementations are shared between the cache of every task and the fetch
/// pipelines, so all methods take `&self`.
pub trait ServerProxy: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Fetch the raw (still encoded) bytes of one chunk.
    fn get_chunk(
        &self,
        task_id: u64,
        job_id: Option<u64>,
        chunk_index: usize,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;

    fn get_task_meta(&self, task_id: u64)
        -> impl Future<Output = Result<TaskMeta, Self::Error>> + Send;

    /// Fetch the related context images of a frame.
    fn get_context_image(
        &self,
        task_id: u64,
        job_id: Option<u64>,
        frame: usize,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;

    fn get_preview(
        &self,
        task_id: u64,
        job_id: Option<u64>,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}
