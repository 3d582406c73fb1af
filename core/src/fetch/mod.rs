use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rtrb::RingBuffer;

mod pipeline;
mod provider;
mod server;
mod slots;

pub use pipeline::{FetchStatus, PipelineClient};
pub use provider::{DecodeProvider, ProviderOpts};

use pipeline::ChunkPipeline;
use server::DecodeServer;

use crate::error::{FrameError, SharedError};
use crate::frame::ImageData;
use crate::proxy::ServerProxy;

pub(crate) enum ServerToClientMsg {
    FrameRes {
        frame: usize,
        image: Option<ImageData>,
        read_ahead: bool,
    },
    CachedFramesRes {
        frames: BTreeSet<usize>,
    },
    DecodeRes {
        chunk_index: usize,
        frames: Vec<(usize, ImageData)>,
    },
    DecodeError {
        chunk_index: usize,
        error: SharedError,
    },
}

pub(crate) enum ClientToServerMsg {
    QueryFrame {
        frame: usize,
        check_next_chunk: bool,
    },
    QueryCachedFrames,
    ReadyToLoading {
        chunk_index: usize,
    },
    LoadingFailed {
        chunk_index: usize,
    },
    DecodeBlock {
        chunk_index: usize,
        bytes: Bytes,
        start_frame: usize,
        stop_frame: usize,
    },
}

/// Tunables of one task's fetch pipeline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineConfig {
    pub task_id: u64,
    pub job_id: Option<u64>,
    /// A forward-decoding frame must be more than this many frames into its
    /// chunk before the next chunk is read ahead.
    pub read_ahead_offset: usize,
    pub msg_channel_size: usize,
    pub poll_interval: Option<Duration>,
}

/// Open the decode provider on its own thread and spawn the fetch pipeline of
/// one task on the current tokio runtime.
pub(crate) async fn open_pipeline<P: DecodeProvider, S: ServerProxy>(
    proxy: Arc<S>,
    provider_opts: ProviderOpts<P::AdditionalOpts>,
    config: PipelineConfig,
) -> Result<PipelineClient, FrameError> {
    assert_ne!(provider_opts.chunk_size, 0);
    assert_ne!(config.msg_channel_size, 0);

    let (to_server_tx, from_client_rx) =
        RingBuffer::<ClientToServerMsg>::new(config.msg_channel_size);
    let (to_client_tx, from_server_rx) =
        RingBuffer::<ServerToClientMsg>::new(config.msg_channel_size);

    // Create dedicated close signal.
    let (close_signal_tx, close_signal_rx) = RingBuffer::<()>::new(1);

    let chunk_size = provider_opts.chunk_size;
    let stop_frame = provider_opts.stop_frame;

    DecodeServer::<P>::spawn(
        provider_opts,
        config.poll_interval,
        to_client_tx,
        from_client_rx,
        close_signal_rx,
    )
    .await?;

    Ok(ChunkPipeline::spawn(
        proxy,
        chunk_size,
        stop_frame,
        config,
        to_server_tx,
        from_server_rx,
        close_signal_tx,
        config.poll_interval.unwrap_or(P::DEFAULT_POLL_INTERVAL),
    ))
}
