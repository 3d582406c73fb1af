use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use framestream::{
    CacheOptions, ChunkKind, Dimension, FrameCacheRegistry, RawDecoder, TaskMode, TaskParams,
};
use tokio::sync::mpsc;

mod process;
mod server;

use server::SyntheticServer;

const TASK_ID: u64 = 1;

pub enum ControlMsg {
    SetLoop { start: usize, end: usize },
    PlayResume,
    Pause,
    Stop,
    Restart,
    SeekTo(usize),
}

pub enum StatusMsg {
    PlaybackPos { frame: usize, gray: u8 },
    Buffering { frame: usize, waited: Duration },
}

/// Plays through a generated task, seeking around to exercise the frame cache.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The number of frames in the task.
    #[arg(long, default_value_t = 600)]
    frames: usize,
    #[arg(long, default_value_t = 36)]
    chunk_size: usize,
    #[arg(long, default_value_t = 64)]
    width: u32,
    #[arg(long, default_value_t = 48)]
    height: u32,
    /// Simulated network latency of a chunk fetch, in milliseconds.
    #[arg(long, default_value_t = 40)]
    latency_ms: u64,
    #[arg(long, default_value_t = 25)]
    fps: u32,
    /// Play every n-th frame.
    #[arg(long, default_value_t = 1)]
    step: usize,
    /// How long to play after each seek, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    play_ms: u64,
    /// Frames to jump to during playback.
    #[arg(long, value_delimiter = ',', default_values_t = [300, 120])]
    seek: Vec<usize>,
    /// Frames the server reports as deleted.
    #[arg(long, value_delimiter = ',')]
    deleted: Vec<usize>,
    /// Skip deleted frames while playing.
    #[arg(long)]
    skip_deleted: bool,
    #[arg(long, default_value_t = 180)]
    max_buffer: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    anyhow::ensure!(args.frames > 0, "the task needs at least one frame");
    anyhow::ensure!(args.chunk_size > 0, "the chunk size must not be zero");

    let server = Arc::new(SyntheticServer {
        num_frames: args.frames,
        chunk_size: args.chunk_size,
        width: args.width,
        height: args.height,
        latency: Duration::from_millis(args.latency_ms),
        deleted_frames: args.deleted.iter().copied().collect::<BTreeSet<_>>(),
    });

    let opts = CacheOptions::<RawDecoder> {
        max_buffer_size: args.max_buffer,
        ..Default::default()
    };
    let registry = Arc::new(FrameCacheRegistry::new(server, opts));

    let params = TaskParams {
        job_id: None,
        chunk_size: args.chunk_size,
        chunk_kind: ChunkKind::Video,
        mode: TaskMode::Interpolation,
        start_frame: 0,
        stop_frame: args.frames - 1,
        dimension: Dimension::D2,
    };

    let (to_process_tx, from_control_rx) = mpsc::unbounded_channel();
    let (to_status_tx, mut from_process_rx) = mpsc::unbounded_channel();

    let process = process::Process::new(
        Arc::clone(&registry),
        TASK_ID,
        params,
        args.step,
        Duration::from_secs(1) / args.fps.max(1),
        args.skip_deleted,
        from_control_rx,
        to_status_tx,
    );
    let process = tokio::spawn(process.run());

    let status = tokio::spawn(async move {
        while let Some(msg) = from_process_rx.recv().await {
            match msg {
                StatusMsg::PlaybackPos { frame, gray } => {
                    log::info!("frame {:>5} (gray {:>3})", frame, gray)
                }
                StatusMsg::Buffering { frame, waited } => {
                    log::warn!("buffering: frame {} took {:?}", frame, waited)
                }
            }
        }
    });

    let play = Duration::from_millis(args.play_ms);

    let _ = to_process_tx.send(ControlMsg::SetLoop {
        start: 0,
        end: args.frames - 1,
    });
    let _ = to_process_tx.send(ControlMsg::PlayResume);
    tokio::time::sleep(play).await;

    for frame in args.seek {
        log::info!("seeking to frame {}", frame);
        let _ = to_process_tx.send(ControlMsg::SeekTo(frame));
        tokio::time::sleep(play).await;
    }

    let _ = to_process_tx.send(ControlMsg::Pause);
    let ranges = registry.get_ranges(TASK_ID).await?;
    log::info!("decoded frames: {:?}", ranges.decoded_spans());
    log::info!("buffered frames: {:?}", ranges.buffered_spans());

    let _ = to_process_tx.send(ControlMsg::Stop);
    let _ = to_process_tx.send(ControlMsg::Restart);
    tokio::time::sleep(play / 4).await;

    drop(to_process_tx);
    process.await??;
    status.await?;

    registry.clear(TASK_ID);

    Ok(())
}
