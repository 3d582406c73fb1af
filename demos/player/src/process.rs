use std::sync::Arc;
use std::time::{Duration, Instant};

use framestream::{FrameCacheRegistry, FrameFilter, RawDecoder, TaskParams};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::server::SyntheticServer;
use crate::{ControlMsg, StatusMsg};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackState {
    Paused,
    Playing,
}

pub struct Process {
    registry: Arc<FrameCacheRegistry<RawDecoder, SyntheticServer>>,
    task_id: u64,
    params: TaskParams,

    from_control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    to_status_tx: mpsc::UnboundedSender<StatusMsg>,

    playback_state: PlaybackState,
    playhead: usize,
    step: usize,
    frame_period: Duration,
    skip_deleted: bool,

    loop_start: usize,
    loop_end: usize,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FrameCacheRegistry<RawDecoder, SyntheticServer>>,
        task_id: u64,
        params: TaskParams,
        step: usize,
        frame_period: Duration,
        skip_deleted: bool,
        from_control_rx: mpsc::UnboundedReceiver<ControlMsg>,
        to_status_tx: mpsc::UnboundedSender<StatusMsg>,
    ) -> Self {
        let loop_start = params.start_frame;
        let loop_end = params.stop_frame;

        Self {
            registry,
            task_id,
            params,
            from_control_rx,
            to_status_tx,
            playback_state: PlaybackState::Paused,
            playhead: loop_start,
            step: step.max(1),
            frame_period,
            skip_deleted,
            loop_start,
            loop_end,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.frame_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let playing = self.playback_state == PlaybackState::Playing;

            tokio::select! {
                msg = self.from_control_rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg).await?,
                    None => break,
                },
                _ = ticker.tick(), if playing => self.advance().await?,
            }
        }

        Ok(())
    }

    async fn handle_msg(&mut self, msg: ControlMsg) -> anyhow::Result<()> {
        match msg {
            ControlMsg::SetLoop { start, end } => {
                self.loop_start = start.max(self.params.start_frame);
                self.loop_end = end.min(self.params.stop_frame);
            }
            ControlMsg::PlayResume => {
                self.playback_state = PlaybackState::Playing;
            }
            ControlMsg::Pause => {
                self.playback_state = PlaybackState::Paused;
            }
            ControlMsg::Stop => {
                self.playback_state = PlaybackState::Paused;
                self.playhead = self.loop_start;
                self.show().await?;
            }
            ControlMsg::Restart => {
                self.playback_state = PlaybackState::Playing;
                self.playhead = self.loop_start;
            }
            ControlMsg::SeekTo(frame) => {
                self.playhead = frame.clamp(self.params.start_frame, self.params.stop_frame);
                self.show().await?;
            }
        }

        Ok(())
    }

    async fn advance(&mut self) -> anyhow::Result<()> {
        self.show().await?;

        let mut next = self.playhead + self.step;
        if self.skip_deleted && next <= self.loop_end {
            let filter = FrameFilter {
                offset: 1,
                not_deleted: true,
            };
            next = self
                .registry
                .find_frame(self.task_id, &self.params, next, self.loop_end, filter)
                .await?
                .unwrap_or(self.loop_end + 1);
        }

        // Loop back to the start once the end has been played.
        self.playhead = if next > self.loop_end {
            self.loop_start
        } else {
            next
        };

        Ok(())
    }

    /// Fetch and decode the frame under the playhead.
    async fn show(&mut self) -> anyhow::Result<()> {
        let playing = self.playback_state == PlaybackState::Playing;
        let started = Instant::now();

        let handle = self
            .registry
            .get_frame(self.task_id, &self.params, self.playhead, playing, self.step)
            .await?;

        let image = match handle.decode().await {
            Ok(image) => image,
            Err(e) if e.is_cancelled() => {
                log::debug!("frame {} was superseded", handle.frame_number);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let waited = started.elapsed();
        if waited > self.frame_period {
            let _ = self.to_status_tx.send(StatusMsg::Buffering {
                frame: handle.frame_number,
                waited,
            });
        }

        let _ = self.to_status_tx.send(StatusMsg::PlaybackPos {
            frame: handle.frame_number,
            gray: image.pixels.first().copied().unwrap_or_default(),
        });

        Ok(())
    }
}
