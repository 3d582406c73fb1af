use std::sync::Arc;
use std::time::Duration;

use rtrb::{Consumer, Producer};
use tokio::sync::oneshot;

use super::{ClientToServerMsg, DecodeProvider, ProviderOpts, ServerToClientMsg};
use crate::error::{FrameError, SharedError};

/// Owns the decode provider of one task on a dedicated thread.
pub(crate) struct DecodeServer<P: DecodeProvider> {
    to_client_tx: Producer<ServerToClientMsg>,
    from_client_rx: Consumer<ClientToServerMsg>,
    close_signal_rx: Consumer<()>,

    provider: P,

    chunk_size: usize,
    stop_frame: usize,

    run: bool,
    poll_interval: Duration,
}

impl<P: DecodeProvider> DecodeServer<P> {
    /// Open the provider on a new thread and start serving requests.
    ///
    /// Resolves once the provider has been opened.
    pub(crate) async fn spawn(
        opts: ProviderOpts<P::AdditionalOpts>,
        poll_interval: Option<Duration>,
        to_client_tx: Producer<ServerToClientMsg>,
        from_client_rx: Consumer<ClientToServerMsg>,
        close_signal_rx: Consumer<()>,
    ) -> Result<(), FrameError> {
        let (open_tx, open_rx) = oneshot::channel::<Result<(), SharedError>>();

        let chunk_size = opts.chunk_size;
        let stop_frame = opts.stop_frame;
        let poll_interval = poll_interval.unwrap_or(P::DEFAULT_POLL_INTERVAL);

        std::thread::spawn(move || match P::new(opts) {
            Ok(provider) => {
                // Send cannot fail unless the task that opened us went away, in which
                // case the ring buffers are abandoned and the server stops right away.
                let _ = open_tx.send(Ok(()));

                DecodeServer::run(Self {
                    to_client_tx,
                    from_client_rx,
                    close_signal_rx,
                    provider,
                    chunk_size,
                    stop_frame,
                    run: true,
                    poll_interval,
                });
            }
            Err(e) => {
                log::error!("failed to open the decode provider: {}", e);
                let _ = open_tx.send(Err(Arc::new(e)));
            }
        });

        match open_rx.await {
            Ok(res) => res.map_err(FrameError::ProviderOpen),
            Err(_) => Err(FrameError::PipelineClosed),
        }
    }

    fn run(mut self) {
        while self.run {
            // Check for close signal.
            if self.close_signal_rx.pop().is_ok() || self.from_client_rx.is_abandoned() {
                break;
            }

            while let Ok(msg) = self.from_client_rx.pop() {
                match msg {
                    ClientToServerMsg::QueryFrame {
                        frame,
                        check_next_chunk,
                    } => {
                        let image = self.provider.frame(frame);
                        let read_ahead = check_next_chunk && self.next_chunk_missing(frame);

                        self.send_msg(ServerToClientMsg::FrameRes {
                            frame,
                            image,
                            read_ahead,
                        });
                    }
                    ClientToServerMsg::QueryCachedFrames => {
                        let frames = self.provider.cached_frames();
                        self.send_msg(ServerToClientMsg::CachedFramesRes { frames });
                    }
                    ClientToServerMsg::ReadyToLoading { chunk_index } => {
                        self.provider.set_ready_to_loading(chunk_index);
                    }
                    ClientToServerMsg::LoadingFailed { chunk_index } => {
                        self.provider.set_loading_failed(chunk_index);
                    }
                    ClientToServerMsg::DecodeBlock {
                        chunk_index,
                        bytes,
                        start_frame,
                        stop_frame,
                    } => match self.provider.decode_block(bytes, start_frame, stop_frame) {
                        Ok(()) => {
                            let frames = (start_frame..=stop_frame)
                                .filter_map(|frame| {
                                    self.provider.frame(frame).map(|image| (frame, image))
                                })
                                .collect();

                            self.send_msg(ServerToClientMsg::DecodeRes {
                                chunk_index,
                                frames,
                            });
                        }
                        Err(e) => {
                            log::error!("failed to decode chunk {}: {}", chunk_index, e);
                            self.send_msg(ServerToClientMsg::DecodeError {
                                chunk_index,
                                error: Arc::new(e),
                            });
                        }
                    },
                }

                if !self.run {
                    break;
                }
            }

            if self.run {
                std::thread::sleep(self.poll_interval);
            }
        }
    }

    fn next_chunk_missing(&self, frame: usize) -> bool {
        let next_start = (frame / self.chunk_size + 1) * self.chunk_size;
        if next_start > self.stop_frame {
            return false;
        }
        let next_stop = (next_start + self.chunk_size - 1).min(self.stop_frame);

        !self.provider.is_next_chunk_exists(frame)
            && !self.provider.is_chunk_cached(next_start, next_stop)
    }

    fn send_msg(&mut self, msg: ServerToClientMsg) {
        // Do nothing if stream has been closed.
        if !self.run {
            return;
        }

        // Block until message can be sent.
        loop {
            if !self.to_client_tx.is_full() {
                break;
            }

            // Check for close signal to avoid waiting forever.
            if self.close_signal_rx.pop().is_ok() || self.to_client_tx.is_abandoned() {
                self.run = false;
                return;
            }

            std::thread::sleep(self.poll_interval);
        }

        // Push will never fail because we made sure a slot is available in the
        // previous step.
        let _ = self.to_client_tx.push(msg);
    }
}
