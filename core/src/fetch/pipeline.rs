use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, OptionFuture};
use rtrb::{Consumer, Producer};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::slots::{ChunkFetch, FetchSlots, Waiter};
use super::{ClientToServerMsg, PipelineConfig, ServerToClientMsg};
use crate::error::{FrameError, SharedError};
use crate::frame::ImageData;
use crate::proxy::ServerProxy;

/// A snapshot of the chunks a pipeline is working on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStatus {
    /// The chunk whose bytes are being fetched.
    pub active: Option<usize>,
    /// The chunk that will be fetched once the active fetch settles.
    pub queued: Option<usize>,
    /// Chunks whose bytes arrived and are being decoded.
    pub decoding: Vec<usize>,
}

pub(crate) enum PipelineMsg {
    RequestFrame(Waiter),
    CachedFrames(oneshot::Sender<Result<BTreeSet<usize>, FrameError>>),
    Status(oneshot::Sender<FetchStatus>),
    DropQueued,
    Close,
}

/// A handle to the fetch pipeline of one task.
///
/// The pipeline stops once it is closed or every client has been dropped.
#[derive(Clone)]
pub struct PipelineClient {
    tx: mpsc::UnboundedSender<PipelineMsg>,
}

impl PipelineClient {
    /// Request the decoded data of one frame.
    pub(crate) async fn request_frame(
        &self,
        frame: usize,
        decode_forward: bool,
    ) -> Result<ImageData, FrameError> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(PipelineMsg::RequestFrame(Waiter::new(
                frame,
                decode_forward,
                reply,
            )))
            .map_err(|_| FrameError::PipelineClosed)?;

        rx.await.unwrap_or(Err(FrameError::PipelineClosed))
    }

    /// Every frame the decode provider currently holds.
    pub async fn cached_frames(&self) -> Result<BTreeSet<usize>, FrameError> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(PipelineMsg::CachedFrames(reply))
            .map_err(|_| FrameError::PipelineClosed)?;

        rx.await.unwrap_or(Err(FrameError::PipelineClosed))
    }

    pub async fn status(&self) -> Result<FetchStatus, FrameError> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(PipelineMsg::Status(reply))
            .map_err(|_| FrameError::PipelineClosed)?;

        rx.await.map_err(|_| FrameError::PipelineClosed)
    }

    /// Drop the queued fetch, cancelling everyone waiting on it.
    pub(crate) fn drop_queued(&self) {
        let _ = self.tx.send(PipelineMsg::DropQueued);
    }

    /// Stop the pipeline, cancelling every pending request.
    pub(crate) fn close(&self) {
        let _ = self.tx.send(PipelineMsg::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A reply the decode server owes us. Replies arrive in request order.
enum Query {
    Frame(Waiter),
    CachedFrames(oneshot::Sender<Result<BTreeSet<usize>, FrameError>>),
}

/// Owns the active and queued chunk fetches of one task.
///
/// Every request from the clients and every reply from the decode server is
/// handled on this one task, so none of the state needs a lock.
pub(super) struct ChunkPipeline<S: ServerProxy> {
    from_client_rx: mpsc::UnboundedReceiver<PipelineMsg>,
    to_server_tx: Producer<ClientToServerMsg>,
    from_server_rx: Consumer<ServerToClientMsg>,
    close_signal_tx: Producer<()>,

    proxy: Arc<S>,
    task_id: u64,
    job_id: Option<u64>,
    chunk_size: usize,
    stop_frame: usize,
    read_ahead_offset: usize,

    slots: FetchSlots,
    /// The network request of the active fetch.
    in_flight: Option<BoxFuture<'static, Result<Bytes, SharedError>>>,
    /// Chunks handed to the decode server, with the frames parked on them.
    decoding: BTreeMap<usize, Vec<Waiter>>,
    queries: VecDeque<Query>,

    poll_interval: Duration,
}

impl<S: ServerProxy> ChunkPipeline<S> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn spawn(
        proxy: Arc<S>,
        chunk_size: usize,
        stop_frame: usize,
        config: PipelineConfig,
        to_server_tx: Producer<ClientToServerMsg>,
        from_server_rx: Consumer<ServerToClientMsg>,
        close_signal_tx: Producer<()>,
        poll_interval: Duration,
    ) -> PipelineClient {
        let (tx, from_client_rx) = mpsc::unbounded_channel();

        let pipeline = Self {
            from_client_rx,
            to_server_tx,
            from_server_rx,
            close_signal_tx,
            proxy,
            task_id: config.task_id,
            job_id: config.job_id,
            chunk_size,
            stop_frame,
            read_ahead_offset: config.read_ahead_offset,
            slots: FetchSlots::default(),
            in_flight: None,
            decoding: BTreeMap::new(),
            queries: VecDeque::new(),
            poll_interval,
        };

        tokio::spawn(pipeline.run());

        PipelineClient { tx }
    }

    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let awaiting_server = !self.queries.is_empty() || !self.decoding.is_empty();

            tokio::select! {
                msg = self.from_client_rx.recv() => match msg {
                    Some(PipelineMsg::Close) | None => break,
                    Some(msg) => self.handle_msg(msg),
                },
                Some(res) = OptionFuture::from(self.in_flight.as_mut()) => {
                    self.in_flight = None;
                    self.on_fetch_settled(res);
                }
                _ = poll.tick(), if awaiting_server => self.poll_server(),
            }
        }

        self.shutdown();
    }

    fn handle_msg(&mut self, msg: PipelineMsg) {
        match msg {
            PipelineMsg::RequestFrame(waiter) => {
                let check_next_chunk = waiter.decode_forward && self.past_read_ahead(waiter.frame);
                let msg = ClientToServerMsg::QueryFrame {
                    frame: waiter.frame,
                    check_next_chunk,
                };

                if self.push_to_server(msg) {
                    self.queries.push_back(Query::Frame(waiter));
                } else {
                    waiter.reject(FrameError::DecodeServerChannelFull);
                }
            }
            PipelineMsg::CachedFrames(reply) => {
                if self.push_to_server(ClientToServerMsg::QueryCachedFrames) {
                    self.queries.push_back(Query::CachedFrames(reply));
                } else {
                    let _ = reply.send(Err(FrameError::DecodeServerChannelFull));
                }
            }
            PipelineMsg::Status(reply) => {
                let _ = reply.send(self.status());
            }
            PipelineMsg::DropQueued => {
                if let Some(fetch) = self.slots.take_queued() {
                    log::debug!("dropping queued fetch of chunk {}", fetch.chunk_index);
                    fetch.reject(FrameError::Cancelled);
                }
            }
            PipelineMsg::Close => {}
        }
    }

    fn poll_server(&mut self) {
        while let Ok(msg) = self.from_server_rx.pop() {
            match msg {
                ServerToClientMsg::FrameRes {
                    frame,
                    image,
                    read_ahead,
                } => match self.queries.pop_front() {
                    Some(Query::Frame(mut waiter)) => {
                        debug_assert_eq!(waiter.frame, frame);
                        waiter.read_ahead = read_ahead;
                        self.on_frame_res(waiter, image);
                    }
                    other => self.on_unexpected_reply(other),
                },
                ServerToClientMsg::CachedFramesRes { frames } => match self.queries.pop_front()
                {
                    Some(Query::CachedFrames(reply)) => {
                        let _ = reply.send(Ok(frames));
                    }
                    other => self.on_unexpected_reply(other),
                },
                ServerToClientMsg::DecodeRes {
                    chunk_index,
                    frames,
                } => self.on_decoded(chunk_index, Ok(frames)),
                ServerToClientMsg::DecodeError { chunk_index, error } => {
                    self.on_decoded(chunk_index, Err(error))
                }
            }
        }
    }

    fn on_unexpected_reply(&mut self, query: Option<Query>) {
        log::error!("decode server reply does not match the pending query");

        match query {
            Some(Query::Frame(waiter)) => waiter.reject(FrameError::PipelineClosed),
            Some(Query::CachedFrames(reply)) => {
                let _ = reply.send(Err(FrameError::PipelineClosed));
            }
            None => {}
        }
    }

    fn on_frame_res(&mut self, waiter: Waiter, image: Option<ImageData>) {
        match image {
            Some(image) => {
                if waiter.read_ahead {
                    self.read_ahead(self.chunk_index(waiter.frame) + 1);
                }
                waiter.resolve(image);
            }
            None => self.enqueue_waiter(waiter),
        }
    }

    /// Park a waiter whose frame the provider does not have yet.
    fn enqueue_waiter(&mut self, waiter: Waiter) {
        if waiter.is_abandoned() {
            return;
        }

        let chunk_index = self.chunk_index(waiter.frame);

        // The bytes are already here and being decoded.
        if let Some(waiters) = self.decoding.get_mut(&chunk_index) {
            waiters.push(waiter);
            return;
        }

        if let Some(fetch) = self.slots.find_mut(chunk_index) {
            fetch.waiters.push(waiter);
            return;
        }

        let fetch = ChunkFetch::with_waiter(chunk_index, waiter);
        if self.slots.active().is_none() {
            self.start_fetch(fetch);
        } else if let Some(evicted) = self.slots.enqueue(fetch) {
            log::debug!(
                "queued fetch of chunk {} superseded by chunk {}",
                evicted.chunk_index,
                chunk_index
            );
            evicted.reject(FrameError::Cancelled);
        }
    }

    fn read_ahead(&mut self, chunk_index: usize) {
        if self.slots.contains(chunk_index) || self.decoding.contains_key(&chunk_index) {
            return;
        }

        // A read ahead never pushes out a fetch somebody is waiting for.
        if self.slots.active().is_none() {
            log::debug!("reading ahead chunk {}", chunk_index);
            self.start_fetch(ChunkFetch::new(chunk_index));
        } else if self.slots.queued().is_none() {
            log::debug!("queueing read ahead of chunk {}", chunk_index);
            self.slots.enqueue(ChunkFetch::new(chunk_index));
        }
    }

    fn start_fetch(&mut self, fetch: ChunkFetch) {
        self.slots.activate(fetch);
        self.request_active();
    }

    /// Issue the network request of the active fetch.
    fn request_active(&mut self) {
        let Some(chunk_index) = self.slots.active().map(|fetch| fetch.chunk_index) else {
            return;
        };

        if !self.push_to_server(ClientToServerMsg::ReadyToLoading { chunk_index }) {
            log::warn!(
                "could not tell the decode provider that chunk {} is loading",
                chunk_index
            );
        }

        let proxy = Arc::clone(&self.proxy);
        let task_id = self.task_id;
        let job_id = self.job_id;

        self.in_flight = Some(Box::pin(async move {
            proxy
                .get_chunk(task_id, job_id, chunk_index)
                .await
                .map_err(|e| Arc::new(e) as SharedError)
        }));
    }

    fn on_fetch_settled(&mut self, res: Result<Bytes, SharedError>) {
        // A queued fetch somebody waits for supersedes whoever still waits on
        // the settled one. A waiter-less read ahead supersedes nobody.
        let superseded = self
            .slots
            .queued()
            .is_some_and(|queued| !queued.waiters.is_empty());

        let Some(mut fetch) = self.slots.finish_active() else {
            return;
        };
        let chunk_index = fetch.chunk_index;

        match res {
            Ok(bytes) => {
                if superseded && !fetch.waiters.is_empty() {
                    log::debug!(
                        "waiters of chunk {} superseded by the queued fetch",
                        chunk_index
                    );
                    for waiter in fetch.waiters.drain(..) {
                        waiter.reject(FrameError::Cancelled);
                    }
                }

                // The bytes are decoded either way so the provider holds them.
                let (start_frame, stop_frame) = self.chunk_bounds(chunk_index);
                let msg = ClientToServerMsg::DecodeBlock {
                    chunk_index,
                    bytes,
                    start_frame,
                    stop_frame,
                };

                if self.push_to_server(msg) {
                    self.decoding
                        .entry(chunk_index)
                        .or_default()
                        .extend(fetch.waiters);
                } else {
                    self.loading_failed(chunk_index);
                    fetch.reject(FrameError::DecodeServerChannelFull);
                }
            }
            Err(source) => {
                log::warn!("failed to fetch chunk {}: {}", chunk_index, source);
                self.loading_failed(chunk_index);
                fetch.reject(FrameError::Fetch {
                    chunk_index,
                    source,
                });
            }
        }

        // The queued fetch, if any, is active now.
        self.request_active();
    }

    /// Tell the provider the bytes of a chunk are not coming after all.
    fn loading_failed(&mut self, chunk_index: usize) {
        if !self.push_to_server(ClientToServerMsg::LoadingFailed { chunk_index }) {
            log::warn!(
                "could not tell the decode provider that loading chunk {} failed",
                chunk_index
            );
        }
    }

    fn on_decoded(
        &mut self,
        chunk_index: usize,
        res: Result<Vec<(usize, ImageData)>, SharedError>,
    ) {
        let waiters = self.decoding.remove(&chunk_index).unwrap_or_default();

        match res {
            Ok(frames) => {
                let frames: BTreeMap<usize, ImageData> = frames.into_iter().collect();
                let mut read_ahead = false;

                for waiter in waiters {
                    match frames.get(&waiter.frame) {
                        Some(image) => {
                            read_ahead |= waiter.read_ahead;
                            waiter.resolve(image.clone());
                        }
                        None => {
                            let frame = waiter.frame;
                            waiter.reject(FrameError::MissingDecodedFrame { frame, chunk_index });
                        }
                    }
                }

                if read_ahead {
                    self.read_ahead(chunk_index + 1);
                }
            }
            Err(source) => {
                for waiter in waiters {
                    waiter.reject(FrameError::Decode {
                        chunk_index,
                        source: Arc::clone(&source),
                    });
                }
            }
        }
    }

    fn push_to_server(&mut self, msg: ClientToServerMsg) -> bool {
        match self.to_server_tx.push(msg) {
            Ok(()) => true,
            Err(_) => {
                log::warn!("the message channel to the decode server is full");
                false
            }
        }
    }

    fn status(&self) -> FetchStatus {
        FetchStatus {
            active: self.slots.active().map(|fetch| fetch.chunk_index),
            queued: self.slots.queued().map(|fetch| fetch.chunk_index),
            decoding: self.decoding.keys().copied().collect(),
        }
    }

    fn chunk_index(&self, frame: usize) -> usize {
        frame / self.chunk_size
    }

    fn chunk_bounds(&self, chunk_index: usize) -> (usize, usize) {
        let start = chunk_index * self.chunk_size;
        let stop = (start + self.chunk_size - 1).min(self.stop_frame);
        (start, stop)
    }

    fn past_read_ahead(&self, frame: usize) -> bool {
        let next_start = (self.chunk_index(frame) + 1) * self.chunk_size;
        frame % self.chunk_size > self.read_ahead_offset && next_start <= self.stop_frame
    }

    fn shutdown(mut self) {
        self.from_client_rx.close();
        while let Ok(msg) = self.from_client_rx.try_recv() {
            match msg {
                PipelineMsg::RequestFrame(waiter) => waiter.reject(FrameError::Cancelled),
                PipelineMsg::CachedFrames(reply) => {
                    let _ = reply.send(Err(FrameError::Cancelled));
                }
                _ => {}
            }
        }

        for fetch in self.slots.drain() {
            fetch.reject(FrameError::Cancelled);
        }
        for (_, waiters) in std::mem::take(&mut self.decoding) {
            for waiter in waiters {
                waiter.reject(FrameError::Cancelled);
            }
        }
        for query in self.queries.drain(..) {
            match query {
                Query::Frame(waiter) => waiter.reject(FrameError::Cancelled),
                Query::CachedFrames(reply) => {
                    let _ = reply.send(Err(FrameError::Cancelled));
                }
            }
        }

        // Tell the decode server to stop.
        // This cannot fail because this is the only place the signal is ever sent.
        let _ = self.close_signal_tx.push(());
    }
}
