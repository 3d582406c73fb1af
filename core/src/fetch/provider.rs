use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use bytes::Bytes;

use crate::frame::ImageData;
use crate::meta::{ChunkKind, Dimension};

/// Everything a [`DecodeProvider`] needs to know when it is opened.
#[derive(Debug, Clone)]
pub struct ProviderOpts<AdditionalOpts> {
    pub chunk_size: usize,
    pub chunk_kind: ChunkKind,
    pub dimension: Dimension,
    pub start_frame: usize,
    pub stop_frame: usize,
    /// How many decoded chunks the provider may keep in memory.
    pub blocks_cache_size: usize,

    pub additional_opts: AdditionalOpts,
}

/// Turns the raw bytes of a chunk into decoded frames.
///
/// A provider is opened and then exclusively owned by the decode server
/// thread of its task, so it only has to be `Send` through its options.
/// [`DecodeProvider::decode_block`] is allowed to block for as long as
/// decoding takes.
pub trait DecodeProvider: Sized + 'static {
    type AdditionalOpts: Send + Default + Debug + Clone;
    type OpenError: Error + Send + Sync + 'static;
    type FatalError: Error + Send + Sync + 'static;

    /// How often the decode server checks for new work when idle.
    const DEFAULT_POLL_INTERVAL: Duration;

    fn new(opts: ProviderOpts<Self::AdditionalOpts>) -> Result<Self, Self::OpenError>;

    /// Return the decoded frame if it is in the provider's cache.
    fn frame(&mut self, frame: usize) -> Option<ImageData>;

    /// Returns true if every frame in `[start, stop]` is decoded and cached.
    fn is_chunk_cached(&self, start: usize, stop: usize) -> bool;

    /// Decode every frame of the chunk spanning `[start, stop]`.
    ///
    /// After this returns `Ok`, [`DecodeProvider::frame`] must return the
    /// decoded frames of the chunk (until they are evicted).
    fn decode_block(&mut self, bytes: Bytes, start: usize, stop: usize)
        -> Result<(), Self::FatalError>;

    /// Returns true if the chunk following the one holding `frame` is already
    /// decoded or being loaded.
    fn is_next_chunk_exists(&self, frame: usize) -> bool;

    /// Tell the provider that the bytes of a chunk are on their way.
    fn set_ready_to_loading(&mut self, chunk_index: usize);

    /// The bytes announced by [`DecodeProvider::set_ready_to_loading`] will
    /// not arrive. The chunk must no longer count as being loaded.
    fn set_loading_failed(&mut self, chunk_index: usize);

    /// Every frame currently held decoded by the provider.
    fn cached_frames(&self) -> BTreeSet<usize>;
}
