//! Chunked frame streaming and lookahead caching.
//!
//! Frames are fetched from a [`ServerProxy`] one chunk at a time, decoded by a
//! [`DecodeProvider`] on a dedicated thread, and kept ahead of the playhead in
//! a bounded [`LookaheadBuffer`]. Most users only need a
//! [`FrameCacheRegistry`].

pub use framestream_core::*;

#[cfg(feature = "decode-raw")]
pub use framestream_decode_raw::{encode_chunk, DecodeError, OpenError, RawDecoder};
