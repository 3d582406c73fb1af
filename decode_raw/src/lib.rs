#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(trivial_numeric_casts)]
#![forbid(unsafe_code)]

//! A [`DecodeProvider`] for chunks of uncompressed RGBA frames.
//!
//! A chunk is the frames of its range back to back. Each frame is a
//! little-endian `u32` width, a little-endian `u32` height, then
//! `width * height * 4` bytes of RGBA pixels.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lru::LruCache;

use framestream_core::{DecodeProvider, Dimension, ImageData, ProviderOpts};

mod error;
pub use error::{DecodeError, OpenError};

const FRAME_HEADER_LEN: usize = 8;

struct DecodedChunk {
    start_frame: usize,
    frames: Vec<ImageData>,
}

impl DecodedChunk {
    fn contains(&self, frame: usize) -> bool {
        frame >= self.start_frame && frame - self.start_frame < self.frames.len()
    }
}

pub struct RawDecoder {
    chunks: LruCache<usize, DecodedChunk>,
    loading: BTreeSet<usize>,

    chunk_size: usize,
}

impl RawDecoder {
    fn chunk_index(&self, frame: usize) -> usize {
        frame / self.chunk_size
    }
}

impl DecodeProvider for RawDecoder {
    type AdditionalOpts = ();
    type OpenError = OpenError;
    type FatalError = DecodeError;

    const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    fn new(opts: ProviderOpts<Self::AdditionalOpts>) -> Result<Self, Self::OpenError> {
        if opts.dimension != Dimension::D2 {
            return Err(OpenError::UnsupportedDimension(opts.dimension));
        }
        if opts.start_frame > opts.stop_frame {
            return Err(OpenError::EmptyRange {
                start_frame: opts.start_frame,
                stop_frame: opts.stop_frame,
            });
        }

        let cap = NonZeroUsize::new(opts.blocks_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            chunks: LruCache::new(cap),
            loading: BTreeSet::new(),
            chunk_size: opts.chunk_size,
        })
    }

    fn frame(&mut self, frame: usize) -> Option<ImageData> {
        let chunk_index = self.chunk_index(frame);
        let chunk = self.chunks.get(&chunk_index)?;

        frame
            .checked_sub(chunk.start_frame)
            .and_then(|i| chunk.frames.get(i))
            .cloned()
    }

    fn is_chunk_cached(&self, start: usize, stop: usize) -> bool {
        match self.chunks.peek(&self.chunk_index(start)) {
            Some(chunk) => chunk.contains(start) && chunk.contains(stop),
            None => false,
        }
    }

    fn decode_block(
        &mut self,
        bytes: Bytes,
        start: usize,
        stop: usize,
    ) -> Result<(), Self::FatalError> {
        let chunk_index = self.chunk_index(start);
        self.loading.remove(&chunk_index);

        let frames = decode_frames(bytes, start, stop)?;

        if let Some((evicted, _)) = self.chunks.push(
            chunk_index,
            DecodedChunk {
                start_frame: start,
                frames,
            },
        ) {
            if evicted != chunk_index {
                log::debug!("evicted decoded chunk {}", evicted);
            }
        }

        Ok(())
    }

    fn is_next_chunk_exists(&self, frame: usize) -> bool {
        let next = self.chunk_index(frame) + 1;
        self.loading.contains(&next) || self.chunks.contains(&next)
    }

    fn set_ready_to_loading(&mut self, chunk_index: usize) {
        self.loading.insert(chunk_index);
    }

    fn set_loading_failed(&mut self, chunk_index: usize) {
        self.loading.remove(&chunk_index);
    }

    fn cached_frames(&self) -> BTreeSet<usize> {
        self.chunks
            .iter()
            .flat_map(|(_, chunk)| chunk.start_frame..chunk.start_frame + chunk.frames.len())
            .collect()
    }
}

fn decode_frames(
    mut bytes: Bytes,
    start: usize,
    stop: usize,
) -> Result<Vec<ImageData>, DecodeError> {
    let expected = stop + 1 - start;
    let mut frames = Vec::with_capacity(expected);

    for frame in start..=stop {
        if !bytes.has_remaining() {
            return Err(DecodeError::MissingFrames {
                expected,
                found: frames.len(),
            });
        }
        if bytes.remaining() < FRAME_HEADER_LEN {
            return Err(DecodeError::Truncated {
                frame,
                needed: FRAME_HEADER_LEN,
                available: bytes.remaining(),
            });
        }

        let width = bytes.get_u32_le();
        let height = bytes.get_u32_le();
        if width == 0 || height == 0 {
            return Err(DecodeError::EmptyFrame { frame });
        }

        let len = usize::try_from(u64::from(width) * u64::from(height) * 4).unwrap_or(usize::MAX);
        if bytes.remaining() < len {
            return Err(DecodeError::Truncated {
                frame,
                needed: len,
                available: bytes.remaining(),
            });
        }

        frames.push(ImageData::new(width, height, bytes.split_to(len)));
    }

    if bytes.has_remaining() {
        return Err(DecodeError::TrailingBytes {
            len: bytes.remaining(),
        });
    }

    Ok(frames)
}

/// Pack frames into a raw chunk.
pub fn encode_chunk<'a, I: IntoIterator<Item = &'a ImageData>>(frames: I) -> Bytes {
    let mut buf = BytesMut::new();

    for image in frames {
        buf.put_u32_le(image.width);
        buf.put_u32_le(image.height);
        buf.put_slice(&image.pixels);
    }

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use framestream_core::ChunkKind;

    fn opts(blocks_cache_size: usize) -> ProviderOpts<()> {
        ProviderOpts {
            chunk_size: 4,
            chunk_kind: ChunkKind::Imageset,
            dimension: Dimension::D2,
            start_frame: 0,
            stop_frame: 9,
            blocks_cache_size,
            additional_opts: (),
        }
    }

    fn solid(width: u32, height: u32, value: u8) -> ImageData {
        let len = (width * height * 4) as usize;
        ImageData::new(width, height, Bytes::from(vec![value; len]))
    }

    fn chunk(start: usize, stop: usize) -> Bytes {
        let frames: Vec<ImageData> = (start..=stop).map(|f| solid(2, 3, f as u8)).collect();
        encode_chunk(&frames)
    }

    #[test]
    fn decodes_every_frame_of_a_chunk() {
        let mut decoder = RawDecoder::new(opts(4)).unwrap();
        decoder.set_ready_to_loading(1);
        assert!(decoder.is_next_chunk_exists(0));

        decoder.decode_block(chunk(4, 7), 4, 7).unwrap();

        for frame in 4..=7 {
            assert_eq!(decoder.frame(frame), Some(solid(2, 3, frame as u8)));
        }
        assert_eq!(decoder.frame(3), None);
        assert!(decoder.is_chunk_cached(4, 7));
        assert!(!decoder.is_chunk_cached(0, 3));
        assert_eq!(decoder.cached_frames(), (4..=7).collect());
        // Still reported, now because it is decoded.
        assert!(decoder.is_next_chunk_exists(3));
        assert!(!decoder.is_next_chunk_exists(4));
    }

    #[test]
    fn failed_loads_are_forgotten() {
        let mut decoder = RawDecoder::new(opts(4)).unwrap();

        decoder.set_ready_to_loading(1);
        assert!(decoder.is_next_chunk_exists(2));

        decoder.set_loading_failed(1);
        assert!(!decoder.is_next_chunk_exists(2));
    }

    #[test]
    fn last_chunk_may_be_short() {
        let mut decoder = RawDecoder::new(opts(4)).unwrap();

        decoder.decode_block(chunk(8, 9), 8, 9).unwrap();

        assert!(decoder.is_chunk_cached(8, 9));
        assert_eq!(decoder.frame(9), Some(solid(2, 3, 9)));
    }

    #[test]
    fn evicts_least_recently_used_chunks() {
        let mut decoder = RawDecoder::new(opts(2)).unwrap();

        decoder.decode_block(chunk(0, 3), 0, 3).unwrap();
        decoder.decode_block(chunk(4, 7), 4, 7).unwrap();
        // Touch chunk 0 so chunk 1 is the oldest.
        assert!(decoder.frame(1).is_some());
        decoder.decode_block(chunk(8, 9), 8, 9).unwrap();

        assert!(decoder.is_chunk_cached(0, 3));
        assert!(!decoder.is_chunk_cached(4, 7));
        assert!(decoder.is_chunk_cached(8, 9));
        assert_eq!(decoder.frame(5), None);
    }

    #[test]
    fn rejects_malformed_chunks() {
        let mut decoder = RawDecoder::new(opts(2)).unwrap();

        assert_eq!(
            decoder.decode_block(chunk(0, 2), 0, 3),
            Err(DecodeError::MissingFrames {
                expected: 4,
                found: 3
            })
        );

        let full = chunk(0, 3);
        assert_eq!(
            decoder.decode_block(full.slice(..full.len() - 1), 0, 3),
            Err(DecodeError::Truncated {
                frame: 3,
                needed: 24,
                available: 23
            })
        );

        assert_eq!(
            decoder.decode_block(chunk(0, 4), 0, 3),
            Err(DecodeError::TrailingBytes { len: 32 })
        );

        let empty = encode_chunk(&[ImageData::new(0, 5, Bytes::new())]);
        assert_eq!(
            decoder.decode_block(empty, 9, 9),
            Err(DecodeError::EmptyFrame { frame: 9 })
        );

        assert!(decoder.cached_frames().is_empty());
    }

    #[test]
    fn open_checks_the_task() {
        let mut point_cloud = opts(1);
        point_cloud.dimension = Dimension::D3;
        assert!(matches!(
            RawDecoder::new(point_cloud),
            Err(OpenError::UnsupportedDimension(Dimension::D3))
        ));

        let mut empty = opts(1);
        empty.start_frame = 10;
        assert!(matches!(
            RawDecoder::new(empty),
            Err(OpenError::EmptyRange { .. })
        ));
    }
}
