mod buffer;
mod cache;
mod error;
mod fetch;
mod frame;
mod meta;
mod proxy;
mod registry;

pub use buffer::LookaheadBuffer;
pub use cache::{spans, CacheOptions, FrameFilter, Ranges, TaskFrameCache};
pub use error::{DataError, FrameError, SharedError};
pub use fetch::{DecodeProvider, FetchStatus, PipelineClient, ProviderOpts};
pub use frame::{FrameHandle, ImageData};
pub use meta::{ChunkKind, Dimension, FrameMeta, TaskMeta, TaskMode, TaskParams};
pub use proxy::ServerProxy;
pub use registry::FrameCacheRegistry;

#[cfg(test)]
mod test_util;
