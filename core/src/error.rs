use std::error::Error;
use std::sync::Arc;

/// A type-erased error from one of the external collaborators.
///
/// It is reference counted so that a single failed chunk fetch can be
/// reported to every frame that was waiting on it.
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// The task metadata does not agree with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The task mode is neither "interpolation" nor "annotation".
    UnknownMode(String),
    /// The frame lies beyond the size the server declared for the task.
    FrameBeyondTaskSize { frame: usize, size: usize },
    /// The server metadata has no entry for the frame.
    MissingFrameMeta { frame: usize },
    /// The server returned metadata without a single frame.
    EmptyTask,
}

impl std::error::Error for DataError {}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataError::UnknownMode(mode) => write!(f, "Invalid task mode \"{}\"", mode),
            DataError::FrameBeyondTaskSize { frame, size } => write!(
                f,
                "Frame {} is out of the task, which declares {} frames",
                frame, size
            ),
            DataError::MissingFrameMeta { frame } => {
                write!(f, "No frame meta was received for frame {}", frame)
            }
            DataError::EmptyTask => write!(f, "The task meta does not contain any frames"),
        }
    }
}

/// An error while requesting or decoding a frame.
#[derive(Debug, Clone)]
pub enum FrameError {
    /// The requested frame lies outside of `[start, stop]`.
    FrameOutOfRange {
        frame: usize,
        start: usize,
        stop: usize,
    },
    /// A search filter was malformed (for example an offset of zero).
    InvalidFilter(&'static str),
    /// The task parameters cannot describe a task (for example a chunk size
    /// of zero).
    InvalidParams(&'static str),
    /// The task metadata is inconsistent with the request.
    Data(DataError),
    /// Fetching the task metadata from the server failed.
    Meta(SharedError),
    /// A context image or preview request to the server failed.
    Server(SharedError),
    /// Fetching the raw bytes of a chunk from the server failed.
    Fetch {
        chunk_index: usize,
        source: SharedError,
    },
    /// The decode provider failed to decode a chunk.
    Decode {
        chunk_index: usize,
        source: SharedError,
    },
    /// The provider finished decoding a chunk but did not produce this frame.
    MissingDecodedFrame { frame: usize, chunk_index: usize },
    /// The decode provider could not be opened.
    ProviderOpen(SharedError),
    /// The request was superseded by a newer one or by clearing the cache.
    ///
    /// This is not a failure. The same frame can be requested again.
    Cancelled,
    /// The fetch pipeline of this task has been closed.
    PipelineClosed,
    /// The message channel to the decode server was full.
    ///
    /// In theory this should not happen, but if it does, the frame can be
    /// requested again later.
    DecodeServerChannelFull,
}

impl FrameError {
    /// Returns true if this request was superseded rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FrameError::Cancelled)
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FrameError::Data(e) => Some(e),
            FrameError::Meta(e) | FrameError::Server(e) | FrameError::ProviderOpen(e) => {
                Some(e.as_ref())
            }
            FrameError::Fetch { source, .. } | FrameError::Decode { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::FrameOutOfRange { frame, start, stop } => write!(
                f,
                "The frame {} is out of the allowed range [{}, {}]",
                frame, start, stop
            ),
            FrameError::InvalidFilter(reason) => write!(f, "Invalid frame filter: {}", reason),
            FrameError::InvalidParams(reason) => write!(f, "Invalid task parameters: {}", reason),
            FrameError::Data(e) => write!(f, "Data error: {}", e),
            FrameError::Meta(e) => write!(f, "Failed to fetch the task meta: {}", e),
            FrameError::Server(e) => write!(f, "Server request failed: {}", e),
            FrameError::Fetch {
                chunk_index,
                source,
            } => write!(f, "Failed to fetch chunk {}: {}", chunk_index, source),
            FrameError::Decode {
                chunk_index,
                source,
            } => write!(f, "Failed to decode chunk {}: {}", chunk_index, source),
            FrameError::MissingDecodedFrame { frame, chunk_index } => write!(
                f,
                "Frame {} was not produced when decoding chunk {}",
                frame, chunk_index
            ),
            FrameError::ProviderOpen(e) => write!(f, "Failed to open the decode provider: {}", e),
            FrameError::Cancelled => write!(f, "The request was superseded"),
            FrameError::PipelineClosed => write!(f, "The fetch pipeline is closed"),
            FrameError::DecodeServerChannelFull => {
                write!(f, "The message channel to the decode server is full.")
            }
        }
    }
}

impl From<DataError> for FrameError {
    fn from(e: DataError) -> Self {
        FrameError::Data(e)
    }
}
