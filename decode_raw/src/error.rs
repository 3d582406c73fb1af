use framestream_core::Dimension;

/// An error while opening the raw decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// Raw chunks only carry 2D images.
    UnsupportedDimension(Dimension),
    /// The task has no frames.
    EmptyRange { start_frame: usize, stop_frame: usize },
}

impl std::error::Error for OpenError {}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::UnsupportedDimension(d) => {
                write!(f, "Raw chunks cannot hold {:?} data", d)
            }
            OpenError::EmptyRange {
                start_frame,
                stop_frame,
            } => write!(
                f,
                "The frame range [{}, {}] is empty",
                start_frame, stop_frame
            ),
        }
    }
}

/// An error while decoding a raw chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The chunk ended in the middle of a frame.
    Truncated {
        frame: usize,
        needed: usize,
        available: usize,
    },
    /// A frame header declares a width or height of zero.
    EmptyFrame { frame: usize },
    /// The chunk holds fewer frames than its range.
    MissingFrames { expected: usize, found: usize },
    /// There are bytes left after the last frame of the chunk.
    TrailingBytes { len: usize },
}

impl std::error::Error for DecodeError {}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated {
                frame,
                needed,
                available,
            } => write!(
                f,
                "Frame {} needs {} bytes but only {} are left in the chunk",
                frame, needed, available
            ),
            DecodeError::EmptyFrame { frame } => write!(f, "Frame {} has no pixels", frame),
            DecodeError::MissingFrames { expected, found } => write!(
                f,
                "Expected {} frames in the chunk, found {}",
                expected, found
            ),
            DecodeError::TrailingBytes { len } => {
                write!(f, "{} bytes left after the last frame of the chunk", len)
            }
        }
    }
}
