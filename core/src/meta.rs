use std::collections::BTreeSet;

use crate::error::DataError;

/// Size info about a single frame, as declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    /// The number of related context images attached to this frame.
    #[cfg_attr(feature = "serde", serde(default))]
    pub related_files: usize,
}

impl FrameMeta {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            related_files: 0,
        }
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Per-task metadata, fetched once from the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskMeta {
    /// Frame sizes. Interpolation tasks only carry one entry.
    pub frames: Vec<FrameMeta>,
    /// The total number of frames in the task.
    pub size: usize,
    #[cfg_attr(feature = "serde", serde(default))]
    pub deleted_frames: BTreeSet<usize>,
}

impl TaskMeta {
    /// The number of decoded chunks the provider may keep around for this task.
    ///
    /// The memory budget is divided by an estimate of the size of one decoded
    /// RGBA frame (mean plus one standard deviation of the pixel count) and then
    /// by the number of frames in a chunk. The result is never less than one.
    pub fn decoded_blocks_cache_size(&self, memory_budget: u64, chunk_size: usize) -> usize {
        if self.frames.is_empty() || chunk_size == 0 {
            return 1;
        }

        let len = self.frames.len() as f64;
        let mean = self.frames.iter().map(|f| f.pixels() as f64).sum::<f64>() / len;
        let variance = self
            .frames
            .iter()
            .map(|f| (f.pixels() as f64 - mean).powi(2))
            .sum::<f64>()
            / len;
        let bytes_per_frame = mean + variance.sqrt();

        if bytes_per_frame <= 0.0 {
            return 1;
        }

        let size = (memory_budget as f64 / bytes_per_frame / 4.0 / chunk_size as f64).floor();
        (size as usize).max(1)
    }
}

/// How the frames of a task are annotated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMode {
    /// Every frame has the same size, so only one [`FrameMeta`] is stored.
    Interpolation,
    /// Each frame carries its own [`FrameMeta`].
    Annotation,
    /// A mode this crate does not know about. Requesting frame meta fails.
    Other(String),
}

impl From<&str> for TaskMode {
    fn from(mode: &str) -> Self {
        match mode {
            "interpolation" => TaskMode::Interpolation,
            "annotation" => TaskMode::Annotation,
            other => TaskMode::Other(other.to_string()),
        }
    }
}

/// The kind of data stored in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkKind {
    #[default]
    Video,
    Imageset,
}

/// The dimension of the task data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dimension {
    #[default]
    D2,
    D3,
}

/// Caller-side description of a task, passed alongside every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskParams {
    pub job_id: Option<u64>,
    /// The number of frames in one chunk. Must not be zero.
    pub chunk_size: usize,
    pub chunk_kind: ChunkKind,
    pub mode: TaskMode,
    pub start_frame: usize,
    /// The last frame of the task (inclusive).
    pub stop_frame: usize,
    pub dimension: Dimension,
}

impl TaskParams {
    pub fn chunk_index(&self, frame: usize) -> usize {
        frame / self.chunk_size
    }

    /// Look up the size of a frame.
    pub fn frame_meta(&self, meta: &TaskMeta, frame: usize) -> Result<FrameMeta, DataError> {
        match &self.mode {
            TaskMode::Interpolation => meta.frames.first().copied().ok_or(DataError::EmptyTask),
            TaskMode::Annotation => {
                if frame >= meta.size {
                    return Err(DataError::FrameBeyondTaskSize {
                        frame,
                        size: meta.size,
                    });
                }

                frame
                    .checked_sub(self.start_frame)
                    .and_then(|i| meta.frames.get(i))
                    .copied()
                    .ok_or(DataError::MissingFrameMeta { frame })
            }
            TaskMode::Other(mode) => Err(DataError::UnknownMode(mode.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(mode: TaskMode) -> TaskParams {
        TaskParams {
            job_id: None,
            chunk_size: 36,
            chunk_kind: ChunkKind::Video,
            mode,
            start_frame: 0,
            stop_frame: 99,
            dimension: Dimension::D2,
        }
    }

    #[test]
    fn blocks_cache_size_uses_mean_and_deviation() {
        let meta = TaskMeta {
            frames: vec![FrameMeta::new(1920, 1080)],
            size: 100,
            deleted_frames: BTreeSet::new(),
        };
        // 2^31 / 2073600 / 4 / 36 = 7.19...
        assert_eq!(meta.decoded_blocks_cache_size(2_147_483_648, 36), 7);

        let meta = TaskMeta {
            frames: vec![FrameMeta::new(100, 100), FrameMeta::new(300, 100)],
            size: 2,
            deleted_frames: BTreeSet::new(),
        };
        // mean = 20000, deviation = 10000
        assert_eq!(meta.decoded_blocks_cache_size(30_000 * 4 * 10, 1), 10);
    }

    #[test]
    fn blocks_cache_size_is_at_least_one() {
        let meta = TaskMeta {
            frames: vec![FrameMeta::new(8000, 8000)],
            size: 1,
            deleted_frames: BTreeSet::new(),
        };
        assert_eq!(meta.decoded_blocks_cache_size(2_147_483_648, 360), 1);
        assert_eq!(TaskMeta::default().decoded_blocks_cache_size(1024, 36), 1);
    }

    #[test]
    fn frame_meta_by_mode() {
        let meta = TaskMeta {
            frames: vec![FrameMeta::new(10, 20), FrameMeta::new(30, 40)],
            size: 2,
            deleted_frames: BTreeSet::new(),
        };

        let interpolation = params(TaskMode::Interpolation);
        assert_eq!(
            interpolation.frame_meta(&meta, 57).unwrap(),
            FrameMeta::new(10, 20)
        );

        let annotation = params(TaskMode::Annotation);
        assert_eq!(annotation.frame_meta(&meta, 1).unwrap(), FrameMeta::new(30, 40));
        assert_eq!(
            annotation.frame_meta(&meta, 2),
            Err(DataError::FrameBeyondTaskSize { frame: 2, size: 2 })
        );

        let unknown = params(TaskMode::from("tracking"));
        assert_eq!(
            unknown.frame_meta(&meta, 0),
            Err(DataError::UnknownMode("tracking".into()))
        );
    }
}
