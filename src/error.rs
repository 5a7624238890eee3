use crate::frame::FrameSize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("video has no frames: {0:?}")]
    EmptyVideo(PathBuf),

    #[error("unsupported video format: {0:?}")]
    UnsupportedFormat(PathBuf),

    #[error("input file does not exist: {0:?}")]
    MissingInput(PathBuf),

    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("invalid reference identifier: {0:?}")]
    InvalidReferenceId(String),

    #[error("failed to list references in {1:?}")]
    ListReferences(#[source] std::io::Error, PathBuf),

    #[error("failed to open video: {1:?}")]
    OpenVideo(#[source] std::io::Error, PathBuf),

    #[error("failed to decode gif: {1:?}")]
    DecodeGif(#[source] image::ImageError, PathBuf),

    #[error("failed to encode gif frame: {1:?}")]
    EncodeGif(#[source] image::ImageError, PathBuf),

    #[error("failed to create output file: {1:?}")]
    CreateOutput(#[source] std::io::Error, PathBuf),

    #[error("failed to finish output file: {1:?}")]
    FinishOutput(#[source] std::io::Error, PathBuf),

    #[error("failed to create output directory: {1:?}")]
    CreateOutputDir(#[source] std::io::Error, PathBuf),

    #[error("reference video yielded no frame after rewinding: {0:?}")]
    ReferenceExhausted(PathBuf),

    #[error("failed to decode frame bytes")]
    DecodeFrame(#[source] image::ImageError),

    #[error("failed to build frame from pixel buffer")]
    FrameShape(#[source] ndarray::ShapeError),

    #[error("failed to convert frame of size {0} to an image buffer")]
    ConvertFrameToImage(FrameSize),

    #[error("frame size {got} does not match sink size {expected}")]
    FrameSizeMismatch { expected: FrameSize, got: FrameSize },

    #[error("failed to construct NotNan from f32: {1}")]
    ConstructNotNan(#[source] ordered_float::FloatIsNan, f32),

    #[error("keypoint coordinate must be finite, got {0}")]
    InfiniteCoordinate(f32),

    #[error("failed to convert usize value to landmark: {0}")]
    ConvertUSizeToLandmark(usize),

    #[error("threshold must be finite and non-negative, got {0}")]
    InvalidThreshold(f32),

    #[error("keypoint count must be positive")]
    InvalidKeypointCount,

    #[error("limb ({0}, {1}) references a keypoint outside 0..{2}")]
    TopologyIndexOutOfRange(usize, usize, usize),

    #[error("failed to read config file: {1:?}")]
    ReadConfig(#[source] std::io::Error, PathBuf),

    #[error("failed to parse config file: {1:?}")]
    ParseConfig(#[source] serde_json::Error, PathBuf),

    #[error("failed to spawn bridge process: {1}")]
    SpawnBridge(#[source] std::io::Error, String),

    #[error("cannot spawn bridge from an empty command")]
    EmptyBridgeCommand,

    #[error("failed to talk to bridge process")]
    BridgeIo(#[source] std::io::Error),

    #[error("bridge process returned malformed json")]
    BridgeProtocol(#[source] serde_json::Error),

    #[error("bridge process closed its output")]
    BridgeClosed,

    #[error("bridge returned a keypoint with {0} coordinates")]
    KeypointArity(usize),

    #[error("no pose detected in video: {0:?}")]
    NoPoseDetected(PathBuf),

    #[error("lifting produced {got} poses from {expected} inputs")]
    LiftedPoseCount { expected: usize, got: usize },

    #[error("failed to write keypoints: {1:?}")]
    WriteKeypoints(#[source] std::io::Error, PathBuf),

    #[error("failed to serialize keypoints: {1:?}")]
    SerializeKeypoints(#[source] serde_json::Error, PathBuf),

    #[error("failed to spawn worker thread")]
    SpawnWorker(#[source] std::io::Error),

    #[error("job cancelled")]
    Cancelled,

    #[error("no session active")]
    NoActiveSession,

    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    #[error("live transport failed")]
    TransportIo(#[source] std::io::Error),

    #[error("failed to serialize reply")]
    SerializeReply(#[source] serde_json::Error),

    #[cfg(feature = "opencv")]
    #[error("opencv call failed: {1}")]
    OpenCv(#[source] opencv::Error, &'static str),

    #[cfg(feature = "opencv")]
    #[error("opencv could not open video: {0:?}")]
    OpenCvNotOpened(PathBuf),
}

impl Error {
    /// Errors caused by what the caller handed in, reported before any job
    /// starts.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyVideo(_)
                | Self::UnsupportedFormat(_)
                | Self::MissingInput(_)
                | Self::ReferenceNotFound(_)
                | Self::InvalidReferenceId(_)
                | Self::OpenVideo(..)
                | Self::DecodeGif(..)
        )
    }
}
