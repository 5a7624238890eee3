//! Real-time comparison of an externally paced frame stream against a
//! looping reference, with a raw recording of everything received.

use crate::{
    compare::Comparator,
    config::LiveConfig,
    error::Error,
    extract::{ExtractorFactory, KeypointExtractor},
    frame::{Frame, FrameSize},
    pipeline::read_looping,
    video::{FrameSink, FrameSource, VideoBackend},
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

pub const INVALID_FRAME: &str = "Invalid frame received.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveFrameResult {
    pub score: f32,
    pub wrong_keypoints: Vec<usize>,
    /// Interleaved `x, y` pairs, empty when no pose was found.
    pub user_keypoints: Vec<f32>,
    pub ref_keypoints: Vec<f32>,
}

/// What the client gets back for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FrameReply {
    Compared(LiveFrameResult),
    Rejected { error: String },
}

impl FrameReply {
    pub fn invalid_frame() -> Self {
        Self::Rejected {
            error: INVALID_FRAME.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closed,
}

/// The recording sink. A provisional sink was opened before any frame was
/// seen and is replaced if the first frame has another size. `Pending` means
/// the replacement could not be created yet and is retried on the next frame.
enum Recording {
    Provisional(Box<dyn FrameSink>),
    Pending,
    Active(Box<dyn FrameSink>),
    Stopped,
}

pub struct LiveSession {
    backend: Arc<dyn VideoBackend>,
    comparator: Comparator,
    reference: Option<Box<dyn FrameSource>>,
    reference_extractor: Box<dyn KeypointExtractor>,
    user_extractor: Box<dyn KeypointExtractor>,
    recording: Recording,
    output_path: PathBuf,
    fps: f64,
    recorded: usize,
    state: SessionState,
}

impl LiveSession {
    pub fn open(
        backend: Arc<dyn VideoBackend>,
        extractors: &dyn ExtractorFactory,
        comparator: Comparator,
        reference: &Path,
        config: &LiveConfig,
    ) -> Result<Self, Error> {
        let mut source = backend.open_source(reference)?;
        if source.frame_count() == 0 {
            return Err(Error::EmptyVideo(reference.to_owned()));
        }
        source.rewind()?;

        std::fs::create_dir_all(&config.output_dir)
            .map_err(|e| Error::CreateOutputDir(e, config.output_dir.clone()))?;
        let output_path = config.output_dir.join(recording_name(backend.extension()));
        let sink = backend.create_sink(&output_path, config.provisional_size, config.fps)?;
        info!(path = %output_path.display(), "recording started");

        Ok(Self {
            reference_extractor: extractors.create()?,
            user_extractor: extractors.create()?,
            backend,
            comparator,
            reference: Some(source),
            recording: Recording::Provisional(sink),
            output_path,
            fps: config.fps,
            recorded: 0,
            state: SessionState::Active,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn frames_recorded(&self) -> usize {
        self.recorded
    }

    /// Compare one encoded frame against the next reference frame and append
    /// it to the recording.
    ///
    /// Undecodable bytes get a [`FrameReply::Rejected`] and leave the session
    /// and the recording untouched.
    pub fn process_frame(&mut self, bytes: &[u8]) -> Result<FrameReply, Error> {
        if self.state == SessionState::Closed {
            return Err(Error::NoActiveSession);
        }
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, len = bytes.len(), "rejecting frame");
                return Ok(FrameReply::invalid_frame());
            }
        };
        let frame = self.fit_recording(frame)?;

        let reference = self.reference.as_mut().ok_or(Error::NoActiveSession)?;
        let reference_frame = read_looping(reference.as_mut())?;
        let reference_pose = self.reference_extractor.extract(&reference_frame)?;
        let user_pose = self.user_extractor.extract(&frame)?;
        let result = self
            .comparator
            .compare(user_pose.as_ref(), reference_pose.as_ref());

        self.sink()?.write(&frame)?;
        self.recorded += 1;

        Ok(FrameReply::Compared(LiveFrameResult {
            score: result.score(),
            wrong_keypoints: result.wrong_keypoints(),
            user_keypoints: user_pose.map(|p| p.to_flat()).unwrap_or_default(),
            ref_keypoints: reference_pose.map(|p| p.to_flat()).unwrap_or_default(),
        }))
    }

    /// Make sure the sink accepts `frame`, reopening a still empty sink at
    /// the frame's size or scaling the frame to an established one.
    fn fit_recording(&mut self, frame: Frame) -> Result<Frame, Error> {
        let size = frame.size();
        match std::mem::replace(&mut self.recording, Recording::Pending) {
            Recording::Provisional(sink) if sink.frame_size() != size => {
                debug!(from = %sink.frame_size(), to = %size, "reopening recording");
                drop(sink);
                self.open_recording(frame)
            }
            Recording::Pending => self.open_recording(frame),
            Recording::Provisional(sink) => {
                self.recording = Recording::Active(sink);
                Ok(frame)
            }
            Recording::Active(sink) => {
                let target: FrameSize = sink.frame_size();
                self.recording = Recording::Active(sink);
                if target == size {
                    Ok(frame)
                } else {
                    frame.resized(target)
                }
            }
            Recording::Stopped => {
                self.recording = Recording::Stopped;
                Err(Error::NoActiveSession)
            }
        }
    }

    /// Create the sink at `frame`'s size. On failure the recording stays
    /// pending so a later frame can try again.
    fn open_recording(&mut self, frame: Frame) -> Result<Frame, Error> {
        let sink = self
            .backend
            .create_sink(&self.output_path, frame.size(), self.fps)?;
        self.recording = Recording::Active(sink);
        Ok(frame)
    }

    fn sink(&mut self) -> Result<&mut dyn FrameSink, Error> {
        match &mut self.recording {
            Recording::Provisional(sink) | Recording::Active(sink) => Ok(sink.as_mut()),
            Recording::Pending | Recording::Stopped => Err(Error::NoActiveSession),
        }
    }

    /// Finalize the recording and release the reference.
    ///
    /// The session is closed even if finalizing fails. Later calls return
    /// [`Error::NoActiveSession`].
    pub fn close(&mut self) -> Result<PathBuf, Error> {
        if self.state == SessionState::Closed {
            return Err(Error::NoActiveSession);
        }
        self.state = SessionState::Closed;
        self.reference = None;

        let path = match std::mem::replace(&mut self.recording, Recording::Stopped) {
            Recording::Provisional(sink) | Recording::Active(sink) => sink.finish()?,
            Recording::Pending | Recording::Stopped => self.output_path.clone(),
        };
        info!(path = %path.display(), frames = self.recorded, "recording saved");
        Ok(path)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if self.state == SessionState::Active {
            if let Err(e) = self.close() {
                warn!(error = %e, "failed to close live session");
            }
        }
    }
}

fn recording_name(extension: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("your_pose_{}_{}.{}", timestamp, &id[..8], extension)
}
