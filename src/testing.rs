//! In-memory collaborators for unit tests.

use crate::{
    error::Error,
    extract::{ExtractorFactory, KeypointExtractor},
    frame::{Frame, FrameSize, Rgb},
    pose::{Keypoint, KeypointSet, NUM_LANDMARKS},
    video::{check_frame_size, FrameSink, FrameSource, VideoBackend},
};
use std::{
    collections::HashMap,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Reads a pose out of pixel `(0, 0)`: every keypoint sits at
/// `(r / 255, g / 255)`. A black corner means nobody is in the frame.
pub(crate) struct ColorExtractor;

impl KeypointExtractor for ColorExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Option<KeypointSet>, Error> {
        let [r, g, _] = match frame.pixel(0, 0) {
            Some([0, 0, 0]) | None => return Ok(None),
            Some(pixel) => pixel,
        };
        let (x, y) = (f32::from(r) / 255.0, f32::from(g) / 255.0);
        let keypoints = (0..NUM_LANDMARKS)
            .map(|_| Keypoint::new(x, y, None))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(KeypointSet::new(keypoints)))
    }
}

pub(crate) fn color_extractors() -> Arc<dyn ExtractorFactory> {
    Arc::new(|| -> Result<Box<dyn KeypointExtractor>, Error> { Ok(Box::new(ColorExtractor)) })
}

pub(crate) fn solid(size: FrameSize, color: Rgb) -> Frame {
    Frame::filled(size, color)
}

pub(crate) fn png_bytes(frame: &Frame) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    frame
        .to_image()
        .unwrap()
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

#[derive(Clone)]
struct Clip {
    frames: Vec<Frame>,
    reported_count: usize,
    fps: Option<f64>,
}

/// Videos held in memory, keyed by path. Finished sinks become readable
/// clips, and each sink also leaves a small marker file on disk so cleanup
/// can be observed.
#[derive(Clone, Default)]
pub(crate) struct MemoryBackend {
    clips: Arc<Mutex<HashMap<PathBuf, Clip>>>,
    sinks_created: Arc<Mutex<Vec<(PathBuf, FrameSize)>>>,
}

impl MemoryBackend {
    pub(crate) fn insert(&self, path: impl Into<PathBuf>, frames: Vec<Frame>) {
        let reported_count = frames.len();
        self.insert_with_count(path, frames, reported_count);
    }

    /// A clip whose container claims `reported_count` frames.
    pub(crate) fn insert_with_count(
        &self,
        path: impl Into<PathBuf>,
        frames: Vec<Frame>,
        reported_count: usize,
    ) {
        self.clips.lock().unwrap().insert(
            path.into(),
            Clip {
                frames,
                reported_count,
                fps: Some(30.0),
            },
        );
    }

    pub(crate) fn frames(&self, path: &Path) -> Option<Vec<Frame>> {
        self.clips
            .lock()
            .unwrap()
            .get(path)
            .map(|clip| clip.frames.clone())
    }

    pub(crate) fn sinks_created(&self) -> Vec<(PathBuf, FrameSize)> {
        self.sinks_created.lock().unwrap().clone()
    }
}

impl VideoBackend for MemoryBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, Error> {
        let clip = self
            .clips
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::MissingInput(path.to_owned()))?;
        Ok(Box::new(MemorySource {
            path: path.to_owned(),
            clip,
            cursor: 0,
        }))
    }

    fn create_sink(
        &self,
        path: &Path,
        size: FrameSize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>, Error> {
        std::fs::write(path, b"").map_err(|e| Error::CreateOutput(e, path.to_owned()))?;
        self.sinks_created
            .lock()
            .unwrap()
            .push((path.to_owned(), size));
        Ok(Box::new(MemorySink {
            path: path.to_owned(),
            size,
            fps,
            frames: Vec::new(),
            clips: Arc::clone(&self.clips),
        }))
    }

    fn extension(&self) -> &'static str {
        "mem"
    }
}

struct MemorySource {
    path: PathBuf,
    clip: Clip,
    cursor: usize,
}

impl FrameSource for MemorySource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frame_count(&self) -> usize {
        self.clip.reported_count
    }

    fn fps(&self) -> Option<f64> {
        self.clip.fps
    }

    fn frame_size(&self) -> FrameSize {
        self.clip
            .frames
            .first()
            .map_or(FrameSize::new(0, 0), Frame::size)
    }

    fn read(&mut self) -> Result<Option<Frame>, Error> {
        let frame = self.clip.frames.get(self.cursor).cloned();
        self.cursor += usize::from(frame.is_some());
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<(), Error> {
        self.cursor = 0;
        Ok(())
    }
}

struct MemorySink {
    path: PathBuf,
    size: FrameSize,
    fps: f64,
    frames: Vec<Frame>,
    clips: Arc<Mutex<HashMap<PathBuf, Clip>>>,
}

impl FrameSink for MemorySink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn frames_written(&self) -> usize {
        self.frames.len()
    }

    fn write(&mut self, frame: &Frame) -> Result<(), Error> {
        check_frame_size(self.size, frame)?;
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PathBuf, Error> {
        let Self {
            path,
            fps,
            frames,
            clips,
            ..
        } = *self;
        std::fs::write(&path, frames.len().to_string())
            .map_err(|e| Error::CreateOutput(e, path.clone()))?;
        let reported_count = frames.len();
        clips.lock().unwrap().insert(
            path.clone(),
            Clip {
                frames,
                reported_count,
                fps: Some(fps),
            },
        );
        Ok(path)
    }
}
