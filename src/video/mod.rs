//! Sequential frame I/O over video containers.

use crate::{
    error::Error,
    frame::{Frame, FrameSize},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

pub mod gif;
#[cfg(feature = "opencv")]
pub mod opencv;

pub use self::gif::GifBackend;

/// A finite, rewindable sequence of frames.
pub trait FrameSource: Send {
    fn path(&self) -> &Path;

    /// Number of frames the container reports. Reads may still end early.
    fn frame_count(&self) -> usize;

    /// `None` when the container carries no usable timing.
    fn fps(&self) -> Option<f64>;

    fn frame_size(&self) -> FrameSize;

    /// The next frame, or `None` once the source is exhausted.
    fn read(&mut self) -> Result<Option<Frame>, Error>;

    fn rewind(&mut self) -> Result<(), Error>;
}

/// An append-only video writer with a fixed frame size.
pub trait FrameSink: Send {
    fn path(&self) -> &Path;

    fn frame_size(&self) -> FrameSize;

    fn frames_written(&self) -> usize;

    /// Frames whose size differs from [`FrameSink::frame_size`] are rejected.
    fn write(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Flush and close the container. Dropping a sink without calling this
    /// closes it too, discarding any error.
    fn finish(self: Box<Self>) -> Result<PathBuf, Error>;
}

pub trait VideoBackend: Send + Sync {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, Error>;

    fn create_sink(
        &self,
        path: &Path,
        size: FrameSize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>, Error>;

    /// Extension given to files this backend creates.
    fn extension(&self) -> &'static str;
}

pub(crate) fn check_frame_size(expected: FrameSize, frame: &Frame) -> Result<(), Error> {
    let got = frame.size();
    if got == expected {
        Ok(())
    } else {
        Err(Error::FrameSizeMismatch { expected, got })
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case(ext))
}

/// Routes GIF paths to [`GifBackend`] and, when built with OpenCV, every
/// other container to the OpenCV backend.
#[derive(Debug, Default)]
pub struct Dispatch {
    gif: GifBackend,
    #[cfg(feature = "opencv")]
    opencv: self::opencv::OpenCvBackend,
}

impl Dispatch {
    fn route(&self, path: &Path) -> Result<&dyn VideoBackend, Error> {
        if has_extension(path, "gif") {
            return Ok(&self.gif);
        }
        #[cfg(feature = "opencv")]
        {
            Ok(&self.opencv)
        }
        #[cfg(not(feature = "opencv"))]
        {
            Err(Error::UnsupportedFormat(path.to_owned()))
        }
    }
}

impl VideoBackend for Dispatch {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, Error> {
        self.route(path)?.open_source(path)
    }

    fn create_sink(
        &self,
        path: &Path,
        size: FrameSize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>, Error> {
        self.route(path)?.create_sink(path, size, fps)
    }

    fn extension(&self) -> &'static str {
        #[cfg(feature = "opencv")]
        {
            self.opencv.extension()
        }
        #[cfg(not(feature = "opencv"))]
        {
            self.gif.extension()
        }
    }
}

pub fn default_backend() -> Arc<dyn VideoBackend> {
    Arc::new(Dispatch::default())
}

#[cfg(test)]
mod tests {
    use super::{default_backend, has_extension};
    use crate::{error::Error, frame::FrameSize};
    use std::path::Path;

    #[test]
    fn extension_match_ignores_case() {
        assert!(has_extension(Path::new("clip.GIF"), "gif"));
        assert!(!has_extension(Path::new("clip.gif.mp4"), "gif"));
        assert!(!has_extension(Path::new("clip"), "gif"));
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn containers_without_backend_are_unsupported() {
        let backend = default_backend();
        assert!(matches!(
            backend.open_source(Path::new("clip.mp4")),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            backend.create_sink(Path::new("out.avi"), FrameSize::new(2, 2), 30.0),
            Err(Error::UnsupportedFormat(_))
        ));
        assert_eq!(backend.extension(), "gif");
    }
}
