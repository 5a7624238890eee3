//! Animated GIF containers through the `image` crate.
//!
//! Sources decode every frame up front; GIF clips are short and decoding
//! lazily would make `frame_count` unknowable without a second pass.

use super::{check_frame_size, FrameSink, FrameSource, VideoBackend};
use crate::{
    error::Error,
    frame::{Frame, FrameSize},
};
use image::{
    codecs::gif::{GifDecoder, GifEncoder, Repeat},
    AnimationDecoder, Delay, DynamicImage,
};
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// Quantizer speed handed to the encoder, 1 (best) to 30 (fastest).
const ENCODER_SPEED: i32 = 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct GifBackend;

impl VideoBackend for GifBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, Error> {
        Ok(Box::new(GifSource::open(path)?))
    }

    fn create_sink(
        &self,
        path: &Path,
        size: FrameSize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>, Error> {
        Ok(Box::new(GifSink::create(path, size, fps)?))
    }

    fn extension(&self) -> &'static str {
        "gif"
    }
}

pub struct GifSource {
    path: PathBuf,
    frames: Vec<Frame>,
    fps: Option<f64>,
    cursor: usize,
}

impl GifSource {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|e| Error::OpenVideo(e, path.to_owned()))?;
        let len = file
            .metadata()
            .map_err(|e| Error::OpenVideo(e, path.to_owned()))?
            .len();
        if len == 0 {
            // an empty upload is an empty video, not a corrupt one
            return Ok(Self {
                path: path.to_owned(),
                frames: Vec::new(),
                fps: None,
                cursor: 0,
            });
        }

        let decoder = GifDecoder::new(BufReader::new(file))
            .map_err(|e| Error::DecodeGif(e, path.to_owned()))?;
        let decoded = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| Error::DecodeGif(e, path.to_owned()))?;

        let fps = decoded.first().and_then(|frame| delay_to_fps(frame.delay()));
        let frames = decoded
            .into_iter()
            .map(|frame| Frame::from_image(DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8()))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(path = %path.display(), frames = frames.len(), ?fps, "decoded gif");

        Ok(Self {
            path: path.to_owned(),
            frames,
            fps,
            cursor: 0,
        })
    }
}

fn delay_to_fps(delay: Delay) -> Option<f64> {
    let (numer, denom) = delay.numer_denom_ms();
    if numer == 0 || denom == 0 {
        return None;
    }
    Some(1000.0 * f64::from(denom) / f64::from(numer))
}

impl FrameSource for GifSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_size(&self) -> FrameSize {
        self.frames
            .first()
            .map_or(FrameSize::new(0, 0), Frame::size)
    }

    fn read(&mut self) -> Result<Option<Frame>, Error> {
        let frame = self.frames.get(self.cursor).cloned();
        if frame.is_some() {
            self.cursor += 1;
        }
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<(), Error> {
        self.cursor = 0;
        Ok(())
    }
}

/// Buffered file writer that keeps the first I/O error it sees, including
/// the ones hit while the encoder writes its trailer on drop.
struct TrackedWriter {
    inner: BufWriter<File>,
    failure: Arc<Mutex<Option<io::Error>>>,
}

impl TrackedWriter {
    fn record<T>(&self, result: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &result {
            if let Ok(mut slot) = self.failure.lock() {
                if slot.is_none() {
                    *slot = Some(io::Error::new(e.kind(), e.to_string()));
                }
            }
        }
        result
    }
}

impl Write for TrackedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.inner.write(buf);
        self.record(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.inner.flush();
        self.record(result)
    }
}

impl Drop for TrackedWriter {
    fn drop(&mut self) {
        let result = self.inner.flush();
        let _ = self.record(result);
    }
}

pub struct GifSink {
    path: PathBuf,
    size: FrameSize,
    delay: Delay,
    written: usize,
    encoder: GifEncoder<TrackedWriter>,
    failure: Arc<Mutex<Option<io::Error>>>,
}

impl GifSink {
    pub fn create(path: &Path, size: FrameSize, fps: f64) -> Result<Self, Error> {
        let file = File::create(path).map_err(|e| Error::CreateOutput(e, path.to_owned()))?;
        let failure = Arc::new(Mutex::new(None));
        let writer = TrackedWriter {
            inner: BufWriter::new(file),
            failure: Arc::clone(&failure),
        };
        let mut encoder = GifEncoder::new_with_speed(writer, ENCODER_SPEED);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|e| Error::EncodeGif(e, path.to_owned()))?;

        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        let delay = Delay::from_numer_denom_ms((1000.0 / fps * 100.0).round() as u32, 100);
        debug!(path = %path.display(), %size, fps, "created gif sink");

        Ok(Self {
            path: path.to_owned(),
            size,
            delay,
            written: 0,
            encoder,
            failure,
        })
    }
}

impl FrameSink for GifSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn frames_written(&self) -> usize {
        self.written
    }

    fn write(&mut self, frame: &Frame) -> Result<(), Error> {
        check_frame_size(self.size, frame)?;
        let rgba = DynamicImage::ImageRgb8(frame.to_image()?).to_rgba8();
        self.encoder
            .encode_frame(image::Frame::from_parts(rgba, 0, 0, self.delay))
            .map_err(|e| Error::EncodeGif(e, self.path.clone()))?;
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PathBuf, Error> {
        let Self {
            path,
            written,
            encoder,
            failure,
            ..
        } = *self;
        // the trailer is written and the file flushed when the encoder drops
        drop(encoder);
        let failure = match failure.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(e) = failure {
            return Err(Error::FinishOutput(e, path));
        }
        if written == 0 {
            warn!(path = %path.display(), "finished gif sink without frames");
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::{delay_to_fps, GifBackend};
    use crate::{
        error::Error,
        frame::{Frame, FrameSize},
        video::VideoBackend,
    };
    use assert_approx_eq::assert_approx_eq;
    use image::Delay;

    #[test]
    fn writes_and_reads_back_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        let size = FrameSize::new(8, 6);

        let mut sink = GifBackend.create_sink(&path, size, 10.0).unwrap();
        for shade in [40, 120, 200] {
            sink.write(&Frame::filled(size, [shade, shade, shade])).unwrap();
        }
        assert_eq!(sink.frames_written(), 3);
        assert_eq!(sink.finish().unwrap(), path);

        let mut source = GifBackend.open_source(&path).unwrap();
        assert_eq!(source.frame_count(), 3);
        assert_eq!(source.frame_size(), size);
        assert_approx_eq!(source.fps().unwrap(), 10.0, 0.5);

        let mut read = 0;
        while let Some(frame) = source.read().unwrap() {
            assert_eq!(frame.size(), size);
            read += 1;
        }
        assert_eq!(read, 3);

        source.rewind().unwrap();
        assert!(source.read().unwrap().is_some());
    }

    #[test]
    fn sink_rejects_other_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = GifBackend
            .create_sink(&dir.path().join("out.gif"), FrameSize::new(4, 4), 30.0)
            .unwrap();
        assert!(matches!(
            sink.write(&Frame::black(FrameSize::new(5, 4))),
            Err(Error::FrameSizeMismatch { .. })
        ));
        assert_eq!(sink.frames_written(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finish_reports_failed_flush() {
        let size = FrameSize::new(4, 4);
        let mut sink = GifBackend
            .create_sink(std::path::Path::new("/dev/full"), size, 10.0)
            .unwrap();
        sink.write(&Frame::filled(size, [10, 20, 30])).unwrap();
        assert!(matches!(sink.finish(), Err(Error::FinishOutput(..))));
    }

    #[test]
    fn empty_file_has_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.gif");
        std::fs::write(&path, b"").unwrap();
        let mut source = GifBackend.open_source(&path).unwrap();
        assert_eq!(source.frame_count(), 0);
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn missing_and_corrupt_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GifBackend.open_source(&dir.path().join("nope.gif")),
            Err(Error::OpenVideo(..))
        ));
        let corrupt = dir.path().join("corrupt.gif");
        std::fs::write(&corrupt, b"GIF89a but not really").unwrap();
        assert!(matches!(
            GifBackend.open_source(&corrupt),
            Err(Error::DecodeGif(..))
        ));
    }

    #[test]
    fn zero_delay_has_no_fps() {
        assert_eq!(delay_to_fps(Delay::from_numer_denom_ms(0, 1)), None);
        assert_approx_eq!(
            delay_to_fps(Delay::from_numer_denom_ms(40, 1)).unwrap(),
            25.0
        );
    }
}
