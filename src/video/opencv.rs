//! Container video (mp4, mov, avi) through OpenCV.

use super::{check_frame_size, FrameSink, FrameSource, VideoBackend};
use crate::{
    error::Error,
    frame::{Frame, FrameSize},
};
use opencv::{
    core::{Mat, Mat_AUTO_STEP, Size, CV_8UC3},
    imgproc::{cvt_color, COLOR_BGR2RGB, COLOR_RGB2BGR},
    prelude::{MatTrait, MatTraitManual, VideoCaptureTrait, VideoWriterTrait},
    videoio::{
        VideoCapture, VideoWriter, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT,
        CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH, CAP_PROP_POS_FRAMES,
    },
};
use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvBackend;

impl VideoBackend for OpenCvBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, Error> {
        Ok(Box::new(OpenCvSource::open(path)?))
    }

    fn create_sink(
        &self,
        path: &Path,
        size: FrameSize,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>, Error> {
        Ok(Box::new(OpenCvSink::create(path, size, fps)?))
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }
}

fn path_str(path: &Path) -> Result<&str, Error> {
    path.to_str()
        .ok_or_else(|| Error::UnsupportedFormat(path.to_owned()))
}

pub struct OpenCvSource {
    path: PathBuf,
    capture: VideoCapture,
    frame_count: usize,
    fps: Option<f64>,
    size: FrameSize,
}

impl OpenCvSource {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::MissingInput(path.to_owned()));
        }
        let capture = VideoCapture::from_file(path_str(path)?, CAP_ANY)
            .map_err(|e| Error::OpenCv(e, "VideoCapture::from_file"))?;
        if !capture
            .is_opened()
            .map_err(|e| Error::OpenCv(e, "VideoCapture::is_opened"))?
        {
            return Err(Error::OpenCvNotOpened(path.to_owned()));
        }

        let prop = |id| {
            capture
                .get(id)
                .map_err(|e| Error::OpenCv(e, "VideoCapture::get"))
        };
        let frame_count = prop(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        let fps = Some(prop(CAP_PROP_FPS)?).filter(|fps| fps.is_finite() && *fps > 0.0);
        let size = FrameSize::new(
            prop(CAP_PROP_FRAME_WIDTH)?.max(0.0) as u32,
            prop(CAP_PROP_FRAME_HEIGHT)?.max(0.0) as u32,
        );
        debug!(path = %path.display(), frame_count, ?fps, %size, "opened video capture");

        Ok(Self {
            path: path.to_owned(),
            capture,
            frame_count,
            fps,
            size,
        })
    }
}

/// Copy a BGR `Mat` into an RGB frame.
fn mat_to_frame(bgr: &Mat) -> Result<Frame, Error> {
    let mut rgb = Mat::default();
    cvt_color(bgr, &mut rgb, COLOR_BGR2RGB, 0).map_err(|e| Error::OpenCv(e, "cvt_color"))?;

    let rows = usize::try_from(rgb.rows()).unwrap_or(0);
    let cols = usize::try_from(rgb.cols()).unwrap_or(0);
    let step = rgb.step1(0).map_err(|e| Error::OpenCv(e, "Mat::step1"))?
        * rgb
            .elem_size1()
            .map_err(|e| Error::OpenCv(e, "Mat::elem_size1"))?;
    let data = rgb.data().map_err(|e| Error::OpenCv(e, "Mat::data"))?;
    let bytes = unsafe { std::slice::from_raw_parts(data, step * rows) };

    let mut pixels = Vec::with_capacity(rows * cols * 3);
    for row in bytes.chunks_exact(step) {
        pixels.extend_from_slice(&row[..cols * 3]);
    }
    Frame::from_rgb(FrameSize::new(cols as u32, rows as u32), pixels)
}

impl FrameSource for OpenCvSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn read(&mut self) -> Result<Option<Frame>, Error> {
        let mut mat = Mat::default();
        let ok = self
            .capture
            .read(&mut mat)
            .map_err(|e| Error::OpenCv(e, "VideoCapture::read"))?;
        if !ok || mat.empty().map_err(|e| Error::OpenCv(e, "Mat::empty"))? {
            return Ok(None);
        }
        mat_to_frame(&mat).map(Some)
    }

    fn rewind(&mut self) -> Result<(), Error> {
        self.capture
            .set(CAP_PROP_POS_FRAMES, 0.0)
            .map_err(|e| Error::OpenCv(e, "VideoCapture::set"))?;
        Ok(())
    }
}

pub struct OpenCvSink {
    path: PathBuf,
    size: FrameSize,
    written: usize,
    writer: VideoWriter,
}

impl OpenCvSink {
    pub fn create(path: &Path, size: FrameSize, fps: f64) -> Result<Self, Error> {
        let fourcc = VideoWriter::fourcc(b'm' as i8, b'p' as i8, b'4' as i8, b'v' as i8)
            .map_err(|e| Error::OpenCv(e, "VideoWriter::fourcc"))?;
        let writer = VideoWriter::new(
            path_str(path)?,
            fourcc,
            fps,
            Size::new(size.width as i32, size.height as i32),
            true,
        )
        .map_err(|e| Error::OpenCv(e, "VideoWriter::new"))?;
        if !writer
            .is_opened()
            .map_err(|e| Error::OpenCv(e, "VideoWriter::is_opened"))?
        {
            return Err(Error::OpenCvNotOpened(path.to_owned()));
        }
        Ok(Self {
            path: path.to_owned(),
            size,
            written: 0,
            writer,
        })
    }
}

impl FrameSink for OpenCvSink {
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
        let mut rgb: Vec<u8> = frame.pixels().iter().copied().collect();
        let rgb = unsafe {
            Mat::new_rows_cols_with_data(
                self.size.height as i32,
                self.size.width as i32,
                CV_8UC3,
                rgb.as_mut_ptr().cast(),
                Mat_AUTO_STEP,
            )
        }
        .map_err(|e| Error::OpenCv(e, "Mat::new_rows_cols_with_data"))?;
        let mut bgr = Mat::default();
        cvt_color(&rgb, &mut bgr, COLOR_RGB2BGR, 0).map_err(|e| Error::OpenCv(e, "cvt_color"))?;
        self.writer
            .write(&bgr)
            .map_err(|e| Error::OpenCv(e, "VideoWriter::write"))?;
        self.written += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf, Error> {
        self.writer
            .release()
            .map_err(|e| Error::OpenCv(e, "VideoWriter::release"))?;
        Ok(self.path.clone())
    }
}
