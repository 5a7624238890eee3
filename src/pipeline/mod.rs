//! Offline comparison of a user video against a reference video.

use crate::{
    annotate::FrameAnnotation,
    compare::{Comparator, ComparisonResult, ScoreSummary},
    config::PipelineConfig,
    error::Error,
    event::ProgressSink,
    extract::{ExtractorFactory, KeypointExtractor},
    frame::{Frame, FrameSize},
    job::{cleanup_files, CancelToken, JobOutput},
    render::Renderer,
    video::{FrameSink, FrameSource, VideoBackend},
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, instrument};

pub mod lift;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameScore {
    pub frame: usize,
    pub score: f32,
    pub wrong_keypoints: Vec<usize>,
    pub detected: bool,
}

impl FrameScore {
    fn new(frame: usize, result: &ComparisonResult) -> Self {
        Self {
            frame,
            score: result.score(),
            wrong_keypoints: result.wrong_keypoints(),
            detected: result.detected(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonOutput {
    pub side_by_side_video_path: PathBuf,
    pub annotated_user_video_path: PathBuf,
    pub frame_scores: Vec<FrameScore>,
    pub summary: ScoreSummary,
}

impl JobOutput for ComparisonOutput {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationOutput {
    pub annotated_video_path: PathBuf,
    pub summary: ScoreSummary,
}

impl JobOutput for AnnotationOutput {}

/// Map `done` of `total` frames into the percentage band `[start, end]`.
fn milestone((start, end): (u8, u8), done: usize, total: usize) -> u8 {
    if total == 0 {
        return end;
    }
    let span = usize::from(end.saturating_sub(start));
    start + (span * done.min(total) / total) as u8
}

fn fps_of(source: &dyn FrameSource, fallback: f64) -> f64 {
    source.fps().unwrap_or(fallback)
}

/// The next reference frame, looping back to the start when the source runs
/// out.
pub(crate) fn read_looping(source: &mut dyn FrameSource) -> Result<Frame, Error> {
    if let Some(frame) = source.read()? {
        return Ok(frame);
    }
    debug!(path = %source.path().display(), "reference exhausted, rewinding");
    source.rewind()?;
    source
        .read()?
        .ok_or_else(|| Error::ReferenceExhausted(source.path().to_owned()))
}

struct Pass<'a> {
    step: &'static str,
    band: (u8, u8),
    total: usize,
    every: usize,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancelToken,
}

#[derive(Clone)]
pub struct BatchPipeline {
    backend: Arc<dyn VideoBackend>,
    extractors: Arc<dyn ExtractorFactory>,
    comparator: Comparator,
    renderer: Renderer,
    config: PipelineConfig,
}

impl BatchPipeline {
    pub fn new(
        backend: Arc<dyn VideoBackend>,
        extractors: Arc<dyn ExtractorFactory>,
        comparator: Comparator,
        config: PipelineConfig,
    ) -> Self {
        let renderer = Renderer::new(comparator.config(), &config);
        Self {
            backend,
            extractors,
            comparator,
            renderer,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn VideoBackend> {
        &self.backend
    }

    /// Write a side-by-side comparison video and an annotated copy of the
    /// user video, scoring every frame.
    ///
    /// Either source having no frames fails before any output is created.
    /// Outputs written before a failure are removed.
    #[instrument(
        skip_all,
        fields(reference = %reference.display(), user = %user.display())
    )]
    pub fn compare(
        &self,
        reference: &Path,
        user: &Path,
        side_by_side_out: &Path,
        annotated_out: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<ComparisonOutput, Error> {
        let outcome = self.compare_inner(
            reference,
            user,
            side_by_side_out,
            annotated_out,
            progress,
            cancel,
        );
        if outcome.is_err() {
            cleanup_files(&[side_by_side_out.to_owned(), annotated_out.to_owned()]);
        }
        outcome
    }

    fn compare_inner(
        &self,
        reference: &Path,
        user: &Path,
        side_by_side_out: &Path,
        annotated_out: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<ComparisonOutput, Error> {
        progress.progress("loading", "Loading videos", 5);
        let mut reference_src = self.backend.open_source(reference)?;
        let mut user_src = self.backend.open_source(user)?;

        progress.progress("validating", "Validating videos", 10);
        let total = non_empty(reference_src.as_ref())?.min(non_empty(user_src.as_ref())?);
        reference_src.rewind()?;
        let fps = fps_of(user_src.as_ref(), self.config.fallback_fps);
        info!(total, fps, "comparing videos");

        let panel = self.config.panel;
        let mut side_by_side = self.backend.create_sink(
            side_by_side_out,
            FrameSize::new(panel.width * 2, panel.height),
            fps,
        )?;
        let (frame_scores, summary) = self.side_by_side_pass(
            reference_src.as_mut(),
            user_src.as_mut(),
            side_by_side.as_mut(),
            &Pass {
                step: "processing",
                band: (20, 55),
                total,
                every: self.config.progress_every.max(1),
                progress,
                cancel,
            },
        )?;

        reference_src.rewind()?;
        user_src.rewind()?;
        let mut annotated =
            self.backend
                .create_sink(annotated_out, user_src.frame_size(), fps)?;
        self.annotation_pass(
            reference_src.as_mut(),
            user_src.as_mut(),
            annotated.as_mut(),
            &Pass {
                step: "annotating",
                band: (55, 90),
                total,
                every: self.config.progress_every.max(1),
                progress,
                cancel,
            },
        )?;

        progress.progress("saving", "Saving videos", 95);
        let side_by_side_video_path = side_by_side.finish()?;
        let annotated_user_video_path = annotated.finish()?;
        progress.progress("completed", "Comparison completed", 100);

        info!(
            mean_score = summary.mean_score,
            compared = summary.compared_frames,
            no_data = summary.no_data_frames,
            "comparison finished"
        );

        Ok(ComparisonOutput {
            side_by_side_video_path,
            annotated_user_video_path,
            frame_scores,
            summary,
        })
    }

    /// Annotate every frame of `user` with flags and a ghost of `reference`,
    /// looping the reference if it is shorter.
    #[instrument(
        skip_all,
        fields(reference = %reference.display(), user = %user.display())
    )]
    pub fn annotate(
        &self,
        reference: &Path,
        user: &Path,
        out: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<AnnotationOutput, Error> {
        let outcome = self.annotate_inner(reference, user, out, progress, cancel);
        if outcome.is_err() {
            cleanup_files(&[out.to_owned()]);
        }
        outcome
    }

    fn annotate_inner(
        &self,
        reference: &Path,
        user: &Path,
        out: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<AnnotationOutput, Error> {
        progress.progress("loading", "Loading videos", 5);
        let mut reference_src = self.backend.open_source(reference)?;
        let mut user_src = self.backend.open_source(user)?;
        non_empty(reference_src.as_ref())?;
        let total = non_empty(user_src.as_ref())?;
        reference_src.rewind()?;

        let fps = fps_of(user_src.as_ref(), self.config.fallback_fps);
        let mut sink = self.backend.create_sink(out, user_src.frame_size(), fps)?;
        let summary = self.annotation_pass(
            reference_src.as_mut(),
            user_src.as_mut(),
            sink.as_mut(),
            &Pass {
                step: "annotating",
                band: (10, 90),
                total,
                every: self.config.progress_every.max(1),
                progress,
                cancel,
            },
        )?;

        progress.progress("saving", "Saving video", 95);
        let annotated_video_path = sink.finish()?;
        progress.progress("completed", "Annotation completed", 100);

        Ok(AnnotationOutput {
            annotated_video_path,
            summary,
        })
    }

    fn extractors(&self) -> Result<(Box<dyn KeypointExtractor>, Box<dyn KeypointExtractor>), Error> {
        Ok((self.extractors.create()?, self.extractors.create()?))
    }

    fn side_by_side_pass(
        &self,
        reference: &mut dyn FrameSource,
        user: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        pass: &Pass<'_>,
    ) -> Result<(Vec<FrameScore>, ScoreSummary), Error> {
        let (mut reference_extractor, mut user_extractor) = self.extractors()?;
        let topology = &self.comparator.config().topology;
        let keypoint_count = self.comparator.config().keypoint_count;
        let mut scores = Vec::with_capacity(pass.total);
        let mut summary = ScoreSummary::default();

        for index in 0..pass.total {
            pass.cancel.check()?;
            let (reference_frame, user_frame) = match (reference.read()?, user.read()?) {
                (Some(r), Some(u)) => (r, u),
                _ => {
                    info!(index, "source ended early");
                    break;
                }
            };

            let reference_pose = reference_extractor.extract(&reference_frame)?;
            let user_pose = user_extractor.extract(&user_frame)?;
            let result = self
                .comparator
                .compare(user_pose.as_ref(), reference_pose.as_ref());
            let annotation =
                FrameAnnotation::new(user_pose.as_ref(), &result, topology, keypoint_count);

            let composed = self.renderer.side_by_side(
                Some(&reference_frame),
                reference_pose.as_ref(),
                &user_frame,
                &annotation,
            )?;
            sink.write(&composed)?;
            scores.push(FrameScore::new(index, &result));
            summary.add(&result);
            report(pass, index);
        }
        Ok((scores, summary))
    }

    fn annotation_pass(
        &self,
        reference: &mut dyn FrameSource,
        user: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        pass: &Pass<'_>,
    ) -> Result<ScoreSummary, Error> {
        let (mut reference_extractor, mut user_extractor) = self.extractors()?;
        let topology = &self.comparator.config().topology;
        let keypoint_count = self.comparator.config().keypoint_count;
        let out_size = sink.frame_size();
        let mut summary = ScoreSummary::default();

        for index in 0..pass.total {
            pass.cancel.check()?;
            let user_frame = match user.read()? {
                Some(frame) => frame.resized(out_size)?,
                None => {
                    info!(index, "user video ended early");
                    break;
                }
            };
            let reference_frame = read_looping(reference)?;

            let reference_pose = reference_extractor.extract(&reference_frame)?;
            let user_pose = user_extractor.extract(&user_frame)?;
            let result = self
                .comparator
                .compare(user_pose.as_ref(), reference_pose.as_ref());
            summary.add(&result);

            let annotation =
                FrameAnnotation::new(user_pose.as_ref(), &result, topology, keypoint_count)
                    .with_ghost(reference_pose.as_ref(), self.config.ghost_opacity);
            sink.write(&self.renderer.single_pane(&user_frame, &annotation))?;
            report(pass, index);
        }
        Ok(summary)
    }
}

fn non_empty(source: &dyn FrameSource) -> Result<usize, Error> {
    match source.frame_count() {
        0 => Err(Error::EmptyVideo(source.path().to_owned())),
        n => Ok(n),
    }
}

fn report(pass: &Pass<'_>, index: usize) {
    let done = index + 1;
    if done % pass.every == 0 || done == pass.total {
        pass.progress.progress(
            pass.step,
            &format!("Frame {}/{}", done, pass.total),
            milestone(pass.band, done, pass.total),
        );
    }
}
