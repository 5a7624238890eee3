//! Single-video pipeline: 2D keypoints per frame, then a 3D lift of the
//! whole sequence.

use crate::{
    error::Error,
    event::ProgressSink,
    extract::{KeypointExtractor, Pose3d, PoseLifter},
    job::{cleanup_files, CancelToken, JobOutput},
    pose::KeypointSet,
    video::VideoBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFrame {
    pub frame: usize,
    pub keypoints: KeypointSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftedSequence {
    pub fps: Option<f64>,
    /// Source frame index of each pose, when the lifter kept every input.
    pub frames: Vec<usize>,
    pub poses: Vec<Pose3d>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiftOutput {
    pub keypoints_json_path: PathBuf,
    pub generated_files: Vec<PathBuf>,
}

impl JobOutput for LiftOutput {
    fn generated_files(&self) -> Vec<PathBuf> {
        self.generated_files.clone()
    }
}

fn write_json<T>(path: &Path, value: &T) -> Result<(), Error>
where
    T: Serialize + ?Sized,
{
    let file = File::create(path).map_err(|e| Error::WriteKeypoints(e, path.to_owned()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|e| Error::SerializeKeypoints(e, path.to_owned()))?;
    writer
        .flush()
        .map_err(|e| Error::WriteKeypoints(e, path.to_owned()))
}

/// Detect a pose in every frame of `video`, lift the detected sequence to
/// 3D and write it to `<output_dir>/<basename>_3d_poses.json`.
///
/// The intermediate `<basename>_2d.json` is removed whatever the outcome.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(video = %video.display(), basename = %basename))]
pub fn lift_video(
    backend: &dyn VideoBackend,
    extractor: &mut dyn KeypointExtractor,
    lifter: &mut dyn PoseLifter,
    video: &Path,
    output_dir: &Path,
    basename: &str,
    progress_every: usize,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<LiftOutput, Error> {
    info!("starting pose lifting");
    std::fs::create_dir_all(output_dir)
        .map_err(|e| Error::CreateOutputDir(e, output_dir.to_owned()))?;

    let mut source = backend.open_source(video)?;
    let total = source.frame_count();
    if total == 0 {
        return Err(Error::EmptyVideo(video.to_owned()));
    }
    let every = progress_every.max(1);

    progress.progress("detecting", "Detecting 2D poses", 5);
    let mut detected = Vec::new();
    let mut index = 0;
    while let Some(frame) = source.read()? {
        cancel.check()?;
        if let Some(keypoints) = extractor.extract(&frame)? {
            detected.push(DetectedFrame {
                frame: index,
                keypoints,
            });
        }
        index += 1;
        if index % every == 0 {
            let pct = 5 + 55 * index.min(total) / total;
            progress.progress(
                "detecting",
                &format!("Frame {}/{}", index, total),
                pct as u8,
            );
        }
    }

    if detected.is_empty() {
        info!("no pose detected");
        return Err(Error::NoPoseDetected(video.to_owned()));
    }
    info!(frames = index, detected = detected.len(), "2D detection finished");

    let path_2d = output_dir.join(format!("{}_2d.json", basename));
    let path_3d = output_dir.join(format!("{}_3d_poses.json", basename));
    let lifted = write_json(&path_2d, &detected).and_then(|()| {
        progress.progress("lifting", "Estimating 3D poses", 65);
        cancel.check()?;
        let poses: Vec<KeypointSet> = detected.iter().map(|d| d.keypoints.clone()).collect();
        lifter.lift(&poses)
    });
    cleanup_files(&[path_2d]);
    let lifted = lifted?;

    if lifted.is_empty() {
        info!("lifting produced no valid pose");
        cleanup_files(&[path_3d]);
        return Err(Error::LiftedPoseCount {
            expected: detected.len(),
            got: 0,
        });
    }

    progress.progress("saving", "Saving 3D poses", 90);
    let frames = if lifted.len() == detected.len() {
        detected.iter().map(|d| d.frame).collect()
    } else {
        Vec::new()
    };
    let sequence = LiftedSequence {
        fps: source.fps(),
        frames,
        poses: lifted,
    };
    if let Err(e) = write_json(&path_3d, &sequence) {
        cleanup_files(&[path_3d]);
        return Err(e);
    }
    info!(path = %path_3d.display(), poses = sequence.poses.len(), "saved 3D poses");
    progress.progress("completed", "Pose lifting completed", 100);

    Ok(LiftOutput {
        keypoints_json_path: path_3d.clone(),
        generated_files: vec![path_3d],
    })
}

#[cfg(test)]
mod tests {
    use super::{lift_video, LiftedSequence};
    use crate::{
        error::Error,
        event::Silent,
        extract::{Pose3d, PoseLifter},
        frame::FrameSize,
        job::{CancelToken, JobOutput},
        pose::KeypointSet,
        testing::{solid, ColorExtractor, MemoryBackend},
    };
    use std::path::Path;

    struct FlatLifter;

    impl PoseLifter for FlatLifter {
        fn lift(&mut self, poses: &[KeypointSet]) -> Result<Vec<Pose3d>, Error> {
            Ok(poses
                .iter()
                .map(|pose| pose.iter().map(|k| [k.x(), k.y(), 0.0]).collect())
                .collect())
        }
    }

    struct NothingLifter;

    impl PoseLifter for NothingLifter {
        fn lift(&mut self, _poses: &[KeypointSet]) -> Result<Vec<Pose3d>, Error> {
            Ok(Vec::new())
        }
    }

    fn backend() -> MemoryBackend {
        let size = FrameSize::new(4, 4);
        let backend = MemoryBackend::default();
        backend.insert(
            "clip",
            vec![
                solid(size, [51, 102, 0]),
                solid(size, [0, 0, 0]),
                solid(size, [102, 51, 0]),
            ],
        );
        backend.insert("empty-scene", vec![solid(size, [0, 0, 0]); 2]);
        backend
    }

    #[test]
    fn writes_3d_poses_and_removes_intermediate() {
        let dir = tempfile::tempdir().unwrap();
        let output = lift_video(
            &backend(),
            &mut ColorExtractor,
            &mut FlatLifter,
            Path::new("clip"),
            dir.path(),
            "job42",
            1,
            &Silent,
            &CancelToken::default(),
        )
        .unwrap();

        assert_eq!(output.keypoints_json_path, dir.path().join("job42_3d_poses.json"));
        assert_eq!(output.generated_files(), vec![output.keypoints_json_path.clone()]);
        assert!(!dir.path().join("job42_2d.json").exists());

        let text = std::fs::read_to_string(&output.keypoints_json_path).unwrap();
        let sequence: LiftedSequence = serde_json::from_str(&text).unwrap();
        assert_eq!(sequence.frames, vec![0, 2]);
        assert_eq!(sequence.poses.len(), 2);
        assert_eq!(sequence.poses[0][0], [0.2, 0.4, 0.0]);
    }

    #[test]
    fn no_pose_is_an_error_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = lift_video(
            &backend(),
            &mut ColorExtractor,
            &mut FlatLifter,
            Path::new("empty-scene"),
            dir.path(),
            "none",
            1,
            &Silent,
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoPoseDetected(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_lift_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let err = lift_video(
            &backend(),
            &mut ColorExtractor,
            &mut NothingLifter,
            Path::new("clip"),
            dir.path(),
            "flat",
            1,
            &Silent,
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::LiftedPoseCount { expected: 2, got: 0 }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
