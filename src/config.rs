use crate::{error::Error, frame::FrameSize, pose};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_THRESHOLD: f32 = 0.1;
pub const DEFAULT_VISIBILITY_THRESHOLD: f32 = 0.5;

/// Strictness and body model used to compare two poses.
///
/// Batch and live entry points each carry their own copy so they can be
/// tuned independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparatorConfig {
    /// Maximum normalized distance for a keypoint to count as correct.
    pub threshold: f32,
    pub keypoint_count: usize,
    /// Limbs as pairs of keypoint indices.
    pub topology: Vec<(usize, usize)>,
    /// Points at or below this visibility are not drawn.
    pub visibility_threshold: f32,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            keypoint_count: pose::NUM_LANDMARKS,
            topology: pose::constants::pose_topology(),
            visibility_threshold: DEFAULT_VISIBILITY_THRESHOLD,
        }
    }
}

impl ComparatorConfig {
    pub fn from_json_file<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::ReadConfig(e, path.to_owned()))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| Error::ParseConfig(e, path.to_owned()))?;
        config.validate()
    }

    pub fn with_threshold(mut self, threshold: f32) -> Result<Self, Error> {
        self.threshold = threshold;
        self.validate()
    }

    pub fn validate(self) -> Result<Self, Error> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(Error::InvalidThreshold(self.threshold));
        }
        if self.keypoint_count == 0 {
            return Err(Error::InvalidKeypointCount);
        }
        if let Some(&(a, b)) = self
            .topology
            .iter()
            .find(|&&(a, b)| a >= self.keypoint_count || b >= self.keypoint_count)
        {
            return Err(Error::TopologyIndexOutOfRange(a, b, self.keypoint_count));
        }
        Ok(self)
    }
}

/// Knobs for the batch and annotation pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Emit a progress event every this many frames.
    pub progress_every: usize,
    /// Size of each pane in the side-by-side output.
    pub panel: FrameSize,
    pub ghost_opacity: f32,
    /// Used when a source does not report its frame rate.
    pub fallback_fps: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            progress_every: 10,
            panel: FrameSize::new(640, 480),
            ghost_opacity: 0.4,
            fallback_fps: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Recording size used until the first frame reveals the real one.
    pub provisional_size: FrameSize,
    pub fps: f64,
    pub output_dir: PathBuf,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            provisional_size: FrameSize::new(640, 480),
            fps: 30.0,
            output_dir: PathBuf::from("recordings"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ComparatorConfig;
    use crate::error::Error;
    use std::io::Write;

    #[test]
    fn default_is_valid() {
        let config = ComparatorConfig::default().validate().unwrap();
        assert_eq!(config.keypoint_count, 33);
        assert_eq!(config.threshold, 0.1);
    }

    #[test]
    fn rejects_bad_threshold() {
        assert!(matches!(
            ComparatorConfig::default().with_threshold(-0.1),
            Err(Error::InvalidThreshold(_))
        ));
        assert!(ComparatorConfig::default()
            .with_threshold(f32::NAN)
            .is_err());
    }

    #[test]
    fn rejects_topology_outside_keypoints() {
        let config = ComparatorConfig {
            keypoint_count: 4,
            topology: vec![(0, 1), (2, 4)],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::TopologyIndexOutOfRange(2, 4, 4))
        ));
    }

    #[test]
    fn loads_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"threshold": 0.07, "keypoint_count": 3, "topology": [[0, 1], [1, 2]]}}"#
        )
        .unwrap();
        let config = ComparatorConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.threshold, 0.07);
        assert_eq!(config.topology, vec![(0, 1), (1, 2)]);
        assert_eq!(config.visibility_threshold, 0.5);
    }
}
