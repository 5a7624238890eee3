//! Seams to the pose models: 2D keypoint extraction and 2D to 3D lifting.

use crate::{error::Error, frame::Frame, pose::KeypointSet};

/// Finds at most one pose in a frame.
///
/// Failing to find a pose is `Ok(None)`, not an error. Implementations may
/// keep state across frames (tracking, smoothing), so each video or session
/// gets its own instance from an [`ExtractorFactory`].
pub trait KeypointExtractor: Send {
    fn extract(&mut self, frame: &Frame) -> Result<Option<KeypointSet>, Error>;
}

impl<E> KeypointExtractor for Box<E>
where
    E: KeypointExtractor + ?Sized,
{
    fn extract(&mut self, frame: &Frame) -> Result<Option<KeypointSet>, Error> {
        (**self).extract(frame)
    }
}

pub trait ExtractorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn KeypointExtractor>, Error>;
}

impl<F> ExtractorFactory for F
where
    F: Fn() -> Result<Box<dyn KeypointExtractor>, Error> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn KeypointExtractor>, Error> {
        self()
    }
}

/// One 3D pose: `(x, y, z)` per keypoint.
pub type Pose3d = Vec<[f32; 3]>;

/// Lifts a whole sequence of 2D poses at once; the model may look at
/// neighbouring frames.
pub trait PoseLifter: Send {
    fn lift(&mut self, poses: &[KeypointSet]) -> Result<Vec<Pose3d>, Error>;
}
