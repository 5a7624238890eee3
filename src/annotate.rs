use crate::{compare::ComparisonResult, pose::KeypointSet};
use serde::Serialize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorClass {
    Ok,
    Wrong,
}

impl ColorClass {
    fn from_flag(wrong: bool) -> Self {
        if wrong {
            Self::Wrong
        } else {
            Self::Ok
        }
    }
}

/// Draw classification for one pose: one class per keypoint and per limb.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AnnotationSpec {
    points: Vec<ColorClass>,
    limbs: Vec<((usize, usize), ColorClass)>,
}

impl AnnotationSpec {
    pub fn point_color(&self, index: usize) -> Option<ColorClass> {
        self.points.get(index).copied()
    }

    pub fn limb_color(&self, limb: (usize, usize)) -> Option<ColorClass> {
        self.limbs
            .iter()
            .find(|(edge, _)| *edge == limb)
            .map(|&(_, class)| class)
    }

    pub fn points(&self) -> impl Iterator<Item = (usize, ColorClass)> + '_ {
        self.points.iter().copied().enumerate()
    }

    pub fn limbs(&self) -> impl Iterator<Item = ((usize, usize), ColorClass)> + '_ {
        self.limbs.iter().copied()
    }
}

/// Classify every keypoint and limb; a limb is wrong when either endpoint
/// is flagged.
pub fn annotate(
    topology: &[(usize, usize)],
    keypoint_count: usize,
    result: &ComparisonResult,
) -> AnnotationSpec {
    let points = (0..keypoint_count)
        .map(|i| ColorClass::from_flag(result.is_wrong(i)))
        .collect();
    let limbs = topology
        .iter()
        .map(|&(a, b)| {
            (
                (a, b),
                ColorClass::from_flag(result.is_wrong(a) || result.is_wrong(b)),
            )
        })
        .collect();
    AnnotationSpec { points, limbs }
}

/// A reference pose drawn faintly over the user's frame.
#[derive(Debug, Clone, Copy)]
pub struct Ghost<'a> {
    pub pose: &'a KeypointSet,
    pub opacity: f32,
}

/// Everything a renderer needs to draw one annotated user pane.
#[derive(Debug, Clone)]
pub struct FrameAnnotation<'a> {
    pub pose: Option<&'a KeypointSet>,
    pub spec: AnnotationSpec,
    pub score: f32,
    pub detected: bool,
    pub ghost: Option<Ghost<'a>>,
}

impl<'a> FrameAnnotation<'a> {
    pub fn new(
        pose: Option<&'a KeypointSet>,
        result: &ComparisonResult,
        topology: &[(usize, usize)],
        keypoint_count: usize,
    ) -> Self {
        Self {
            pose,
            spec: annotate(topology, keypoint_count, result),
            score: result.score(),
            detected: result.detected(),
            ghost: None,
        }
    }

    pub fn with_ghost(mut self, pose: Option<&'a KeypointSet>, opacity: f32) -> Self {
        self.ghost = pose.map(|pose| Ghost {
            pose,
            opacity: opacity.clamp(0.0, 1.0),
        });
        self
    }
}
