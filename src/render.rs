use crate::{
    annotate::{AnnotationSpec, ColorClass, FrameAnnotation},
    config::{ComparatorConfig, PipelineConfig},
    error::Error,
    frame::{Frame, FrameSize, Rgb},
    pose::{Keypoint, KeypointSet},
};

const OK_COLOR: Rgb = [0, 255, 0];
const WRONG_COLOR: Rgb = [255, 0, 0];
const REFERENCE_COLOR: Rgb = [255, 0, 0];
const GHOST_COLOR: Rgb = [255, 255, 255];
const SCORE_GOOD: Rgb = [0, 255, 0];
const SCORE_FAIR: Rgb = [255, 165, 0];
const SCORE_POOR: Rgb = [255, 0, 0];

#[derive(Clone, Copy)]
enum Style<'a> {
    Solid(Rgb),
    Classified(&'a AnnotationSpec),
    Ghost(f32),
}

impl Style<'_> {
    fn point(&self, index: usize) -> (Rgb, f32, bool) {
        match *self {
            Self::Solid(color) => (color, 1.0, false),
            Self::Classified(spec) => match spec.point_color(index) {
                Some(ColorClass::Wrong) => (WRONG_COLOR, 1.0, true),
                _ => (OK_COLOR, 1.0, false),
            },
            Self::Ghost(opacity) => (GHOST_COLOR, opacity, false),
        }
    }

    fn limb(&self, limb: (usize, usize)) -> (Rgb, f32) {
        match *self {
            Self::Solid(color) => (color, 1.0),
            Self::Classified(spec) => match spec.limb_color(limb) {
                Some(ColorClass::Wrong) => (WRONG_COLOR, 1.0),
                _ => (OK_COLOR, 1.0),
            },
            Self::Ghost(opacity) => (GHOST_COLOR, opacity),
        }
    }
}

/// Rasterizes skeletons and score bars onto frames.
#[derive(Debug, Clone)]
pub struct Renderer {
    topology: Vec<(usize, usize)>,
    visibility_threshold: f32,
    panel: FrameSize,
}

impl Renderer {
    pub fn new(comparator: &ComparatorConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            topology: comparator.topology.clone(),
            visibility_threshold: comparator.visibility_threshold,
            panel: pipeline.panel,
        }
    }

    /// Reference pane on the left, annotated user pane on the right, both
    /// scaled to the panel size.
    pub fn side_by_side(
        &self,
        reference: Option<&Frame>,
        reference_pose: Option<&KeypointSet>,
        user: &Frame,
        annotation: &FrameAnnotation<'_>,
    ) -> Result<Frame, Error> {
        let mut left = match reference {
            Some(frame) => frame.resized(self.panel)?,
            None => Frame::black(self.panel),
        };
        if let Some(pose) = reference_pose {
            self.draw_skeleton(&mut left, pose, Style::Solid(REFERENCE_COLOR));
        }

        let mut right = user.resized(self.panel)?;
        self.draw_annotation(&mut right, annotation);

        Frame::hstack(&left, &right)
    }

    /// The user's frame at its own size with flags, ghost and score.
    pub fn single_pane(&self, user: &Frame, annotation: &FrameAnnotation<'_>) -> Frame {
        let mut frame = user.clone();
        self.draw_annotation(&mut frame, annotation);
        frame
    }

    fn draw_annotation(&self, frame: &mut Frame, annotation: &FrameAnnotation<'_>) {
        if let Some(ghost) = annotation.ghost {
            self.draw_skeleton(frame, ghost.pose, Style::Ghost(ghost.opacity));
        }
        if let Some(pose) = annotation.pose {
            self.draw_skeleton(frame, pose, Style::Classified(&annotation.spec));
        }
        if annotation.detected {
            draw_score_bar(frame, annotation.score);
        }
    }

    fn draw_skeleton(&self, frame: &mut Frame, pose: &KeypointSet, style: Style<'_>) {
        let size = frame.size();
        let scale = (size.width.max(size.height) / 160).max(1) as i64;
        let thickness = if matches!(style, Style::Ghost(_)) { 1 } else { scale.min(2) };

        for &(a, b) in &self.topology {
            let (start, end) = match (pose.get(a), pose.get(b)) {
                (Some(start), Some(end)) => (start, end),
                _ => continue,
            };
            if !start.is_visible(self.visibility_threshold)
                || !end.is_visible(self.visibility_threshold)
            {
                continue;
            }
            let (color, alpha) = style.limb((a, b));
            if let Some((from, to)) = clip_segment(
                to_pixel(start, size),
                to_pixel(end, size),
                size,
                thickness,
            ) {
                draw_line(frame, from, to, thickness, color, alpha);
            }
        }

        let ring = scale * 5 / 2;
        for (index, keypoint) in pose.iter().enumerate() {
            if !keypoint.is_visible(self.visibility_threshold) {
                continue;
            }
            let center = match near_frame(to_pixel(keypoint, size), size, ring) {
                Some(center) => center,
                None => continue,
            };
            let (color, alpha, flagged) = style.point(index);
            if flagged {
                draw_ring(frame, center, ring, scale.min(2), color, alpha);
            }
            fill_circle(frame, center, scale, color, alpha);
        }
    }
}

pub(crate) fn score_color(score: f32) -> Rgb {
    if score > 0.7 {
        SCORE_GOOD
    } else if score > 0.4 {
        SCORE_FAIR
    } else {
        SCORE_POOR
    }
}

fn draw_score_bar(frame: &mut Frame, score: f32) {
    let size = frame.size();
    let height = i64::from((size.height / 40).max(2));
    let width = (f64::from(size.width) * f64::from(score.clamp(0.0, 1.0))).round() as i64;
    let top = i64::from(size.height) - height;
    let color = score_color(score);
    for y in top..i64::from(size.height) {
        for x in 0..width {
            frame.blend_pixel(x, y, color, 1.0);
        }
    }
}

fn to_pixel(keypoint: Keypoint, size: FrameSize) -> (f64, f64) {
    (
        f64::from(keypoint.x()) * f64::from(size.width),
        f64::from(keypoint.y()) * f64::from(size.height),
    )
}

/// Pixel for a point at most `margin` outside the frame.
fn near_frame((x, y): (f64, f64), size: FrameSize, margin: i64) -> Option<(i64, i64)> {
    let m = margin as f64;
    let inside = x >= -m
        && y >= -m
        && x < f64::from(size.width) + m
        && y < f64::from(size.height) + m;
    inside.then(|| (x as i64, y as i64))
}

/// Liang-Barsky clip of a segment against the frame grown by `margin`.
/// Endpoints are clamped to that box so far-away coordinates stay bounded.
fn clip_segment(
    start: (f64, f64),
    end: (f64, f64),
    size: FrameSize,
    margin: i64,
) -> Option<((i64, i64), (i64, i64))> {
    let m = margin as f64;
    let (min_x, min_y) = (-m, -m);
    let max_x = f64::from(size.width) - 1.0 + m;
    let max_y = f64::from(size.height) - 1.0 + m;
    let (dx, dy) = (end.0 - start.0, end.1 - start.1);

    let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
    for (p, q) in [
        (-dx, start.0 - min_x),
        (dx, max_x - start.0),
        (-dy, start.1 - min_y),
        (dy, max_y - start.1),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            if t > t1 {
                return None;
            }
            t0 = t0.max(t);
        } else {
            if t < t0 {
                return None;
            }
            t1 = t1.min(t);
        }
    }

    let at = |t: f64| {
        (
            (start.0 + t * dx).clamp(min_x, max_x).round() as i64,
            (start.1 + t * dy).clamp(min_y, max_y).round() as i64,
        )
    };
    Some((at(t0), at(t1)))
}

fn stamp(frame: &mut Frame, (x, y): (i64, i64), thickness: i64, color: Rgb, alpha: f32) {
    let half = thickness / 2;
    for dy in -half..thickness - half {
        for dx in -half..thickness - half {
            frame.blend_pixel(x + dx, y + dy, color, alpha);
        }
    }
}

/// Bresenham line.
fn draw_line(
    frame: &mut Frame,
    (x0, y0): (i64, i64),
    (x1, y1): (i64, i64),
    thickness: i64,
    color: Rgb,
    alpha: f32,
) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let (mut x, mut y) = (x0, y0);
    let mut err = dx + dy;
    loop {
        stamp(frame, (x, y), thickness, color, alpha);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn fill_circle(frame: &mut Frame, (cx, cy): (i64, i64), radius: i64, color: Rgb, alpha: f32) {
    let r2 = radius * radius;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= r2 {
                frame.blend_pixel(cx + dx, cy + dy, color, alpha);
            }
        }
    }
}

fn draw_ring(
    frame: &mut Frame,
    (cx, cy): (i64, i64),
    radius: i64,
    thickness: i64,
    color: Rgb,
    alpha: f32,
) {
    let outer = radius * radius;
    let inner = (radius - thickness).max(0).pow(2);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let d2 = dx * dx + dy * dy;
            if d2 <= outer && d2 > inner {
                frame.blend_pixel(cx + dx, cy + dy, color, alpha);
            }
        }
    }
}
