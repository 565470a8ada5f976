//! Vision and light shape generation.
//!
//! Every shape is built around the origin with its axis along
//! `facing_deg` (degrees, counterclockwise from +x). Callers translate the
//! result to the vision center.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::region::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    #[default]
    Circle,
    Square,
    Cone,
    Beam,
}

impl ShapeKind {
    pub fn name(self) -> &'static str {
        match self {
            ShapeKind::Circle => "circle",
            ShapeKind::Square => "square",
            ShapeKind::Cone => "cone",
            ShapeKind::Beam => "beam",
        }
    }

    pub fn parse(word: &str) -> Option<ShapeKind> {
        match word.to_ascii_lowercase().as_str() {
            "circle" => Some(ShapeKind::Circle),
            "square" => Some(ShapeKind::Square),
            "cone" => Some(ShapeKind::Cone),
            "beam" => Some(ShapeKind::Beam),
            _ => None,
        }
    }
}

/// Shape parameters shared by sight types and light components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeSpec {
    pub kind: ShapeKind,
    pub range: f64,
    /// Cone opening angle in degrees.
    pub arc_deg: f64,
    /// Beam width.
    pub width: f64,
    /// Rotation relative to the facing, in degrees.
    pub offset_deg: f64,
}

impl ShapeSpec {
    pub fn circle(range: f64) -> Self {
        ShapeSpec {
            kind: ShapeKind::Circle,
            range,
            arc_deg: 0.0,
            width: 0.0,
            offset_deg: 0.0,
        }
    }

    /// Build the shape around the origin. Non-positive or non-finite
    /// ranges produce an empty region.
    pub fn build(&self, facing_deg: f64, circle_segments: usize) -> Region {
        let r = self.range;
        if !(r.is_finite() && r > 0.0) {
            return Region::empty();
        }
        let heading = (facing_deg + self.offset_deg).to_radians();
        let segments = circle_segments.max(8);
        match self.kind {
            ShapeKind::Circle => Region::polygon(&circle_vertices(r, segments)),
            ShapeKind::Square => Region::polygon(&[(-r, -r), (r, -r), (r, r), (-r, r)]),
            ShapeKind::Cone => {
                let arc = self.arc_deg.clamp(0.0, 360.0);
                if arc >= 360.0 {
                    return Region::polygon(&circle_vertices(r, segments));
                }
                Region::polygon(&cone_vertices(r, heading, arc.to_radians(), segments))
            }
            ShapeKind::Beam => {
                let half_w = self.width / 2.0;
                if half_w <= 0.0 {
                    return Region::empty();
                }
                Region::polygon(&beam_vertices(r, half_w, heading))
            }
        }
    }
}

/// Regular polygon inscribed in the circle of radius `r`.
pub fn circle_vertices(r: f64, segments: usize) -> Vec<(f64, f64)> {
    let step = 2.0 * PI / segments as f64;
    (0..segments)
        .map(|i| {
            let a = step * i as f64;
            (r * a.cos(), r * a.sin())
        })
        .collect()
}

fn cone_vertices(r: f64, heading: f64, arc: f64, circle_segments: usize) -> Vec<(f64, f64)> {
    let steps = ((circle_segments as f64 * arc / (2.0 * PI)).ceil() as usize).max(2);
    let start = heading - arc / 2.0;
    let step = arc / steps as f64;
    let mut vertices = Vec::with_capacity(steps + 2);
    vertices.push((0.0, 0.0));
    for i in 0..=steps {
        let a = start + step * i as f64;
        vertices.push((r * a.cos(), r * a.sin()));
    }
    vertices
}

/// Rectangle of length `r` and half-width `half_w`, starting at the origin
/// and pointing along `heading`.
fn beam_vertices(r: f64, half_w: f64, heading: f64) -> Vec<(f64, f64)> {
    let cos_h = heading.cos();
    let sin_h = heading.sin();
    const LOCAL: [(f64, f64); 4] = [(0.0, -1.0), (1.0, -1.0), (1.0, 1.0), (0.0, 1.0)];
    LOCAL
        .iter()
        .map(|&(lx, ly)| {
            let x = lx * r;
            let y = ly * half_w;
            (x * cos_h - y * sin_h, x * sin_h + y * cos_h)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;

    fn spec(kind: ShapeKind, range: f64) -> ShapeSpec {
        ShapeSpec {
            kind,
            range,
            arc_deg: 90.0,
            width: 4.0,
            offset_deg: 0.0,
        }
    }

    #[test]
    fn circle_area_close_to_pi_r_squared() {
        let c = ShapeSpec::circle(30.0).build(0.0, 256);
        let expected = PI * 900.0;
        assert!((c.area() - expected).abs() / expected < 0.01);
    }

    #[test]
    fn square_spans_twice_range() {
        let s = spec(ShapeKind::Square, 5.0).build(0.0, 32);
        assert!((s.area() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn cone_points_along_facing() {
        let c = spec(ShapeKind::Cone, 10.0).build(90.0, 64);
        assert!(c.contains_point(coord! { x: 0.0, y: 5.0 }));
        assert!(!c.contains_point(coord! { x: 0.0, y: -5.0 }));
        assert!(!c.contains_point(coord! { x: 5.0, y: 0.5 }));
    }

    #[test]
    fn beam_respects_width_and_offset() {
        let mut s = spec(ShapeKind::Beam, 10.0);
        s.offset_deg = 180.0;
        let b = s.build(0.0, 32);
        assert!((b.area() - 40.0).abs() < 1e-9);
        assert!(b.contains_point(coord! { x: -5.0, y: 1.0 }));
        assert!(!b.contains_point(coord! { x: 5.0, y: 0.0 }));
    }

    #[test]
    fn zero_range_is_empty() {
        assert!(ShapeSpec::circle(0.0).build(0.0, 32).is_empty());
        assert!(spec(ShapeKind::Cone, -1.0).build(0.0, 32).is_empty());
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(ShapeKind::parse("CONE"), Some(ShapeKind::Cone));
        assert_eq!(ShapeKind::parse("hex"), None);
    }
}
