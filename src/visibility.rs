//! Occlusion of a vision shape by topology.
//!
//! Every obstacle edge that faces the origin casts a shadow: the region
//! behind the edge as seen from the origin, pushed out past the farthest
//! point of the vision shape. The visible area is the shape minus the union
//! of those shadows.
//!
//! Shadows are merged incrementally, nearest edge first. Near edges cast
//! the widest shadows, so most far edges end up inside an existing blocked
//! piece and are skipped without any boolean op.

use std::f64::consts::PI;

use geo::{Coord, Rect};
use tracing::{debug, trace};

use crate::region::{rect_covers, rects_overlap, Region};
use crate::topology::{BoundarySegment, TopologyIndex};

/// Largest angle a single chord of a shadow's far cap may span.
const CAP_STEP: f64 = PI / 8.0;

/// An origin this close to an obstacle edge stands on it.
const ON_EDGE: f64 = 1e-7;

/// How far an origin standing on an edge is moved into open space before
/// casting shadows. Must exceed `ON_EDGE`.
const STEP_OFF: f64 = 1e-6;

/// Visible part of `vision` (a shape centered on the origin) seen from
/// `origin`. Returns `None` when the origin is inside an obstacle.
pub fn visible_area(origin: Coord<f64>, vision: &Region, index: &TopologyIndex) -> Option<Region> {
    let shape = vision.translate(origin.x, origin.y);
    let Some(window) = shape.bounds() else {
        return Some(Region::empty());
    };
    if shape.is_empty() {
        return Some(Region::empty());
    }
    let Some(ocean) = index.locate(origin) else {
        debug!(x = origin.x, y = origin.y, "origin inside topology; nothing visible");
        return None;
    };

    let origin = index
        .ocean(ocean)
        .map_or(origin, |o| step_off_edges(origin, o.segments()));
    let segments = index.facing_segments(ocean, origin, &window);
    if segments.is_empty() {
        return Some(shape);
    }

    let reach = farthest_corner(origin, &window) + 1.0;
    let blocked = merge_shadows(origin, &segments, reach);
    let visible = shape.difference(&blocked);
    debug_assert!(
        visible.difference(&shape).area() <= 1e-6 * shape.area().max(1.0),
        "visible area escapes its vision shape"
    );
    Some(visible)
}

/// Edges passing through the origin face neither way and would cast no
/// shadow, leaving their obstacle transparent. Move the origin a hair into
/// the open side of every such edge so they all face it.
fn step_off_edges(origin: Coord<f64>, segments: &[BoundarySegment]) -> Coord<f64> {
    let mut touching = segments
        .iter()
        .filter(|s| s.distance_squared(origin) <= ON_EDGE * ON_EDGE)
        .peekable();
    let Some(first) = touching.peek().map(|s| s.normal) else {
        return origin;
    };
    let (sx, sy) = touching.fold((0.0, 0.0), |(x, y), s| (x + s.normal.x, y + s.normal.y));
    let len = sx.hypot(sy);
    let (nx, ny) = if len > 1e-9 {
        (sx / len, sy / len)
    } else {
        (first.x, first.y)
    };
    trace!(x = origin.x, y = origin.y, "origin on an obstacle edge; stepping off");
    Coord {
        x: origin.x + nx * STEP_OFF,
        y: origin.y + ny * STEP_OFF,
    }
}

fn farthest_corner(origin: Coord<f64>, window: &Rect<f64>) -> f64 {
    let (min, max) = (window.min(), window.max());
    [(min.x, min.y), (max.x, min.y), (max.x, max.y), (min.x, max.y)]
        .iter()
        .map(|&(x, y)| (x - origin.x).hypot(y - origin.y))
        .fold(0.0, f64::max)
}

/// A blocked piece and its cached bounds.
struct Piece {
    area: Region,
    bounds: Rect<f64>,
}

impl Piece {
    fn new(area: Region) -> Option<Piece> {
        let bounds = area.bounds()?;
        Some(Piece { area, bounds })
    }

    fn covers(&self, segment: &BoundarySegment) -> bool {
        rect_covers(&self.bounds, &segment.bounds())
            && self.area.contains_segment(segment.start, segment.end)
    }
}

/// Union of the shadows of `segments`, which must be sorted nearest-first.
fn merge_shadows(origin: Coord<f64>, segments: &[BoundarySegment], reach: f64) -> Region {
    let mut pieces: Vec<Piece> = Vec::new();
    let mut skipped = 0usize;

    for segment in segments {
        if pieces.iter().any(|p| p.covers(segment)) {
            skipped += 1;
            continue;
        }
        let shadow = shadow_of(origin, segment, reach);
        let Some(shadow_bounds) = shadow.bounds() else {
            continue;
        };
        match pieces
            .iter()
            .position(|p| rects_overlap(&p.bounds, &shadow_bounds))
        {
            Some(pos) => {
                let piece = pieces.remove(pos);
                if let Some(merged) = Piece::new(piece.area.union(&shadow)) {
                    pieces.push(merged);
                }
            }
            None => {
                if let Some(piece) = Piece::new(shadow) {
                    pieces.push(piece);
                }
            }
        }
    }

    trace!(
        segments = segments.len(),
        skipped,
        pieces = pieces.len(),
        "merged shadows"
    );
    Region::merge_all(pieces.into_iter().map(|p| p.area))
}

/// Shadow cast by `segment` away from `origin`, reaching at least `reach`
/// from the origin in every direction it covers.
pub fn shadow_of(origin: Coord<f64>, segment: &BoundarySegment, reach: f64) -> Region {
    let a = segment.start;
    let b = segment.end;
    let (ax, ay) = (a.x - origin.x, a.y - origin.y);
    let (bx, by) = (b.x - origin.x, b.y - origin.y);

    // The origin sits on the open (left) side, so a -> b turns
    // counterclockwise around it by less than a half turn.
    let sweep = (ax * by - ay * bx).atan2(ax * bx + ay * by);
    if !(sweep > 0.0) {
        return Region::empty();
    }

    let radius = reach.max(ax.hypot(ay)).max(bx.hypot(by)) + 1.0;
    let steps = ((sweep / CAP_STEP).ceil() as usize).max(1);
    let step = sweep / steps as f64;
    // Push cap vertices out so every chord stays beyond `radius`.
    let far = radius / (step / 2.0).cos();
    let start = ay.atan2(ax);

    let mut ring = Vec::with_capacity(steps + 3);
    ring.push((a.x, a.y));
    ring.push((b.x, b.y));
    for i in (0..=steps).rev() {
        let angle = start + step * i as f64;
        ring.push((origin.x + far * angle.cos(), origin.y + far * angle.sin()));
    }
    Region::polygon(&ring)
}
