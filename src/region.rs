//! Polygonal region algebra.
//!
//! `Region` wraps a `geo::MultiPolygon` behind an `Arc`. It is a value:
//! every operation returns a new region and clones share storage, so a
//! region handed out of a cache can never be mutated by the caller.
//!
//! Boolean operations are guarded. Inputs are sanitized (non-finite and
//! zero-area polygons dropped) and a panic inside the kernel degrades to an
//! empty region instead of tearing down the whole view computation.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use geo::{
    Area, BooleanOps, BoundingRect, Contains, Coord, Intersects, Line, LineString, MapCoords,
    MultiPolygon, Polygon, Rect,
};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Polygons with less area than this are treated as degenerate.
pub const AREA_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "MultiPolygon<f64>", into = "MultiPolygon<f64>")]
pub struct Region(Arc<MultiPolygon<f64>>);

impl Region {
    pub fn empty() -> Self {
        Region(Arc::new(MultiPolygon::new(Vec::new())))
    }

    /// Axis-aligned rectangle spanning two corners.
    pub fn rect(min: Coord<f64>, max: Coord<f64>) -> Self {
        Self::from(Rect::new(min, max).to_polygon())
    }

    /// Simple polygon from an open or closed ring of vertices.
    pub fn polygon(vertices: &[(f64, f64)]) -> Self {
        let ring: LineString<f64> = vertices.iter().copied().collect();
        Self::from(Polygon::new(ring, Vec::new()))
    }

    pub fn polygons(&self) -> &[Polygon<f64>] {
        &self.0 .0
    }

    pub fn is_empty(&self) -> bool {
        self.0 .0.is_empty() || self.area() <= AREA_EPSILON
    }

    pub fn area(&self) -> f64 {
        self.0.unsigned_area()
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.0.bounding_rect()
    }

    /// True when both regions share storage (same cached value).
    pub fn ptr_eq(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Boundary points count as contained.
    pub fn contains_point(&self, point: Coord<f64>) -> bool {
        self.polygons().iter().any(|p| p.intersects(&point))
    }

    /// True if the segment from `a` to `b` lies inside a single polygon.
    pub fn contains_segment(&self, a: Coord<f64>, b: Coord<f64>) -> bool {
        let line = Line::new(a, b);
        self.polygons().iter().any(|p| p.contains(&line))
    }

    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        guarded("union", || self.0.union(other.0.as_ref()))
    }

    pub fn intersection(&self, other: &Region) -> Region {
        if self.is_empty() || other.is_empty() {
            return Region::empty();
        }
        if !bounds_overlap(self.bounds(), other.bounds()) {
            return Region::empty();
        }
        guarded("intersection", || self.0.intersection(other.0.as_ref()))
    }

    pub fn difference(&self, other: &Region) -> Region {
        if self.is_empty() {
            return Region::empty();
        }
        if other.is_empty() || !bounds_overlap(self.bounds(), other.bounds()) {
            return self.clone();
        }
        guarded("difference", || self.0.difference(other.0.as_ref()))
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Region {
        if dx == 0.0 && dy == 0.0 {
            return self.clone();
        }
        Region::from(self.0.map_coords(|c| Coord { x: c.x + dx, y: c.y + dy }))
    }

    /// Uniform scale about `origin`.
    pub fn scale_about(&self, factor: f64, origin: Coord<f64>) -> Region {
        if factor == 1.0 {
            return self.clone();
        }
        Region::from(self.0.map_coords(|c| Coord {
            x: origin.x + (c.x - origin.x) * factor,
            y: origin.y + (c.y - origin.y) * factor,
        }))
    }

    /// Area of the symmetric difference; zero for equal regions.
    pub fn symmetric_difference_area(&self, other: &Region) -> f64 {
        self.difference(other).area() + other.difference(self).area()
    }

    /// Union of many regions by repeated pairwise merging. Each round takes
    /// the two oldest pieces off the front and pushes their union to the
    /// back, so piece sizes grow evenly instead of one accumulator absorbing
    /// every small piece.
    pub fn merge_all<I>(regions: I) -> Region
    where
        I: IntoIterator<Item = Region>,
    {
        let mut queue: VecDeque<Region> =
            regions.into_iter().filter(|r| !r.is_empty()).collect();
        while queue.len() > 1 {
            if let (Some(a), Some(b)) = (queue.pop_front(), queue.pop_front()) {
                queue.push_back(a.union(&b));
            }
        }
        queue.pop_front().unwrap_or_default()
    }
}

impl Default for Region {
    fn default() -> Self {
        Region::empty()
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.0 == *other.0
    }
}

impl From<MultiPolygon<f64>> for Region {
    fn from(value: MultiPolygon<f64>) -> Self {
        Region(Arc::new(sanitize(value)))
    }
}

impl From<Polygon<f64>> for Region {
    fn from(value: Polygon<f64>) -> Self {
        Self::from(MultiPolygon::new(vec![value]))
    }
}

impl From<Region> for MultiPolygon<f64> {
    fn from(value: Region) -> Self {
        Arc::try_unwrap(value.0).unwrap_or_else(|shared| (*shared).clone())
    }
}

/// True when both bounds exist and overlap (touching counts).
pub fn bounds_overlap(a: Option<Rect<f64>>, b: Option<Rect<f64>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => rects_overlap(&a, &b),
        _ => false,
    }
}

pub fn rects_overlap(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x
        && b.min().x <= a.max().x
        && a.min().y <= b.max().y
        && b.min().y <= a.max().y
}

/// True if `outer` fully covers `inner`.
pub fn rect_covers(outer: &Rect<f64>, inner: &Rect<f64>) -> bool {
    outer.min().x <= inner.min().x
        && outer.min().y <= inner.min().y
        && outer.max().x >= inner.max().x
        && outer.max().y >= inner.max().y
}

fn polygon_is_finite(polygon: &Polygon<f64>) -> bool {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .flat_map(|ring| ring.0.iter())
        .all(|c| c.x.is_finite() && c.y.is_finite())
}

fn sanitize(mut value: MultiPolygon<f64>) -> MultiPolygon<f64> {
    let before = value.0.len();
    value.0.retain(|p| {
        p.exterior().0.len() >= 3 && polygon_is_finite(p) && p.unsigned_area() > AREA_EPSILON
    });
    if value.0.len() != before {
        trace!(dropped = before - value.0.len(), "dropped degenerate polygons");
    }
    value
}

fn guarded<F>(op: &'static str, f: F) -> Region
where
    F: FnOnce() -> MultiPolygon<f64>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Region::from(result),
        Err(_) => {
            warn!(op, "geometry kernel failed; treating result as empty");
            Region::empty()
        }
    }
}
