//! Blocking geometry and its ocean index.
//!
//! The index partitions the open part of the map into oceans: maximal
//! connected regions not covered by any obstacle. Each ocean keeps the
//! obstacle edges that border it, oriented so the open side lies to the
//! left and tagged with a unit normal pointing into the open region. A
//! visibility query only ever looks at the edges of the ocean holding its
//! origin, and back-face culls those against the origin.

use geo::algorithm::orient::{Direction, Orient};
use geo::{Coord, Intersects, LineString, Polygon, Rect};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::region::{rect_covers, rects_overlap, Region};

/// Tolerance for "lies on the working bounds" checks.
const BOUNDS_EPSILON: f64 = 1e-7;
/// Minimum distance from an edge's line for the origin to count as facing it.
const FACING_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub obstacles: Vec<Region>,
}

impl Topology {
    pub fn new(obstacles: Vec<Region>) -> Self {
        Topology { obstacles }
    }

    pub fn is_empty(&self) -> bool {
        self.obstacles.iter().all(Region::is_empty)
    }

    /// Union of all obstacles.
    pub fn blocked(&self) -> Region {
        merge_overlapping(self.obstacles.iter().filter(|o| !o.is_empty()).cloned())
    }
}

/// Union that first folds each region into an overlapping accumulator and
/// only then reduces the disjoint accumulators pairwise.
fn merge_overlapping<I>(regions: I) -> Region
where
    I: IntoIterator<Item = Region>,
{
    let mut pieces: Vec<(Region, Rect<f64>)> = Vec::new();
    for region in regions {
        let Some(bounds) = region.bounds() else {
            continue;
        };
        match pieces.iter().position(|(_, b)| rects_overlap(b, &bounds)) {
            Some(pos) => {
                let (existing, _) = pieces.remove(pos);
                let merged = existing.union(&region);
                if let Some(b) = merged.bounds() {
                    pieces.push((merged, b));
                }
            }
            None => pieces.push((region, bounds)),
        }
    }
    Region::merge_all(pieces.into_iter().map(|(r, _)| r))
}

/// An obstacle edge bordering an ocean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundarySegment {
    pub start: Coord<f64>,
    pub end: Coord<f64>,
    pub mid: Coord<f64>,
    /// Unit normal pointing into the open region.
    pub normal: Coord<f64>,
}

impl BoundarySegment {
    /// Edge from `start` to `end` with the open region on its left.
    fn new(start: Coord<f64>, end: Coord<f64>) -> Option<Self> {
        let dx = end.x - start.x;
        let dy = end.y - start.y;
        let len = (dx * dx + dy * dy).sqrt();
        if len <= f64::EPSILON {
            return None;
        }
        Some(BoundarySegment {
            start,
            end,
            mid: Coord {
                x: (start.x + end.x) / 2.0,
                y: (start.y + end.y) / 2.0,
            },
            normal: Coord {
                x: -dy / len,
                y: dx / len,
            },
        })
    }

    pub fn bounds(&self) -> Rect<f64> {
        Rect::new(self.start, self.end)
    }

    pub fn length(&self) -> f64 {
        (self.end.x - self.start.x).hypot(self.end.y - self.start.y)
    }

    /// True if `origin` is strictly on the open side of this edge.
    pub fn faces(&self, origin: Coord<f64>) -> bool {
        (origin.x - self.mid.x) * self.normal.x + (origin.y - self.mid.y) * self.normal.y
            > FACING_EPSILON
    }

    pub fn distance_squared(&self, p: Coord<f64>) -> f64 {
        point_to_segment_distance_squared(p.x, p.y, self.start.x, self.start.y, self.end.x, self.end.y)
    }
}

pub fn point_to_segment_distance_squared(
    px: f64,
    py: f64,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
) -> f64 {
    let dx = x2 - x1;
    let dy = y2 - y1;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return (px - x1) * (px - x1) + (py - y1) * (py - y1);
    }
    let t = (((px - x1) * dx + (py - y1) * dy) / len_sq).clamp(0.0, 1.0);
    let cx = x1 + t * dx;
    let cy = y1 + t * dy;
    (px - cx) * (px - cx) + (py - cy) * (py - cy)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OceanId(pub usize);

#[derive(Debug, Clone)]
pub struct Ocean {
    pub id: OceanId,
    /// `None` for the unbounded ocean of an empty topology.
    footprint: Option<Polygon<f64>>,
    bounds: Option<Rect<f64>>,
    /// Touches the working bounds, i.e. extends to infinity.
    pub outer: bool,
    segments: Vec<BoundarySegment>,
}

impl Ocean {
    fn unbounded() -> Self {
        Ocean {
            id: OceanId(0),
            footprint: None,
            bounds: None,
            outer: true,
            segments: Vec::new(),
        }
    }

    fn from_footprint(id: OceanId, footprint: &Polygon<f64>, working: &Rect<f64>) -> Self {
        let oriented = footprint.orient(Direction::Default);
        let mut segments = Vec::new();
        let mut outer = false;
        for ring in std::iter::once(oriented.exterior()).chain(oriented.interiors()) {
            outer |= collect_ring_segments(ring, working, &mut segments);
        }
        let bounds = geo::BoundingRect::bounding_rect(&oriented);
        Ocean {
            id,
            footprint: Some(oriented),
            bounds,
            outer,
            segments,
        }
    }

    pub fn segments(&self) -> &[BoundarySegment] {
        &self.segments
    }

    fn holds(&self, point: Coord<f64>) -> bool {
        match (&self.footprint, &self.bounds) {
            (None, _) => true,
            (Some(footprint), Some(bounds)) => {
                bounds.intersects(&point) && footprint.intersects(&point)
            }
            (Some(_), None) => false,
        }
    }
}

/// Push the obstacle edges of one ring; returns true if any edge lay on the
/// working bounds (those are not obstacles and are skipped).
fn collect_ring_segments(
    ring: &LineString<f64>,
    working: &Rect<f64>,
    out: &mut Vec<BoundarySegment>,
) -> bool {
    let mut touched = false;
    for line in ring.lines() {
        if on_working_bounds(line.start, line.end, working) {
            touched = true;
            continue;
        }
        if let Some(segment) = BoundarySegment::new(line.start, line.end) {
            out.push(segment);
        }
    }
    touched
}

fn on_working_bounds(a: Coord<f64>, b: Coord<f64>, working: &Rect<f64>) -> bool {
    let near = |u: f64, v: f64| (u - v).abs() <= BOUNDS_EPSILON;
    let (min, max) = (working.min(), working.max());
    (near(a.x, min.x) && near(b.x, min.x))
        || (near(a.x, max.x) && near(b.x, max.x))
        || (near(a.y, min.y) && near(b.y, min.y))
        || (near(a.y, max.y) && near(b.y, max.y))
}

/// Ocean partition of one topology snapshot. Immutable; rebuilt wholesale
/// whenever the topology changes.
#[derive(Debug, Clone)]
pub struct TopologyIndex {
    /// Blocked region bounds plus margin; `None` for an empty topology.
    working: Option<Rect<f64>>,
    oceans: Vec<Ocean>,
}

impl TopologyIndex {
    pub fn build(topology: &Topology, config: &EngineConfig) -> Self {
        let blocked = topology.blocked();
        let Some(blocked_bounds) = blocked.bounds() else {
            debug!("empty topology; single unbounded ocean");
            return TopologyIndex {
                working: None,
                oceans: vec![Ocean::unbounded()],
            };
        };
        let margin = config.topology_margin.max(1.0);
        let working = Rect::new(
            Coord {
                x: blocked_bounds.min().x - margin,
                y: blocked_bounds.min().y - margin,
            },
            Coord {
                x: blocked_bounds.max().x + margin,
                y: blocked_bounds.max().y + margin,
            },
        );
        let open = Region::rect(working.min(), working.max()).difference(&blocked);
        let oceans: Vec<Ocean> = open
            .polygons()
            .par_iter()
            .enumerate()
            .map(|(i, footprint)| Ocean::from_footprint(OceanId(i), footprint, &working))
            .collect();
        debug!(
            obstacles = topology.obstacles.len(),
            oceans = oceans.len(),
            segments = oceans.iter().map(|o| o.segments.len()).sum::<usize>(),
            "built topology index"
        );
        TopologyIndex {
            working: Some(working),
            oceans,
        }
    }

    pub fn oceans(&self) -> &[Ocean] {
        &self.oceans
    }

    pub fn ocean(&self, id: OceanId) -> Option<&Ocean> {
        self.oceans.get(id.0)
    }

    /// The ocean holding `point`. Points on an obstacle boundary belong to
    /// the adjoining ocean; points outside the working bounds belong to the
    /// outer sea; points strictly inside an obstacle have no ocean.
    pub fn locate(&self, point: Coord<f64>) -> Option<OceanId> {
        let Some(working) = &self.working else {
            return self.oceans.first().map(|o| o.id);
        };
        if !working.intersects(&point) {
            return self.oceans.iter().find(|o| o.outer).map(|o| o.id);
        }
        self.oceans.iter().find(|o| o.holds(point)).map(|o| o.id)
    }

    /// Edges of `ocean` whose open side faces `origin` and whose bounds meet
    /// `window`, nearest first.
    pub fn facing_segments(
        &self,
        ocean: OceanId,
        origin: Coord<f64>,
        window: &Rect<f64>,
    ) -> Vec<BoundarySegment> {
        let Some(ocean) = self.ocean(ocean) else {
            return Vec::new();
        };
        let mut facing: Vec<(f64, BoundarySegment)> = ocean
            .segments
            .iter()
            .filter(|s| s.faces(origin) && rects_overlap(&s.bounds(), window))
            .map(|s| (s.distance_squared(origin), *s))
            .collect();
        facing.sort_by(|a, b| a.0.total_cmp(&b.0));
        facing.into_iter().map(|(_, s)| s).collect()
    }

    /// True if the working bounds cover `rect` (no topology lies outside).
    pub fn covers(&self, rect: &Rect<f64>) -> bool {
        self.working.as_ref().map_or(true, |w| rect_covers(w, rect))
    }
}
