//! Light and aura resolution.
//!
//! A light source is resolved for one caster position and one viewing
//! sight. The sight's multiplier stretches normal lights (darkvision-style
//! sights see lights farther) but never auras. The combined shape is
//! occlusion-clipped once; every component is then cut down to it.

use geo::Coord;
use tracing::debug;

use crate::config::EngineConfig;
use crate::region::Region;
use crate::topology::TopologyIndex;
use crate::types::{DrawableLight, LightKind, LightSource, Paint, Player, SightType, Token};
use crate::visibility::visible_area;

/// A light source placed in the world.
#[derive(Debug, Clone, Copy)]
pub struct Emitter<'a> {
    pub source: &'a LightSource,
    pub center: Coord<f64>,
    pub facing_deg: f64,
    /// The viewer's own personal light (always drawn colored).
    pub personal: bool,
}

/// One light component after clipping.
#[derive(Debug, Clone, PartialEq)]
pub struct LitComponent {
    pub paint: Option<Paint>,
    pub gm_only: bool,
    pub owner_only: bool,
    pub area: Region,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightResolution {
    pub kind: LightKind,
    pub personal: bool,
    /// Occlusion-clipped union of all components.
    pub area: Region,
    pub components: Vec<LitComponent>,
}

impl LightResolution {
    fn is_normal(&self) -> bool {
        self.kind == LightKind::Normal
    }

    /// Painted components, or every component of a personal light.
    pub fn colored(&self) -> Vec<DrawableLight> {
        if !self.is_normal() {
            return Vec::new();
        }
        self.components
            .iter()
            .filter(|c| self.personal || c.paint.is_some())
            .filter(|c| !c.area.is_empty())
            .map(|c| DrawableLight {
                kind: LightKind::Normal,
                paint: c.paint,
                area: c.area.clone(),
            })
            .collect()
    }

    /// Unpainted components of a non-personal normal light.
    pub fn bright(&self) -> Vec<Region> {
        if !self.is_normal() || self.personal {
            return Vec::new();
        }
        self.components
            .iter()
            .filter(|c| c.paint.is_none() && !c.area.is_empty())
            .map(|c| c.area.clone())
            .collect()
    }
}

/// Resolve `emitter` as seen with `sight`. `None` without a sight, or when
/// the caster stands inside topology.
pub fn light_area(
    emitter: &Emitter<'_>,
    sight: Option<&SightType>,
    index: &TopologyIndex,
    config: &EngineConfig,
) -> Option<LightResolution> {
    let sight = sight?;
    let source = emitter.source;
    let multiplier = match source.kind {
        LightKind::Aura => 1.0,
        LightKind::Normal => sight.multiplier,
    };
    let origin = Coord { x: 0.0, y: 0.0 };

    // Bands: each component minus everything inside the previous ones.
    let mut inner = Region::empty();
    let mut bands = Vec::with_capacity(source.lights.len());
    for light in &source.lights {
        let raw = light
            .spec()
            .build(emitter.facing_deg, config.circle_segments);
        let band = raw.difference(&inner);
        inner = inner.union(&raw);
        bands.push(band.scale_about(multiplier, origin));
    }

    let combined = Region::merge_all(bands.iter().cloned());
    let area = if source.ignores_topology {
        combined.translate(emitter.center.x, emitter.center.y)
    } else {
        match visible_area(emitter.center, &combined, index) {
            Some(area) => area,
            None => {
                debug!(source = %source.id, "light caster inside topology");
                return None;
            }
        }
    };

    let components = source
        .lights
        .iter()
        .zip(bands)
        .map(|(light, band)| LitComponent {
            paint: light.paint,
            gm_only: light.gm_only,
            owner_only: light.owner_only,
            area: band
                .translate(emitter.center.x, emitter.center.y)
                .intersection(&area),
        })
        .collect();

    Some(LightResolution {
        kind: source.kind,
        personal: emitter.personal,
        area,
        components,
    })
}

/// Aura drawables of `bearer` that `player` may see.
pub fn aura_lights(
    resolution: &LightResolution,
    bearer: &Token,
    player: &Player,
    config: &EngineConfig,
) -> Vec<DrawableLight> {
    if resolution.kind != LightKind::Aura {
        return Vec::new();
    }
    let owner = bearer.is_owner(&player.name);
    if bearer.visible_only_to_owner && !player.owns(bearer) {
        return Vec::new();
    }
    let previewing = player.is_gm() && config.show_as_player;
    resolution
        .components
        .iter()
        .filter(|c| !(c.gm_only && !player.is_gm()))
        .filter(|c| !(previewing && (c.gm_only || !bearer.visible)))
        .filter(|c| !c.owner_only || owner || player.is_gm())
        .filter(|c| !c.area.is_empty())
        .map(|c| DrawableLight {
            kind: LightKind::Aura,
            paint: c.paint,
            area: c.area.clone(),
        })
        .collect()
}
