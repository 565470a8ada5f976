//! Campaign-wide sight types and light sources that tokens refer to by name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shape::ShapeKind;
use crate::syntax::{parse_lights, parse_sights};
use crate::types::{Light, LightKind, LightSource, LightSourceId, Paint, SightType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(default)]
    pub sight_types: BTreeMap<String, SightType>,
    #[serde(default)]
    pub light_sources: BTreeMap<LightSourceId, LightSource>,
    /// Used for tokens whose sight type is unset or unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sight: Option<String>,
}

impl Campaign {
    /// The stock sight types and a few common light sources.
    pub fn with_defaults() -> Self {
        let mut campaign = Campaign::default();

        let mut lowlight = SightType::new("Lowlight", ShapeKind::Circle, None);
        lowlight.multiplier = 2.0;
        let mut conic = SightType::new("Conic Vision", ShapeKind::Cone, None);
        conic.arc_deg = 120.0;
        let mut darkvision = SightType::new("Darkvision", ShapeKind::Circle, None);
        darkvision.personal_light = Some(LightSource::new(
            "Darkvision",
            LightKind::Normal,
            vec![Light::circle(60.0)],
        ));
        for sight in [
            SightType::new("Normal", ShapeKind::Circle, None),
            lowlight,
            SightType::new("Square Vision", ShapeKind::Square, None),
            SightType::new("Normal Vision - Short Range", ShapeKind::Circle, Some(10.0)),
            conic,
            darkvision,
        ] {
            campaign.put_sight_type(sight);
        }
        campaign.default_sight = Some("Normal".to_string());

        let flame = Paint::rgb(255, 170, 60);
        for source in [
            LightSource::new("Candle", LightKind::Normal, vec![Light::circle(5.0)]),
            LightSource::new(
                "Torch",
                LightKind::Normal,
                vec![Light::circle(20.0), Light::circle(40.0).with_paint(flame)],
            ),
            LightSource::new(
                "Lantern",
                LightKind::Normal,
                vec![Light::circle(30.0), Light::circle(60.0).with_paint(flame)],
            ),
        ] {
            campaign.put_light_source(source);
        }
        campaign
    }

    /// The named sight type, falling back to the default sight for an
    /// unset or unknown name.
    pub fn sight_type(&self, name: Option<&str>) -> Option<&SightType> {
        name.and_then(|n| self.sight_types.get(n)).or_else(|| {
            self.default_sight
                .as_deref()
                .and_then(|d| self.sight_types.get(d))
        })
    }

    pub fn light_source(&self, id: &LightSourceId) -> Option<&LightSource> {
        self.light_sources.get(id)
    }

    pub fn put_sight_type(&mut self, sight: SightType) -> Option<SightType> {
        self.sight_types.insert(sight.name.clone(), sight)
    }

    pub fn put_light_source(&mut self, source: LightSource) -> Option<LightSource> {
        self.light_sources.insert(source.id.clone(), source)
    }

    /// Add or replace sight types from definition text. Nothing changes
    /// when any line fails to parse.
    pub fn import_sights(&mut self, text: &str) -> Result<usize> {
        let sights = parse_sights(text)?;
        let count = sights.len();
        for sight in sights {
            self.put_sight_type(sight);
        }
        Ok(count)
    }

    /// Add or replace light sources from definition text, all or nothing.
    pub fn import_lights(&mut self, text: &str) -> Result<usize> {
        let sources = parse_lights(text)?;
        let count = sources.len();
        for source in sources {
            self.put_light_source(source);
        }
        Ok(count)
    }
}
