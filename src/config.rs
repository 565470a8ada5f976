//! Engine configuration.
//!
//! Every field has a serde default, so `{}` is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;

fn default_circle_segments() -> usize {
    48
}

fn default_unlimited_range() -> f64 {
    10_000.0
}

fn default_topology_margin() -> f64 {
    10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Vertices used to approximate circular shapes.
    #[serde(default = "default_circle_segments")]
    pub circle_segments: usize,
    /// Range used for sight types without a distance.
    #[serde(default = "default_unlimited_range")]
    pub unlimited_range: f64,
    /// Open border kept around the topology when partitioning oceans.
    #[serde(default = "default_topology_margin")]
    pub topology_margin: f64,
    /// Each player only aggregates tokens they own.
    #[serde(default)]
    pub individual_views: bool,
    /// Single-user session; behaves like individual views.
    #[serde(default)]
    pub personal_server: bool,
    /// A GM previewing the map as players see it.
    #[serde(default)]
    pub show_as_player: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            circle_segments: default_circle_segments(),
            unlimited_range: default_unlimited_range(),
            topology_margin: default_topology_margin(),
            individual_views: false,
            personal_server: false,
            show_as_player: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Views are restricted to owned tokens.
    pub fn checks_ownership(&self) -> bool {
        self.individual_views || self.personal_server
    }
}
