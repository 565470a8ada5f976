//! Fog-of-war exposure history.
//!
//! Each token accumulates the union of everything it has ever seen. The
//! history only grows until it is explicitly reset; the cache layer never
//! touches it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{VisionEngine, ZoneEvent};
use crate::error::{EngineError, Result};
use crate::region::Region;
use crate::types::{Point2D, TokenId, TokenKind};

#[derive(Debug, Default)]
pub struct ExposureTracker {
    histories: Mutex<HashMap<TokenId, Region>>,
}

impl ExposureTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<TokenId, Region>> {
        self.histories.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold `region` into the token's history and return the new total.
    pub fn record(&self, token: TokenId, region: &Region) -> Region {
        let mut histories = self.lock();
        let total = match histories.get(&token) {
            Some(seen) => seen.union(region),
            None => region.clone(),
        };
        histories.insert(token, total.clone());
        total
    }

    pub fn exposed_area(&self, token: TokenId) -> Region {
        self.lock().get(&token).cloned().unwrap_or_default()
    }

    pub fn reset(&self, token: TokenId) -> bool {
        self.lock().remove(&token).is_some()
    }

    /// Set each listed history to exactly the given region, or clear it
    /// for `None`, under a single lock.
    pub fn replace<I>(&self, histories: I)
    where
        I: IntoIterator<Item = (TokenId, Option<Region>)>,
    {
        let mut current = self.lock();
        for (token, area) in histories {
            match area {
                Some(area) => current.insert(token, area),
                None => current.remove(&token),
            };
        }
    }

    pub fn reset_all(&self) {
        self.lock().clear();
    }

    /// Union of the histories of `tokens`.
    pub fn combined<I>(&self, tokens: I) -> Region
    where
        I: IntoIterator<Item = TokenId>,
    {
        let histories = self.lock();
        let pieces: Vec<Region> = tokens
            .into_iter()
            .filter_map(|id| histories.get(&id).cloned())
            .collect();
        drop(histories);
        Region::merge_all(pieces)
    }

    pub fn snapshot(&self) -> ExposureSnapshot {
        let mut histories: Vec<TokenExposure> = self
            .lock()
            .iter()
            .map(|(&token, area)| TokenExposure {
                token,
                area: area.clone(),
            })
            .collect();
        histories.sort_by_key(|h| h.token);
        ExposureSnapshot { histories }
    }

    /// Replace every history with the snapshot's.
    pub fn restore(&self, snapshot: ExposureSnapshot) {
        let mut histories = self.lock();
        histories.clear();
        for entry in snapshot.histories {
            histories.insert(entry.token, entry.area);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenExposure {
    pub token: TokenId,
    pub area: Region,
}

/// Persistable form of every token's exposure history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    #[serde(default)]
    pub histories: Vec<TokenExposure>,
}

impl ExposureSnapshot {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Reveal operations that can be requested through the JSON interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExposureAction {
    ExposeVisibleArea { tokens: Vec<TokenId> },
    ExposePcArea,
    ExposeLastPath { token: TokenId, path: Vec<Point2D> },
    Reset { token: TokenId },
    ResetAll,
}

impl VisionEngine {
    pub fn exposed_area(&self, token: TokenId) -> Region {
        self.exposure.exposed_area(token)
    }

    pub fn record_exposure(&self, token: TokenId, region: &Region) -> Region {
        let total = self.exposure.record(token, region);
        self.notify(&ZoneEvent::FogChanged(vec![token]));
        total
    }

    pub fn reset_exposure(&self, token: TokenId) {
        if self.exposure.reset(token) {
            self.notify(&ZoneEvent::FogChanged(vec![token]));
        }
    }

    pub fn reset_all_exposure(&self) {
        self.exposure.reset_all();
        self.notify(&ZoneEvent::FogChanged(Vec::new()));
    }

    /// What each eligible token of `tokens` sees now. Tokens without sight,
    /// or hidden from the local player, are skipped.
    fn current_views(&self, tokens: &[TokenId]) -> Vec<(TokenId, Region)> {
        let model = self.read();
        let index = self.index(&model);
        tokens
            .iter()
            .filter_map(|&id| model.zone.token(id))
            .filter(|t| t.has_sight && (!t.visible_only_to_owner || self.player().owns(t)))
            .filter_map(|t| {
                self.visibility_of(&model, &index, t, true)
                    .map(|seen| (t.id, seen))
            })
            .collect()
    }

    /// Record what each of `tokens` currently sees. Tokens without sight,
    /// or hidden from the local player, are skipped. Returns the union of
    /// what was recorded.
    pub fn expose_visible_area(&self, tokens: &[TokenId]) -> Region {
        let views = self.current_views(tokens);
        for (id, seen) in &views {
            self.exposure.record(*id, seen);
        }
        debug!(tokens = views.len(), "exposed visible area");
        if views.is_empty() {
            return Region::empty();
        }
        let touched = views.iter().map(|(id, _)| *id).collect();
        self.notify(&ZoneEvent::FogChanged(touched));
        Region::merge_all(views.into_iter().map(|(_, seen)| seen))
    }

    /// Restart the history of every PC the local player owns from what it
    /// sees now. Each history is swapped in one step, so readers never see
    /// it emptied in between.
    pub fn expose_pc_area(&self) -> Region {
        let pcs: Vec<TokenId> = {
            let model = self.read();
            model
                .zone
                .tokens()
                .filter(|t| t.kind == TokenKind::Pc && t.has_sight && self.player().owns(t))
                .map(|t| t.id)
                .collect()
        };
        let views = self.current_views(&pcs);
        let mut histories: HashMap<TokenId, Option<Region>> =
            pcs.iter().map(|&id| (id, None)).collect();
        for (id, seen) in &views {
            histories.insert(*id, Some(seen.clone()));
        }
        self.exposure.replace(histories);
        if !pcs.is_empty() {
            self.notify(&ZoneEvent::FogChanged(pcs));
        }
        Region::merge_all(views.into_iter().map(|(_, seen)| seen))
    }

    /// Record what `token` would have seen at each point of `path`. The
    /// token itself does not move and its cached visibility is left alone.
    pub fn expose_last_path(&self, token: TokenId, path: &[Point2D]) -> Result<Region> {
        let mut exposed = Vec::new();
        {
            let model = self.read();
            let walker = model
                .zone
                .token(token)
                .ok_or(EngineError::UnknownToken(token))?;
            if !walker.has_sight {
                return Ok(Region::empty());
            }
            let index = self.index(&model);
            let mut ghost = walker.clone();
            for &step in path {
                ghost.position = step;
                if let Some(seen) = self.visibility_of(&model, &index, &ghost, false) {
                    self.exposure.record(token, &seen);
                    exposed.push(seen);
                }
            }
        }
        if !exposed.is_empty() {
            self.notify(&ZoneEvent::FogChanged(vec![token]));
        }
        Ok(Region::merge_all(exposed))
    }

    pub fn run_exposure_action(&self, action: &ExposureAction) -> Result<()> {
        match action {
            ExposureAction::ExposeVisibleArea { tokens } => {
                self.expose_visible_area(tokens);
            }
            ExposureAction::ExposePcArea => {
                self.expose_pc_area();
            }
            ExposureAction::ExposeLastPath { token, path } => {
                self.expose_last_path(*token, path)?;
            }
            ExposureAction::Reset { token } => self.reset_exposure(*token),
            ExposureAction::ResetAll => self.reset_all_exposure(),
        }
        Ok(())
    }
}
