//! The vision engine: model owner, cache front end and query surface.
//!
//! Mutations go through setters that apply the change, invalidate the
//! affected cache entries while still holding the model write lock, and
//! notify listeners once the lock is released. Queries hold the model read
//! lock for their whole computation, so a cached value is always derived
//! from one consistent model state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{Invalidation, LightKey, VisionCache};
use crate::campaign::Campaign;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fog::{ExposureAction, ExposureSnapshot, ExposureTracker};
use crate::light::{aura_lights, light_area, Emitter, LightResolution};
use crate::region::{rects_overlap, Region};
use crate::shape::ShapeKind;
use crate::topology::{Topology, TopologyIndex};
use crate::types::{
    DrawableLight, LightKind, LightSource, LightSourceId, Player, SightType, Token, TokenId,
    TokenKind, ViewKey, VisionType,
};
use crate::visibility::visible_area;
use crate::zone::Zone;

/// Change notifications raised by the engine's setters.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEvent {
    TopologyChanged,
    TokensAdded(Vec<TokenId>),
    TokensRemoved(Vec<TokenId>),
    TokensChanged(Vec<TokenId>),
    FogChanged(Vec<TokenId>),
    VisionTypeChanged(VisionType),
    CampaignChanged,
}

type Listener = Arc<dyn Fn(&ZoneEvent) + Send + Sync>;

pub(crate) struct Model {
    pub(crate) zone: Zone,
    pub(crate) campaign: Campaign,
}

pub struct VisionEngine {
    config: EngineConfig,
    player: Player,
    model: RwLock<Model>,
    pub(crate) cache: VisionCache,
    pub(crate) exposure: ExposureTracker,
    listeners: Mutex<Vec<Listener>>,
}

impl VisionEngine {
    pub fn new(config: EngineConfig, player: Player, campaign: Campaign, zone: Zone) -> Self {
        VisionEngine {
            config,
            player,
            model: RwLock::new(Model { zone, campaign }),
            cache: VisionCache::new(),
            exposure: ExposureTracker::default(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Model> {
        self.model.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Model> {
        self.model.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn zone(&self) -> Zone {
        self.read().zone.clone()
    }

    pub fn campaign(&self) -> Campaign {
        self.read().campaign.clone()
    }

    pub fn token(&self, id: TokenId) -> Option<Token> {
        self.read().zone.token(id).cloned()
    }

    /// Listeners run after the change is applied and the cache is
    /// consistent, with no engine lock held, so they may call back into
    /// the engine.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ZoneEvent) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub(crate) fn notify(&self, event: &ZoneEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener(event);
        }
    }

    /// Apply an infallible change, evict what it affects, then notify.
    fn commit<F>(&self, change: F)
    where
        F: FnOnce(&mut Model) -> (Invalidation, ZoneEvent),
    {
        let event = {
            let mut model = self.write();
            let (invalidation, event) = change(&mut *model);
            self.cache.invalidate(&invalidation);
            event
        };
        self.notify(&event);
    }

    /// Like `commit`, for changes that can be rejected. Nothing is
    /// invalidated or notified on error.
    fn try_commit<R, F>(&self, change: F) -> Result<R>
    where
        F: FnOnce(&mut Model) -> Result<(R, Invalidation, ZoneEvent)>,
    {
        let (value, event) = {
            let mut model = self.write();
            let (value, invalidation, event) = change(&mut *model)?;
            self.cache.invalidate(&invalidation);
            (value, event)
        };
        self.notify(&event);
        Ok(value)
    }

    // -- Setters ---------------------------------------------------

    pub fn set_topology(&self, topology: Topology) {
        self.commit(|model| {
            model.zone.topology = topology;
            (Invalidation::Topology, ZoneEvent::TopologyChanged)
        });
    }

    pub fn add_obstacle(&self, obstacle: Region) {
        self.commit(|model| {
            model.zone.topology.obstacles.push(obstacle);
            (Invalidation::Topology, ZoneEvent::TopologyChanged)
        });
    }

    /// Insert or replace a token.
    pub fn put_token(&self, token: Token) {
        self.commit(|model| {
            let id = token.id;
            let carries = token.has_light_sources();
            let previous = model.zone.put_token(token);
            let carried = previous.as_ref().is_some_and(Token::has_light_sources);
            let event = if previous.is_some() {
                ZoneEvent::TokensChanged(vec![id])
            } else {
                ZoneEvent::TokensAdded(vec![id])
            };
            let invalidation = Invalidation::Token {
                id,
                carries_light: carries || carried,
            };
            (invalidation, event)
        });
    }

    pub fn remove_token(&self, id: TokenId) -> Result<Token> {
        self.try_commit(|model| {
            let token = model
                .zone
                .remove_token(id)
                .ok_or(EngineError::UnknownToken(id))?;
            let invalidation = Invalidation::Token {
                id,
                carries_light: token.has_light_sources(),
            };
            Ok((token, invalidation, ZoneEvent::TokensRemoved(vec![id])))
        })
    }

    /// Edit a token in place.
    pub fn update_token<F>(&self, id: TokenId, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Token),
    {
        self.try_commit(|model| {
            let token = model
                .zone
                .tokens
                .get_mut(&id)
                .ok_or(EngineError::UnknownToken(id))?;
            let carried = token.has_light_sources();
            edit(token);
            // The map key is authoritative.
            token.id = id;
            let invalidation = Invalidation::Token {
                id,
                carries_light: carried || token.has_light_sources(),
            };
            Ok(((), invalidation, ZoneEvent::TokensChanged(vec![id])))
        })
    }

    pub fn move_token(&self, id: TokenId, x: f64, y: f64) -> Result<()> {
        self.update_token(id, |token| {
            token.position.x = x;
            token.position.y = y;
        })
    }

    pub fn set_vision_type(&self, vision_type: VisionType) {
        self.commit(|model| {
            model.zone.vision_type = vision_type;
            (
                Invalidation::VisionType,
                ZoneEvent::VisionTypeChanged(vision_type),
            )
        });
    }

    pub fn set_campaign(&self, campaign: Campaign) {
        self.commit(|model| {
            model.campaign = campaign;
            (Invalidation::Campaign, ZoneEvent::CampaignChanged)
        });
    }

    pub fn put_sight_type(&self, sight: SightType) {
        self.commit(|model| {
            model.campaign.put_sight_type(sight);
            (Invalidation::Campaign, ZoneEvent::CampaignChanged)
        });
    }

    pub fn put_light_source(&self, source: LightSource) {
        self.commit(|model| {
            model.campaign.put_light_source(source);
            (Invalidation::Campaign, ZoneEvent::CampaignChanged)
        });
    }

    pub fn remove_light_source(&self, id: &LightSourceId) -> Result<LightSource> {
        self.try_commit(|model| {
            let source = model
                .campaign
                .light_sources
                .remove(id)
                .ok_or_else(|| EngineError::UnknownLightSource(id.clone()))?;
            Ok((source, Invalidation::Campaign, ZoneEvent::CampaignChanged))
        })
    }

    // -- Queries ---------------------------------------------------

    pub(crate) fn index(&self, model: &Model) -> Arc<TopologyIndex> {
        self.cache
            .index_or_build(|| TopologyIndex::build(&model.zone.topology, &self.config))
    }

    /// True when the zone limits what players see.
    pub fn is_using_vision(&self) -> bool {
        let model = self.read();
        model.zone.vision_type != VisionType::Off && model.zone.tokens().any(|t| t.has_sight)
    }

    /// What `id` sees right now. `None` when the token is unknown, has no
    /// sight or stands inside topology.
    pub fn token_visibility(&self, id: TokenId) -> Option<Region> {
        let model = self.read();
        let token = model.zone.token(id)?;
        let index = self.index(&model);
        self.visibility_of(&model, &index, token, true)
    }

    /// Union of what every token in the view sees. Never absent.
    pub fn visible_area(&self, key: &ViewKey) -> Region {
        let model = self.read();
        self.view_area(&model, key)
    }

    pub(crate) fn view_area(&self, model: &Model, key: &ViewKey) -> Region {
        let index = self.index(model);
        self.cache.views.get_or_insert_with(key.clone(), || {
            let tokens = self.view_tokens(model, key);
            let regions: Vec<Region> = tokens
                .par_iter()
                .filter_map(|t| self.visibility_of(model, &index, t, true))
                .collect();
            debug!(tokens = tokens.len(), gm = key.is_gm_view(), "view computed");
            Region::merge_all(regions)
        })
    }

    /// Colored normal lights first, then auras.
    pub fn drawable_lights(&self, key: &ViewKey) -> Vec<DrawableLight> {
        let model = self.read();
        let index = self.index(&model);
        let mut drawables = Vec::new();
        self.for_each_view_light(&model, &index, key, |res| drawables.extend(res.colored()));

        for bearer in model.zone.light_bearers(&model.campaign, LightKind::Aura) {
            if !bearer.visible && !self.player.is_gm() {
                continue;
            }
            for res in self.auras_for(&model, &index, bearer).iter() {
                drawables.extend(aura_lights(res, bearer, &self.player, &self.config));
            }
        }
        drawables
    }

    /// Unpainted normal light regions reaching the view's tokens.
    pub fn bright_lights(&self, key: &ViewKey) -> Vec<Region> {
        let model = self.read();
        let index = self.index(&model);
        let mut bright = Vec::new();
        self.for_each_view_light(&model, &index, key, |res| bright.extend(res.bright()));
        bright
    }

    pub(crate) fn visibility_of(
        &self,
        model: &Model,
        index: &TopologyIndex,
        token: &Token,
        memoize: bool,
    ) -> Option<Region> {
        if memoize {
            self.cache.visibility.get_or_insert_with(token.id, || {
                self.compute_visibility(model, index, token, true)
            })
        } else {
            self.compute_visibility(model, index, token, false)
        }
    }

    fn compute_visibility(
        &self,
        model: &Model,
        index: &TopologyIndex,
        token: &Token,
        memoize: bool,
    ) -> Option<Region> {
        if !token.has_sight {
            return None;
        }
        let Some(sight) = model.campaign.sight_type(token.sight_type.as_deref()) else {
            debug!(token = %token.id, sight = ?token.sight_type, "sight type not registered");
            return None;
        };
        let raw = if memoize {
            self.cache
                .raw
                .get_or_insert_with(token.id, || self.raw_visibility(index, token, sight))
        } else {
            self.raw_visibility(index, token, sight)
        }?;
        if model.zone.vision_type != VisionType::Night {
            return Some(raw);
        }
        let Some(raw_bounds) = raw.bounds() else {
            return Some(raw);
        };

        let mut lit = Vec::new();
        for bearer in self.light_bearers(model, token) {
            let resolutions = if !memoize && bearer.id == token.id {
                Arc::new(self.resolve_lights(model, index, bearer, sight))
            } else {
                self.lights_for(model, index, bearer, sight)
            };
            for res in resolutions.iter() {
                if res
                    .area
                    .bounds()
                    .is_some_and(|b| rects_overlap(&b, &raw_bounds))
                {
                    lit.push(raw.intersection(&res.area));
                }
            }
        }
        for res in self.personal_lights(index, token, sight, memoize).iter() {
            lit.push(raw.intersection(&res.area));
        }
        Some(Region::merge_all(lit))
    }

    fn raw_visibility(&self, index: &TopologyIndex, token: &Token, sight: &SightType) -> Option<Region> {
        let shape = sight
            .spec(self.config.unlimited_range)
            .build(token.facing_deg, self.config.circle_segments);
        visible_area(token.center(), &shape, index)
    }

    /// Tokens whose normal lights count for `viewer`. A zone copy of the
    /// viewer is replaced by `viewer` itself, which may sit elsewhere.
    fn light_bearers<'a>(&self, model: &'a Model, viewer: &'a Token) -> Vec<&'a Token> {
        let sees_hidden = self.player.is_gm() && !self.config.show_as_player;
        let mut bearers: Vec<&Token> = model
            .zone
            .light_bearers(&model.campaign, LightKind::Normal)
            .filter(|t| t.id != viewer.id)
            .filter(|t| !t.visible_only_to_owner || self.player.owns(t))
            .filter(|t| t.visible || sees_hidden)
            .collect();
        if viewer.has_light_sources() {
            bearers.push(viewer);
        }
        bearers
    }

    fn resolve_lights(
        &self,
        model: &Model,
        index: &TopologyIndex,
        bearer: &Token,
        sight: &SightType,
    ) -> Vec<LightResolution> {
        self.resolve_attached(model, index, bearer, Some(sight), LightKind::Normal)
    }

    fn resolve_attached(
        &self,
        model: &Model,
        index: &TopologyIndex,
        bearer: &Token,
        sight: Option<&SightType>,
        kind: LightKind,
    ) -> Vec<LightResolution> {
        bearer
            .lights
            .iter()
            .filter_map(|attached| {
                let Some(source) = model.campaign.light_source(&attached.source) else {
                    debug!(token = %bearer.id, source = %attached.source, "light source not registered");
                    return None;
                };
                if source.kind != kind {
                    return None;
                }
                let emitter = Emitter {
                    source,
                    center: bearer.center(),
                    facing_deg: attached.facing_deg.unwrap_or(bearer.facing_deg),
                    personal: false,
                };
                light_area(&emitter, sight, index, &self.config)
            })
            .collect()
    }

    fn lights_for(
        &self,
        model: &Model,
        index: &TopologyIndex,
        bearer: &Token,
        sight: &SightType,
    ) -> Arc<Vec<LightResolution>> {
        let key = LightKey {
            bearer: bearer.id,
            sight: sight.name.clone(),
            personal: false,
        };
        self.cache.lights.get_or_insert_with(key, || {
            Arc::new(self.resolve_lights(model, index, bearer, sight))
        })
    }

    fn personal_lights(
        &self,
        index: &TopologyIndex,
        token: &Token,
        sight: &SightType,
        memoize: bool,
    ) -> Arc<Vec<LightResolution>> {
        let resolve = || {
            let resolved = sight.personal_light.as_ref().and_then(|source| {
                let emitter = Emitter {
                    source,
                    center: token.center(),
                    facing_deg: token.facing_deg,
                    personal: true,
                };
                light_area(&emitter, Some(sight), index, &self.config)
            });
            Arc::new(resolved.into_iter().collect::<Vec<_>>())
        };
        if !memoize {
            return resolve();
        }
        let key = LightKey {
            bearer: token.id,
            sight: sight.name.clone(),
            personal: true,
        };
        self.cache.lights.get_or_insert_with(key, resolve)
    }

    fn auras_for(&self, model: &Model, index: &TopologyIndex, bearer: &Token) -> Arc<Vec<LightResolution>> {
        self.cache.auras.get_or_insert_with(bearer.id, || {
            // Auras are not scaled by sight; any sight resolves them.
            let unit = SightType::new("", ShapeKind::Circle, None);
            Arc::new(self.resolve_attached(model, index, bearer, Some(&unit), LightKind::Aura))
        })
    }

    /// Each normal light resolution reaching a token of the view, once per
    /// (bearer, sight) pair, plus each viewer's personal light. Only night
    /// zones have lights to draw.
    fn for_each_view_light<F>(&self, model: &Model, index: &TopologyIndex, key: &ViewKey, mut visit: F)
    where
        F: FnMut(&LightResolution),
    {
        if model.zone.vision_type != VisionType::Night {
            return;
        }
        let mut seen: HashSet<(TokenId, String)> = HashSet::new();
        for viewer in self.view_tokens(model, key) {
            let Some(sight) = model.campaign.sight_type(viewer.sight_type.as_deref()) else {
                continue;
            };
            for bearer in self.light_bearers(model, viewer) {
                if !seen.insert((bearer.id, sight.name.clone())) {
                    continue;
                }
                for res in self.lights_for(model, index, bearer, sight).iter() {
                    visit(res);
                }
            }
            for res in self.personal_lights(index, viewer, sight, true).iter() {
                visit(res);
            }
        }
    }

    /// Tokens whose vision makes up `key`'s view, after role and
    /// ownership filtering.
    pub(crate) fn view_tokens<'a>(&self, model: &'a Model, key: &ViewKey) -> Vec<&'a Token> {
        let gm_view = key.is_gm_view();
        let candidates: Vec<&Token> = match &key.tokens {
            Some(ids) => ids.iter().filter_map(|id| model.zone.token(*id)).collect(),
            None => model
                .zone
                .tokens()
                .filter(|t| t.has_sight && (gm_view || t.visible))
                .collect(),
        };
        candidates
            .into_iter()
            .filter(|t| t.has_sight)
            .filter(|t| {
                let ours = self.player.owns(t);
                if self.config.checks_ownership() {
                    if !ours {
                        return false;
                    }
                } else if !gm_view && (t.kind != TokenKind::Pc || self.player.is_gm()) {
                    return false;
                }
                !t.visible_only_to_owner || ours
            })
            .collect()
    }
}

// -- JSON interchange --------------------------------------------------

fn default_view() -> ViewKey {
    ViewKey::gm()
}

fn default_player() -> Player {
    Player::new("gm", crate::types::Role::Gm)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default)]
    pub config: EngineConfig,
    #[serde(default = "Campaign::with_defaults")]
    pub campaign: Campaign,
    /// Sight definition text merged into `campaign`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sight_definitions: Option<String>,
    /// Light definition text merged into `campaign`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_definitions: Option<String>,
    #[serde(default)]
    pub zone: Zone,
    #[serde(default = "default_player")]
    pub player: Player,
    #[serde(default = "default_view")]
    pub view: ViewKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<ExposureSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ExposureAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub visible_area: Region,
    pub drawable_lights: Vec<DrawableLight>,
    pub bright_lights: Vec<Region>,
    /// Combined exposure history of the view's tokens.
    pub exposed_area: Region,
    pub exposure: ExposureSnapshot,
}

/// One-shot evaluation: build an engine from the request, run its exposure
/// actions in order, then answer for the requested view.
pub fn evaluate(request: EvaluateRequest) -> Result<EvaluateResponse> {
    let mut campaign = request.campaign;
    if let Some(text) = &request.sight_definitions {
        campaign.import_sights(text)?;
    }
    if let Some(text) = &request.light_definitions {
        campaign.import_lights(text)?;
    }
    let engine = VisionEngine::new(request.config, request.player, campaign, request.zone);
    if let Some(snapshot) = request.exposure {
        engine.exposure.restore(snapshot);
    }
    for action in &request.actions {
        engine.run_exposure_action(action)?;
    }
    let view = &request.view;
    let view_ids: Vec<TokenId> = {
        let model = engine.read();
        engine.view_tokens(&model, view).iter().map(|t| t.id).collect()
    };
    Ok(EvaluateResponse {
        visible_area: engine.visible_area(view),
        drawable_lights: engine.drawable_lights(view),
        bright_lights: engine.bright_lights(view),
        exposed_area: engine.exposure.combined(view_ids),
        exposure: engine.exposure.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Pcg32;
    use crate::types::{AttachedLight, Light, Role};
    use geo::coord;
    use std::f64::consts::PI;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn square(x: f64, y: f64, size: f64) -> Region {
        Region::rect(coord! { x: x, y: y }, coord! { x: x + size, y: y + size })
    }

    fn campaign() -> Campaign {
        let mut campaign = Campaign::default();
        campaign.put_sight_type(SightType::new("Normal", ShapeKind::Circle, Some(30.0)));
        let mut dark = SightType::new("Dark", ShapeKind::Circle, Some(30.0));
        dark.personal_light = Some(LightSource::new(
            "Dark",
            LightKind::Normal,
            vec![Light::circle(5.0)],
        ));
        campaign.put_sight_type(dark);
        campaign.put_light_source(LightSource::new(
            "Torch",
            LightKind::Normal,
            vec![Light::circle(10.0)],
        ));
        campaign.put_light_source(LightSource::new(
            "Aura",
            LightKind::Aura,
            vec![Light::circle(4.0).with_paint(crate::types::Paint::rgb(0, 0, 255))],
        ));
        campaign
    }

    /// `VISION_LOG=trace cargo test` shows cache misses and evictions.
    fn init_logging() {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::EnvFilter;

        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_env("VISION_LOG").unwrap_or_else(|_| EnvFilter::new("off")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    }

    fn config() -> EngineConfig {
        EngineConfig {
            circle_segments: 64,
            ..EngineConfig::default()
        }
    }

    fn engine_with(player: Player, zone: Zone) -> VisionEngine {
        VisionEngine::new(config(), player, campaign(), zone)
    }

    fn alice() -> Player {
        Player::new("alice", Role::Player)
    }

    fn gm() -> Player {
        Player::new("gm", Role::Gm)
    }

    fn torch_bearer(id: u64, x: f64, y: f64) -> Token {
        let mut token = Token::new(id, x, y);
        token.lights.push(AttachedLight::new(LightSourceId::new("Torch")));
        token
    }

    fn circle_at(x: f64, y: f64, r: f64) -> Region {
        crate::shape::ShapeSpec::circle(r)
            .build(0.0, config().circle_segments)
            .translate(x, y)
    }

    #[test]
    fn open_map_token_sees_its_circle() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 50.0, 50.0, "Normal", "alice"));
        let engine = engine_with(alice(), zone);
        let vis = engine.token_visibility(TokenId(1)).expect("visible");
        assert!(vis.symmetric_difference_area(&circle_at(50.0, 50.0, 30.0)) < 1e-6);
        let expected = PI * 900.0;
        assert!((vis.area() - expected).abs() / expected < 0.01);
    }

    #[test]
    fn square_between_token_and_point_shadows_it() {
        let zone = Zone::new(Topology::new(vec![square(60.0, 45.0, 10.0)]), VisionType::Day);
        let engine = engine_with(alice(), zone);
        engine.put_token(Token::pc(1, 50.0, 50.0, "Normal", "alice"));
        let vis = engine.visible_area(&ViewKey::player());
        assert!(!vis.contains_point(coord! { x: 75.0, y: 50.0 }));
        assert!(vis.contains_point(coord! { x: 65.0, y: 62.0 }));
        assert!(vis.contains_point(coord! { x: 65.0, y: 38.0 }));
    }

    #[test]
    fn player_view_is_union_of_filtered_tokens() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        zone.put_token(Token::pc(2, 100.0, 0.0, "Normal", "alice"));
        let mut npc = Token::pc(3, 200.0, 0.0, "Normal", "alice");
        npc.kind = TokenKind::Npc;
        zone.put_token(npc);
        let mut secret = Token::pc(4, 300.0, 0.0, "Normal", "bob");
        secret.visible_only_to_owner = true;
        zone.put_token(secret);
        let engine = engine_with(alice(), zone);

        let a = engine.token_visibility(TokenId(1)).expect("a");
        let b = engine.token_visibility(TokenId(2)).expect("b");
        let view = engine.visible_area(&ViewKey::for_tokens(
            Role::Player,
            [TokenId(1), TokenId(2), TokenId(3), TokenId(4)],
        ));
        assert!(view.symmetric_difference_area(&a.union(&b)) < 1e-6);

        let all = engine.visible_area(&ViewKey::player());
        assert!(all.symmetric_difference_area(&view) < 1e-6);
    }

    #[test]
    fn gm_view_includes_npcs() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let mut npc = Token::pc(2, 100.0, 0.0, "Normal", "alice");
        npc.kind = TokenKind::Npc;
        zone.put_token(npc);
        let engine = engine_with(gm(), zone);
        let view = engine.visible_area(&ViewKey::gm());
        assert!(view.contains_point(coord! { x: 100.0, y: 0.0 }));
        // A GM never aggregates a player view.
        assert!(engine.visible_area(&ViewKey::player()).is_empty());
    }

    #[test]
    fn individual_views_need_ownership() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        zone.put_token(Token::pc(2, 100.0, 0.0, "Normal", "bob"));
        let cfg = EngineConfig {
            individual_views: true,
            ..config()
        };
        let engine = VisionEngine::new(cfg, alice(), campaign(), zone);
        let view = engine.visible_area(&ViewKey::player());
        assert!(view.contains_point(coord! { x: 0.0, y: 0.0 }));
        assert!(!view.contains_point(coord! { x: 100.0, y: 0.0 }));
    }

    #[test]
    fn reads_are_idempotent() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let engine = engine_with(alice(), zone);
        let first = engine.visible_area(&ViewKey::player());
        let second = engine.visible_area(&ViewKey::player());
        assert!(first.ptr_eq(&second));
        let t1 = engine.token_visibility(TokenId(1)).expect("t");
        let t2 = engine.token_visibility(TokenId(1)).expect("t");
        assert!(t1.ptr_eq(&t2));
    }

    #[test]
    fn moving_a_token_refreshes_views() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let engine = engine_with(alice(), zone);
        let before = engine.visible_area(&ViewKey::player());
        assert!(!before.contains_point(coord! { x: 100.0, y: 0.0 }));
        engine.move_token(TokenId(1), 100.0, 0.0).expect("move");
        let after = engine.visible_area(&ViewKey::player());
        assert!(after.contains_point(coord! { x: 100.0, y: 0.0 }));
        assert!(engine.move_token(TokenId(9), 0.0, 0.0).is_err());
    }

    #[test]
    fn adding_topology_refreshes_visibility() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let engine = engine_with(alice(), zone);
        let open = engine.token_visibility(TokenId(1)).expect("open").area();
        engine.add_obstacle(square(5.0, -20.0, 2.0));
        let blocked = engine.token_visibility(TokenId(1)).expect("blocked").area();
        assert!(blocked < open);
    }

    #[test]
    fn night_needs_light() {
        let mut zone = Zone::new(Topology::default(), VisionType::Night);
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let engine = engine_with(alice(), zone);
        assert!(engine.token_visibility(TokenId(1)).expect("dark").is_empty());

        engine.put_token(torch_bearer(2, 20.0, 0.0));
        let lit = engine.token_visibility(TokenId(1)).expect("lit");
        assert!(lit.contains_point(coord! { x: 15.0, y: 0.0 }));
        assert!(!lit.contains_point(coord! { x: 0.0, y: 0.0 }));
        let expected = PI * 100.0;
        assert!((lit.area() - expected).abs() / expected < 0.02);

        // Light beyond the viewer's sight stays dark.
        engine.move_token(TokenId(2), 200.0, 0.0).expect("move");
        assert!(engine.token_visibility(TokenId(1)).expect("dark").is_empty());
    }

    #[test]
    fn hidden_light_bearer_only_counts_for_gm() {
        let mut zone = Zone::new(Topology::default(), VisionType::Night);
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let mut hidden = torch_bearer(2, 10.0, 0.0);
        hidden.visible = false;
        zone.put_token(hidden);
        let player_engine = engine_with(alice(), zone.clone());
        assert!(player_engine.token_visibility(TokenId(1)).expect("t").is_empty());
        let gm_engine = engine_with(gm(), zone);
        assert!(!gm_engine.token_visibility(TokenId(1)).expect("t").is_empty());
    }

    #[test]
    fn personal_light_lights_the_viewer() {
        let mut zone = Zone::new(Topology::default(), VisionType::Night);
        zone.put_token(Token::pc(1, 0.0, 0.0, "Dark", "alice"));
        let engine = engine_with(alice(), zone);
        let vis = engine.token_visibility(TokenId(1)).expect("lit");
        assert!(vis.contains_point(coord! { x: 3.0, y: 0.0 }));
        assert!(!vis.contains_point(coord! { x: 8.0, y: 0.0 }));
        let lights = engine.drawable_lights(&ViewKey::player());
        assert_eq!(lights.len(), 1);
        assert_eq!(lights[0].kind, LightKind::Normal);
    }

    #[test]
    fn drawables_list_normal_before_aura() {
        let mut zone = Zone::new(Topology::default(), VisionType::Night);
        zone.put_token(Token::pc(1, 0.0, 0.0, "Dark", "alice"));
        let mut warded = Token::new(2, 10.0, 0.0);
        warded
            .lights
            .push(AttachedLight::new(LightSourceId::new("Aura")));
        zone.put_token(warded);
        let engine = engine_with(alice(), zone);
        let kinds: Vec<LightKind> = engine
            .drawable_lights(&ViewKey::player())
            .iter()
            .map(|d| d.kind)
            .collect();
        assert_eq!(kinds, vec![LightKind::Normal, LightKind::Aura]);
    }

    #[test]
    fn bright_lights_come_from_unpainted_sources() {
        let mut zone = Zone::new(Topology::default(), VisionType::Night);
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        zone.put_token(torch_bearer(2, 10.0, 0.0));
        let engine = engine_with(alice(), zone);
        assert_eq!(engine.bright_lights(&ViewKey::player()).len(), 1);
        engine.set_vision_type(VisionType::Day);
        assert!(engine.bright_lights(&ViewKey::player()).is_empty());
    }

    #[test]
    fn campaign_edits_refresh_results() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let engine = engine_with(alice(), zone);
        let before = engine.token_visibility(TokenId(1)).expect("t").area();
        engine.put_sight_type(SightType::new("Normal", ShapeKind::Circle, Some(10.0)));
        let after = engine.token_visibility(TokenId(1)).expect("t").area();
        assert!(after < before);
        assert!(engine.remove_light_source(&LightSourceId::new("Torch")).is_ok());
        assert!(matches!(
            engine.remove_light_source(&LightSourceId::new("Torch")),
            Err(EngineError::UnknownLightSource(_))
        ));
    }

    #[test]
    fn listeners_see_events_after_apply() {
        let engine = engine_with(alice(), Zone::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        engine.subscribe(move |event| {
            if matches!(event, ZoneEvent::TokensAdded(_) | ZoneEvent::TokensChanged(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.put_token(Token::new(1, 0.0, 0.0));
        engine.put_token(Token::new(1, 5.0, 0.0));
        engine.set_topology(Topology::default());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_unknown_token_is_an_error() {
        let engine = engine_with(alice(), Zone::default());
        assert!(matches!(
            engine.remove_token(TokenId(4)),
            Err(EngineError::UnknownToken(TokenId(4)))
        ));
    }

    fn assert_same_lights(cached: &[DrawableLight], cold: &[DrawableLight], step: usize) {
        assert_eq!(cached.len(), cold.len(), "step {step}: light count diverged");
        for (a, b) in cached.iter().zip(cold) {
            assert_eq!((a.kind, a.paint), (b.kind, b.paint), "step {step}");
            assert!(a.area.symmetric_difference_area(&b.area) < 1e-6, "step {step}: light diverged");
        }
    }

    /// Drive `player`'s engine through random edits, comparing every cached
    /// answer with an engine built cold from the same model.
    fn check_against_fresh(player: Player, seed: u64) {
        let mut rng = Pcg32::new(seed, 7);
        let owners = ["alice", "bob"];
        let mut zone = Zone::new(Topology::default(), VisionType::Night);
        for id in 0..6u64 {
            let owner = owners[rng.pick_index(owners.len()).unwrap_or(0)];
            let mut token = Token::pc(id, rng.next_range(0.0, 100.0), rng.next_range(0.0, 100.0), "Dark", owner);
            if rng.chance(0.5) {
                token.lights.push(AttachedLight::new(LightSourceId::new("Torch")));
            }
            zone.put_token(token);
        }
        let engine = engine_with(player.clone(), zone);
        let keys = [
            ViewKey::player(),
            ViewKey::gm(),
            ViewKey::for_tokens(Role::Player, [TokenId(0), TokenId(3)]),
        ];
        let mut removed: Vec<Token> = Vec::new();
        let pick = |rng: &mut Pcg32| TokenId(rng.pick_index(6).unwrap_or(0) as u64);

        for step in 0..40 {
            match rng.pick_index(11).unwrap_or(0) {
                0 => {
                    let id = pick(&mut rng);
                    let (x, y) = (rng.next_range(0.0, 100.0), rng.next_range(0.0, 100.0));
                    let _ = engine.move_token(id, x, y);
                }
                1 => {
                    let id = pick(&mut rng);
                    let _ = engine.update_token(id, |t| {
                        if t.lights.is_empty() {
                            t.lights.push(AttachedLight::new(LightSourceId::new("Torch")));
                        } else {
                            t.lights.clear();
                        }
                    });
                }
                2 => {
                    let (x, y) = (rng.next_range(0.0, 100.0), rng.next_range(0.0, 100.0));
                    engine.add_obstacle(square(x, y, rng.next_range(2.0, 8.0)));
                }
                3 => {
                    let vt = if step % 2 == 0 { VisionType::Day } else { VisionType::Night };
                    engine.set_vision_type(vt);
                }
                4 => {
                    let id = pick(&mut rng);
                    let _ = engine.update_token(id, |t| t.has_sight = !t.has_sight);
                }
                5 => {
                    if !removed.is_empty() && rng.chance(0.5) {
                        if let Some(token) = removed.pop() {
                            engine.put_token(token);
                        }
                    } else if let Ok(token) = engine.remove_token(pick(&mut rng)) {
                        removed.push(token);
                    }
                }
                6 => {
                    let id = pick(&mut rng);
                    let _ = engine.update_token(id, |t| t.visible = !t.visible);
                }
                7 => {
                    let id = pick(&mut rng);
                    let _ = engine.update_token(id, |t| {
                        let owner = if t.owners.contains("alice") { "bob" } else { "alice" };
                        t.owners = [owner.to_string()].into_iter().collect();
                        t.visible_only_to_owner = !t.visible_only_to_owner;
                    });
                }
                8 => {
                    let range = rng.next_range(10.0, 40.0);
                    engine.put_sight_type(SightType::new("Normal", ShapeKind::Circle, Some(range)));
                    let id = pick(&mut rng);
                    let _ = engine.update_token(id, |t| {
                        let next = if t.sight_type.as_deref() == Some("Dark") { "Normal" } else { "Dark" };
                        t.sight_type = Some(next.to_string());
                    });
                }
                9 => engine.set_topology(Topology::default()),
                _ => {
                    let id = pick(&mut rng);
                    let _ = engine.update_token(id, |t| {
                        let aura = LightSourceId::new("Aura");
                        if t.lights.iter().any(|l| l.source == aura) {
                            t.lights.retain(|l| l.source != aura);
                        } else {
                            t.lights.push(AttachedLight::new(aura));
                        }
                    });
                }
            }
            // Warm every cache layer, then compare against a cold engine.
            for key in &keys {
                engine.visible_area(key);
                engine.drawable_lights(key);
            }
            let fresh = VisionEngine::new(config(), player.clone(), engine.campaign(), engine.zone());
            for key in &keys {
                let cached = engine.visible_area(key);
                let cold = fresh.visible_area(key);
                assert!(
                    cached.symmetric_difference_area(&cold) < 1e-6,
                    "step {step}: cached view diverged"
                );
                assert_same_lights(&engine.drawable_lights(key), &fresh.drawable_lights(key), step);
            }
            for id in 0..6u64 {
                let cached = engine.token_visibility(TokenId(id));
                let cold = fresh.token_visibility(TokenId(id));
                match (cached, cold) {
                    (Some(a), Some(b)) => assert!(a.symmetric_difference_area(&b) < 1e-6),
                    (a, b) => assert_eq!(a.is_none(), b.is_none(), "step {step}: token {id}"),
                }
            }
        }
    }

    #[test]
    fn cached_engine_matches_fresh_engine() {
        init_logging();
        check_against_fresh(alice(), 2024);
    }

    #[test]
    fn cached_gm_engine_matches_fresh_engine() {
        init_logging();
        check_against_fresh(gm(), 77);
    }

    #[test]
    fn removing_a_token_drops_its_cached_results() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        zone.put_token(Token::pc(2, 100.0, 0.0, "Normal", "alice"));
        let engine = engine_with(alice(), zone);
        let before = engine.visible_area(&ViewKey::player());
        assert!(before.contains_point(coord! { x: 100.0, y: 0.0 }));
        assert!(engine.cache.visibility.contains(&TokenId(2)));

        let gone = engine.remove_token(TokenId(2)).expect("remove");
        assert!(!engine.cache.visibility.contains(&TokenId(2)));
        assert!(!engine.cache.raw.contains(&TokenId(2)));
        assert!(engine.token_visibility(TokenId(2)).is_none());
        let after = engine.visible_area(&ViewKey::player());
        assert!(!after.contains_point(coord! { x: 100.0, y: 0.0 }));

        engine.put_token(gone);
        assert!(engine.visible_area(&ViewKey::player()).contains_point(coord! { x: 100.0, y: 0.0 }));
    }

    #[test]
    fn listeners_may_call_back_into_the_engine() {
        let mut zone = Zone::default();
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        let engine = Arc::new(engine_with(alice(), zone));
        let weak = Arc::downgrade(&engine);
        engine.subscribe(move |event| {
            if let (ZoneEvent::TokensChanged(ids), Some(engine)) = (event, weak.upgrade()) {
                engine.expose_visible_area(ids);
            }
        });
        engine.move_token(TokenId(1), 50.0, 0.0).expect("move");
        engine.move_token(TokenId(1), 100.0, 0.0).expect("move");
        let history = engine.exposed_area(TokenId(1));
        assert!(history.contains_point(coord! { x: 50.0, y: 0.0 }));
        assert!(history.contains_point(coord! { x: 100.0, y: 0.0 }));
        assert!(!history.contains_point(coord! { x: 0.0, y: 0.0 }));
    }

    #[test]
    fn concurrent_reads_match_the_model_they_saw() {
        let mut zone = Zone::new(Topology::new(vec![square(40.0, 40.0, 10.0)]), VisionType::Night);
        zone.put_token(Token::pc(1, 0.0, 0.0, "Normal", "alice"));
        zone.put_token(Token::pc(2, 70.0, 70.0, "Dark", "alice"));
        zone.put_token(torch_bearer(3, 20.0, 20.0));
        let engine = Arc::new(engine_with(alice(), zone));

        let writer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let mut rng = Pcg32::new(11, 0);
                for _ in 0..30 {
                    let id = TokenId(1 + rng.pick_index(3).unwrap_or(0) as u64);
                    let (x, y) = (rng.next_range(0.0, 80.0), rng.next_range(0.0, 80.0));
                    let _ = engine.move_token(id, x, y);
                }
            })
        };
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..15 {
                        let (zone, view, seen) = {
                            let model = engine.read();
                            let index = engine.index(&model);
                            let view = engine.view_area(&model, &ViewKey::player());
                            let seen = model
                                .zone
                                .token(TokenId(1))
                                .and_then(|t| engine.visibility_of(&model, &index, t, true));
                            (model.zone.clone(), view, seen)
                        };
                        let fresh = VisionEngine::new(config(), alice(), campaign(), zone);
                        let cold = fresh.visible_area(&ViewKey::player());
                        assert!(view.symmetric_difference_area(&cold) < 1e-6);
                        match (seen, fresh.token_visibility(TokenId(1))) {
                            (Some(a), Some(b)) => assert!(a.symmetric_difference_area(&b) < 1e-6),
                            (a, b) => assert_eq!(a.is_none(), b.is_none()),
                        }
                    }
                })
            })
            .collect();

        writer.join().expect("writer");
        for reader in readers {
            reader.join().expect("reader");
        }
    }

    #[test]
    fn evaluate_answers_for_requested_view() {
        let json = r#"{
            "zone": {
                "tokens": [
                    {"id": 1, "position": {"x": 0, "y": 0}, "kind": "pc",
                     "has_sight": true, "sight_type": "Normal", "owners": ["alice"]}
                ]
            },
            "player": {"name": "alice", "role": "player"},
            "view": {"role": "player"},
            "actions": [{"action": "expose_visible_area", "tokens": [1]}]
        }"#;
        let request: EvaluateRequest = serde_json::from_str(json).expect("request");
        let response = evaluate(request).expect("evaluate");
        assert!(response.visible_area.contains_point(coord! { x: 5.0, y: 5.0 }));
        assert!(response.exposed_area.symmetric_difference_area(&response.visible_area) < 1e-6);
        assert!(response.drawable_lights.is_empty());
    }
}
