//! Model and interchange types.
//!
//! Everything here derives Serialize + Deserialize so it can round-trip
//! through the JSON request/response format used by `evaluate_json`.

use std::collections::BTreeSet;
use std::fmt;

use geo::Coord;
use serde::{Deserialize, Serialize};

use crate::region::Region;
use crate::shape::{ShapeKind, ShapeSpec};

// -- Identifiers ---------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LightSourceId(pub String);

impl LightSourceId {
    pub fn new(id: impl Into<String>) -> Self {
        LightSourceId(id.into())
    }
}

impl fmt::Display for LightSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// -- Geometry ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Point2D { x, y }
    }
}

impl From<Point2D> for Coord<f64> {
    fn from(p: Point2D) -> Self {
        Coord { x: p.x, y: p.y }
    }
}

// -- Players -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Gm,
    Player,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub role: Role,
}

impl Player {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Player {
            name: name.into(),
            role,
        }
    }

    pub fn is_gm(&self) -> bool {
        self.role == Role::Gm
    }

    /// GMs own every token; players own tokens listing them or owned by all.
    pub fn owns(&self, token: &Token) -> bool {
        self.is_gm() || token.is_owner(&self.name)
    }
}

// -- Lights / sight ------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Paint {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default = "opaque")]
    pub a: u8,
}

fn opaque() -> u8 {
    255
}

impl Paint {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Paint { r, g, b, a: 255 }
    }

    /// Parse `#rrggbb` (leading `#` optional).
    pub fn from_hex(text: &str) -> Option<Paint> {
        let hex = text.strip_prefix('#').unwrap_or(text);
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let value = u32::from_str_radix(hex, 16).ok()?;
        Some(Paint::rgb((value >> 16) as u8, (value >> 8) as u8, value as u8))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LightKind {
    #[default]
    Normal,
    Aura,
}

fn is_false(v: &bool) -> bool {
    !v
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// One component of a light source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Light {
    #[serde(default)]
    pub shape: ShapeKind,
    pub range: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub arc_deg: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub width: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset_deg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paint: Option<Paint>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub gm_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub owner_only: bool,
}

impl Light {
    pub fn circle(range: f64) -> Self {
        Light {
            shape: ShapeKind::Circle,
            range,
            arc_deg: 0.0,
            width: 0.0,
            offset_deg: 0.0,
            paint: None,
            gm_only: false,
            owner_only: false,
        }
    }

    pub fn with_paint(mut self, paint: Paint) -> Self {
        self.paint = Some(paint);
        self
    }

    pub fn spec(&self) -> ShapeSpec {
        ShapeSpec {
            kind: self.shape,
            range: self.range,
            arc_deg: self.arc_deg,
            width: self.width,
            offset_deg: self.offset_deg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSource {
    pub id: LightSourceId,
    pub name: String,
    #[serde(default)]
    pub kind: LightKind,
    pub lights: Vec<Light>,
    /// Light passes through topology.
    #[serde(default, skip_serializing_if = "is_false")]
    pub ignores_topology: bool,
}

impl LightSource {
    pub fn new(name: impl Into<String>, kind: LightKind, lights: Vec<Light>) -> Self {
        let name = name.into();
        LightSource {
            id: LightSourceId(name.clone()),
            name,
            kind,
            lights,
            ignores_topology: false,
        }
    }

    pub fn max_range(&self) -> f64 {
        self.lights.iter().map(|l| l.range).fold(0.0, f64::max)
    }
}

fn default_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SightType {
    pub name: String,
    #[serde(default)]
    pub shape: ShapeKind,
    /// `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Scales lights seen with this sight.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub arc_deg: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub width: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset_deg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_light: Option<LightSource>,
}

impl SightType {
    pub fn new(name: impl Into<String>, shape: ShapeKind, distance: Option<f64>) -> Self {
        SightType {
            name: name.into(),
            shape,
            distance,
            multiplier: 1.0,
            arc_deg: 0.0,
            width: 0.0,
            offset_deg: 0.0,
            personal_light: None,
        }
    }

    pub fn spec(&self, unlimited_range: f64) -> ShapeSpec {
        ShapeSpec {
            kind: self.shape,
            range: self.distance.unwrap_or(unlimited_range),
            arc_deg: self.arc_deg,
            width: self.width,
            offset_deg: self.offset_deg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedLight {
    pub source: LightSourceId,
    /// Overrides the token facing for directed lights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facing_deg: Option<f64>,
}

impl AttachedLight {
    pub fn new(source: LightSourceId) -> Self {
        AttachedLight {
            source,
            facing_deg: None,
        }
    }
}

// -- Tokens --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Pc,
    #[default]
    Npc,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    #[serde(default)]
    pub name: String,
    /// Vision center.
    pub position: Point2D,
    #[serde(default)]
    pub facing_deg: f64,
    #[serde(default)]
    pub kind: TokenKind,
    #[serde(default)]
    pub has_sight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sight_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lights: Vec<AttachedLight>,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub visible_only_to_owner: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub owners: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub owned_by_all: bool,
}

impl Token {
    pub fn new(id: u64, x: f64, y: f64) -> Self {
        Token {
            id: TokenId(id),
            name: String::new(),
            position: Point2D::new(x, y),
            facing_deg: 0.0,
            kind: TokenKind::Npc,
            has_sight: false,
            sight_type: None,
            lights: Vec::new(),
            visible: true,
            visible_only_to_owner: false,
            owners: BTreeSet::new(),
            owned_by_all: false,
        }
    }

    /// PC token with sight, owned by `owner`.
    pub fn pc(id: u64, x: f64, y: f64, sight: &str, owner: &str) -> Self {
        let mut token = Token::new(id, x, y);
        token.kind = TokenKind::Pc;
        token.has_sight = true;
        token.sight_type = Some(sight.to_string());
        token.owners.insert(owner.to_string());
        token
    }

    pub fn center(&self) -> Coord<f64> {
        self.position.into()
    }

    pub fn is_owner(&self, name: &str) -> bool {
        self.owned_by_all || self.owners.contains(name)
    }

    pub fn has_light_sources(&self) -> bool {
        !self.lights.is_empty()
    }
}

// -- Views / results -----------------------------------------------

/// Cache key of an aggregate "what does this observer see" computation.
/// Token subsets are ordered sets, so equal subsets compare and hash equal
/// regardless of the order they were listed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewKey {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<BTreeSet<TokenId>>,
}

impl ViewKey {
    pub fn gm() -> Self {
        ViewKey {
            role: Role::Gm,
            tokens: None,
        }
    }

    pub fn player() -> Self {
        ViewKey {
            role: Role::Player,
            tokens: None,
        }
    }

    pub fn for_tokens<I>(role: Role, tokens: I) -> Self
    where
        I: IntoIterator<Item = TokenId>,
    {
        ViewKey {
            role,
            tokens: Some(tokens.into_iter().collect()),
        }
    }

    pub fn is_gm_view(&self) -> bool {
        self.role == Role::Gm
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VisionType {
    Off,
    #[default]
    Day,
    Night,
}

/// A resolved light contribution ready for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawableLight {
    pub kind: LightKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paint: Option<Paint>,
    pub area: Region,
}

// -- Tests ---------------------------------------------------------
