//! Text formats for authoring sight types and light sources.
//!
//! One definition per line, `Name: arg arg ...`. Parsing collects every
//! problem with its line number and fails once at the end, so an author can
//! fix a whole block of definitions in one pass.
//!
//! Sight lines:
//!
//! ```text
//! Darkvision: circle distance=60 x2 r5#33aaff
//! ```
//!
//! `distance=`, `arc=`, `width=`, `offset=` set the vision shape, `xN` is
//! the light multiplier and each `rN[#rrggbb]` adds a band to the personal
//! light.
//!
//! Light lines:
//!
//! ```text
//! Torch: circle 20 40#ffaa3c
//! Ward: aura GM circle 5 OWNER 10#0000ff
//! ```
//!
//! Bare numbers add a component using the shape and flags set so far.
//! `arc=` forces a cone and `width=` a beam. `GM` and `OWNER` are only
//! valid on auras. Lines starting with `-` are
//! comments. Lumen suffixes (`+N`/`-N`) and the `scale` flag are accepted
//! and ignored.

use std::fmt::Write as _;

use crate::error::{EngineError, Result, SyntaxIssue};
use crate::shape::ShapeKind;
use crate::types::{Light, LightKind, LightSource, Paint, SightType};

const DEFAULT_SIGHT_ARC: f64 = 90.0;

/// Number in the shortest form that parses back to the same value.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Split a definition line into its name and argument words.
fn split_definition(line: &str) -> Option<(&str, impl Iterator<Item = &str> + '_)> {
    let (name, rest) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, rest.split_whitespace()))
}

/// `range[#rrggbb][+lumens|-lumens]`
fn parse_range(word: &str) -> std::result::Result<(f64, Option<Paint>), String> {
    let end = word.find(['+', '-']).filter(|&i| i > 0).unwrap_or(word.len());
    let (body, lumens) = word.split_at(end);
    if !lumens.is_empty() && lumens[1..].parse::<u32>().is_err() {
        return Err(format!("bad lumens '{lumens}'"));
    }
    let (range_text, paint) = match body.split_once('#') {
        Some((range, hex)) => {
            let paint = Paint::from_hex(hex).ok_or_else(|| format!("bad color '#{hex}'"))?;
            (range, Some(paint))
        }
        None => (body, None),
    };
    let range = parse_number(range_text).ok_or_else(|| format!("bad range '{range_text}'"))?;
    Ok((range, paint))
}

fn finish<T>(items: Vec<T>, issues: Vec<SyntaxIssue>) -> Result<Vec<T>> {
    if issues.is_empty() {
        Ok(items)
    } else {
        Err(EngineError::Syntax(issues))
    }
}

pub fn parse_sights(text: &str) -> Result<Vec<SightType>> {
    let mut sights = Vec::new();
    let mut issues = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line_no = n + 1;
        let Some((name, args)) = split_definition(line.trim()) else {
            continue;
        };
        let mut issue = |message: String| issues.push(SyntaxIssue { line: line_no, message });

        let mut sight = SightType::new(name, ShapeKind::Circle, None);
        sight.arc_deg = DEFAULT_SIGHT_ARC;
        let mut personal: Vec<Light> = Vec::new();

        for arg in args {
            if let Some(shape) = ShapeKind::parse(arg) {
                sight.shape = shape;
                continue;
            }
            if arg.eq_ignore_ascii_case("scale") {
                continue;
            }
            let keyed = |key: &'static str| {
                arg.strip_prefix(key)
                    .filter(|v| !v.is_empty())
                    .map(|v| (v, parse_number(v)))
            };
            if let Some(rest) = arg.strip_prefix('x') {
                match parse_number(rest) {
                    Some(m) => sight.multiplier = m,
                    None => issue(format!("bad multiplier '{rest}'")),
                }
            } else if let Some(rest) = arg.strip_prefix('r') {
                match parse_range(rest) {
                    Ok((range, paint)) => {
                        let mut light = Light::circle(range);
                        light.shape = sight.shape;
                        light.width = sight.width;
                        light.arc_deg = sight.arc_deg;
                        light.paint = paint;
                        personal.push(light);
                    }
                    Err(message) => issue(message),
                }
            } else if let Some((raw, value)) = keyed("distance=") {
                match value {
                    Some(v) => sight.distance = Some(v),
                    None => issue(format!("bad distance '{raw}'")),
                }
            } else if let Some((raw, value)) = keyed("arc=") {
                match value {
                    Some(v) => sight.arc_deg = v,
                    None => issue(format!("bad arc '{raw}'")),
                }
            } else if let Some((raw, value)) = keyed("width=") {
                match value {
                    Some(v) => sight.width = v,
                    None => issue(format!("bad width '{raw}'")),
                }
            } else if let Some((raw, value)) = keyed("offset=") {
                match value {
                    Some(v) => sight.offset_deg = v,
                    None => issue(format!("bad offset '{raw}'")),
                }
            } else {
                issue(format!("unknown field '{arg}'"));
            }
        }

        if sight.distance == Some(0.0) {
            sight.distance = None;
        }
        if !personal.is_empty() {
            sight.personal_light = Some(LightSource::new(name, LightKind::Normal, personal));
        }
        sights.push(sight);
    }
    finish(sights, issues)
}

pub fn stringify_sights<'a, I>(sights: I) -> String
where
    I: IntoIterator<Item = &'a SightType>,
{
    let mut out = String::new();
    for sight in sights {
        let _ = write!(out, "{}: {}", sight.name, sight.shape.name());
        match sight.shape {
            ShapeKind::Beam => {
                if sight.width != 0.0 {
                    let _ = write!(out, " width={}", format_number(sight.width));
                }
                if sight.offset_deg != 0.0 {
                    let _ = write!(out, " offset={}", format_number(sight.offset_deg));
                }
            }
            ShapeKind::Cone => {
                if sight.arc_deg != 0.0 {
                    let _ = write!(out, " arc={}", format_number(sight.arc_deg));
                }
                if sight.offset_deg != 0.0 {
                    let _ = write!(out, " offset={}", format_number(sight.offset_deg));
                }
            }
            ShapeKind::Circle | ShapeKind::Square => {}
        }
        if let Some(distance) = sight.distance.filter(|d| *d != 0.0) {
            let _ = write!(out, " distance={}", format_number(distance));
        }
        if sight.multiplier != 1.0 && sight.multiplier != 0.0 {
            let _ = write!(out, " x{}", format_number(sight.multiplier));
        }
        if let Some(personal) = &sight.personal_light {
            for light in &personal.lights {
                let _ = write!(out, " r{}", format_number(light.range));
                if let Some(paint) = light.paint {
                    out.push_str(&paint.to_hex());
                }
            }
        }
        out.push('\n');
    }
    out
}

pub fn parse_lights(text: &str) -> Result<Vec<LightSource>> {
    let mut sources = Vec::new();
    let mut issues = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line_no = n + 1;
        let line = line.trim();
        if line.starts_with('-') {
            continue;
        }
        let Some((name, args)) = split_definition(line) else {
            continue;
        };
        let mut issue = |message: String| issues.push(SyntaxIssue { line: line_no, message });

        let mut kind = LightKind::Normal;
        let mut ignores_topology = false;
        let mut template = Light::circle(0.0);
        let mut lights = Vec::new();

        for arg in args {
            if arg.eq_ignore_ascii_case("gm") {
                template.gm_only = true;
                template.owner_only = false;
            } else if arg.eq_ignore_ascii_case("owner") {
                template.gm_only = false;
                template.owner_only = true;
            } else if arg.eq_ignore_ascii_case("scale") {
            } else if arg.eq_ignore_ascii_case("ignores-vbl") {
                ignores_topology = true;
            } else if let Some(shape) = ShapeKind::parse(arg) {
                template.shape = shape;
            } else if arg.eq_ignore_ascii_case("aura") {
                kind = LightKind::Aura;
            } else if arg.eq_ignore_ascii_case("normal") {
                kind = LightKind::Normal;
            } else if let Some((key, value)) = arg.split_once('=') {
                let Some(v) = parse_number(value) else {
                    issue(format!("bad {key} '{value}'"));
                    continue;
                };
                match key.to_ascii_lowercase().as_str() {
                    "arc" => {
                        template.arc_deg = v;
                        template.shape = ShapeKind::Cone;
                    }
                    "width" => {
                        template.width = v;
                        template.shape = ShapeKind::Beam;
                    }
                    "offset" => template.offset_deg = v,
                    _ => issue(format!("unknown field '{key}'")),
                }
            } else {
                match parse_range(arg) {
                    Ok((range, paint)) => {
                        let mut light = template.clone();
                        light.range = range;
                        light.paint = paint;
                        lights.push(light);
                    }
                    Err(message) => issue(message),
                }
            }
        }

        if kind == LightKind::Normal && lights.iter().any(|l| l.gm_only || l.owner_only) {
            issue("GM and OWNER apply only to auras".to_string());
        }
        let mut source = LightSource::new(name, kind, lights);
        source.ignores_topology = ignores_topology;
        sources.push(source);
    }
    finish(sources, issues)
}

pub fn stringify_lights<'a, I>(sources: I) -> String
where
    I: IntoIterator<Item = &'a LightSource>,
{
    let mut out = String::new();
    for source in sources {
        let _ = write!(out, "{}:", source.name);
        if source.kind == LightKind::Aura {
            out.push_str(" aura");
        }
        if source.ignores_topology {
            out.push_str(" IGNORES-VBL");
        }
        // Only emit what changed since the previous component.
        let mut last = Light::circle(0.0);
        let mut first = true;
        for light in &source.lights {
            if first || light.shape != last.shape {
                let _ = write!(out, " {}", light.shape.name());
            }
            match light.shape {
                ShapeKind::Cone => {
                    if light.arc_deg != last.arc_deg {
                        let _ = write!(out, " arc={}", format_number(light.arc_deg));
                    }
                    if light.offset_deg != last.offset_deg {
                        let _ = write!(out, " offset={}", format_number(light.offset_deg));
                    }
                }
                ShapeKind::Beam => {
                    if light.width != last.width {
                        let _ = write!(out, " width={}", format_number(light.width));
                    }
                    if light.offset_deg != last.offset_deg {
                        let _ = write!(out, " offset={}", format_number(light.offset_deg));
                    }
                }
                ShapeKind::Circle | ShapeKind::Square => {}
            }
            if source.kind == LightKind::Aura {
                if light.gm_only && !last.gm_only {
                    out.push_str(" GM");
                }
                if light.owner_only && !last.owner_only {
                    out.push_str(" OWNER");
                }
            }
            let _ = write!(out, " {}", format_number(light.range));
            if let Some(paint) = light.paint {
                out.push_str(&paint.to_hex());
            }
            last = light.clone();
            first = false;
        }
        out.push('\n');
    }
    out
}
