//! The mutable map model: topology, tokens and lighting mode.
//!
//! The engine owns the zone and is the only writer; every setter on
//! `VisionEngine` mutates it and invalidates the cache in one step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::campaign::Campaign;
use crate::topology::Topology;
use crate::types::{LightKind, Token, TokenId, VisionType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub topology: Topology,
    #[serde(default, with = "token_list")]
    pub tokens: BTreeMap<TokenId, Token>,
    #[serde(default)]
    pub vision_type: VisionType,
}

impl Zone {
    pub fn new(topology: Topology, vision_type: VisionType) -> Self {
        Zone {
            topology,
            tokens: BTreeMap::new(),
            vision_type,
        }
    }

    pub fn token(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(&id)
    }

    pub fn put_token(&mut self, token: Token) -> Option<Token> {
        self.tokens.insert(token.id, token)
    }

    pub fn remove_token(&mut self, id: TokenId) -> Option<Token> {
        self.tokens.remove(&id)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    /// Tokens carrying at least one registered light source of `kind`.
    pub fn light_bearers<'a>(
        &'a self,
        campaign: &'a Campaign,
        kind: LightKind,
    ) -> impl Iterator<Item = &'a Token> + 'a {
        self.tokens.values().filter(move |t| {
            t.lights.iter().any(|attached| {
                campaign
                    .light_source(&attached.source)
                    .is_some_and(|s| s.kind == kind)
            })
        })
    }
}

/// Tokens travel as a JSON list; the id inside each token is the map key.
mod token_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::{Token, TokenId};

    pub fn serialize<S>(tokens: &BTreeMap<TokenId, Token>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(tokens.values())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<TokenId, Token>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<Token>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|t| (t.id, t)).collect())
    }
}
