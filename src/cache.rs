//! Memoized vision results and their invalidation rules.
//!
//! Each result family lives in its own [`Memo`], a named map behind its own
//! lock. All eviction goes through [`VisionCache::invalidate`], so the rules
//! for what a model change can affect are written down in one place.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::light::LightResolution;
use crate::region::Region;
use crate::topology::TopologyIndex;
use crate::types::{TokenId, ViewKey};

/// A typed memo table.
pub struct Memo<K, V> {
    name: &'static str,
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Memo {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    /// Cached value for `key`, computing and storing it on a miss. The lock
    /// is not held while `compute` runs, so it may consult other memos.
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(hit) = self.get(&key) {
            return hit;
        }
        trace!(memo = self.name, "miss");
        let value = compute();
        self.lock().entry(key).or_insert(value).clone()
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry whose key matches; returns how many were dropped.
    pub fn invalidate_where<P>(&self, mut pred: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !pred(k));
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Light resolutions of one bearer as seen with one sight type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LightKey {
    pub bearer: TokenId,
    pub sight: String,
    /// The bearer's personal light rather than its attached sources.
    pub personal: bool,
}

/// A model change, reduced to what the cache needs to know about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Topology,
    /// A token was added, removed or changed. `carries_light` is true if it
    /// bore light sources before or after the change.
    Token { id: TokenId, carries_light: bool },
    VisionType,
    /// Sight types or light sources were redefined.
    Campaign,
}

pub struct VisionCache {
    index: Mutex<Option<Arc<TopologyIndex>>>,
    pub(crate) raw: Memo<TokenId, Option<Region>>,
    pub(crate) visibility: Memo<TokenId, Option<Region>>,
    pub(crate) lights: Memo<LightKey, Arc<Vec<LightResolution>>>,
    pub(crate) auras: Memo<TokenId, Arc<Vec<LightResolution>>>,
    pub(crate) views: Memo<ViewKey, Region>,
}

impl Default for VisionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionCache {
    pub fn new() -> Self {
        VisionCache {
            index: Mutex::new(None),
            raw: Memo::new("raw"),
            visibility: Memo::new("visibility"),
            lights: Memo::new("lights"),
            auras: Memo::new("auras"),
            views: Memo::new("views"),
        }
    }

    /// The current topology index, built on first use.
    pub fn index_or_build<F>(&self, build: F) -> Arc<TopologyIndex>
    where
        F: FnOnce() -> TopologyIndex,
    {
        let mut slot = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(index) => Arc::clone(index),
            None => {
                let index = Arc::new(build());
                *slot = Some(Arc::clone(&index));
                index
            }
        }
    }

    pub fn has_index(&self) -> bool {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn invalidate(&self, event: &Invalidation) {
        match *event {
            Invalidation::Topology => {
                *self.index.lock().unwrap_or_else(PoisonError::into_inner) = None;
                let dropped = self.clear_results();
                debug!(dropped, "topology changed; cache flushed");
            }
            Invalidation::Token { id, carries_light } => {
                self.raw.invalidate(&id);
                self.auras.invalidate(&id);
                self.lights.invalidate_where(|k| k.bearer == id);
                let visibility = if carries_light {
                    self.visibility.clear()
                } else {
                    usize::from(self.visibility.invalidate(&id))
                };
                let views = self.views.clear();
                debug!(token = %id, carries_light, visibility, views, "token invalidated");
            }
            Invalidation::VisionType => {
                let visibility = self.visibility.clear();
                let views = self.views.clear();
                debug!(visibility, views, "vision type changed");
            }
            Invalidation::Campaign => {
                let dropped = self.clear_results();
                debug!(dropped, "campaign definitions changed");
            }
        }
    }

    fn clear_results(&self) -> usize {
        self.raw.clear()
            + self.visibility.clear()
            + self.lights.clear()
            + self.auras.clear()
            + self.views.clear()
    }
}
