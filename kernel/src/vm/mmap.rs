//! Per-process registry of memory mappings.

use super::file::File;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use log::debug;

/// Identifies a memory mapping within one process. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl MapId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Mapping {
    pub file: Arc<dyn File>,
    /// User pages of the mapping, lowest first.
    pub pages: Vec<usize>,
}

pub struct MmapRegistry {
    next_id: u32,
    mappings: BTreeMap<MapId, Mapping>,
}

impl Default for MmapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            mappings: BTreeMap::new(),
        }
    }

    /// The id the next [`insert`](Self::insert) will hand out.
    pub fn next_id(&self) -> MapId {
        MapId(self.next_id)
    }

    /// Start a mapping of `file` with no pages yet.
    pub fn insert(&mut self, file: Arc<dyn File>) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        self.mappings.insert(
            id,
            Mapping {
                file,
                pages: Vec::new(),
            },
        );
        debug!("mmap: created mapping {}", id);
        id
    }

    /// Record that `upage` belongs to mapping `id`.
    pub fn add(&mut self, id: MapId, upage: usize) {
        let Some(mapping) = self.mappings.get_mut(&id) else {
            panic!("adding page {upage:#x} to unknown mapping {id}");
        };
        mapping.pages.push(upage);
    }

    /// Forget mapping `id`, returning it so the caller can release its pages.
    /// `None` if there is no such mapping, which includes one already removed.
    pub fn remove_all(&mut self, id: MapId) -> Option<Mapping> {
        let mapping = self.mappings.remove(&id)?;
        debug!("mmap: removed mapping {} ({} pages)", id, mapping.pages.len());
        Some(mapping)
    }

    /// Forget every mapping.
    pub fn drain(&mut self) -> Vec<(MapId, Mapping)> {
        core::mem::take(&mut self.mappings).into_iter().collect()
    }

    pub fn pages(&self, id: MapId) -> Option<&[usize]> {
        self.mappings.get(&id).map(|mapping| mapping.pages.as_slice())
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.mappings.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
