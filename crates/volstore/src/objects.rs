//! Weak lookup table from spanner ids to the shared spanner objects.

use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use crate::spanner::{Spanner, SpannerId};
use crate::tree::VolumeTree;

/// Resolves spanner ids carried by edits to live spanner objects.
///
/// Entries are weak: the table never keeps a spanner alive. Resolution
/// upgrades for the duration of one apply; a dead or unknown id resolves to
/// `None`, which edits treat as "nothing to do".
#[derive(Debug, Default)]
pub struct ObjectRefTable {
    objects: FxHashMap<SpannerId, Weak<Spanner>>,
}

impl ObjectRefTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `spanner` under its id, replacing any previous entry.
    pub fn register(&mut self, spanner: &Arc<Spanner>) {
        self.objects.insert(spanner.id(), Arc::downgrade(spanner));
    }

    /// Live spanner for `id`.
    pub fn resolve(&self, id: SpannerId) -> Option<Arc<Spanner>> {
        self.objects.get(&id).and_then(Weak::upgrade)
    }

    /// Drop the entry for `id`. Returns `true` if one existed.
    pub fn forget(&mut self, id: SpannerId) -> bool {
        self.objects.remove(&id).is_some()
    }

    /// Register every spanner held by the tree's set-valued attributes and
    /// prune entries whose spanner is gone.
    pub fn refresh_from(&mut self, tree: &VolumeTree) {
        let registry = Arc::clone(tree.registry());
        for (attribute, descriptor) in registry.iter() {
            if !descriptor.is_set_valued() {
                continue;
            }
            for spanner in tree.spanners(attribute).iter() {
                self.register(spanner);
            }
        }
        self.objects.retain(|_, object| object.strong_count() > 0);
    }

    /// Number of entries, dead ones included until the next refresh.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
