//! Virtual Block Device: a [`Translation`] instance configured for data
//! leaves (spec §4.3).

use crate::cache::Cache;
use crate::collab::BlockHasher;
use crate::error::CbeResult;
use crate::translation::{Translation, TreeGeometry};
use crate::types::{Generation, Hash, NodeEntry, Pba, Vba};

pub struct Vbd {
    translation: Translation,
}

impl Vbd {
    pub fn new(geometry: TreeGeometry) -> Self { Vbd { translation: Translation::new(geometry, 0) } }

    pub fn max_vba(&self) -> Vba { Vba(self.translation.geometry().max_vba()) }

    pub fn acceptable(&self) -> bool { self.translation.acceptable() }

    pub fn submit(&mut self, root: Pba, root_gen: Generation, root_hash: Hash, vba: Vba) -> CbeResult<()> {
        self.translation.submit(root, root_gen, root_hash, vba)
    }

    pub fn execute(&mut self, cache: &mut Cache, hasher: &dyn BlockHasher, now: u64) -> CbeResult<bool> {
        self.translation.execute(cache, hasher, now)
    }

    /// `(leaf_pba, walk)` once the translation has resolved; the walk is the
    /// full root-to-leaf path, which write-back and the free tree need to
    /// relocate every node on a write.
    pub fn resolve(&self) -> Option<(Pba, &[NodeEntry])> {
        self.translation.peek_completed().map(|pba| (pba, self.translation.walk()))
    }

    pub fn drop_completed(&mut self) -> CbeResult<()> { self.translation.drop_completed() }

    pub fn geometry(&self) -> TreeGeometry { self.translation.geometry() }
}
