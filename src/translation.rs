//! Hash-verified B-tree walk shared by the VBD and the free tree (spec §4.2).
//!
//! A [`Translation`] instance is configured once with a terminal level (0 for
//! the VBD, where level 0 is the leaf; 1 for the free tree, where level 1 is
//! the type-2 node) and then driven one request at a time: `submit`, repeated
//! `execute`, then `resolved`/`walk` once it reports completion.

use crate::cache::Cache;
use crate::collab::BlockHasher;
use crate::error::{CbeError, CbeResult};
use crate::types::{Generation, Hash, NodeEntry, Pba, Vba, MAX_TREE_LEVELS};

/// Static shape of a hash-chained tree: branching factor, height (number of
/// type-1 levels above the terminal level) and leaf count.
#[derive(Debug, Clone, Copy)]
pub struct TreeGeometry {
    pub degree: usize,
    pub height: usize,
    pub leaves: u64,
}

impl TreeGeometry {
    pub fn new(degree: usize, height: usize, leaves: u64) -> Self {
        assert!(degree.is_power_of_two(), "degree must be a power of two");
        assert!(height >= 1 && height <= MAX_TREE_LEVELS, "height out of supported range");
        TreeGeometry { degree, height, leaves }
    }

    pub fn max_vba(&self) -> u64 { self.leaves.saturating_sub(1) }

    /// Index of the child pointer for `vba` within the block at `level`
    /// (spec §4.2: `(vba >> (log2(degree) * level)) & (degree - 1)`).
    pub fn index(&self, vba: Vba, level: usize) -> usize {
        let bits = self.degree.trailing_zeros() as u64;
        ((vba.0 >> (bits * level as u64)) & (self.degree as u64 - 1)) as usize
    }
}

/// One entry of the root-to-leaf walk, including the root itself at
/// `walk[height]`.
pub type Walk = [NodeEntry; MAX_TREE_LEVELS + 1];

pub struct Translation {
    geometry: TreeGeometry,
    /// 0 for the VBD (leaves), 1 for the free tree (type-2 nodes).
    terminal_level: usize,
    active: bool,
    vba: Vba,
    level: usize,
    walk: Walk,
    next_pba: Pba,
    resolved: Option<Pba>,
}

impl Translation {
    pub fn new(geometry: TreeGeometry, terminal_level: usize) -> Self {
        assert!(terminal_level < geometry.height, "terminal level must sit below the root");
        Translation {
            geometry,
            terminal_level,
            active: false,
            vba: Vba::INVALID,
            level: 0,
            walk: [NodeEntry::default(); MAX_TREE_LEVELS + 1],
            next_pba: Pba::INVALID,
            resolved: None,
        }
    }

    pub fn acceptable(&self) -> bool { !self.active }

    /// Begin walking from `root` (whose expected hash is `root_hash`) toward
    /// `vba`.
    pub fn submit(&mut self, root: Pba, root_gen: Generation, root_hash: Hash, vba: Vba) -> CbeResult<()> {
        if self.active {
            return Err(CbeError::ProtocolMisuse("translation.submit while a walk is in progress"));
        }
        self.active = true;
        self.vba = vba;
        self.level = self.geometry.height;
        self.walk = [NodeEntry::default(); MAX_TREE_LEVELS + 1];
        self.walk[self.level] = NodeEntry { pba: root, generation: root_gen, hash: root_hash };
        self.next_pba = root;
        self.resolved = None;
        Ok(())
    }

    /// Drive the walk forward by one cache round-trip. Returns `Ok(true)` if
    /// observable state advanced (spec §9 "fixed-point scheduler").
    pub fn execute(&mut self, cache: &mut Cache, hasher: &dyn BlockHasher, now: u64) -> CbeResult<bool> {
        if !self.active || self.resolved.is_some() {
            return Ok(false);
        }

        if !cache.available(self.next_pba) {
            if cache.acceptable(self.next_pba) {
                cache.submit(self.next_pba)?;
                return Ok(true);
            }
            return Ok(false);
        }

        let idx = cache.index(self.next_pba, now);
        let expected_hash = self.walk[self.level].hash;
        let computed_hash = hasher.hash(cache.data(idx));
        if computed_hash != expected_hash {
            return Err(CbeError::HashMismatch { pba: self.next_pba });
        }

        self.level -= 1;
        let child_index = self.geometry.index(self.vba, self.level);
        let entry = cache.data(idx).type1_entry(child_index, self.geometry.degree);
        self.walk[self.level] = entry;
        if self.level == self.terminal_level {
            self.resolved = Some(entry.pba);
        } else {
            self.next_pba = entry.pba;
        }
        Ok(true)
    }

    /// The resolved PBA (a leaf for the VBD, a type-2 node for the free
    /// tree), once `execute` has driven the walk to completion.
    pub fn peek_completed(&self) -> Option<Pba> { self.resolved }

    /// Full root-to-terminal walk, valid once [`Translation::peek_completed`]
    /// returns `Some`. Write-back and the free tree need every level's old
    /// PBA/generation/hash to build the new path.
    pub fn walk(&self) -> &[NodeEntry] { &self.walk[..=self.geometry.height] }

    pub fn vba(&self) -> Vba { self.vba }

    pub fn drop_completed(&mut self) -> CbeResult<()> {
        if self.resolved.is_none() {
            return Err(CbeError::ProtocolMisuse("translation.drop_completed with nothing resolved"));
        }
        self.active = false;
        self.resolved = None;
        Ok(())
    }

    pub fn geometry(&self) -> TreeGeometry { self.geometry }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::collab::ref_impls::Sha256Hasher;
    use crate::types::HASH_SIZE;

    fn hashed(hasher: &Sha256Hasher, block: &Block) -> Hash { hasher.hash(block) }

    #[test]
    fn walks_a_single_level_tree() {
        let geometry = TreeGeometry::new(64, 1, 64);
        let hasher = Sha256Hasher;
        let mut cache = Cache::new(16);

        let mut leaf = Block::zeroed();
        leaf.as_mut_slice()[0] = 0xAA;
        let mut root = Block::zeroed();
        root.set_type1_entry(
            0,
            64,
            NodeEntry { pba: Pba(5), generation: Generation(1), hash: hashed(&hasher, &leaf) },
        );
        let root_hash = hashed(&hasher, &root);

        cache.submit(Pba(1)).unwrap();
        cache.mark_complete(Pba(1), root);

        let mut t = Translation::new(geometry, 0);
        t.submit(Pba(1), Generation(1), root_hash, Vba(0)).unwrap();
        assert!(t.execute(&mut cache, &hasher, 1).unwrap());
        assert_eq!(t.peek_completed(), Some(Pba(5)));
    }

    #[test]
    fn indexes_child_by_level_after_descent_not_before() {
        // Two-level tree: root points at 64 inner nodes, each holding 64 leaves.
        // A vba whose low/high 6-bit groups differ exercises the off-by-one this
        // guards: the child slot within a block must be picked with the level
        // *below* that block, never the block's own level.
        let geometry = TreeGeometry::new(64, 2, 64 * 64);
        let hasher = Sha256Hasher;
        let mut cache = Cache::new(16);

        let vba = Vba(5 * 64 + 9); // high group 5 (root slot), low group 9 (inner slot)

        let mut leaf = Block::zeroed();
        leaf.as_mut_slice()[0] = 0x42;
        let leaf_hash = hashed(&hasher, &leaf);

        let mut inner = Block::zeroed();
        inner.set_type1_entry(9, 64, NodeEntry { pba: Pba(100), generation: Generation(1), hash: leaf_hash });
        let inner_hash = hashed(&hasher, &inner);

        let mut root = Block::zeroed();
        root.set_type1_entry(5, 64, NodeEntry { pba: Pba(50), generation: Generation(1), hash: inner_hash });
        let root_hash = hashed(&hasher, &root);

        cache.submit(Pba(1)).unwrap();
        cache.mark_complete(Pba(1), root);

        let mut t = Translation::new(geometry, 0);
        t.submit(Pba(1), Generation(1), root_hash, vba).unwrap();

        assert!(t.execute(&mut cache, &hasher, 1).unwrap());
        assert!(cache.acceptable(Pba(50)));
        cache.submit(Pba(50)).unwrap();
        cache.mark_complete(Pba(50), inner);
        assert!(t.execute(&mut cache, &hasher, 2).unwrap());

        assert_eq!(t.peek_completed(), Some(Pba(100)));
    }

    #[test]
    fn hash_mismatch_is_fatal() {
        let geometry = TreeGeometry::new(64, 1, 64);
        let hasher = Sha256Hasher;
        let mut cache = Cache::new(16);
        let root = Block::zeroed();
        cache.submit(Pba(1)).unwrap();
        cache.mark_complete(Pba(1), root);

        let mut t = Translation::new(geometry, 0);
        t.submit(Pba(1), Generation(1), Hash([1u8; HASH_SIZE]), Vba(0)).unwrap();
        let err = t.execute(&mut cache, &hasher, 1).unwrap_err();
        assert_eq!(err, CbeError::HashMismatch { pba: Pba(1) });
    }
}
