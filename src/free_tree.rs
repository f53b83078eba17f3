//! Free-space allocator over a second hash-verified tree (spec §4.4).
//!
//! The free tree shares its node formats and its walk algorithm
//! ([`Translation`]) with the VBD, but its own nodes are never relocated:
//! reserving or freeing an entry patches the type-2 leaf and its type-1
//! ancestors in place (same PBA, fresh hash) and the result is written back
//! at the next Sync-SB flush. Only the PBAs the leaves *describe* get handed
//! out for the caller's copy-on-write VBD path.
//!
//! Every physical PBA the engine can ever hand out has a dedicated type-2
//! entry: the tree is formatted with entries laid out in increasing PBA
//! order starting at `base_pba`, so a specific PBA's entry can be reached by
//! direct addressing (`locate`) without scanning — needed to free a path's
//! old PBAs, as opposed to allocation, which scans for *any* reusable entry.

use std::collections::HashMap;

use crate::block::Block;
use crate::cache::Cache;
use crate::collab::BlockHasher;
use crate::error::{CbeError, CbeResult};
use crate::translation::{Translation, TreeGeometry};
use crate::types::{Generation, Hash, NodeEntry, Pba, Snapshot, Type2Entry, Vba, MAX_TREE_LEVELS};

/// An entry's PBA is reusable if it was never reserved, or its reservation
/// was released at or before `last_secured_generation` and no retained
/// snapshot still straddles its `[alloc_gen, free_gen)` window (spec
/// invariant 3).
fn reusable(entry: &Type2Entry, snapshots: &[Snapshot], last_secured: Generation) -> bool {
    if entry.is_empty() {
        return false;
    }
    if !entry.reserved {
        return true;
    }
    if entry.free_gen > last_secured {
        return false;
    }
    !snapshots.iter().any(|s| s.retains(entry.alloc_gen, entry.free_gen))
}

struct Branch {
    query_vba: Vba,
    /// `walk[1..=height]`: walk[1] is the type-2 leaf's own entry, walk[height] the root.
    walk: [NodeEntry; MAX_TREE_LEVELS + 1],
    /// This branch's own edits to its type-2 leaf, as (slot, new entry)
    /// pairs rather than a full block snapshot: two branches (e.g. freeing
    /// the old path and allocating the new one in the same request) can
    /// land on the same type-2 node, and `step_update` must fold every
    /// branch's edits onto that one shared node rather than let a later
    /// branch's snapshot clobber an earlier one's.
    type2_edits: Vec<(usize, Type2Entry)>,
    new_hash: [Option<Hash>; MAX_TREE_LEVELS + 1],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Freeing,
    Querying,
    Updating,
    WritingBack,
    Done { success: bool },
}

/// Allocates replacement PBAs for a write's VBD path, frees the path's old
/// PBAs, and re-hashes its own tree to reflect both (spec §4.4).
pub struct FreeTree {
    geometry: TreeGeometry,
    translation: Translation,
    state: State,
    base_pba: Pba,

    root: Pba,
    root_gen: Generation,
    root_hash: Hash,

    needed: usize,
    current_gen: Generation,
    last_secured_gen: Generation,
    client_vba: Vba,

    free_pbas: Vec<Pba>,
    free_cursor: usize,

    query_vba: Vba,
    branches: Vec<Branch>,
    found: Vec<Pba>,

    update_branch: usize,
    update_level: usize,
    patched: HashMap<Pba, Block>,
    new_root_hash: Hash,

    dirty: Vec<(Pba, Block)>,
    write_cursor: usize,
}

impl FreeTree {
    /// `base_pba` is the physical address the tree's first type-2 entry
    /// describes; entries for `base_pba + 1`, `base_pba + 2`, ... follow in
    /// order across the type-2 leaves (spec §6 "free tree node formats").
    pub fn new(geometry: TreeGeometry, base_pba: Pba) -> Self {
        FreeTree {
            translation: Translation::new(geometry, 1),
            geometry,
            state: State::Idle,
            base_pba,
            root: Pba::INVALID,
            root_gen: Generation::ZERO,
            root_hash: Hash::ZERO,
            needed: 0,
            current_gen: Generation::ZERO,
            last_secured_gen: Generation::ZERO,
            client_vba: Vba::INVALID,
            free_pbas: Vec::new(),
            free_cursor: 0,
            query_vba: Vba(0),
            branches: Vec::new(),
            found: Vec::new(),
            update_branch: 0,
            update_level: 1,
            patched: HashMap::new(),
            new_root_hash: Hash::ZERO,
            dirty: Vec::new(),
            write_cursor: 0,
        }
    }

    pub fn acceptable(&self) -> bool { matches!(self.state, State::Idle | State::Done { .. }) }

    /// The type-2 leaf location (`query_vba`, slot index within its block)
    /// that describes `pba` directly, without scanning.
    fn locate(&self, pba: Pba) -> (Vba, usize) {
        let per_block = Block::type2_entries_per_block() as u64;
        let slot = pba.0 - self.base_pba.0;
        let node_index = slot / per_block;
        let local_index = (slot % per_block) as usize;
        (Vba(node_index * self.geometry.degree as u64), local_index)
    }

    /// Begin a request that frees `free_pbas` (the write's old path, empty if
    /// there is none yet) and allocates `needed` fresh PBAs (one per VBD-path
    /// level plus the leaf). `client_vba` is recorded into newly reserved
    /// entries' `last_vba` field for diagnostic purposes only.
    pub fn submit_request(
        &mut self,
        root: Pba,
        root_gen: Generation,
        root_hash: Hash,
        free_pbas: Vec<Pba>,
        needed: usize,
        current_gen: Generation,
        last_secured_gen: Generation,
        client_vba: Vba,
    ) -> CbeResult<()> {
        if !self.acceptable() {
            return Err(CbeError::ProtocolMisuse("free_tree.submit_request while a request is in progress"));
        }
        self.root = root;
        self.root_gen = root_gen;
        self.root_hash = root_hash;
        self.needed = needed;
        self.current_gen = current_gen;
        self.last_secured_gen = last_secured_gen;
        self.client_vba = client_vba;
        self.free_pbas = free_pbas;
        self.free_cursor = 0;
        self.query_vba = Vba(0);
        self.branches.clear();
        self.found.clear();
        self.update_branch = 0;
        self.update_level = 1;
        self.patched.clear();
        self.new_root_hash = root_hash;
        self.dirty.clear();
        self.write_cursor = 0;
        self.state = if self.free_pbas.is_empty() { State::Querying } else { State::Freeing };
        Ok(())
    }

    /// Drive the request forward by one cooperative step. Returns `Ok(true)`
    /// if observable state advanced.
    pub fn execute(&mut self, cache: &mut Cache, hasher: &dyn BlockHasher, snapshots: &[Snapshot], now: u64) -> CbeResult<bool> {
        match self.state {
            State::Idle | State::Done { .. } => Ok(false),
            State::Freeing => self.step_free(cache, hasher, now),
            State::Querying => self.step_query(cache, hasher, snapshots, now),
            State::Updating => self.step_update(cache, hasher, now),
            State::WritingBack => Ok(self.step_write_back(cache)),
        }
    }

    /// Free one old PBA per call by walking directly to its entry and
    /// stamping `free_gen`; `alloc_gen`/`reserved` are left as they were,
    /// since the entry keeps describing the same physical PBA it always has.
    fn step_free(&mut self, cache: &mut Cache, hasher: &dyn BlockHasher, now: u64) -> CbeResult<bool> {
        if self.free_cursor >= self.free_pbas.len() {
            self.state = State::Querying;
            return Ok(true);
        }

        if !self.translation.acceptable() && self.translation.peek_completed().is_none() {
            return self.translation.execute(cache, hasher, now);
        }

        if self.translation.acceptable() {
            let target = self.free_pbas[self.free_cursor];
            let (query_vba, _local_index) = self.locate(target);
            self.query_vba = query_vba;
            self.translation.submit(self.root, self.root_gen, self.root_hash, query_vba)?;
            return Ok(true);
        }

        let type2_pba = self.translation.peek_completed().expect("free step in progress implies acceptable or resolved");
        if !cache.available(type2_pba) {
            if cache.acceptable(type2_pba) {
                cache.submit(type2_pba)?;
                return Ok(true);
            }
            return Ok(false);
        }

        let idx = cache.index(type2_pba, now);
        let block = cache.data(idx);
        let per_block = Block::type2_entries_per_block();
        let target = self.free_pbas[self.free_cursor];
        let (_, local_index) = self.locate(target);

        let mut entry = block.type2_entry(local_index, per_block);
        debug_assert_eq!(entry.pba, target, "type-2 entry at the computed slot must describe the PBA being freed");
        entry.free_gen = self.current_gen;

        let walk = self.translation.walk();
        let mut walk_arr = [NodeEntry::default(); MAX_TREE_LEVELS + 1];
        walk_arr[..walk.len()].copy_from_slice(walk);
        self.branches.push(Branch {
            query_vba: self.query_vba,
            walk: walk_arr,
            type2_edits: vec![(local_index, entry)],
            new_hash: [None; MAX_TREE_LEVELS + 1],
        });

        self.translation.drop_completed()?;
        self.free_cursor += 1;
        Ok(true)
    }

    fn step_query(&mut self, cache: &mut Cache, hasher: &dyn BlockHasher, snapshots: &[Snapshot], now: u64) -> CbeResult<bool> {
        if self.needed == 0 {
            self.state = State::Updating;
            return Ok(true);
        }

        if !self.translation.acceptable() && self.translation.peek_completed().is_none() {
            return self.translation.execute(cache, hasher, now);
        }

        if self.translation.acceptable() {
            self.translation.submit(self.root, self.root_gen, self.root_hash, self.query_vba)?;
            return Ok(true);
        }

        let type2_pba = self.translation.peek_completed().expect("query in progress implies acceptable or resolved");

        if !cache.available(type2_pba) {
            if cache.acceptable(type2_pba) {
                cache.submit(type2_pba)?;
                return Ok(true);
            }
            return Ok(false);
        }

        let idx = cache.index(type2_pba, now);
        let block = cache.data(idx);
        let per_block = Block::type2_entries_per_block();
        let still_needed = self.needed.saturating_sub(self.found.len());

        let mut edits = Vec::new();
        let mut found_here = 0usize;
        for i in 0..per_block {
            if found_here >= still_needed || found_here >= crate::types::MAX_FREE_BLOCKS_PER_BRANCH {
                break;
            }
            let entry = block.type2_entry(i, per_block);
            if reusable(&entry, snapshots, self.last_secured_gen) {
                let pba = entry.pba;
                let updated = Type2Entry {
                    pba,
                    last_vba: self.client_vba,
                    alloc_gen: self.current_gen,
                    free_gen: entry.free_gen,
                    key_id: entry.key_id,
                    reserved: true,
                };
                edits.push((i, updated));
                self.found.push(pba);
                found_here += 1;
            }
        }

        let walk = self.translation.walk();
        let mut walk_arr = [NodeEntry::default(); MAX_TREE_LEVELS + 1];
        walk_arr[..walk.len()].copy_from_slice(walk);

        if found_here > 0 {
            self.branches.push(Branch {
                query_vba: self.query_vba,
                walk: walk_arr,
                type2_edits: edits,
                new_hash: [None; MAX_TREE_LEVELS + 1],
            });
        }

        self.translation.drop_completed()?;

        if self.found.len() >= self.needed {
            self.state = State::Updating;
        } else {
            let end_of_tree = self.query_vba.0 + self.geometry.degree as u64 >= self.geometry.leaves;
            if end_of_tree {
                log::warn!(
                    "free tree exhausted: needed {} found {}",
                    self.needed,
                    self.found.len()
                );
                self.state = State::Done { success: false };
            } else {
                self.query_vba = Vba(self.query_vba.0 + self.geometry.degree as u64);
            }
        }
        Ok(true)
    }

    fn step_update(&mut self, cache: &mut Cache, hasher: &dyn BlockHasher, now: u64) -> CbeResult<bool> {
        if self.update_branch >= self.branches.len() {
            self.dirty = std::mem::take(&mut self.patched).into_iter().collect();
            self.state = State::WritingBack;
            return Ok(true);
        }

        let height = self.geometry.height;
        let level = self.update_level;
        let per_block = Block::type2_entries_per_block();

        if level == 1 {
            let node_pba = self.branches[self.update_branch].walk[1].pba;
            // A later branch may share this exact type-2 node with an
            // earlier one (e.g. freeing the old path and allocating the new
            // one within the same request's single type-2 leaf); fold this
            // branch's own edits onto whatever that earlier branch already
            // patched rather than replacing the node wholesale, or the
            // earlier branch's edits (and any of its reservations) would be
            // silently discarded.
            let mut block = match self.patched.get(&node_pba) {
                Some(b) => b.clone(),
                None => {
                    if !cache.available(node_pba) {
                        if cache.acceptable(node_pba) {
                            cache.submit(node_pba)?;
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                    let idx = cache.index(node_pba, now);
                    cache.data(idx).clone()
                }
            };
            for &(slot, entry) in &self.branches[self.update_branch].type2_edits {
                block.set_type2_entry(slot, per_block, entry);
            }
            let h = hasher.hash(&block);
            self.branches[self.update_branch].new_hash[1] = Some(h);
            self.patched.insert(node_pba, block);
            self.update_level = 2;
            return Ok(true);
        }

        let pba = self.branches[self.update_branch].walk[level].pba;
        let block = match self.patched.get(&pba) {
            Some(b) => b.clone(),
            None => {
                if !cache.available(pba) {
                    if cache.acceptable(pba) {
                        cache.submit(pba)?;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                let idx = cache.index(pba, now);
                cache.data(idx).clone()
            }
        };

        let branch = &self.branches[self.update_branch];
        let child_index = self.geometry.index(branch.query_vba, level - 1);
        let child_pba = branch.walk[level - 1].pba;
        let child_hash = branch.new_hash[level - 1].expect("lower level must be hashed before its parent");

        let mut block = block;
        block.set_type1_entry(
            child_index,
            self.geometry.degree,
            NodeEntry { pba: child_pba, generation: self.current_gen, hash: child_hash },
        );
        let new_hash = hasher.hash(&block);
        self.patched.insert(pba, block);

        let branch = &mut self.branches[self.update_branch];
        branch.new_hash[level] = Some(new_hash);

        if level == height {
            self.new_root_hash = new_hash;
            self.update_branch += 1;
            self.update_level = 1;
        } else {
            self.update_level += 1;
        }
        Ok(true)
    }

    fn step_write_back(&mut self, cache: &mut Cache) -> bool {
        if self.write_cursor >= self.dirty.len() {
            self.state = State::Done { success: true };
            return true;
        }
        let (pba, ref block) = self.dirty[self.write_cursor];
        cache.invalidate(pba);
        let _ = cache.submit(pba);
        cache.mark_complete(pba, block.clone());
        if cache.available(pba) {
            let idx = cache.index(pba, 0);
            cache.mark_dirty(idx);
        }
        self.write_cursor += 1;
        true
    }

    /// The outcome, once `execute` reports completion: the fresh PBAs
    /// (`found[0]` for the leaf, `found[1..]` for ancestors outward) and the
    /// free tree's new root hash.
    pub fn peek_completed(&self) -> Option<(bool, &[Pba], Hash)> {
        match self.state {
            State::Done { success } => Some((success, &self.found, self.new_root_hash)),
            _ => None,
        }
    }

    pub fn drop_completed(&mut self) -> CbeResult<()> {
        if !matches!(self.state, State::Done { .. }) {
            return Err(CbeError::ProtocolMisuse("free_tree.drop_completed with no result pending"));
        }
        self.state = State::Idle;
        Ok(())
    }

    /// Reset after an unsuccessful allocation so the caller can retry once
    /// eviction/retention policy has freed more space (spec §4.4 step 3). The
    /// prior free_pbas were already applied and must not be repeated.
    pub fn retry_allocation(
        &mut self,
        current_gen: Generation,
        last_secured_gen: Generation,
        client_vba: Vba,
    ) -> CbeResult<()> {
        match self.state {
            State::Done { success: false } => {
                self.submit_request(self.root, self.root_gen, self.root_hash, Vec::new(), self.needed, current_gen, last_secured_gen, client_vba)
            }
            _ => Err(CbeError::ProtocolMisuse("retry_allocation only valid after a failed allocation")),
        }
    }

    pub fn geometry(&self) -> TreeGeometry { self.geometry }

    pub fn base_pba(&self) -> Pba { self.base_pba }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ref_impls::Sha256Hasher;

    /// Infrastructure PBAs: the free tree's own root and type-2 node live at
    /// pba 1 and pba 2. It *describes* a small range starting at `BASE`,
    /// disjoint from its own infrastructure.
    const BASE: u64 = 1000;

    /// Minimal free tree: root (level 2) -> one type-2 node (level 1, pba 2)
    /// describing two physical PBAs at `BASE`/`BASE+1`: a reusable one, and
    /// one that is currently reserved (simulating a live VBD path node).
    fn minimal_tree(hasher: &Sha256Hasher) -> (Block, Block, Hash) {
        let mut type2 = Block::zeroed();
        let per_block = Block::type2_entries_per_block();
        type2.set_type2_entry(
            0,
            per_block,
            Type2Entry { pba: Pba(BASE), last_vba: Vba::INVALID, alloc_gen: Generation::ZERO, free_gen: Generation::ZERO, key_id: 0, reserved: false },
        );
        type2.set_type2_entry(
            1,
            per_block,
            Type2Entry { pba: Pba(BASE + 1), last_vba: Vba(9), alloc_gen: Generation(1), free_gen: Generation::ZERO, key_id: 0, reserved: true },
        );
        let type2_hash = hasher.hash(&type2);

        let mut root = Block::zeroed();
        root.set_type1_entry(0, 64, NodeEntry { pba: Pba(2), generation: Generation(1), hash: type2_hash });
        let root_hash = hasher.hash(&root);

        (root, type2, root_hash)
    }

    #[test]
    fn finds_one_free_pba_and_marks_it_reserved() {
        let geometry = TreeGeometry::new(64, 2, 64);
        let hasher = Sha256Hasher;
        let mut cache = Cache::new(16);

        let (root, type2, root_hash) = minimal_tree(&hasher);
        cache.submit(Pba(1)).unwrap();
        cache.mark_complete(Pba(1), root);
        cache.submit(Pba(2)).unwrap();
        cache.mark_complete(Pba(2), type2);

        let mut ft = FreeTree::new(geometry, Pba(BASE));
        ft.submit_request(Pba(1), Generation(1), root_hash, Vec::new(), 1, Generation(2), Generation(1), Vba(9)).unwrap();

        let mut now = 1;
        loop {
            if ft.execute(&mut cache, &hasher, &[], now).unwrap() {
                now += 1;
                continue;
            }
            break;
        }

        let (success, found, _new_root_hash) = ft.peek_completed().unwrap();
        assert!(success);
        assert_eq!(found, &[Pba(BASE)]);
    }

    #[test]
    fn freeing_an_old_pba_makes_it_reusable_on_a_later_request() {
        let geometry = TreeGeometry::new(64, 2, 64);
        let hasher = Sha256Hasher;
        let mut cache = Cache::new(16);

        let (root, type2, root_hash) = minimal_tree(&hasher);
        cache.submit(Pba(1)).unwrap();
        cache.mark_complete(Pba(1), root);
        cache.submit(Pba(2)).unwrap();
        cache.mark_complete(Pba(2), type2);

        let mut ft = FreeTree::new(geometry, Pba(BASE));
        // Free BASE+1 (previously reserved at alloc_gen 1) and, in the same
        // pass, allocate the one entry that's already free (BASE).
        ft.submit_request(Pba(1), Generation(1), root_hash, vec![Pba(BASE + 1)], 1, Generation(5), Generation(5), Vba(3)).unwrap();

        let mut now = 1;
        loop {
            if ft.execute(&mut cache, &hasher, &[], now).unwrap() {
                now += 1;
                continue;
            }
            break;
        }
        let (success, found, new_root_hash) = ft.peek_completed().unwrap();
        assert!(success);
        assert_eq!(found, &[Pba(BASE)]);
        ft.drop_completed().unwrap();

        // A second request, with last_secured caught up, should now be able
        // to find BASE+1 too since its free_gen (5) <= last_secured (6).
        let root2 = cache.data(cache.index(Pba(1), 0)).clone();
        let type2_2 = cache.data(cache.index(Pba(2), 0)).clone();
        let mut cache2 = Cache::new(16);
        cache2.submit(Pba(1)).unwrap();
        cache2.mark_complete(Pba(1), root2);
        cache2.submit(Pba(2)).unwrap();
        cache2.mark_complete(Pba(2), type2_2);

        let mut ft2 = FreeTree::new(geometry, Pba(BASE));
        ft2.submit_request(Pba(1), Generation(5), new_root_hash, Vec::new(), 2, Generation(6), Generation(6), Vba(4)).unwrap();
        let mut now = 1;
        loop {
            if ft2.execute(&mut cache2, &hasher, &[], now).unwrap() {
                now += 1;
                continue;
            }
            break;
        }
        let (success2, found2, _) = ft2.peek_completed().unwrap();
        assert!(success2);
        assert!(found2.contains(&Pba(BASE + 1)));
    }

    #[test]
    fn reserved_entry_retained_by_snapshot_is_not_reused() {
        let mut snapshot = Snapshot::default();
        snapshot.valid = true;
        snapshot.generation = Generation(5);
        let entry = Type2Entry {
            pba: Pba(1),
            last_vba: Vba::INVALID,
            alloc_gen: Generation(3),
            free_gen: Generation(7),
            key_id: 0,
            reserved: true,
        };
        assert!(!reusable(&entry, std::slice::from_ref(&snapshot), Generation(10)));
    }

    #[test]
    fn reserved_entry_freed_before_secured_generation_is_reusable() {
        let entry = Type2Entry {
            pba: Pba(1),
            last_vba: Vba::INVALID,
            alloc_gen: Generation(3),
            free_gen: Generation(4),
            key_id: 0,
            reserved: true,
        };
        assert!(reusable(&entry, &[], Generation(10)));
    }

    #[test]
    fn insufficient_free_blocks_yields_unsuccessful_completion() {
        let geometry = TreeGeometry::new(64, 2, 64);
        let hasher = Sha256Hasher;
        let mut cache = Cache::new(16);

        // All entries empty: nothing reusable anywhere in the tree.
        let type2 = Block::zeroed();
        let type2_hash = hasher.hash(&type2);
        let mut root = Block::zeroed();
        root.set_type1_entry(0, 64, NodeEntry { pba: Pba(2), generation: Generation(1), hash: type2_hash });
        let root_hash = hasher.hash(&root);

        cache.submit(Pba(1)).unwrap();
        cache.mark_complete(Pba(1), root);
        cache.submit(Pba(2)).unwrap();
        cache.mark_complete(Pba(2), type2);

        let mut ft = FreeTree::new(geometry, Pba(0));
        ft.submit_request(Pba(1), Generation(1), root_hash, Vec::new(), 1, Generation(2), Generation(1), Vba(9)).unwrap();

        let mut now = 1;
        loop {
            if ft.execute(&mut cache, &hasher, &[], now).unwrap() {
                now += 1;
                continue;
            }
            break;
        }

        let (success, found, _) = ft.peek_completed().unwrap();
        assert!(!success);
        assert!(found.is_empty());
    }
}
