//! The engine itself: wires every module in this crate into the cooperative,
//! step-driven pipeline described by spec §4.10 "Library (top-level engine)"
//! and exposes the external interface from spec §6.
//!
//! Where the distilled interface describes a pump protocol (separate
//! `*_data_required`/`supply_*`/`obtain_*` calls so a caller can loan buffers
//! across an RPC boundary), this engine collapses that into directly-owned
//! [`CryptoDispatch`]/[`IoDispatch`] instances driven internally by
//! [`Library::execute`]: Rust's ownership model makes the loaning ceremony
//! unnecessary when the dispatchers live inside the same process as their
//! caller. `is_sealing_generation`/`start_sealing_generation` and
//! `is_securing_superblock`/`start_securing_superblock` are likewise aliased
//! onto the single [`SyncSb`] mechanism described by spec §4.9, which already
//! combines both steps. See DESIGN.md for the full list of such collapses.

use std::collections::{HashMap, VecDeque};

use crate::block::Block;
use crate::cache::Cache;
use crate::collab::{BlockBackend, BlockCipher, BlockHasher};
use crate::config::Config;
use crate::crypto_dispatch::CryptoDispatch;
use crate::error::{CbeError, CbeResult};
use crate::free_tree::FreeTree;
use crate::io_dispatch::IoDispatch;
use crate::pool::{Pool, SubOp};
use crate::primitive::{Operation, Request, Tag};
use crate::superblock::{select_active_slot, Superblock};
use crate::sync_sb::SyncSb;
use crate::translation::TreeGeometry;
use crate::types::{Generation, Pba, Snapshot, Vba, SB_SLOTS};
use crate::vbd::Vbd;
use crate::write_back::WriteBack;

/// Whether the engine will still accept client requests. Set to `Poisoned`
/// and never cleared once [`CbeError::HashMismatch`] or
/// [`CbeError::ProtocolMisuse`] is observed (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Resolving,
    ReadingLeaf,
    Decrypting,
    Allocating,
    Stalled,
    WritingBack,
}

struct InFlight {
    tag: u64,
    sub: SubOp,
    stage: Stage,
    leaf_pba: Pba,
    leaf_hash: crate::types::Hash,
    old_pbas: Vec<Pba>,
    new_pbas: Vec<Pba>,
    write_back_submitted: bool,
}

/// Top-level engine tying [`Cache`], [`Vbd`], [`FreeTree`], [`WriteBack`],
/// [`CryptoDispatch`], [`IoDispatch`], [`Pool`] and [`SyncSb`] together
/// behind the request-facing interface described by spec §6.
pub struct Library<B: BlockBackend, C: BlockCipher, H: BlockHasher> {
    backend: B,
    cipher: C,
    hasher: H,

    cache: Cache,
    vbd: Vbd,
    free_tree: FreeTree,
    write_back: WriteBack,
    crypto: CryptoDispatch,
    io: IoDispatch,
    pool: Pool,
    sync_sb: SyncSb,

    superblock: Superblock,
    active_slot: usize,
    current_generation: Generation,
    last_secured_generation: Generation,

    state: EngineState,
    inflight: Option<InFlight>,
    write_payload: HashMap<u64, Vec<Block>>,
    pending_syncs: VecDeque<u64>,
    completed_syncs: VecDeque<u64>,

    config: Config,
    last_sync_ms: u64,
    last_secure_ms: u64,

    /// A single hard-coded key covers every block this engine writes; key
    /// rotation and a key hierarchy are out of scope (spec Non-goals,
    /// Open Question "key_id").
    key_id: u32,
}

impl<B: BlockBackend, C: BlockCipher, H: BlockHasher> Library<B, C, H> {
    /// Build a brand-new image: a VBD of `vbd_degree`/`vbd_height`/
    /// `vbd_leaves` backed by a shared all-zero sparse subtree (so every
    /// unwritten leaf reads back as zero without needing its own physical
    /// block), and a free tree able to describe `free_pool_size` physical
    /// PBAs.
    ///
    /// This only builds a single-level free tree (one type-1 root over a
    /// flat array of type-2 leaves); `free_pool_size` must fit in
    /// `free_tree_degree` leaves of `Block::type2_entries_per_block()`
    /// entries each. [`FreeTree`] itself supports deeper trees; this is a
    /// convenience constructor's scope limit, not an engine limit.
    #[allow(clippy::too_many_arguments)]
    pub fn format(
        mut backend: B,
        mut cipher: C,
        hasher: H,
        config: Config,
        vbd_degree: usize,
        vbd_height: usize,
        vbd_leaves: u64,
        free_pool_size: u64,
        key_id: u32,
    ) -> CbeResult<Self> {
        let free_tree_degree = 64usize;
        let per_block = Block::type2_entries_per_block() as u64;
        let num_type2_nodes = free_pool_size.div_ceil(per_block).max(1) as usize;
        if num_type2_nodes > free_tree_degree {
            return Err(CbeError::ProtocolMisuse(
                "format() only builds a single-level free tree; shrink free_pool_size",
            ));
        }
        let free_tree_leaves = (free_tree_degree * free_tree_degree) as u64;
        let free_tree_geometry = TreeGeometry::new(free_tree_degree, 2, free_tree_leaves);

        let mut next_pba = SB_SLOTS as u64;

        // --- VBD: a shared all-zero leaf, and one shared type-1 node per
        // level, so the whole address space resolves without per-leaf
        // physical storage until something is actually written.
        let zero_leaf_pba = Pba(next_pba);
        next_pba += 1;
        let zero_cipher = cipher.encrypt(key_id, &Block::zeroed());
        backend.write(zero_leaf_pba, &zero_cipher)?;

        let mut child_pba = zero_leaf_pba;
        let mut child_hash = hasher.hash(&zero_cipher);
        for _ in 0..vbd_height {
            let mut node = Block::zeroed();
            for i in 0..vbd_degree {
                node.set_type1_entry(
                    i,
                    vbd_degree,
                    crate::types::NodeEntry { pba: child_pba, generation: Generation::ZERO, hash: child_hash },
                );
            }
            node.zero_type1_padding(vbd_degree);
            let pba = Pba(next_pba);
            next_pba += 1;
            backend.write(pba, &node)?;
            child_hash = hasher.hash(&node);
            child_pba = pba;
        }
        let vbd_root_pba = child_pba;
        let vbd_root_hash = child_hash;

        // --- Free tree: a real (non-shared) type-2 leaf layer. Its own
        // nodes (the type-2 leaves and the root) are reserved first so the
        // pool of addresses it describes, `base_pba..base_pba+free_pool_size`,
        // never overlaps the tree's own infrastructure; any padding entries
        // past `free_pool_size` within the last leaf are stamped invalid so
        // they can never be mistaken for a reusable pba 0.
        let type2_pbas: Vec<Pba> = (0..num_type2_nodes)
            .map(|_| {
                let pba = Pba(next_pba);
                next_pba += 1;
                pba
            })
            .collect();
        let ft_root_pba = Pba(next_pba);
        next_pba += 1;
        let base_pba = Pba(next_pba);

        let mut type2_hashes = Vec::with_capacity(num_type2_nodes);
        for (node_idx, &pba) in type2_pbas.iter().enumerate() {
            let mut block = Block::zeroed();
            for slot in 0..per_block as usize {
                let global_slot = node_idx as u64 * per_block + slot as u64;
                let entry = if global_slot < free_pool_size {
                    crate::types::Type2Entry {
                        pba: Pba(base_pba.0 + global_slot),
                        last_vba: Vba::INVALID,
                        alloc_gen: Generation::ZERO,
                        free_gen: Generation::ZERO,
                        key_id,
                        reserved: false,
                    }
                } else {
                    crate::types::Type2Entry {
                        pba: Pba::INVALID,
                        last_vba: Vba::INVALID,
                        alloc_gen: Generation::ZERO,
                        free_gen: Generation::ZERO,
                        key_id,
                        reserved: false,
                    }
                };
                block.set_type2_entry(slot, per_block as usize, entry);
            }
            backend.write(pba, &block)?;
            type2_hashes.push(hasher.hash(&block));
        }
        let mut ft_root = Block::zeroed();
        for (i, &pba) in type2_pbas.iter().enumerate() {
            ft_root.set_type1_entry(
                i,
                free_tree_degree,
                crate::types::NodeEntry { pba, generation: Generation::ZERO, hash: type2_hashes[i] },
            );
        }
        ft_root.zero_type1_padding(free_tree_degree);
        backend.write(ft_root_pba, &ft_root)?;
        let ft_root_hash = hasher.hash(&ft_root);

        let vbd_geometry = TreeGeometry::new(vbd_degree, vbd_height, vbd_leaves);
        let superblock = Superblock::fresh(vbd_root_pba, vbd_root_hash, vbd_geometry, ft_root_pba, ft_root_hash, free_tree_geometry, base_pba);
        let slot_block = superblock.encode(&hasher);
        backend.write(Pba(0), &slot_block)?;

        Ok(Self::assemble(backend, cipher, hasher, config, superblock, 0, base_pba, key_id))
    }

    /// Reopen an existing image, selecting the most recently secured
    /// superblock slot (spec §4.9 "Recovery").
    pub fn open(mut backend: B, cipher: C, hasher: H, config: Config, key_id: u32) -> CbeResult<Self> {
        let mut slots = Vec::with_capacity(SB_SLOTS);
        for i in 0..SB_SLOTS {
            let mut block = Block::zeroed();
            backend.read(Pba(i as u64), &mut block)?;
            slots.push(block);
        }
        let (active_slot, superblock) = select_active_slot(&slots, &hasher)?;
        let base_pba = superblock.free_tree_base_pba;
        Ok(Self::assemble(backend, cipher, hasher, config, superblock, active_slot, base_pba, key_id))
    }

    fn assemble(backend: B, cipher: C, hasher: H, config: Config, superblock: Superblock, active_slot: usize, free_tree_base_pba: Pba, key_id: u32) -> Self {
        let vbd_geometry = superblock.vbd_geometry();
        let free_tree_geometry = superblock.free_tree_geometry;
        let cache_capacity = vbd_geometry.height + vbd_geometry.degree + 8;
        let current_generation = superblock.current_generation;
        let last_secured_generation = superblock.last_secured_generation;

        Library {
            backend,
            cipher,
            hasher,
            cache: Cache::new(cache_capacity),
            vbd: Vbd::new(vbd_geometry),
            free_tree: FreeTree::new(free_tree_geometry, free_tree_base_pba),
            write_back: WriteBack::new(vbd_geometry),
            crypto: CryptoDispatch::new(),
            io: IoDispatch::new(),
            pool: Pool::new(),
            sync_sb: SyncSb::new(),
            superblock,
            active_slot,
            current_generation,
            last_secured_generation,
            state: EngineState::Running,
            inflight: None,
            write_payload: HashMap::new(),
            pending_syncs: VecDeque::new(),
            completed_syncs: VecDeque::new(),
            config,
            last_sync_ms: 0,
            last_secure_ms: 0,
            key_id,
        }
    }

    pub fn max_vba(&self) -> Vba { self.vbd.max_vba() }

    pub fn cache_dirty(&self) -> bool { self.cache.dirty() }

    pub fn superblock_dirty(&self) -> bool { self.cache.dirty() || self.sync_sb.is_active() }

    pub fn is_sealing_generation(&self) -> bool { self.sync_sb.is_active() }

    pub fn start_sealing_generation(&mut self) -> CbeResult<()> { self.sync_sb.start() }

    pub fn is_securing_superblock(&self) -> bool { self.is_sealing_generation() }

    pub fn start_securing_superblock(&mut self) -> CbeResult<()> { self.start_sealing_generation() }

    pub fn client_request_acceptable(&self, req: &Request) -> bool {
        self.state == EngineState::Running && !self.sync_sb.is_active() && self.pool.acceptable(req)
    }

    /// Accept one client-level request. `write_data` must hold exactly
    /// `req.count.max(1)` blocks for a write request and must be `None`
    /// otherwise.
    pub fn submit_client_request(&mut self, req: Request, write_data: Option<Vec<Block>>) -> CbeResult<()> {
        if self.state == EngineState::Poisoned {
            return Err(CbeError::Poisoned);
        }
        if !self.client_request_acceptable(&req) {
            return Err(CbeError::VbaBusy(req.vba));
        }

        let max_vba = self.max_vba();
        if req.op != Operation::Sync {
            for i in 0..req.count.max(1) as u64 {
                let vba = Vba(req.vba.0 + i);
                if vba > max_vba {
                    return Err(CbeError::OutOfRange { vba, max_vba });
                }
            }
        }

        if req.op == Operation::Write {
            let data = write_data.ok_or(CbeError::ProtocolMisuse("write request submitted without data"))?;
            if data.len() != req.count.max(1) as usize {
                return Err(CbeError::ProtocolMisuse("write request data length does not match count"));
            }
            self.write_payload.insert(req.tag, data);
        } else if write_data.is_some() {
            return Err(CbeError::ProtocolMisuse("read/sync request submitted with write data"));
        }

        if req.op == Operation::Sync {
            self.pending_syncs.push_back(req.tag);
            return Ok(());
        }

        self.pool.submit(req)
    }

    pub fn peek_completed_client_request(&self) -> Option<u64> {
        if let Some(&tag) = self.completed_syncs.front() {
            return Some(tag);
        }
        self.pool.peek_completed()
    }

    /// `(success, per-block read data)`; the data vector is empty for
    /// writes and syncs.
    pub fn drop_completed_client_request(&mut self, tag: u64) -> CbeResult<(bool, Vec<Option<Block>>)> {
        if self.completed_syncs.front() == Some(&tag) {
            self.completed_syncs.pop_front();
            return Ok((true, Vec::new()));
        }
        self.pool.drop_completed(tag)
    }

    /// Retry a write whose free-tree allocation failed for lack of reusable
    /// PBAs (spec §4.4 step 3, §8 "Exhaustion"). Only valid while that write
    /// is still the in-flight one.
    pub fn retry_allocation(&mut self) -> CbeResult<()> {
        let Some(inflight) = self.inflight.as_mut() else {
            return Err(CbeError::ProtocolMisuse("retry_allocation with no write in flight"));
        };
        if inflight.stage != Stage::Stalled {
            return Err(CbeError::ProtocolMisuse("retry_allocation while no allocation has failed"));
        }
        self.free_tree.retry_allocation(self.current_generation, self.last_secured_generation, inflight.sub.vba)?;
        inflight.stage = Stage::Allocating;
        Ok(())
    }

    /// Drive the engine forward by one tick. `now` is a monotonically
    /// non-decreasing clock, used both as the cache's LRU stamp and as the
    /// wall-clock basis for the seal-interval triggers in [`Config`].
    /// Returns `Ok(true)` if observable state advanced; calling again at the
    /// same `now` with no new client input returns `Ok(false)` once the
    /// engine has reached a fixed point (spec §8 "fixed-point scheduler").
    pub fn execute(&mut self, now: u64) -> CbeResult<bool> {
        if self.state == EngineState::Poisoned {
            return Err(CbeError::Poisoned);
        }

        let mut progress = false;

        while let Some(prim) = self.cache.peek_generated() {
            if !self.io.acceptable() {
                break;
            }
            let pba = Pba(prim.block_number.0);
            self.io.submit_read(pba, Tag::CacheIo);
            self.cache.drop_generated(pba);
            progress = true;
        }

        // Drain every completion the Library itself is responsible for
        // routing, stopping at the first SyncSb completion so `advance_seal`
        // (which polls `io` directly) still finds it at the front.
        while let Some(c) = self.io.peek_completed() {
            match c.tag {
                Tag::CacheIo => {
                    let pba = c.pba;
                    let data = c.data.clone().expect("a CacheIo completion always carries data");
                    self.io.drop_completed();
                    self.cache.mark_complete(pba, data);
                    progress = true;
                }
                // WriteBack/CacheFlush writes are already reflected into the
                // cache synchronously by their issuing module; the I/O
                // completion itself just needs to be reclaimed so it doesn't
                // block the queue behind it.
                Tag::WriteBack | Tag::CacheFlush => {
                    self.io.drop_completed();
                    progress = true;
                }
                Tag::SyncSb => break,
                Tag::CryptoEncrypt | Tag::CryptoDecrypt => {
                    self.io.drop_completed();
                    progress = true;
                }
            }
        }

        if self.crypto.execute(&mut self.cipher) {
            progress = true;
        }

        match self.io.execute(&mut self.backend) {
            Ok(p) => progress |= p,
            Err(e) => return Err(self.poison(e)),
        }

        match self.advance_client_pipeline(now) {
            Ok(p) => progress |= p,
            Err(e) => return Err(self.poison(e)),
        }

        match self.advance_seal(now) {
            Ok(p) => progress |= p,
            Err(e) => return Err(self.poison(e)),
        }

        Ok(progress)
    }

    fn poison(&mut self, e: CbeError) -> CbeError {
        if matches!(e, CbeError::HashMismatch { .. } | CbeError::ProtocolMisuse(_)) {
            self.state = EngineState::Poisoned;
        }
        e
    }

    fn advance_client_pipeline(&mut self, now: u64) -> CbeResult<bool> {
        if self.inflight.is_none() {
            let Some((tag, sub)) = self.pool.next_sub_op() else { return Ok(false) };
            let snapshot = self.superblock.current_snapshot();
            self.vbd.submit(snapshot.root_pba, snapshot.generation, snapshot.root_hash, sub.vba)?;
            self.inflight = Some(InFlight {
                tag,
                sub,
                stage: Stage::Resolving,
                leaf_pba: Pba::INVALID,
                leaf_hash: crate::types::Hash::ZERO,
                old_pbas: Vec::new(),
                new_pbas: Vec::new(),
                write_back_submitted: false,
            });
            return Ok(true);
        }

        match self.inflight.as_ref().unwrap().stage {
            Stage::Resolving => self.step_resolving(now),
            Stage::ReadingLeaf => self.step_reading_leaf(now),
            Stage::Decrypting => self.step_decrypting(),
            Stage::Allocating => self.step_allocating(now),
            Stage::Stalled => Ok(false),
            Stage::WritingBack => self.step_writing_back(now),
        }
    }

    fn step_resolving(&mut self, now: u64) -> CbeResult<bool> {
        if let Some((leaf_pba, walk)) = self.vbd.resolve() {
            let height = self.vbd.geometry().height;
            let mut old_pbas = Vec::with_capacity(height + 1);
            old_pbas.push(leaf_pba);
            for level in 1..=height {
                old_pbas.push(walk[level].pba);
            }
            let leaf_hash = walk[0].hash;
            self.vbd.drop_completed()?;

            let inflight = self.inflight.as_mut().expect("resolving implies a request is in flight");
            inflight.leaf_pba = leaf_pba;
            inflight.leaf_hash = leaf_hash;
            inflight.old_pbas = old_pbas;
            inflight.stage = match inflight.sub.op {
                Operation::Read => Stage::ReadingLeaf,
                Operation::Write => Stage::Allocating,
                Operation::Sync => unreachable!("sync requests never enter the pool pipeline"),
            };
            return Ok(true);
        }
        self.vbd.execute(&mut self.cache, &self.hasher, now)
    }

    fn step_reading_leaf(&mut self, now: u64) -> CbeResult<bool> {
        let leaf_pba = self.inflight.as_ref().unwrap().leaf_pba;
        if !self.cache.available(leaf_pba) {
            if self.cache.acceptable(leaf_pba) {
                self.cache.submit(leaf_pba)?;
                return Ok(true);
            }
            return Ok(false);
        }

        let idx = self.cache.index(leaf_pba, now);
        let computed = self.hasher.hash(self.cache.data(idx));
        let expected = self.inflight.as_ref().unwrap().leaf_hash;
        if computed != expected {
            return Err(CbeError::HashMismatch { pba: leaf_pba });
        }

        let ciphertext = self.cache.data(idx).clone();
        self.crypto.submit_decryption(ciphertext, self.key_id)?;
        self.inflight.as_mut().unwrap().stage = Stage::Decrypting;
        Ok(true)
    }

    fn step_decrypting(&mut self) -> CbeResult<bool> {
        if self.crypto.peek_completed_decrypt().is_none() {
            return Ok(false);
        }
        let plain = self.crypto.take_decrypted()?;
        let inflight = self.inflight.take().expect("decrypting implies a request is in flight");
        self.pool.complete_sub_op(inflight.tag, true, Some(plain));
        Ok(true)
    }

    fn step_allocating(&mut self, now: u64) -> CbeResult<bool> {
        let has_result = self.free_tree.peek_completed().is_some();
        if !has_result {
            let not_yet_submitted = self.inflight.as_ref().unwrap().new_pbas.is_empty();
            if self.free_tree.acceptable() && not_yet_submitted {
                let height = self.vbd.geometry().height;
                let base_pba = self.free_tree.base_pba();
                let inflight = self.inflight.as_ref().unwrap();
                // The shared zero-subtree a fresh image resolves through
                // (`format()`'s zero leaf and per-level type-1 nodes) lives
                // below `base_pba` and has no type-2 entry of its own; only
                // PBAs the free tree actually describes may be freed.
                let free_pbas: Vec<Pba> = inflight.old_pbas.iter().copied().filter(|pba| pba.0 >= base_pba.0).collect();
                self.free_tree.submit_request(
                    self.superblock.free_tree_root_pba,
                    self.current_generation,
                    self.superblock.free_tree_root_hash,
                    free_pbas,
                    height + 1,
                    self.current_generation,
                    self.last_secured_generation,
                    inflight.sub.vba,
                )?;
                return Ok(true);
            }
            return self.free_tree.execute(&mut self.cache, &self.hasher, &self.superblock.snapshots, now);
        }

        let (success, found, new_root_hash) = {
            let (success, found, new_root_hash) = self.free_tree.peek_completed().unwrap();
            (success, found.to_vec(), new_root_hash)
        };

        if !success {
            // Leave the free tree in `Done{success: false}` rather than
            // dropping its completion: `retry_allocation` requires exactly
            // that state to resubmit the query.
            self.inflight.as_mut().unwrap().stage = Stage::Stalled;
            return Ok(true);
        }

        self.free_tree.drop_completed()?;
        self.superblock.free_tree_root_hash = new_root_hash;
        let inflight = self.inflight.as_mut().unwrap();
        inflight.new_pbas = found;
        inflight.stage = Stage::WritingBack;
        Ok(true)
    }

    fn step_writing_back(&mut self, now: u64) -> CbeResult<bool> {
        if !self.inflight.as_ref().unwrap().write_back_submitted {
            let (vba, tag, index, old_pbas, new_pbas) = {
                let inflight = self.inflight.as_ref().unwrap();
                (inflight.sub.vba, inflight.tag, inflight.sub.index, inflight.old_pbas.clone(), inflight.new_pbas.clone())
            };
            let leaf_plain = self
                .write_payload
                .get(&tag)
                .and_then(|blocks| blocks.get(index as usize))
                .cloned()
                .expect("write payload staged at submit time");
            self.write_back.submit(vba, self.current_generation, self.key_id, leaf_plain, old_pbas, new_pbas)?;
            self.inflight.as_mut().unwrap().write_back_submitted = true;
            return Ok(true);
        }

        if let Some((success, new_root_hash)) = self.write_back.peek_completed() {
            self.write_back.drop_completed()?;
            let inflight = self.inflight.take().expect("writing back implies a request is in flight");
            if success {
                let new_root_pba = *inflight.new_pbas.last().expect("new_pbas holds one entry per level plus the root");
                self.apply_new_root(new_root_pba, new_root_hash);
            }
            self.write_payload.remove(&inflight.tag);
            self.pool.complete_sub_op(inflight.tag, success, None);
            return Ok(true);
        }

        self.write_back.execute(&mut self.cache, &mut self.crypto, &self.hasher, &mut self.io, now)
    }

    fn apply_new_root(&mut self, new_root_pba: Pba, new_root_hash: crate::types::Hash) {
        let idx = self.superblock.snapshot_index as usize;
        self.superblock.snapshots[idx].root_pba = new_root_pba;
        self.superblock.snapshots[idx].root_hash = new_root_hash;
    }

    fn should_seal(&self, now_ms: u64) -> bool {
        !self.pending_syncs.is_empty()
            || now_ms.saturating_sub(self.last_secure_ms) >= self.config.secure_interval_ms
            || (self.cache.dirty() && now_ms.saturating_sub(self.last_sync_ms) >= self.config.sync_interval_ms)
    }

    fn advance_seal(&mut self, now_ms: u64) -> CbeResult<bool> {
        if !self.sync_sb.is_active() {
            if self.should_seal(now_ms) {
                self.sync_sb.start()?;
                return Ok(true);
            }
            return Ok(false);
        }

        let mut progress = false;
        if self.sync_sb.quiesced(self.pool.is_empty()) {
            progress = true;
        }
        if self.sync_sb.flush_step(&mut self.cache, &mut self.io)? {
            progress = true;
        }

        if self.sync_sb.ready_to_compose() {
            self.finish_seal();
            let next_slot = (self.active_slot + 1) % SB_SLOTS;
            let block = self.superblock.encode(&self.hasher);
            self.sync_sb.begin_write(Pba(next_slot as u64), block)?;
            self.active_slot = next_slot;
            if self.config.show_progress {
                log::info!("sealed generation {}, new slot {}", self.last_secured_generation, next_slot);
            }
            progress = true;
        }

        if self.sync_sb.write_step(&mut self.io)? {
            progress = true;
        }

        if self.sync_sb.peek_completed().is_some() {
            self.sync_sb.drop_completed()?;
            self.last_secure_ms = now_ms;
            self.last_sync_ms = now_ms;
            if let Some(tag) = self.pending_syncs.pop_front() {
                self.completed_syncs.push_back(tag);
            }
            progress = true;
        }

        Ok(progress)
    }

    /// Seal the current generation: stamp it durable, then fork a fresh
    /// "current" snapshot slot from it for subsequent writes to mutate
    /// (spec §4.9 step 3 "compose new superblock").
    fn finish_seal(&mut self) {
        let sealed_gen = self.current_generation;
        let sealed_idx = self.superblock.snapshot_index as usize;
        self.superblock.snapshots[sealed_idx].generation = sealed_gen;
        self.superblock.snapshots[sealed_idx].valid = true;

        let sealed = self.superblock.snapshots[sealed_idx];
        let next_gen = sealed_gen.next();
        let next_idx = (sealed_idx + 1) % crate::types::NUM_SNAPSHOTS;
        self.superblock.snapshots[next_idx] = Snapshot { generation: next_gen, ..sealed };
        self.superblock.snapshot_index = next_idx as u16;

        self.superblock.last_secured_generation = sealed_gen;
        self.superblock.current_generation = next_gen;
        self.last_secured_generation = sealed_gen;
        self.current_generation = next_gen;
    }
}
