//! Re-hashes and relocates one VBD path bottom-up, then writes every new
//! node out (spec §4.5).
//!
//! Crypto and backend I/O are owned by separate modules ([`CryptoDispatch`],
//! [`IoDispatch`]); write-back only submits into them and polls for
//! completion, the same discipline [`crate::translation::Translation`] and
//! [`crate::free_tree::FreeTree`] use against [`Cache`].

use crate::block::Block;
use crate::cache::Cache;
use crate::collab::BlockHasher;
use crate::crypto_dispatch::CryptoDispatch;
use crate::error::{CbeError, CbeResult};
use crate::io_dispatch::IoDispatch;
use crate::primitive::Tag;
use crate::translation::TreeGeometry;
use crate::types::{Generation, Hash, NodeEntry, Pba, Vba};

struct Req {
    vba: Vba,
    new_gen: Generation,
    key_id: u32,
    height: usize,
    /// `old_pba[i]` for `i` in `1..=height`: the node currently occupying
    /// level `i`, fetched through [`Cache`] to be patched. `old_pba[0]` is
    /// unused (the leaf is replaced outright, never patched).
    old_pba: Vec<Pba>,
    /// `new_pba[i]` for `i` in `0..=height`: the fresh PBA level `i`'s node
    /// is relocated to, as allocated by the free tree.
    new_pba: Vec<Pba>,
    hashes: Vec<Option<Hash>>,
    blocks: Vec<Option<Block>>,
    encrypt_submitted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    EncryptingLeaf,
    PatchingLevels,
    WritingOut,
    Done { success: bool },
}

pub struct WriteBack {
    geometry: TreeGeometry,
    state: State,
    patch_level: usize,
    write_cursor: usize,
    req: Option<Req>,
}

impl WriteBack {
    pub fn new(geometry: TreeGeometry) -> Self {
        WriteBack { geometry, state: State::Idle, patch_level: 1, write_cursor: 0, req: None }
    }

    pub fn acceptable(&self) -> bool { matches!(self.state, State::Idle | State::Done { .. }) }

    /// `old_pba`/`new_pba` must both have `height + 1` entries, indexed by
    /// VBD level (`[0]` is the leaf).
    pub fn submit(
        &mut self,
        vba: Vba,
        new_gen: Generation,
        key_id: u32,
        leaf_plain: Block,
        old_pba: Vec<Pba>,
        new_pba: Vec<Pba>,
    ) -> CbeResult<()> {
        if !self.acceptable() {
            return Err(CbeError::ProtocolMisuse("write_back.submit while a request is in progress"));
        }
        let height = self.geometry.height;
        if old_pba.len() != height + 1 || new_pba.len() != height + 1 {
            return Err(CbeError::ProtocolMisuse("write_back.submit with a path not matching the tree height"));
        }
        let blocks = vec![None; height + 1];
        let hashes = vec![None; height + 1];
        self.req = Some(Req { vba, new_gen, key_id, height, old_pba, new_pba, hashes, blocks, encrypt_submitted: false });
        self.patch_level = 1;
        self.write_cursor = 0;
        self.state = State::EncryptingLeaf;
        // Stash the plaintext in blocks[0] transiently; step_encrypt consumes it.
        self.req.as_mut().unwrap().blocks[0] = Some(leaf_plain);
        Ok(())
    }

    pub fn execute(
        &mut self,
        cache: &mut Cache,
        crypto: &mut CryptoDispatch,
        hasher: &dyn BlockHasher,
        io: &mut IoDispatch,
        now: u64,
    ) -> CbeResult<bool> {
        match self.state {
            State::Idle | State::Done { .. } => Ok(false),
            State::EncryptingLeaf => self.step_encrypt(crypto, hasher),
            State::PatchingLevels => self.step_patch(cache, hasher, now),
            State::WritingOut => self.step_write(cache, io),
        }
    }

    fn step_encrypt(&mut self, crypto: &mut CryptoDispatch, hasher: &dyn BlockHasher) -> CbeResult<bool> {
        let req = self.req.as_mut().expect("encrypting implies a request is active");
        if !req.encrypt_submitted {
            let plain = req.blocks[0].take().expect("leaf plaintext staged at submit time");
            crypto.submit_encryption(plain, req.key_id)?;
            req.encrypt_submitted = true;
            return Ok(true);
        }
        match crypto.peek_completed_encrypt() {
            Some(ciphertext) => {
                let hash = hasher.hash(ciphertext);
                let ciphertext = ciphertext.clone();
                crypto.take_encrypted()?;
                req.blocks[0] = Some(ciphertext);
                req.hashes[0] = Some(hash);
                self.state = State::PatchingLevels;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn step_patch(&mut self, cache: &mut Cache, hasher: &dyn BlockHasher, now: u64) -> CbeResult<bool> {
        let req = self.req.as_ref().expect("patching implies a request is active");
        let level = self.patch_level;
        if level > req.height {
            self.state = State::WritingOut;
            return Ok(true);
        }

        let old_pba = req.old_pba[level];
        if !cache.available(old_pba) {
            if cache.acceptable(old_pba) {
                cache.submit(old_pba)?;
                return Ok(true);
            }
            return Ok(false);
        }

        let idx = cache.index(old_pba, now);
        let mut block = cache.data(idx).clone();
        let child_index = self.geometry.index(req.vba, level - 1);
        let child_hash = req.hashes[level - 1].expect("lower level hashed before its parent is patched");
        block.set_type1_entry(
            child_index,
            self.geometry.degree,
            NodeEntry { pba: req.new_pba[level - 1], generation: req.new_gen, hash: child_hash },
        );
        let new_hash = hasher.hash(&block);

        let req = self.req.as_mut().unwrap();
        req.blocks[level] = Some(block);
        req.hashes[level] = Some(new_hash);
        self.patch_level += 1;
        Ok(true)
    }

    fn step_write(&mut self, cache: &mut Cache, io: &mut IoDispatch) -> CbeResult<bool> {
        let req = self.req.as_mut().expect("writing out implies a request is active");
        if self.write_cursor > req.height {
            self.state = State::Done { success: true };
            return Ok(true);
        }
        let i = self.write_cursor;
        let pba = req.new_pba[i];
        let block = req.blocks[i].clone().expect("every level was hashed and staged before write-out");
        io.submit_write(pba, Tag::WriteBack, block.clone());
        cache.submit(pba)?;
        cache.mark_complete(pba, block);
        self.write_cursor += 1;
        Ok(true)
    }

    /// `(success, new_root_hash)` once the whole path has been queued for
    /// write. The root hash belongs in the snapshot under construction.
    pub fn peek_completed(&self) -> Option<(bool, Hash)> {
        match self.state {
            State::Done { success } => {
                let req = self.req.as_ref().expect("Done state always carries its request");
                Some((success, req.hashes[req.height].unwrap_or(Hash::ZERO)))
            }
            _ => None,
        }
    }

    pub fn drop_completed(&mut self) -> CbeResult<()> {
        if !matches!(self.state, State::Done { .. }) {
            return Err(CbeError::ProtocolMisuse("write_back.drop_completed with no result pending"));
        }
        self.state = State::Idle;
        self.req = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ref_impls::{AesGcmSivCipher, MemBackend, Sha256Hasher};
    use crate::types::Generation;

    #[test]
    fn relocates_a_single_level_path_and_emits_one_write_per_level() {
        let geometry = TreeGeometry::new(64, 1, 64);
        let hasher = Sha256Hasher;
        let mut cipher = AesGcmSivCipher::new([1u8; 32]);
        let mut backend = MemBackend::new(16);
        let mut cache = Cache::new(16);
        let mut crypto = CryptoDispatch::new();
        let mut io = IoDispatch::new();

        let old_root = Block::zeroed();
        cache.submit(Pba(1)).unwrap();
        cache.mark_complete(Pba(1), old_root);

        let mut leaf_plain = Block::zeroed();
        leaf_plain.as_mut_slice()[0] = 0x99;

        let mut wb = WriteBack::new(geometry);
        wb.submit(Vba(3), Generation(2), 0, leaf_plain, vec![Pba::INVALID, Pba(1)], vec![Pba(10), Pba(11)]).unwrap();

        let mut now = 1;
        loop {
            let crypto_progress = crypto.execute(&mut cipher);
            let wb_progress = wb.execute(&mut cache, &mut crypto, &hasher, &mut io, now).unwrap();
            let io_progress = io.execute(&mut backend).unwrap();
            now += 1;
            if !crypto_progress && !wb_progress && !io_progress {
                break;
            }
        }

        let (success, _root_hash) = wb.peek_completed().unwrap();
        assert!(success);

        let mut seen_pbas = vec![];
        while let Some(c) = io.drop_completed() {
            seen_pbas.push(c.pba);
        }
        assert_eq!(seen_pbas, vec![Pba(10), Pba(11)]);
    }
}
