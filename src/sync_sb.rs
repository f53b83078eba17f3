//! Sync-SB: quiesces the client face, flushes dirty cache contents, and
//! publishes a new superblock slot (spec §4.9).
//!
//! The Library owns generation bookkeeping and composes the actual
//! [`Superblock`] value; this module only drives the mechanical steps and
//! exposes how far along it is so the Library knows when composition and
//! slot-write may happen.

use crate::block::Block;
use crate::cache::Cache;
use crate::error::{CbeError, CbeResult};
use crate::io_dispatch::IoDispatch;
use crate::primitive::Tag;
use crate::types::Pba;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Quiescing,
    FlushingCache,
    ReadyToCompose,
    WritingSlot,
    Done { success: bool },
}

pub struct SyncSb {
    state: State,
    slot_pba: Pba,
    block: Option<Block>,
    write_submitted: bool,
}

impl SyncSb {
    pub fn new() -> Self { SyncSb { state: State::Idle, slot_pba: Pba::INVALID, block: None, write_submitted: false } }

    pub fn acceptable(&self) -> bool { matches!(self.state, State::Idle | State::Done { .. }) }

    /// True while a seal is in progress; the host must refuse new client
    /// primitives for as long as this holds (spec §4.9 step 1 "quiesce").
    pub fn is_active(&self) -> bool { !matches!(self.state, State::Idle | State::Done { .. }) }

    pub fn start(&mut self) -> CbeResult<()> {
        if !self.acceptable() {
            return Err(CbeError::ProtocolMisuse("sync_sb.start while a seal is already in progress"));
        }
        self.state = State::Quiescing;
        self.write_submitted = false;
        self.block = None;
        Ok(())
    }

    /// Advance past quiescing once the Pool reports no in-flight client
    /// primitives left to drain.
    pub fn quiesced(&mut self, pool_drained: bool) -> bool {
        if self.state == State::Quiescing && pool_drained {
            self.state = State::FlushingCache;
            true
        } else {
            false
        }
    }

    /// Flush one dirty cache slot per call until none remain.
    pub fn flush_step(&mut self, cache: &mut Cache, io: &mut IoDispatch) -> CbeResult<bool> {
        if self.state != State::FlushingCache {
            return Ok(false);
        }
        let Some((pba, idx)) = cache.dirty_slots().into_iter().next() else {
            self.state = State::ReadyToCompose;
            return Ok(true);
        };
        io.submit_write(pba, Tag::CacheFlush, cache.data(idx).clone());
        cache.mark_clean(idx);
        Ok(true)
    }

    pub fn ready_to_compose(&self) -> bool { self.state == State::ReadyToCompose }

    /// Hand over the composed, already-hashed slot image to be written to
    /// `slot_pba`.
    pub fn begin_write(&mut self, slot_pba: Pba, block: Block) -> CbeResult<()> {
        if self.state != State::ReadyToCompose {
            return Err(CbeError::ProtocolMisuse("sync_sb.begin_write before the cache has been flushed"));
        }
        self.slot_pba = slot_pba;
        self.block = Some(block);
        self.write_submitted = false;
        self.state = State::WritingSlot;
        Ok(())
    }

    pub fn write_step(&mut self, io: &mut IoDispatch) -> CbeResult<bool> {
        if self.state != State::WritingSlot {
            return Ok(false);
        }
        if !self.write_submitted {
            let block = self.block.clone().expect("WritingSlot always carries a staged block");
            io.submit_write(self.slot_pba, Tag::SyncSb, block);
            self.write_submitted = true;
            return Ok(true);
        }
        match io.peek_completed() {
            Some(c) if c.tag == Tag::SyncSb && c.pba == self.slot_pba => {
                io.drop_completed();
                self.state = State::Done { success: true };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// `Some(slot_pba)` once the new slot has been durably written.
    pub fn peek_completed(&self) -> Option<Pba> {
        match self.state {
            State::Done { success: true } => Some(self.slot_pba),
            _ => None,
        }
    }

    pub fn drop_completed(&mut self) -> CbeResult<()> {
        if !matches!(self.state, State::Done { .. }) {
            return Err(CbeError::ProtocolMisuse("sync_sb.drop_completed with nothing pending"));
        }
        self.state = State::Idle;
        self.block = None;
        Ok(())
    }
}

impl Default for SyncSb {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ref_impls::MemBackend;

    #[test]
    fn drives_quiesce_flush_and_write_in_order() {
        let mut sync_sb = SyncSb::new();
        let mut cache = Cache::new(4);
        let mut io = IoDispatch::new();
        let mut backend = MemBackend::new(8);

        cache.submit(Pba(3)).unwrap();
        cache.mark_complete(Pba(3), Block::zeroed());
        let idx = cache.index(Pba(3), 1);
        cache.mark_dirty(idx);

        sync_sb.start().unwrap();
        assert!(sync_sb.is_active());
        assert!(!sync_sb.quiesced(false));
        assert!(sync_sb.quiesced(true));

        while sync_sb.flush_step(&mut cache, &mut io).unwrap() {
            io.execute(&mut backend).unwrap();
        }
        assert!(!cache.dirty());
        assert!(sync_sb.ready_to_compose());

        sync_sb.begin_write(Pba(0), Block::zeroed()).unwrap();
        while sync_sb.write_step(&mut io).unwrap() {
            io.execute(&mut backend).unwrap();
        }
        assert_eq!(sync_sb.peek_completed(), Some(Pba(0)));
        sync_sb.drop_completed().unwrap();
        assert!(sync_sb.acceptable());
    }
}
