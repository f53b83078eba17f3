//! Pool / Splitter: turns one client [`Request`] into a sequence of
//! single-VBA sub-operations, enforces at most one in-flight primitive per
//! VBA, and reassembles completions in the order requests were submitted
//! (spec §4.8).
//!
//! The engine only ever drives one VBA through the VBD/free-tree/write-back
//! pipeline at a time (spec §4.2 "Suspension and interleaving"), so the Pool
//! also doubles as the single source of "what's next" for the Library's
//! scheduling loop.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::block::Block;
use crate::error::{CbeError, CbeResult};
use crate::primitive::{Operation, Request};
use crate::types::Vba;

#[derive(Debug, Clone, Copy)]
pub struct SubOp {
    pub vba: Vba,
    pub op: Operation,
    pub index: u32,
}

struct PendingRequest {
    request: Request,
    remaining: VecDeque<SubOp>,
    in_flight: Option<SubOp>,
    success: bool,
    /// Read results, indexed the same way as the sub-ops that produced them.
    read_data: Vec<Option<Block>>,
}

#[derive(Default)]
pub struct Pool {
    order: VecDeque<u64>,
    requests: HashMap<u64, PendingRequest>,
    busy_vbas: HashSet<Vba>,
}

impl Pool {
    pub fn new() -> Self { Pool::default() }

    /// `true` if none of `req`'s VBAs already have a primitive in flight.
    pub fn acceptable(&self, req: &Request) -> bool {
        if req.op == Operation::Sync {
            return true;
        }
        (0..req.count as u64).all(|i| !self.busy_vbas.contains(&Vba(req.vba.0 + i)))
    }

    pub fn submit(&mut self, req: Request) -> CbeResult<()> {
        if self.requests.contains_key(&req.tag) {
            return Err(CbeError::ProtocolMisuse("pool.submit with a tag already in flight"));
        }
        if !self.acceptable(&req) {
            return Err(CbeError::VbaBusy(req.vba));
        }

        let mut remaining = VecDeque::new();
        let count = if req.op == Operation::Sync { 0 } else { req.count.max(1) };
        for i in 0..count {
            let vba = Vba(req.vba.0 + i as u64);
            self.busy_vbas.insert(vba);
            remaining.push_back(SubOp { vba, op: req.op, index: i });
        }

        let read_data = vec![None; count as usize];
        self.requests.insert(req.tag, PendingRequest { request: req, remaining, in_flight: None, success: true, read_data });
        self.order.push_back(req.tag);
        Ok(())
    }

    /// Pull the next sub-op to drive through the translation pipeline, from
    /// whichever pending request is oldest and still has work left.
    pub fn next_sub_op(&mut self) -> Option<(u64, SubOp)> {
        for &tag in &self.order {
            let pending = self.requests.get_mut(&tag)?;
            if pending.in_flight.is_some() {
                return None; // oldest request still waiting on its current sub-op
            }
            if let Some(sub) = pending.remaining.pop_front() {
                pending.in_flight = Some(sub);
                return Some((tag, sub));
            }
        }
        None
    }

    pub fn complete_sub_op(&mut self, tag: u64, success: bool, data: Option<Block>) {
        let Some(pending) = self.requests.get_mut(&tag) else { return };
        let Some(sub) = pending.in_flight.take() else { return };
        self.busy_vbas.remove(&sub.vba);
        pending.success &= success;
        if let Some(block) = data {
            pending.read_data[sub.index as usize] = Some(block);
        }
    }

    /// The oldest submitted request's tag, once it and every request ahead
    /// of it in submission order has finished (FIFO completion).
    pub fn peek_completed(&self) -> Option<u64> {
        let &tag = self.order.front()?;
        let pending = self.requests.get(&tag)?;
        if pending.in_flight.is_none() && pending.remaining.is_empty() {
            Some(tag)
        } else {
            None
        }
    }

    pub fn drop_completed(&mut self, tag: u64) -> CbeResult<(bool, Vec<Option<Block>>)> {
        if self.peek_completed() != Some(tag) {
            return Err(CbeError::ProtocolMisuse("pool.drop_completed out of FIFO order or not yet complete"));
        }
        self.order.pop_front();
        let pending = self.requests.remove(&tag).expect("peek_completed guarantees presence");
        Ok((pending.success, pending.read_data))
    }

    pub fn request_op(&self, tag: u64) -> Option<Operation> { self.requests.get(&tag).map(|p| p.request.op) }

    /// `true` once every submitted request has been harvested; Sync-SB waits
    /// for this before it may flush the cache (spec §4.9 step 1 "quiesce").
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlapping_vba_while_in_flight() {
        let mut pool = Pool::new();
        pool.submit(Request::write(Vba(0), 1, 1)).unwrap();
        assert!(matches!(pool.submit(Request::write(Vba(0), 1, 2)), Err(CbeError::VbaBusy(_))));
    }

    #[test]
    fn completion_surfaces_fifo_even_though_both_can_run_back_to_back() {
        let mut pool = Pool::new();
        pool.submit(Request::write(Vba(0), 1, 1)).unwrap();
        pool.submit(Request::write(Vba(1), 1, 2)).unwrap();

        let (tag, _sub) = pool.next_sub_op().unwrap();
        assert_eq!(tag, 1, "the older request's sub-op is pulled first");
        pool.complete_sub_op(tag, true, None);

        // request 2's sub-op may start right away...
        let (tag, _sub) = pool.next_sub_op().unwrap();
        assert_eq!(tag, 2);
        pool.complete_sub_op(tag, true, None);

        // ...but only request 1 may be harvested until it is drained, even
        // though request 2 is also fully done underneath.
        assert_eq!(pool.peek_completed(), Some(1));
        pool.drop_completed(1).unwrap();
        assert_eq!(pool.peek_completed(), Some(2));
    }

    #[test]
    fn a_request_with_no_work_left_blocks_the_pipeline_until_harvested() {
        let mut pool = Pool::new();
        pool.submit(Request::write(Vba(0), 1, 1)).unwrap();
        let (tag, _) = pool.next_sub_op().unwrap();
        pool.complete_sub_op(tag, true, None);
        // nothing else queued behind it, so there's simply no more work
        assert!(pool.next_sub_op().is_none());
        pool.drop_completed(1).unwrap();
    }
}
