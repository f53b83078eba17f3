//! Fixed parameters and core addressing types (spec §3 "Fixed parameters" / "Addresses and identifiers").

use std::fmt;

/// Size in bytes of every block moving through the engine, on disk and in cache.
pub const BLOCK_SIZE: usize = 4096;
/// Size in bytes of a hash digest as produced by the external hash collaborator.
pub const HASH_SIZE: usize = 32;
/// Number of superblock slots at the head of the backend address space.
pub const SB_SLOTS: usize = 8;
/// Number of retained snapshots inside a superblock.
pub const NUM_SNAPSHOTS: usize = 48;
/// Maximum height of a translation tree (VBD or free tree) this engine will walk.
pub const MAX_TREE_LEVELS: usize = 6;
/// Bound on concurrently pursued free-tree query branches (one per type-2 leaf visited).
pub const MAX_QUERY_BRANCHES: usize = 8;
/// Bound on free PBAs harvested from a single type-2 leaf during one query.
pub const MAX_FREE_BLOCKS_PER_BRANCH: usize = 64;

/// On-disk byte footprint of one type-1 (inner/data-pointer) entry: pba(8) + generation(8) + hash(32).
pub const TYPE1_ENTRY_SIZE: usize = 8 + 8 + HASH_SIZE;
/// On-disk byte footprint of one type-2 (free-list leaf) entry:
/// pba(8) + last_vba(8) + alloc_gen(8) + free_gen(8) + key_id(4) + reserved(1) + pad(3).
pub const TYPE2_ENTRY_SIZE: usize = 8 + 8 + 8 + 8 + 4 + 1 + 3;

/// Physical Block Address: a 64-bit index into the backend block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pba(pub u64);

impl Pba {
    pub const INVALID: Pba = Pba(u64::MAX);

    #[inline]
    pub fn is_valid(self) -> bool { self != Self::INVALID }
}

impl fmt::Display for Pba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() { write!(f, "pba:{}", self.0) } else { write!(f, "pba:INVALID") }
    }
}

/// Virtual Block Address: a 64-bit index into the client-visible device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vba(pub u64);

impl Vba {
    pub const INVALID: Vba = Vba(u64::MAX);

    #[inline]
    pub fn is_valid(self) -> bool { self != Self::INVALID }
}

impl fmt::Display for Vba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() { write!(f, "vba:{}", self.0) } else { write!(f, "vba:INVALID") }
    }
}

/// A monotonically non-decreasing generation counter. Treated as an opaque ordered
/// token per spec §3; the engine never interprets the top bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub const ZERO: Generation = Generation(0);

    #[inline]
    pub fn next(self) -> Generation { Generation(self.0 + 1) }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "gen:{}", self.0) }
}

/// A 32-byte digest produced by the external hash collaborator over one 4 KiB block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

impl Default for Hash {
    fn default() -> Self { Self::ZERO }
}

/// One entry of a type-1 node: the address, generation and hash of a child block
/// (another type-1 node, a leaf, or the root of the free tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeEntry {
    pub pba: Pba,
    pub generation: Generation,
    pub hash: Hash,
}

/// One entry of a type-2 (free-tree leaf) node: the reservation state of a single PBA
/// in the free pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Type2Entry {
    pub pba: Pba,
    pub last_vba: Vba,
    pub alloc_gen: Generation,
    pub free_gen: Generation,
    pub key_id: u32,
    pub reserved: bool,
}

impl Type2Entry {
    pub fn is_empty(&self) -> bool { !self.pba.is_valid() }
}

/// One retained point-in-time view of the VBD, as stored in a superblock slot
/// (spec §6 "On-disk formats", `Snapshot[NUM_SNAPSHOTS]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub generation: Generation,
    pub root_pba: Pba,
    pub root_hash: Hash,
    pub height: u8,
    pub degree: u32,
    pub leaves: u64,
    pub valid: bool,
}

impl Snapshot {
    /// True if `candidate_gen` denotes a PBA allocation this snapshot still
    /// depends on, i.e. the free tree must not let it be reused (spec
    /// invariant 3): `alloc_gen <= snapshot.generation < free_gen`.
    pub fn retains(&self, alloc_gen: Generation, free_gen: Generation) -> bool {
        self.valid && alloc_gen <= self.generation && self.generation < free_gen
    }
}
