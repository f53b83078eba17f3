//! Superblock slot codec and boot-time slot selection (spec §6 "On-disk
//! formats").
//!
//! A slot is a self-describing 4 KiB block: everything but the trailing
//! hash, then a hash of that content stored in the trailing 32 bytes. Boot
//! discards any slot whose hash does not verify and picks the surviving
//! slot with the highest `last_secured_generation`.

use crate::block::Block;
use crate::collab::BlockHasher;
use crate::error::{CbeError, CbeResult};
use crate::translation::TreeGeometry;
use crate::types::{Generation, Hash, Pba, Snapshot, HASH_SIZE, NUM_SNAPSHOTS};

const MAGIC: u64 = 0x4342455F53425F31; // "CBE_SB_1" as bytes, read little-endian
const VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 4 + 8 + 8 + 2 + 6;
const SNAPSHOT_RECORD_LEN: usize = 64;
const SNAPSHOTS_LEN: usize = SNAPSHOT_RECORD_LEN * NUM_SNAPSHOTS;
const FREE_TREE_RECORD_LEN: usize = 8 + HASH_SIZE + 4 + 1 + 8 + 8;
const SELF_HASH_OFFSET: usize = crate::types::BLOCK_SIZE - HASH_SIZE;

/// In-memory form of one superblock slot.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub flags: u32,
    pub last_secured_generation: Generation,
    pub current_generation: Generation,
    pub snapshot_index: u16,
    pub snapshots: [Snapshot; NUM_SNAPSHOTS],
    pub free_tree_root_pba: Pba,
    pub free_tree_root_hash: Hash,
    pub free_tree_geometry: TreeGeometry,
    pub free_tree_base_pba: Pba,
}

impl Superblock {
    /// A slot describing an empty, freshly-initialized VBD: one valid
    /// snapshot at generation 0, whose root is supplied by the caller
    /// (typically a single all-zero leaf block written once at format time).
    #[allow(clippy::too_many_arguments)]
    pub fn fresh(
        root_pba: Pba,
        root_hash: Hash,
        vbd_geometry: TreeGeometry,
        free_tree_root_pba: Pba,
        free_tree_root_hash: Hash,
        free_tree_geometry: TreeGeometry,
        free_tree_base_pba: Pba,
    ) -> Self {
        let mut snapshots = [Snapshot::default(); NUM_SNAPSHOTS];
        snapshots[0] = Snapshot {
            generation: Generation::ZERO,
            root_pba,
            root_hash,
            height: vbd_geometry.height as u8,
            degree: vbd_geometry.degree as u32,
            leaves: vbd_geometry.leaves,
            valid: true,
        };
        Superblock {
            flags: 0,
            last_secured_generation: Generation::ZERO,
            current_generation: Generation(1),
            snapshot_index: 0,
            snapshots,
            free_tree_root_pba,
            free_tree_root_hash,
            free_tree_geometry,
            free_tree_base_pba,
        }
    }

    pub fn current_snapshot(&self) -> Snapshot { self.snapshots[self.snapshot_index as usize] }

    /// Sizes `vbd_geometry`/`free_tree_geometry` from the stored snapshot and
    /// free-tree record, so callers don't need to track them separately.
    pub fn vbd_geometry(&self) -> TreeGeometry {
        let s = self.current_snapshot();
        TreeGeometry::new(s.degree as usize, s.height as usize, s.leaves)
    }

    pub fn encode(&self, hasher: &dyn BlockHasher) -> Block {
        let mut b = Block::zeroed();
        let buf = b.as_mut_slice();
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_secured_generation.0.to_le_bytes());
        buf[24..32].copy_from_slice(&self.current_generation.0.to_le_bytes());
        buf[32..34].copy_from_slice(&self.snapshot_index.to_le_bytes());

        for (i, snap) in self.snapshots.iter().enumerate() {
            let off = HEADER_LEN + i * SNAPSHOT_RECORD_LEN;
            let rec = &mut buf[off..off + SNAPSHOT_RECORD_LEN];
            rec[0..8].copy_from_slice(&snap.generation.0.to_le_bytes());
            rec[8..16].copy_from_slice(&snap.root_pba.0.to_le_bytes());
            rec[16..16 + HASH_SIZE].copy_from_slice(&snap.root_hash.0);
            rec[48] = snap.height;
            rec[49..53].copy_from_slice(&snap.degree.to_le_bytes());
            rec[53..61].copy_from_slice(&snap.leaves.to_le_bytes());
            rec[61] = snap.valid as u8;
        }

        let ft_off = HEADER_LEN + SNAPSHOTS_LEN;
        let ft = &mut buf[ft_off..ft_off + FREE_TREE_RECORD_LEN];
        ft[0..8].copy_from_slice(&self.free_tree_root_pba.0.to_le_bytes());
        ft[8..8 + HASH_SIZE].copy_from_slice(&self.free_tree_root_hash.0);
        ft[8 + HASH_SIZE..12 + HASH_SIZE].copy_from_slice(&(self.free_tree_geometry.degree as u32).to_le_bytes());
        ft[12 + HASH_SIZE] = self.free_tree_geometry.height as u8;
        ft[13 + HASH_SIZE..21 + HASH_SIZE].copy_from_slice(&self.free_tree_geometry.leaves.to_le_bytes());
        ft[21 + HASH_SIZE..29 + HASH_SIZE].copy_from_slice(&self.free_tree_base_pba.0.to_le_bytes());

        let hash = hasher.hash(&b);
        b.as_mut_slice()[SELF_HASH_OFFSET..SELF_HASH_OFFSET + HASH_SIZE].copy_from_slice(&hash.0);
        b
    }

    /// Decodes and verifies a slot's self-hash. `None` means the slot is
    /// uninitialized or corrupt and must be ignored during boot selection.
    pub fn decode(block: &Block, hasher: &dyn BlockHasher) -> Option<Self> {
        let buf = block.as_slice();
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != MAGIC {
            return None;
        }

        let mut check = block.clone();
        check.as_mut_slice()[SELF_HASH_OFFSET..SELF_HASH_OFFSET + HASH_SIZE].fill(0);
        let recomputed = hasher.hash(&check);
        let stored = &buf[SELF_HASH_OFFSET..SELF_HASH_OFFSET + HASH_SIZE];
        if recomputed.0 != stored {
            return None;
        }

        let flags = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let last_secured_generation = Generation(u64::from_le_bytes(buf[16..24].try_into().unwrap()));
        let current_generation = Generation(u64::from_le_bytes(buf[24..32].try_into().unwrap()));
        let snapshot_index = u16::from_le_bytes(buf[32..34].try_into().unwrap());

        let mut snapshots = [Snapshot::default(); NUM_SNAPSHOTS];
        for (i, snap) in snapshots.iter_mut().enumerate() {
            let off = HEADER_LEN + i * SNAPSHOT_RECORD_LEN;
            let rec = &buf[off..off + SNAPSHOT_RECORD_LEN];
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&rec[16..16 + HASH_SIZE]);
            *snap = Snapshot {
                generation: Generation(u64::from_le_bytes(rec[0..8].try_into().unwrap())),
                root_pba: Pba(u64::from_le_bytes(rec[8..16].try_into().unwrap())),
                root_hash: Hash(hash),
                height: rec[48],
                degree: u32::from_le_bytes(rec[49..53].try_into().unwrap()),
                leaves: u64::from_le_bytes(rec[53..61].try_into().unwrap()),
                valid: rec[61] != 0,
            };
        }

        let ft_off = HEADER_LEN + SNAPSHOTS_LEN;
        let ft = &buf[ft_off..ft_off + FREE_TREE_RECORD_LEN];
        let free_tree_root_pba = Pba(u64::from_le_bytes(ft[0..8].try_into().unwrap()));
        let mut ft_hash = [0u8; HASH_SIZE];
        ft_hash.copy_from_slice(&ft[8..8 + HASH_SIZE]);
        let free_tree_degree = u32::from_le_bytes(ft[8 + HASH_SIZE..12 + HASH_SIZE].try_into().unwrap());
        let free_tree_height = ft[12 + HASH_SIZE];
        let free_tree_leaves = u64::from_le_bytes(ft[13 + HASH_SIZE..21 + HASH_SIZE].try_into().unwrap());
        let free_tree_base_pba = Pba(u64::from_le_bytes(ft[21 + HASH_SIZE..29 + HASH_SIZE].try_into().unwrap()));

        Some(Superblock {
            flags,
            last_secured_generation,
            current_generation,
            snapshot_index,
            snapshots,
            free_tree_root_pba,
            free_tree_root_hash: Hash(ft_hash),
            free_tree_geometry: TreeGeometry::new(free_tree_degree as usize, free_tree_height as usize, free_tree_leaves),
            free_tree_base_pba,
        })
    }
}

/// Boot-time slot selection: discard slots that don't verify, pick the
/// survivor with the highest `last_secured_generation` (ties favor the
/// higher slot index — spec §9 Open Questions, resolved in DESIGN.md).
pub fn select_active_slot(slots: &[Block], hasher: &dyn BlockHasher) -> CbeResult<(usize, Superblock)> {
    slots
        .iter()
        .enumerate()
        .filter_map(|(i, b)| Superblock::decode(b, hasher).map(|sb| (i, sb)))
        .max_by_key(|(i, sb)| (sb.last_secured_generation, *i))
        .ok_or(CbeError::NoValidSuperblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ref_impls::Sha256Hasher;

    #[test]
    fn encode_decode_roundtrips() {
        let hasher = Sha256Hasher;
        let vbd_geom = TreeGeometry::new(64, 1, 64);
        let ft_geom = TreeGeometry::new(64, 2, 64);
        let sb = Superblock::fresh(Pba(5), Hash([7u8; HASH_SIZE]), vbd_geom, Pba(1), Hash([9u8; HASH_SIZE]), ft_geom, Pba(100));
        let block = sb.encode(&hasher);
        let decoded = Superblock::decode(&block, &hasher).unwrap();
        assert_eq!(decoded.current_snapshot().root_pba, Pba(5));
        assert_eq!(decoded.free_tree_root_pba, Pba(1));
        assert_eq!(decoded.last_secured_generation, Generation::ZERO);
    }

    #[test]
    fn tampered_slot_fails_verification() {
        let hasher = Sha256Hasher;
        let vbd_geom = TreeGeometry::new(64, 1, 64);
        let ft_geom = TreeGeometry::new(64, 2, 64);
        let sb = Superblock::fresh(Pba(5), Hash([7u8; HASH_SIZE]), vbd_geom, Pba(1), Hash([9u8; HASH_SIZE]), ft_geom, Pba(100));
        let mut block = sb.encode(&hasher);
        block.as_mut_slice()[100] ^= 0xFF;
        assert!(Superblock::decode(&block, &hasher).is_none());
    }

    #[test]
    fn selects_highest_secured_generation_breaking_ties_by_slot_index() {
        let hasher = Sha256Hasher;
        let vbd_geom = TreeGeometry::new(64, 1, 64);
        let ft_geom = TreeGeometry::new(64, 2, 64);
        let mut low = Superblock::fresh(Pba(5), Hash([7u8; HASH_SIZE]), vbd_geom, Pba(1), Hash([9u8; HASH_SIZE]), ft_geom, Pba(100));
        low.last_secured_generation = Generation(3);
        let mut tie_a = low.clone();
        tie_a.last_secured_generation = Generation(9);
        let mut tie_b = low.clone();
        tie_b.last_secured_generation = Generation(9);

        let slots = vec![low.encode(&hasher), tie_a.encode(&hasher), tie_b.encode(&hasher), Block::zeroed()];
        let (idx, sb) = select_active_slot(&slots, &hasher).unwrap();
        assert_eq!(idx, 2, "later tied slot wins");
        assert_eq!(sb.last_secured_generation, Generation(9));
    }

    #[test]
    fn all_zero_slots_reject_with_no_valid_superblock() {
        let hasher = Sha256Hasher;
        let slots = vec![Block::zeroed(); 8];
        assert_eq!(select_active_slot(&slots, &hasher).unwrap_err(), CbeError::NoValidSuperblock);
    }
}
