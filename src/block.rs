//! The raw 4 KiB block buffer and the codecs for type-1 / type-2 node images
//! (spec §6 "On-disk formats"). All multi-byte fields are little-endian.

use crate::types::{
    Generation, Hash, NodeEntry, Pba, Type2Entry, BLOCK_SIZE, HASH_SIZE, TYPE1_ENTRY_SIZE, TYPE2_ENTRY_SIZE,
};

/// One 4 KiB block, either plaintext or ciphertext depending on context. Plain
/// byte storage; callers interpret the contents as a leaf, a type-1 node, a
/// type-2 node or a superblock slot.
#[derive(Clone)]
pub struct Block(pub [u8; BLOCK_SIZE]);

impl Block {
    pub fn zeroed() -> Self { Block([0u8; BLOCK_SIZE]) }

    pub fn as_slice(&self) -> &[u8] { &self.0 }

    pub fn as_mut_slice(&mut self) -> &mut [u8] { &mut self.0 }

    /// Read one type-1 entry packed at `index` for a tree of the given `degree`.
    /// Panics if `index >= degree` or the node does not fit in one block; both
    /// are programmer errors (spec §7 "Protocol misuse").
    pub fn type1_entry(&self, index: usize, degree: usize) -> NodeEntry {
        assert!(index < degree, "type-1 index {index} out of bounds for degree {degree}");
        let off = index * TYPE1_ENTRY_SIZE;
        let buf = &self.0[off..off + TYPE1_ENTRY_SIZE];
        let pba = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let gen = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&buf[16..16 + HASH_SIZE]);
        NodeEntry { pba: Pba(pba), generation: Generation(gen), hash: Hash(hash) }
    }

    pub fn set_type1_entry(&mut self, index: usize, degree: usize, entry: NodeEntry) {
        assert!(index < degree, "type-1 index {index} out of bounds for degree {degree}");
        let off = index * TYPE1_ENTRY_SIZE;
        let buf = &mut self.0[off..off + TYPE1_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&entry.pba.0.to_le_bytes());
        buf[8..16].copy_from_slice(&entry.generation.0.to_le_bytes());
        buf[16..16 + HASH_SIZE].copy_from_slice(&entry.hash.0);
    }

    /// Zero the padding bytes past `degree` type-1 entries (spec: "implementations must zero pad").
    pub fn zero_type1_padding(&mut self, degree: usize) {
        let used = degree * TYPE1_ENTRY_SIZE;
        if used < BLOCK_SIZE {
            self.0[used..].fill(0);
        }
    }

    pub fn type2_entry(&self, index: usize, per_block: usize) -> Type2Entry {
        assert!(index < per_block, "type-2 index {index} out of bounds for {per_block} entries/block");
        let off = index * TYPE2_ENTRY_SIZE;
        let buf = &self.0[off..off + TYPE2_ENTRY_SIZE];
        let pba = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let last_vba = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let alloc_gen = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let free_gen = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let key_id = u32::from_le_bytes(buf[32..36].try_into().unwrap());
        let reserved = buf[36] != 0;
        Type2Entry {
            pba: Pba(pba),
            last_vba: crate::types::Vba(last_vba),
            alloc_gen: Generation(alloc_gen),
            free_gen: Generation(free_gen),
            key_id,
            reserved,
        }
    }

    pub fn set_type2_entry(&mut self, index: usize, per_block: usize, entry: Type2Entry) {
        assert!(index < per_block, "type-2 index {index} out of bounds for {per_block} entries/block");
        let off = index * TYPE2_ENTRY_SIZE;
        let buf = &mut self.0[off..off + TYPE2_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&entry.pba.0.to_le_bytes());
        buf[8..16].copy_from_slice(&entry.last_vba.0.to_le_bytes());
        buf[16..24].copy_from_slice(&entry.alloc_gen.0.to_le_bytes());
        buf[24..32].copy_from_slice(&entry.free_gen.0.to_le_bytes());
        buf[32..36].copy_from_slice(&entry.key_id.to_le_bytes());
        buf[36] = entry.reserved as u8;
        buf[37..40].fill(0);
    }

    pub fn type2_entries_per_block() -> usize { BLOCK_SIZE / TYPE2_ENTRY_SIZE }
}

impl Default for Block {
    fn default() -> Self { Self::zeroed() }
}

impl std::ops::Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] { &self.0 }
}

impl std::ops::DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] { &mut self.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type1_roundtrip() {
        let mut b = Block::zeroed();
        let e = NodeEntry { pba: Pba(42), generation: Generation(7), hash: Hash([9u8; HASH_SIZE]) };
        b.set_type1_entry(3, 64, e);
        assert_eq!(b.type1_entry(3, 64), e);
    }

    #[test]
    fn type2_roundtrip() {
        let mut b = Block::zeroed();
        let e = Type2Entry {
            pba: Pba(1),
            last_vba: crate::types::Vba(2),
            alloc_gen: Generation(3),
            free_gen: Generation(4),
            key_id: 5,
            reserved: true,
        };
        let per_block = Block::type2_entries_per_block();
        b.set_type2_entry(10, per_block, e);
        assert_eq!(b.type2_entry(10, per_block), e);
    }

    #[test]
    fn degree_64_packs_into_3072_bytes() {
        assert_eq!(64 * TYPE1_ENTRY_SIZE, 3072);
    }
}
