//! The external collaborators named in spec §1 "Out of scope": the block
//! backend, the symmetric cipher, and the hash primitive. The engine only
//! ever depends on the traits below; the `ref_impls` module provides
//! concrete stand-ins used by the test harness (spec §8 "cipher contract").

use crate::block::Block;
use crate::error::CbeResult;
use crate::types::Pba;

/// Opaque persistent block device: `read(pba, buf)` / `write(pba, buf)`.
pub trait BlockBackend {
    fn read(&mut self, pba: Pba, out: &mut Block) -> CbeResult<()>;
    fn write(&mut self, pba: Pba, data: &Block) -> CbeResult<()>;
    /// Total number of blocks the backend can address; the superblock region
    /// plus the VBD/free-tree node and leaf pool must fit inside this.
    fn block_count(&self) -> u64;
}

/// Opaque symmetric cipher: `encrypt(key, block)` / `decrypt(key, block)`.
/// A `key_id` selects among keys the collaborator manages; CBE never sees
/// key material (spec Non-goals: key rotation/hierarchy out of scope).
pub trait BlockCipher {
    fn encrypt(&mut self, key_id: u32, plain: &Block) -> Block;
    fn decrypt(&mut self, key_id: u32, cipher: &Block) -> Block;
}

/// Deterministic 32-byte digest over a 4 KiB block.
pub trait BlockHasher {
    fn hash(&self, block: &Block) -> crate::types::Hash;
}

pub mod ref_impls {
    //! Reference collaborator implementations. Not part of the request
    //! engine; provided so the crate is independently testable and so a
    //! host without its own backend/cipher/hasher can still open an image.

    use super::*;
    use aes_gcm_siv::aead::{Aead, KeyInit};
    use aes_gcm_siv::{Aes256GcmSiv, Nonce};
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;

    /// An in-memory block device, useful for tests and for `cbe-tool`'s
    /// `--image` scratch mode. Out-of-range reads return zeroed blocks so a
    /// freshly-initialized image reads back as all-zero leaves.
    pub struct MemBackend {
        blocks: Vec<Block>,
    }

    impl MemBackend {
        pub fn new(block_count: u64) -> Self {
            MemBackend { blocks: (0..block_count).map(|_| Block::zeroed()).collect() }
        }
    }

    impl BlockBackend for MemBackend {
        fn read(&mut self, pba: Pba, out: &mut Block) -> CbeResult<()> {
            let blk = self
                .blocks
                .get(pba.0 as usize)
                .ok_or(crate::error::CbeError::BackendIo { pba })?;
            out.0.copy_from_slice(&blk.0);
            Ok(())
        }

        fn write(&mut self, pba: Pba, data: &Block) -> CbeResult<()> {
            let blk = self
                .blocks
                .get_mut(pba.0 as usize)
                .ok_or(crate::error::CbeError::BackendIo { pba })?;
            blk.0.copy_from_slice(&data.0);
            Ok(())
        }

        fn block_count(&self) -> u64 { self.blocks.len() as u64 }
    }

    /// A plain file backed by fixed-size `BLOCK_SIZE` slots, addressed by
    /// seeking to `pba * BLOCK_SIZE`. `cbe-tool` uses this for `--image`
    /// instead of [`MemBackend`] whenever persistence across invocations
    /// matters.
    pub struct FileBackend {
        file: File,
        block_count: u64,
    }

    impl FileBackend {
        /// Open (creating if absent) a file sized to hold exactly
        /// `block_count` blocks, extending or truncating it to fit.
        pub fn open(path: impl AsRef<Path>, block_count: u64) -> CbeResult<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .map_err(|_| crate::error::CbeError::BackendIo { pba: Pba(0) })?;
            file.set_len(block_count * crate::types::BLOCK_SIZE as u64)
                .map_err(|_| crate::error::CbeError::BackendIo { pba: Pba(0) })?;
            Ok(FileBackend { file, block_count })
        }
    }

    impl BlockBackend for FileBackend {
        fn read(&mut self, pba: Pba, out: &mut Block) -> CbeResult<()> {
            if pba.0 >= self.block_count {
                return Err(crate::error::CbeError::BackendIo { pba });
            }
            self.file
                .seek(SeekFrom::Start(pba.0 * crate::types::BLOCK_SIZE as u64))
                .map_err(|_| crate::error::CbeError::BackendIo { pba })?;
            self.file.read_exact(out.as_mut_slice()).map_err(|_| crate::error::CbeError::BackendIo { pba })
        }

        fn write(&mut self, pba: Pba, data: &Block) -> CbeResult<()> {
            if pba.0 >= self.block_count {
                return Err(crate::error::CbeError::BackendIo { pba });
            }
            self.file
                .seek(SeekFrom::Start(pba.0 * crate::types::BLOCK_SIZE as u64))
                .map_err(|_| crate::error::CbeError::BackendIo { pba })?;
            self.file.write_all(data.as_slice()).map_err(|_| crate::error::CbeError::BackendIo { pba })?;
            self.file.sync_data().map_err(|_| crate::error::CbeError::BackendIo { pba })
        }

        fn block_count(&self) -> u64 { self.block_count }
    }

    /// A single fixed-key AES-256-GCM-SIV cipher keyed by a nonce counter,
    /// i.e. exactly the primitive the engine expects, without the basis/key
    /// hierarchy of a full PDDB-style key manager (spec Non-goals).
    pub struct AesGcmSivCipher {
        ciphers: HashMap<u32, Aes256GcmSiv>,
        nonce_counter: u64,
        default_key: DefaultKey,
    }

    #[derive(zeroize::Zeroize)]
    #[zeroize(drop)]
    struct DefaultKey([u8; 32]);

    impl AesGcmSivCipher {
        pub fn new(default_key: [u8; 32]) -> Self {
            AesGcmSivCipher { ciphers: HashMap::new(), nonce_counter: 0, default_key: DefaultKey(default_key) }
        }

        fn cipher_for(&mut self, key_id: u32) -> &Aes256GcmSiv {
            let key = self.default_key.0;
            self.ciphers.entry(key_id).or_insert_with(|| Aes256GcmSiv::new((&key).into()))
        }

        fn next_nonce(&mut self) -> [u8; 12] {
            self.nonce_counter += 1;
            let mut nonce = [0u8; 12];
            nonce[..8].copy_from_slice(&self.nonce_counter.to_le_bytes());
            nonce
        }
    }

    impl BlockCipher for AesGcmSivCipher {
        fn encrypt(&mut self, key_id: u32, plain: &Block) -> Block {
            let nonce_bytes = self.next_nonce();
            let cipher = self.cipher_for(key_id);
            let ciphertext =
                cipher.encrypt(Nonce::from_slice(&nonce_bytes), plain.as_slice()).expect("encryption cannot fail for fixed-size plaintext");
            let mut out = Block::zeroed();
            out.as_mut_slice()[..12].copy_from_slice(&nonce_bytes);
            let n = ciphertext.len().min(crate::types::BLOCK_SIZE - 12);
            out.as_mut_slice()[12..12 + n].copy_from_slice(&ciphertext[..n]);
            out
        }

        fn decrypt(&mut self, key_id: u32, cipher_block: &Block) -> Block {
            let nonce_bytes = &cipher_block.as_slice()[..12];
            let cipher = self.cipher_for(key_id);
            // The reference implementation stores ciphertext + tag packed after the
            // nonce; trailing zero padding past the tag is not part of the AEAD input.
            let payload = &cipher_block.as_slice()[12..];
            let plain = cipher
                .decrypt(Nonce::from_slice(nonce_bytes), payload)
                .expect("decrypt of a block produced by encrypt() must succeed");
            let mut out = Block::zeroed();
            out.as_mut_slice()[..plain.len()].copy_from_slice(&plain);
            out
        }
    }

    /// SHA-256 over the full 4 KiB block.
    #[derive(Default)]
    pub struct Sha256Hasher;

    impl BlockHasher for Sha256Hasher {
        fn hash(&self, block: &Block) -> crate::types::Hash {
            let mut hasher = Sha256::new();
            hasher.update(block.as_slice());
            let digest = hasher.finalize();
            let mut out = [0u8; crate::types::HASH_SIZE];
            out.copy_from_slice(&digest);
            crate::types::Hash(out)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn mem_backend_roundtrip() {
            let mut be = MemBackend::new(4);
            let mut blk = Block::zeroed();
            blk.as_mut_slice()[0] = 0xAA;
            be.write(Pba(2), &blk).unwrap();
            let mut out = Block::zeroed();
            be.read(Pba(2), &mut out).unwrap();
            assert_eq!(out.as_slice()[0], 0xAA);
        }

        #[test]
        fn file_backend_roundtrip_and_out_of_range() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("image.cbe");
            let mut be = FileBackend::open(&path, 4).unwrap();
            let mut blk = Block::zeroed();
            blk.as_mut_slice()[0] = 0x42;
            be.write(Pba(1), &blk).unwrap();

            // reopening sees what was written, since it's the same file.
            let mut be2 = FileBackend::open(&path, 4).unwrap();
            let mut out = Block::zeroed();
            be2.read(Pba(1), &mut out).unwrap();
            assert_eq!(out.as_slice()[0], 0x42);
            assert!(be2.read(Pba(4), &mut out).is_err());
        }

        #[test]
        fn cipher_roundtrip_preserves_hash_of_plaintext() {
            let mut cipher = AesGcmSivCipher::new([7u8; 32]);
            let mut plain = Block::zeroed();
            plain.as_mut_slice()[..4].copy_from_slice(b"ABCD");
            let ct = cipher.encrypt(0, &plain);
            let pt2 = cipher.decrypt(0, &ct);
            assert_eq!(pt2.as_slice()[..4], *b"ABCD");
        }

        #[test]
        fn hash_is_deterministic() {
            let hasher = Sha256Hasher;
            let blk = Block::zeroed();
            assert_eq!(hasher.hash(&blk), hasher.hash(&blk));
        }
    }
}
