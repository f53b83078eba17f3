//! Crypto dispatcher: two single-slot queues bridging plaintext/ciphertext
//! buffers owned by the engine to the external [`BlockCipher`] (spec §4.6).
//!
//! Encryption and decryption never run concurrently with themselves (one
//! slot each), mirroring the single-primitive-in-flight discipline every
//! other module in this crate follows.

use crate::block::Block;
use crate::collab::BlockCipher;
use crate::error::{CbeError, CbeResult};

struct Slot {
    key_id: u32,
    input: Block,
    output: Option<Block>,
}

#[derive(Default)]
pub struct CryptoDispatch {
    encrypt: Option<Slot>,
    decrypt: Option<Slot>,
}

impl CryptoDispatch {
    pub fn new() -> Self { CryptoDispatch::default() }

    pub fn encrypt_acceptable(&self) -> bool { self.encrypt.is_none() }

    pub fn decrypt_acceptable(&self) -> bool { self.decrypt.is_none() }

    pub fn submit_encryption(&mut self, plain: Block, key_id: u32) -> CbeResult<()> {
        if self.encrypt.is_some() {
            return Err(CbeError::ProtocolMisuse("crypto_dispatch.submit_encryption while the encrypt slot is busy"));
        }
        self.encrypt = Some(Slot { key_id, input: plain, output: None });
        Ok(())
    }

    pub fn submit_decryption(&mut self, cipher: Block, key_id: u32) -> CbeResult<()> {
        if self.decrypt.is_some() {
            return Err(CbeError::ProtocolMisuse("crypto_dispatch.submit_decryption while the decrypt slot is busy"));
        }
        self.decrypt = Some(Slot { key_id, input: cipher, output: None });
        Ok(())
    }

    /// Drive whichever slot has pending work forward by calling into the
    /// external cipher once. Returns `Ok(true)` if a slot made progress.
    pub fn execute(&mut self, cipher: &mut dyn BlockCipher) -> bool {
        let mut progress = false;
        if let Some(slot) = &mut self.encrypt {
            if slot.output.is_none() {
                slot.output = Some(cipher.encrypt(slot.key_id, &slot.input));
                progress = true;
            }
        }
        if let Some(slot) = &mut self.decrypt {
            if slot.output.is_none() {
                slot.output = Some(cipher.decrypt(slot.key_id, &slot.input));
                progress = true;
            }
        }
        progress
    }

    pub fn peek_completed_encrypt(&self) -> Option<&Block> { self.encrypt.as_ref().and_then(|s| s.output.as_ref()) }

    pub fn peek_completed_decrypt(&self) -> Option<&Block> { self.decrypt.as_ref().and_then(|s| s.output.as_ref()) }

    pub fn take_encrypted(&mut self) -> CbeResult<Block> {
        let slot = self.encrypt.take().ok_or(CbeError::ProtocolMisuse("crypto_dispatch.take_encrypted with nothing completed"))?;
        slot.output.ok_or(CbeError::ProtocolMisuse("crypto_dispatch.take_encrypted before completion"))
    }

    pub fn take_decrypted(&mut self) -> CbeResult<Block> {
        let slot = self.decrypt.take().ok_or(CbeError::ProtocolMisuse("crypto_dispatch.take_decrypted with nothing completed"))?;
        slot.output.ok_or(CbeError::ProtocolMisuse("crypto_dispatch.take_decrypted before completion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ref_impls::AesGcmSivCipher;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let mut cipher = AesGcmSivCipher::new([3u8; 32]);
        let mut dispatch = CryptoDispatch::new();

        let mut plain = Block::zeroed();
        plain.as_mut_slice()[..5].copy_from_slice(b"hello");

        dispatch.submit_encryption(plain.clone(), 0).unwrap();
        assert!(dispatch.execute(&mut cipher));
        let ciphertext = dispatch.take_encrypted().unwrap();

        dispatch.submit_decryption(ciphertext, 0).unwrap();
        assert!(dispatch.execute(&mut cipher));
        let roundtripped = dispatch.take_decrypted().unwrap();

        assert_eq!(roundtripped.as_slice()[..5], *b"hello");
    }

    #[test]
    fn second_submit_while_busy_is_protocol_misuse() {
        let mut dispatch = CryptoDispatch::new();
        dispatch.submit_encryption(Block::zeroed(), 0).unwrap();
        assert!(dispatch.submit_encryption(Block::zeroed(), 0).is_err());
    }
}
