//! Per-datagram obfuscation: a 16-byte random nonce and a 16-byte MD5
//!  checksum are prepended to the payload, and the whole datagram is
//!  encrypted with AES-128 in a chained, CFB-like mode under a fixed
//!  initial vector. The key is SHA-256 of the user's key material,
//!  truncated to 16 bytes.
//!
//! This construction obfuscates traffic and rejects corrupted or
//!  foreign-key datagrams; it is **not** a substitute for authenticated
//!  encryption. The mode is home-grown, the checksum is MD5, and peers are
//!  not authenticated. Where wire compatibility is not a requirement,
//!  AES-GCM with per-packet nonces is the appropriate replacement.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Block};
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Bytes added in front of every obfuscated datagram: nonce + checksum.
pub const ENVELOPE_LEN: usize = 32;

const BLOCK_LEN: usize = 16;
const NONCE_LEN: usize = 16;
const CHECKSUM_LEN: usize = 16;

const INITIAL_VECTOR: [u8; BLOCK_LEN] = [
    167, 115, 79, 156, 18, 172, 27, 1, 164, 21, 242, 193, 252, 120, 230, 107,
];

/// XOR a 16-byte keystream block into `dst`, two 64-bit lanes at a time.
/// Going through `from_ne_bytes` keeps this free of alignment constraints.
#[inline]
fn xor_block(dst: &mut [u8], src: &[u8; BLOCK_LEN]) {
    debug_assert_eq!(dst.len(), BLOCK_LEN);
    for lane in 0..2 {
        let offset = lane * 8;
        let a = u64::from_ne_bytes(dst[offset..offset + 8].try_into().expect("8-byte lane"));
        let b = u64::from_ne_bytes(src[offset..offset + 8].try_into().expect("8-byte lane"));
        dst[offset..offset + 8].copy_from_slice(&(a ^ b).to_ne_bytes());
    }
}

pub struct PacketEncryption {
    cipher: Aes128,
}

impl PacketEncryption {
    pub fn new(key: &[u8]) -> PacketEncryption {
        let derived = Sha256::digest(key);
        let cipher = Aes128::new_from_slice(&derived[..BLOCK_LEN])
            .expect("a sha-256 prefix is always a valid AES-128 key");
        PacketEncryption { cipher }
    }

    /// Wrap `payload` into a freshly obfuscated wire datagram.
    pub fn seal(&self, payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0u8; ENVELOPE_LEN + payload.len()];
        rand::thread_rng().fill_bytes(&mut datagram[..NONCE_LEN]);
        datagram[NONCE_LEN..ENVELOPE_LEN].copy_from_slice(&Md5::digest(payload));
        datagram[ENVELOPE_LEN..].copy_from_slice(payload);
        self.encrypt(&mut datagram);
        datagram
    }

    /// Decrypt `datagram` in place and verify its checksum. Returns the
    ///  payload on success; mismatches are the caller's cue to drop the
    ///  datagram silently.
    pub fn open<'a>(&self, datagram: &'a mut [u8]) -> Option<&'a [u8]> {
        if datagram.len() < ENVELOPE_LEN {
            return None;
        }
        self.decrypt(datagram);
        let (envelope, payload) = datagram.split_at(ENVELOPE_LEN);
        let checksum = &envelope[NONCE_LEN..NONCE_LEN + CHECKSUM_LEN];
        if Md5::digest(payload).as_slice() == checksum {
            Some(payload)
        } else {
            None
        }
    }

    fn encrypt_keystream_block(&self, block: &mut [u8; BLOCK_LEN]) {
        let mut b = Block::from(*block);
        self.cipher.encrypt_block(&mut b);
        block.copy_from_slice(&b);
    }

    /// Chained block mode: each plaintext block is XOR'ed with the AES
    ///  encryption of the previous ciphertext block (the initial vector for
    ///  the first); a partial trailing block is XOR'ed with the last
    ///  keystream block.
    fn encrypt(&self, data: &mut [u8]) {
        let mut table = INITIAL_VECTOR;
        self.encrypt_keystream_block(&mut table);

        let mut chunks = data.chunks_exact_mut(BLOCK_LEN);
        for block in &mut chunks {
            xor_block(block, &table);
            table.copy_from_slice(block);
            self.encrypt_keystream_block(&mut table);
        }
        for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
            *byte ^= table[i];
        }
    }

    fn decrypt(&self, data: &mut [u8]) {
        let mut table = INITIAL_VECTOR;
        self.encrypt_keystream_block(&mut table);

        let mut chunks = data.chunks_exact_mut(BLOCK_LEN);
        for block in &mut chunks {
            let mut next = [0u8; BLOCK_LEN];
            next.copy_from_slice(block);
            self.encrypt_keystream_block(&mut next);
            xor_block(block, &table);
            table = next;
        }
        for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
            *byte ^= table[i];
        }
    }
}
