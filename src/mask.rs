//! WebSocket frame masking utilities
//!
//! Masking XORs every payload byte with `key[i % 4]`. Client frames are masked
//! with a fresh key per frame; keys and handshake nonces come from a
//! [`MaskRng`] owned by each connection.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Apply a WebSocket mask in place
///
/// The same operation masks outgoing and unmasks incoming payloads.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    // Process 8 bytes at a time using u64
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Remainder starts on a multiple of 8, so the key index lines up
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Apply a mask to a slice that starts `offset` bytes into the payload
///
/// Used when a frame payload is spread over several buffers.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let rotated = [
        mask[offset & 3],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    apply_mask(data, rotated);
}

/// Cryptographically secure generator for masking keys and handshake nonces
///
/// Wraps a `StdRng` seeded from the operating system. Each connection owns
/// its own instance; it is `Send` but never shared, so no locking is
/// involved.
pub struct MaskRng {
    rng: StdRng,
}

impl MaskRng {
    /// Create a generator seeded from the OS entropy source
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Create a deterministic generator (tests and benchmarks)
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate a masking key for one client frame
    #[inline]
    pub fn mask(&mut self) -> [u8; 4] {
        let mut key = [0u8; 4];
        self.rng.fill_bytes(&mut key);
        key
    }

    /// Generate the 16-byte handshake nonce
    pub fn nonce(&mut self) -> [u8; 16] {
        let mut nonce = [0u8; 16];
        self.rng.fill_bytes(&mut nonce);
        nonce
    }
}

impl Default for MaskRng {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MaskRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskRng").finish_non_exhaustive()
    }
}
