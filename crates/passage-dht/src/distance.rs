//! XOR distance over the 256-bit id space.

use passage_proto::PeerId;
use rand::RngCore;

/// XOR distance between two ids. Byte 0 is the most significant, so the
/// derived ordering compares distances numerically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    /// Distance between two ids.
    pub fn between(a: &PeerId, b: &PeerId) -> Self {
        Distance(a.xor(b))
    }

    /// Zero distance (an id to itself).
    pub fn zero() -> Self {
        Distance([0u8; 32])
    }

    /// Whether this is the zero distance.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Index of the k-bucket this distance falls into: the position of
    /// the highest set bit, 0..=255. `None` for the zero distance.
    pub fn bucket_index(&self) -> Option<usize> {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((31 - byte_idx) * 8 + bit);
            }
        }
        None
    }

    /// Raw distance bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generates an id whose distance from `local` falls into the bucket at
/// `index`: the bit at `index` differs, higher bits match, lower bits
/// are random. Used for bucket refresh lookups.
pub fn random_id_in_bucket(local: &PeerId, index: usize) -> PeerId {
    debug_assert!(index < 256);
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);

    let local_bytes = local.as_bytes();
    for pos in index..256 {
        let byte_idx = 31 - pos / 8;
        let mask = 1u8 << (pos % 8);
        if pos == index {
            // Differ exactly at the bucket bit.
            bytes[byte_idx] = (bytes[byte_idx] & !mask) | ((local_bytes[byte_idx] ^ mask) & mask);
        } else {
            bytes[byte_idx] = (bytes[byte_idx] & !mask) | (local_bytes[byte_idx] & mask);
        }
    }

    PeerId::from_bytes(&bytes).unwrap_or(*local)
}
