//! State Hashing
//!
//! SHA-256 digests of replicated state. Two replicas with equal digests hold
//! the same keys, values and sequence numbers.

use sha2::{Sha256, Digest};

use super::vec3::{Transform, Vec3};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Deterministic hasher for replicated state.
///
/// Order of updates matters; callers feed keys in sorted order.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for a replicated store.
    pub fn for_store() -> Self {
        Self::new(b"CANDY_CHASE_STORE_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u16 value (little-endian).
    #[inline]
    pub fn update_u16(&mut self, value: u16) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i64 value (little-endian).
    #[inline]
    pub fn update_i64(&mut self, value: i64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an f32 by bit pattern.
    #[inline]
    pub fn update_f32(&mut self, value: f32) {
        self.update_u32(value.to_bits());
    }

    /// Update with a Vec3.
    #[inline]
    pub fn update_vec3(&mut self, value: Vec3) {
        self.update_f32(value.x);
        self.update_f32(value.y);
        self.update_f32(value.z);
    }

    /// Update with a Transform.
    #[inline]
    pub fn update_transform(&mut self, value: &Transform) {
        self.update_vec3(value.position);
        self.update_f32(value.yaw);
    }

    /// Update with a boolean.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Short hex form of a digest for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..6])
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hasher_determinism() {
        let make_hash = || {
            let mut hasher = StateHasher::for_store();
            hasher.update_u32(100);
            hasher.update_i64(-12345);
            hasher.update_f32(5.5);
            hasher.update_transform(&Transform::new(Vec3::new(1.0, 2.0, 3.0), 90.0));
            hasher.update_bool(true);
            hasher.finalize()
        };

        assert_eq!(make_hash(), make_hash());
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(1);
            h.update_u32(2);
            h.finalize()
        };

        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(2);
            h.update_u32(1);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_domain_separation() {
        let data = [1u8, 2, 3, 4];
        assert_ne!(hash_with_domain(b"DOMAIN_A", &data), hash_with_domain(b"DOMAIN_B", &data));
    }

    #[test]
    fn test_short_hex_length() {
        let hash = hash_with_domain(b"x", b"y");
        assert_eq!(short_hex(&hash).len(), 12);
    }
}
