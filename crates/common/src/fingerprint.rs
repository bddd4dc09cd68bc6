//! Polynomial fingerprint over GF-like wrapping u64 arithmetic.
//!
//! `eval` hashes a byte sequence by Horner's rule at a secret evaluation
//! point `r`:
//!
//! ```text
//! eval(data, r) = ((data[0] * r + data[1]) * r + ...) * r + data[L-1]   (mod 2^64)
//! ```
//!
//! The family is additively homomorphic on equal-length inputs (absent
//! byte-carry) and is always paired with SHA-256 in the cross-checksum, so
//! forging a fragment requires defeating both.

use rand::rngs::OsRng;
use rand::RngCore;

/// Holds the secret evaluation point `r`.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprint {
    r: u64,
}

impl Fingerprint {
    /// Fingerprint using the provided seed `r`.
    pub fn new_seeded(r: u64) -> Self {
        Fingerprint { r }
    }

    /// Fingerprint with a fresh random non-zero seed.
    pub fn new_random() -> Self {
        let mut buf = [0u8; 8];
        OsRng.fill_bytes(&mut buf);
        let mut r = u64::from_le_bytes(buf);
        if r == 0 {
            r = 1;
        }
        Fingerprint { r }
    }

    /// The evaluation point used by this fingerprint.
    pub fn seed(&self) -> u64 {
        self.r
    }

    /// Evaluate the fingerprint of `data`. Pure function of `(r, data)`.
    pub fn eval(&self, data: &[u8]) -> u64 {
        let mut res: u64 = 0;
        for &b in data {
            res = res.wrapping_mul(self.r).wrapping_add(b as u64);
        }
        res
    }
}
