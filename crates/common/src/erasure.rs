//! Reed-Solomon erasure codec over GF(2^8).
//!
//! Splits a blob into `m` equal-length data fragments (right-zero-padded)
//! plus `n - m` parity fragments. Any `m` of the `n` fragments reconstruct
//! the original bytes.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid shard parameters: {0}")]
    InvalidParameters(String),

    #[error("not enough shards to reconstruct (have {have}, need {need})")]
    InsufficientShards { have: usize, need: usize },

    #[error("shard reconstruction failed: {0}")]
    DecodeFailed(reed_solomon_erasure::Error),
}

/// `(m, n)` Reed-Solomon codec: `m` data shards, `n - m` parity shards.
pub struct ErasureCodec {
    rs: ReedSolomon,
    m: usize,
    n: usize,
}

impl ErasureCodec {
    /// Build a codec. `m` must be positive, `n` must exceed `m`
    /// (`n == m` gives no fault tolerance and is rejected).
    pub fn new(m: usize, n: usize) -> Result<Self, ErasureError> {
        if m == 0 || n <= m {
            return Err(ErasureError::InvalidParameters(format!(
                "data={m}, total={n}"
            )));
        }
        let rs = ReedSolomon::new(m, n - m)
            .map_err(|e| ErasureError::InvalidParameters(e.to_string()))?;
        Ok(ErasureCodec { rs, m, n })
    }

    /// Data shard count.
    pub fn data_shards(&self) -> usize {
        self.m
    }

    /// Total shard count.
    pub fn total_shards(&self) -> usize {
        self.n
    }

    /// Split `blob` into `n` equal-length shards and return them together
    /// with the original length, needed later by [`decode`](Self::decode).
    /// An empty blob yields `n` empty shards.
    pub fn encode(&self, blob: &[u8]) -> Result<(Vec<Vec<u8>>, usize), ErasureError> {
        if blob.is_empty() {
            return Ok((vec![Vec::new(); self.n], 0));
        }

        let shard_len = (blob.len() + self.m - 1) / self.m;
        let mut shards = Vec::with_capacity(self.n);
        for i in 0..self.m {
            let start = i * shard_len;
            let end = usize::min(start + shard_len, blob.len());
            let mut shard = vec![0u8; shard_len];
            if start < end {
                shard[..end - start].copy_from_slice(&blob[start..end]);
            }
            shards.push(shard);
        }
        for _ in self.m..self.n {
            shards.push(vec![0u8; shard_len]);
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| ErasureError::InvalidParameters(e.to_string()))?;
        Ok((shards, blob.len()))
    }

    /// Reconstruct the original blob of `original_len` bytes from a shard
    /// vector of length exactly `n`, where missing shards are `None`.
    pub fn decode(
        &self,
        mut shards: Vec<Option<Vec<u8>>>,
        original_len: usize,
    ) -> Result<Vec<u8>, ErasureError> {
        if shards.len() != self.n {
            return Err(ErasureError::InvalidParameters(format!(
                "expected {} shards, got {}",
                self.n,
                shards.len()
            )));
        }
        if original_len == 0 {
            return Ok(Vec::new());
        }

        let have = shards.iter().filter(|s| s.is_some()).count();
        if have < self.m {
            return Err(ErasureError::InsufficientShards {
                have,
                need: self.m,
            });
        }

        self.rs
            .reconstruct(&mut shards)
            .map_err(ErasureError::DecodeFailed)?;

        let mut blob = Vec::with_capacity(original_len);
        for shard in shards.into_iter().take(self.m) {
            let shard = shard.ok_or(ErasureError::DecodeFailed(
                reed_solomon_erasure::Error::TooFewShardsPresent,
            ))?;
            blob.extend_from_slice(&shard);
        }
        if blob.len() < original_len {
            return Err(ErasureError::InvalidParameters(format!(
                "original length {} exceeds reconstructed {}",
                original_len,
                blob.len()
            )));
        }
        blob.truncate(original_len);
        Ok(blob)
    }
}
