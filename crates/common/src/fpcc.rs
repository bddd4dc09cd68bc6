//! Fingerprinted cross-checksum (FPCC) helpers.
//!
//! An FPCC binds `n` fragments to one object identity: a per-fragment
//! SHA-256, a per-fragment polynomial fingerprint, and the shared secret
//! evaluation point. A fragment is accepted only when both digests match,
//! so forging one requires defeating SHA-256 and the fingerprint family at
//! once. FPCC equality is the structural `==` derived on the wire type.

use avidfp_proto::Fpcc;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Why a fragment failed FPCC verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FpccFault {
    #[error("fragment index {index} out of range (n={n})")]
    IndexOutOfRange { index: usize, n: usize },

    #[error("hash mismatch")]
    HashMismatch,

    #[error("fingerprint mismatch")]
    FingerprintMismatch,
}

/// SHA-256 of `data` as a 32-byte vector.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Build the FPCC for an encoded fragment vector under `fp`'s seed.
pub fn build(fragments: &[Vec<u8>], fp: &Fingerprint) -> Fpcc {
    let mut hashes = Vec::with_capacity(fragments.len());
    let mut fps = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        hashes.push(sha256(fragment));
        fps.push(fp.eval(fragment));
    }
    Fpcc {
        seed: fp.seed(),
        hashes,
        fps,
    }
}

/// True iff the FPCC carries exactly `n` hashes and `n` fingerprints.
pub fn shape_ok(fpcc: &Fpcc, n: usize) -> bool {
    fpcc.hashes.len() == n && fpcc.fps.len() == n
}

/// Check `data` against the FPCC entry for `index`.
pub fn check(fpcc: &Fpcc, index: usize, data: &[u8]) -> Result<(), FpccFault> {
    let n = fpcc.hashes.len().min(fpcc.fps.len());
    if index >= n {
        return Err(FpccFault::IndexOutOfRange { index, n });
    }
    if sha256(data) != fpcc.hashes[index] {
        return Err(FpccFault::HashMismatch);
    }
    if Fingerprint::new_seeded(fpcc.seed).eval(data) != fpcc.fps[index] {
        return Err(FpccFault::FingerprintMismatch);
    }
    Ok(())
}

/// Boolean form of [`check`].
pub fn verify(fpcc: &Fpcc, index: usize, data: &[u8]) -> bool {
    check(fpcc, index, data).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fragments() -> Vec<Vec<u8>> {
        vec![
            b"fragment zero".to_vec(),
            b"fragment one!".to_vec(),
            b"fragment two.".to_vec(),
        ]
    }

    #[test]
    fn test_build_and_verify_all_indices() {
        let fragments = sample_fragments();
        let fp = Fingerprint::new_seeded(0x1234_5678);
        let fpcc = build(&fragments, &fp);

        assert_eq!(fpcc.seed, 0x1234_5678);
        assert!(shape_ok(&fpcc, 3));
        for (i, fragment) in fragments.iter().enumerate() {
            assert!(verify(&fpcc, i, fragment));
        }
    }

    #[test]
    fn test_tampered_fragment_rejected() {
        let fragments = sample_fragments();
        let fpcc = build(&fragments, &Fingerprint::new_seeded(7));

        let mut tampered = fragments[1].clone();
        tampered[0] ^= 0x80;
        assert_eq!(check(&fpcc, 1, &tampered), Err(FpccFault::HashMismatch));
    }

    #[test]
    fn test_fragment_under_wrong_index_rejected() {
        let fragments = sample_fragments();
        let fpcc = build(&fragments, &Fingerprint::new_seeded(7));
        assert!(!verify(&fpcc, 0, &fragments[1]));
    }

    #[test]
    fn test_index_out_of_range() {
        let fragments = sample_fragments();
        let fpcc = build(&fragments, &Fingerprint::new_seeded(7));
        assert_eq!(
            check(&fpcc, 3, &fragments[0]),
            Err(FpccFault::IndexOutOfRange { index: 3, n: 3 })
        );
    }

    #[test]
    fn test_fingerprint_mismatch_detected() {
        // same bytes hashed under a different seed: SHA-256 still matches,
        // the fingerprint must not
        let fragments = sample_fragments();
        let mut fpcc = build(&fragments, &Fingerprint::new_seeded(7));
        fpcc.fps[2] = fpcc.fps[2].wrapping_add(1);
        assert_eq!(
            check(&fpcc, 2, &fragments[2]),
            Err(FpccFault::FingerprintMismatch)
        );
    }

    #[test]
    fn test_structural_equality() {
        let fragments = sample_fragments();
        let a = build(&fragments, &Fingerprint::new_seeded(7));
        let b = build(&fragments, &Fingerprint::new_seeded(7));
        let c = build(&fragments, &Fingerprint::new_seeded(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
