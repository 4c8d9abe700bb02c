// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

use tpm_types::HashAlg;

/// Value of a freshly reset PCR after extending it once with `H(data)`
///
/// Returns `hex(H(start || H(data)))`.
pub fn simulate_extend(data: &[u8], alg: HashAlg) -> String {
    let mut hasher = alg.hasher();
    hasher.update(&alg.start_hash());
    hasher.update(&alg.hash(data));
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_simulate_extend_sha256() {
        let inner = Sha256::digest(b"nonce123");
        let mut outer = Sha256::new();
        outer.update([0u8; 32]);
        outer.update(inner);
        assert_eq!(
            simulate_extend(b"nonce123", HashAlg::Sha256),
            hex::encode(outer.finalize())
        );
    }

    #[test]
    fn test_simulate_extend_is_deterministic() {
        for alg in HashAlg::ALL {
            let a = simulate_extend(b"agent-data", alg);
            assert_eq!(a, simulate_extend(b"agent-data", alg));
            assert_eq!(a.len(), alg.digest_size() * 2);
            assert_ne!(a, simulate_extend(b"agent-datb", alg));
        }
    }
}
