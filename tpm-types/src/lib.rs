// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM Types - Common TPM-related type definitions
//!
//! This crate contains type definitions shared across the verifier crates:
//! - tpm-eventlog (boot event log enrichment)
//! - tpm-tools (tpm2-tools command channel)
//! - tpm-qvl (quote acceptance pipeline)

use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use sha2::digest::DynDigest;

/// PCR values of one bank, keyed by PCR index, as lowercase hex digests
pub type PcrValues = BTreeMap<u32, String>;

/// Hash algorithm of a PCR bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

pub const TPM_ALG_SHA1: u16 = 0x0004;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_SHA384: u16 = 0x000C;
pub const TPM_ALG_SHA512: u16 = 0x000D;

impl HashAlg {
    pub const ALL: [HashAlg; 4] = [
        HashAlg::Sha1,
        HashAlg::Sha256,
        HashAlg::Sha384,
        HashAlg::Sha512,
    ];

    /// Bank name as used by tpm2-tools and in event logs
    pub fn name(self) -> &'static str {
        match self {
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha384 => "sha384",
            HashAlg::Sha512 => "sha512",
        }
    }

    /// TPM_ALG_ID (TPM 2.0 Part 2, Section 6.3)
    pub fn tpm_alg_id(self) -> u16 {
        match self {
            HashAlg::Sha1 => TPM_ALG_SHA1,
            HashAlg::Sha256 => TPM_ALG_SHA256,
            HashAlg::Sha384 => TPM_ALG_SHA384,
            HashAlg::Sha512 => TPM_ALG_SHA512,
        }
    }

    pub fn from_tpm_alg_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.tpm_alg_id() == id)
    }

    pub fn digest_size(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    /// Value of a freshly reset PCR in this bank
    pub fn start_hash(self) -> Vec<u8> {
        vec![0u8; self.digest_size()]
    }

    /// Streaming hasher for this algorithm
    pub fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            HashAlg::Sha1 => Box::new(sha1::Sha1::default()),
            HashAlg::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlg::Sha384 => Box::new(sha2::Sha384::default()),
            HashAlg::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().into_vec()
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(HashAlg::Sha1),
            "sha256" => Ok(HashAlg::Sha256),
            "sha384" => Ok(HashAlg::Sha384),
            "sha512" => Ok(HashAlg::Sha512),
            _ => bail!("unsupported hash algorithm: {s}"),
        }
    }
}

/// TPMS_CLOCK_INFO snapshot taken from a quote
///
/// The default value is the all-zero sentinel used before the first quote
/// of an endpoint has been accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockInfo {
    /// Milliseconds the TPM has been running since its last reset
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    /// Clear when the clock may have been reported lower than before
    pub safe: bool,
}
