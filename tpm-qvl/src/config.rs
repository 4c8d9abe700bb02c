// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tpm_eventlog::ToolsVersion;

/// How a quoted PCR that disagrees with the measured boot log is reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasuredBootMismatch {
    /// Fatal event under the measured boot component
    #[default]
    Gate,
    /// Reported, but does not block acceptance
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// PCR the verifier-supplied data is extended into
    pub data_pcr: u32,
    /// PCR summarizing the IMA measurement list
    pub ima_pcr: u32,
    /// PCRs covered by the measured boot event log
    pub measured_boot_pcrs: Vec<u32>,
    pub measured_boot_mismatch: MeasuredBootMismatch,
    /// Adopt the clock of a quote taken after a TPM reset or restart as
    /// the next baseline
    ///
    /// Enabled by default. When disabled, the stored clock is left as it
    /// was before the reset, so every later quote is compared against the
    /// pre-reset counters and the clock itself is never checked again.
    pub rebaseline_on_reset: bool,
    /// Output generation of the event log decoder
    pub tools_version: ToolsVersion,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            data_pcr: 16,
            ima_pcr: 10,
            measured_boot_pcrs: (0..=9).chain(11..=15).collect(),
            measured_boot_mismatch: MeasuredBootMismatch::Gate,
            rebaseline_on_reset: true,
            tools_version: ToolsVersion::default(),
        }
    }
}

impl VerifierConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid verifier config")
    }

    pub fn is_measured_boot_pcr(&self, index: u32) -> bool {
        self.measured_boot_pcrs.contains(&index)
    }
}
