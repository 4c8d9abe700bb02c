// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Output format generation of the `tpm2-tools` event log decoder
///
/// Only the generations that change decoder output are distinguished.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ToolsVersion {
    #[serde(rename = "3.2")]
    V3_2,
    #[serde(rename = "4.0")]
    V4_0,
    #[serde(rename = "4.2")]
    V4_2,
    /// Escapes strings in `tpm2_eventlog` output, including the trailing NUL
    #[default]
    #[serde(rename = "5.4")]
    V5_4,
}

impl ToolsVersion {
    /// Classify a raw tool version such as `5.2`, `4.3.1` or `5.3-24-g1234abc`
    pub fn from_version_string(raw: &str) -> Result<Self> {
        let mut parts = raw.trim().split('-');
        let base = parts.next().unwrap_or_default();
        let version = SemVer::parse(base).with_context(|| format!("invalid tools version: {raw}"))?;
        // git describe count after the tag
        let commits: Option<u32> = parts.next().and_then(|s| s.parse().ok());

        // The escaping change landed 24 commits after the 5.3 tag
        let escaping_snapshot = version == SemVer::new(5, 3, 0) && commits.unwrap_or(0) >= 24;

        if version >= SemVer::new(5, 4, 0) || escaping_snapshot {
            Ok(ToolsVersion::V5_4)
        } else if version >= SemVer::new(4, 2, 0) {
            Ok(ToolsVersion::V4_2)
        } else if version >= SemVer::new(4, 0, 0) {
            Ok(ToolsVersion::V4_0)
        } else if version >= SemVer::new(3, 2, 0) {
            Ok(ToolsVersion::V3_2)
        } else {
            bail!("tpm2-tools version {raw} is not supported");
        }
    }

    pub fn escapes_event_strings(self) -> bool {
        self >= ToolsVersion::V5_4
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolsVersion::V3_2 => "3.2",
            ToolsVersion::V4_0 => "4.0",
            ToolsVersion::V4_2 => "4.2",
            ToolsVersion::V5_4 => "5.4",
        }
    }
}

impl fmt::Display for ToolsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SemVer {
    major: u32,
    minor: u32,
    patch: u32,
}

impl SemVer {
    const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `major.minor[.patch]`, ignoring build metadata after `+`
    fn parse(version: &str) -> Option<Self> {
        let version = version.split('+').next()?.trim();
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(s) => s.parse().ok()?,
            None => 0,
        };
        Some(Self::new(major, minor, patch))
    }
}
