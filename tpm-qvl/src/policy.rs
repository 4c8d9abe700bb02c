// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Acceptable digests per PCR index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrAllowlist(BTreeMap<u32, Vec<String>>);

impl PcrAllowlist {
    /// Normalize a TPM policy document
    ///
    /// The policy is a JSON object (or its string encoding) mapping PCR
    /// indices to lists of hex digests. The reserved `mask` entry is
    /// dropped and a bare string counts as a one-element list.
    pub fn from_policy(policy: &Value) -> Result<Self> {
        let parsed;
        let policy = match policy {
            Value::String(s) => {
                parsed = serde_json::from_str::<Value>(s).context("policy is not valid JSON")?;
                &parsed
            }
            other => other,
        };
        let Some(entries) = policy.as_object() else {
            bail!("policy must be an object");
        };

        let mut allowlist = BTreeMap::new();
        for (key, value) in entries {
            if key == "mask" {
                continue;
            }
            let index: u32 = key
                .trim()
                .parse()
                .with_context(|| format!("invalid PCR index {key:?}"))?;
            let digests = match value {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .map(str::to_string)
                            .with_context(|| format!("PCR {index}: digest {item} is not a string"))
                    })
                    .collect::<Result<_>>()?,
                other => bail!("PCR {index}: expected a list of digests, got {other}"),
            };
            if allowlist.insert(index, digests).is_some() {
                bail!("PCR {index} appears more than once");
            }
        }
        Ok(Self(allowlist))
    }

    pub fn get(&self, index: u32) -> Option<&[String]> {
        self.0.get(&index).map(Vec::as_slice)
    }

    /// Whether `value` is acceptable for a PCR that has an entry
    pub fn allows(&self, index: u32, value: &str) -> bool {
        self.get(index)
            .is_some_and(|digests| digests.iter().any(|d| d == value))
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.keys().copied()
    }
}
