// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-place enrichment passes over a decoded boot event log
//!
//! Every pass tolerates malformed or missing input by leaving the affected
//! part of the tree alone. The log is untrusted: it comes from the endpoint
//! and has been through a decoder that has had bugs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tpm_types::HashAlg;
use tracing::debug;

use crate::{
    document::{LogKey, LogValue},
    ToolsVersion,
};

/// PCR range sizes a boot aggregate is computed over
pub const BOOT_AGGREGATE_PCR_COUNTS: [u32; 2] = [8, 10];

/// Run all enrichment passes in order
pub fn enrich(log: &mut LogValue, tools_version: ToolsVersion) {
    stringify_pcr_keys(log);
    add_boot_aggregates(log);
    unescape_log(log, tools_version);
}

/// Ensure that the PCR indices under `pcrs.<alg>` are string keys
pub fn stringify_pcr_keys(log: &mut LogValue) {
    let Some(pcrs) = log.get_mut("pcrs").and_then(LogValue::as_mapping_mut) else {
        return;
    };
    for cells in pcrs.values_mut() {
        let Some(cells) = cells.as_mapping_mut() else {
            continue;
        };
        let old = std::mem::take(cells);
        *cells = old
            .into_iter()
            .map(|(key, value)| (LogKey::Str(key.to_string()), value))
            .collect();
    }
}

/// Compute the boot aggregate candidates for every bank in `pcrs`
///
/// Stores `boot_aggregates.<alg>` as a list with one digest per entry of
/// [`BOOT_AGGREGATE_PCR_COUNTS`] that could be computed.
pub fn add_boot_aggregates(log: &mut LogValue) {
    let Some(pcrs) = log.get("pcrs") else {
        return;
    };
    let Some(banks) = pcrs.as_mapping() else {
        return;
    };

    let mut aggregates = BTreeMap::new();
    for bank in banks.keys() {
        let bank = bank.to_string();
        let digests = BOOT_AGGREGATE_PCR_COUNTS
            .iter()
            .filter_map(|&count| match boot_aggregate(pcrs, &bank, count) {
                Ok(digest) => Some(LogValue::String(digest)),
                Err(e) => {
                    debug!("no boot aggregate for {bank} over {count} PCRs: {e:#}");
                    None
                }
            })
            .collect();
        aggregates.insert(LogKey::Str(bank), LogValue::Sequence(digests));
    }

    if let Some(root) = log.as_mapping_mut() {
        root.insert(
            LogKey::from("boot_aggregates"),
            LogValue::Mapping(aggregates),
        );
    }
}

/// Hash the values of PCR 0 to `pcr_count - 1` of one bank, in order
///
/// Each value is widened to the digest size of the bank before hashing.
pub fn boot_aggregate(pcrs: &LogValue, bank: &str, pcr_count: u32) -> Result<String> {
    let alg: HashAlg = bank.parse()?;
    let cells = pcrs
        .get(bank)
        .and_then(LogValue::as_mapping)
        .with_context(|| format!("no PCR map for bank {bank}"))?;

    let width = alg.digest_size() * 2;
    let mut hasher = alg.hasher();
    for index in 0..pcr_count {
        let digits = cells
            .get(&LogKey::Str(index.to_string()))
            .with_context(|| format!("PCR {index} missing"))?
            .integer_hex()
            .with_context(|| format!("PCR {index} is not an integer"))?;
        let padded = format!("{digits:0>width$}");
        let bytes =
            hex::decode(&padded).with_context(|| format!("PCR {index} has odd hex length"))?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Collect `boot_aggregates` back out of an enriched log
pub fn boot_aggregates(log: &LogValue) -> BTreeMap<String, Vec<String>> {
    let Some(banks) = log.get("boot_aggregates").and_then(LogValue::as_mapping) else {
        return BTreeMap::new();
    };
    banks
        .iter()
        .map(|(bank, digests)| {
            let digests = match digests {
                LogValue::Sequence(items) => items
                    .iter()
                    .filter_map(|d| d.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            (bank.to_string(), digests)
        })
        .collect()
}

/// Reverse the string escaping of newer `tpm2_eventlog` releases
///
/// A no-op for tool versions that do not escape their output.
pub fn unescape_log(log: &mut LogValue, tools_version: ToolsVersion) {
    if !tools_version.escapes_event_strings() {
        return;
    }
    unescape_tree(log);
}

fn unescape_tree(value: &mut LogValue) {
    match value {
        LogValue::String(s) => {
            if let Some(unescaped) = unescape_str(s) {
                *s = unescaped;
            }
        }
        LogValue::Sequence(items) => items.iter_mut().for_each(unescape_tree),
        LogValue::Mapping(entries) => entries.values_mut().for_each(unescape_tree),
        _ => {}
    }
}

/// Unescape one quoted string, e.g. `"MokList\0"` becomes `MokList`
///
/// Returns `None` for strings that are not wrapped in double quotes.
/// Unknown escape sequences are kept verbatim.
pub fn unescape_str(s: &str) -> Option<String> {
    if !(s.starts_with('"') && s.ends_with('"')) {
        return None;
    }
    let inner = if s.len() >= 2 { &s[1..s.len() - 1] } else { "" };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('\0'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0b'),
            Some('f') => out.push('\x0c'),
            Some('r') => out.push('\r'),
            Some('e') => out.push('\x1b'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Some(out.trim_end_matches('\0').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_yaml;
    use sha2::{Digest, Sha256};

    fn pcr_digest(index: u32) -> String {
        hex::encode(Sha256::digest(index.to_be_bytes()))
    }

    fn sample_log(pcrs: std::ops::Range<u32>) -> LogValue {
        let mut yaml = String::from("version: 2\npcrs:\n  sha256:\n");
        for i in pcrs {
            yaml.push_str(&format!("    {i}  : 0x{}\n", pcr_digest(i)));
        }
        parse_yaml(&yaml).unwrap()
    }

    fn escape(s: &str) -> String {
        let mut out = String::from("\"");
        for c in s.chars() {
            match c {
                '\0' => out.push_str("\\0"),
                '\x07' => out.push_str("\\a"),
                '\x08' => out.push_str("\\b"),
                '\t' => out.push_str("\\t"),
                '\x0b' => out.push_str("\\v"),
                '\x0c' => out.push_str("\\f"),
                '\r' => out.push_str("\\r"),
                '\x1b' => out.push_str("\\e"),
                '\'' => out.push_str("\\'"),
                '\\' => out.push_str("\\\\"),
                c => out.push(c),
            }
        }
        out.push('"');
        out
    }

    #[test]
    fn test_stringify_pcr_keys() {
        let mut log = sample_log(0..3);
        stringify_pcr_keys(&mut log);
        let cells = log
            .get("pcrs")
            .and_then(|p| p.get("sha256"))
            .and_then(LogValue::as_mapping)
            .unwrap();
        assert_eq!(cells.len(), 3);
        assert!(cells.keys().all(|k| matches!(k, LogKey::Str(_))));
        assert!(cells.contains_key(&LogKey::from("2")));
    }

    #[test]
    fn test_stringify_tolerates_odd_shapes() {
        let mut log = parse_yaml("pcrs: 7\n").unwrap();
        stringify_pcr_keys(&mut log);
        assert_eq!(log.get("pcrs"), Some(&LogValue::Integer(7)));

        let mut log = parse_yaml("pcrs:\n  sha1: [1, 2]\n").unwrap();
        stringify_pcr_keys(&mut log);
        assert!(matches!(
            log.get("pcrs").and_then(|p| p.get("sha1")),
            Some(LogValue::Sequence(_))
        ));
    }

    #[test]
    fn test_boot_aggregate_matches_streaming_hash() {
        let mut log = sample_log(0..10);
        stringify_pcr_keys(&mut log);
        add_boot_aggregates(&mut log);

        let mut h8 = Sha256::new();
        for i in 0..8 {
            h8.update(hex::decode(pcr_digest(i)).unwrap());
        }
        let mut h10 = h8.clone();
        for i in 8..10 {
            h10.update(hex::decode(pcr_digest(i)).unwrap());
        }

        let aggregates = boot_aggregates(&log);
        assert_eq!(
            aggregates["sha256"],
            vec![hex::encode(h8.finalize()), hex::encode(h10.finalize())]
        );
    }

    #[test]
    fn test_boot_aggregate_pads_short_values() {
        let mut log = parse_yaml(
            "pcrs:\n  sha256:\n    0: 1\n    1: 0\n    2: 0\n    3: 0\n    4: 0\n    5: 0\n    6: 0\n    7: 0\n",
        )
        .unwrap();
        stringify_pcr_keys(&mut log);
        add_boot_aggregates(&mut log);

        let mut expected = Sha256::new();
        let mut one = [0u8; 32];
        one[31] = 1;
        expected.update(one);
        for _ in 1..8 {
            expected.update([0u8; 32]);
        }
        assert_eq!(
            boot_aggregates(&log)["sha256"],
            vec![hex::encode(expected.finalize())]
        );
    }

    #[test]
    fn test_missing_pcrs_omit_aggregates() {
        // PCR 8 and 9 missing: only the 8-PCR aggregate is computed
        let mut log = sample_log(0..8);
        stringify_pcr_keys(&mut log);
        add_boot_aggregates(&mut log);
        assert_eq!(boot_aggregates(&log)["sha256"].len(), 1);

        // PCR 0 missing: nothing is computed, and nothing fails
        let mut log = sample_log(1..10);
        stringify_pcr_keys(&mut log);
        add_boot_aggregates(&mut log);
        assert!(boot_aggregates(&log)["sha256"].is_empty());
    }

    #[test]
    fn test_unknown_bank_is_omitted() {
        let mut log = parse_yaml("pcrs:\n  sm3_256:\n    0: 1\n").unwrap();
        stringify_pcr_keys(&mut log);
        add_boot_aggregates(&mut log);
        assert!(boot_aggregates(&log)["sm3_256"].is_empty());
        assert!(boot_aggregate(log.get("pcrs").unwrap(), "sm3_256", 8).is_err());
    }

    #[test]
    fn test_unescape_str() {
        assert_eq!(unescape_str("\"MokList\\0\"").unwrap(), "MokList");
        assert_eq!(unescape_str("\"a\\tb\"").unwrap(), "a\tb");
        assert_eq!(unescape_str("\"it\\'s\"").unwrap(), "it's");
        assert_eq!(unescape_str("\"c:\\\\boot\"").unwrap(), "c:\\boot");
        assert_eq!(unescape_str("\"\\q\"").unwrap(), "\\q");
        assert_eq!(unescape_str("\"trailing\\\"").unwrap(), "trailing\\");
        assert_eq!(unescape_str("unquoted\\0"), None);
        assert_eq!(unescape_str("\"").unwrap(), "");
    }

    #[test]
    fn test_unescape_round_trip() {
        let alphabet = ['\0', '\x07', '\x08', '\t', '\x0b', '\x0c', '\r', '\x1b', '\'', '\\'];
        for a in alphabet {
            for b in alphabet {
                for c in alphabet {
                    let s: String = [a, b, c].iter().collect();
                    if s.ends_with('\0') {
                        // trailing NULs are stripped on purpose
                        continue;
                    }
                    assert_eq!(unescape_str(&escape(&s)).unwrap(), s, "input {s:?}");
                }
            }
        }
    }

    #[test]
    fn test_unescape_log_gated_by_tools_version() {
        let yaml = "events:\n- Event:\n    UnicodeName: '\"MokList\\0\"'\n";
        let original = parse_yaml(yaml).unwrap();

        let mut old = original.clone();
        unescape_log(&mut old, ToolsVersion::V4_2);
        assert_eq!(old, original);

        let mut new = original.clone();
        unescape_log(&mut new, ToolsVersion::V5_4);
        let LogValue::Sequence(events) = new.get("events").unwrap() else {
            panic!("events should be a sequence");
        };
        assert_eq!(
            events[0].get("Event").and_then(|e| e.get("UnicodeName")),
            Some(&LogValue::String("MokList".into()))
        );
    }

    #[test]
    fn test_enrich_runs_all_passes() {
        let mut log = sample_log(0..10);
        enrich(&mut log, ToolsVersion::V5_4);
        assert_eq!(boot_aggregates(&log)["sha256"].len(), 2);
        assert!(log
            .get("pcrs")
            .and_then(|p| p.get("sha256"))
            .and_then(|c| c.get("9"))
            .is_some());
    }
}
