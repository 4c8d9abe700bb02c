// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Intake of the measured boot event log sent by an agent

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use tpm_eventlog::{
    boot_aggregates, parse_bootlog, EventLogDecoder, LogKey, LogMapping, LogValue, ParseError,
    ToolsVersion,
};
use tpm_types::HashAlg;
use tracing::error;

use crate::{Component, Failure};

/// Enriched measured boot log, reduced to what PCR evaluation needs
#[derive(Debug, Clone)]
pub struct MeasuredBootLog {
    /// `pcrs.<alg>` of the requested bank
    pub pcr_hashes: LogMapping,
    /// `boot_aggregates`, per bank
    pub boot_aggregates: BTreeMap<String, Vec<String>>,
    pub document: LogValue,
}

impl MeasuredBootLog {
    /// Final value of a PCR as hex without leading zeros
    ///
    /// A PCR that was never extended reads as `0`; a value that is not an
    /// integer yields `None`.
    pub fn pcr_hex(&self, index: u32) -> Option<String> {
        match self.pcr_hashes.get(&LogKey::Str(index.to_string())) {
            Some(value) => value.integer_hex(),
            None => Some("0".to_string()),
        }
    }
}

fn parser_failure() -> Failure {
    Failure::with_sub_components(Component::MeasuredBoot, &["parser"])
}

fn to_json(value: Option<&LogValue>) -> serde_json::Value {
    value
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(serde_json::Value::Null)
}

/// Decode, enrich and shape-check a base64 encoded binary boot log
///
/// Returns `Ok(None)` when no log was supplied.
pub fn parse_mb_bootlog(
    log_b64: Option<&str>,
    decoder: &dyn EventLogDecoder,
    tools_version: ToolsVersion,
    hash_alg: HashAlg,
) -> Result<Option<MeasuredBootLog>, Failure> {
    let Some(log_b64) = log_b64.filter(|log| !log.is_empty()) else {
        return Ok(None);
    };

    let mut failure = parser_failure();
    let Ok(raw) = STANDARD.decode(log_b64) else {
        error!("measured boot log could not be decoded");
        failure.add_event("log.base64decode", "Measured boot log could not be decoded");
        return Err(failure);
    };

    let document = match parse_bootlog(&raw, decoder, tools_version) {
        Ok(document) => document,
        Err(e) => {
            error!("unable to parse measured boot event log: {e}");
            match e {
                ParseError::Decoder(_) => {
                    failure.add_event("tpm2_eventlog", "running tpm2_eventlog failed")
                }
                ParseError::Diagnostics(data) => failure.add_event(
                    "tpm2_eventlog.warning",
                    json!({"context": "tpm2_eventlog exited with warnings", "data": data}),
                ),
                ParseError::Yaml(_) | ParseError::EmptyDocument => failure.add_event(
                    "yaml",
                    "yaml output of tpm2_eventlog could not be parsed!",
                ),
            }
            return Err(failure);
        }
    };

    let log_pcrs = document.get("pcrs");
    let Some(banks) = log_pcrs.and_then(LogValue::as_mapping) else {
        error!("parse of measured boot event log has unexpected value for .pcrs");
        failure.add_event("invalid_pcrs", json!({"got": to_json(log_pcrs)}));
        return Err(failure);
    };

    let bank = banks.get(&LogKey::from(hash_alg.name()));
    let pcr_hashes = match bank.and_then(LogValue::as_mapping) {
        Some(cells) if !cells.is_empty() => cells.clone(),
        _ => {
            error!("parse of measured boot event log has unexpected value for .pcrs.{hash_alg}");
            failure.add_event("invalid_pcrs_hashes", json!({"got": to_json(bank)}));
            return Err(failure);
        }
    };

    let aggregates = document.get("boot_aggregates");
    if !aggregates
        .and_then(LogValue::as_mapping)
        .is_some_and(|m| !m.is_empty())
    {
        error!("parse of measured boot event log has unexpected value for .boot_aggregates");
        failure.add_event(
            "invalid_boot_aggregates",
            json!({"got": to_json(aggregates)}),
        );
        return Err(failure);
    }

    Ok(Some(MeasuredBootLog {
        pcr_hashes,
        boot_aggregates: boot_aggregates(&document),
        document,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use tpm_eventlog::DecodedLog;

    struct Decoder {
        yaml: &'static str,
        diagnostics: &'static str,
        fail: bool,
    }

    impl EventLogDecoder for Decoder {
        fn decode(&self, _raw: &[u8]) -> anyhow::Result<DecodedLog> {
            if self.fail {
                bail!("tpm2_eventlog not found");
            }
            Ok(DecodedLog {
                yaml: self.yaml.to_string(),
                diagnostics: self.diagnostics.to_string(),
            })
        }
    }

    fn yaml(yaml: &'static str) -> Decoder {
        Decoder {
            yaml,
            diagnostics: "",
            fail: false,
        }
    }

    fn parse(log: Option<&str>, decoder: &Decoder) -> Result<Option<MeasuredBootLog>, Failure> {
        parse_mb_bootlog(log, decoder, ToolsVersion::V5_4, HashAlg::Sha256)
    }

    fn failure_ids(result: Result<Option<MeasuredBootLog>, Failure>) -> Vec<String> {
        let failure = result.unwrap_err();
        assert!(failure.has_fatal());
        failure.event_ids().into_iter().map(String::from).collect()
    }

    const LOG: &str = "pcrs:\n  sha256:\n    0  : 0x00ab\n    1  : 0x0\n    2  : 0x2\n    3  : 0x3\n    4  : 0x4\n    5  : 0x5\n    6  : 0x6\n    7  : 0x7\n";

    #[test]
    fn test_no_log() {
        assert!(parse(None, &yaml(LOG)).unwrap().is_none());
        assert!(parse(Some(""), &yaml(LOG)).unwrap().is_none());
    }

    #[test]
    fn test_parsed_log() {
        let log = parse(Some("AAAA"), &yaml(LOG)).unwrap().unwrap();
        assert_eq!(log.pcr_hex(0).unwrap(), "ab");
        assert_eq!(log.pcr_hex(1).unwrap(), "0");
        assert_eq!(log.pcr_hex(12).unwrap(), "0");
        assert_eq!(log.boot_aggregates["sha256"].len(), 1);
    }

    #[test]
    fn test_intake_failures() {
        assert_eq!(
            failure_ids(parse(Some("not base64!"), &yaml(LOG))),
            vec!["measured_boot.parser.log.base64decode"]
        );
        let failing = Decoder {
            yaml: "",
            diagnostics: "",
            fail: true,
        };
        assert_eq!(
            failure_ids(parse(Some("AAAA"), &failing)),
            vec!["measured_boot.parser.tpm2_eventlog"]
        );
        let noisy = Decoder {
            yaml: LOG,
            diagnostics: "WARN: event type unknown",
            fail: false,
        };
        assert_eq!(
            failure_ids(parse(Some("AAAA"), &noisy)),
            vec!["measured_boot.parser.tpm2_eventlog.warning"]
        );
        assert_eq!(
            failure_ids(parse(Some("AAAA"), &yaml(""))),
            vec!["measured_boot.parser.yaml"]
        );
    }

    #[test]
    fn test_shape_failures() {
        assert_eq!(
            failure_ids(parse(Some("AAAA"), &yaml("pcrs: 3\n"))),
            vec!["measured_boot.parser.invalid_pcrs"]
        );
        assert_eq!(
            failure_ids(parse(Some("AAAA"), &yaml("pcrs:\n  sha1:\n    0  : 0x1\n"))),
            vec!["measured_boot.parser.invalid_pcrs_hashes"]
        );
    }

    #[test]
    fn test_partial_bank_has_no_aggregates() {
        let log = parse(Some("AAAA"), &yaml("pcrs:\n  sha256:\n    0  : 0x1\n"))
            .unwrap()
            .unwrap();
        assert!(log.boot_aggregates["sha256"].is_empty());
    }
}
