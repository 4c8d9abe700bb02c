// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Measured boot event log intake
//!
//! The raw binary log (`binary_bios_measurements`) is turned into a
//! structured tree by an external decoder, then enriched in place:
//! 1. PCR index keys are normalized to strings
//! 2. boot aggregates are computed per bank over PCR 0-7 and PCR 0-9
//! 3. vendor string escaping is reversed, for tool versions that escape

pub use document::{LogKey, LogMapping, LogValue};
pub use enrich::{boot_aggregate, boot_aggregates, enrich, BOOT_AGGREGATE_PCR_COUNTS};
pub use tools_version::ToolsVersion;

pub mod document;
pub mod enrich;
mod tools_version;

/// Output of an event log decoder run
#[derive(Debug, Clone, Default)]
pub struct DecodedLog {
    /// YAML document describing the log
    pub yaml: String,
    /// Diagnostic output; anything here invalidates the document
    pub diagnostics: String,
}

/// Turns a raw binary boot event log into YAML
pub trait EventLogDecoder {
    fn decode(&self, raw: &[u8]) -> anyhow::Result<DecodedLog>;
}

impl<T: EventLogDecoder + ?Sized> EventLogDecoder for std::sync::Arc<T> {
    fn decode(&self, raw: &[u8]) -> anyhow::Result<DecodedLog> {
        (**self).decode(raw)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("event log decoder failed: {0:#}")]
    Decoder(anyhow::Error),
    #[error("event log decoder reported warnings: {0}")]
    Diagnostics(String),
    #[error("decoder output could not be parsed: {0}")]
    Yaml(String),
    #[error("decoder output contains no document")]
    EmptyDocument,
}

/// Decode and enrich a binary boot event log
pub fn parse_bootlog(
    raw: &[u8],
    decoder: &dyn EventLogDecoder,
    tools_version: ToolsVersion,
) -> Result<LogValue, ParseError> {
    let decoded = decoder.decode(raw).map_err(ParseError::Decoder)?;
    if !decoded.diagnostics.is_empty() {
        return Err(ParseError::Diagnostics(decoded.diagnostics));
    }
    let mut log = document::parse_yaml(&decoded.yaml)?;
    enrich(&mut log, tools_version);
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct FixedDecoder(Result<DecodedLog, &'static str>);

    impl EventLogDecoder for FixedDecoder {
        fn decode(&self, _raw: &[u8]) -> anyhow::Result<DecodedLog> {
            match &self.0 {
                Ok(log) => Ok(log.clone()),
                Err(e) => bail!("{e}"),
            }
        }
    }

    fn yaml_output(yaml: &str) -> FixedDecoder {
        FixedDecoder(Ok(DecodedLog {
            yaml: yaml.to_string(),
            diagnostics: String::new(),
        }))
    }

    #[test]
    fn test_parse_bootlog_enriches() {
        let decoder = yaml_output("pcrs:\n  sha1:\n    0: 1\nname: '\"x\\0\"'\n");
        let log = parse_bootlog(b"raw", &decoder, ToolsVersion::V5_4).unwrap();
        assert!(log.get("pcrs").unwrap().get("sha1").unwrap().get("0").is_some());
        assert!(log.get("boot_aggregates").is_some());
        assert_eq!(log.get("name").and_then(LogValue::as_str), Some("x"));
    }

    #[test]
    fn test_parse_bootlog_decoder_errors() {
        let failing = FixedDecoder(Err("tpm2_eventlog not found"));
        assert!(matches!(
            parse_bootlog(b"raw", &failing, ToolsVersion::V5_4),
            Err(ParseError::Decoder(_))
        ));

        let noisy = FixedDecoder(Ok(DecodedLog {
            yaml: "pcrs: {}\n".to_string(),
            diagnostics: "WARN: unknown event type".to_string(),
        }));
        assert!(matches!(
            parse_bootlog(b"raw", &noisy, ToolsVersion::V5_4),
            Err(ParseError::Diagnostics(_))
        ));

        let garbage = yaml_output("pcrs: [unclosed");
        assert!(matches!(
            parse_bootlog(b"raw", &garbage, ToolsVersion::V5_4),
            Err(ParseError::Yaml(_))
        ));
    }
}
