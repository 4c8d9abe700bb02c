// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Evidence checks the quote acceptance pipeline delegates

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde_json::Value;
use tpm_eventlog::LogValue;
use tpm_types::{ClockInfo, HashAlg, PcrValues};

use crate::{quote::QuoteBlobs, verify::AttestState, Failure};

/// Structural and signature check of a quote
pub trait QuoteVerifier {
    /// Verify the quote against the AIK and nonce and return the PCR
    /// values of the `hash_alg` bank
    fn check_quote(
        &self,
        aik_pem: &str,
        nonce: &str,
        blobs: &QuoteBlobs,
        hash_alg: HashAlg,
    ) -> Result<PcrValues>;

    /// Read TPMS_CLOCK_INFO from a quote blob
    fn clock_info(&self, quote_blob: &[u8]) -> Result<ClockInfo>;
}

/// Input of one IMA measurement list evaluation
#[derive(Debug, Clone)]
pub struct ImaRequest<'a> {
    pub state: &'a AttestState,
    pub measurement_lines: Vec<&'a str>,
    pub runtime_policy: Option<&'a Value>,
    /// Quoted value of the IMA PCR the list has to replay to
    pub pcr_value: &'a str,
    pub keyrings: Option<&'a Value>,
    /// Boot aggregates derived from the measured boot log, per bank
    pub boot_aggregates: Option<&'a BTreeMap<String, Vec<String>>>,
    pub hash_alg: HashAlg,
}

pub trait ImaEvaluator {
    fn evaluate(&self, request: &ImaRequest<'_>) -> Failure;
}

/// Reference state selected for a measured boot evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct RefState {
    pub policy_name: String,
    pub reference_data: Value,
}

impl RefState {
    /// Whether the reference state carries anything to evaluate against
    pub fn is_empty(&self) -> bool {
        match &self.reference_data {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }
}

pub trait MeasuredBootPolicy {
    /// Look up the reference state named by the caller, if any
    fn resolve(&self, refstate: Option<&str>) -> Result<Option<RefState>>;

    /// Structural checks over the whole log, given the PCRs adjudicated so far
    ///
    /// `log` is `None` when the agent sent no measured boot log.
    fn evaluate(
        &self,
        refstate: &RefState,
        log: Option<&LogValue>,
        claimed_pcrs: &BTreeSet<u32>,
        agent_id: &str,
    ) -> Failure;
}

/// Measured boot policy that never resolves a reference state
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMeasuredBootPolicy;

impl MeasuredBootPolicy for NoMeasuredBootPolicy {
    fn resolve(&self, _refstate: Option<&str>) -> Result<Option<RefState>> {
        Ok(None)
    }

    fn evaluate(
        &self,
        _refstate: &RefState,
        _log: Option<&LogValue>,
        _claimed_pcrs: &BTreeSet<u32>,
        _agent_id: &str,
    ) -> Failure {
        Failure::new(crate::Component::MeasuredBoot)
    }
}
