// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! PCR policy evaluation
//!
//! Every quoted PCR is adjudicated by at most one evidence source, in this
//! order: the data PCR, the IMA PCR, the measured boot PCRs and finally the
//! static allowlist. PCRs that no source claims and the policy does not
//! name are only logged.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tpm_types::{HashAlg, PcrValues};
use tracing::{debug, error, info, warn};

use crate::{
    bootlog::parse_mb_bootlog,
    collaborators::{ImaRequest, RefState},
    config::MeasuredBootMismatch,
    extend::simulate_extend,
    policy::PcrAllowlist,
    verify::{AttestState, Verifier},
    Component, Failure,
};

/// Evidence the PCR evaluation runs over
#[derive(Debug, Clone, Copy)]
pub struct PcrEvidence<'a> {
    /// TPM policy document; `None` is an empty allowlist
    pub tpm_policy: Option<&'a Value>,
    /// Quoted PCR values of the `hash_alg` bank
    pub pcrs: &'a PcrValues,
    /// Data the agent was asked to extend into the data PCR
    pub data: Option<&'a str>,
    pub ima_measurement_list: Option<&'a str>,
    pub runtime_policy: Option<&'a Value>,
    pub ima_keyrings: Option<&'a Value>,
    /// Base64 encoded binary measured boot log
    pub mb_measurement_list: Option<&'a str>,
    pub mb_refstate: Option<&'a str>,
    pub hash_alg: HashAlg,
}

fn not_in_allowlist(got: &str, expected: &[String]) -> Value {
    json!({
        "context": "PCR value is not in allowlist",
        "got": got,
        "expected": expected,
    })
}

impl Verifier {
    fn resolve_refstate(
        &self,
        refstate: Option<&str>,
        agent_id: &str,
        failure: &mut Failure,
    ) -> Option<RefState> {
        match self.measured_boot.resolve(refstate) {
            Ok(resolved) => resolved.filter(|r| !r.is_empty()),
            Err(e) => {
                error!("invalid measured boot reference state for agent {agent_id}: {e:#}");
                let mut mb_failure = Failure::new(Component::MeasuredBoot);
                mb_failure.add_irrecoverable("invalid_refstate", format!("{e:#}"));
                failure.merge(mb_failure);
                None
            }
        }
    }

    /// Reconcile the quoted PCRs with every evidence source
    pub fn check_pcrs(&self, state: &AttestState, evidence: &PcrEvidence<'_>) -> Failure {
        let mut failure = Failure::new(Component::PcrValidation);
        let agent_id = state.agent_id.as_str();
        let pcrs = evidence.pcrs;
        let hash_alg = evidence.hash_alg;

        let allowlist = match evidence.tpm_policy.map(PcrAllowlist::from_policy) {
            None => PcrAllowlist::default(),
            Some(Ok(allowlist)) => allowlist,
            Some(Err(e)) => {
                error!("invalid TPM policy for agent {agent_id}: {e:#}");
                failure.add_irrecoverable("invalid_tpm_policy", format!("{e:#}"));
                return failure;
            }
        };

        let refstate = self.resolve_refstate(evidence.mb_refstate, agent_id, &mut failure);
        if let Some(refstate) = &refstate {
            debug!(
                "evaluating measured boot log sent by agent {agent_id} with measured boot policy {}",
                refstate.policy_name
            );
        }

        let (mb_log, mb_parsed) = match parse_mb_bootlog(
            evidence.mb_measurement_list,
            self.decoder.as_ref(),
            self.config.tools_version,
            hash_alg,
        ) {
            Ok(log) => (log, true),
            Err(mb_failure) => {
                failure.merge(mb_failure);
                (None, false)
            }
        };

        let mut claimed = BTreeSet::new();

        // Data PCR
        let data_pcr = self.config.data_pcr;
        if let Some(data) = evidence.data {
            match pcrs.get(&data_pcr) {
                Some(got) => {
                    let expected = simulate_extend(data.as_bytes(), hash_alg);
                    if *got != expected {
                        error!(
                            "PCR #{data_pcr}: invalid bind data {got} from quote (from agent {agent_id}) does not match expected value {expected}"
                        );
                        failure.add_event(
                            &format!("invalid_pcr_{data_pcr}"),
                            json!({"got": got, "expected": expected}),
                        );
                    }
                    claimed.insert(data_pcr);
                }
                None => {
                    error!(
                        "binding PCR #{data_pcr} was not included in the quote (from agent {agent_id}), but is required"
                    );
                    failure.add_event(
                        &format!("missing_pcr_{data_pcr}"),
                        format!("Data PCR {data_pcr} is missing in quote, but is required"),
                    );
                }
            }
        }

        // IMA PCR
        let ima_pcr = self.config.ima_pcr;
        if let Some(pcr_value) = pcrs.get(&ima_pcr).filter(|_| !claimed.contains(&ima_pcr)) {
            match evidence.ima_measurement_list.filter(|list| !list.is_empty()) {
                None => {
                    error!("IMA PCR in policy, but no measurement list provided by agent {agent_id}");
                    failure.add_event(
                        &format!("unused_pcr_{ima_pcr}"),
                        "IMA PCR in policy, but no measurement list provided",
                    );
                }
                Some(list) => {
                    info!("checking IMA measurement list on agent: {agent_id}");
                    let request = ImaRequest {
                        state,
                        measurement_lines: list.split('\n').collect(),
                        runtime_policy: evidence.runtime_policy,
                        pcr_value,
                        keyrings: evidence.ima_keyrings,
                        boot_aggregates: mb_log.as_ref().map(|log| &log.boot_aggregates),
                        hash_alg,
                    };
                    let ima_failure = self.ima.evaluate(&request);
                    if ima_failure.is_empty() {
                        debug!("IMA measurement list of agent {agent_id} validated");
                    }
                    failure.merge(ima_failure);
                }
            }
            claimed.insert(ima_pcr);
        }

        // Measured boot PCRs, only when the log could be parsed
        let mut mb_pcr_failure = Failure::new(Component::MeasuredBoot);
        if mb_parsed && refstate.is_some() {
            for (&index, quoted) in pcrs {
                if !self.config.is_measured_boot_pcr(index) || claimed.contains(&index) {
                    continue;
                }
                let name = format!("invalid_pcr_{index}");
                let Some(log) = &mb_log else {
                    error!(
                        "measured boot PCR {index} in policy, but no measurement list provided by agent {agent_id}"
                    );
                    failure.add_event(
                        &format!("unused_pcr_{index}"),
                        format!(
                            "Measured Boot PCR {index} in policy, but no measurement list provided"
                        ),
                    );
                    continue;
                };

                let expected = log.pcr_hex(index);
                let matches = expected
                    .as_deref()
                    .is_some_and(|e| e.trim_start_matches('0') == quoted.trim_start_matches('0'));
                if !matches {
                    error!(
                        "for PCR {index} and hash {hash_alg} the boot event log has value {expected:?} but the agent {agent_id} returned {quoted}"
                    );
                    let context = json!({
                        "context": format!(
                            "{} boot event log PCR value does not match",
                            hash_alg.name().to_uppercase()
                        ),
                        "got": quoted,
                        "expected": expected,
                    });
                    match self.config.measured_boot_mismatch {
                        MeasuredBootMismatch::Gate => mb_pcr_failure.add_event(&name, context),
                        MeasuredBootMismatch::Advisory => mb_pcr_failure.add_advisory(&name, context),
                    }
                }

                match allowlist.get(index) {
                    Some(allowed) if !allowlist.allows(index, quoted) => {
                        error!(
                            "PCR #{index}: {quoted} from quote (from agent {agent_id}) does not match expected value {allowed:?}"
                        );
                        failure.add_event(&name, not_in_allowlist(quoted, allowed));
                    }
                    _ => {}
                }
                claimed.insert(index);
            }
        }
        failure.merge(mb_pcr_failure);

        // Everything else is governed by the static allowlist
        for (&index, quoted) in pcrs {
            if claimed.contains(&index) {
                continue;
            }
            let Some(allowed) = allowlist.get(index) else {
                warn!(
                    "PCR #{index} in quote (from agent {agent_id}) not found in tpm_policy, skipping"
                );
                continue;
            };
            if !allowlist.allows(index, quoted) {
                error!(
                    "PCR #{index}: {quoted} from quote (from agent {agent_id}) does not match expected value {allowed:?}"
                );
                failure.add_event(
                    &format!("invalid_pcr_{index}"),
                    not_in_allowlist(quoted, allowed),
                );
            }
            claimed.insert(index);
        }

        let missing: Vec<u32> = allowlist
            .indices()
            .filter(|index| !claimed.contains(index))
            .collect();
        if !missing.is_empty() {
            error!("PCRs specified in policy not in quote (from agent {agent_id}): {missing:?}");
            failure.add_event(
                "missing_pcrs",
                json!({"context": "PCRs are missing in quote", "data": missing}),
            );
        }

        if mb_parsed {
            if let Some(refstate) = &refstate {
                let mb_policy_failure = self.measured_boot.evaluate(
                    refstate,
                    mb_log.as_ref().map(|log| &log.document),
                    &claimed,
                    agent_id,
                );
                failure.merge(mb_policy_failure);
            }
        }

        failure
    }
}
