// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Quote verification orchestration

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tpm_eventlog::EventLogDecoder;
use tpm_types::{ClockInfo, HashAlg};
use tracing::{debug, error, warn};

use crate::{
    clock::check_quote_timing,
    collaborators::{ImaEvaluator, MeasuredBootPolicy, QuoteVerifier},
    pcrs::PcrEvidence,
    quote::{NativeQuoteVerifier, QuoteBlobs},
    Component, Failure, VerifierConfig,
};

/// Per-agent state carried from one attestation to the next
///
/// Owned by the caller; quotes of the same agent must be checked one at a
/// time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttestState {
    pub agent_id: String,
    /// Clock of the last accepted quote
    pub clock_info: ClockInfo,
}

impl AttestState {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            clock_info: ClockInfo::default(),
        }
    }
}

/// Everything an agent returned for one attestation request
#[derive(Debug, Clone, Default)]
pub struct QuoteRequest<'a> {
    pub nonce: &'a str,
    /// Data the agent was asked to bind into the data PCR
    pub data: Option<&'a str>,
    /// `r<quote>:<signature>:<pcrs>`
    pub quote: &'a str,
    /// AIK as a PEM SubjectPublicKeyInfo
    pub aik_pem: &'a str,
    pub tpm_policy: Option<&'a Value>,
    pub ima_measurement_list: Option<&'a str>,
    pub runtime_policy: Option<&'a Value>,
    pub hash_alg: Option<HashAlg>,
    pub ima_keyrings: Option<&'a Value>,
    pub mb_measurement_list: Option<&'a str>,
    pub mb_refstate: Option<&'a str>,
    /// Blobs are zlib compressed
    pub compressed: bool,
}

pub struct Verifier {
    pub(crate) config: VerifierConfig,
    pub(crate) quotes: Box<dyn QuoteVerifier + Send + Sync>,
    pub(crate) decoder: Box<dyn EventLogDecoder + Send + Sync>,
    pub(crate) ima: Box<dyn ImaEvaluator + Send + Sync>,
    pub(crate) measured_boot: Box<dyn MeasuredBootPolicy + Send + Sync>,
}

impl Verifier {
    pub fn new(
        config: VerifierConfig,
        decoder: impl EventLogDecoder + Send + Sync + 'static,
        ima: impl ImaEvaluator + Send + Sync + 'static,
        measured_boot: impl MeasuredBootPolicy + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            quotes: Box::new(NativeQuoteVerifier),
            decoder: Box::new(decoder),
            ima: Box::new(ima),
            measured_boot: Box::new(measured_boot),
        }
    }

    /// Replace the built-in quote check
    pub fn with_quote_verifier(
        mut self,
        quotes: impl QuoteVerifier + Send + Sync + 'static,
    ) -> Self {
        self.quotes = Box::new(quotes);
        self
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify a quote and every piece of evidence that came with it
    ///
    /// The quote itself and its clock are checked first; failing either
    /// ends the verification with an irrecoverable event. On success the
    /// clock in `state` is advanced and the PCRs are evaluated. The quote is
    /// acceptable iff the returned report has no fatal event.
    pub fn check_quote(&self, state: &mut AttestState, request: &QuoteRequest<'_>) -> Failure {
        let mut failure = Failure::new(Component::QuoteValidation);

        let Some(hash_alg) = request.hash_alg else {
            error!("no hash algorithm for quote of agent {}", state.agent_id);
            failure.add_irrecoverable("hash_alg_missing", "Hash algorithm cannot be empty");
            return failure;
        };

        let checked = QuoteBlobs::parse(request.quote, request.compressed).and_then(|blobs| {
            self.quotes
                .check_quote(request.aik_pem, request.nonce, &blobs, hash_alg)
        });
        let pcrs = match checked {
            Ok(pcrs) => pcrs,
            Err(e) => {
                error!("error verifying quote of agent {}: {e:#}", state.agent_id);
                failure.add_irrecoverable(
                    "quote_validation",
                    json!({"message": "Quote data validation", "error": format!("{e:#}")}),
                );
                return failure;
            }
        };
        debug!("quote of agent {} verified", state.agent_id);

        match check_quote_timing(
            self.quotes.as_ref(),
            &state.clock_info,
            request.quote,
            request.compressed,
            self.config.rebaseline_on_reset,
        ) {
            Ok(Some(clock_info)) => state.clock_info = clock_info,
            Ok(None) => {}
            Err(e) => {
                error!("clock check failed for agent {}: {e}", state.agent_id);
                failure.add_irrecoverable(
                    "quote_validation",
                    json!({"message": "Validation of clockinfo from quote", "data": e.to_string()}),
                );
                return failure;
            }
        }

        if pcrs.is_empty() {
            warn!(
                "quote for agent {} does not contain any PCRs. Make sure that the TPM supports {hash_alg} PCR banks",
                state.agent_id
            );
        }

        let evidence = PcrEvidence {
            tpm_policy: request.tpm_policy,
            pcrs: &pcrs,
            data: request.data,
            ima_measurement_list: request.ima_measurement_list,
            runtime_policy: request.runtime_policy,
            ima_keyrings: request.ima_keyrings,
            mb_measurement_list: request.mb_measurement_list,
            mb_refstate: request.mb_refstate,
            hash_alg,
        };
        failure.merge(self.check_pcrs(state, &evidence));
        failure
    }
}
