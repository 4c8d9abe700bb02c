// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Quote Verification Library (QVL)
//!
//! Decides whether a TPM quote from a remote agent is acceptable. A quote is
//! checked in three stages, each of which can end the verification:
//! - **quote**: signature, nonce and PCR digest ([`QuoteVerifier`])
//! - **clock**: TPM clock and counters against the agent's last quote
//! - **PCRs**: data PCR, IMA PCR, measured boot PCRs and the static
//!   allowlist
//!
//! The result is a [`Failure`] report rather than a boolean. The quote is
//! accepted iff the report has no fatal event.

pub use bootlog::{parse_mb_bootlog, MeasuredBootLog};
pub use clock::{check_clock, check_quote_timing, ClockError};
pub use collaborators::{
    ImaEvaluator, ImaRequest, MeasuredBootPolicy, NoMeasuredBootPolicy, QuoteVerifier, RefState,
};
pub use config::{MeasuredBootMismatch, VerifierConfig};
pub use extend::simulate_extend;
pub use failure::{Component, Event, EventContext, Failure};
pub use pcrs::PcrEvidence;
pub use policy::PcrAllowlist;
pub use quote::{NativeQuoteVerifier, QuoteBlobs};
pub use verify::{AttestState, QuoteRequest, Verifier};

pub mod bootlog;
pub mod clock;
pub mod collaborators;
pub mod config;
mod extend;
mod failure;
mod pcrs;
pub mod policy;
pub mod quote;
pub mod verify;
