// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Clock monotonicity between consecutive quotes of one agent

use tpm_types::ClockInfo;
use tracing::debug;

use crate::{collaborators::QuoteVerifier, quote::QuoteBlobs};

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("clock info could not be extracted from quote: {0:#}")]
    Extraction(anyhow::Error),
    #[error("resetCount value decreased on TPM between two consecutive quotes")]
    ResetCountDecreased,
    #[error("restartCount value decreased on TPM between two consecutive quotes")]
    RestartCountDecreased,
    #[error("clock safe flag is disabled")]
    Unsafe,
    #[error("clock timestamp issued by TPM did not increase between two consecutive quotes")]
    ClockNotIncreased,
}

/// Compare the clock of a new quote against the last accepted one
///
/// Returns the state the caller should store, or `None` to keep the
/// stored state as is.
pub fn check_clock(
    previous: &ClockInfo,
    current: ClockInfo,
    rebaseline_on_reset: bool,
) -> Result<Option<ClockInfo>, ClockError> {
    let reset_diff = i64::from(current.reset_count) - i64::from(previous.reset_count);
    let restart_diff = i64::from(current.restart_count) - i64::from(previous.restart_count);

    if reset_diff < 0 {
        return Err(ClockError::ResetCountDecreased);
    }
    if restart_diff < 0 {
        return Err(ClockError::RestartCountDecreased);
    }
    if !current.safe {
        return Err(ClockError::Unsafe);
    }

    if reset_diff == 0 && restart_diff == 0 {
        if current.clock <= previous.clock {
            return Err(ClockError::ClockNotIncreased);
        }
        return Ok(Some(current));
    }

    // Clock values on both sides of a reset are not comparable
    debug!(
        "TPM reset ({reset_diff}) or restart ({restart_diff}) since last quote, skipping clock comparison"
    );
    Ok(rebaseline_on_reset.then_some(current))
}

/// Extract the clock from a wire-format quote and check it
pub fn check_quote_timing(
    verifier: &dyn QuoteVerifier,
    previous: &ClockInfo,
    quote: &str,
    compressed: bool,
    rebaseline_on_reset: bool,
) -> Result<Option<ClockInfo>, ClockError> {
    let current = QuoteBlobs::parse(quote, compressed)
        .and_then(|blobs| verifier.clock_info(&blobs.quote))
        .map_err(ClockError::Extraction)?;
    check_clock(previous, current, rebaseline_on_reset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(clock: u64, reset_count: u32, restart_count: u32) -> ClockInfo {
        ClockInfo {
            clock,
            reset_count,
            restart_count,
            safe: true,
        }
    }

    #[test]
    fn test_counter_rollback_rejected() {
        for (previous, current) in [
            (clock(100, 2, 0), clock(200, 1, 0)),
            (clock(100, 2, 5), clock(200, 2, 4)),
            (clock(100, 2, 5), clock(200, 3, 4)),
            (clock(100, 2, 5), clock(50, 1, 9)),
        ] {
            let err = check_clock(&previous, current, true).unwrap_err();
            assert!(matches!(
                err,
                ClockError::ResetCountDecreased | ClockError::RestartCountDecreased
            ));
        }
    }

    #[test]
    fn test_counter_rollback_over_u32_range() {
        let previous = clock(100, u32::MAX, 0);
        let current = clock(200, 0, 0);
        assert!(matches!(
            check_clock(&previous, current, true),
            Err(ClockError::ResetCountDecreased)
        ));
    }

    #[test]
    fn test_unsafe_clock_rejected() {
        let mut current = clock(200, 0, 0);
        current.safe = false;
        assert!(matches!(
            check_clock(&clock(100, 0, 0), current, true),
            Err(ClockError::Unsafe)
        ));
    }

    #[test]
    fn test_clock_must_advance_without_reset() {
        let previous = clock(100, 3, 7);
        for now in [0, 99, 100] {
            assert!(matches!(
                check_clock(&previous, clock(now, 3, 7), true),
                Err(ClockError::ClockNotIncreased)
            ));
        }
        let current = clock(101, 3, 7);
        assert_eq!(check_clock(&previous, current, true).unwrap(), Some(current));
    }

    #[test]
    fn test_reset_skips_clock_comparison() {
        let previous = clock(5_000, 3, 7);
        // counters are compared independently
        assert!(matches!(
            check_clock(&previous, clock(10, 4, 0), true),
            Err(ClockError::RestartCountDecreased)
        ));

        let after_reset = clock(10, 4, 7);
        assert_eq!(
            check_clock(&previous, after_reset, true).unwrap(),
            Some(after_reset)
        );

        let after_restart = clock(10, 3, 8);
        assert_eq!(
            check_clock(&previous, after_restart, true).unwrap(),
            Some(after_restart)
        );
        assert_eq!(check_clock(&previous, after_restart, false).unwrap(), None);
    }

    #[test]
    fn test_first_quote_against_zero_state() {
        let current = clock(1, 0, 0);
        assert_eq!(
            check_clock(&ClockInfo::default(), current, true).unwrap(),
            Some(current)
        );
    }
}
