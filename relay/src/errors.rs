//! Error taxonomy shared by every direction handler.
//!
//! Grounded on the classification style of `writers/retry.rs::classify_error`,
//! generalized from its EVM-transaction-specific categories to the five
//! classes the scheduler needs to decide retry/skip/pause (§4.9, §4.10, §5).

use thiserror::Error;

/// How the scheduler should treat a direction-handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying next cycle without penalty: RPC timeouts, connection
    /// resets, rate limiting from an upstream provider.
    Transient,
    /// Will never succeed as submitted: a contract revert for a reason other
    /// than a recognized soft-skip code, malformed input, signature failure.
    /// Counts toward the consecutive-failure demotion counter (§5).
    Permanent,
    /// The operation has already been completed on-chain or on-ledger by a
    /// prior cycle; treat as success and advance past it, not as an error.
    Duplicate,
    /// A condition that should halt the direction or trip the pause guardian
    /// rather than be retried: signature threshold not met, recovered address
    /// not in the validator set, replay of a consumed attestation id.
    Security,
    /// A data point outside expected bounds that should be surfaced and
    /// escalated rather than silently retried: supply cap swings, reserve
    /// ratio breaches (§4.10).
    Anomaly,
}

impl ErrorClass {
    /// Whether this class should advance the per-direction consecutive-failure
    /// counter used for the Healthy→Degraded→Failed demotion (§5).
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, ErrorClass::Permanent | ErrorClass::Security | ErrorClass::Anomaly)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("security: {0}")]
    Security(String),
    #[error("anomaly: {0}")]
    Anomaly(String),
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Transient(_) => ErrorClass::Transient,
            RelayError::Permanent(_) => ErrorClass::Permanent,
            RelayError::Duplicate(_) => ErrorClass::Duplicate,
            RelayError::Security(_) => ErrorClass::Security,
            RelayError::Anomaly(_) => ErrorClass::Anomaly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failure_classes_count_toward_demotion() {
        assert!(!ErrorClass::Transient.counts_as_failure());
        assert!(!ErrorClass::Duplicate.counts_as_failure());
        assert!(ErrorClass::Permanent.counts_as_failure());
        assert!(ErrorClass::Security.counts_as_failure());
        assert!(ErrorClass::Anomaly.counts_as_failure());
    }
}
