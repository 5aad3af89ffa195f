//! Error types for grant processing and journal recovery.

use thiserror::Error;

use crate::model::{CertificateNumber, ShareAmount};

/// Rejection of a single grant request. Nothing is journaled for these.
#[derive(Debug, Error)]
pub enum GrantError {
    #[error("unknown share class '{0}'")]
    UnknownClass(String),

    #[error("invalid amount {0}: must be positive")]
    InvalidAmount(ShareAmount),

    #[error("insufficient shares in class '{class}': requested {requested}, remaining {remaining}")]
    InsufficientShares {
        class: String,
        requested: ShareAmount,
        remaining: u64,
    },

    #[error("malformed holder name: over length bound or contains line terminators")]
    MalformedHolder,
}

/// Journal/state divergence detected while rebuilding from the journal.
/// Any of these aborts startup.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("journal names unconfigured class '{class}' (record {number})")]
    UnknownClass {
        class: String,
        number: CertificateNumber,
    },

    #[error(
        "class '{class}' certificate sequence broken: {records} records but counter ended at {next}"
    )]
    SequenceGap {
        class: String,
        records: u64,
        next: CertificateNumber,
    },

    #[error("class '{class}' over-issued: {issued} issued of {authorized} authorized")]
    OverIssued {
        class: String,
        issued: u64,
        authorized: u64,
    },
}
