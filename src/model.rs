//! Core domain types for the issuance engine.

/// Number of shares requested or granted in a single certificate.
pub type ShareAmount = u32;

/// Per-class monotonic certificate sequence number, starting at 1.
pub type CertificateNumber = u64;

/// Longest class tag accepted on the wire (1-byte length prefix).
pub const MAX_CLASS_TAG_LEN: usize = 255;

/// Longest holder name accepted on the wire (2-byte length prefix).
pub const MAX_HOLDER_LEN: usize = 65_535;

/// A request to issue shares of one class to one holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    /// Share class tag, e.g. `CS` or `PS`.
    pub class: String,
    /// Opaque holder name. May contain spaces, never line terminators.
    pub holder: String,
    /// Number of shares requested, must be positive.
    pub amount: ShareAmount,
}

/// One committed grant, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    pub class: String,
    pub number: CertificateNumber,
    pub amount: ShareAmount,
    pub holder: String,
}

impl GrantRecord {
    pub fn new(
        class: impl Into<String>,
        number: CertificateNumber,
        amount: ShareAmount,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            number,
            amount,
            holder: holder.into(),
        }
    }
}

/// Returns true if `holder` is storable in the journal: within the wire
/// length bound and free of line terminators.
pub fn holder_is_valid(holder: &str) -> bool {
    holder.len() <= MAX_HOLDER_LEN && !holder.contains(['\n', '\r'])
}
