//! Share issuance engine.
//!
//! The engine owns per-class inventory and certificate counters and decides
//! every grant under single-writer discipline. A decision is split in two:
//! [`Engine::check`] validates a request and picks the certificate number it
//! would carry, and [`Engine::commit`] applies the grant once the journal has
//! made it durable. State is only ever touched between those two calls by the
//! single writer, so numbers come out dense and inventory never oversells.

use std::collections::HashMap;

use crate::model::{holder_is_valid, CertificateNumber, GrantRecord, GrantRequest};

mod state;
pub use state::ClassState;

mod error;
pub use error::{GrantError, RecoveryError};

/// Counters produced by a journal replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Total records applied.
    pub records: u64,
}

/// The issuance engine.
///
/// Holds one [`ClassState`] per configured share class. The class set is
/// fixed at construction; unknown classes are rejected, never created.
pub struct Engine {
    classes: HashMap<String, ClassState>,
}

/// Public API
impl Engine {
    pub fn new(classes: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            classes: classes
                .into_iter()
                .map(|(tag, authorized)| (tag, ClassState::new(authorized)))
                .collect(),
        }
    }

    /// Validate a request against current state and return the certificate
    /// number a successful grant would carry. Does not mutate anything.
    pub fn check(&self, request: &GrantRequest) -> Result<CertificateNumber, GrantError> {
        if request.amount == 0 {
            return Err(GrantError::InvalidAmount(request.amount));
        }
        if !holder_is_valid(&request.holder) {
            return Err(GrantError::MalformedHolder);
        }
        let state = self
            .classes
            .get(&request.class)
            .ok_or_else(|| GrantError::UnknownClass(request.class.clone()))?;
        if !state.can_issue(request.amount) {
            return Err(GrantError::InsufficientShares {
                class: request.class.clone(),
                requested: request.amount,
                remaining: state.remaining(),
            });
        }
        Ok(state.next_certificate())
    }

    /// Apply a grant whose journal record is durable. Must follow a
    /// successful [`check`](Engine::check) for the same request with no
    /// intervening mutation.
    pub fn commit(&mut self, request: &GrantRequest) {
        debug_assert!(self.classes.contains_key(&request.class));
        if let Some(state) = self.classes.get_mut(&request.class) {
            state.record_issue(request.amount);
        }
    }

    /// Rebuild state from journal records, then verify that per-class
    /// counters are consistent with the record counts.
    pub fn recover(
        &mut self,
        records: impl IntoIterator<Item = GrantRecord>,
    ) -> Result<RecoveryStats, RecoveryError> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut stats = RecoveryStats::default();

        for record in records {
            let state =
                self.classes
                    .get_mut(&record.class)
                    .ok_or_else(|| RecoveryError::UnknownClass {
                        class: record.class.clone(),
                        number: record.number,
                    })?;
            state.replay_issue(record.amount, record.number);
            *counts.entry(record.class).or_default() += 1;
            stats.records += 1;
        }

        for (tag, state) in &self.classes {
            let records = counts.get(tag).copied().unwrap_or(0);
            if state.next_certificate() != records + 1 {
                return Err(RecoveryError::SequenceGap {
                    class: tag.clone(),
                    records,
                    next: state.next_certificate(),
                });
            }
            if state.issued() > state.authorized() {
                return Err(RecoveryError::OverIssued {
                    class: tag.clone(),
                    issued: state.issued(),
                    authorized: state.authorized(),
                });
            }
        }

        Ok(stats)
    }

    /// Look up the state of one share class.
    pub fn class(&self, tag: &str) -> Option<&ClassState> {
        self.classes.get(tag)
    }
}
