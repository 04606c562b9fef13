//! Strike -> timeout -> ban escalation.
//!
//! `strikes` accumulate until they reach the strike threshold, at which point
//! the identity times out: `timeouts` goes up by one and `strikes` returns to
//! zero. When `timeouts` reaches the timeout threshold the identity is banned
//! and its ledger row deleted.

use crate::audit::AuditSink;
use crate::ledger::{IdentityLedger, IdentityRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub strike_threshold: u32,
    pub timeout_threshold: u32,
}

/// Where an identity stands after a strike has been applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Escalation {
    /// Still below the strike threshold.
    Active,
    /// Strikes reached the threshold and were converted into a timeout.
    TimedOut { timeouts: u32 },
    /// Timeouts reached the threshold; the identity must be removed.
    Banned,
}

/// What happens to a banned identity's fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BanMode {
    /// Delete the ledger row only; the fingerprint may return as a new identity.
    #[default]
    Soft,
    /// Delete the row and refuse the fingerprint from then on.
    Permanent,
}

impl EscalationPolicy {
    /// Apply the state transitions for the record's current counters.
    ///
    /// Call after incrementing `strikes`. Thresholds below one are treated as one.
    pub fn transition(&self, record: &mut IdentityRecord) -> Escalation {
        if record.strikes < self.strike_threshold.max(1) {
            return Escalation::Active;
        }
        record.strikes = 0;
        record.timeouts = record.timeouts.saturating_add(1);
        if record.timeouts >= self.timeout_threshold.max(1) {
            return Escalation::Banned;
        }
        Escalation::TimedOut {
            timeouts: record.timeouts,
        }
    }
}

/// Applies escalation to the ledger and records the audit trail.
#[derive(Clone, Copy, Debug)]
pub struct EscalationController {
    policy: EscalationPolicy,
    ban_mode: BanMode,
}

impl EscalationController {
    pub fn new(policy: EscalationPolicy, ban_mode: BanMode) -> Self {
        Self { policy, ban_mode }
    }

    pub fn policy(&self) -> EscalationPolicy {
        self.policy
    }

    pub fn ban_mode(&self) -> BanMode {
        self.ban_mode
    }

    /// Record one strike against `record`, escalate, and persist the result.
    pub fn strike(
        &self,
        record: &mut IdentityRecord,
        ledger: &IdentityLedger,
        audit: &dyn AuditSink,
        now: i64,
    ) -> anyhow::Result<Escalation> {
        record.strikes = record.strikes.saturating_add(1);
        let escalation = self.policy.transition(record);
        match escalation {
            Escalation::Active => {
                ledger.save(record)?;
            }
            Escalation::TimedOut { timeouts } => {
                audit.record(&record.fingerprint, "user timed out");
                tracing::warn!(
                    fingerprint = %record.fingerprint,
                    timeouts,
                    "identity timed out"
                );
                ledger.save(record)?;
            }
            Escalation::Banned => {
                audit.record(&record.fingerprint, "user timed out");
                let permanent = self.ban_mode == BanMode::Permanent;
                ledger.ban(&record.fingerprint, now, permanent)?;
                audit.record(&record.fingerprint, "user banned");
                tracing::warn!(
                    fingerprint = %record.fingerprint,
                    permanent,
                    "identity banned"
                );
            }
        }
        Ok(escalation)
    }
}
