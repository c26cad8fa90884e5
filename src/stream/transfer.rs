//! Per-slot transfer bookkeeping.

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    /// Never submitted.
    Idle,
    /// Submitted, completion not yet processed.
    Pending,
    /// Last submission delivered data.
    Completed,
    /// Last submission failed or was rejected.
    Failed,
    /// Last submission was cancelled.
    Cancelled,
}

impl TransferStatus {
    /// States from which the transfer may be resubmitted.
    #[must_use]
    pub fn is_resubmittable(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One transfer bound to one buffer slot for the lifetime of a session.
#[derive(Debug)]
pub(crate) struct Transfer {
    status: TransferStatus,
    consecutive_failures: u32,
}

impl Transfer {
    pub(crate) fn new() -> Self {
        Self {
            status: TransferStatus::Idle,
            consecutive_failures: 0,
        }
    }

    pub(crate) fn status(&self) -> TransferStatus {
        self.status
    }

    pub(crate) fn mark_pending(&mut self) {
        self.status = TransferStatus::Pending;
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = TransferStatus::Completed;
        self.consecutive_failures = 0;
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = TransferStatus::Cancelled;
    }

    /// Record a failure; returns the length of the current failure run.
    pub(crate) fn mark_failed(&mut self) -> u32 {
        self.status = TransferStatus::Failed;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_run_resets_on_success() {
        let mut transfer = Transfer::new();
        assert_eq!(transfer.status(), TransferStatus::Idle);
        assert!(!transfer.status().is_resubmittable());

        assert_eq!(transfer.mark_failed(), 1);
        assert_eq!(transfer.mark_failed(), 2);
        assert!(transfer.status().is_resubmittable());

        transfer.mark_completed();
        assert_eq!(transfer.mark_failed(), 1);
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let mut transfer = Transfer::new();
        transfer.mark_pending();
        transfer.mark_cancelled();
        assert!(!transfer.status().is_resubmittable());
    }
}
