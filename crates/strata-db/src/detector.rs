use tracing::{debug, warn};

use crate::session::{ACTIVE_SQL_TRANSACTION, INVALID_TRANSACTION_TERMINATION, Notice, Session};

/// Catches migrations that try to manage their own transaction.
///
/// Some servers answer a nested `BEGIN` with a warning instead of an error,
/// and a bare `COMMIT` silently ends the outer transaction. The detector
/// drains the session's notices around each statement and latches when the
/// "already in a transaction" or "transaction ended" diagnostic shows up.
#[derive(Debug, Default)]
pub struct NestedTxnDetector {
    offending: Option<Notice>,
}

impl NestedTxnDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard anything received so far and clear the latch.
    pub fn reset<S: Session + ?Sized>(&mut self, session: &mut S) {
        for notice in session.drain_notices() {
            debug!("discarding notice {}: {}", notice.code, notice.message);
        }
        self.offending = None;
    }

    /// Drain the session's notices and latch on the first one that shows the
    /// statement tampered with the transaction.
    pub fn observe<S: Session + ?Sized>(&mut self, session: &mut S) {
        for notice in session.drain_notices() {
            if is_transaction_control(&notice) {
                warn!("transaction control detected: {}", notice.message);
                self.offending.get_or_insert(notice);
            } else {
                debug!("notice {} ({}): {}", notice.code, notice.severity, notice.message);
            }
        }
    }

    pub fn is_latched(&self) -> bool {
        self.offending.is_some()
    }

    pub fn offending_notice(&self) -> Option<&Notice> {
        self.offending.as_ref()
    }
}

fn is_transaction_control(notice: &Notice) -> bool {
    notice.code == ACTIVE_SQL_TRANSACTION || notice.code == INVALID_TRANSACTION_TERMINATION
}
