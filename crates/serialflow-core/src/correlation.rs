//! Correlation table
//!
//! Holds every request that has been written and is still waiting for a
//! response. Entries are kept in insertion order and identified by
//! [`RequestId`], never by payload, so two requests with identical bytes
//! stay distinct.
//!
//! Timeouts are detected lazily: an expired entry is skipped by
//! [`CorrelationTable::find_match`] and collected by the next
//! [`CorrelationTable::sweep`], which runs on every read tick.

use std::sync::Arc;

use tokio::time::Instant;

use crate::request::{Request, RequestId, ResponseCount, ResponseRule};

/// A request together with the engine's bookkeeping for it
#[derive(Debug, Clone)]
pub struct Pending {
    request: Arc<Request>,
    retries_left: u32,
    remaining: ResponseCount,
    sent_at: Option<Instant>,
}

impl Pending {
    pub fn new(request: Arc<Request>) -> Self {
        Self {
            retries_left: request.timeout_retry(),
            remaining: request.response_count(),
            sent_at: None,
            request,
        }
    }

    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn remaining(&self) -> ResponseCount {
        self.remaining
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Record the write time
    pub fn mark_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    /// Past its response deadline; unsent entries and a zero timeout never expire
    pub fn is_expired(&self, now: Instant) -> bool {
        let timeout = self.request.timeout();
        match self.sent_at {
            Some(sent) if !timeout.is_zero() => now.saturating_duration_since(sent) > timeout,
            _ => false,
        }
    }

    fn matches(&self, frame: &[u8], global_rules: &[Arc<dyn ResponseRule>]) -> bool {
        let request = self.request.as_ref();
        let rules = if request.has_rules() {
            request.rules()
        } else {
            global_rules
        };
        !rules.is_empty() && rules.iter().all(|rule| rule.matches(request, frame))
    }
}

/// Whether a request can ever be matched
pub fn has_applicable_rule(request: &Request, global_rules: &[Arc<dyn ResponseRule>]) -> bool {
    request.has_rules() || !global_rules.is_empty()
}

/// Result of a timeout sweep
#[derive(Debug, Default)]
pub struct Sweep {
    /// Timed out with retry budget left; already removed and ready to resend
    pub retry: Vec<Pending>,
    /// Timed out for good; already removed
    pub expired: Vec<Pending>,
}

impl Sweep {
    pub fn is_empty(&self) -> bool {
        self.retry.is_empty() && self.expired.is_empty()
    }
}

/// In-flight requests in insertion order
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Vec<Pending>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pending: Pending) {
        self.entries.push(pending);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.iter().any(|p| p.id() == id)
    }

    /// First live entry whose rules all accept `frame`
    pub fn find_match(
        &self,
        frame: &[u8],
        now: Instant,
        global_rules: &[Arc<dyn ResponseRule>],
    ) -> Option<Arc<Request>> {
        self.entries
            .iter()
            .filter(|p| !p.is_expired(now))
            .find(|p| p.matches(frame, global_rules))
            .map(|p| Arc::clone(&p.request))
    }

    /// Count one delivered response for `id`
    ///
    /// Returns true when the entry's expectation is used up and it was removed.
    pub fn record_response(&mut self, id: RequestId) -> bool {
        let Some(index) = self.entries.iter().position(|p| p.id() == id) else {
            return false;
        };
        if self.entries[index].remaining.consume() {
            self.entries.remove(index);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: RequestId) -> Option<Pending> {
        let index = self.entries.iter().position(|p| p.id() == id)?;
        Some(self.entries.remove(index))
    }

    /// Pull every expired entry out of the table
    ///
    /// Entries with retry budget left are reset for resending; the rest are
    /// handed back for failure delivery.
    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        let mut kept = Vec::with_capacity(self.entries.len());
        for mut pending in self.entries.drain(..) {
            if !pending.is_expired(now) {
                kept.push(pending);
            } else if pending.retries_left > 0 {
                pending.retries_left -= 1;
                pending.sent_at = None;
                sweep.retry.push(pending);
            } else {
                sweep.expired.push(pending);
            }
        }
        self.entries = kept;
        sweep
    }

    /// Remove everything
    pub fn drain(&mut self) -> Vec<Pending> {
        std::mem::take(&mut self.entries)
    }
}
