//! Platform adapters
//!
//! Each messaging platform is exposed to the scheduler as a capability:
//! send one observable side-effect toward a target and stream back delivery
//! receipts. The scheduler is polymorphic over this trait and never sees
//! platform-specific envelopes; translating those is adapter business.

pub mod bridge;
pub mod signal;
pub mod whatsapp;

use crate::errors::AdapterError;
use async_trait::async_trait;
use common::{Channel, ProbeMethod};
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;

/// Outcome of a dispatched probe.
#[derive(Debug, Clone)]
pub struct ProbeTicket {
    /// Opaque token the platform's delivery receipt will carry.
    pub token: String,
    /// Clock taken before the send call returned.
    pub sent_at_ms: i64,
}

/// One translated delivery receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub token: String,
    pub delivered_at_ms: i64,
}

/// Canonical identity plus optional display metadata for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub target_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Emit one observable side-effect toward `target_id`.
    ///
    /// Fails with `UnsupportedProbeMethod` for variants the platform cannot
    /// express and `Unavailable` while the platform link is down.
    async fn send_probe(
        &self,
        target_id: &str,
        method: ProbeMethod,
    ) -> Result<ProbeTicket, AdapterError>;

    /// Take the receipt stream. Restartable but not replayable; returns
    /// None once taken.
    fn take_receipts(&self) -> Option<mpsc::UnboundedReceiver<Receipt>>;

    /// Canonicalize a user-supplied identifier into this platform's
    /// target id, with best-effort display metadata.
    async fn resolve_target(&self, identifier: &str) -> Result<ResolvedTarget, AdapterError>;

    fn is_available(&self) -> bool;

    /// Receipt frames dropped as malformed since startup.
    fn malformed_receipt_count(&self) -> u64;
}

/// Digits-only canonical form of a phone-number identifier.
pub fn canonical_digits(identifier: &str) -> Result<String, AdapterError> {
    let digits: String = identifier.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        Err(AdapterError::InvalidTarget(identifier.to_string()))
    } else {
        Ok(digits)
    }
}

/// At-most-once filter for receipt tokens, bounded FIFO.
pub(crate) struct ReceiptDeduper {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl ReceiptDeduper {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Returns false when the token was already seen.
    pub fn insert(&mut self, token: &str) -> bool {
        if self.seen.contains(token) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(token.to_string());
        self.order.push_back(token.to_string());
        true
    }
}
