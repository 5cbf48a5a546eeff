//! Tracker collaborator interface.
//!
//! The announce transport (HTTP or otherwise) is external; the core hands
//! over its transfer totals and receives fresh peer addresses.

use crate::error::Result;
use std::net::SocketAddr;

/// Byte counters reported at every announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub uploaded: u64,
    pub downloaded: u64,
    pub remaining: u64,
}

pub trait TrackerSession: Send + Sync {
    /// Periodic announce: reports totals, returns peer addresses to dial.
    fn announce(&self, totals: TransferTotals) -> Result<Vec<SocketAddr>>;
}
