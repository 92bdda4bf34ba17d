//! # Meros
//!
//! *μέρος — Ancient Greek for "share" or "portion".*
//!
//! Meros is the ledger-resident core of a fractional asset marketplace:
//! it issues, trades, and pays dividends on tokens representing real-world
//! assets, recording every state change as documents in a replicated
//! key-value store owned by an external distributed-ledger substrate.
//!
//! ## What's inside
//!
//! Four stateless services composed in dependency order:
//!
//! - [`AssetRegistry`] — physical-asset records and their lifecycle
//!   (draft → published → archived / deleted).
//! - [`TokenLedger`] — mint, burn, transfer, and price tokens tied 1:1 to
//!   an asset, preserving `total == circulating + burned + available`.
//! - [`InvestorLedger`] — investor registration, purchase recording,
//!   per-`(token, investor)` balances, portfolio aggregation.
//! - [`PayoutEngine`] — payout pools distributed proportionally to
//!   current balance holders, with record-time per-token snapshots.
//!
//! Each operation is one substrate invocation: read documents, validate
//! invariants, write documents, return the resulting record plus a batch
//! of domain events for the caller to flush after commit. The substrate
//! commits the whole write set atomically or not at all, so a returned
//! error always means nothing changed.
//!
//! ## Determinism
//!
//! Every replica must compute the identical result from the identical
//! input. The core therefore never branches on wall-clock time (timestamps
//! are recorded, not compared), never iterates unordered collections into
//! output, and derives internal ids (transfer records, distributions)
//! from their inputs rather than from randomness.
//!
//! ```rust,ignore
//! let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
//! let registry = AssetRegistry::new(Arc::clone(&store));
//!
//! let mut events = EventSink::new();
//! let asset = registry
//!     .create_asset("admin", &mut events, "asset-1", payload)
//!     .await?;
//! for event in events.drain() {
//!     substrate.emit(event);
//! }
//! ```

pub mod asset;
pub mod error;
pub mod investor;
pub mod payout;
pub mod store;
pub mod token;

pub use asset::{Asset, AssetRegistry, AssetStatus};
pub use error::LedgerError;
pub use investor::{Investor, InvestorLedger, Portfolio, PortfolioHolding, Purchase};
pub use payout::{Distribution, Payout, PayoutEngine, PayoutStatus};
pub use store::{DocVersion, MemoryStore, Selector, StateStore, composite_key};
pub use token::{PricePoint, Token, TokenLedger, TokenStatistics, TransferRecord};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A fire-and-forget notification emitted alongside a committed state
/// change, consumed by external indexers and feed generators. Never
/// awaited by the core.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Collects the domain events of one invocation. Operations append to it;
/// the caller drains it after the substrate accepts the write set. Events
/// for a rejected invocation are simply dropped with the sink.
#[derive(Debug, Default)]
pub struct EventSink {
    events: Vec<DomainEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, name: &str, payload: Value) {
        self.events.push(DomainEvent {
            name: name.to_string(),
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn drain(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_sink_collects_and_drains() {
        let mut sink = EventSink::new();
        assert!(sink.is_empty());

        sink.emit("AssetCreated", json!({ "assetId": "a1" }));
        sink.emit("AssetPublished", json!({ "assetId": "a1" }));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events()[0].name, "AssetCreated");

        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        assert!(sink.is_empty());
    }
}
