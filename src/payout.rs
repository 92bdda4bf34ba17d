// src/payout.rs
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::investor::holder_candidates;
use crate::store::{Selector, StateStore};
use crate::token::{Token, read_balance};
use crate::{EventSink, LedgerError};

pub(crate) const PAYOUT_DOC_TYPE: &str = "payout";
pub(crate) const DISTRIBUTION_DOC_TYPE: &str = "distribution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Completed,
    Cancelled,
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayoutStatus::Pending => write!(f, "pending"),
            PayoutStatus::Completed => write!(f, "completed"),
            PayoutStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A payout pool for one token.
///
/// `per_token_amount` is fixed when the payout is recorded, against the
/// circulating supply at that moment. Distribution later multiplies it by
/// each holder's balance at distribution time, so trades between the two
/// steps shift individual shares; `remaining_amount` reports whatever the
/// pool over- or under-paid instead of forcing the sums to agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub id: String,
    pub doc_type: String,
    pub asset_id: String,
    pub token_id: String,
    pub total_amount: f64,
    pub payout_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub per_token_amount: f64,
    pub circulating_supply_at_payout: f64,
    pub payout_date: DateTime<Utc>,
    pub status: PayoutStatus,
    pub distributed_amount: f64,
    pub remaining_amount: f64,
    pub recorded_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_recipients: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
}

/// One holder's share of a distributed payout. Its id derives from the
/// payout and investor ids, so replaying a distribution cannot mint a
/// second record for the same pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub id: String,
    pub doc_type: String,
    pub payout_id: String,
    pub investor_id: String,
    pub token_id: String,
    pub token_balance: f64,
    pub amount: f64,
    pub distributed_at: DateTime<Utc>,
    pub status: String,
}

/// The completed payout together with the distribution records it wrote.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub payout: Payout,
    pub distributions: Vec<Distribution>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPayoutStats {
    pub total_payouts: usize,
    pub total_distributed: f64,
    pub last_payout_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPayouts {
    pub asset_id: String,
    pub payouts: Vec<Payout>,
    pub statistics: AssetPayoutStats,
}

/// Descriptive payout fields carried alongside each distribution when
/// reporting an investor's payout history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutDetails {
    pub asset_id: String,
    pub token_id: String,
    pub payout_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub payout_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestorDistribution {
    #[serde(flatten)]
    pub distribution: Distribution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_details: Option<PayoutDetails>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestorPayoutStats {
    pub total_distributions: usize,
    pub total_received: f64,
    pub last_distribution_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestorPayouts {
    pub investor_id: String,
    pub distributions: Vec<InvestorDistribution>,
    pub statistics: InvestorPayoutStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayoutStatistics {
    pub token_id: String,
    pub total_payouts: usize,
    pub total_distributed: f64,
    pub total_amount: f64,
    pub average_payout_amount: f64,
    pub completed_payouts: usize,
    pub pending_payouts: usize,
    pub cancelled_payouts: usize,
    pub last_payout_date: Option<DateTime<Utc>>,
}

/// Records payout pools and distributes them proportionally to current
/// token holders.
pub struct PayoutEngine {
    store: Arc<dyn StateStore>,
}

impl PayoutEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn record_payout(
        &self,
        caller: &str,
        events: &mut EventSink,
        payout_id: &str,
        asset_id: &str,
        token_id: &str,
        total_amount: f64,
        payout_type: &str,
        description: Option<String>,
    ) -> Result<Payout, LedgerError> {
        if !(total_amount.is_finite() && total_amount > 0.0) {
            return Err(LedgerError::Validation("invalid payout amount".to_string()));
        }
        if self.store.get(payout_id).await?.is_some() {
            return Err(LedgerError::AlreadyExists(format!("Payout {}", payout_id)));
        }
        if self.store.get(asset_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("Asset {}", asset_id)));
        }
        let token_raw = self
            .store
            .get(token_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Token {}", token_id)))?;
        let token: Token = serde_json::from_value(token_raw)?;

        // Zero circulation is a defined degenerate case: the pool is
        // recorded with nothing per token, and distribution pays nobody.
        let per_token_amount = if token.circulating_supply > 0.0 {
            total_amount / token.circulating_supply
        } else {
            0.0
        };

        let payout = Payout {
            id: payout_id.to_string(),
            doc_type: PAYOUT_DOC_TYPE.to_string(),
            asset_id: asset_id.to_string(),
            token_id: token_id.to_string(),
            total_amount,
            payout_type: payout_type.to_string(),
            description,
            per_token_amount,
            circulating_supply_at_payout: token.circulating_supply,
            payout_date: Utc::now(),
            status: PayoutStatus::Pending,
            distributed_amount: 0.0,
            remaining_amount: total_amount,
            recorded_by: caller.to_string(),
            distributed_at: None,
            number_of_recipients: None,
            cancelled_at: None,
            cancellation_reason: None,
        };

        self.store
            .put(payout_id, serde_json::to_value(&payout)?)
            .await?;

        events.emit(
            "PayoutRecorded",
            json!({
                "payoutId": payout_id,
                "assetId": asset_id,
                "tokenId": token_id,
                "totalAmount": total_amount,
                "timestamp": payout.payout_date,
            }),
        );
        counter!("meros.payout.mutations", "op" => "record").increment(1);

        Ok(payout)
    }

    /// Distribute a pending payout to every current holder.
    ///
    /// Holder candidates come from the purchase-record scan shared with
    /// [`InvestorLedger::get_token_investors`]; each candidate's current
    /// balance decides both membership and share. Completed and cancelled
    /// payouts are terminal and cannot be distributed.
    ///
    /// [`InvestorLedger::get_token_investors`]: crate::InvestorLedger::get_token_investors
    pub async fn distribute_payout(
        &self,
        _caller: &str,
        events: &mut EventSink,
        payout_id: &str,
    ) -> Result<DistributionReport, LedgerError> {
        let mut payout = self.get_payout(payout_id).await?;
        if payout.status != PayoutStatus::Pending {
            return Err(LedgerError::InvalidStateTransition(format!(
                "Payout {} is {}",
                payout_id, payout.status
            )));
        }

        let now = Utc::now();
        let mut distributions = Vec::new();
        let mut total_distributed = 0.0;

        for investor_id in holder_candidates(self.store.as_ref(), &payout.token_id).await? {
            let balance = read_balance(self.store.as_ref(), &payout.token_id, &investor_id).await?;
            if balance <= 0.0 {
                continue;
            }

            let distribution = Distribution {
                id: format!("dist_{}_{}", payout_id, investor_id),
                doc_type: DISTRIBUTION_DOC_TYPE.to_string(),
                payout_id: payout_id.to_string(),
                investor_id,
                token_id: payout.token_id.clone(),
                token_balance: balance,
                amount: balance * payout.per_token_amount,
                distributed_at: now,
                status: "completed".to_string(),
            };
            self.store
                .put(&distribution.id, serde_json::to_value(&distribution)?)
                .await?;
            total_distributed += distribution.amount;
            distributions.push(distribution);
        }

        payout.status = PayoutStatus::Completed;
        payout.distributed_amount = total_distributed;
        payout.remaining_amount = payout.total_amount - total_distributed;
        payout.distributed_at = Some(now);
        payout.number_of_recipients = Some(distributions.len() as u64);

        self.store
            .put(payout_id, serde_json::to_value(&payout)?)
            .await?;

        events.emit(
            "PayoutDistributed",
            json!({
                "payoutId": payout_id,
                "totalDistributed": total_distributed,
                "numberOfRecipients": distributions.len(),
                "timestamp": now,
            }),
        );
        counter!("meros.payout.mutations", "op" => "distribute").increment(1);
        histogram!("meros.payout.distributed_amount", "token" => payout.token_id.clone())
            .record(total_distributed);
        debug!(
            payout_id,
            total_distributed,
            recipients = distributions.len(),
            "payout distributed"
        );

        Ok(DistributionReport {
            payout,
            distributions,
        })
    }

    pub async fn cancel_payout(
        &self,
        _caller: &str,
        events: &mut EventSink,
        payout_id: &str,
        reason: &str,
    ) -> Result<Payout, LedgerError> {
        let mut payout = self.get_payout(payout_id).await?;
        if payout.status == PayoutStatus::Completed {
            return Err(LedgerError::InvalidStateTransition(
                "Cannot cancel completed payout".to_string(),
            ));
        }

        let now = Utc::now();
        payout.status = PayoutStatus::Cancelled;
        payout.cancelled_at = Some(now);
        payout.cancellation_reason = Some(reason.to_string());

        self.store
            .put(payout_id, serde_json::to_value(&payout)?)
            .await?;

        events.emit(
            "PayoutCancelled",
            json!({
                "payoutId": payout_id,
                "reason": reason,
                "timestamp": now,
            }),
        );
        counter!("meros.payout.mutations", "op" => "cancel").increment(1);

        Ok(payout)
    }

    // ==================== Queries ====================

    pub async fn get_payout(&self, payout_id: &str) -> Result<Payout, LedgerError> {
        let raw = self
            .store
            .get(payout_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Payout {}", payout_id)))?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn payout_exists(&self, payout_id: &str) -> Result<bool, LedgerError> {
        Ok(self.store.get(payout_id).await?.is_some())
    }

    pub async fn get_all_payouts(&self) -> Result<Vec<Payout>, LedgerError> {
        self.query_payouts(Selector::doc_type(PAYOUT_DOC_TYPE)).await
    }

    /// Payouts for one asset, newest first, with aggregate statistics.
    pub async fn get_asset_payouts(&self, asset_id: &str) -> Result<AssetPayouts, LedgerError> {
        let payouts = self
            .query_payouts(Selector::doc_type(PAYOUT_DOC_TYPE).field("assetId", asset_id))
            .await?;

        let statistics = AssetPayoutStats {
            total_payouts: payouts.len(),
            total_distributed: payouts.iter().map(|p| p.distributed_amount).sum(),
            last_payout_date: payouts.first().map(|p| p.payout_date),
        };

        Ok(AssetPayouts {
            asset_id: asset_id.to_string(),
            payouts,
            statistics,
        })
    }

    /// Everything an investor has received, each distribution joined with
    /// the descriptive fields of its payout.
    pub async fn get_investor_payouts(
        &self,
        investor_id: &str,
    ) -> Result<InvestorPayouts, LedgerError> {
        let selector =
            Selector::doc_type(DISTRIBUTION_DOC_TYPE).field("investorId", investor_id);
        let mut distributions: Vec<Distribution> = self
            .store
            .query(&selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect::<Result<_, _>>()?;
        distributions.sort_by(|a, b| b.distributed_at.cmp(&a.distributed_at).then(b.id.cmp(&a.id)));

        let mut detailed = Vec::with_capacity(distributions.len());
        let mut total_received = 0.0;
        for distribution in distributions {
            let payout_details = match self.store.get(&distribution.payout_id).await? {
                Some(raw) => {
                    let payout: Payout = serde_json::from_value(raw)?;
                    Some(PayoutDetails {
                        asset_id: payout.asset_id,
                        token_id: payout.token_id,
                        payout_type: payout.payout_type,
                        description: payout.description,
                        payout_date: payout.payout_date,
                    })
                }
                None => None,
            };
            total_received += distribution.amount;
            detailed.push(InvestorDistribution {
                distribution,
                payout_details,
            });
        }

        let statistics = InvestorPayoutStats {
            total_distributions: detailed.len(),
            total_received,
            last_distribution_date: detailed.first().map(|d| d.distribution.distributed_at),
        };

        Ok(InvestorPayouts {
            investor_id: investor_id.to_string(),
            distributions: detailed,
            statistics,
        })
    }

    pub async fn get_payout_distributions(
        &self,
        payout_id: &str,
    ) -> Result<Vec<Distribution>, LedgerError> {
        let selector = Selector::doc_type(DISTRIBUTION_DOC_TYPE).field("payoutId", payout_id);
        let mut distributions: Vec<Distribution> = self
            .store
            .query(&selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect::<Result<_, _>>()?;
        distributions.sort_by(|a, b| a.investor_id.cmp(&b.investor_id));
        Ok(distributions)
    }

    pub async fn get_token_payout_statistics(
        &self,
        token_id: &str,
    ) -> Result<TokenPayoutStatistics, LedgerError> {
        let payouts = self
            .query_payouts(Selector::doc_type(PAYOUT_DOC_TYPE).field("tokenId", token_id))
            .await?;

        let total_amount: f64 = payouts.iter().map(|p| p.total_amount).sum();
        Ok(TokenPayoutStatistics {
            token_id: token_id.to_string(),
            total_payouts: payouts.len(),
            total_distributed: payouts.iter().map(|p| p.distributed_amount).sum(),
            total_amount,
            average_payout_amount: if payouts.is_empty() {
                0.0
            } else {
                total_amount / payouts.len() as f64
            },
            completed_payouts: payouts
                .iter()
                .filter(|p| p.status == PayoutStatus::Completed)
                .count(),
            pending_payouts: payouts
                .iter()
                .filter(|p| p.status == PayoutStatus::Pending)
                .count(),
            cancelled_payouts: payouts
                .iter()
                .filter(|p| p.status == PayoutStatus::Cancelled)
                .count(),
            last_payout_date: payouts.first().map(|p| p.payout_date),
        })
    }

    async fn query_payouts(&self, selector: Selector) -> Result<Vec<Payout>, LedgerError> {
        let mut payouts: Vec<Payout> = self
            .store
            .query(&selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect::<Result<_, _>>()?;
        payouts.sort_by(|a, b| b.payout_date.cmp(&a.payout_date).then(b.id.cmp(&a.id)));
        Ok(payouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssetRegistry, InvestorLedger, MemoryStore, TokenLedger};
    use serde_json::json;

    struct Fixture {
        payouts: PayoutEngine,
    }

    /// Asset + token with 1000 supply, fully sold as {alice: 600, bob: 400}.
    async fn setup_sold_out() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = AssetRegistry::new(store.clone() as Arc<dyn StateStore>);
        let tokens = TokenLedger::new(store.clone() as Arc<dyn StateStore>);
        let investors = InvestorLedger::new(store.clone() as Arc<dyn StateStore>);
        let payouts = PayoutEngine::new(store.clone() as Arc<dyn StateStore>);

        let mut events = EventSink::new();
        registry
            .create_asset(
                "admin",
                &mut events,
                "asset-1",
                json!({
                    "name": "Harbor Tower",
                    "description": "Waterfront office building",
                    "assetType": "real-estate",
                    "totalValue": 12_500_000.0,
                }),
            )
            .await
            .unwrap();
        tokens
            .mint_tokens(
                "admin",
                &mut events,
                "tok-1",
                "asset-1",
                json!({
                    "symbol": "HTWR",
                    "name": "Harbor Tower Shares",
                    "totalSupply": 1000.0,
                    "pricePerToken": 50.0,
                }),
            )
            .await
            .unwrap();

        for (id, amount) in [("alice", 600.0), ("bob", 400.0)] {
            investors
                .register_investor("admin", &mut events, id, json!({ "name": id }))
                .await
                .unwrap();
            investors
                .record_purchase(
                    "admin",
                    &mut events,
                    &format!("pur-{id}"),
                    id,
                    "tok-1",
                    amount,
                    amount * 50.0,
                )
                .await
                .unwrap();
        }

        Fixture { payouts }
    }

    async fn record_100(fixture: &Fixture) -> Payout {
        let mut events = EventSink::new();
        fixture
            .payouts
            .record_payout(
                "admin", &mut events, "pay-1", "asset-1", "tok-1", 100.0, "dividend", None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_fixes_per_token_amount() {
        let fixture = setup_sold_out().await;
        let payout = record_100(&fixture).await;

        assert_eq!(payout.per_token_amount, 0.1);
        assert_eq!(payout.circulating_supply_at_payout, 1000.0);
        assert_eq!(payout.status, PayoutStatus::Pending);
        assert_eq!(payout.distributed_amount, 0.0);
        assert_eq!(payout.remaining_amount, 100.0);

        let mut events = EventSink::new();
        let duplicate = fixture
            .payouts
            .record_payout(
                "admin", &mut events, "pay-1", "asset-1", "tok-1", 50.0, "dividend", None,
            )
            .await;
        assert!(matches!(duplicate, Err(LedgerError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_record_with_zero_circulation() {
        let store = Arc::new(MemoryStore::new());
        let registry = AssetRegistry::new(store.clone() as Arc<dyn StateStore>);
        let tokens = TokenLedger::new(store.clone() as Arc<dyn StateStore>);
        let payouts = PayoutEngine::new(store.clone() as Arc<dyn StateStore>);

        let mut events = EventSink::new();
        registry
            .create_asset(
                "admin",
                &mut events,
                "asset-1",
                json!({
                    "name": "Harbor Tower",
                    "description": "x",
                    "assetType": "real-estate",
                    "totalValue": 1.0,
                }),
            )
            .await
            .unwrap();
        tokens
            .mint_tokens(
                "admin",
                &mut events,
                "tok-1",
                "asset-1",
                json!({
                    "symbol": "HTWR",
                    "name": "Harbor Tower Shares",
                    "totalSupply": 1000.0,
                    "pricePerToken": 50.0,
                }),
            )
            .await
            .unwrap();

        let payout = payouts
            .record_payout(
                "admin", &mut events, "pay-1", "asset-1", "tok-1", 100.0, "dividend", None,
            )
            .await
            .unwrap();
        assert_eq!(payout.per_token_amount, 0.0);

        let report = payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();
        assert!(report.distributions.is_empty());
        assert_eq!(report.payout.distributed_amount, 0.0);
        assert_eq!(report.payout.remaining_amount, 100.0);
        assert_eq!(report.payout.status, PayoutStatus::Completed);
    }

    #[tokio::test]
    async fn test_distribute_proportionally() {
        let fixture = setup_sold_out().await;
        record_100(&fixture).await;
        let mut events = EventSink::new();

        let report = fixture
            .payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();

        assert_eq!(report.distributions.len(), 2);
        let alice = report
            .distributions
            .iter()
            .find(|d| d.investor_id == "alice")
            .unwrap();
        let bob = report
            .distributions
            .iter()
            .find(|d| d.investor_id == "bob")
            .unwrap();
        assert_eq!(alice.amount, 60.0);
        assert_eq!(alice.token_balance, 600.0);
        assert_eq!(alice.id, "dist_pay-1_alice");
        assert_eq!(bob.amount, 40.0);

        assert_eq!(report.payout.distributed_amount, 100.0);
        assert_eq!(report.payout.remaining_amount, 0.0);
        assert_eq!(report.payout.number_of_recipients, Some(2));
        assert_eq!(report.payout.status, PayoutStatus::Completed);
        assert_eq!(events.events()[0].name, "PayoutDistributed");
    }

    #[tokio::test]
    async fn test_distribute_is_terminal() {
        let fixture = setup_sold_out().await;
        record_100(&fixture).await;
        let mut events = EventSink::new();

        fixture
            .payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();
        let again = fixture
            .payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await;
        assert!(matches!(
            again,
            Err(LedgerError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_payout_cannot_distribute() {
        let fixture = setup_sold_out().await;
        record_100(&fixture).await;
        let mut events = EventSink::new();

        fixture
            .payouts
            .cancel_payout("admin", &mut events, "pay-1", "funding fell through")
            .await
            .unwrap();
        let result = fixture
            .payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::InvalidStateTransition(_))
        ));

        let payout = fixture.payouts.get_payout("pay-1").await.unwrap();
        assert_eq!(payout.status, PayoutStatus::Cancelled);
        assert_eq!(
            payout.cancellation_reason.as_deref(),
            Some("funding fell through")
        );
    }

    #[tokio::test]
    async fn test_cannot_cancel_completed_payout() {
        let fixture = setup_sold_out().await;
        record_100(&fixture).await;
        let mut events = EventSink::new();

        fixture
            .payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();
        let result = fixture
            .payouts
            .cancel_payout("admin", &mut events, "pay-1", "too late")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_between_record_and_distribute() {
        let store = Arc::new(MemoryStore::new());
        let registry = AssetRegistry::new(store.clone() as Arc<dyn StateStore>);
        let tokens = TokenLedger::new(store.clone() as Arc<dyn StateStore>);
        let investors = InvestorLedger::new(store.clone() as Arc<dyn StateStore>);
        let payouts = PayoutEngine::new(store.clone() as Arc<dyn StateStore>);

        let mut events = EventSink::new();
        registry
            .create_asset(
                "admin",
                &mut events,
                "asset-1",
                json!({
                    "name": "Harbor Tower",
                    "description": "x",
                    "assetType": "real-estate",
                    "totalValue": 1.0,
                }),
            )
            .await
            .unwrap();
        tokens
            .mint_tokens(
                "admin",
                &mut events,
                "tok-1",
                "asset-1",
                json!({
                    "symbol": "HTWR",
                    "name": "Harbor Tower Shares",
                    "totalSupply": 1000.0,
                    "pricePerToken": 50.0,
                }),
            )
            .await
            .unwrap();

        // All three are known purchasers. Carol sells her whole position
        // back to Alice before the payout is recorded, leaving the pool
        // priced against {alice: 600, bob: 400}.
        for (id, amount) in [("alice", 500.0), ("bob", 400.0), ("carol", 100.0)] {
            investors
                .register_investor("admin", &mut events, id, json!({ "name": id }))
                .await
                .unwrap();
            investors
                .record_purchase(
                    "admin",
                    &mut events,
                    &format!("pur-{id}"),
                    id,
                    "tok-1",
                    amount,
                    amount * 50.0,
                )
                .await
                .unwrap();
        }
        tokens
            .transfer_tokens("carol", &mut events, "tok-1", "carol", "alice", 100.0)
            .await
            .unwrap();

        payouts
            .record_payout(
                "admin", &mut events, "pay-1", "asset-1", "tok-1", 100.0, "dividend", None,
            )
            .await
            .unwrap();

        // Shares shift after recording: alice hands carol 200 tokens, so
        // distribution pays balances of {alice: 400, bob: 400, carol: 200}.
        tokens
            .transfer_tokens("alice", &mut events, "tok-1", "alice", "carol", 200.0)
            .await
            .unwrap();

        let report = payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();
        let amount_for = |id: &str| {
            report
                .distributions
                .iter()
                .find(|d| d.investor_id == id)
                .map(|d| d.amount)
        };
        assert_eq!(amount_for("alice"), Some(40.0));
        assert_eq!(amount_for("bob"), Some(40.0));
        assert_eq!(amount_for("carol"), Some(20.0));

        // A transfer only redistributes balance, so the pool still pays
        // out exactly even though per-holder shares moved.
        assert_eq!(report.payout.distributed_amount, 100.0);
        assert_eq!(report.payout.remaining_amount, 0.0);
        assert_eq!(report.payout.number_of_recipients, Some(3));
    }

    #[tokio::test]
    async fn test_burn_between_record_and_distribute_leaves_remainder() {
        let store = Arc::new(MemoryStore::new());
        let registry = AssetRegistry::new(store.clone() as Arc<dyn StateStore>);
        let tokens = TokenLedger::new(store.clone() as Arc<dyn StateStore>);
        let investors = InvestorLedger::new(store.clone() as Arc<dyn StateStore>);
        let payouts = PayoutEngine::new(store.clone() as Arc<dyn StateStore>);

        let mut events = EventSink::new();
        registry
            .create_asset(
                "admin",
                &mut events,
                "asset-1",
                json!({
                    "name": "Harbor Tower",
                    "description": "x",
                    "assetType": "real-estate",
                    "totalValue": 1.0,
                }),
            )
            .await
            .unwrap();
        tokens
            .mint_tokens(
                "admin",
                &mut events,
                "tok-1",
                "asset-1",
                json!({
                    "symbol": "HTWR",
                    "name": "Harbor Tower Shares",
                    "totalSupply": 1000.0,
                    "pricePerToken": 50.0,
                }),
            )
            .await
            .unwrap();
        investors
            .register_investor("admin", &mut events, "alice", json!({}))
            .await
            .unwrap();
        investors
            .record_purchase("admin", &mut events, "pur-1", "alice", "tok-1", 500.0, 25_000.0)
            .await
            .unwrap();

        payouts
            .record_payout(
                "admin", &mut events, "pay-1", "asset-1", "tok-1", 100.0, "dividend", None,
            )
            .await
            .unwrap();

        // Alice's holding shrinks after the pool is priced. perTokenAmount
        // stays fixed at 0.2, so 400 * 0.2 = 80 goes out and 20 stays.
        crate::token::write_balance(store.as_ref(), "tok-1", "alice", 400.0)
            .await
            .unwrap();

        let report = payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();
        assert_eq!(report.payout.distributed_amount, 80.0);
        assert_eq!(report.payout.remaining_amount, 20.0);
    }

    #[tokio::test]
    async fn test_asset_payout_aggregates() {
        let fixture = setup_sold_out().await;
        let mut events = EventSink::new();

        for (id, amount) in [("pay-1", 100.0), ("pay-2", 50.0)] {
            fixture
                .payouts
                .record_payout(
                    "admin", &mut events, id, "asset-1", "tok-1", amount, "rental", None,
                )
                .await
                .unwrap();
        }
        fixture
            .payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();

        let asset_payouts = fixture.payouts.get_asset_payouts("asset-1").await.unwrap();
        assert_eq!(asset_payouts.statistics.total_payouts, 2);
        assert_eq!(asset_payouts.statistics.total_distributed, 100.0);
        assert!(asset_payouts.statistics.last_payout_date.is_some());

        let stats = fixture
            .payouts
            .get_token_payout_statistics("tok-1")
            .await
            .unwrap();
        assert_eq!(stats.total_payouts, 2);
        assert_eq!(stats.completed_payouts, 1);
        assert_eq!(stats.pending_payouts, 1);
        assert_eq!(stats.cancelled_payouts, 0);
        assert_eq!(stats.average_payout_amount, 75.0);
    }

    #[tokio::test]
    async fn test_investor_payout_history_joins_details() {
        let fixture = setup_sold_out().await;
        record_100(&fixture).await;
        let mut events = EventSink::new();

        fixture
            .payouts
            .distribute_payout("admin", &mut events, "pay-1")
            .await
            .unwrap();

        let history = fixture
            .payouts
            .get_investor_payouts("alice")
            .await
            .unwrap();
        assert_eq!(history.statistics.total_distributions, 1);
        assert_eq!(history.statistics.total_received, 60.0);
        let details = history.distributions[0].payout_details.as_ref().unwrap();
        assert_eq!(details.payout_type, "dividend");
        assert_eq!(details.asset_id, "asset-1");

        let distributions = fixture
            .payouts
            .get_payout_distributions("pay-1")
            .await
            .unwrap();
        assert_eq!(distributions.len(), 2);
        assert_eq!(distributions[0].investor_id, "alice");
    }
}
