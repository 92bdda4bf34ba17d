// src/investor.rs
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::asset::as_object;
use crate::store::{Selector, StateStore};
use crate::token::{Token, read_balance, write_balance};
use crate::{EventSink, LedgerError};

pub(crate) const INVESTOR_DOC_TYPE: &str = "investor";
pub(crate) const PURCHASE_DOC_TYPE: &str = "purchase";

/// An investor record. Descriptive fields (name, email, ...) ride in
/// `extra` and survive merges, the same way asset documents handle them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investor {
    pub id: String,
    pub doc_type: String,
    pub kyc_verified: bool,
    pub status: String,
    pub total_invested: f64,
    pub active_investments: u64,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyc_verified_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One completed purchase of tokens from the available supply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: String,
    pub doc_type: String,
    pub investor_id: String,
    pub token_id: String,
    pub asset_id: String,
    pub amount: f64,
    pub price_per_token: f64,
    pub total_price: f64,
    pub purchase_date: DateTime<Utc>,
    pub status: String,
}

/// Balance plus its current market value for one `(investor, token)` pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestorBalance {
    pub investor_id: String,
    pub token_id: String,
    pub balance: f64,
    pub current_value: f64,
    pub current_price: f64,
}

/// One token position inside a portfolio, with cost basis recomputed from
/// the investor's purchase history for that token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioHolding {
    pub token_id: String,
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub balance: f64,
    pub average_buy_price: f64,
    pub current_price: f64,
    pub invested: f64,
    pub current_value: f64,
    pub profit_loss: f64,
    pub profit_loss_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSummary {
    pub total_invested: f64,
    pub current_value: f64,
    pub total_profit_loss: f64,
    pub total_profit_loss_percentage: f64,
    pub number_of_holdings: usize,
}

/// All of one investor's current holdings, aggregated by re-deriving the
/// touched token set from persisted purchase records and reading each
/// live balance — never from a trusted running total.
///
/// Known limitation, inherited deliberately: cost basis sums purchase
/// prices only, so tokens received via transfer raise the balance without
/// raising `invested`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub investor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investor: Option<Investor>,
    pub holdings: Vec<PortfolioHolding>,
    pub summary: PortfolioSummary,
}

/// One current holder of a token, as discovered for holder enumeration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHolder {
    pub investor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub balance: f64,
}

const INVESTOR_IMMUTABLE_FIELDS: [&str; 3] = ["id", "docType", "registeredAt"];

/// Registers investors, records purchases, and aggregates portfolios.
/// Depends on [`TokenLedger`] documents for supply and price fields.
///
/// [`TokenLedger`]: crate::TokenLedger
pub struct InvestorLedger {
    store: Arc<dyn StateStore>,
}

impl InvestorLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn register_investor(
        &self,
        _caller: &str,
        events: &mut EventSink,
        investor_id: &str,
        data: Value,
    ) -> Result<Investor, LedgerError> {
        if investor_id.is_empty() {
            return Err(LedgerError::Validation(
                "investor id is required".to_string(),
            ));
        }
        if self.store.get(investor_id).await?.is_some() {
            return Err(LedgerError::AlreadyExists(format!(
                "Investor {}",
                investor_id
            )));
        }

        let mut fields = as_object(data, "investor data")?;
        let now = Utc::now();
        fields.insert("id".to_string(), json!(investor_id));
        fields.insert("docType".to_string(), json!(INVESTOR_DOC_TYPE));
        fields.insert("registeredAt".to_string(), json!(now));
        fields.insert("updatedAt".to_string(), json!(now));
        fields.insert("totalInvested".to_string(), json!(0.0));
        fields.insert("activeInvestments".to_string(), json!(0));
        fields
            .entry("kycVerified".to_string())
            .or_insert(json!(false));
        fields.entry("status".to_string()).or_insert(json!("active"));

        let investor: Investor = serde_json::from_value(Value::Object(fields))
            .map_err(|err| LedgerError::Validation(err.to_string()))?;

        self.store
            .put(investor_id, serde_json::to_value(&investor)?)
            .await?;

        events.emit(
            "InvestorRegistered",
            json!({
                "investorId": investor_id,
                "timestamp": investor.registered_at,
            }),
        );
        counter!("meros.investor.mutations", "op" => "register").increment(1);

        Ok(investor)
    }

    pub async fn update_investor(
        &self,
        _caller: &str,
        events: &mut EventSink,
        investor_id: &str,
        updates: Value,
    ) -> Result<Investor, LedgerError> {
        let stored = self.require_raw(investor_id).await?;
        let mut fields = as_object(stored, "stored investor")
            .map_err(|err| LedgerError::Storage(err.to_string()))?;
        let updates = as_object(updates, "update data")?;

        for (name, value) in updates {
            if !INVESTOR_IMMUTABLE_FIELDS.contains(&name.as_str()) {
                fields.insert(name, value);
            }
        }
        fields.insert("updatedAt".to_string(), json!(Utc::now()));

        let investor: Investor = serde_json::from_value(Value::Object(fields))
            .map_err(|err| LedgerError::Validation(err.to_string()))?;

        self.store
            .put(investor_id, serde_json::to_value(&investor)?)
            .await?;

        events.emit(
            "InvestorUpdated",
            json!({
                "investorId": investor_id,
                "timestamp": investor.updated_at,
            }),
        );
        counter!("meros.investor.mutations", "op" => "update").increment(1);

        Ok(investor)
    }

    pub async fn update_kyc_status(
        &self,
        _caller: &str,
        events: &mut EventSink,
        investor_id: &str,
        verified: bool,
    ) -> Result<Investor, LedgerError> {
        let mut investor = self.get_investor(investor_id).await?;

        let now = Utc::now();
        investor.kyc_verified = verified;
        investor.kyc_verified_at = Some(now);
        investor.updated_at = now;

        self.store
            .put(investor_id, serde_json::to_value(&investor)?)
            .await?;

        events.emit(
            "KYCStatusUpdated",
            json!({
                "investorId": investor_id,
                "verified": verified,
                "timestamp": now,
            }),
        );
        counter!("meros.investor.mutations", "op" => "kyc").increment(1);

        Ok(investor)
    }

    /// Record a purchase from the available supply. Five writes land in
    /// one invocation: the purchase record, the balance entry, the token
    /// supply fields, and the investor counters. First-time holders (zero
    /// pre-purchase balance) bump `investor_count` and
    /// `active_investments` by exactly one.
    pub async fn record_purchase(
        &self,
        _caller: &str,
        events: &mut EventSink,
        purchase_id: &str,
        investor_id: &str,
        token_id: &str,
        amount: f64,
        total_price: f64,
    ) -> Result<Purchase, LedgerError> {
        if !(amount.is_finite() && amount > 0.0 && total_price.is_finite() && total_price > 0.0) {
            return Err(LedgerError::Validation(
                "invalid purchase amount or price".to_string(),
            ));
        }
        if self.store.get(investor_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("Investor {}", investor_id)));
        }

        let token_raw = self
            .store
            .get(token_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Token {}", token_id)))?;
        let mut token: Token = serde_json::from_value(token_raw)?;

        if amount > token.available_supply {
            return Err(LedgerError::InsufficientSupply);
        }

        let pre_balance = read_balance(self.store.as_ref(), token_id, investor_id).await?;
        let now = Utc::now();

        let purchase = Purchase {
            id: purchase_id.to_string(),
            doc_type: PURCHASE_DOC_TYPE.to_string(),
            investor_id: investor_id.to_string(),
            token_id: token_id.to_string(),
            asset_id: token.asset_id.clone(),
            amount,
            price_per_token: total_price / amount,
            total_price,
            purchase_date: now,
            status: "completed".to_string(),
        };
        self.store
            .put(purchase_id, serde_json::to_value(&purchase)?)
            .await?;

        write_balance(self.store.as_ref(), token_id, investor_id, pre_balance + amount).await?;

        token.circulating_supply += amount;
        token.available_supply -= amount;
        token.total_raised += total_price;
        if pre_balance == 0.0 {
            token.investor_count += 1;
        }
        token.updated_at = now;
        self.store
            .put(token_id, serde_json::to_value(&token)?)
            .await?;

        let mut investor = self.get_investor(investor_id).await?;
        investor.total_invested += total_price;
        if pre_balance == 0.0 {
            investor.active_investments += 1;
        }
        investor.updated_at = now;
        self.store
            .put(investor_id, serde_json::to_value(&investor)?)
            .await?;

        events.emit(
            "PurchaseRecorded",
            json!({
                "purchaseId": purchase_id,
                "investorId": investor_id,
                "tokenId": token_id,
                "amount": amount,
                "totalPrice": total_price,
                "timestamp": purchase.purchase_date,
            }),
        );
        counter!("meros.investor.mutations", "op" => "purchase").increment(1);
        histogram!("meros.investor.purchase_amount", "token" => token_id.to_string())
            .record(total_price);
        debug!(purchase_id, investor_id, token_id, amount, "purchase recorded");

        Ok(purchase)
    }

    // ==================== Queries ====================

    pub async fn get_investor(&self, investor_id: &str) -> Result<Investor, LedgerError> {
        let raw = self.require_raw(investor_id).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn investor_exists(&self, investor_id: &str) -> Result<bool, LedgerError> {
        Ok(self.store.get(investor_id).await?.is_some())
    }

    pub async fn get_all_investors(&self) -> Result<Vec<Investor>, LedgerError> {
        self.store
            .query(&Selector::doc_type(INVESTOR_DOC_TYPE))
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect()
    }

    /// Balance plus derived current value. A missing token prices the
    /// position at zero rather than failing the whole query.
    pub async fn get_investor_balance(
        &self,
        investor_id: &str,
        token_id: &str,
    ) -> Result<InvestorBalance, LedgerError> {
        let balance = read_balance(self.store.as_ref(), token_id, investor_id).await?;
        let current_price = match self.store.get(token_id).await? {
            Some(raw) => serde_json::from_value::<Token>(raw)?.price_per_token,
            None => 0.0,
        };

        Ok(InvestorBalance {
            investor_id: investor_id.to_string(),
            token_id: token_id.to_string(),
            balance,
            current_value: balance * current_price,
            current_price,
        })
    }

    /// Rebuild the investor's portfolio from persisted records: scan the
    /// purchase history for touched tokens, keep the ones with a currently
    /// nonzero balance, and recompute invested/current values per token.
    pub async fn get_investor_portfolio(
        &self,
        investor_id: &str,
    ) -> Result<Portfolio, LedgerError> {
        let selector =
            Selector::doc_type(PURCHASE_DOC_TYPE).field("investorId", investor_id);
        let purchases: Vec<Purchase> = self
            .store
            .query(&selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect::<Result<_, _>>()?;

        let token_ids: BTreeSet<&str> =
            purchases.iter().map(|p| p.token_id.as_str()).collect();

        let mut holdings = Vec::new();
        let mut total_value = 0.0;
        let mut total_invested = 0.0;

        for token_id in token_ids {
            let balance = read_balance(self.store.as_ref(), token_id, investor_id).await?;
            if balance <= 0.0 {
                continue;
            }

            let token_raw = self
                .store
                .get(token_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("Token {}", token_id)))?;
            let token: Token = serde_json::from_value(token_raw)?;

            let invested: f64 = purchases
                .iter()
                .filter(|p| p.token_id == token_id)
                .map(|p| p.total_price)
                .sum();
            let current_value = balance * token.price_per_token;

            holdings.push(PortfolioHolding {
                token_id: token_id.to_string(),
                asset_id: token.asset_id,
                symbol: token.symbol,
                name: token.name,
                balance,
                average_buy_price: invested / balance,
                current_price: token.price_per_token,
                invested,
                current_value,
                profit_loss: current_value - invested,
                profit_loss_percentage: (current_value - invested) / invested * 100.0,
            });

            total_value += current_value;
            total_invested += invested;
        }

        let investor = match self.store.get(investor_id).await? {
            Some(raw) => Some(serde_json::from_value(raw)?),
            None => None,
        };

        Ok(Portfolio {
            investor_id: investor_id.to_string(),
            investor,
            summary: PortfolioSummary {
                total_invested,
                current_value: total_value,
                total_profit_loss: total_value - total_invested,
                total_profit_loss_percentage: if total_invested > 0.0 {
                    (total_value - total_invested) / total_invested * 100.0
                } else {
                    0.0
                },
                number_of_holdings: holdings.len(),
            },
            holdings,
        })
    }

    /// Current holders of a token. Purchase history only discovers the
    /// candidate investor ids; the live balance entry decides membership.
    pub async fn get_token_investors(
        &self,
        token_id: &str,
    ) -> Result<Vec<TokenHolder>, LedgerError> {
        let mut holders = Vec::new();
        for investor_id in holder_candidates(self.store.as_ref(), token_id).await? {
            let balance = read_balance(self.store.as_ref(), token_id, &investor_id).await?;
            if balance <= 0.0 {
                continue;
            }

            let (name, email) = match self.store.get(&investor_id).await? {
                Some(raw) => {
                    let investor: Investor = serde_json::from_value(raw)?;
                    (
                        investor
                            .extra
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        investor
                            .extra
                            .get("email")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    )
                }
                None => (None, None),
            };

            holders.push(TokenHolder {
                investor_id,
                name,
                email,
                balance,
            });
        }
        Ok(holders)
    }

    /// Purchases by an investor, newest first.
    pub async fn get_investor_purchase_history(
        &self,
        investor_id: &str,
    ) -> Result<Vec<Purchase>, LedgerError> {
        let selector =
            Selector::doc_type(PURCHASE_DOC_TYPE).field("investorId", investor_id);
        let mut purchases: Vec<Purchase> = self
            .store
            .query(&selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect::<Result<_, _>>()?;
        purchases.sort_by(|a, b| b.purchase_date.cmp(&a.purchase_date).then(b.id.cmp(&a.id)));
        Ok(purchases)
    }

    async fn require_raw(&self, investor_id: &str) -> Result<Value, LedgerError> {
        self.store
            .get(investor_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Investor {}", investor_id)))
    }
}

/// Candidate holders of a token: every investor id that ever appears in a
/// purchase record for it, in deterministic order. No native index exists
/// over composite balance keys, so purchase history stands in for one.
/// Shared by portfolio enumeration and payout distribution.
pub(crate) async fn holder_candidates(
    store: &dyn StateStore,
    token_id: &str,
) -> Result<BTreeSet<String>, LedgerError> {
    let selector = Selector::doc_type(PURCHASE_DOC_TYPE).field("tokenId", token_id);
    let purchases = store.query(&selector).await?;

    let mut candidates = BTreeSet::new();
    for doc in purchases {
        let purchase: Purchase = serde_json::from_value(doc)?;
        candidates.insert(purchase.investor_id);
    }
    Ok(candidates)
}
