// src/token.rs
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::asset::{Asset, as_object};
use crate::store::{Selector, StateStore, composite_key};
use crate::{EventSink, LedgerError};

pub(crate) const TOKEN_DOC_TYPE: &str = "token";
pub(crate) const TRANSFER_DOC_TYPE: &str = "transfer";
const BALANCE_NAMESPACE: &str = "balance";

/// One price change, appended to the token's price history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub old_price: f64,
    pub new_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// A token class tied 1:1 to an asset.
///
/// Supply invariant, enforced by every mutation:
/// `total_supply == circulating_supply + burned_supply + available_supply`.
/// `total_supply` is fixed at mint and never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub doc_type: String,
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub total_supply: f64,
    pub circulating_supply: f64,
    pub burned_supply: f64,
    pub available_supply: f64,
    pub price_per_token: f64,
    #[serde(default)]
    pub price_history: Vec<PricePoint>,
    pub total_raised: f64,
    pub investor_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Immutable log entry for one transfer. Never mutated after write. The
/// id carries a per-token sequence number, so every replica derives the
/// same key and no two transfers share one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub doc_type: String,
    pub token_id: String,
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Derived view over a token's supply and market figures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatistics {
    pub token_id: String,
    pub symbol: String,
    pub name: String,
    pub total_supply: f64,
    pub circulating_supply: f64,
    pub available_supply: f64,
    pub burned_supply: f64,
    pub current_price: f64,
    pub market_cap: f64,
    pub total_raised: f64,
    pub investor_count: u64,
    /// Circulating share of total supply, as a percentage.
    pub utilization_rate: f64,
}

/// Mints, burns, transfers, and prices tokens. Depends on [`AssetRegistry`]
/// documents: a token can only be minted against an existing asset, and the
/// asset is back-linked with the token id in the same invocation.
///
/// [`AssetRegistry`]: crate::AssetRegistry
pub struct TokenLedger {
    store: Arc<dyn StateStore>,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Mint the token class for an asset. The full supply starts as
    /// available; nothing circulates until purchased.
    pub async fn mint_tokens(
        &self,
        caller: &str,
        events: &mut EventSink,
        token_id: &str,
        asset_id: &str,
        data: Value,
    ) -> Result<Token, LedgerError> {
        if token_id.is_empty() || asset_id.is_empty() {
            return Err(LedgerError::Validation(
                "token id and asset id are required".to_string(),
            ));
        }
        if self.store.get(token_id).await?.is_some() {
            return Err(LedgerError::AlreadyExists(format!("Token {}", token_id)));
        }

        let asset_raw = self
            .store
            .get(asset_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Asset {}", asset_id)))?;
        let mut asset: Asset = serde_json::from_value(asset_raw)?;

        // Re-binding the single-field back-link would orphan the first
        // token class, so a second mint against the same asset is rejected.
        if asset.token_id.is_some() {
            return Err(LedgerError::AlreadyExists(format!(
                "Token binding for asset {}",
                asset_id
            )));
        }

        let mut fields = as_object(data, "token data")?;
        for field in ["symbol", "name", "totalSupply", "pricePerToken"] {
            match fields.get(field) {
                None | Some(Value::Null) => {
                    return Err(LedgerError::Validation(format!(
                        "required field {} is missing",
                        field
                    )));
                }
                Some(_) => {}
            }
        }

        let now = Utc::now();
        let total_supply = fields.get("totalSupply").cloned().unwrap_or(json!(0.0));
        fields.insert("id".to_string(), json!(token_id));
        fields.insert("assetId".to_string(), json!(asset_id));
        fields.insert("docType".to_string(), json!(TOKEN_DOC_TYPE));
        fields.insert("circulatingSupply".to_string(), json!(0.0));
        fields.insert("burnedSupply".to_string(), json!(0.0));
        fields.insert("availableSupply".to_string(), total_supply);
        fields.insert("totalRaised".to_string(), json!(0.0));
        fields.insert("investorCount".to_string(), json!(0));
        fields.insert("createdAt".to_string(), json!(now));
        fields.insert("updatedAt".to_string(), json!(now));
        fields.insert("createdBy".to_string(), json!(caller));

        let token: Token = serde_json::from_value(Value::Object(fields))
            .map_err(|err| LedgerError::Validation(err.to_string()))?;
        if !(token.total_supply.is_finite() && token.total_supply > 0.0) {
            return Err(LedgerError::Validation("invalid total supply".to_string()));
        }
        if !(token.price_per_token.is_finite() && token.price_per_token > 0.0) {
            return Err(LedgerError::Validation("invalid token price".to_string()));
        }

        self.store
            .put(token_id, serde_json::to_value(&token)?)
            .await?;

        asset.token_id = Some(token_id.to_string());
        asset.updated_at = now;
        self.store
            .put(asset_id, serde_json::to_value(&asset)?)
            .await?;

        events.emit(
            "TokensMinted",
            json!({
                "tokenId": token_id,
                "assetId": asset_id,
                "totalSupply": token.total_supply,
                "action": "minted",
                "timestamp": token.created_at,
            }),
        );
        counter!("meros.token.mutations", "op" => "mint").increment(1);
        debug!(token_id, asset_id, total_supply = token.total_supply, "tokens minted");

        Ok(token)
    }

    /// Move `amount` from circulating to burned. Available supply is
    /// recomputed from the other three fields rather than decremented
    /// independently, so the supply invariant cannot drift.
    pub async fn burn_tokens(
        &self,
        _caller: &str,
        events: &mut EventSink,
        token_id: &str,
        amount: f64,
    ) -> Result<Token, LedgerError> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(LedgerError::Validation("invalid burn amount".to_string()));
        }

        let mut token = self.get_token(token_id).await?;
        if amount > token.circulating_supply {
            return Err(LedgerError::InsufficientSupply);
        }

        token.circulating_supply -= amount;
        token.burned_supply += amount;
        token.available_supply =
            token.total_supply - token.circulating_supply - token.burned_supply;
        token.updated_at = Utc::now();

        self.store
            .put(token_id, serde_json::to_value(&token)?)
            .await?;

        events.emit(
            "TokensBurned",
            json!({
                "tokenId": token_id,
                "amount": amount,
                "timestamp": token.updated_at,
            }),
        );
        counter!("meros.token.mutations", "op" => "burn").increment(1);

        Ok(token)
    }

    /// Move `amount` between two investors' balance entries and append a
    /// transfer record. Both balance writes land in the same invocation,
    /// so no intermediate state is ever observable.
    pub async fn transfer_tokens(
        &self,
        _caller: &str,
        events: &mut EventSink,
        token_id: &str,
        from: &str,
        to: &str,
        amount: f64,
    ) -> Result<TransferRecord, LedgerError> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(LedgerError::Validation(
                "invalid transfer amount".to_string(),
            ));
        }
        if from == to {
            return Err(LedgerError::Validation(
                "cannot transfer to same investor".to_string(),
            ));
        }
        if self.store.get(token_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("Token {}", token_id)));
        }

        let from_balance = read_balance(self.store.as_ref(), token_id, from).await?;
        if from_balance < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        let to_balance = read_balance(self.store.as_ref(), token_id, to).await?;

        write_balance(self.store.as_ref(), token_id, from, from_balance - amount).await?;
        write_balance(self.store.as_ref(), token_id, to, to_balance + amount).await?;

        // The log key derives from a per-token sequence read within the
        // invocation, so it is identical on every replica and two
        // transfers can never collide on one key.
        let sequence = self
            .store
            .query(&Selector::doc_type(TRANSFER_DOC_TYPE).field("tokenId", token_id))
            .await?
            .len() as u64
            + 1;

        let record = TransferRecord {
            id: format!("transfer_{}_{}", token_id, sequence),
            doc_type: TRANSFER_DOC_TYPE.to_string(),
            token_id: token_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            sequence,
            timestamp: Utc::now(),
        };
        self.store
            .put(&record.id, serde_json::to_value(&record)?)
            .await?;

        events.emit("TokensTransferred", serde_json::to_value(&record)?);
        counter!("meros.token.mutations", "op" => "transfer").increment(1);
        histogram!("meros.token.transfer_amount", "token" => token_id.to_string()).record(amount);

        Ok(record)
    }

    /// Set a new price and append the change to the price history.
    pub async fn update_token_price(
        &self,
        _caller: &str,
        events: &mut EventSink,
        token_id: &str,
        new_price: f64,
    ) -> Result<Token, LedgerError> {
        if !(new_price.is_finite() && new_price > 0.0) {
            return Err(LedgerError::Validation("invalid price".to_string()));
        }

        let mut token = self.get_token(token_id).await?;
        let old_price = token.price_per_token;
        let now = Utc::now();

        token.price_per_token = new_price;
        token.updated_at = now;
        token.price_history.push(PricePoint {
            old_price,
            new_price,
            timestamp: now,
        });

        self.store
            .put(token_id, serde_json::to_value(&token)?)
            .await?;

        events.emit(
            "TokenPriceUpdated",
            json!({
                "tokenId": token_id,
                "oldPrice": old_price,
                "newPrice": new_price,
                "timestamp": now,
            }),
        );
        counter!("meros.token.mutations", "op" => "price").increment(1);

        Ok(token)
    }

    // ==================== Queries ====================

    pub async fn get_token(&self, token_id: &str) -> Result<Token, LedgerError> {
        let raw = self
            .store
            .get(token_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Token {}", token_id)))?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn token_exists(&self, token_id: &str) -> Result<bool, LedgerError> {
        Ok(self.store.get(token_id).await?.is_some())
    }

    pub async fn get_all_tokens(&self) -> Result<Vec<Token>, LedgerError> {
        self.query_tokens(&Selector::doc_type(TOKEN_DOC_TYPE)).await
    }

    pub async fn get_tokens_by_asset(&self, asset_id: &str) -> Result<Vec<Token>, LedgerError> {
        let selector = Selector::doc_type(TOKEN_DOC_TYPE).field("assetId", asset_id);
        self.query_tokens(&selector).await
    }

    /// Current balance for one `(token, investor)` pair. Absent entry = 0.
    pub async fn get_balance(
        &self,
        token_id: &str,
        investor_id: &str,
    ) -> Result<f64, LedgerError> {
        read_balance(self.store.as_ref(), token_id, investor_id).await
    }

    pub async fn get_token_statistics(
        &self,
        token_id: &str,
    ) -> Result<TokenStatistics, LedgerError> {
        let token = self.get_token(token_id).await?;
        let utilization_rate = if token.total_supply > 0.0 {
            token.circulating_supply / token.total_supply * 100.0
        } else {
            0.0
        };

        Ok(TokenStatistics {
            token_id: token.id,
            symbol: token.symbol,
            name: token.name,
            total_supply: token.total_supply,
            circulating_supply: token.circulating_supply,
            available_supply: token.available_supply,
            burned_supply: token.burned_supply,
            current_price: token.price_per_token,
            market_cap: token.circulating_supply * token.price_per_token,
            total_raised: token.total_raised,
            investor_count: token.investor_count,
            utilization_rate,
        })
    }

    /// Transfer records for a token, newest first.
    pub async fn get_transfer_history(
        &self,
        token_id: &str,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        let selector = Selector::doc_type(TRANSFER_DOC_TYPE).field("tokenId", token_id);
        let mut records: Vec<TransferRecord> = self
            .store
            .query(&selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect::<Result<_, _>>()?;
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(records)
    }

    async fn query_tokens(&self, selector: &Selector) -> Result<Vec<Token>, LedgerError> {
        self.store
            .query(selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect()
    }
}

/// Deterministic key for a `(token, investor)` balance entry.
pub(crate) fn balance_key(token_id: &str, investor_id: &str) -> String {
    composite_key(BALANCE_NAMESPACE, &[token_id, investor_id])
}

/// Balance entries are implicit: an absent key reads as zero.
pub(crate) async fn read_balance(
    store: &dyn StateStore,
    token_id: &str,
    investor_id: &str,
) -> Result<f64, LedgerError> {
    match store.get(&balance_key(token_id, investor_id)).await? {
        Some(value) => value
            .as_f64()
            .ok_or_else(|| LedgerError::Storage("balance entry is not numeric".to_string())),
        None => Ok(0.0),
    }
}

pub(crate) async fn write_balance(
    store: &dyn StateStore,
    token_id: &str,
    investor_id: &str,
    amount: f64,
) -> Result<(), LedgerError> {
    store
        .put(&balance_key(token_id, investor_id), json!(amount))
        .await
}
