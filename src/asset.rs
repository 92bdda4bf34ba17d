// src/asset.rs
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::store::{DocVersion, Selector, StateStore};
use crate::{EventSink, LedgerError};

pub(crate) const ASSET_DOC_TYPE: &str = "asset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Draft,
    Published,
    Archived,
}

/// A physical-asset record. Callers may attach arbitrary descriptive
/// fields beyond the typed ones; they ride in `extra` and survive merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub doc_type: String,
    pub name: String,
    pub description: String,
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub total_value: f64,
    pub status: AssetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_by: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Fields the merge in `update_asset` must never touch.
const IMMUTABLE_FIELDS: [&str; 4] = ["id", "docType", "createdAt", "createdBy"];

/// Owns asset records and their lifecycle: draft → published →
/// archived / deleted. No dependencies on the other services.
pub struct AssetRegistry {
    store: Arc<dyn StateStore>,
}

impl AssetRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Create a new asset in `draft` status.
    pub async fn create_asset(
        &self,
        caller: &str,
        events: &mut EventSink,
        asset_id: &str,
        data: Value,
    ) -> Result<Asset, LedgerError> {
        if asset_id.is_empty() {
            return Err(LedgerError::Validation("asset id is required".to_string()));
        }
        if self.store.get(asset_id).await?.is_some() {
            return Err(LedgerError::AlreadyExists(format!("Asset {}", asset_id)));
        }

        let mut fields = as_object(data, "asset data")?;
        for field in ["name", "description", "assetType", "totalValue"] {
            if !is_truthy(fields.get(field)) {
                return Err(LedgerError::Validation(format!(
                    "required field {} is missing",
                    field
                )));
            }
        }

        let now = Utc::now();
        fields.insert("id".to_string(), json!(asset_id));
        fields.insert("docType".to_string(), json!(ASSET_DOC_TYPE));
        fields
            .entry("status".to_string())
            .or_insert_with(|| json!(AssetStatus::Draft));
        fields.insert("createdAt".to_string(), json!(now));
        fields.insert("updatedAt".to_string(), json!(now));
        fields.insert("createdBy".to_string(), json!(caller));

        let asset: Asset = serde_json::from_value(Value::Object(fields))
            .map_err(|err| LedgerError::Validation(err.to_string()))?;

        self.store
            .put(asset_id, serde_json::to_value(&asset)?)
            .await?;

        events.emit(
            "AssetCreated",
            json!({
                "assetId": asset_id,
                "action": "created",
                "timestamp": asset.created_at,
            }),
        );
        counter!("meros.asset.mutations", "op" => "create").increment(1);
        debug!(asset_id, "asset created");

        Ok(asset)
    }

    /// Merge `updates` into an existing asset, skipping immutable fields.
    pub async fn update_asset(
        &self,
        caller: &str,
        events: &mut EventSink,
        asset_id: &str,
        updates: Value,
    ) -> Result<Asset, LedgerError> {
        let stored = self.require_raw(asset_id).await?;
        let mut fields = as_object(stored, "stored asset")
            .map_err(|err| LedgerError::Storage(err.to_string()))?;
        let updates = as_object(updates, "update data")?;

        for (name, value) in updates {
            if !IMMUTABLE_FIELDS.contains(&name.as_str()) {
                fields.insert(name, value);
            }
        }
        fields.insert("updatedAt".to_string(), json!(Utc::now()));
        fields.insert("updatedBy".to_string(), json!(caller));

        let asset: Asset = serde_json::from_value(Value::Object(fields))
            .map_err(|err| LedgerError::Validation(err.to_string()))?;

        self.store
            .put(asset_id, serde_json::to_value(&asset)?)
            .await?;

        events.emit(
            "AssetUpdated",
            json!({
                "assetId": asset_id,
                "action": "updated",
                "timestamp": asset.updated_at,
            }),
        );
        counter!("meros.asset.mutations", "op" => "update").increment(1);

        Ok(asset)
    }

    /// Make an asset available for investment. Requires a minted token.
    pub async fn publish_asset(
        &self,
        caller: &str,
        events: &mut EventSink,
        asset_id: &str,
    ) -> Result<Asset, LedgerError> {
        let mut asset = self.get_asset(asset_id).await?;

        if asset.token_id.is_none() {
            return Err(LedgerError::InvalidStateTransition(
                "asset must have associated tokens before publishing".to_string(),
            ));
        }

        let now = Utc::now();
        asset.status = AssetStatus::Published;
        asset.published_at = Some(now);
        asset.updated_at = now;
        asset.published_by = Some(caller.to_string());

        self.store
            .put(asset_id, serde_json::to_value(&asset)?)
            .await?;

        events.emit(
            "AssetPublished",
            json!({
                "assetId": asset_id,
                "action": "published",
                "timestamp": now,
            }),
        );
        counter!("meros.asset.mutations", "op" => "publish").increment(1);
        debug!(asset_id, "asset published");

        Ok(asset)
    }

    pub async fn archive_asset(
        &self,
        _caller: &str,
        events: &mut EventSink,
        asset_id: &str,
    ) -> Result<Asset, LedgerError> {
        let mut asset = self.get_asset(asset_id).await?;

        let now = Utc::now();
        asset.status = AssetStatus::Archived;
        asset.archived_at = Some(now);
        asset.updated_at = now;

        self.store
            .put(asset_id, serde_json::to_value(&asset)?)
            .await?;

        events.emit(
            "AssetArchived",
            json!({
                "assetId": asset_id,
                "action": "archived",
                "timestamp": now,
            }),
        );
        counter!("meros.asset.mutations", "op" => "archive").increment(1);

        Ok(asset)
    }

    /// Remove the document entirely. Prior states stay reachable through
    /// the substrate's historical-version query only.
    pub async fn delete_asset(
        &self,
        _caller: &str,
        events: &mut EventSink,
        asset_id: &str,
    ) -> Result<(), LedgerError> {
        self.require_raw(asset_id).await?;
        self.store.delete(asset_id).await?;

        events.emit(
            "AssetDeleted",
            json!({
                "assetId": asset_id,
                "action": "deleted",
                "timestamp": Utc::now(),
            }),
        );
        counter!("meros.asset.mutations", "op" => "delete").increment(1);

        Ok(())
    }

    // ==================== Queries ====================

    pub async fn get_asset(&self, asset_id: &str) -> Result<Asset, LedgerError> {
        let raw = self.require_raw(asset_id).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn asset_exists(&self, asset_id: &str) -> Result<bool, LedgerError> {
        Ok(self.store.get(asset_id).await?.is_some())
    }

    /// All assets, optionally narrowed by a caller-supplied selector.
    pub async fn get_all_assets(
        &self,
        filter: Option<Selector>,
    ) -> Result<Vec<Asset>, LedgerError> {
        let selector = filter.unwrap_or_else(|| Selector::doc_type(ASSET_DOC_TYPE));
        self.query_assets(&selector).await
    }

    pub async fn get_published_assets(&self) -> Result<Vec<Asset>, LedgerError> {
        let selector = Selector::doc_type(ASSET_DOC_TYPE).field("status", "published");
        self.query_assets(&selector).await
    }

    pub async fn get_assets_by_type(&self, asset_type: &str) -> Result<Vec<Asset>, LedgerError> {
        let selector = Selector::doc_type(ASSET_DOC_TYPE).field("assetType", asset_type);
        self.query_assets(&selector).await
    }

    /// Selector merge: caller criteria layered over the asset doc type.
    pub async fn search_assets(
        &self,
        criteria: BTreeMap<String, Value>,
    ) -> Result<Vec<Asset>, LedgerError> {
        let selector = Selector::doc_type(ASSET_DOC_TYPE).with_criteria(criteria);
        self.query_assets(&selector).await
    }

    /// Every committed version of the asset document, newest first.
    pub async fn get_asset_history(&self, asset_id: &str) -> Result<Vec<DocVersion>, LedgerError> {
        self.store.history(asset_id).await
    }

    async fn query_assets(&self, selector: &Selector) -> Result<Vec<Asset>, LedgerError> {
        self.store
            .query(selector)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
            .collect()
    }

    async fn require_raw(&self, asset_id: &str) -> Result<Value, LedgerError> {
        self.store
            .get(asset_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Asset {}", asset_id)))
    }
}

pub(crate) fn as_object(
    value: Value,
    what: &str,
) -> Result<serde_json::Map<String, Value>, LedgerError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(LedgerError::Validation(format!(
            "{} must be a JSON object",
            what
        ))),
    }
}

/// The source's truthiness check for required fields: absent, null, empty
/// string, zero, and false all count as missing.
pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}
