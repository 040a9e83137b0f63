//! Content-addressed dataclips.

use chrono::Utc;
use db::models::{DataclipKind, DataclipRow};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::{EngineError, RunEngine};

/// blake3 hex digest of a body's JSON encoding. Object keys serialise in
/// sorted order, so equal values always hash the same.
pub fn digest(body: &Value) -> Result<String, EngineError> {
    let bytes = serde_json::to_vec(body)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

impl RunEngine {
    /// Store a body, reusing an unwiped clip of the same kind with equal content.
    pub async fn save_dataclip(
        &self,
        kind: DataclipKind,
        body: Value,
    ) -> Result<DataclipRow, EngineError> {
        let clip = DataclipRow {
            id: Uuid::new_v4(),
            kind,
            digest: digest(&body)?,
            body: Some(body),
            wiped_at: None,
            inserted_at: Utc::now(),
        };
        Ok(self.store.insert_dataclip(clip).await?)
    }

    pub async fn get_dataclip(&self, id: Uuid) -> Result<DataclipRow, EngineError> {
        Ok(self.store.get_dataclip(id).await?)
    }

    /// Discard a clip's body. Reruns that need it become ineligible.
    pub async fn wipe_dataclip(&self, id: Uuid) -> Result<DataclipRow, EngineError> {
        let clip = self.store.wipe_dataclip(id, Utc::now()).await?;
        info!(dataclip_id = %id, "dataclip wiped");
        Ok(clip)
    }
}
