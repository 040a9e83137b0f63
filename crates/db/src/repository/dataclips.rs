//! Dataclip storage and retention wipes.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_text;
use crate::{models::DataclipRow, DbError};

const COLUMNS: &str = "id, kind, body, digest, wiped_at, inserted_at";

#[derive(Debug, FromRow)]
struct DataclipRecord {
    id: Uuid,
    kind: String,
    body: Option<Value>,
    digest: String,
    wiped_at: Option<DateTime<Utc>>,
    inserted_at: DateTime<Utc>,
}

impl TryFrom<DataclipRecord> for DataclipRow {
    type Error = DbError;

    fn try_from(r: DataclipRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            kind: parse_text("dataclips", &r.kind)?,
            body: r.body,
            digest: r.digest,
            wiped_at: r.wiped_at,
            inserted_at: r.inserted_at,
        })
    }
}

/// Store a dataclip, reusing an unwiped clip with the same kind and digest.
pub async fn insert_dataclip(
    pool: &PgPool,
    dataclip: &DataclipRow,
) -> Result<DataclipRow, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM dataclips \
         WHERE kind = $1 AND digest = $2 AND wiped_at IS NULL \
         ORDER BY inserted_at LIMIT 1"
    );
    let existing = sqlx::query_as::<_, DataclipRecord>(&sql)
        .bind(dataclip.kind.as_str())
        .bind(&dataclip.digest)
        .fetch_optional(pool)
        .await?;
    if let Some(existing) = existing {
        return existing.try_into();
    }

    let sql = format!(
        "INSERT INTO dataclips ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) RETURNING {COLUMNS}"
    );
    sqlx::query_as::<_, DataclipRecord>(&sql)
        .bind(dataclip.id)
        .bind(dataclip.kind.as_str())
        .bind(&dataclip.body)
        .bind(&dataclip.digest)
        .bind(dataclip.wiped_at)
        .bind(dataclip.inserted_at)
        .fetch_one(pool)
        .await?
        .try_into()
}

pub async fn get_dataclip(pool: &PgPool, id: Uuid) -> Result<DataclipRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM dataclips WHERE id = $1");
    sqlx::query_as::<_, DataclipRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::not_found("dataclips", id))?
        .try_into()
}

/// Null the body permanently. The first wipe timestamp wins.
pub async fn wipe_dataclip(
    pool: &PgPool,
    id: Uuid,
    at: DateTime<Utc>,
) -> Result<DataclipRow, DbError> {
    let sql = format!(
        "UPDATE dataclips SET body = NULL, wiped_at = COALESCE(wiped_at, $2) \
         WHERE id = $1 RETURNING {COLUMNS}"
    );
    sqlx::query_as::<_, DataclipRecord>(&sql)
        .bind(id)
        .bind(at)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::not_found("dataclips", id))?
        .try_into()
}
