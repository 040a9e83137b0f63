//! Append-only run log lines.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_text;
use crate::{
    models::{LogLineRow, LogSource, NewLogLine},
    DbError,
};

const COLUMNS: &str =
    "id, run_id, step_id, source, level, message, timestamp, sequence, inserted_at";

#[derive(Debug, FromRow)]
struct LogLineRecord {
    id: Uuid,
    run_id: Uuid,
    step_id: Option<Uuid>,
    source: String,
    level: String,
    message: String,
    timestamp: DateTime<Utc>,
    sequence: i64,
    inserted_at: DateTime<Utc>,
}

impl TryFrom<LogLineRecord> for LogLineRow {
    type Error = DbError;

    fn try_from(r: LogLineRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            run_id: r.run_id,
            step_id: r.step_id,
            source: parse_text("log_lines", &r.source)?,
            level: parse_text("log_lines", &r.level)?,
            message: r.message,
            timestamp: r.timestamp,
            sequence: r.sequence,
            inserted_at: r.inserted_at,
        })
    }
}

/// Append a line; `sequence` comes from the table's serial column.
pub async fn append_log(pool: &PgPool, line: &NewLogLine) -> Result<LogLineRow, DbError> {
    let source = if line.step_id.is_some() {
        LogSource::Job
    } else {
        LogSource::Run
    };
    let sql = format!(
        r#"
        INSERT INTO log_lines (id, run_id, step_id, source, level, message, timestamp, inserted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {COLUMNS}
        "#
    );
    let result = sqlx::query_as::<_, LogLineRecord>(&sql)
        .bind(Uuid::new_v4())
        .bind(line.run_id)
        .bind(line.step_id)
        .bind(source.as_str())
        .bind(line.level.as_str())
        .bind(&line.message)
        .bind(line.timestamp)
        .bind(Utc::now())
        .fetch_one(pool)
        .await;

    match result {
        Ok(record) => record.try_into(),
        Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
            Err(DbError::not_found("runs", line.run_id))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn list_logs(
    pool: &PgPool,
    run_id: Uuid,
    step_id: Option<Uuid>,
) -> Result<Vec<LogLineRow>, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM log_lines \
         WHERE run_id = $1 AND ($2::uuid IS NULL OR step_id = $2) \
         ORDER BY sequence"
    );
    sqlx::query_as::<_, LogLineRecord>(&sql)
        .bind(run_id)
        .bind(step_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
}
