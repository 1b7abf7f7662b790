//! Integration queries.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

use crate::db::models::{Integration, IntegrationState, NewIntegration};
use crate::db::DbPool;
use crate::store::{StoreError, StoreResult};

const COLUMNS: &str = "id, tenant_id, app_key, name, credentials, config, state, last_message, \
                       last_tested_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct IntegrationRow {
    id: i64,
    tenant_id: String,
    app_key: String,
    name: String,
    credentials: Vec<u8>,
    config: Value,
    state: String,
    last_message: Option<String>,
    last_tested_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntegrationRow> for Integration {
    type Error = StoreError;

    fn try_from(row: IntegrationRow) -> Result<Self, Self::Error> {
        let state = IntegrationState::parse(&row.state)
            .ok_or_else(|| StoreError::Corrupt(format!("integration state '{}'", row.state)))?;
        Ok(Integration {
            id: row.id,
            tenant_id: row.tenant_id,
            app_key: row.app_key,
            name: row.name,
            credentials: row.credentials,
            config: row.config,
            state,
            last_message: row.last_message,
            last_tested_at: row.last_tested_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub async fn insert_integration(pool: &DbPool, new: NewIntegration) -> StoreResult<Integration> {
    let row = sqlx::query_as::<_, IntegrationRow>(&format!(
        r#"
        INSERT INTO funnelflow.integration (tenant_id, app_key, name, credentials, config)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&new.tenant_id)
    .bind(&new.app_key)
    .bind(&new.name)
    .bind(&new.credentials)
    .bind(&new.config)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

pub async fn get_integration(pool: &DbPool, id: i64) -> StoreResult<Option<Integration>> {
    sqlx::query_as::<_, IntegrationRow>(&format!(
        "SELECT {COLUMNS} FROM funnelflow.integration WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(Integration::try_from)
    .transpose()
}

pub async fn list_integrations(
    pool: &DbPool,
    tenant_id: Option<&str>,
) -> StoreResult<Vec<Integration>> {
    sqlx::query_as::<_, IntegrationRow>(&format!(
        r#"
        SELECT {COLUMNS} FROM funnelflow.integration
        WHERE ($1::text IS NULL OR tenant_id = $1)
        ORDER BY id
        "#
    ))
    .bind(tenant_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Integration::try_from)
    .collect()
}

pub async fn delete_integration(pool: &DbPool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM funnelflow.integration WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_state(
    pool: &DbPool,
    id: i64,
    state: IntegrationState,
    message: Option<&str>,
    tested: bool,
) -> StoreResult<Option<Integration>> {
    sqlx::query_as::<_, IntegrationRow>(&format!(
        r#"
        UPDATE funnelflow.integration
        SET state = $2,
            last_message = $3,
            last_tested_at = CASE WHEN $4 THEN NOW() ELSE last_tested_at END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {COLUMNS}
        "#
    ))
    .bind(id)
    .bind(state.as_str())
    .bind(message)
    .bind(tested)
    .fetch_optional(pool)
    .await?
    .map(Integration::try_from)
    .transpose()
}
