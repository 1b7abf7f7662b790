//! Sequence, trigger and action queries.
//!
//! Action positions are rewritten inside one transaction; the unique
//! `(sequence_id, position)` constraint is deferred until commit.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, Postgres, Transaction};

use crate::db::models::{
    NewAction, NewSequence, NewTrigger, Sequence, SequenceAction, SequenceTrigger,
};
use crate::db::DbPool;
use crate::store::{StoreError, StoreResult};

const SEQUENCE_COLUMNS: &str = "id, tenant_id, name, enabled, created_at, updated_at";

const TRIGGER_COLUMNS: &str = "id, sequence_id, app_key, integration_id, trigger_key, \
                               configuration, conditions, sample_output, created_at";

const ACTION_COLUMNS: &str = "id, sequence_id, position, name, app_key, integration_id, \
                              action_key, configuration, max_retries, enabled, sample_output, \
                              created_at, updated_at";

#[derive(Debug, FromRow)]
struct SequenceRow {
    id: i64,
    tenant_id: String,
    name: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SequenceRow> for Sequence {
    fn from(row: SequenceRow) -> Self {
        Sequence {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TriggerRow {
    id: i64,
    sequence_id: i64,
    app_key: String,
    integration_id: Option<i64>,
    trigger_key: String,
    configuration: Value,
    conditions: Option<Value>,
    sample_output: Option<Value>,
    created_at: DateTime<Utc>,
}

impl From<TriggerRow> for SequenceTrigger {
    fn from(row: TriggerRow) -> Self {
        SequenceTrigger {
            id: row.id,
            sequence_id: row.sequence_id,
            app_key: row.app_key,
            integration_id: row.integration_id,
            trigger_key: row.trigger_key,
            configuration: row.configuration,
            conditions: row.conditions,
            sample_output: row.sample_output,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ActionRow {
    id: i64,
    sequence_id: i64,
    position: i32,
    name: String,
    app_key: String,
    integration_id: Option<i64>,
    action_key: String,
    configuration: Value,
    max_retries: i32,
    enabled: bool,
    sample_output: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ActionRow> for SequenceAction {
    fn from(row: ActionRow) -> Self {
        SequenceAction {
            id: row.id,
            sequence_id: row.sequence_id,
            position: row.position,
            name: row.name,
            app_key: row.app_key,
            integration_id: row.integration_id,
            action_key: row.action_key,
            configuration: row.configuration,
            max_retries: row.max_retries,
            enabled: row.enabled,
            sample_output: row.sample_output,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub async fn insert_sequence(pool: &DbPool, new: NewSequence) -> StoreResult<Sequence> {
    let row = sqlx::query_as::<_, SequenceRow>(&format!(
        r#"
        INSERT INTO funnelflow.sequence (tenant_id, name, enabled)
        VALUES ($1, $2, $3)
        RETURNING {SEQUENCE_COLUMNS}
        "#
    ))
    .bind(&new.tenant_id)
    .bind(&new.name)
    .bind(new.enabled)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

pub async fn get_sequence(pool: &DbPool, id: i64) -> StoreResult<Option<Sequence>> {
    let row = sqlx::query_as::<_, SequenceRow>(&format!(
        "SELECT {SEQUENCE_COLUMNS} FROM funnelflow.sequence WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Sequence::from))
}

pub async fn list_sequences(pool: &DbPool, tenant_id: Option<&str>) -> StoreResult<Vec<Sequence>> {
    let rows = sqlx::query_as::<_, SequenceRow>(&format!(
        r#"
        SELECT {SEQUENCE_COLUMNS} FROM funnelflow.sequence
        WHERE ($1::text IS NULL OR tenant_id = $1)
        ORDER BY id
        "#
    ))
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Sequence::from).collect())
}

pub async fn set_sequence_enabled(
    pool: &DbPool,
    id: i64,
    enabled: bool,
) -> StoreResult<Option<Sequence>> {
    let row = sqlx::query_as::<_, SequenceRow>(&format!(
        r#"
        UPDATE funnelflow.sequence SET enabled = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING {SEQUENCE_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(enabled)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Sequence::from))
}

/// Triggers and actions go with the sequence (`ON DELETE CASCADE`).
pub async fn delete_sequence(pool: &DbPool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM funnelflow.sequence WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_trigger(pool: &DbPool, new: NewTrigger) -> StoreResult<SequenceTrigger> {
    let row = sqlx::query_as::<_, TriggerRow>(&format!(
        r#"
        INSERT INTO funnelflow.trigger
            (sequence_id, app_key, integration_id, trigger_key, configuration, conditions)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {TRIGGER_COLUMNS}
        "#
    ))
    .bind(new.sequence_id)
    .bind(&new.app_key)
    .bind(new.integration_id)
    .bind(&new.trigger_key)
    .bind(&new.configuration)
    .bind(&new.conditions)
    .fetch_one(pool)
    .await
    .map_err(|e| foreign_key_to_not_found(e, "sequence", new.sequence_id))?;

    Ok(row.into())
}

pub async fn get_trigger(pool: &DbPool, id: i64) -> StoreResult<Option<SequenceTrigger>> {
    let row = sqlx::query_as::<_, TriggerRow>(&format!(
        "SELECT {TRIGGER_COLUMNS} FROM funnelflow.trigger WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(SequenceTrigger::from))
}

pub async fn list_triggers(pool: &DbPool, sequence_id: i64) -> StoreResult<Vec<SequenceTrigger>> {
    let rows = sqlx::query_as::<_, TriggerRow>(&format!(
        "SELECT {TRIGGER_COLUMNS} FROM funnelflow.trigger WHERE sequence_id = $1 ORDER BY id"
    ))
    .bind(sequence_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(SequenceTrigger::from).collect())
}

pub async fn find_triggers(
    pool: &DbPool,
    app_key: &str,
    trigger_key: &str,
) -> StoreResult<Vec<SequenceTrigger>> {
    let rows = sqlx::query_as::<_, TriggerRow>(&format!(
        r#"
        SELECT {TRIGGER_COLUMNS} FROM funnelflow.trigger
        WHERE app_key = $1 AND trigger_key = $2
        ORDER BY id
        "#
    ))
    .bind(app_key)
    .bind(trigger_key)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(SequenceTrigger::from).collect())
}

pub async fn delete_trigger(pool: &DbPool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM funnelflow.trigger WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_trigger_sample(pool: &DbPool, id: i64, sample: &Value) -> StoreResult<()> {
    let result = sqlx::query("UPDATE funnelflow.trigger SET sample_output = $2 WHERE id = $1")
        .bind(id)
        .bind(sample)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("trigger {id}")));
    }
    Ok(())
}

async fn ordered_action_ids(
    tx: &mut Transaction<'_, Postgres>,
    sequence_id: i64,
) -> StoreResult<Vec<i64>> {
    let ids: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM funnelflow.action
        WHERE sequence_id = $1
        ORDER BY position, id
        FOR UPDATE
        "#,
    )
    .bind(sequence_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

async fn renumber(tx: &mut Transaction<'_, Postgres>, ordered: &[i64]) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE funnelflow.action AS a
        SET position = o.position::int, updated_at = NOW()
        FROM UNNEST($1::bigint[]) WITH ORDINALITY AS o(id, position)
        WHERE a.id = o.id AND a.position <> o.position::int
        "#,
    )
    .bind(ordered)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn list_actions_tx(
    tx: &mut Transaction<'_, Postgres>,
    sequence_id: i64,
) -> StoreResult<Vec<SequenceAction>> {
    let rows = sqlx::query_as::<_, ActionRow>(&format!(
        "SELECT {ACTION_COLUMNS} FROM funnelflow.action WHERE sequence_id = $1 ORDER BY position"
    ))
    .bind(sequence_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(SequenceAction::from).collect())
}

pub async fn insert_action(pool: &DbPool, new: NewAction) -> StoreResult<SequenceAction> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET CONSTRAINTS funnelflow.action_position_unique DEFERRED")
        .execute(&mut *tx)
        .await?;

    let mut ordered = ordered_action_ids(&mut tx, new.sequence_id).await?;
    let index = new
        .position
        .map(|p| (p.max(1) as usize - 1).min(ordered.len()))
        .unwrap_or(ordered.len());

    // Temporary position past the end; renumber settles it.
    let row = sqlx::query_as::<_, ActionRow>(&format!(
        r#"
        INSERT INTO funnelflow.action
            (sequence_id, position, name, app_key, integration_id, action_key,
             configuration, max_retries, enabled)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {ACTION_COLUMNS}
        "#
    ))
    .bind(new.sequence_id)
    .bind(ordered.len() as i32 + 1)
    .bind(&new.name)
    .bind(&new.app_key)
    .bind(new.integration_id)
    .bind(&new.action_key)
    .bind(&new.configuration)
    .bind(new.max_retries)
    .bind(new.enabled)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| foreign_key_to_not_found(e, "sequence", new.sequence_id))?;

    ordered.insert(index, row.id);
    renumber(&mut tx, &ordered).await?;
    let action = list_actions_tx(&mut tx, new.sequence_id)
        .await?
        .into_iter()
        .find(|a| a.id == row.id)
        .ok_or_else(|| StoreError::NotFound(format!("action {}", row.id)))?;
    tx.commit().await?;
    Ok(action)
}

pub async fn get_action(pool: &DbPool, id: i64) -> StoreResult<Option<SequenceAction>> {
    let row = sqlx::query_as::<_, ActionRow>(&format!(
        "SELECT {ACTION_COLUMNS} FROM funnelflow.action WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(SequenceAction::from))
}

pub async fn list_actions(pool: &DbPool, sequence_id: i64) -> StoreResult<Vec<SequenceAction>> {
    let rows = sqlx::query_as::<_, ActionRow>(&format!(
        "SELECT {ACTION_COLUMNS} FROM funnelflow.action WHERE sequence_id = $1 ORDER BY position"
    ))
    .bind(sequence_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(SequenceAction::from).collect())
}

pub async fn delete_action(pool: &DbPool, id: i64) -> StoreResult<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET CONSTRAINTS funnelflow.action_position_unique DEFERRED")
        .execute(&mut *tx)
        .await?;

    let deleted: Option<(i64,)> =
        sqlx::query_as("DELETE FROM funnelflow.action WHERE id = $1 RETURNING sequence_id")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some((sequence_id,)) = deleted else {
        return Ok(false);
    };

    let ordered = ordered_action_ids(&mut tx, sequence_id).await?;
    renumber(&mut tx, &ordered).await?;
    tx.commit().await?;
    Ok(true)
}

pub async fn move_action(pool: &DbPool, id: i64, position: i32) -> StoreResult<Vec<SequenceAction>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET CONSTRAINTS funnelflow.action_position_unique DEFERRED")
        .execute(&mut *tx)
        .await?;

    let found: Option<(i64,)> =
        sqlx::query_as("SELECT sequence_id FROM funnelflow.action WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    let (sequence_id,) = found.ok_or_else(|| StoreError::NotFound(format!("action {id}")))?;

    let mut ordered: Vec<i64> = ordered_action_ids(&mut tx, sequence_id)
        .await?
        .into_iter()
        .filter(|other| *other != id)
        .collect();
    let index = (position.max(1) as usize - 1).min(ordered.len());
    ordered.insert(index, id);
    renumber(&mut tx, &ordered).await?;

    let actions = list_actions_tx(&mut tx, sequence_id).await?;
    tx.commit().await?;
    Ok(actions)
}

pub async fn set_action_sample(pool: &DbPool, id: i64, sample: &Value) -> StoreResult<()> {
    let result = sqlx::query("UPDATE funnelflow.action SET sample_output = $2 WHERE id = $1")
        .bind(id)
        .bind(sample)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("action {id}")));
    }
    Ok(())
}

fn foreign_key_to_not_found(err: sqlx::Error, entity: &str, id: i64) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::NotFound(format!("{entity} {id}"))
        }
        _ => StoreError::Database(err),
    }
}
