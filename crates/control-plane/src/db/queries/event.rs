//! Event queries.

use crate::db::models::{Event, NewEvent};
use crate::db::DbPool;
use crate::store::StoreResult;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    app_key: String,
    trigger_key: String,
    integration_id: Option<i64>,
    event_data: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            app_key: row.app_key,
            trigger_key: row.trigger_key,
            integration_id: row.integration_id,
            event_data: row.event_data,
            created_at: row.created_at,
        }
    }
}

pub async fn insert_event(pool: &DbPool, new: NewEvent) -> StoreResult<Event> {
    let row = sqlx::query_as::<_, EventRow>(
        r#"
        INSERT INTO funnelflow.event (app_key, trigger_key, integration_id, event_data)
        VALUES ($1, $2, $3, $4)
        RETURNING id, app_key, trigger_key, integration_id, event_data, created_at
        "#,
    )
    .bind(&new.app_key)
    .bind(&new.trigger_key)
    .bind(new.integration_id)
    .bind(&new.event_data)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

pub async fn get_event(pool: &DbPool, id: i64) -> StoreResult<Option<Event>> {
    let row = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, app_key, trigger_key, integration_id, event_data, created_at
        FROM funnelflow.event
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Event::from))
}
