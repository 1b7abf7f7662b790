//! Workflow run, step and run log queries.
//!
//! Status changes are single conditional `UPDATE`s so concurrent callers
//! (runner, recovery controller, sweeper) cannot interleave.

use chrono::{DateTime, Utc};
use funnelflow_actions::ErrorCode;
use serde_json::Value;
use sqlx::FromRow;

use crate::db::models::{
    LogLevel, NewRun, NewStep, RunFilter, RunLogEntry, RunStatus, StepOutcome, StepStatus,
    WorkflowRun, WorkflowStep,
};
use crate::db::DbPool;
use crate::store::{StoreError, StoreResult};

const RUN_COLUMNS: &str = "id, sequence_id, trigger_id, event_id, status, attempt, arguments, \
                           output, stale, started_at, finished_at, created_at, updated_at";

const STEP_COLUMNS: &str = "id, run_id, attempt, node_id, node_name, node_type, position, status, \
                            input_data, output_data, raw_response, processed_output, \
                            error_message, error_code, retry_count, debug_info, started_at, \
                            completed_at, duration_ms";

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    sequence_id: i64,
    trigger_id: i64,
    event_id: i64,
    status: String,
    attempt: i32,
    arguments: Value,
    output: Value,
    stale: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = RunStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("run status '{}'", row.status)))?;
        Ok(WorkflowRun {
            id: row.id,
            sequence_id: row.sequence_id,
            trigger_id: row.trigger_id,
            event_id: row.event_id,
            status,
            attempt: row.attempt,
            arguments: row.arguments,
            output: row.output,
            stale: row.stale,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StepRow {
    id: i64,
    run_id: i64,
    attempt: i32,
    node_id: i64,
    node_name: String,
    node_type: String,
    position: i32,
    status: String,
    input_data: Value,
    output_data: Option<Value>,
    raw_response: Option<Value>,
    processed_output: Option<Value>,
    error_message: Option<String>,
    error_code: Option<String>,
    retry_count: i32,
    debug_info: Value,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl TryFrom<StepRow> for WorkflowStep {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let status = StepStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("step status '{}'", row.status)))?;
        let error_code = match row.error_code.as_deref() {
            Some(code) => Some(
                ErrorCode::parse(code)
                    .ok_or_else(|| StoreError::Corrupt(format!("error code '{code}'")))?,
            ),
            None => None,
        };
        Ok(WorkflowStep {
            id: row.id,
            run_id: row.run_id,
            attempt: row.attempt,
            node_id: row.node_id,
            node_name: row.node_name,
            node_type: row.node_type,
            position: row.position,
            status,
            input_data: row.input_data,
            output_data: row.output_data,
            raw_response: row.raw_response,
            processed_output: row.processed_output,
            error_message: row.error_message,
            error_code,
            retry_count: row.retry_count,
            debug_info: row.debug_info,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
        })
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: i64,
    run_id: i64,
    level: String,
    message: String,
    created_at: DateTime<Utc>,
}

fn status_strings(statuses: &[RunStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

pub async fn insert_run(pool: &DbPool, new: NewRun) -> StoreResult<WorkflowRun> {
    sqlx::query_as::<_, RunRow>(&format!(
        r#"
        INSERT INTO funnelflow.workflow_run (sequence_id, trigger_id, event_id, arguments)
        VALUES ($1, $2, $3, $4)
        RETURNING {RUN_COLUMNS}
        "#
    ))
    .bind(new.sequence_id)
    .bind(new.trigger_id)
    .bind(new.event_id)
    .bind(&new.arguments)
    .fetch_one(pool)
    .await?
    .try_into()
}

pub async fn get_run(pool: &DbPool, id: i64) -> StoreResult<Option<WorkflowRun>> {
    sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM funnelflow.workflow_run WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(WorkflowRun::try_from)
    .transpose()
}

pub async fn list_runs(pool: &DbPool, filter: &RunFilter) -> StoreResult<Vec<WorkflowRun>> {
    sqlx::query_as::<_, RunRow>(&format!(
        r#"
        SELECT {RUN_COLUMNS} FROM funnelflow.workflow_run
        WHERE ($1::bigint IS NULL OR sequence_id = $1)
          AND ($2::text IS NULL OR status = $2)
        ORDER BY id DESC
        LIMIT $3 OFFSET $4
        "#
    ))
    .bind(filter.sequence_id)
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.limit.max(0))
    .bind(filter.offset.max(0))
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(WorkflowRun::try_from)
    .collect()
}

pub async fn transition_run(
    pool: &DbPool,
    id: i64,
    from: &[RunStatus],
    to: RunStatus,
) -> StoreResult<Option<WorkflowRun>> {
    sqlx::query_as::<_, RunRow>(&format!(
        r#"
        UPDATE funnelflow.workflow_run
        SET status = $3,
            stale = FALSE,
            started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
            finished_at = CASE
                WHEN $3 = 'running' THEN NULL
                WHEN $3 IN ('completed', 'failed', 'waiting') THEN NOW()
                ELSE finished_at
            END,
            updated_at = NOW()
        WHERE id = $1 AND status = ANY($2)
        RETURNING {RUN_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(status_strings(from))
    .bind(to.as_str())
    .fetch_optional(pool)
    .await?
    .map(WorkflowRun::try_from)
    .transpose()
}

pub async fn begin_attempt(
    pool: &DbPool,
    id: i64,
    expected_attempt: i32,
) -> StoreResult<Option<WorkflowRun>> {
    sqlx::query_as::<_, RunRow>(&format!(
        r#"
        UPDATE funnelflow.workflow_run
        SET attempt = attempt + 1,
            status = 'running',
            output = '{{}}'::jsonb,
            stale = FALSE,
            started_at = NOW(),
            finished_at = NULL,
            updated_at = NOW()
        WHERE id = $1 AND status = 'failed' AND attempt = $2
        RETURNING {RUN_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(expected_attempt)
    .fetch_optional(pool)
    .await?
    .map(WorkflowRun::try_from)
    .transpose()
}

pub async fn record_output(
    pool: &DbPool,
    id: i64,
    attempt: i32,
    position: i32,
    output: &Value,
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE funnelflow.workflow_run
        SET output = jsonb_set(output, ARRAY[$3::text], $4, TRUE), updated_at = NOW()
        WHERE id = $1 AND attempt = $2 AND status = 'running'
        "#,
    )
    .bind(id)
    .bind(attempt)
    .bind(position.to_string())
    .bind(output)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_run(pool: &DbPool, id: i64) -> StoreResult<()> {
    sqlx::query(
        "UPDATE funnelflow.workflow_run SET updated_at = NOW() WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_stale_runs(pool: &DbPool, cutoff: DateTime<Utc>) -> StoreResult<Vec<WorkflowRun>> {
    sqlx::query_as::<_, RunRow>(&format!(
        r#"
        SELECT {RUN_COLUMNS} FROM funnelflow.workflow_run
        WHERE status = 'running' AND NOT stale AND updated_at < $1
        ORDER BY id
        "#
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(WorkflowRun::try_from)
    .collect()
}

pub async fn mark_stale(pool: &DbPool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE funnelflow.workflow_run SET stale = TRUE
        WHERE id = $1 AND status = 'running' AND NOT stale
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_step(pool: &DbPool, new: NewStep) -> StoreResult<WorkflowStep> {
    let settled = new.status.is_terminal();
    sqlx::query_as::<_, StepRow>(&format!(
        r#"
        INSERT INTO funnelflow.workflow_step
            (run_id, attempt, node_id, node_name, node_type, position, status,
             input_data, debug_info, completed_at, duration_ms)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                CASE WHEN $10 THEN NOW() END,
                CASE WHEN $10 THEN 0 END)
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(new.run_id)
    .bind(new.attempt)
    .bind(new.node_id)
    .bind(&new.node_name)
    .bind(&new.node_type)
    .bind(new.position)
    .bind(new.status.as_str())
    .bind(&new.input_data)
    .bind(&new.debug_info)
    .bind(settled)
    .fetch_one(pool)
    .await?
    .try_into()
}

pub async fn finish_step(
    pool: &DbPool,
    step_id: i64,
    status: StepStatus,
    outcome: StepOutcome,
) -> StoreResult<Option<WorkflowStep>> {
    sqlx::query_as::<_, StepRow>(&format!(
        r#"
        UPDATE funnelflow.workflow_step
        SET status = $2,
            output_data = $3,
            raw_response = $4,
            processed_output = $5,
            error_message = $6,
            error_code = $7,
            debug_info = COALESCE($8, debug_info),
            completed_at = NOW(),
            duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::bigint
        WHERE id = $1 AND status = 'running'
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(step_id)
    .bind(status.as_str())
    .bind(&outcome.output_data)
    .bind(&outcome.raw_response)
    .bind(&outcome.processed_output)
    .bind(&outcome.error_message)
    .bind(outcome.error_code.map(|c| c.as_str()))
    .bind(&outcome.debug_info)
    .fetch_optional(pool)
    .await?
    .map(WorkflowStep::try_from)
    .transpose()
}

pub async fn record_retry(pool: &DbPool, step_id: i64, error_message: &str) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE funnelflow.workflow_step
        SET retry_count = retry_count + 1, error_message = $2
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(step_id)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn abort_running_steps(pool: &DbPool, run_id: i64, message: &str) -> StoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE funnelflow.workflow_step
        SET status = 'failed',
            error_code = $2,
            error_message = $3,
            completed_at = NOW(),
            duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::bigint
        WHERE run_id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(ErrorCode::AbortedError.as_str())
    .bind(message)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_steps(
    pool: &DbPool,
    run_id: i64,
    attempt: Option<i32>,
) -> StoreResult<Vec<WorkflowStep>> {
    sqlx::query_as::<_, StepRow>(&format!(
        r#"
        SELECT {STEP_COLUMNS} FROM funnelflow.workflow_step
        WHERE run_id = $1 AND ($2::int IS NULL OR attempt = $2)
        ORDER BY attempt, position, id
        "#
    ))
    .bind(run_id)
    .bind(attempt)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(WorkflowStep::try_from)
    .collect()
}

pub async fn append_log(pool: &DbPool, run_id: i64, level: LogLevel, message: &str) -> StoreResult<()> {
    sqlx::query("INSERT INTO funnelflow.run_log (run_id, level, message) VALUES ($1, $2, $3)")
        .bind(run_id)
        .bind(level.as_str())
        .bind(message)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_logs(pool: &DbPool, run_id: i64) -> StoreResult<Vec<RunLogEntry>> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT id, run_id, level, message, created_at
        FROM funnelflow.run_log
        WHERE run_id = $1
        ORDER BY id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let level = LogLevel::parse(&row.level)
                .ok_or_else(|| StoreError::Corrupt(format!("log level '{}'", row.level)))?;
            Ok(RunLogEntry {
                id: row.id,
                run_id: row.run_id,
                level,
                message: row.message,
                created_at: row.created_at,
            })
        })
        .collect()
}
