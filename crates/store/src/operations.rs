//! Operation persistence: creation, listing, the atomic claim primitive,
//! and state-machine transitions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use vp_domain::ids;
use vp_domain::operation::{NewOperation, Operation, OperationStatus, Priority};
use vp_domain::page::{OperationFilter, Page, PageRequest};
use vp_domain::{Error, Result};

use crate::row::{fmt_dt, fmt_opt_dt, parse_dt, parse_enum, parse_json, parse_opt_dt, parse_opt_json};
use crate::{from_rusqlite, Store};

const COLS: &str = "id, type, priority, status, payload, result, error_message, \
                    retry_count, max_retries, scheduled_at, started_at, completed_at, \
                    created_by, cyberark_instance_id, correlation_id, created_at, updated_at";

fn map_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
    use vp_domain::operation::{OperationStatus as S, OperationType as T, Priority as P};
    Ok(Operation {
        id: row.get(0)?,
        op_type: parse_enum(1, &row.get::<_, String>(1)?, T::parse)?,
        priority: parse_enum(2, &row.get::<_, String>(2)?, P::parse)?,
        status: parse_enum(3, &row.get::<_, String>(3)?, S::parse)?,
        payload: parse_json(4, row.get(4)?)?,
        result: parse_opt_json(5, row.get(5)?)?,
        error_message: row.get(6)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        scheduled_at: parse_dt(9, row.get(9)?)?,
        started_at: parse_opt_dt(10, row.get(10)?)?,
        completed_at: parse_opt_dt(11, row.get(11)?)?,
        created_by: row.get(12)?,
        cyberark_instance_id: row.get(13)?,
        correlation_id: row.get(14)?,
        created_at: parse_dt(15, row.get(15)?)?,
        updated_at: parse_dt(16, row.get(16)?)?,
    })
}

fn get_by_id(conn: &Connection, id: &str) -> Result<Operation> {
    conn.query_row(
        &format!("SELECT {COLS} FROM operations WHERE id = ?1"),
        params![id],
        map_operation,
    )
    .optional()
    .map_err(from_rusqlite)?
    .ok_or_else(|| Error::NotFound(format!("operation {id}")))
}

/// Outcome of a cancel request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The operation was pending and is now cancelled.
    Cancelled(Operation),
    /// The operation is processing; cancellation was recorded and must be
    /// signalled to the running handler. The terminal state is the
    /// handler's decision.
    CancellationRequested(Operation),
}

impl Store {
    pub async fn create_operation(&self, new: NewOperation) -> Result<Operation> {
        if let Some(instance_id) = new.cyberark_instance_id.clone() {
            // Fail early with not_found instead of an FK constraint error.
            self.get_instance(&instance_id).await?;
        }
        self.call(move |conn| {
            let id = ids::operation_id();
            let now = Utc::now();
            let scheduled_at = new.scheduled_at.unwrap_or(now);
            let payload = serde_json::to_string(&new.payload)
                .map_err(|e| Error::Validation(format!("payload: {e}")))?;
            conn.execute(
                "INSERT INTO operations (id, type, priority, status, payload, retry_count, \
                 max_retries, scheduled_at, created_by, cyberark_instance_id, correlation_id, \
                 created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    id,
                    new.op_type.as_str(),
                    new.priority.as_str(),
                    payload,
                    new.max_retries,
                    fmt_dt(scheduled_at),
                    new.created_by,
                    new.cyberark_instance_id,
                    new.correlation_id,
                    fmt_dt(now),
                ],
            )
            .map_err(from_rusqlite)?;
            get_by_id(conn, &id)
        })
        .await
    }

    pub async fn get_operation(&self, id: String) -> Result<Operation> {
        self.call(move |conn| get_by_id(conn, &id)).await
    }

    pub async fn list_operations(
        &self,
        filter: OperationFilter,
        page: PageRequest,
    ) -> Result<Page<Operation>> {
        let page = page.clamped();
        self.call(move |conn| {
            let mut where_clauses: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(status) = filter.status {
                where_clauses.push(format!("status = ?{}", args.len() + 1));
                args.push(Box::new(status.as_str()));
            }
            if let Some(op_type) = filter.op_type {
                where_clauses.push(format!("type = ?{}", args.len() + 1));
                args.push(Box::new(op_type.as_str()));
            }
            if let Some(priority) = filter.priority {
                where_clauses.push(format!("priority = ?{}", args.len() + 1));
                args.push(Box::new(priority.as_str()));
            }
            if let Some(instance_id) = &filter.cyberark_instance_id {
                where_clauses.push(format!("cyberark_instance_id = ?{}", args.len() + 1));
                args.push(Box::new(instance_id.clone()));
            }
            if let Some(after) = filter.created_after {
                where_clauses.push(format!("created_at >= ?{}", args.len() + 1));
                args.push(Box::new(fmt_dt(after)));
            }
            if let Some(before) = filter.created_before {
                where_clauses.push(format!("created_at <= ?{}", args.len() + 1));
                args.push(Box::new(fmt_dt(before)));
            }
            if let Some(search) = &filter.search {
                let n = args.len() + 1;
                where_clauses.push(format!(
                    "(id LIKE ?{n} OR correlation_id LIKE ?{n} OR error_message LIKE ?{n})"
                ));
                args.push(Box::new(format!("%{search}%")));
            }

            let where_sql = if where_clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", where_clauses.join(" AND "))
            };

            let total: u64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM operations {where_sql}"),
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    |row| row.get(0),
                )
                .map_err(from_rusqlite)?;

            let sql = format!(
                "SELECT {COLS} FROM operations {where_sql} \
                 ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
                page.page_size,
                page.offset()
            );
            let mut stmt = conn.prepare(&sql).map_err(from_rusqlite)?;
            let items = stmt
                .query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    map_operation,
                )
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite)?;

            Ok(Page::new(items, total, page.page, page.page_size))
        })
        .await
    }

    /// Atomically claim the next eligible operation: highest priority first,
    /// then earliest `scheduled_at`, then earliest `created_at`. The claimed
    /// row moves to `processing` with `started_at` stamped. Returns `None`
    /// when nothing is eligible — that is not an error.
    ///
    /// The selection and transition happen in one conditional UPDATE with a
    /// predicate on the prior status, so concurrent claimers can never
    /// double-dispatch a row.
    pub async fn claim_next_operation(&self) -> Result<Option<Operation>> {
        self.call(move |conn| {
            let now = fmt_dt(Utc::now());
            conn.query_row(
                &format!(
                    "UPDATE operations SET status = 'processing', started_at = ?1, updated_at = ?1 \
                     WHERE id = ( \
                        SELECT id FROM operations \
                        WHERE status = 'pending' AND scheduled_at <= ?1 \
                        ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END, \
                                 scheduled_at ASC, created_at ASC, id ASC \
                        LIMIT 1 \
                     ) AND status = 'pending' \
                     RETURNING {COLS}"
                ),
                params![now],
                map_operation,
            )
            .optional()
            .map_err(from_rusqlite)
        })
        .await
    }

    /// `processing → completed` with the handler's result.
    pub async fn complete_operation(
        &self,
        id: String,
        result: serde_json::Value,
    ) -> Result<Operation> {
        self.transition(id, OperationStatus::Completed, move |conn, id, now| {
            let result = serde_json::to_string(&result)
                .map_err(|e| Error::Internal(format!("result: {e}")))?;
            conn.execute(
                "UPDATE operations SET status = 'completed', result = ?2, error_message = NULL, \
                 completed_at = ?3, updated_at = ?3 \
                 WHERE id = ?1 AND status = 'processing'",
                params![id, result, fmt_dt(now)],
            )
            .map_err(from_rusqlite)
        })
        .await
    }

    /// `processing → failed` with an error message. Terminal; no retry.
    pub async fn fail_operation(&self, id: String, error_message: String) -> Result<Operation> {
        self.transition(id, OperationStatus::Failed, move |conn, id, now| {
            conn.execute(
                "UPDATE operations SET status = 'failed', error_message = ?2, \
                 completed_at = ?3, updated_at = ?3 \
                 WHERE id = ?1 AND status = 'processing'",
                params![id, error_message, fmt_dt(now)],
            )
            .map_err(from_rusqlite)
        })
        .await
    }

    /// `processing → cancelled` — the handler observed cancellation.
    pub async fn mark_operation_cancelled(
        &self,
        id: String,
        error_message: Option<String>,
    ) -> Result<Operation> {
        self.transition(id, OperationStatus::Cancelled, move |conn, id, now| {
            conn.execute(
                "UPDATE operations SET status = 'cancelled', error_message = COALESCE(?2, error_message), \
                 completed_at = ?3, updated_at = ?3 \
                 WHERE id = ?1 AND status = 'processing'",
                params![id, error_message, fmt_dt(now)],
            )
            .map_err(from_rusqlite)
        })
        .await
    }

    /// Requeue after a retryable failure: `processing → pending` with
    /// `retry_count` incremented and `scheduled_at` pushed out by backoff.
    pub async fn retry_operation(
        &self,
        id: String,
        error_message: String,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Operation> {
        self.transition(id, OperationStatus::Pending, move |conn, id, now| {
            conn.execute(
                "UPDATE operations SET status = 'pending', retry_count = retry_count + 1, \
                 error_message = ?2, scheduled_at = ?3, started_at = NULL, updated_at = ?4 \
                 WHERE id = ?1 AND status = 'processing' AND retry_count < max_retries",
                params![id, error_message, fmt_dt(scheduled_at), fmt_dt(now)],
            )
            .map_err(from_rusqlite)
        })
        .await
    }

    /// Cancel an operation. Pending rows cancel directly; processing rows
    /// get "cancellation requested" recorded and the caller must signal the
    /// in-flight handler. Terminal rows are a conflict.
    pub async fn cancel_operation(&self, id: String) -> Result<CancelOutcome> {
        self.call(move |conn| {
            let now = fmt_dt(Utc::now());
            let changed = conn
                .execute(
                    "UPDATE operations SET status = 'cancelled', completed_at = ?2, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, now],
                )
                .map_err(from_rusqlite)?;
            if changed == 1 {
                return Ok(CancelOutcome::Cancelled(get_by_id(conn, &id)?));
            }

            let requested = conn
                .execute(
                    "UPDATE operations SET error_message = 'cancellation requested', updated_at = ?2 \
                     WHERE id = ?1 AND status = 'processing'",
                    params![id, now],
                )
                .map_err(from_rusqlite)?;
            if requested == 1 {
                return Ok(CancelOutcome::CancellationRequested(get_by_id(conn, &id)?));
            }

            let op = get_by_id(conn, &id)?;
            Err(Error::Conflict(format!(
                "operation {id} is {} and cannot be cancelled",
                op.status.as_str()
            )))
        })
        .await
    }

    /// Re-prioritise. Allowed only while pending or processing; for a
    /// processing row the new priority affects subsequent requeues only.
    pub async fn update_operation_priority(
        &self,
        id: String,
        priority: Priority,
        actor: Option<String>,
    ) -> Result<Operation> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE operations SET priority = ?2, updated_by = ?3, updated_at = ?4 \
                     WHERE id = ?1 AND status IN ('pending', 'processing')",
                    params![id, priority.as_str(), actor, fmt_dt(Utc::now())],
                )
                .map_err(from_rusqlite)?;
            if changed == 0 {
                let op = get_by_id(conn, &id)?;
                return Err(Error::Conflict(format!(
                    "operation {id} is {} and cannot be re-prioritised",
                    op.status.as_str()
                )));
            }
            get_by_id(conn, &id)
        })
        .await
    }

    /// Startup recovery: any row still `processing` was in flight when the
    /// process died. Reset to `pending` with `retry_count` incremented so
    /// the at-least-once contract holds. Returns the recovered rows.
    pub async fn recover_processing_operations(&self) -> Result<Vec<Operation>> {
        self.call(move |conn| {
            let now = fmt_dt(Utc::now());
            let mut stmt = conn
                .prepare(&format!(
                    "UPDATE operations SET status = 'pending', retry_count = retry_count + 1, \
                     started_at = NULL, error_message = 'recovered after restart', \
                     scheduled_at = ?1, updated_at = ?1 \
                     WHERE status = 'processing' \
                     RETURNING {COLS}"
                ))
                .map_err(from_rusqlite)?;
            let rows = stmt
                .query_map(params![now], map_operation)
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite)?;
            Ok(rows)
        })
        .await
    }

    /// Shared shape for `processing → <state>` transitions: run the guarded
    /// UPDATE, then disambiguate a zero-row result into not_found/conflict.
    async fn transition<F>(
        &self,
        id: String,
        target: OperationStatus,
        update: F,
    ) -> Result<Operation>
    where
        F: FnOnce(&Connection, &str, DateTime<Utc>) -> Result<usize> + Send + 'static,
    {
        self.call(move |conn| {
            let changed = update(conn, &id, Utc::now())?;
            if changed == 0 {
                let op = get_by_id(conn, &id)?;
                return Err(Error::Conflict(format!(
                    "operation {id}: invalid transition {} -> {}",
                    op.status.as_str(),
                    target.as_str()
                )));
            }
            get_by_id(conn, &id)
        })
        .await
    }
}
