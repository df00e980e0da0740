use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::{Stats, StoreError};
use crate::models::batch::BatchState;
use crate::models::cfdi::{ReferenceTriple, VerificationMethod, VerificationResult};
use crate::models::job::{ItemFilter, ItemKey, ItemState, JobStatus, NewItem, Transition};

macro_rules! item_columns {
    () => {
        "job_id, batch_id, batch_index, method, folio_fiscal, rfc_emisor, rfc_receptor, \
         xml_hash, status, valid, result, error_message, webhook_url, webhook_sent, \
         created_at, started_at, completed_at"
    };
}

macro_rules! batch_columns {
    () => {
        "batch_id, total_items, completed_count, failed_count, webhook_url, webhook_sent, \
         created_at, completed_at, cancelled_at"
    };
}

fn parse<T: FromStr>(column: &'static str, value: String) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt { column, value })
}

fn item_from_row(row: &PgRow) -> Result<ItemState, StoreError> {
    let method: VerificationMethod = parse("method", row.try_get("method")?)?;
    let status: JobStatus = parse("status", row.try_get("status")?)?;

    let folio: Option<String> = row.try_get("folio_fiscal")?;
    let reference = match folio {
        Some(uuid) => Some(ReferenceTriple {
            uuid,
            issuer_rfc: row.try_get::<Option<String>, _>("rfc_emisor")?.unwrap_or_default(),
            receiver_rfc: row.try_get::<Option<String>, _>("rfc_receptor")?.unwrap_or_default(),
        }),
        None => None,
    };
    let result: Option<Json<VerificationResult>> = row.try_get("result")?;

    Ok(ItemState {
        job_id: row.try_get("job_id")?,
        batch_id: row.try_get("batch_id")?,
        batch_index: row.try_get("batch_index")?,
        method,
        reference,
        xml_hash: row.try_get("xml_hash")?,
        status,
        valid: row.try_get("valid")?,
        result: result.map(|Json(r)| r),
        error: row.try_get("error_message")?,
        webhook_url: row.try_get("webhook_url")?,
        webhook_sent: row.try_get("webhook_sent")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<BatchState, StoreError> {
    Ok(BatchState {
        batch_id: row.try_get("batch_id")?,
        total: row.try_get("total_items")?,
        completed: row.try_get("completed_count")?,
        failed: row.try_get("failed_count")?,
        webhook_url: row.try_get("webhook_url")?,
        webhook_sent: row.try_get("webhook_sent")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

/// `(job_id, batch_id, batch_index)` binds for the key predicate used below.
fn key_binds(key: ItemKey) -> (Option<Uuid>, Option<Uuid>, Option<i32>) {
    match key {
        ItemKey::Job { job_id } => (Some(job_id), None, None),
        ItemKey::BatchItem { batch_id, index } => (None, Some(batch_id), Some(index)),
    }
}

/// Insert a verification item, standalone or at a batch position
pub async fn insert_item(
    conn: &mut PgConnection,
    item: &NewItem,
    position: Option<(Uuid, i32)>,
) -> Result<ItemState, StoreError> {
    let reference = item.reference.as_ref();
    let row = sqlx::query(concat!(
        "INSERT INTO verifications \
           (job_id, batch_id, batch_index, method, folio_fiscal, rfc_emisor, rfc_receptor, \
            xml_hash, webhook_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING ",
        item_columns!()
    ))
    .bind(item.job_id)
    .bind(position.map(|(batch_id, _)| batch_id))
    .bind(position.map(|(_, index)| index))
    .bind(item.method.to_string())
    .bind(reference.map(|r| r.uuid.as_str()))
    .bind(reference.map(|r| r.issuer_rfc.as_str()))
    .bind(reference.map(|r| r.receiver_rfc.as_str()))
    .bind(item.xml_hash.as_deref())
    .bind(item.webhook_url.as_deref())
    .fetch_one(conn)
    .await?;

    item_from_row(&row)
}

/// Insert a batch header
pub async fn insert_batch(
    conn: &mut PgConnection,
    batch_id: Uuid,
    total: i32,
    webhook_url: Option<&str>,
) -> Result<BatchState, StoreError> {
    let row = sqlx::query(concat!(
        "INSERT INTO batches (batch_id, total_items, webhook_url) \
         VALUES ($1, $2, $3) \
         RETURNING ",
        batch_columns!()
    ))
    .bind(batch_id)
    .bind(total)
    .bind(webhook_url)
    .fetch_one(conn)
    .await?;

    batch_from_row(&row)
}

/// Apply a transition if the item is in one of the allowed predecessor
/// states. Returns `(job_id, batch_id)` of the updated row, or `None` when
/// the compare-and-set did not match.
pub async fn update_item_status(
    conn: &mut PgConnection,
    key: ItemKey,
    transition: &Transition,
) -> Result<Option<(Uuid, Option<Uuid>)>, StoreError> {
    let (job_id, batch_id, index) = key_binds(key);
    let allowed: Vec<String> = transition
        .to
        .allowed_predecessors()
        .iter()
        .map(ToString::to_string)
        .collect();

    let row = sqlx::query(
        r#"
        UPDATE verifications
        SET status = $1,
            valid = COALESCE($2, valid),
            result = COALESCE($3, result),
            error_message = COALESCE($4, error_message),
            started_at = CASE WHEN $1 = 'processing' THEN NOW() ELSE started_at END,
            completed_at = CASE WHEN $1 IN ('completed', 'failed') THEN NOW() ELSE completed_at END
        WHERE status = ANY($5)
          AND CASE WHEN $7::uuid IS NULL THEN job_id = $6
                   ELSE batch_id = $7 AND batch_index = $8 END
        RETURNING job_id, batch_id
        "#,
    )
    .bind(transition.to.to_string())
    .bind(transition.result.as_ref().map(|r| r.valid))
    .bind(transition.result.clone().map(Json))
    .bind(transition.error.as_deref())
    .bind(allowed)
    .bind(job_id)
    .bind(batch_id)
    .bind(index)
    .fetch_optional(conn)
    .await?;

    match row {
        Some(r) => Ok(Some((r.try_get("job_id")?, r.try_get("batch_id")?))),
        None => Ok(None),
    }
}

/// Current status of an item, if it exists
pub async fn item_status(
    conn: &mut PgConnection,
    key: ItemKey,
) -> Result<Option<JobStatus>, StoreError> {
    let (job_id, batch_id, index) = key_binds(key);
    let status: Option<String> = sqlx::query_scalar(
        r#"
        SELECT status FROM verifications
        WHERE CASE WHEN $2::uuid IS NULL THEN job_id = $1
                   ELSE batch_id = $2 AND batch_index = $3 END
        "#,
    )
    .bind(job_id)
    .bind(batch_id)
    .bind(index)
    .fetch_optional(conn)
    .await?;

    status.map(|s| parse("status", s)).transpose()
}

/// Add to a batch's counters. The row lock taken by the UPDATE serializes
/// concurrent increments; returns `(completed, failed, total)` after this one.
pub async fn increment_batch_counts(
    conn: &mut PgConnection,
    batch_id: Uuid,
    completed: i32,
    failed: i32,
) -> Result<(i32, i32, i32), StoreError> {
    let row = sqlx::query(
        r#"
        UPDATE batches
        SET completed_count = completed_count + $2,
            failed_count = failed_count + $3,
            completed_at = CASE
                WHEN completed_count + failed_count + $2 + $3 >= total_items THEN NOW()
                ELSE completed_at
            END
        WHERE batch_id = $1
        RETURNING completed_count, failed_count, total_items
        "#,
    )
    .bind(batch_id)
    .bind(completed)
    .bind(failed)
    .fetch_optional(conn)
    .await?
    .ok_or(StoreError::BatchNotFound(batch_id))?;

    Ok((
        row.try_get("completed_count")?,
        row.try_get("failed_count")?,
        row.try_get("total_items")?,
    ))
}

/// Get an item by job ID
pub async fn get_item(pool: &PgPool, job_id: Uuid) -> Result<Option<ItemState>, StoreError> {
    let row = sqlx::query(concat!(
        "SELECT ",
        item_columns!(),
        " FROM verifications WHERE job_id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(item_from_row).transpose()
}

/// Verification history, newest first
pub async fn list_items(pool: &PgPool, filter: &ItemFilter) -> Result<Vec<ItemState>, StoreError> {
    let (limit, offset) = filter.page();
    let rows = sqlx::query(concat!(
        "SELECT ",
        item_columns!(),
        " FROM verifications \
          WHERE ($1::text IS NULL OR status = $1) \
            AND ($2::bool IS NULL OR valid = $2) \
            AND ($3::text IS NULL OR folio_fiscal = $3) \
            AND ($4::text IS NULL OR rfc_emisor = $4) \
            AND ($5::text IS NULL OR rfc_receptor = $5) \
            AND ($6::text IS NULL OR xml_hash = $6) \
          ORDER BY created_at DESC \
          LIMIT $7 OFFSET $8"
    ))
    .bind(filter.status.map(|s| s.to_string()))
    .bind(filter.valid)
    .bind(filter.folio_fiscal.as_deref())
    .bind(filter.rfc_emisor.as_deref())
    .bind(filter.rfc_receptor.as_deref())
    .bind(filter.xml_hash.as_deref())
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Delete a standalone item
pub async fn delete_item(pool: &PgPool, job_id: Uuid) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM verifications WHERE job_id = $1 AND batch_id IS NULL")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn mark_item_notified(pool: &PgPool, job_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("UPDATE verifications SET webhook_sent = TRUE WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Get a batch by ID
pub async fn get_batch(pool: &PgPool, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
    let row = sqlx::query(concat!(
        "SELECT ",
        batch_columns!(),
        " FROM batches WHERE batch_id = $1"
    ))
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(batch_from_row).transpose()
}

/// Items of a batch in index order
pub async fn batch_items(pool: &PgPool, batch_id: Uuid) -> Result<Vec<ItemState>, StoreError> {
    let rows = sqlx::query(concat!(
        "SELECT ",
        item_columns!(),
        " FROM verifications WHERE batch_id = $1 ORDER BY batch_index ASC"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Recent batches, newest first
pub async fn list_batches(pool: &PgPool, limit: i64) -> Result<Vec<BatchState>, StoreError> {
    let rows = sqlx::query(concat!(
        "SELECT ",
        batch_columns!(),
        " FROM batches ORDER BY created_at DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(batch_from_row).collect()
}

/// Set `webhook_sent` unless it is already set
pub async fn mark_batch_notified(pool: &PgPool, batch_id: Uuid) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE batches SET webhook_sent = TRUE WHERE batch_id = $1 AND NOT webhook_sent",
    )
    .bind(batch_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Stamp `cancelled_at`, keeping the first stamp
pub async fn cancel_batch(pool: &PgPool, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
    let row = sqlx::query(concat!(
        "UPDATE batches SET cancelled_at = COALESCE(cancelled_at, NOW()) \
         WHERE batch_id = $1 \
         RETURNING ",
        batch_columns!()
    ))
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(batch_from_row).transpose()
}

/// Counts per status, by validity, and of batches
pub async fn stats(pool: &PgPool) -> Result<Stats, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE status = 'pending') AS pending,
            COUNT(*) FILTER (WHERE status = 'processing') AS processing,
            COUNT(*) FILTER (WHERE status = 'completed') AS completed,
            COUNT(*) FILTER (WHERE status = 'failed') AS failed,
            COUNT(*) FILTER (WHERE valid IS TRUE) AS valid,
            COUNT(*) FILTER (WHERE valid IS FALSE) AS invalid,
            (SELECT COUNT(*) FROM batches) AS batches
        FROM verifications
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(Stats {
        total: row.try_get("total")?,
        pending: row.try_get("pending")?,
        processing: row.try_get("processing")?,
        completed: row.try_get("completed")?,
        failed: row.try_get("failed")?,
        valid: row.try_get("valid")?,
        invalid: row.try_get("invalid")?,
        batches: row.try_get("batches")?,
    })
}

pub async fn ping(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
