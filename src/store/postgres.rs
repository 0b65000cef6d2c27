use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::ApprovalStore;
use crate::models::analytics::StatusCounts;
use crate::models::approval::{ApprovalRequest, ApprovalStatus, RequestFilter, Transition};
use crate::models::audit::{AuditEntry, HistoryFilter, HistoryRecord};

const REQUEST_COLUMNS: &str = "id, requester_id, request_type, payload, reason, status, \
     created_at, expires_at, decided_at, decided_by, executed_at";

const REQUEST_FILTER: &str = r#"
    WHERE ($1::varchar IS NULL OR request_type = $1)
      AND ($2::varchar IS NULL OR status = $2)
      AND ($3::varchar IS NULL OR requester_id = $3)
      AND ($4::timestamptz IS NULL OR created_at >= $4)
      AND ($5::timestamptz IS NULL OR created_at <= $5)"#;

const HISTORY_FILTER: &str = r#"
    WHERE ($1::uuid IS NULL OR h.approval_request_id = $1)
      AND ($2::varchar IS NULL OR h.actor_id = $2)
      AND ($3::varchar IS NULL OR h.action = $3)
      AND ($4::timestamptz IS NULL OR h.timestamp >= $4)
      AND ($5::timestamptz IS NULL OR h.timestamp <= $5)"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Append one audit row on the caller's connection (always inside a transaction).
async fn insert_history(conn: &mut PgConnection, entry: &AuditEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO approval_history (
               id, approval_request_id, action, actor_id, actor_name, actor_role,
               timestamp, previous_status, new_status, details, signature
           )
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(entry.id)
    .bind(entry.approval_request_id)
    .bind(entry.action)
    .bind(&entry.actor_id)
    .bind(&entry.actor_name)
    .bind(&entry.actor_role)
    .bind(entry.timestamp)
    .bind(entry.previous_status)
    .bind(entry.new_status)
    .bind(&entry.details)
    .bind(&entry.signature)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ApprovalStore for PgStore {
    async fn insert_request(
        &self,
        request: &ApprovalRequest,
        entry: &AuditEntry,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO approval_requests
                   (id, requester_id, request_type, payload, reason, status, created_at, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(request.id)
        .bind(&request.requester_id)
        .bind(&request.request_type)
        .bind(&request.payload)
        .bind(&request.reason)
        .bind(request.status)
        .bind(request.created_at)
        .bind(request.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!("insert_request failed: {:?}", e);
            e
        })?;

        insert_history(&mut *tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn transition(
        &self,
        transition: &Transition,
        entry: &AuditEntry,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = if transition.to == ApprovalStatus::Executed {
            sqlx::query(
                "UPDATE approval_requests SET status = $1, executed_at = $2 \
                 WHERE id = $3 AND status = $4",
            )
            .bind(transition.to)
            .bind(transition.at)
            .bind(transition.request_id)
            .bind(transition.from)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                "UPDATE approval_requests SET status = $1, decided_at = $2, decided_by = $3 \
                 WHERE id = $4 AND status = $5",
            )
            .bind(transition.to)
            .bind(transition.at)
            .bind(&transition.actor_id)
            .bind(transition.request_id)
            .bind(transition.from)
            .execute(&mut *tx)
            .await?
        };

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_history(&mut *tx, entry).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_request(&self, id: Uuid) -> anyhow::Result<Option<ApprovalRequest>> {
        let row = sqlx::query_as::<_, ApprovalRequest>(&format!(
            "SELECT {} FROM approval_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<ApprovalRequest>, i64)> {
        let rows = sqlx::query_as::<_, ApprovalRequest>(&format!(
            "SELECT {} FROM approval_requests {} ORDER BY created_at DESC, id DESC LIMIT $6 OFFSET $7",
            REQUEST_COLUMNS, REQUEST_FILTER
        ))
        .bind(filter.request_type.as_deref())
        .bind(filter.status)
        .bind(filter.requester_id.as_deref())
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM approval_requests {}",
            REQUEST_FILTER
        ))
        .bind(filter.request_type.as_deref())
        .bind(filter.status)
        .bind(filter.requester_id.as_deref())
        .bind(filter.created_from)
        .bind(filter.created_to)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM approval_requests \
             WHERE status = 'pending' AND expires_at < $1 \
             ORDER BY expires_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<HistoryRecord>, i64)> {
        let rows = sqlx::query_as::<_, HistoryRecord>(&format!(
            r#"SELECT h.id, h.approval_request_id, h.action, h.actor_id, h.actor_name,
                      h.actor_role, h.timestamp, h.previous_status, h.new_status,
                      h.details, h.signature,
                      r.request_type, r.requester_id
               FROM approval_history h
               JOIN approval_requests r ON r.id = h.approval_request_id
               {}
               ORDER BY h.timestamp ASC, h.id ASC
               LIMIT $6 OFFSET $7"#,
            HISTORY_FILTER
        ))
        .bind(filter.approval_request_id)
        .bind(filter.actor_id.as_deref())
        .bind(filter.action)
        .bind(filter.from)
        .bind(filter.to)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM approval_history h {}",
            HISTORY_FILTER
        ))
        .bind(filter.approval_request_id)
        .bind(filter.actor_id.as_deref())
        .bind(filter.action)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn count_by_status(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<StatusCounts> {
        let counts = sqlx::query_as::<_, StatusCounts>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')   AS pending,
                COUNT(*) FILTER (WHERE status = 'approved')  AS approved,
                COUNT(*) FILTER (WHERE status = 'rejected')  AS rejected,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) FILTER (WHERE status = 'expired')   AS expired,
                COUNT(*) FILTER (WHERE status = 'executed')  AS executed
            FROM approval_requests
            WHERE ($1::timestamptz IS NULL OR created_at >= $1)
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }
}
