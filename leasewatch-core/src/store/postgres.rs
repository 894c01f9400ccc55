//! Postgres lease store. Every claim, release and cursor write is a single
//! conditional `UPDATE`; read-modify-write paths (upsert, rate windows) run in
//! a transaction holding the row lock.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasewatch_config::RateLimitPolicy;
use leasewatch_model::{
    Credential, DiscoveredWatch, RecordId, SecretToken, Tenant, TenantId,
    WatchKey, WatchKind, WatchRecord, WorkerId,
};
use sqlx::{PgPool, Postgres, Transaction, postgres::PgPoolOptions};
use tracing::info;

use super::{
    LeaseStore, PermitDecision, UpsertOutcome, UpsertPlan, decide_permit,
    plan_upsert,
};
use crate::error::{PollError, Result};

macro_rules! watch_columns {
    () => {
        "tenant_id, kind, record_id, discovered_at, ttl_deadline, lease_owner, \
         locked_until, source_modified_at, dispatched_through, document_type, \
         parent_id, claim_count, version"
    };
}

/// Upsert attempts before giving up on a row that keeps being inserted
/// concurrently.
const UPSERT_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLeaseStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresLeaseStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await?;
        info!(target: "leasewatch::lease", "lease store connected to Postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| PollError::StoreUnavailable(format!("migration failed: {e}")))
    }

    async fn write_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &WatchRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE watch_records
            SET discovered_at = $4,
                ttl_deadline = $5,
                lease_owner = $6,
                locked_until = $7,
                source_modified_at = $8,
                dispatched_through = $9,
                document_type = $10,
                parent_id = $11,
                claim_count = $12,
                version = $13
            WHERE tenant_id = $1 AND kind = $2 AND record_id = $3
            "#,
        )
        .bind(record.tenant_id.as_str())
        .bind(record.kind.as_str())
        .bind(record.record_id.as_str())
        .bind(record.discovered_at)
        .bind(record.ttl_deadline)
        .bind(record.lease_owner.as_ref().map(WorkerId::as_str))
        .bind(record.locked_until)
        .bind(record.source_modified_at)
        .bind(record.dispatched_through)
        .bind(record.document_type.as_deref())
        .bind(record.parent_id.as_ref().map(RecordId::as_str))
        .bind(to_i32(record.claim_count))
        .bind(to_i64(record.version))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &WatchRecord,
    ) -> Result<bool> {
        let inserted = sqlx::query(concat!(
            "INSERT INTO watch_records (",
            watch_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (tenant_id, kind, record_id) DO NOTHING"
        ))
        .bind(record.tenant_id.as_str())
        .bind(record.kind.as_str())
        .bind(record.record_id.as_str())
        .bind(record.discovered_at)
        .bind(record.ttl_deadline)
        .bind(record.lease_owner.as_ref().map(WorkerId::as_str))
        .bind(record.locked_until)
        .bind(record.source_modified_at)
        .bind(record.dispatched_through)
        .bind(record.document_type.as_deref())
        .bind(record.parent_id.as_ref().map(RecordId::as_str))
        .bind(to_i32(record.claim_count))
        .bind(to_i64(record.version))
        .execute(&mut **tx)
        .await?;
        Ok(inserted.rows_affected() == 1)
    }
}

#[derive(sqlx::FromRow)]
struct TenantRow {
    tenant_id: String,
    active: bool,
    cursor: Option<DateTime<Utc>>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = PollError;

    fn try_from(row: TenantRow) -> Result<Self> {
        Ok(Tenant {
            tenant_id: TenantId::new(row.tenant_id)?,
            active: row.active,
            cursor: row.cursor,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    tenant_id: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = PollError;

    fn try_from(row: CredentialRow) -> Result<Self> {
        Ok(Credential {
            tenant_id: TenantId::new(row.tenant_id)?,
            access_token: SecretToken::new(row.access_token),
            refresh_token: row.refresh_token.map(SecretToken::new),
            expires_at: row.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WatchRow {
    tenant_id: String,
    kind: String,
    record_id: String,
    discovered_at: DateTime<Utc>,
    ttl_deadline: DateTime<Utc>,
    lease_owner: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    source_modified_at: DateTime<Utc>,
    dispatched_through: Option<DateTime<Utc>>,
    document_type: Option<String>,
    parent_id: Option<String>,
    claim_count: i32,
    version: i64,
}

impl TryFrom<WatchRow> for WatchRecord {
    type Error = PollError;

    fn try_from(row: WatchRow) -> Result<Self> {
        Ok(WatchRecord {
            tenant_id: TenantId::new(row.tenant_id)?,
            kind: row.kind.parse()?,
            record_id: RecordId::new(row.record_id)?,
            discovered_at: row.discovered_at,
            ttl_deadline: row.ttl_deadline,
            lease_owner: row.lease_owner.map(WorkerId::from_raw),
            locked_until: row.locked_until,
            source_modified_at: row.source_modified_at,
            dispatched_through: row.dispatched_through,
            document_type: row.document_type,
            parent_id: row.parent_id.map(RecordId::new).transpose()?,
            claim_count: u32::try_from(row.claim_count).unwrap_or(0),
            version: u64::try_from(row.version).unwrap_or(0),
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn rows_into<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = PollError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn active_tenants(&self) -> Result<Vec<Tenant>> {
        let rows: Vec<TenantRow> = sqlx::query_as(
            "SELECT tenant_id, active, cursor FROM tenants WHERE active ORDER BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows_into(rows)
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let rows: Vec<TenantRow> = sqlx::query_as(
            "SELECT tenant_id, active, cursor FROM tenants ORDER BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows_into(rows)
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(
            "SELECT tenant_id, active, cursor FROM tenants WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Tenant::try_from).transpose()
    }

    async fn upsert_tenant(
        &self,
        tenant_id: &TenantId,
        active: bool,
    ) -> Result<Tenant> {
        let row: TenantRow = sqlx::query_as(
            r#"
            INSERT INTO tenants (tenant_id, active)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET active = EXCLUDED.active
            RETURNING tenant_id, active, cursor
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(active)
        .fetch_one(&self.pool)
        .await?;
        Tenant::try_from(row)
    }

    async fn advance_cursor(
        &self,
        tenant_id: &TenantId,
        cursor: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET cursor = $2
            WHERE tenant_id = $1 AND (cursor IS NULL OR cursor < $2)
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_credential(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Credential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, access_token, refresh_token, expires_at
            FROM credentials
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Credential::try_from).transpose()
    }

    async fn put_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (tenant_id, access_token, refresh_token, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id) DO UPDATE
            SET access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(credential.tenant_id.as_str())
        .bind(credential.access_token.expose())
        .bind(credential.refresh_token.as_ref().map(SecretToken::expose))
        .bind(credential.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_watch(
        &self,
        item: &DiscoveredWatch,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UpsertOutcome> {
        for _ in 0..UPSERT_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            let existing: Option<WatchRow> = sqlx::query_as(concat!(
                "SELECT ",
                watch_columns!(),
                " FROM watch_records \
                 WHERE tenant_id = $1 AND kind = $2 AND record_id = $3 \
                 FOR UPDATE"
            ))
            .bind(item.tenant_id.as_str())
            .bind(item.kind.as_str())
            .bind(item.record_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
            let existing = existing.map(WatchRecord::try_from).transpose()?;

            let (outcome, plan) = plan_upsert(existing.as_ref(), item, now, ttl);
            match plan {
                UpsertPlan::Insert(record) => {
                    if !Self::insert_record(&mut tx, &record).await? {
                        // Lost an insert race; re-read under the row lock.
                        tx.rollback().await?;
                        continue;
                    }
                }
                UpsertPlan::Update(record) => {
                    Self::write_record(&mut tx, &record).await?;
                }
                UpsertPlan::Untouched => {}
            }
            tx.commit().await?;
            return Ok(outcome);
        }

        Err(PollError::LeaseContention(item.key().to_string()))
    }

    async fn get_watch(&self, key: &WatchKey) -> Result<Option<WatchRecord>> {
        let row: Option<WatchRow> = sqlx::query_as(concat!(
            "SELECT ",
            watch_columns!(),
            " FROM watch_records \
             WHERE tenant_id = $1 AND kind = $2 AND record_id = $3"
        ))
        .bind(key.tenant_id.as_str())
        .bind(key.kind.as_str())
        .bind(key.record_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(WatchRecord::try_from).transpose()
    }

    async fn claim_candidates(
        &self,
        tenant_id: &TenantId,
        kind: WatchKind,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WatchRecord>> {
        let rows: Vec<WatchRow> = sqlx::query_as(concat!(
            "SELECT ",
            watch_columns!(),
            " FROM watch_records \
             WHERE tenant_id = $1 AND kind = $2 \
               AND ttl_deadline > $3 \
               AND (dispatched_through IS NULL OR dispatched_through < source_modified_at) \
               AND (lease_owner IS NULL OR locked_until IS NULL OR locked_until <= $3) \
             ORDER BY discovered_at, record_id \
             LIMIT $4"
        ))
        .bind(tenant_id.as_str())
        .bind(kind.as_str())
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows_into(rows)
    }

    async fn compare_and_claim(
        &self,
        expected: &WatchRecord,
        owner: &WorkerId,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<WatchRecord>> {
        let row: Option<WatchRow> = sqlx::query_as(concat!(
            "UPDATE watch_records \
             SET lease_owner = $4, \
                 locked_until = $5, \
                 claim_count = claim_count + 1, \
                 version = version + 1 \
             WHERE tenant_id = $1 AND kind = $2 AND record_id = $3 \
               AND version = $6 \
               AND locked_until IS NOT DISTINCT FROM $7 \
               AND ttl_deadline > $8 \
               AND (dispatched_through IS NULL OR dispatched_through < source_modified_at) \
               AND (lease_owner IS NULL OR locked_until IS NULL OR locked_until <= $8) \
             RETURNING ",
            watch_columns!()
        ))
        .bind(expected.tenant_id.as_str())
        .bind(expected.kind.as_str())
        .bind(expected.record_id.as_str())
        .bind(owner.as_str())
        .bind(locked_until)
        .bind(to_i64(expected.version))
        .bind(expected.locked_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WatchRecord::try_from).transpose()
    }

    async fn release(&self, key: &WatchKey, owner: &WorkerId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE watch_records
            SET lease_owner = NULL,
                locked_until = NULL,
                version = version + 1
            WHERE tenant_id = $1 AND kind = $2 AND record_id = $3
              AND lease_owner = $4
            "#,
        )
        .bind(key.tenant_id.as_str())
        .bind(key.kind.as_str())
        .bind(key.record_id.as_str())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        key: &WatchKey,
        owner: &WorkerId,
        through: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE watch_records
            SET lease_owner = NULL,
                locked_until = NULL,
                dispatched_through = GREATEST(dispatched_through, $5),
                version = version + 1
            WHERE tenant_id = $1 AND kind = $2 AND record_id = $3
              AND lease_owner = $4
            "#,
        )
        .bind(key.tenant_id.as_str())
        .bind(key.kind.as_str())
        .bind(key.record_id.as_str())
        .bind(owner.as_str())
        .bind(through)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WatchRecord>> {
        let rows: Vec<WatchRow> = sqlx::query_as(concat!(
            "SELECT ",
            watch_columns!(),
            " FROM watch_records \
             WHERE ttl_deadline <= $1 \
             ORDER BY ttl_deadline \
             LIMIT $2"
        ))
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows_into(rows)
    }

    async fn delete_expired(
        &self,
        key: &WatchKey,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM watch_records
            WHERE tenant_id = $1 AND kind = $2 AND record_id = $3
              AND ttl_deadline <= $4
            "#,
        )
        .bind(key.tenant_id.as_str())
        .bind(key.kind.as_str())
        .bind(key.record_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_consume_permit(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        policy: RateLimitPolicy,
    ) -> Result<PermitDecision> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO rate_windows (tenant_id, window_started_at, used)
            VALUES ($1, $2, 0)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (started, used): (DateTime<Utc>, i32) = sqlx::query_as(
            r#"
            SELECT window_started_at, used
            FROM rate_windows
            WHERE tenant_id = $1
            FOR UPDATE
            "#,
        )
        .bind(tenant_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let current = Some((started, u32::try_from(used).unwrap_or(0)));
        let (decision, next) = decide_permit(current, now, policy);

        if let Some((window_started_at, used)) = next {
            sqlx::query(
                r#"
                UPDATE rate_windows
                SET window_started_at = $2, used = $3
                WHERE tenant_id = $1
                "#,
            )
            .bind(tenant_id.as_str())
            .bind(window_started_at)
            .bind(to_i32(used))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(decision)
    }
}
