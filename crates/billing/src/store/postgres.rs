//! Postgres-backed store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::{
    AuditLog, EntitlementGrant, NewRawEvent, Payment, PaymentStatus, ProcessingStatus,
    ProductMapping, RawEvent, StatusCounts, Subscription,
};

use super::{
    page_bounds, AuditStore, CommitOutcome, EventFilter, EventStore, InsertOutcome, LedgerStore,
    PaymentFilter, PaymentSummary, ProductCatalog, UnitOfWork, UserDirectory, UserMatch,
};
use crate::audit::AuditQuery;
use crate::error::{BillingError, BillingResult};
use crate::payload::compacted_payload;

const RAW_EVENT_COLUMNS: &str = r#"
    provider_event_id, event_type, payload, headers, signature, identity_source,
    transaction_ref, received_at, processing_status, processed_at, error
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, user_id, transaction_id, amount_cents, currency, status, provider, product_id,
    created_at, updated_at
"#;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, plan_id, status, external_customer_id, expires_at, last_event_id,
    created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event_if_absent(&self, event: NewRawEvent) -> BillingResult<InsertOutcome> {
        let inserted: Option<RawEvent> = sqlx::query_as(&format!(
            r#"
            INSERT INTO raw_events (
                provider_event_id, event_type, payload, headers, signature,
                identity_source, transaction_ref, received_at, processing_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING')
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING {}
            "#,
            RAW_EVENT_COLUMNS
        ))
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.headers)
        .bind(&event.signature)
        .bind(event.identity_source.as_str())
        .bind(&event.transaction_ref)
        .bind(event.received_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(row));
        }

        self.get_event(&event.provider_event_id)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| {
                BillingError::Database(format!(
                    "raw event {} conflicted but could not be read back",
                    event.provider_event_id
                ))
            })
    }

    async fn get_event(&self, provider_event_id: &str) -> BillingResult<Option<RawEvent>> {
        let event = sqlx::query_as(&format!(
            "SELECT {} FROM raw_events WHERE provider_event_id = $1",
            RAW_EVENT_COLUMNS
        ))
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn mark_event_failed(&self, provider_event_id: &str, error: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE raw_events
            SET error = $2,
                processing_status = CASE
                    WHEN processing_status = 'PROCESSED' THEN processing_status
                    ELSE 'FAILED'
                END
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "raw event {}",
                provider_event_id
            )));
        }
        Ok(())
    }

    async fn pending_events(&self, limit: i64) -> BillingResult<Vec<RawEvent>> {
        let events = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM raw_events
            WHERE processing_status = 'PENDING'
            ORDER BY received_at ASC
            LIMIT $1
            "#,
            RAW_EVENT_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn failed_events(&self, limit: i64) -> BillingResult<Vec<RawEvent>> {
        let events = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM raw_events
            WHERE processing_status = 'FAILED'
            ORDER BY received_at DESC
            LIMIT $1
            "#,
            RAW_EVENT_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn events_since(&self, since: OffsetDateTime) -> BillingResult<Vec<RawEvent>> {
        let events = sqlx::query_as(&format!(
            "SELECT {} FROM raw_events WHERE received_at >= $1 ORDER BY received_at ASC",
            RAW_EVENT_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn event_status_counts(&self, since: OffsetDateTime) -> BillingResult<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT processing_status, COUNT(*)
            FROM raw_events
            WHERE received_at >= $1
            GROUP BY processing_status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(status.parse::<ProcessingStatus>()?, count);
        }
        Ok(counts)
    }

    async fn list_events(&self, filter: &EventFilter) -> BillingResult<Vec<RawEvent>> {
        let (limit, offset) = page_bounds(filter.limit, filter.offset);
        let events = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM raw_events
            WHERE ($1::VARCHAR IS NULL OR processing_status = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
            RAW_EVENT_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn compact_processed_events(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE raw_events
            SET payload = $2, headers = '{}'::jsonb, signature = NULL
            WHERE processing_status = 'PROCESSED'
              AND received_at < $1
              AND payload->>'compacted' IS NULL
            "#,
        )
        .bind(before)
        .bind(compacted_payload())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn payment_by_transaction(&self, transaction_id: &str) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE transaction_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn subscription_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    async fn grant_for_event(
        &self,
        source_event_id: &str,
    ) -> BillingResult<Option<EntitlementGrant>> {
        let grant = sqlx::query_as(
            r#"
            SELECT id, user_id, kind, bot_type, quantity, source_event_id, created_at
            FROM entitlement_grants
            WHERE source_event_id = $1
            "#,
        )
        .bind(source_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(grant)
    }

    async fn grants_for_user(&self, user_id: Uuid) -> BillingResult<Vec<EntitlementGrant>> {
        let grants = sqlx::query_as(
            r#"
            SELECT id, user_id, kind, bot_type, quantity, source_event_id, created_at
            FROM entitlement_grants
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(grants)
    }

    async fn payments_since(&self, since: OffsetDateTime) -> BillingResult<Vec<Payment>> {
        let payments = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE created_at >= $1 ORDER BY created_at ASC",
            PAYMENT_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        let (limit, offset) = page_bounds(filter.limit, filter.offset);
        let payments = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM payments
            WHERE ($1::VARCHAR IS NULL OR status = $1)
              AND ($2::UUID IS NULL OR user_id = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn payment_summary(&self, since: OffsetDateTime) -> BillingResult<PaymentSummary> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*), COALESCE(SUM(amount_cents), 0)::BIGINT
            FROM payments
            WHERE created_at >= $1
            GROUP BY status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let totals = rows
            .into_iter()
            .map(|(status, count, amount)| Ok((status.parse::<PaymentStatus>()?, count, amount)))
            .collect::<BillingResult<Vec<_>>>()?;
        Ok(PaymentSummary::from_totals(since, &totals))
    }

    async fn commit(&self, work: UnitOfWork) -> BillingResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent runs for the same event
        let status: Option<(String,)> = sqlx::query_as(
            "SELECT processing_status FROM raw_events WHERE provider_event_id = $1 FOR UPDATE",
        )
        .bind(&work.event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status,)) = status else {
            return Ok(CommitOutcome::EventMissing);
        };
        if status.parse::<ProcessingStatus>()? == ProcessingStatus::Processed && !work.force {
            return Ok(CommitOutcome::AlreadyProcessed);
        }

        // Row locks taken here hold until commit, so the version check
        // cannot race the write below
        if let Some(payment) = &work.payment {
            let current: Option<(OffsetDateTime,)> = sqlx::query_as(
                "SELECT updated_at FROM payments WHERE transaction_id = $1 FOR UPDATE",
            )
            .bind(&payment.transaction_id)
            .fetch_optional(&mut *tx)
            .await?;
            if current.map(|(at,)| at) != work.payment_seen {
                return Ok(CommitOutcome::Stale);
            }
        }
        if let Some(subscription) = &work.subscription {
            let current: Option<(OffsetDateTime,)> = sqlx::query_as(
                "SELECT updated_at FROM subscriptions WHERE user_id = $1 FOR UPDATE",
            )
            .bind(subscription.user_id)
            .fetch_optional(&mut *tx)
            .await?;
            if current.map(|(at,)| at) != work.subscription_seen {
                return Ok(CommitOutcome::Stale);
            }
        }

        if let Some(payment) = &work.payment {
            // A concurrent first insert loses the unique check instead of
            // overwriting the winner's row
            let written = sqlx::query(
                r#"
                INSERT INTO payments (
                    id, user_id, transaction_id, amount_cents, currency, status,
                    provider, product_id, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (transaction_id) DO UPDATE SET
                    user_id = EXCLUDED.user_id,
                    amount_cents = EXCLUDED.amount_cents,
                    currency = EXCLUDED.currency,
                    status = EXCLUDED.status,
                    provider = EXCLUDED.provider,
                    product_id = EXCLUDED.product_id,
                    updated_at = EXCLUDED.updated_at
                WHERE $11
                "#,
            )
            .bind(payment.id)
            .bind(payment.user_id)
            .bind(&payment.transaction_id)
            .bind(payment.amount_cents)
            .bind(&payment.currency)
            .bind(payment.status.as_str())
            .bind(&payment.provider)
            .bind(&payment.product_id)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .bind(work.payment_seen.is_some())
            .execute(&mut *tx)
            .await?;
            if written.rows_affected() == 0 {
                return Ok(CommitOutcome::Stale);
            }
        }

        if let Some(subscription) = &work.subscription {
            let written = sqlx::query(
                r#"
                INSERT INTO subscriptions (
                    id, user_id, plan_id, status, external_customer_id, expires_at,
                    last_event_id, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (user_id) DO UPDATE SET
                    plan_id = EXCLUDED.plan_id,
                    status = EXCLUDED.status,
                    external_customer_id = EXCLUDED.external_customer_id,
                    expires_at = EXCLUDED.expires_at,
                    last_event_id = EXCLUDED.last_event_id,
                    updated_at = EXCLUDED.updated_at
                WHERE $10
                "#,
            )
            .bind(subscription.id)
            .bind(subscription.user_id)
            .bind(&subscription.plan_id)
            .bind(subscription.status.as_str())
            .bind(&subscription.external_customer_id)
            .bind(subscription.expires_at)
            .bind(&subscription.last_event_id)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .bind(work.subscription_seen.is_some())
            .execute(&mut *tx)
            .await?;
            if written.rows_affected() == 0 {
                return Ok(CommitOutcome::Stale);
            }
        }

        if let Some(grant) = &work.grant {
            sqlx::query(
                r#"
                INSERT INTO entitlement_grants (
                    id, user_id, kind, bot_type, quantity, source_event_id, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (source_event_id) DO NOTHING
                "#,
            )
            .bind(grant.id)
            .bind(grant.user_id)
            .bind(grant.kind.as_str())
            .bind(&grant.bot_type)
            .bind(grant.quantity)
            .bind(&grant.source_event_id)
            .bind(grant.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for entry in &work.audit {
            insert_audit_row(&mut *tx, entry).await?;
        }

        if work.mark_processed {
            sqlx::query(
                r#"
                UPDATE raw_events
                SET processing_status = 'PROCESSED', processed_at = NOW(), error = NULL
                WHERE provider_event_id = $1
                "#,
            )
            .bind(&work.event_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Applied)
    }
}

async fn insert_audit_row<'e, E>(executor: E, entry: &AuditLog) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_logs (
            id, actor, action, entity_type, entity_id, before, after, metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id)
    .bind(&entry.actor)
    .bind(&entry.action)
    .bind(&entry.entity_type)
    .bind(&entry.entity_id)
    .bind(&entry.before)
    .bind(&entry.after)
    .bind(&entry.metadata)
    .bind(entry.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_audit(&self, entry: AuditLog) -> BillingResult<()> {
        insert_audit_row(&self.pool, &entry).await?;
        Ok(())
    }

    async fn query_audit(&self, query: &AuditQuery) -> BillingResult<Vec<AuditLog>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, actor, action, entity_type, entity_id, before, after, metadata, created_at
            FROM audit_logs
            WHERE ($1::VARCHAR IS NULL OR entity_type = $1)
              AND ($2::VARCHAR IS NULL OR entity_id = $2)
              AND ($3::VARCHAR IS NULL OR actor = $3)
              AND ($4::VARCHAR IS NULL OR action = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR created_at <= $6)
            ORDER BY created_at DESC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(&query.entity_type)
        .bind(&query.entity_id)
        .bind(&query.actor)
        .bind(&query.action)
        .bind(query.from)
        .bind(query.to)
        .bind(query.page_limit())
        .bind(query.page_offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[async_trait]
impl ProductCatalog for PgStore {
    async fn find_mapping(
        &self,
        provider_product_id: &str,
    ) -> BillingResult<Option<ProductMapping>> {
        let mapping = sqlx::query_as(
            r#"
            SELECT provider_product_id, kind, plan_id, bot_type, quantity, duration_days
            FROM product_mappings
            WHERE provider_product_id = $1
            "#,
        )
        .bind(provider_product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn resolve_email(&self, email: &str) -> BillingResult<UserMatch> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE LOWER(email) = LOWER($1) LIMIT 2")
                .bind(email.trim())
                .fetch_all(&self.pool)
                .await?;

        Ok(match ids.as_slice() {
            [] => UserMatch::NotFound,
            [(id,)] => UserMatch::Found(*id),
            _ => UserMatch::Ambiguous,
        })
    }
}
