//! Datastore tables: catalog items, transmissions and reports.

use super::Db;
use crate::datastore::{CatalogItem, Datastore, ReportRecord, TransmissionRecord};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
impl Datastore for Db {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool()).await?;
        Ok(())
    }

    /// All items of one payload go in a single transaction.
    async fn store_catalog_items(&self, feed: &str, items: &[CatalogItem]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let mut written = 0;
        for item in items {
            let result = sqlx::query(
                "INSERT INTO catalog_items (feed, sku, data, updated_at)
                 VALUES ($1, $2, $3, now())
                 ON CONFLICT (feed, sku)
                 DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
            )
            .bind(feed)
            .bind(&item.sku)
            .bind(&item.data)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn record_transmission(&self, record: &TransmissionRecord) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            "INSERT INTO transmissions
                 (reference, worker, destination, status, attempts, response_code, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (reference) DO UPDATE SET
                 worker = EXCLUDED.worker,
                 destination = EXCLUDED.destination,
                 status = EXCLUDED.status,
                 attempts = EXCLUDED.attempts,
                 response_code = EXCLUDED.response_code,
                 recorded_at = EXCLUDED.recorded_at",
        )
        .bind(&record.reference)
        .bind(&record.worker)
        .bind(&record.destination)
        .bind(record.status.to_string())
        .bind(record.attempts as i32)
        .bind(i32::from(record.response_code))
        .bind(record.recorded_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn record_report(&self, report: &ReportRecord) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            "INSERT INTO reports (id, worker, items, recipients, dispatched_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(report.id)
        .bind(&report.worker)
        .bind(report.items as i64)
        .bind(&report.recipients)
        .bind(report.dispatched_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
