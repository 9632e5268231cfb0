//! Persistent deal ledger: identity-keyed upserts, append-only snapshots and
//! the expiry sweep, plus the scan cursor and chunk audit tables.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dealwatch_core::{
    CandidateDeal, CursorError, DealMetrics, DealRecord, DealSnapshot, DealStatus, ScanChunkResult,
    ScanCursor,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored cursor is unreadable: {0}")]
    Cursor(#[from] CursorError),
    #[error("encoding chunk errors: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// What reconciling one candidate did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// New identity: record plus initial snapshot.
    Created,
    /// Tracked metrics changed: record updated plus a new snapshot.
    Updated,
    /// Metrics unchanged; only scan time, status and descriptive fields refreshed.
    Refreshed,
}

impl ReconcileAction {
    pub fn snapshotted(self) -> bool {
        matches!(self, ReconcileAction::Created | ReconcileAction::Updated)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub snapshotted: usize,
    pub refreshed: usize,
    pub reactivated: usize,
}

#[derive(Debug, Clone)]
pub struct DealLedger {
    pool: SqlitePool,
}

impl DealLedger {
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` is its own database.
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fresh, migrated in-memory ledger.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let ledger = Self::connect("sqlite::memory:").await?;
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reconciles one candidate inside its own transaction.
    pub async fn reconcile_one(
        &self,
        candidate: &CandidateDeal,
        now: DateTime<Utc>,
    ) -> Result<(ReconcileAction, bool), LedgerError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT id, status, original_price, offer_price, discount_percent, units_sold \
             FROM deals WHERE source_site = ? AND source_url = ?",
        )
        .bind(&candidate.source_site)
        .bind(&candidate.source_url)
        .fetch_optional(&mut *tx)
        .await?;

        let (action, reactivated) = match existing {
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO deals (id, source_site, source_url, merchant_name, title, \
                     description, image_url, badge, original_price, offer_price, \
                     discount_percent, units_sold, status, first_seen_at, last_scanned_at, \
                     expires_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, NULL)",
                )
                .bind(id.to_string())
                .bind(&candidate.source_site)
                .bind(&candidate.source_url)
                .bind(&candidate.merchant_name)
                .bind(&candidate.title)
                .bind(&candidate.description)
                .bind(&candidate.image_url)
                .bind(&candidate.badge)
                .bind(candidate.original_price)
                .bind(candidate.offer_price)
                .bind(candidate.discount_percent)
                .bind(units_to_db(candidate.units_sold))
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                insert_snapshot(&mut tx, id, candidate.metrics(), now).await?;
                (ReconcileAction::Created, false)
            }
            Some(row) => {
                let id = parse_id(row.try_get("id")?)?;
                let status = parse_status(row.try_get("status")?)?;
                let stored = DealMetrics {
                    original_price: row.try_get("original_price")?,
                    offer_price: row.try_get("offer_price")?,
                    discount_percent: row.try_get("discount_percent")?,
                    units_sold: units_from_db(row.try_get("units_sold")?)?,
                };
                // An absent metric was not observed this scan (e.g. its detail
                // page failed); the stored value stands.
                let merged = candidate.metrics().or_stored(&stored);
                let changed = stored != merged;

                sqlx::query(
                    "UPDATE deals SET merchant_name = ?, title = ?, \
                     description = COALESCE(?, description), image_url = COALESCE(?, image_url), \
                     badge = ?, original_price = ?, offer_price = ?, discount_percent = ?, \
                     units_sold = ?, status = 'active', last_scanned_at = ?, expires_at = NULL \
                     WHERE id = ?",
                )
                .bind(&candidate.merchant_name)
                .bind(&candidate.title)
                .bind(&candidate.description)
                .bind(&candidate.image_url)
                .bind(&candidate.badge)
                .bind(merged.original_price)
                .bind(merged.offer_price)
                .bind(merged.discount_percent)
                .bind(units_to_db(merged.units_sold))
                .bind(now)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;

                let action = if changed {
                    insert_snapshot(&mut tx, id, merged, now).await?;
                    ReconcileAction::Updated
                } else {
                    ReconcileAction::Refreshed
                };
                (action, status == DealStatus::Expired)
            }
        };

        tx.commit().await?;
        if reactivated {
            info!(
                site = %candidate.source_site,
                url = %candidate.source_url,
                "expired deal reappeared; reactivated"
            );
        }
        Ok((action, reactivated))
    }

    pub async fn reconcile(
        &self,
        candidates: &[CandidateDeal],
    ) -> Result<ReconcileOutcome, LedgerError> {
        let mut outcome = ReconcileOutcome::default();
        for candidate in candidates {
            let (action, reactivated) = self.reconcile_one(candidate, Utc::now()).await?;
            match action {
                ReconcileAction::Created => outcome.created += 1,
                ReconcileAction::Updated => outcome.updated += 1,
                ReconcileAction::Refreshed => outcome.refreshed += 1,
            }
            if action.snapshotted() {
                outcome.snapshotted += 1;
            }
            if reactivated {
                outcome.reactivated += 1;
            }
        }
        Ok(outcome)
    }

    /// Expires every active record of `site` whose identity is not in
    /// `observed`. An empty observed set is treated as "nothing was
    /// enumerated" and never expires anything.
    pub async fn sweep_expired(
        &self,
        site: &str,
        observed: &BTreeSet<String>,
    ) -> Result<usize, LedgerError> {
        if observed.is_empty() {
            debug!(site, "empty observed set; sweep skipped");
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let active = sqlx::query(
            "SELECT id, source_url FROM deals WHERE source_site = ? AND status = 'active'",
        )
        .bind(site)
        .fetch_all(&mut *tx)
        .await?;

        let mut expired = 0usize;
        for row in active {
            let url: String = row.try_get("source_url")?;
            if observed.contains(&url) {
                continue;
            }
            let id: String = row.try_get("id")?;
            sqlx::query("UPDATE deals SET status = 'expired', expires_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            expired += 1;
        }
        tx.commit().await?;

        info!(site, observed = observed.len(), expired, "expiry sweep finished");
        Ok(expired)
    }

    pub async fn find(
        &self,
        site: &str,
        source_url: &str,
    ) -> Result<Option<DealRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM deals WHERE source_site = ? AND source_url = ?")
            .bind(site)
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn records_for(&self, site: &str) -> Result<Vec<DealRecord>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM deals WHERE source_site = ? ORDER BY first_seen_at, source_url",
        )
        .bind(site)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Oldest first.
    pub async fn snapshots_for(&self, deal_id: Uuid) -> Result<Vec<DealSnapshot>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM deal_snapshots WHERE deal_id = ? ORDER BY captured_at, rowid",
        )
        .bind(deal_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DealSnapshot {
                    id: parse_id(row.try_get("id")?)?,
                    deal_id: parse_id(row.try_get("deal_id")?)?,
                    original_price: row.try_get("original_price")?,
                    offer_price: row.try_get("offer_price")?,
                    discount_percent: row.try_get("discount_percent")?,
                    units_sold: units_from_db(row.try_get("units_sold")?)?,
                    captured_at: row.try_get("captured_at")?,
                })
            })
            .collect()
    }

    pub async fn count_records(
        &self,
        site: Option<&str>,
        status: Option<DealStatus>,
    ) -> Result<usize, LedgerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deals \
             WHERE (?1 IS NULL OR source_site = ?1) AND (?2 IS NULL OR status = ?2)",
        )
        .bind(site)
        .bind(status.map(DealStatus::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    pub async fn count_snapshots(&self) -> Result<usize, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deal_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn active_identities(&self, site: &str) -> Result<BTreeSet<String>, LedgerError> {
        let urls: Vec<String> = sqlx::query_scalar(
            "SELECT source_url FROM deals WHERE source_site = ? AND status = 'active'",
        )
        .bind(site)
        .fetch_all(&self.pool)
        .await?;
        Ok(urls.into_iter().collect())
    }

    pub async fn save_cursor(&self, cursor: &ScanCursor) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO scan_cursors (source, cursor, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (source) DO UPDATE \
             SET cursor = excluded.cursor, updated_at = excluded.updated_at",
        )
        .bind(&cursor.source)
        .bind(cursor.encode()?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_cursor(&self, source: &str) -> Result<Option<ScanCursor>, LedgerError> {
        let token: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM scan_cursors WHERE source = ?")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?;
        Ok(token.as_deref().map(ScanCursor::decode).transpose()?)
    }

    pub async fn clear_cursor(&self, source: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM scan_cursors WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_chunk(&self, chunk: &ScanChunkResult) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO scan_chunks (id, source, started_at, finished_at, processed, created, \
             updated, snapshotted, expired, is_complete, swept, errors) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&chunk.source)
        .bind(chunk.started_at)
        .bind(chunk.finished_at)
        .bind(chunk.processed as i64)
        .bind(chunk.created as i64)
        .bind(chunk.updated as i64)
        .bind(chunk.snapshotted as i64)
        .bind(chunk.expired as i64)
        .bind(chunk.is_complete)
        .bind(chunk.swept)
        .bind(serde_json::to_string(&chunk.errors)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chunk_count(&self, source: &str) -> Result<usize, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_chunks WHERE source = ?")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

async fn insert_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    deal_id: Uuid,
    metrics: DealMetrics,
    captured_at: DateTime<Utc>,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO deal_snapshots (id, deal_id, original_price, offer_price, discount_percent, \
         units_sold, captured_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(deal_id.to_string())
    .bind(metrics.original_price)
    .bind(metrics.offer_price)
    .bind(metrics.discount_percent)
    .bind(units_to_db(metrics.units_sold))
    .bind(captured_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<DealRecord, LedgerError> {
    Ok(DealRecord {
        id: parse_id(row.try_get("id")?)?,
        source_site: row.try_get("source_site")?,
        source_url: row.try_get("source_url")?,
        merchant_name: row.try_get("merchant_name")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        image_url: row.try_get("image_url")?,
        badge: row.try_get("badge")?,
        original_price: row.try_get("original_price")?,
        offer_price: row.try_get("offer_price")?,
        discount_percent: row.try_get("discount_percent")?,
        units_sold: units_from_db(row.try_get("units_sold")?)?,
        status: parse_status(row.try_get("status")?)?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_scanned_at: row.try_get("last_scanned_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn parse_id(raw: String) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(&raw).map_err(|err| LedgerError::Corrupt(format!("bad id `{raw}`: {err}")))
}

fn parse_status(raw: String) -> Result<DealStatus, LedgerError> {
    raw.parse().map_err(|err: dealwatch_core::UnknownStatus| LedgerError::Corrupt(err.to_string()))
}

fn units_to_db(units: Option<u64>) -> Option<i64> {
    units.map(|u| i64::try_from(u).unwrap_or(i64::MAX))
}

fn units_from_db(units: Option<i64>) -> Result<Option<u64>, LedgerError> {
    units
        .map(|u| {
            u64::try_from(u).map_err(|_| LedgerError::Corrupt(format!("negative units_sold {u}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str, offer: f64, sold: u64) -> CandidateDeal {
        CandidateDeal {
            source_site: "snapbuy".into(),
            source_url: url.into(),
            merchant_name: "Ippudo".into(),
            title: "Ramen Set".into(),
            original_price: Some(20.0),
            offer_price: Some(offer),
            discount_percent: None,
            units_sold: Some(sold),
            image_url: None,
            badge: None,
            description: None,
        }
    }

    fn observed(urls: &[&str]) -> BTreeSet<String> {
        urls.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn first_sight_creates_record_and_initial_snapshot() {
        let ledger = DealLedger::in_memory().await.unwrap();
        let outcome = ledger.reconcile(&[candidate("https://s.test/a", 12.0, 5)]).await.unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.snapshotted, 1);

        let record = ledger.find("snapbuy", "https://s.test/a").await.unwrap().unwrap();
        assert_eq!(record.status, DealStatus::Active);
        assert_eq!(record.units_sold, Some(5));
        assert_eq!(record.expires_at, None);
        let snapshots = ledger.snapshots_for(record.id).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].offer_price, Some(12.0));
    }

    #[tokio::test]
    async fn unchanged_rescan_refreshes_without_snapshot() {
        let ledger = DealLedger::in_memory().await.unwrap();
        let deal = candidate("https://s.test/a", 12.0, 5);
        ledger.reconcile(std::slice::from_ref(&deal)).await.unwrap();
        let before = ledger.find("snapbuy", &deal.source_url).await.unwrap().unwrap();

        let outcome = ledger.reconcile(std::slice::from_ref(&deal)).await.unwrap();
        assert_eq!(outcome.refreshed, 1);
        assert_eq!(outcome.snapshotted, 0);

        let after = ledger.find("snapbuy", &deal.source_url).await.unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert!(after.last_scanned_at >= before.last_scanned_at);
        assert_eq!(ledger.snapshots_for(after.id).await.unwrap().len(), 1);
        assert_eq!(ledger.count_records(None, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn changed_metric_updates_and_snapshots() {
        let ledger = DealLedger::in_memory().await.unwrap();
        ledger.reconcile(&[candidate("https://s.test/a", 12.0, 5)]).await.unwrap();
        let outcome = ledger.reconcile(&[candidate("https://s.test/a", 12.0, 9)]).await.unwrap();
        assert_eq!(outcome.updated, 1);

        let record = ledger.find("snapbuy", "https://s.test/a").await.unwrap().unwrap();
        assert_eq!(record.units_sold, Some(9));
        let snapshots = ledger.snapshots_for(record.id).await.unwrap();
        let sold: Vec<_> = snapshots.iter().map(|s| s.units_sold).collect();
        assert_eq!(sold, vec![Some(5), Some(9)]);
    }

    #[tokio::test]
    async fn missing_metric_keeps_the_stored_value_without_a_snapshot() {
        let ledger = DealLedger::in_memory().await.unwrap();
        let url = "https://localfeast.test/offer/sushi";
        ledger.reconcile(&[candidate(url, 44.0, 1100)]).await.unwrap();

        // the detail page carrying the sold count failed this time
        let mut partial = candidate(url, 44.0, 0);
        partial.units_sold = None;
        let outcome = ledger.reconcile(&[partial]).await.unwrap();
        assert_eq!(outcome.refreshed, 1);
        assert_eq!(outcome.snapshotted, 0);
        let record = ledger.find("snapbuy", url).await.unwrap().unwrap();
        assert_eq!(record.units_sold, Some(1100));

        ledger.reconcile(&[candidate(url, 44.0, 1100)]).await.unwrap();
        let snapshots = ledger.snapshots_for(record.id).await.unwrap();
        assert_eq!(snapshots.iter().map(|s| s.units_sold).collect::<Vec<_>>(), vec![Some(1100)]);

        // a metric that is present and different still snapshots
        let outcome = ledger.reconcile(&[candidate(url, 39.0, 1100)]).await.unwrap();
        assert_eq!(outcome.updated, 1);
    }

    #[tokio::test]
    async fn sweep_expires_only_unobserved_active_records() {
        let ledger = DealLedger::in_memory().await.unwrap();
        let both = [candidate("https://s.test/a", 1.0, 1), candidate("https://s.test/b", 1.0, 1)];
        ledger.reconcile(&both).await.unwrap();

        assert_eq!(ledger.sweep_expired("snapbuy", &BTreeSet::new()).await.unwrap(), 0);
        let active = ledger.count_records(Some("snapbuy"), Some(DealStatus::Active)).await;
        assert_eq!(active.unwrap(), 2);

        let only_a = observed(&["https://s.test/a"]);
        let expired = ledger.sweep_expired("snapbuy", &only_a).await.unwrap();
        assert_eq!(expired, 1);
        let gone = ledger.find("snapbuy", "https://s.test/b").await.unwrap().unwrap();
        assert_eq!(gone.status, DealStatus::Expired);
        assert!(gone.expires_at.is_some());
        assert_eq!(ledger.active_identities("snapbuy").await.unwrap(), only_a);

        // a second sweep does not touch already-expired rows
        assert_eq!(ledger.sweep_expired("snapbuy", &only_a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reappearing_identity_reactivates_the_same_record() {
        let ledger = DealLedger::in_memory().await.unwrap();
        ledger.reconcile(&[candidate("https://s.test/b", 1.0, 1)]).await.unwrap();
        let original = ledger.find("snapbuy", "https://s.test/b").await.unwrap().unwrap();
        ledger.sweep_expired("snapbuy", &observed(&["https://s.test/other"])).await.unwrap();

        let outcome = ledger.reconcile(&[candidate("https://s.test/b", 1.0, 1)]).await.unwrap();
        assert_eq!(outcome.reactivated, 1);
        assert_eq!(outcome.created, 0);
        let revived = ledger.find("snapbuy", "https://s.test/b").await.unwrap().unwrap();
        assert_eq!(revived.id, original.id);
        assert_eq!(revived.status, DealStatus::Active);
        assert_eq!(revived.expires_at, None);
    }

    #[tokio::test]
    async fn cursors_persist_and_clear() {
        let ledger = DealLedger::in_memory().await.unwrap();
        assert!(ledger.load_cursor("snapbuy").await.unwrap().is_none());

        let mut cursor = ScanCursor::start("snapbuy").advanced(40);
        cursor.observed.insert("https://s.test/a".into());
        ledger.save_cursor(&cursor).await.unwrap();
        ledger.save_cursor(&cursor.advanced(10)).await.unwrap();

        let loaded = ledger.load_cursor("snapbuy").await.unwrap().unwrap();
        assert_eq!(loaded.offset, 50);
        assert_eq!(loaded.observed.len(), 1);

        ledger.clear_cursor("snapbuy").await.unwrap();
        assert!(ledger.load_cursor("snapbuy").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_results_are_audited() {
        let ledger = DealLedger::in_memory().await.unwrap();
        let mut chunk = ScanChunkResult::empty("snapbuy", Utc::now());
        chunk.processed = 3;
        ledger.record_chunk(&chunk).await.unwrap();
        ledger.record_chunk(&chunk).await.unwrap();
        assert_eq!(ledger.chunk_count("snapbuy").await.unwrap(), 2);
    }
}
