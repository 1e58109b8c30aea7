//! Snapshot reconciliation: classify an incoming catalog snapshot against the
//! stored year and apply inserts, updates and deactivations atomically.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cpl_catalog::{source_for_location, BackoffPolicy, CatalogError, CatalogSource, HttpClientConfig};
use cpl_core::{EventRecord, IdentityError};
use cpl_storage::{
    EventStore, PgEventStore, StoreConfig, StoreError, StoreTransaction, YearIndex, MAX_BATCH_ROWS,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpl-sync";

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("malformed record at position {index}: {reason}")]
    MalformedRecord {
        index: usize,
        id: Option<String>,
        reason: String,
    },
    #[error("event {id} belongs to {found} but the snapshot is for {expected}")]
    YearMismatch { id: String, expected: i32, found: i32 },
    #[error("snapshot is empty and no year was given")]
    EmptySnapshot,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Ids touched by one reconciliation, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub year: i32,
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub deactivated: Vec<String>,
    pub latest_modified: Option<DateTime<Utc>>,
}

/// Writes a reconciliation would perform, before any of them are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePlan {
    pub inserts: Vec<EventRecord>,
    pub updates: Vec<EventRecord>,
    pub deactivations: Vec<String>,
}

/// Validates and normalizes a snapshot for `snapshot_year`. Any bad row is
/// fatal. Duplicate ids keep the later row in the earlier row's position.
pub fn prepare_records(
    snapshot_year: i32,
    incoming: Vec<EventRecord>,
) -> Result<Vec<EventRecord>, SyncError> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(incoming.len());
    let mut prepared: Vec<EventRecord> = Vec::with_capacity(incoming.len());

    for (index, mut record) in incoming.into_iter().enumerate() {
        if record.id.trim().is_empty() {
            return Err(SyncError::MalformedRecord {
                index,
                id: None,
                reason: "missing event id".to_string(),
            });
        }
        record.stamp_identity()?;
        if record.year != snapshot_year {
            return Err(SyncError::YearMismatch {
                id: record.id,
                expected: snapshot_year,
                found: record.year,
            });
        }
        if !record.has_consistent_end_time() {
            return Err(SyncError::MalformedRecord {
                index,
                reason: format!(
                    "end time {} is not {} minutes after {}",
                    record.end_time, record.duration_minutes, record.start_time
                ),
                id: Some(record.id),
            });
        }
        if !record.has_storable_ticket_count() {
            return Err(SyncError::MalformedRecord {
                index,
                reason: format!("ticket count {} is out of range", record.tickets_available),
                id: Some(record.id),
            });
        }
        record.active = true;

        match positions.get(&record.id) {
            Some(&position) => {
                warn!(id = %record.id, "duplicate event id in snapshot, keeping the later row");
                prepared[position] = record;
            }
            None => {
                positions.insert(record.id.clone(), prepared.len());
                prepared.push(record);
            }
        }
    }
    Ok(prepared)
}

/// Classifies `incoming` against the stored index of its year.
pub fn plan_changes(index: &YearIndex, incoming: Vec<EventRecord>) -> ChangePlan {
    let mut previously_active: BTreeSet<&str> = index
        .iter()
        .filter(|(_, entry)| entry.active)
        .map(|(id, _)| id.as_str())
        .collect();

    let mut plan = ChangePlan::default();
    for record in incoming {
        if index.contains_key(&record.id) {
            previously_active.remove(record.id.as_str());
            plan.updates.push(record);
        } else {
            plan.inserts.push(record);
        }
    }
    plan.deactivations = previously_active.into_iter().map(str::to_string).collect();
    plan
}

pub struct Reconciler<'a> {
    store: &'a dyn EventStore,
    batch_size: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn EventStore) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Rows per write, held between 1 and the most rows one statement can bind.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_ROWS);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Applies `incoming` as the complete catalog of `snapshot_year` in one
    /// transaction. On any error the store is left as it was.
    pub async fn reconcile(
        &self,
        snapshot_year: i32,
        incoming: Vec<EventRecord>,
    ) -> Result<ReconcileOutcome, SyncError> {
        let incoming = prepare_records(snapshot_year, incoming)?;
        if incoming.is_empty() {
            warn!(year = snapshot_year, "empty snapshot, every active event will be deactivated");
        }

        let mut tx = self.store.begin().await?;
        match self.apply(tx.as_mut(), snapshot_year, incoming).await {
            Ok(outcome) => {
                tx.commit().await?;
                info!(
                    year = snapshot_year,
                    inserted = outcome.inserted.len(),
                    updated = outcome.updated.len(),
                    deactivated = outcome.deactivated.len(),
                    "reconciliation committed"
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed reconciliation also failed");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn StoreTransaction,
        year: i32,
        incoming: Vec<EventRecord>,
    ) -> Result<ReconcileOutcome, SyncError> {
        let index = tx.read_year_index(year).await?;
        info!(year, stored = index.len(), incoming = incoming.len(), "loaded year index");

        let latest_modified = incoming.iter().map(|r| r.last_modified).max();
        let plan = plan_changes(&index, incoming);

        for batch in plan.inserts.chunks(self.batch_size) {
            tx.batch_insert(batch).await?;
        }
        for batch in plan.updates.chunks(self.batch_size) {
            tx.batch_update(batch).await?;
        }
        for batch in plan.deactivations.chunks(self.batch_size) {
            tx.batch_deactivate(batch).await?;
        }

        let sorted_ids = |records: &[EventRecord]| {
            let mut ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            ids.sort();
            ids
        };
        Ok(ReconcileOutcome {
            year,
            inserted: sorted_ids(&plan.inserts),
            updated: sorted_ids(&plan.updates),
            deactivated: plan.deactivations,
            latest_modified,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub snapshot_location: String,
    pub snapshot_year: Option<i32>,
    pub batch_size: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig::from_env(),
            snapshot_location: std::env::var("CPL_SNAPSHOT_SOURCE")
                .unwrap_or_else(|_| "./fixtures/catalog/2018/snapshot.json".to_string()),
            snapshot_year: std::env::var("CPL_SNAPSHOT_YEAR")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            batch_size: std::env::var("CPL_SYNC_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|size| size.clamp(1, MAX_BATCH_ROWS))
                .unwrap_or(DEFAULT_BATCH_SIZE),
            user_agent: std::env::var("CPL_USER_AGENT")
                .unwrap_or_else(|_| "cpl-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("CPL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub origin: String,
    pub snapshot_digest: String,
    pub published_at: Option<DateTime<Utc>>,
    pub year: i32,
    pub inserted: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub latest_modified: Option<DateTime<Utc>>,
}

/// Fetches one snapshot from `source` and reconciles it. The year comes from
/// `snapshot_year`, then the snapshot document, then the first record's id.
pub async fn run_sync(
    store: &dyn EventStore,
    source: &dyn CatalogSource,
    snapshot_year: Option<i32>,
    batch_size: usize,
) -> Result<SyncRunSummary, SyncError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("sync_run", %run_id, origin = %source.origin());
    sync_snapshot(store, source, snapshot_year, batch_size, run_id)
        .instrument(span)
        .await
}

async fn sync_snapshot(
    store: &dyn EventStore,
    source: &dyn CatalogSource,
    snapshot_year: Option<i32>,
    batch_size: usize,
    run_id: Uuid,
) -> Result<SyncRunSummary, SyncError> {
    let started_at = Utc::now();
    let snapshot = source.fetch().await?;
    let origin = snapshot.origin.clone();
    let digest = snapshot.digest.clone();
    let published_at = snapshot.published_at;
    let declared_year = snapshot_year.or(snapshot.year);
    let records = snapshot.into_records()?;

    let year = match declared_year {
        Some(year) => year,
        None => records.first().map(|r| r.year).ok_or(SyncError::EmptySnapshot)?,
    };

    let outcome = Reconciler::new(store)
        .with_batch_size(batch_size)
        .reconcile(year, records)
        .await?;

    Ok(SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        origin,
        snapshot_digest: digest,
        published_at,
        year,
        inserted: outcome.inserted.len(),
        updated: outcome.updated.len(),
        deactivated: outcome.deactivated.len(),
        latest_modified: outcome.latest_modified,
    })
}

pub async fn run_sync_with_config(config: &SyncConfig) -> anyhow::Result<SyncRunSummary> {
    let store = PgEventStore::connect(&config.store)
        .await
        .context("connecting to event store")?;
    let source = source_for_location(&config.snapshot_location, config.http_client_config())
        .with_context(|| format!("preparing catalog source {}", config.snapshot_location))?;
    run_sync(&store, source.as_ref(), config.snapshot_year, config.batch_size)
        .await
        .with_context(|| format!("syncing snapshot {}", config.snapshot_location))
}

pub async fn run_sync_once_from_env() -> anyhow::Result<SyncRunSummary> {
    run_sync_with_config(&SyncConfig::from_env()).await
}
