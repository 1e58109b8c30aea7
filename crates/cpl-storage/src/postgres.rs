use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpl_core::{EventRecord, TextTerm};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::{
    tickets_column, EventFilter, EventStore, IndexEntry, RankedEvent, StoreConfig, StoreError, StoreResult,
    StoreTransaction, YearIndex,
};

pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id          TEXT PRIMARY KEY,
        category          TEXT NOT NULL,
        year              INTEGER NOT NULL,
        active            BOOLEAN NOT NULL DEFAULT TRUE,
        title             TEXT NOT NULL,
        short_description TEXT NOT NULL DEFAULT '',
        long_description  TEXT NOT NULL DEFAULT '',
        event_type        TEXT NOT NULL DEFAULT '',
        game_system       TEXT NOT NULL DEFAULT '',
        short_category    TEXT NOT NULL DEFAULT '',
        cluster_key       TEXT NOT NULL DEFAULT '',
        start_time        TIMESTAMPTZ NOT NULL,
        duration          INTEGER NOT NULL,
        end_time          TIMESTAMPTZ NOT NULL,
        location          TEXT NOT NULL DEFAULT '',
        room_name         TEXT NOT NULL DEFAULT '',
        table_number      TEXT NOT NULL DEFAULT '',
        tickets_available INTEGER NOT NULL DEFAULT 0 CHECK (tickets_available >= 0),
        last_modified     TIMESTAMPTZ NOT NULL,
        title_tsv         TSVECTOR GENERATED ALWAYS AS (to_tsvector('english', title)) STORED,
        search_key        TSVECTOR GENERATED ALWAYS AS (
            to_tsvector('english',
                title || ' ' || short_description || ' ' || long_description || ' ' ||
                event_type || ' ' || game_system || ' ' || location || ' ' || room_name)
        ) STORED
    )
    "#,
    "CREATE INDEX IF NOT EXISTS events_year_active_idx ON events (year, active)",
    "CREATE INDEX IF NOT EXISTS events_year_category_idx ON events (year, short_category)",
    "CREATE INDEX IF NOT EXISTS events_search_key_idx ON events USING GIN (search_key)",
];

const EVENT_COLUMNS: &str = "event_id, category, year, active, title, short_description, \
    long_description, event_type, game_system, short_category, cluster_key, start_time, \
    duration, end_time, location, room_name, table_number, tickets_available, last_modified";

pub const EVENT_COLUMN_COUNT: usize = 19;

/// Most rows one multi-row insert can carry under the protocol's limit of
/// 65535 bind parameters per statement.
pub const MAX_BATCH_ROWS: usize = u16::MAX as usize / EVENT_COLUMN_COUNT;

const UPSERT_ASSIGNMENTS: &str = " ON CONFLICT (event_id) DO UPDATE SET \
    category = EXCLUDED.category, year = EXCLUDED.year, active = EXCLUDED.active, \
    title = EXCLUDED.title, short_description = EXCLUDED.short_description, \
    long_description = EXCLUDED.long_description, event_type = EXCLUDED.event_type, \
    game_system = EXCLUDED.game_system, short_category = EXCLUDED.short_category, \
    cluster_key = EXCLUDED.cluster_key, start_time = EXCLUDED.start_time, \
    duration = EXCLUDED.duration, end_time = EXCLUDED.end_time, location = EXCLUDED.location, \
    room_name = EXCLUDED.room_name, table_number = EXCLUDED.table_number, \
    tickets_available = EXCLUDED.tickets_available, last_modified = EXCLUDED.last_modified";

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|err| StoreError::Unavailable(format!("connecting to database: {err}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = SCHEMA_STATEMENTS.len(), "event schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unavailable(format!("opening transaction: {err}")))?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }

    async fn load_events(&self, filter: &EventFilter) -> StoreResult<Vec<EventRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder
            .push(EVENT_COLUMNS)
            .push(" FROM events WHERE year = ")
            .push_bind(filter.year);
        if !filter.include_inactive {
            builder.push(" AND active");
        }
        if let Some(category) = &filter.short_category {
            builder.push(" AND short_category = ").push_bind(category.clone());
        }
        builder.push(" ORDER BY start_time, event_id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn rank_events(&self, year: i32, terms: &[TextTerm]) -> StoreResult<Vec<RankedEvent>> {
        let terms: Vec<&TextTerm> = terms.iter().filter(|t| !t.text.trim().is_empty()).collect();
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder.push(EVENT_COLUMNS);
        if terms.is_empty() {
            builder
                .push(", 1.0::real AS title_rank, 1.0::real AS search_rank FROM events WHERE active AND year = ")
                .push_bind(year);
        } else {
            builder.push(
                ", ts_rank(title_tsv, q.query) AS title_rank, ts_rank(search_key, q.query) AS search_rank \
                 FROM events, (SELECT ",
            );
            push_tsquery(&mut builder, &terms);
            builder
                .push(" AS query) AS q WHERE active AND year = ")
                .push_bind(year)
                .push(" AND search_key @@ q.query");
        }
        builder.push(" ORDER BY start_time, event_id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        debug!(year, terms = terms.len(), matched = rows.len(), "ranked event lookup");
        rows.iter()
            .map(|row| -> StoreResult<RankedEvent> {
                Ok(RankedEvent {
                    event: event_from_row(row)?,
                    title_rank: row.try_get("title_rank")?,
                    search_rank: row.try_get("search_rank")?,
                })
            })
            .collect()
    }
}

/// Appends a tsquery expression built from `terms`. Each term is bound as a
/// parameter and parsed with `phraseto_tsquery`, so user text never reaches
/// the tsquery grammar.
pub fn push_tsquery<'args>(builder: &mut QueryBuilder<'args, Postgres>, terms: &[&TextTerm]) {
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            builder.push(" && ");
        }
        if term.negated {
            builder.push("(!! phraseto_tsquery('english', ");
            builder.push_bind(term.text.clone());
            builder.push("))");
        } else {
            builder.push("phraseto_tsquery('english', ");
            builder.push_bind(term.text.clone());
            builder.push(")");
        }
    }
}

struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTransaction {
    async fn write_rows(&mut self, records: &[EventRecord], upsert: bool) -> StoreResult<()> {
        let tickets = records
            .iter()
            .map(tickets_column)
            .collect::<StoreResult<Vec<i32>>>()?;
        for (rows, tickets) in records.chunks(MAX_BATCH_ROWS).zip(tickets.chunks(MAX_BATCH_ROWS)) {
            let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO events (");
            builder.push(EVENT_COLUMNS).push(") ");
            builder.push_values(rows.iter().zip(tickets), |mut b, (event, &tickets)| {
                b.push_bind(event.id.as_str())
                    .push_bind(event.category.as_str())
                    .push_bind(event.year)
                    .push_bind(event.active)
                    .push_bind(event.title.as_str())
                    .push_bind(event.short_description.as_str())
                    .push_bind(event.long_description.as_str())
                    .push_bind(event.event_type.as_str())
                    .push_bind(event.game_system.as_str())
                    .push_bind(event.short_category.as_str())
                    .push_bind(event.cluster_key.as_str())
                    .push_bind(event.start_time)
                    .push_bind(event.duration_minutes)
                    .push_bind(event.end_time)
                    .push_bind(event.location.as_str())
                    .push_bind(event.room_name.as_str())
                    .push_bind(event.table_number.as_str())
                    .push_bind(tickets)
                    .push_bind(event.last_modified);
            });
            if upsert {
                builder.push(UPSERT_ASSIGNMENTS);
            }
            builder.build().execute(&mut *self.tx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn read_year_index(&mut self, year: i32) -> StoreResult<YearIndex> {
        let rows = sqlx::query("SELECT event_id, active, last_modified FROM events WHERE year = $1")
            .bind(year)
            .fetch_all(&mut *self.tx)
            .await?;

        let mut index = YearIndex::new();
        for row in rows {
            let id: String = row.try_get("event_id")?;
            let active: bool = row.try_get("active")?;
            let last_modified: DateTime<Utc> = row.try_get("last_modified")?;
            index.insert(id, IndexEntry { active, last_modified });
        }
        Ok(index)
    }

    async fn batch_insert(&mut self, records: &[EventRecord]) -> StoreResult<()> {
        self.write_rows(records, false).await
    }

    async fn batch_update(&mut self, records: &[EventRecord]) -> StoreResult<()> {
        self.write_rows(records, true).await
    }

    async fn batch_deactivate(&mut self, ids: &[String]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE events SET active = FALSE WHERE active AND event_id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> StoreResult<EventRecord> {
    let id: String = row.try_get("event_id")?;
    let tickets: i32 = row.try_get("tickets_available")?;
    let tickets_available = u32::try_from(tickets).map_err(|_| StoreError::CorruptRow {
        id: id.clone(),
        reason: format!("negative ticket count {tickets}"),
    })?;

    Ok(EventRecord {
        category: row.try_get("category")?,
        year: row.try_get("year")?,
        active: row.try_get("active")?,
        title: row.try_get("title")?,
        short_description: row.try_get("short_description")?,
        long_description: row.try_get("long_description")?,
        event_type: row.try_get("event_type")?,
        game_system: row.try_get("game_system")?,
        short_category: row.try_get("short_category")?,
        cluster_key: row.try_get("cluster_key")?,
        start_time: row.try_get("start_time")?,
        duration_minutes: row.try_get("duration")?,
        end_time: row.try_get("end_time")?,
        location: row.try_get("location")?,
        room_name: row.try_get("room_name")?,
        table_number: row.try_get("table_number")?,
        tickets_available,
        last_modified: row.try_get("last_modified")?,
        id,
    })
}
