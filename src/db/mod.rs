//! Persistence for everything needed to resume after a restart.
//!
//! Stores:
//! - Raw messages and candidate transitions (append-only)
//! - Validation verdicts (append-only)
//! - Trade intents and their legs, per owner (primary or follower id)
//! - The replication log and follower offsets
//! - Daily risk state
//!
//! Records are written as the pipeline runs and read back only on restart.

mod memory;

pub use memory::MemoryRepository;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    CandidateSignal, DailyRiskState, EventId, MergeState, RawMessage, ReplicationEvent,
    TradeIntent, ValidatedSignal,
};

/// Owner name used for the primary's own intents.
pub const PRIMARY: &str = "primary";

#[async_trait]
pub trait Repository: Send + Sync {
    async fn record_message(&self, message: &RawMessage) -> Result<()>;

    async fn record_candidate(&self, candidate: &CandidateSignal) -> Result<()>;

    async fn record_verdict(&self, verdict: &ValidatedSignal) -> Result<()>;

    /// Insert or replace the current state of an intent.
    async fn record_intent(&self, owner: &str, intent: &TradeIntent) -> Result<()>;

    async fn record_event(&self, event: &ReplicationEvent) -> Result<()>;

    /// Store a follower's acknowledged offset. Offsets never move backwards.
    async fn record_offset(&self, follower: &str, acked: EventId) -> Result<()>;

    async fn record_daily_risk(&self, state: &DailyRiskState) -> Result<()>;

    /// Whole replication log in id order.
    async fn load_events(&self) -> Result<Vec<ReplicationEvent>>;

    async fn load_offsets(&self) -> Result<Vec<(String, EventId)>>;

    async fn load_intents(&self, owner: &str) -> Result<Vec<TradeIntent>>;

    /// Latest state of every message still collecting edits.
    async fn load_collecting_candidates(&self) -> Result<Vec<CandidateSignal>>;

    async fn load_daily_risk(&self, date: NaiveDate) -> Result<Option<DailyRiskState>>;
}

/// SQLite connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored intent row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredIntent {
    pub owner: String,
    pub id: String,
    pub symbol: String,
    pub status: String,
    pub body: String,
    pub updated_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // every connection to ":memory:" opens its own empty database
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Inbound messages, one row per edit
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                edit_seq INTEGER NOT NULL,
                text TEXT NOT NULL,
                received_at TEXT NOT NULL,
                UNIQUE(channel_id, message_id, edit_seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Candidate transitions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidate_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                edit_seq INTEGER NOT NULL,
                merge_state TEXT NOT NULL,
                confidence REAL NOT NULL,
                body TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Validation verdicts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS verdicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                accepted INTEGER NOT NULL,
                reason TEXT,
                body TEXT NOT NULL,
                validated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Trade intents, current state per owner
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_intents (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (owner, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Replication log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_events (
                id INTEGER PRIMARY KEY,
                intent_id TEXT NOT NULL,
                leg INTEGER,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                emitted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Follower offsets
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS follower_offsets (
                follower TEXT PRIMARY KEY,
                acked INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Daily risk state
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_risk (
                date TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_candidates_source ON candidate_transitions(channel_id, message_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_intent ON replication_events(intent_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Stored intent rows of every owner, most recently updated first.
    pub async fn intent_rows(&self) -> Result<Vec<StoredIntent>> {
        sqlx::query_as::<_, StoredIntent>("SELECT * FROM trade_intents ORDER BY owner, updated_at DESC")
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch intents")
    }
}

#[async_trait]
impl Repository for Database {
    // ==================== Signals ====================

    async fn record_message(&self, message: &RawMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO raw_messages (channel_id, message_id, edit_seq, text, received_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.channel_id)
        .bind(message.message_id)
        .bind(message.edit_seq as i64)
        .bind(&message.text)
        .bind(message.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_candidate(&self, candidate: &CandidateSignal) -> Result<()> {
        let body = serde_json::to_string(candidate)?;
        sqlx::query(
            r#"
            INSERT INTO candidate_transitions (channel_id, message_id, edit_seq, merge_state, confidence, body)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(candidate.source.channel_id)
        .bind(candidate.source.message_id)
        .bind(candidate.edit_seq as i64)
        .bind(candidate.merge_state.as_str())
        .bind(candidate.confidence)
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_verdict(&self, verdict: &ValidatedSignal) -> Result<()> {
        let body = serde_json::to_string(verdict)?;
        sqlx::query(
            r#"
            INSERT INTO verdicts (channel_id, message_id, accepted, reason, body, validated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(verdict.signal.source.channel_id)
        .bind(verdict.signal.source.message_id)
        .bind(verdict.is_accepted())
        .bind(verdict.rejection().map(|r| r.to_string()))
        .bind(body)
        .bind(verdict.validated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Intents ====================

    async fn record_intent(&self, owner: &str, intent: &TradeIntent) -> Result<()> {
        let body = serde_json::to_string(intent)?;
        sqlx::query(
            r#"
            INSERT INTO trade_intents (owner, id, symbol, status, body, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner, id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(owner)
        .bind(intent.id.to_string())
        .bind(&intent.symbol)
        .bind(intent.status().as_str())
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_intents(&self, owner: &str) -> Result<Vec<TradeIntent>> {
        let rows = sqlx::query_as::<_, StoredIntent>("SELECT * FROM trade_intents WHERE owner = ?")
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch intents")?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_str(&row.body)
                    .with_context(|| format!("Corrupt intent record {}", row.id))
            })
            .collect()
    }

    // ==================== Replication ====================

    async fn record_event(&self, event: &ReplicationEvent) -> Result<()> {
        let body = serde_json::to_string(event)?;
        sqlx::query(
            r#"
            INSERT INTO replication_events (id, intent_id, leg, kind, body, emitted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id as i64)
        .bind(event.intent_id.to_string())
        .bind(event.leg.map(i64::from))
        .bind(event.kind().to_string())
        .bind(body)
        .bind(event.emitted_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to append event {}", event.id))?;

        Ok(())
    }

    async fn record_offset(&self, follower: &str, acked: EventId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO follower_offsets (follower, acked, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(follower) DO UPDATE SET
                acked = MAX(follower_offsets.acked, excluded.acked),
                updated_at = datetime('now')
            "#,
        )
        .bind(follower)
        .bind(acked as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_events(&self) -> Result<Vec<ReplicationEvent>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT body FROM replication_events ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch replication log")?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).context("Corrupt replication event"))
            .collect()
    }

    async fn load_offsets(&self) -> Result<Vec<(String, EventId)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT follower, acked FROM follower_offsets ORDER BY follower")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(follower, acked)| (follower, acked.max(0) as EventId))
            .collect())
    }

    // ==================== Restart state ====================

    async fn load_collecting_candidates(&self) -> Result<Vec<CandidateSignal>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT c.body FROM candidate_transitions c
            JOIN (
                SELECT channel_id, message_id, MAX(id) AS last
                FROM candidate_transitions
                GROUP BY channel_id, message_id
            ) latest ON c.id = latest.last
            WHERE c.merge_state = ?
            "#,
        )
        .bind(MergeState::Collecting.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).context("Corrupt candidate record"))
            .collect()
    }

    async fn record_daily_risk(&self, state: &DailyRiskState) -> Result<()> {
        let body = serde_json::to_string(state)?;
        sqlx::query(
            r#"
            INSERT INTO daily_risk (date, body, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(date) DO UPDATE SET
                body = excluded.body,
                updated_at = datetime('now')
            "#,
        )
        .bind(state.date.to_string())
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_daily_risk(&self, date: NaiveDate) -> Result<Option<DailyRiskState>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM daily_risk WHERE date = ?")
            .bind(date.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(body,)| serde_json::from_str(&body).context("Corrupt daily risk record"))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Direction, EventPayload, IntentId, Leg, MessageKey, ParsePass, ReplicationEvent,
    };
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn event(id: EventId) -> ReplicationEvent {
        ReplicationEvent {
            id,
            intent_id: IntentId::new(),
            leg: Some(1),
            payload: EventPayload::Cancel {
                reason: "test".to_string(),
            },
            emitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_log_is_append_only() {
        let db = db().await;
        db.record_event(&event(1)).await.unwrap();
        db.record_event(&event(2)).await.unwrap();
        assert!(db.record_event(&event(2)).await.is_err());

        let events = db.load_events().await.unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_offsets_never_move_backwards() {
        let db = db().await;
        db.record_offset("f1", 5).await.unwrap();
        db.record_offset("f1", 3).await.unwrap();
        db.record_offset("f2", 1).await.unwrap();
        assert_eq!(
            db.load_offsets().await.unwrap(),
            vec![("f1".to_string(), 5), ("f2".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_latest_collecting_candidates() {
        let db = db().await;
        let t0 = Utc.with_ymd_and_hms(2025, 4, 10, 9, 0, 0).unwrap();

        let mut done = CandidateSignal::new(MessageKey::new(1, 1), 0, ParsePass::Grammar, t0);
        db.record_candidate(&done).await.unwrap();
        done.merge_state = MergeState::Complete;
        db.record_candidate(&done).await.unwrap();

        let mut open = CandidateSignal::new(MessageKey::new(1, 2), 0, ParsePass::Heuristic, t0);
        open.symbol = Some("XAUUSD".to_string());
        db.record_candidate(&open).await.unwrap();

        let restored = db.load_collecting_candidates().await.unwrap();
        assert_eq!(restored, vec![open]);
    }

    #[tokio::test]
    async fn test_intent_upsert_per_owner() {
        let db = db().await;
        let mut intent = TradeIntent {
            id: IntentId::new(),
            source: Some(MessageKey::new(1, 1)),
            symbol: "XAUUSD".to_string(),
            direction: Direction::Long,
            entry: dec!(3232),
            stop: dec!(3220),
            risk_fraction: dec!(0.0025),
            total_volume: dec!(2.08),
            value_per_unit_move: dec!(1),
            legs: vec![Leg::new(1, dec!(3235), dec!(2.08), dec!(3220))],
            breakeven_applied: false,
            modifications: Vec::new(),
            created_at: Utc::now(),
        };
        db.record_intent(PRIMARY, &intent).await.unwrap();
        intent.breakeven_applied = true;
        db.record_intent(PRIMARY, &intent).await.unwrap();
        db.record_intent("follower-1", &intent).await.unwrap();

        let stored = db.load_intents(PRIMARY).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].breakeven_applied);
        let rows = db.intent_rows().await.unwrap();
        let owners: Vec<&str> = rows.iter().map(|r| r.owner.as_str()).collect();
        assert_eq!(owners, vec!["follower-1", PRIMARY]);
        assert!(rows.iter().all(|r| r.status == "pending"));
    }

    #[tokio::test]
    async fn test_daily_risk_roundtrip() {
        let db = db().await;
        let date = NaiveDate::from_ymd_opt(2025, 4, 10).unwrap();
        assert!(db.load_daily_risk(date).await.unwrap().is_none());

        let mut state = DailyRiskState::new(date);
        state.record_leg_result(dec!(-25));
        db.record_daily_risk(&state).await.unwrap();
        assert_eq!(db.load_daily_risk(date).await.unwrap(), Some(state));
    }
}
