//! SQLite storage adapter.
//!
//! One WAL-mode connection behind a mutex: event-log writes are thereby
//! serialized globally (monotone sequence numbers) and multi-row writes
//! (match + ratings) commit as single transactions. All reads are
//! bounded.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::schema::{self, Migration};
use crate::debate::state::{DebateMessage, DebateRecord, DebateState};
use crate::events::{DebateEvent, EventJournal, EventSeq};
use crate::ranking::{
    AgentRating, ConsistencyCounts, Flip, FlipKind, MatchRecord, Position, PositionOutcome,
    RankingStore,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("duplicate slug: {0}")]
    DuplicateSlug(String),
    #[error("duplicate message for ({debate_id}, round {round}, {agent}, {role})")]
    DuplicateMessage {
        debate_id: String,
        round: u32,
        agent: String,
        role: String,
    },
    #[error("debate {0} already sealed with a different artifact")]
    SealConflict(String),
    #[error("unknown debate: {0}")]
    UnknownDebate(String),
    #[error("schema module {module} at version {found} is newer than supported {supported}")]
    SchemaTooNew {
        module: String,
        found: i64,
        supported: i64,
    },
    #[error("schema module {module} at version {found} is older than minimum {minimum}")]
    SchemaTooOld {
        module: String,
        found: i64,
        minimum: i64,
    },
    #[error("unknown schema module: {0}")]
    UnknownModule(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to the store.
pub type SharedStore = Arc<SqliteStore>;

/// Terminal snapshot written when a debate seals.
#[derive(Debug, Clone)]
pub struct DebateSeal {
    pub rounds_used: u32,
    pub consensus_reached: bool,
    pub confidence: Option<f64>,
    pub final_artifact: Option<serde_json::Value>,
    pub state: DebateState,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> StoreResult<T> {
    serde_json::from_str(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SqliteStore {
    /// Open (creating if needed) and migrate every schema module.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate_all()?;
        Ok(store)
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Liveness probe.
    pub fn health(&self) -> bool {
        self.lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    // =====================================================================
    // Schema versioning
    // =====================================================================

    fn migrate_all(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_versions (
               module TEXT PRIMARY KEY,
               version INTEGER NOT NULL,
               migrated_at TEXT NOT NULL
             )",
            [],
        )?;
        for module in schema::MODULES {
            let migrations = schema::migrations_for(module)
                .ok_or_else(|| StoreError::UnknownModule(module.to_string()))?;
            Self::migrate_module(&conn, module, migrations)?;
        }
        Ok(())
    }

    fn migrate_module(
        conn: &Connection,
        module: &str,
        migrations: &[Migration],
    ) -> StoreResult<()> {
        let latest = migrations.last().map(|m| m.version).unwrap_or(0);
        let current: i64 = conn
            .query_row(
                "SELECT version FROM schema_versions WHERE module = ?1",
                params![module],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if current > latest {
            return Err(StoreError::SchemaTooNew {
                module: module.to_string(),
                found: current,
                supported: latest,
            });
        }
        if current > 0 && current < schema::MIN_SUPPORTED {
            return Err(StoreError::SchemaTooOld {
                module: module.to_string(),
                found: current,
                minimum: schema::MIN_SUPPORTED,
            });
        }

        for migration in migrations.iter().filter(|m| m.version > current) {
            conn.execute_batch(migration.sql)?;
            conn.execute(
                "INSERT INTO schema_versions (module, version, migrated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(module) DO UPDATE SET version = ?2, migrated_at = ?3",
                params![module, migration.version, now_str()],
            )?;
            info!(module, version = migration.version, "schema migrated");
        }
        Ok(())
    }

    /// Current version of a schema module.
    pub fn schema_version(&self, module: &str) -> StoreResult<i64> {
        if schema::migrations_for(module).is_none() {
            return Err(StoreError::UnknownModule(module.to_string()));
        }
        let version = self
            .lock()
            .query_row(
                "SELECT version FROM schema_versions WHERE module = ?1",
                params![module],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(version)
    }

    // =====================================================================
    // Event log
    // =====================================================================

    /// Durably append an event, assigning the next per-debate sequence
    /// number. The connection mutex serializes assignment globally.
    pub fn append_event(&self, event: &DebateEvent) -> StoreResult<EventSeq> {
        let conn = self.lock();
        let scope = event.debate_id.clone().unwrap_or_default();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM events
             WHERE COALESCE(debate_id, '') = ?1",
            params![scope],
            |row| row.get(0),
        )?;
        let mut stamped = event.clone();
        stamped.seq = seq as EventSeq;
        conn.execute(
            "INSERT INTO events (debate_id, seq, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.debate_id,
                seq,
                event.type_name(),
                to_json(&stamped)?,
                stamped.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(seq as EventSeq)
    }

    /// Events for a debate with sequence greater than `cursor`, oldest
    /// first, bounded by `limit`.
    pub fn events_after(
        &self,
        debate_id: &str,
        cursor: EventSeq,
        limit: u32,
    ) -> StoreResult<Vec<DebateEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT payload FROM events
             WHERE debate_id = ?1 AND seq > ?2
             ORDER BY seq ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![debate_id, cursor as i64, limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut events = Vec::new();
        for payload in rows {
            events.push(from_json(&payload?)?);
        }
        Ok(events)
    }

    /// Whether an event with this sequence is durably stored.
    pub fn event_exists(&self, debate_id: &str, seq: EventSeq) -> StoreResult<bool> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM events WHERE debate_id = ?1 AND seq = ?2",
            params![debate_id, seq as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // =====================================================================
    // Debates
    // =====================================================================

    pub fn create_debate(&self, record: &DebateRecord) -> StoreResult<()> {
        let result = self.lock().execute(
            "INSERT INTO debates
               (debate_id, slug, task, agents, rounds_planned, rounds_used,
                consensus_reached, confidence, final_artifact, state, created_at, sealed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.debate_id,
                record.slug,
                record.task,
                to_json(&record.agents)?,
                record.rounds_planned,
                record.rounds_used,
                record.consensus_reached as i64,
                record.confidence,
                record
                    .final_artifact
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                record.state.to_string(),
                record.created_at.to_rfc3339(),
                record.sealed_at.map(|t| t.to_rfc3339()),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateSlug(record.slug.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Durable mid-debate progress so canceled debates read back at the
    /// round they reached.
    pub fn update_progress(
        &self,
        debate_id: &str,
        rounds_used: u32,
        state: DebateState,
    ) -> StoreResult<()> {
        let changed = self.lock().execute(
            "UPDATE debates SET rounds_used = ?2, state = ?3
             WHERE debate_id = ?1 AND sealed_at IS NULL",
            params![debate_id, rounds_used, state.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownDebate(debate_id.to_string()));
        }
        Ok(())
    }

    /// Seal a debate. Idempotent: a second seal with the same artifact
    /// is a no-op; a different artifact is rejected.
    pub fn seal_debate(&self, debate_id: &str, seal: &DebateSeal) -> StoreResult<()> {
        let conn = self.lock();
        let existing: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT final_artifact, sealed_at FROM debates WHERE debate_id = ?1",
                params![debate_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stored_artifact, sealed_at)) = existing else {
            return Err(StoreError::UnknownDebate(debate_id.to_string()));
        };

        let new_artifact = seal.final_artifact.as_ref().map(to_json).transpose()?;
        if sealed_at.is_some() {
            if stored_artifact == new_artifact {
                return Ok(());
            }
            return Err(StoreError::SealConflict(debate_id.to_string()));
        }

        conn.execute(
            "UPDATE debates SET rounds_used = ?2, consensus_reached = ?3,
               confidence = ?4, final_artifact = ?5, state = ?6, sealed_at = ?7
             WHERE debate_id = ?1",
            params![
                debate_id,
                seal.rounds_used,
                seal.consensus_reached as i64,
                seal.confidence,
                new_artifact,
                seal.state.to_string(),
                now_str(),
            ],
        )?;
        Ok(())
    }

    fn row_to_debate(row: &rusqlite::Row<'_>) -> rusqlite::Result<DebateRecord> {
        let agents: String = row.get(3)?;
        let artifact: Option<String> = row.get(8)?;
        let state: String = row.get(9)?;
        let created: String = row.get(10)?;
        let sealed: Option<String> = row.get(11)?;
        Ok(DebateRecord {
            debate_id: row.get(0)?,
            slug: row.get(1)?,
            task: row.get(2)?,
            agents: serde_json::from_str(&agents).unwrap_or_default(),
            rounds_planned: row.get(4)?,
            rounds_used: row.get(5)?,
            consensus_reached: row.get::<_, i64>(6)? != 0,
            confidence: row.get(7)?,
            final_artifact: artifact.and_then(|a| serde_json::from_str(&a).ok()),
            state: serde_json::from_str(&format!("\"{state}\""))
                .unwrap_or(DebateState::Created),
            created_at: parse_ts(&created),
            sealed_at: sealed.map(|s| parse_ts(&s)),
        })
    }

    const DEBATE_COLUMNS: &'static str = "debate_id, slug, task, agents, rounds_planned, \
         rounds_used, consensus_reached, confidence, final_artifact, state, created_at, sealed_at";

    pub fn get_debate_by_slug(&self, slug: &str) -> StoreResult<Option<DebateRecord>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM debates WHERE slug = ?1 OR debate_id = ?1",
            Self::DEBATE_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![slug], Self::row_to_debate)
            .optional()?)
    }

    /// Recent debates, newest first, with an opaque rowid cursor.
    pub fn list_debates(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> StoreResult<(Vec<DebateRecord>, Option<i64>)> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {}, id FROM debates WHERE id < ?1 ORDER BY id DESC LIMIT ?2",
            Self::DEBATE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![before.unwrap_or(i64::MAX), limit], |row| {
            Ok((Self::row_to_debate(row)?, row.get::<_, i64>(12)?))
        })?;
        let mut debates = Vec::new();
        let mut last_id = None;
        for row in rows {
            let (debate, id) = row?;
            debates.push(debate);
            last_id = Some(id);
        }
        let next = (debates.len() as u32 == limit).then_some(last_id).flatten();
        Ok((debates, next))
    }

    // =====================================================================
    // Messages
    // =====================================================================

    pub fn append_message(&self, message: &DebateMessage) -> StoreResult<()> {
        let result = self.lock().execute(
            "INSERT INTO messages
               (debate_id, round, agent, role, content, confidence, citations, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.debate_id,
                message.round,
                message.agent,
                message.role,
                message.content,
                message.confidence,
                to_json(&message.citations)?,
                message.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateMessage {
                debate_id: message.debate_id.clone(),
                round: message.round,
                agent: message.agent.clone(),
                role: message.role.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn messages_for(&self, debate_id: &str) -> StoreResult<Vec<DebateMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT debate_id, round, agent, role, content, confidence, citations, created_at
             FROM messages WHERE debate_id = ?1 ORDER BY round ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![debate_id], |row| {
            let citations: String = row.get(6)?;
            let created: String = row.get(7)?;
            Ok(DebateMessage {
                debate_id: row.get(0)?,
                round: row.get(1)?,
                agent: row.get(2)?,
                role: row.get(3)?,
                content: row.get(4)?,
                confidence: row.get(5)?,
                citations: serde_json::from_str(&citations).unwrap_or_default(),
                created_at: parse_ts(&created),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // =====================================================================
    // Ranking reads
    // =====================================================================

    pub fn leaderboard(
        &self,
        domain: Option<&str>,
        limit: u32,
    ) -> StoreResult<Vec<AgentRating>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT agent, domain, elo, wins, losses, draws, consistency, updated_at
             FROM ratings
             WHERE (?1 IS NULL OR domain = ?1)
             ORDER BY elo DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![domain, limit], Self::row_to_rating)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn row_to_rating(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRating> {
        let updated: String = row.get(7)?;
        Ok(AgentRating {
            agent: row.get(0)?,
            domain: row.get(1)?,
            elo: row.get(2)?,
            wins: row.get(3)?,
            losses: row.get(4)?,
            draws: row.get(5)?,
            consistency: row.get(6)?,
            updated_at: parse_ts(&updated),
        })
    }

    pub fn recent_matches(&self, limit: u32) -> StoreResult<Vec<MatchRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT match_id, debate_id, domain, participants, winner, elo_changes, created_at
             FROM matches ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let participants: String = row.get(3)?;
            let changes: String = row.get(5)?;
            let created: String = row.get(6)?;
            Ok(MatchRecord {
                match_id: row.get(0)?,
                debate_id: row.get(1)?,
                domain: row.get(2)?,
                participants: serde_json::from_str(&participants).unwrap_or_default(),
                winner: row.get(4)?,
                elo_changes: serde_json::from_str(&changes).unwrap_or_default(),
                created_at: parse_ts(&created),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn recent_flips(&self, limit: u32) -> StoreResult<Vec<Flip>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT agent, original_position_id, new_position_id, similarity, kind, domain,
                    created_at
             FROM flips ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let kind: String = row.get(4)?;
            let created: String = row.get(6)?;
            Ok(Flip {
                agent: row.get(0)?,
                original_position_id: row.get(1)?,
                new_position_id: row.get(2)?,
                similarity: row.get(3)?,
                kind: FlipKind::parse(&kind).unwrap_or(FlipKind::Qualification),
                domain: row.get(5)?,
                created_at: parse_ts(&created),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

impl EventJournal for SqliteStore {
    fn append(&self, event: &DebateEvent) -> Result<EventSeq, String> {
        self.append_event(event).map_err(|e| e.to_string())
    }
}

impl RankingStore for SqliteStore {
    fn get_rating(&self, agent: &str, domain: &str) -> Result<Option<AgentRating>, String> {
        let conn = self.lock();
        conn.query_row(
            "SELECT agent, domain, elo, wins, losses, draws, consistency, updated_at
             FROM ratings WHERE agent = ?1 AND domain = ?2",
            params![agent, domain],
            Self::row_to_rating,
        )
        .optional()
        .map_err(|e| e.to_string())
    }

    fn record_match(&self, record: &MatchRecord, ratings: &[AgentRating]) -> Result<(), String> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(|e| e.to_string())?;
        tx.execute(
            "INSERT INTO matches
               (match_id, debate_id, domain, participants, winner, elo_changes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.match_id,
                record.debate_id,
                record.domain,
                serde_json::to_string(&record.participants).map_err(|e| e.to_string())?,
                record.winner,
                serde_json::to_string(&record.elo_changes).map_err(|e| e.to_string())?,
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| e.to_string())?;
        for rating in ratings {
            tx.execute(
                "INSERT INTO ratings
                   (agent, domain, elo, wins, losses, draws, consistency, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(agent, domain) DO UPDATE SET
                   elo = ?3, wins = ?4, losses = ?5, draws = ?6,
                   consistency = ?7, updated_at = ?8",
                params![
                    rating.agent,
                    rating.domain,
                    rating.elo,
                    rating.wins,
                    rating.losses,
                    rating.draws,
                    rating.consistency,
                    rating.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        }
        tx.commit().map_err(|e| e.to_string())
    }

    fn insert_position(&self, position: &Position) -> Result<i64, String> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO positions
               (agent, claim, confidence, domain, debate_id, round, outcome, embedding,
                created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                position.agent,
                position.claim,
                position.confidence,
                position.domain,
                position.debate_id,
                position.round,
                position.outcome.as_str(),
                serde_json::to_string(&position.embedding).map_err(|e| e.to_string())?,
                position.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(conn.last_insert_rowid())
    }

    fn recent_positions(
        &self,
        agent: &str,
        domain: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Position>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, agent, claim, confidence, domain, debate_id, round, outcome,
                        embedding, created_at
                 FROM positions
                 WHERE agent = ?1 AND (?2 IS NULL OR domain = ?2)
                 ORDER BY id DESC LIMIT ?3",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![agent, domain, limit], |row| {
                let outcome: String = row.get(7)?;
                let embedding: String = row.get(8)?;
                let created: String = row.get(9)?;
                Ok(Position {
                    id: Some(row.get(0)?),
                    agent: row.get(1)?,
                    claim: row.get(2)?,
                    confidence: row.get(3)?,
                    domain: row.get(4)?,
                    debate_id: row.get(5)?,
                    round: row.get(6)?,
                    outcome: PositionOutcome::parse(&outcome),
                    embedding: serde_json::from_str(&embedding).unwrap_or_default(),
                    created_at: parse_ts(&created),
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| e.to_string())
    }

    fn insert_flip(&self, flip: &Flip) -> Result<(), String> {
        self.lock()
            .execute(
                "INSERT INTO flips
                   (agent, original_position_id, new_position_id, similarity, kind, domain,
                    created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    flip.agent,
                    flip.original_position_id,
                    flip.new_position_id,
                    flip.similarity,
                    flip.kind.as_str(),
                    flip.domain,
                    flip.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn consistency_counts(&self, agent: &str) -> Result<ConsistencyCounts, String> {
        let conn = self.lock();
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM positions WHERE agent = ?1",
                params![agent],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        let mut counts = ConsistencyCounts {
            total_positions: total as u32,
            ..Default::default()
        };
        let mut stmt = conn
            .prepare("SELECT kind, COUNT(*) FROM flips WHERE agent = ?1 GROUP BY kind")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![agent], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| e.to_string())?;
        for row in rows {
            let (kind, count) = row.map_err(|e| e.to_string())?;
            match FlipKind::parse(&kind) {
                Some(FlipKind::Contradiction) => counts.contradictions = count as u32,
                Some(FlipKind::Retraction) => counts.retractions = count as u32,
                Some(FlipKind::Qualification) => counts.qualifications = count as u32,
                _ => {}
            }
        }
        Ok(counts)
    }
}
