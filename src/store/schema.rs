//! Versioned schemas for the three storage modules.
//!
//! Modules are migrated independently and linearly: `core` (debates,
//! messages, event log), `agents` (ratings, matches), and `memory`
//! (positions, flips). The engine refuses to open a database whose
//! recorded version is newer than it understands or older than the
//! minimum it still supports.

/// One forward-only migration step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

/// Module names, migration order.
pub const MODULES: &[&str] = &["core", "agents", "memory"];

/// Oldest on-disk version each module can be upgraded from.
pub const MIN_SUPPORTED: i64 = 1;

pub const CORE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r"
CREATE TABLE IF NOT EXISTS debates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  debate_id TEXT NOT NULL UNIQUE,
  slug TEXT NOT NULL UNIQUE,
  task TEXT NOT NULL,
  agents TEXT NOT NULL,
  rounds_planned INTEGER NOT NULL,
  rounds_used INTEGER NOT NULL DEFAULT 0,
  consensus_reached INTEGER NOT NULL DEFAULT 0 CHECK (consensus_reached IN (0, 1)),
  confidence REAL CHECK (confidence BETWEEN 0.0 AND 1.0 OR confidence IS NULL),
  final_artifact TEXT,
  state TEXT NOT NULL,
  created_at TEXT NOT NULL,
  sealed_at TEXT
);

CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  debate_id TEXT NOT NULL,
  round INTEGER NOT NULL CHECK (round >= 1),
  agent TEXT NOT NULL,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  confidence REAL,
  citations TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  UNIQUE (debate_id, round, agent, role)
);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  debate_id TEXT,
  seq INTEGER NOT NULL,
  event_type TEXT NOT NULL,
  payload TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_events_no_update
BEFORE UPDATE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_messages_no_update
BEFORE UPDATE ON messages
BEGIN
  SELECT RAISE(FAIL, 'messages is append-only');
END;
",
    },
    Migration {
        version: 2,
        sql: r"
CREATE INDEX IF NOT EXISTS idx_events_debate_seq ON events(debate_id, seq);
CREATE INDEX IF NOT EXISTS idx_messages_debate_round ON messages(debate_id, round);
CREATE INDEX IF NOT EXISTS idx_debates_created ON debates(created_at DESC);
",
    },
];

pub const AGENTS_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r"
CREATE TABLE IF NOT EXISTS ratings (
  agent TEXT NOT NULL,
  domain TEXT NOT NULL,
  elo REAL NOT NULL,
  wins INTEGER NOT NULL DEFAULT 0,
  losses INTEGER NOT NULL DEFAULT 0,
  draws INTEGER NOT NULL DEFAULT 0,
  consistency REAL NOT NULL DEFAULT 1.0 CHECK (consistency BETWEEN 0.0 AND 1.0),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (agent, domain)
);

CREATE TABLE IF NOT EXISTS matches (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  match_id TEXT NOT NULL UNIQUE,
  debate_id TEXT NOT NULL,
  domain TEXT NOT NULL,
  participants TEXT NOT NULL,
  winner TEXT,
  elo_changes TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_matches_created ON matches(created_at DESC);
",
}];

pub const MEMORY_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r"
CREATE TABLE IF NOT EXISTS positions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  agent TEXT NOT NULL,
  claim TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  domain TEXT NOT NULL,
  debate_id TEXT NOT NULL,
  round INTEGER NOT NULL,
  outcome TEXT NOT NULL DEFAULT 'pending'
    CHECK (outcome IN ('pending', 'correct', 'incorrect', 'unknown')),
  embedding TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flips (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  agent TEXT NOT NULL,
  original_position_id INTEGER NOT NULL,
  new_position_id INTEGER NOT NULL CHECK (new_position_id > original_position_id),
  similarity REAL NOT NULL CHECK (similarity BETWEEN 0.0 AND 1.0),
  kind TEXT NOT NULL
    CHECK (kind IN ('contradiction', 'retraction', 'qualification', 'refinement')),
  domain TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_positions_agent_domain ON positions(agent, domain, id DESC);
CREATE INDEX IF NOT EXISTS idx_flips_agent ON flips(agent, created_at DESC);
",
}];

/// Migration list for a module.
pub fn migrations_for(module: &str) -> Option<&'static [Migration]> {
    match module {
        "core" => Some(CORE_MIGRATIONS),
        "agents" => Some(AGENTS_MIGRATIONS),
        "memory" => Some(MEMORY_MIGRATIONS),
        _ => None,
    }
}

/// Latest version this build understands for a module.
pub fn latest_version(module: &str) -> Option<i64> {
    migrations_for(module).and_then(|m| m.last().map(|s| s.version))
}
