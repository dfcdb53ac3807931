//! SQL schema for the brandspark SQLite store.
//!
//! Executed once on the first pooled connection. Future migrations will be
//! gated on `PRAGMA user_version`.

/// Pragmas applied to every connection in the pool.
pub const CONNECTION_PRAGMAS: &str = "
PRAGMA foreign_keys = ON;
";

/// Applied once for file-backed databases so readers never block the writer.
pub const FILE_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
";

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user_profiles (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- A session id is bound forever to the user that first created it.
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES user_profiles(id),
    title       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES user_profiles(id),
    session_id  TEXT NOT NULL REFERENCES sessions(id),
    prompt      TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Append-only transcript. `id` breaks ties between equal timestamps.
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL REFERENCES sessions(id),
    user_id     TEXT NOT NULL,
    role        TEXT NOT NULL CHECK (role IN ('user', 'agent')),
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- Written once per completed job; never updated.
CREATE TABLE IF NOT EXISTS reports (
    job_id      TEXT PRIMARY KEY REFERENCES jobs(id),
    user_id     TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS sessions_user_idx    ON sessions(user_id, updated_at);
CREATE INDEX IF NOT EXISTS jobs_user_idx        ON jobs(user_id);
CREATE INDEX IF NOT EXISTS jobs_status_idx      ON jobs(status);
CREATE INDEX IF NOT EXISTS messages_session_idx ON messages(session_id, created_at);

PRAGMA user_version = 1;
";
