/// Schema for the gateway database.
pub const SCHEMA: &str = r#"
-- One row per cache generation (version token)
CREATE TABLE IF NOT EXISTS cache_generations (
    version TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, keyed by request identity within a generation
CREATE TABLE IF NOT EXISTS cache_entries (
    version TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (version, request_key),
    FOREIGN KEY (version) REFERENCES cache_generations(version) ON DELETE CASCADE
);

-- Submissions waiting for delivery
CREATE TABLE IF NOT EXISTS queued_submissions (
    id TEXT PRIMARY KEY,
    target_url TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL
);
"#;
